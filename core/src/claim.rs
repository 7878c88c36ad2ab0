//! Claim ownership lookup: send the configured diagnostic command, collect
//! the informational lines that follow and fold them into a [`ClaimInfo`].

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::classifier::Disposition;
use crate::denial::strip_formatting;
use crate::error::SessionError;
use crate::session::SessionManager;
use crate::subscription::{ClassifiedText, WindowEnd};
use crate::transport::{Channel, Connector, Link};

static FIELD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\W*(owner|managers?|builders?|containers?|accessors?)\s*[:=]\s*(.*)$")
        .expect("valid claim field regex")
});
static OWNER_PHRASE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:claimed by|belongs to|owned by)\s+([A-Za-z0-9_]{3,16})\b")
        .expect("valid owner phrase regex")
});
static POSSESSIVE_CLAIM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b([A-Za-z0-9_]{3,16})'s claim\b").expect("valid possessive claim regex")
});
static NO_CLAIM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\bno claim\b|\bnot (?:in|inside|standing in) (?:a |any )?claim|\b(?:unclaimed|wilderness)\b|\bis not claimed\b",
    )
    .expect("valid no-claim regex")
});
static UNKNOWN_COMMAND_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\bunknown (?:or incomplete )?command\b|\bcommand not found\b|\bno such command\b|\bis not a valid command\b",
    )
    .expect("valid unknown-command regex")
});

/// Ownership record produced fresh by one lookup. Never cached.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ClaimInfo {
    pub claimed: bool,
    pub owner: Option<String>,
    pub managers: BTreeSet<String>,
    pub builders: BTreeSet<String>,
    pub containers: BTreeSet<String>,
    pub accessors: BTreeSet<String>,
    pub raw_messages: Vec<String>,
    /// `false` when the server did not recognise the diagnostic command, in
    /// which case `claimed: false` means "unknown" rather than "unclaimed".
    pub command_supported: bool,
}

impl Default for ClaimInfo {
    fn default() -> Self {
        Self {
            claimed: false,
            owner: None,
            managers: BTreeSet::new(),
            builders: BTreeSet::new(),
            containers: BTreeSet::new(),
            accessors: BTreeSet::new(),
            raw_messages: Vec::new(),
            command_supported: true,
        }
    }
}

impl ClaimInfo {
    /// Folds command output into a record. Fields accumulate across lines.
    pub fn from_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut info = ClaimInfo::default();
        let mut saw_claim_line = false;
        let mut explicitly_unclaimed = false;

        for raw in lines {
            let line = strip_formatting(raw.as_ref()).trim().to_string();
            if line.is_empty() {
                continue;
            }
            info.raw_messages.push(line.clone());

            if UNKNOWN_COMMAND_RE.is_match(&line) {
                info.command_supported = false;
                continue;
            }
            if NO_CLAIM_RE.is_match(&line) {
                explicitly_unclaimed = true;
                continue;
            }
            if let Some(captures) = FIELD_RE.captures(&line) {
                saw_claim_line = true;
                let key = captures[1].to_ascii_lowercase();
                let value = captures[2].trim();
                if key == "owner" {
                    if !value.is_empty() {
                        info.owner = Some(value.to_string());
                    }
                    continue;
                }
                let names = split_names(value);
                let target = match key.trim_end_matches('s') {
                    "manager" => &mut info.managers,
                    "builder" => &mut info.builders,
                    "container" => &mut info.containers,
                    _ => &mut info.accessors,
                };
                target.extend(names);
                continue;
            }
            let owner = OWNER_PHRASE_RE
                .captures(&line)
                .or_else(|| POSSESSIVE_CLAIM_RE.captures(&line))
                .map(|captures| captures[1].to_string());
            if let Some(owner) = owner {
                saw_claim_line = true;
                info.owner.get_or_insert(owner);
            }
        }

        info.claimed = saw_claim_line && !explicitly_unclaimed && info.command_supported;
        info
    }
}

/// Whether `word` is one of the field names in a claim report, such as
/// `Owner` or `Builders`.
pub(crate) fn is_field_key(word: &str) -> bool {
    matches!(
        word.to_ascii_lowercase().as_str(),
        "owner" | "manager" | "managers" | "builder" | "builders" | "container" | "containers"
            | "accessor" | "accessors"
    )
}

fn split_names(value: &str) -> impl Iterator<Item = String> + '_ {
    value
        .split(|c: char| c == ',' || c == ';' || c.is_whitespace())
        .map(str::trim)
        .filter(|name| !name.is_empty() && !name.eq_ignore_ascii_case("none"))
        .map(str::to_string)
}

/// Command output arrives on the informational channel and may look like
/// `Name: value` chat to the classifier.
fn is_command_output(text: &ClassifiedText) -> bool {
    text.channel == Channel::Info
        && matches!(
            text.disposition,
            Disposition::System | Disposition::PlayerChat | Disposition::DuplicateChat
        )
}

impl<C: Connector> SessionManager<C> {
    /// Runs the configured diagnostic command once and parses what comes
    /// back within the claim window.
    pub async fn lookup_claim(&self) -> Result<ClaimInfo, SessionError> {
        let active = self.active()?;
        let command = self.config.claim.command.clone();
        let window = self.config.claim.window;

        let subscription = active.subscribe("claim_lookup");
        let window_id = subscription.id();
        active.link.send_command(&command).await?;
        debug!(%window_id, command = %command, "claim lookup sent");

        let captured = subscription.collect_until(Instant::now() + window).await;
        if captured.end == WindowEnd::Cancelled {
            return Err(SessionError::ConnectionLost(
                "session ended during claim lookup".to_string(),
            ));
        }

        let info = ClaimInfo::from_lines(
            captured
                .texts
                .iter()
                .filter(|text| is_command_output(text))
                .map(|text| text.text.as_str()),
        );
        info!(
            %window_id,
            claimed = info.claimed,
            owner = info.owner.as_deref().unwrap_or(""),
            command_supported = info.command_supported,
            lines = info.raw_messages.len(),
            "claim lookup finished"
        );
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::ChatKind;
    use crate::config::SessionConfig;
    use crate::testing::{FakeConnector, credentials};
    use std::time::Duration;

    #[test]
    fn owner_and_builders_are_parsed() {
        let info = ClaimInfo::from_lines(["Owner: Alice", "Builders: Bob, Carol"]);
        assert!(info.claimed);
        assert_eq!(info.owner.as_deref(), Some("Alice"));
        assert_eq!(
            info.builders.iter().cloned().collect::<Vec<_>>(),
            vec!["Bob".to_string(), "Carol".to_string()]
        );
        assert!(info.containers.is_empty());
        assert_eq!(info.raw_messages.len(), 2);
        assert!(info.command_supported);
    }

    #[test]
    fn fields_accumulate_across_lines_and_ignore_formatting() {
        let info = ClaimInfo::from_lines([
            "§6--- Claim info ---",
            "§eOwner§f: Alice",
            "Managers: Dave",
            "Containers: Erin; Frank",
            "Accessors: none",
            "Builders: Bob",
            "Builders: Carol",
        ]);
        assert!(info.claimed);
        assert_eq!(info.managers.len(), 1);
        assert_eq!(info.containers.len(), 2);
        assert!(info.accessors.is_empty());
        assert_eq!(info.builders.len(), 2);
        assert_eq!(info.raw_messages[0], "--- Claim info ---");
    }

    #[test]
    fn no_claim_lines_means_unclaimed() {
        let info = ClaimInfo::from_lines(["Welcome back!"]);
        assert!(!info.claimed);
        assert!(info.command_supported);

        let empty = ClaimInfo::from_lines(Vec::<String>::new());
        assert!(!empty.claimed);
    }

    #[test]
    fn explicit_no_claim_phrase_wins() {
        let info = ClaimInfo::from_lines(["There's no claim here.", "Owner: Alice"]);
        assert!(!info.claimed);
    }

    #[test]
    fn unknown_command_is_flagged() {
        let info = ClaimInfo::from_lines(["Unknown command. Type \"/help\" for help."]);
        assert!(!info.claimed);
        assert!(!info.command_supported);
    }

    #[test]
    fn ownership_phrasing_names_the_owner() {
        let info = ClaimInfo::from_lines(["That's Alice's claim."]);
        assert!(info.claimed);
        assert_eq!(info.owner.as_deref(), Some("Alice"));

        let info = ClaimInfo::from_lines(["This land is claimed by Bob"]);
        assert_eq!(info.owner.as_deref(), Some("Bob"));
    }

    #[tokio::test(start_paused = true)]
    async fn lookup_sends_the_command_and_waits_out_the_window() {
        let connector = FakeConnector::new();
        connector.reply_to("/claiminfo", &["Owner: Alice", "Builders: Bob, Carol"]);
        let manager = SessionManager::new(connector.clone(), SessionConfig::default());
        manager.connect(credentials()).await.unwrap();
        connector.push_chat("Alice", "this chat is not command output");

        let started = Instant::now();
        let info = manager.lookup_claim().await.unwrap();
        assert_eq!(started.elapsed(), Duration::from_millis(1_500));
        assert_eq!(connector.commands(), vec!["/claiminfo".to_string()]);
        assert!(info.claimed);
        assert_eq!(info.owner.as_deref(), Some("Alice"));
        assert_eq!(info.builders.len(), 2);

        let history = manager.chat_history(10);
        let reply = history
            .iter()
            .find(|entry| entry.text == "Owner: Alice")
            .expect("claim reply is logged");
        assert_eq!(reply.kind, ChatKind::System);
        assert!(history.iter().all(|entry| entry.sender.as_deref() != Some("Owner")));
    }

    #[tokio::test(start_paused = true)]
    async fn lookup_uses_the_configured_command() {
        let connector = FakeConnector::new();
        connector.reply_to("/gp claiminfo", &["Unknown command."]);
        let mut config = SessionConfig::default();
        config.claim.command = "/gp claiminfo".to_string();
        let manager = SessionManager::new(connector.clone(), config);
        manager.connect(credentials()).await.unwrap();

        let info = manager.lookup_claim().await.unwrap();
        assert!(!info.command_supported);
        assert_eq!(connector.commands(), vec!["/gp claiminfo".to_string()]);
    }

    #[tokio::test]
    async fn lookup_requires_a_live_session() {
        let manager = SessionManager::new(FakeConnector::new(), SessionConfig::default());
        assert!(matches!(
            manager.lookup_claim().await,
            Err(SessionError::NotConnected)
        ));
    }
}
