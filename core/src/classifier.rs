//! Splits the single broadcast-text stream into loggable chat, system notices
//! and noise, and flags permission denials.
//!
//! Suppression rules only decide what gets logged. Denial detection always
//! runs on the raw text, so a suppressed line can still be a denial.

use std::collections::VecDeque;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use tokio::time::Instant;

use crate::chat::ChatLogEntry;
use crate::claim;
use crate::config::ClassifierConfig;
use crate::denial::{self, DenialSignal};
use crate::transport::Channel;

static SIGN_PLACEMENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bplace[sd]\s+a\s+sign\s*@").expect("valid sign placement regex")
});
static WHISPER_ARROW_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[[^\]]*(?:->|→|»)[^\]]*\]").expect("valid whisper arrow regex")
});
static WHISPER_PHRASE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bwhispers?\s+to\b").expect("valid whisper phrase regex"));
static THIRD_PARTY_CHAT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^<?([A-Za-z0-9_]{3,16})>?:\s+(.+)$").expect("valid third-party chat regex")
});

/// What the logging pass decided for one line.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    SignPlacement,
    SignContent,
    PrivateMessage,
    DuplicateChat,
    OwnChat,
    PlayerChat,
    System,
    /// Chat-channel text; the structured chat event carries it instead
    ChatEcho,
    Blank,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Classification {
    pub disposition: Disposition,
    pub entry: Option<ChatLogEntry>,
    pub denial: Option<DenialSignal>,
}

/// Where a player utterance was seen. Dedupe only matches across sources.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Source {
    ChatEvent,
    RewrittenLine,
}

#[derive(Debug)]
struct RecentUtterance {
    source: Source,
    sender: String,
    text: String,
    at: Instant,
}

#[derive(Debug)]
pub struct MessageClassifier {
    config: ClassifierConfig,
    self_identity: Option<String>,
    sign_suppression_until: Option<Instant>,
    recent_chat: VecDeque<RecentUtterance>,
}

impl MessageClassifier {
    pub fn new(config: ClassifierConfig) -> Self {
        Self {
            config,
            self_identity: None,
            sign_suppression_until: None,
            recent_chat: VecDeque::new(),
        }
    }

    /// Clears per-session state; called whenever a new session is established.
    pub fn reset(&mut self, self_identity: Option<String>) {
        self.self_identity = self_identity;
        self.sign_suppression_until = None;
        self.recent_chat.clear();
    }

    /// Structured player chat from the chat channel.
    pub fn classify_player_chat(
        &mut self,
        sender: &str,
        text: &str,
        now: Instant,
    ) -> Classification {
        if self
            .self_identity
            .as_deref()
            .is_some_and(|me| me.eq_ignore_ascii_case(sender))
        {
            return Classification {
                disposition: Disposition::OwnChat,
                entry: None,
                denial: None,
            };
        }
        self.log_player_chat(Source::ChatEvent, sender, text, now)
    }

    /// One raw broadcast line with its channel tag.
    pub fn classify(&mut self, channel: Channel, text: &str, now: Instant) -> Classification {
        let denial = denial::detect(text);
        let disposition = self.logging_disposition(channel, text, now);

        match disposition {
            Disposition::System => Classification {
                disposition,
                entry: Some(ChatLogEntry::system(text.trim())),
                denial,
            },
            Disposition::PlayerChat => {
                let (sender, body) = split_third_party_chat(text)
                    .map(|(s, b)| (s.to_string(), b.to_string()))
                    .unwrap_or_default();
                let mut classification =
                    self.log_player_chat(Source::RewrittenLine, &sender, &body, now);
                classification.denial = denial;
                classification
            }
            _ => Classification {
                disposition,
                entry: None,
                denial,
            },
        }
    }

    fn logging_disposition(&mut self, channel: Channel, text: &str, now: Instant) -> Disposition {
        if SIGN_PLACEMENT_RE.is_match(text) {
            self.sign_suppression_until = Some(now + self.config.sign_suppression_window);
            return Disposition::SignPlacement;
        }
        if self.sign_suppression_active(now) && self.looks_like_sign_line(text) {
            return Disposition::SignContent;
        }
        if WHISPER_ARROW_RE.is_match(text) || WHISPER_PHRASE_RE.is_match(text) {
            return Disposition::PrivateMessage;
        }
        if channel == Channel::Chat {
            return Disposition::ChatEcho;
        }
        if text.trim().is_empty() {
            return Disposition::Blank;
        }
        if split_third_party_chat(text).is_some_and(|(sender, _)| !claim::is_field_key(sender)) {
            return Disposition::PlayerChat;
        }
        Disposition::System
    }

    fn sign_suppression_active(&self, now: Instant) -> bool {
        self.sign_suppression_until.is_some_and(|until| now <= until)
    }

    fn looks_like_sign_line(&self, text: &str) -> bool {
        let leading = text.chars().take_while(|c| c.is_whitespace()).count();
        leading >= 2 && text.trim().chars().count() <= self.config.sign_line_max_chars
    }

    fn log_player_chat(
        &mut self,
        source: Source,
        sender: &str,
        text: &str,
        now: Instant,
    ) -> Classification {
        let text = text.trim();
        self.prune_recent(now);
        let counterpart = self
            .recent_chat
            .iter()
            .position(|seen| seen.source != source && seen.sender == sender && seen.text == text);
        if let Some(index) = counterpart {
            // Each utterance pairs with at most one line from the other source.
            self.recent_chat.remove(index);
            return Classification {
                disposition: Disposition::DuplicateChat,
                entry: None,
                denial: None,
            };
        }
        self.recent_chat.push_back(RecentUtterance {
            source,
            sender: sender.to_string(),
            text: text.to_string(),
            at: now,
        });
        Classification {
            disposition: Disposition::PlayerChat,
            entry: Some(ChatLogEntry::player(sender, text)),
            denial: None,
        }
    }

    fn prune_recent(&mut self, now: Instant) {
        let window = self.config.dedupe_window;
        while self
            .recent_chat
            .front()
            .is_some_and(|seen| now.saturating_duration_since(seen.at) > window)
        {
            self.recent_chat.pop_front();
        }
    }
}

fn split_third_party_chat(text: &str) -> Option<(&str, &str)> {
    let captures = THIRD_PARTY_CHAT_RE.captures(text.trim())?;
    let sender = captures.get(1)?.as_str();
    let body = captures.get(2)?.as_str();
    Some((sender, body))
}
