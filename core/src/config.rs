use std::time::Duration;

const CONNECT_TIMEOUT_MS: u64 = 30_000;
const RECONNECT_BASE_MS: u64 = 2_000;
const RECONNECT_CAP_MS: u64 = 300_000;
const RECONNECT_MAX_ATTEMPTS: u32 = 10;
const CHAT_LOG_CAPACITY: u64 = 100;
const SETTLE_DELAY_MS: u64 = 300;
const ACTION_TIMEOUT_MS: u64 = 10_000;
const CLAIM_WINDOW_MS: u64 = 1_500;
const CLAIM_COMMAND: &str = "/claiminfo";
const SIGN_SUPPRESSION_MS: u64 = 500;
const CHAT_DEDUPE_WINDOW_MS: u64 = 1_000;
const SIGN_LINE_MAX_CHARS: usize = 32;

const CONNECT_TIMEOUT_ENV: &str = "TETHER_CONNECT_TIMEOUT_MS";
const RECONNECT_BASE_ENV: &str = "TETHER_RECONNECT_BASE_MS";
const RECONNECT_CAP_ENV: &str = "TETHER_RECONNECT_CAP_MS";
const RECONNECT_MAX_ATTEMPTS_ENV: &str = "TETHER_RECONNECT_MAX_ATTEMPTS";
const CHAT_LOG_CAPACITY_ENV: &str = "TETHER_CHAT_LOG_CAPACITY";
const SETTLE_DELAY_ENV: &str = "TETHER_SETTLE_DELAY_MS";
const ACTION_TIMEOUT_ENV: &str = "TETHER_ACTION_TIMEOUT_MS";
const CLAIM_WINDOW_ENV: &str = "TETHER_CLAIM_WINDOW_MS";
const CLAIM_COMMAND_ENV: &str = "TETHER_CLAIM_COMMAND";
const CLAIM_LOOKUP_ENV: &str = "TETHER_CLAIM_LOOKUP";

/// Exponential reconnect schedule: attempt `n` (1-indexed) waits
/// `min(base * 2^(n-1), cap)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl BackoffPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1_u32 << exponent;
        self.base
            .checked_mul(factor)
            .map_or(self.cap, |delay| delay.min(self.cap))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(RECONNECT_BASE_MS),
            cap: Duration::from_millis(RECONNECT_CAP_MS),
            max_attempts: RECONNECT_MAX_ATTEMPTS,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClassifierConfig {
    /// How long after a sign-placement notice indented lines count as sign text
    pub sign_suppression_window: Duration,
    /// Window in which a rewritten informational line and a chat event are the same utterance
    pub dedupe_window: Duration,
    pub sign_line_max_chars: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            sign_suppression_window: Duration::from_millis(SIGN_SUPPRESSION_MS),
            dedupe_window: Duration::from_millis(CHAT_DEDUPE_WINDOW_MS),
            sign_line_max_chars: SIGN_LINE_MAX_CHARS,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClaimLookupConfig {
    pub enabled: bool,
    pub command: String,
    pub window: Duration,
}

impl Default for ClaimLookupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            command: CLAIM_COMMAND.to_string(),
            window: Duration::from_millis(CLAIM_WINDOW_MS),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    pub connect_timeout: Duration,
    pub reconnect: BackoffPolicy,
    pub chat_log_capacity: usize,
    pub settle_delay: Duration,
    pub action_timeout: Duration,
    pub claim: ClaimLookupConfig,
    pub classifier: ClassifierConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(CONNECT_TIMEOUT_MS),
            reconnect: BackoffPolicy::default(),
            chat_log_capacity: CHAT_LOG_CAPACITY as usize,
            settle_delay: Duration::from_millis(SETTLE_DELAY_MS),
            action_timeout: Duration::from_millis(ACTION_TIMEOUT_MS),
            claim: ClaimLookupConfig::default(),
            classifier: ClassifierConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup. Unparseable values fall
    /// back to the default; parseable ones are clamped into range.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let millis = |key: &str, min: u64, max: u64, default: Duration| {
            Duration::from_millis(parse_u64_with_bounds(
                lookup(key),
                min,
                max,
                default.as_millis() as u64,
            ))
        };

        let reconnect = BackoffPolicy {
            base: millis(RECONNECT_BASE_ENV, 100, 60_000, defaults.reconnect.base),
            cap: millis(RECONNECT_CAP_ENV, 1_000, 3_600_000, defaults.reconnect.cap),
            max_attempts: parse_u64_with_bounds(
                lookup(RECONNECT_MAX_ATTEMPTS_ENV),
                0,
                100,
                u64::from(defaults.reconnect.max_attempts),
            ) as u32,
        };

        let claim_command = lookup(CLAIM_COMMAND_ENV)
            .map(|raw| raw.trim().to_string())
            .filter(|command| !command.is_empty())
            .unwrap_or(defaults.claim.command);

        Self {
            connect_timeout: millis(CONNECT_TIMEOUT_ENV, 1_000, 300_000, defaults.connect_timeout),
            reconnect,
            chat_log_capacity: parse_u64_with_bounds(
                lookup(CHAT_LOG_CAPACITY_ENV),
                10,
                10_000,
                CHAT_LOG_CAPACITY,
            ) as usize,
            settle_delay: millis(SETTLE_DELAY_ENV, 50, 5_000, defaults.settle_delay),
            action_timeout: millis(ACTION_TIMEOUT_ENV, 500, 120_000, defaults.action_timeout),
            claim: ClaimLookupConfig {
                enabled: parse_bool_flag(lookup(CLAIM_LOOKUP_ENV), defaults.claim.enabled),
                command: claim_command,
                window: millis(CLAIM_WINDOW_ENV, 250, 10_000, defaults.claim.window),
            },
            classifier: defaults.classifier,
        }
    }
}

pub fn parse_bool_flag(raw: Option<String>, default: bool) -> bool {
    match raw {
        Some(value) => matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        None => default,
    }
}

fn parse_u64_with_bounds(raw: Option<String>, min: u64, max: u64, default: u64) -> u64 {
    match raw.and_then(|value| value.trim().parse::<u64>().ok()) {
        Some(parsed) => parsed.clamp(min, max),
        None => default,
    }
}
