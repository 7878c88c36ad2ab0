//! Permission-denial detection over free broadcast text.
//!
//! Each rule is an independent predicate over normalized text. Rules are
//! OR-ed in order; the first matching rule names the category.

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

static COLOR_CODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)§[0-9a-fk-orx]").expect("valid color code regex"));
static PERMISSION_DENIAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b(?:do not|don't|dont) have (?:the )?permissions?\b|\bno permissions?\b|\bpermission denied\b|\bnot (?:allowed|permitted) to\b|\byou (?:can't|cannot|may not) (?:build|break|place|use|open|interact|ride|mount|do that)\b",
    )
    .expect("valid permission denial regex")
});
static NEGATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:not|no|can't|cannot|don't|won't|isn't|unable|denied|lack)\b")
        .expect("valid negation regex")
});

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialCategory {
    /// "belongs to", "claimed by"
    Ownership,
    /// explicit "you don't have permission" phrasing
    PermissionDenied,
    /// "claim" next to a negation or capability-denial term
    ClaimRestriction,
}

/// A broadcast line recognized as a permission rejection. Lives only as long
/// as the capture window that observed it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DenialSignal {
    pub text: String,
    pub category: DenialCategory,
}

type DenialRule = fn(&str) -> bool;

const DENIAL_RULES: [(DenialCategory, DenialRule); 3] = [
    (DenialCategory::Ownership, mentions_ownership),
    (DenialCategory::PermissionDenied, denies_permission),
    (DenialCategory::ClaimRestriction, restricts_claim),
];

pub fn detect(raw: &str) -> Option<DenialSignal> {
    let normalized = normalize(raw);
    if normalized.is_empty() {
        return None;
    }
    DENIAL_RULES
        .iter()
        .find(|(_, rule)| rule(&normalized))
        .map(|(category, _)| DenialSignal {
            text: raw.trim().to_string(),
            category: *category,
        })
}

/// Lower-cases, strips `§` formatting codes, folds typographic apostrophes and
/// collapses whitespace.
pub fn normalize(raw: &str) -> String {
    strip_formatting(raw)
        .to_lowercase()
        .replace(['\u{2019}', '\u{2018}', '`'], "'")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Removes `§` colour and style codes, keeping case.
pub fn strip_formatting(raw: &str) -> Cow<'_, str> {
    COLOR_CODE_RE.replace_all(raw, "")
}

pub fn mentions_ownership(text: &str) -> bool {
    text.contains("belongs to") || text.contains("claimed by")
}

pub fn denies_permission(text: &str) -> bool {
    PERMISSION_DENIAL_RE.is_match(text)
}

pub fn restricts_claim(text: &str) -> bool {
    text.contains("claim") && NEGATION_RE.is_match(text)
}
