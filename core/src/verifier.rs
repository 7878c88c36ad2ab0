//! Turns a before/after pair of snapshots plus the denial signals captured in
//! between into a tri-state verdict.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::denial::DenialSignal;
use crate::transport::Snapshot;

type SnapshotPredicate = dyn Fn(&Snapshot, &Snapshot) -> bool + Send + Sync;

/// Action-specific rule for "did the intended change happen".
#[derive(Clone)]
pub enum Expectation {
    /// A block whose identity contains `block` is now present where it was not
    BlockAppears { block: String },
    /// Something was there and it is gone or different now
    BlockRemoved,
    /// The visible text now matches `lines` (trimmed, case-sensitive)
    TextMatches { lines: Vec<String> },
    /// `key` is now set (to `value` when given) and differs from before
    AttributeSet { key: String, value: Option<String> },
    AnyChange,
    Custom(Arc<SnapshotPredicate>),
}

impl fmt::Debug for Expectation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expectation::BlockAppears { block } => {
                f.debug_struct("BlockAppears").field("block", block).finish()
            }
            Expectation::BlockRemoved => f.write_str("BlockRemoved"),
            Expectation::TextMatches { lines } => {
                f.debug_struct("TextMatches").field("lines", lines).finish()
            }
            Expectation::AttributeSet { key, value } => f
                .debug_struct("AttributeSet")
                .field("key", key)
                .field("value", value)
                .finish(),
            Expectation::AnyChange => f.write_str("AnyChange"),
            Expectation::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl Expectation {
    pub fn custom(
        predicate: impl Fn(&Snapshot, &Snapshot) -> bool + Send + Sync + 'static,
    ) -> Self {
        Expectation::Custom(Arc::new(predicate))
    }

    pub fn is_met(&self, before: &Snapshot, after: &Snapshot) -> bool {
        match self {
            Expectation::BlockAppears { block } => {
                let has_block = |snapshot: &Snapshot| {
                    snapshot
                        .kind
                        .as_deref()
                        .is_some_and(|kind| kind.contains(block.as_str()))
                };
                has_block(after) && (!has_block(before) || before.kind != after.kind)
            }
            Expectation::BlockRemoved => before.kind.is_some() && before.kind != after.kind,
            Expectation::TextMatches { lines } => {
                let trimmed = |text: &[String]| -> Vec<String> {
                    let mut out: Vec<String> =
                        text.iter().map(|line| line.trim().to_string()).collect();
                    while out.last().is_some_and(|line| line.is_empty()) {
                        out.pop();
                    }
                    out
                };
                let wanted = trimmed(lines);
                trimmed(&after.text) == wanted && trimmed(&before.text) != wanted
            }
            Expectation::AttributeSet { key, value } => {
                let Some(now) = after.attributes.get(key) else {
                    return false;
                };
                let matches_value = value.as_deref().is_none_or(|wanted| wanted == now);
                matches_value && before.attributes.get(key) != Some(now)
            }
            Expectation::AnyChange => before != after,
            Expectation::Custom(predicate) => predicate(before, after),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Succeeded,
    Denied { reason: String },
    FailedUnknown { reason: String },
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Succeeded => "succeeded",
            Verdict::Denied { .. } => "denied",
            Verdict::FailedUnknown { .. } => "failed_unknown",
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Verdict::Succeeded => None,
            Verdict::Denied { reason } | Verdict::FailedUnknown { reason } => Some(reason),
        }
    }
}

/// The observed change wins over any captured denial: a denial that arrives
/// while the change is visible belongs to something else.
pub fn verify(
    before: &Snapshot,
    after: &Snapshot,
    expectation: &Expectation,
    denials: &[DenialSignal],
) -> Verdict {
    if expectation.is_met(before, after) {
        return Verdict::Succeeded;
    }
    match denials.first() {
        Some(denial) => Verdict::Denied {
            reason: denial.text.clone(),
        },
        None => Verdict::FailedUnknown {
            reason: "no observable change and no denial message; the server may have rejected the action silently".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::denial::DenialCategory;

    fn denial(text: &str) -> DenialSignal {
        DenialSignal {
            text: text.to_string(),
            category: DenialCategory::PermissionDenied,
        }
    }

    #[test]
    fn change_observed_is_success_even_with_denials() {
        let before = Snapshot::default();
        let after = Snapshot::of_kind("oak_planks");
        let expectation = Expectation::BlockAppears {
            block: "oak_planks".to_string(),
        };
        let verdict = verify(&before, &after, &expectation, &[denial("no permission")]);
        assert_eq!(verdict, Verdict::Succeeded);
    }

    #[test]
    fn no_change_with_denial_is_denied_with_first_text() {
        let snapshot = Snapshot::of_kind("stone");
        let verdict = verify(
            &snapshot,
            &snapshot,
            &Expectation::BlockRemoved,
            &[denial("That belongs to Alice"), denial("second")],
        );
        assert_eq!(
            verdict,
            Verdict::Denied {
                reason: "That belongs to Alice".to_string()
            }
        );
    }

    #[test]
    fn no_change_without_denial_is_failed_unknown() {
        let snapshot = Snapshot::default();
        let verdict = verify(&snapshot, &snapshot, &Expectation::AnyChange, &[]);
        assert_eq!(verdict.as_str(), "failed_unknown");
        assert!(verdict.reason().is_some());
    }

    #[test]
    fn block_appears_matches_by_substring() {
        let expectation = Expectation::BlockAppears {
            block: "sign".to_string(),
        };
        assert!(expectation.is_met(&Snapshot::default(), &Snapshot::of_kind("oak_wall_sign")));
        let sign = Snapshot::of_kind("oak_sign");
        assert!(!expectation.is_met(&sign, &sign));
    }

    #[test]
    fn block_removed_requires_something_before() {
        assert!(Expectation::BlockRemoved.is_met(&Snapshot::of_kind("dirt"), &Snapshot::default()));
        assert!(!Expectation::BlockRemoved.is_met(&Snapshot::default(), &Snapshot::default()));
    }

    #[test]
    fn text_matches_ignores_padding_and_trailing_blank_lines() {
        let expectation = Expectation::TextMatches {
            lines: vec!["[Shop]".to_string(), "Diamonds".to_string()],
        };
        let before = Snapshot::of_kind("oak_sign");
        let after = Snapshot::of_kind("oak_sign").with_text(&[" [Shop] ", "Diamonds", "", ""]);
        assert!(expectation.is_met(&before, &after));
        assert!(!expectation.is_met(&after, &after));
    }

    #[test]
    fn attribute_set_checks_value_and_transition() {
        let expectation = Expectation::AttributeSet {
            key: "vehicle".to_string(),
            value: Some("42".to_string()),
        };
        let riding = Snapshot::default().with_attribute("vehicle", "42");
        assert!(expectation.is_met(&Snapshot::default(), &riding));
        assert!(!expectation.is_met(&riding, &riding));
        assert!(!expectation.is_met(
            &Snapshot::default(),
            &Snapshot::default().with_attribute("vehicle", "7")
        ));
    }

    #[test]
    fn custom_predicate_is_used_verbatim() {
        let expectation = Expectation::custom(|_, after| after.text.len() == 1);
        assert!(expectation.is_met(&Snapshot::default(), &Snapshot::default().with_text(&["x"])));
        assert_eq!(format!("{expectation:?}"), "Custom(..)");
    }
}
