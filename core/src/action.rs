use std::fmt;

use serde::{Deserialize, Serialize};

use crate::transport::{BlockPos, Target};
use crate::verifier::Expectation;

/// Mutating action categories that can touch third-party-owned world state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    PlaceBlock,
    BreakBlock,
    PlaceSign,
    Mount,
    OpenContainer,
    CreateShop,
    Other,
}

impl ActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::PlaceBlock => "place_block",
            ActionKind::BreakBlock => "break_block",
            ActionKind::PlaceSign => "place_sign",
            ActionKind::Mount => "mount",
            ActionKind::OpenContainer => "open_container",
            ActionKind::CreateShop => "create_shop",
            ActionKind::Other => "other",
        }
    }

    /// Whether the permission layer is known to reject this kind without
    /// sending any broadcast text (the block just never changes).
    pub fn rejects_silently(self) -> bool {
        matches!(self, ActionKind::PlaceBlock | ActionKind::BreakBlock)
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A simulation mutation the link knows how to perform.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WorldAction {
    PlaceBlock { position: BlockPos, block: String },
    BreakBlock { position: BlockPos },
    PlaceSign { position: BlockPos, lines: Vec<String> },
    Mount { entity: u64 },
    OpenContainer { position: BlockPos },
    /// Shop signs are rewritten by the shop plugin, so only "something
    /// changed" is checked.
    CreateShop { position: BlockPos, lines: Vec<String> },
}

impl WorldAction {
    pub fn kind(&self) -> ActionKind {
        match self {
            WorldAction::PlaceBlock { .. } => ActionKind::PlaceBlock,
            WorldAction::BreakBlock { .. } => ActionKind::BreakBlock,
            WorldAction::PlaceSign { .. } => ActionKind::PlaceSign,
            WorldAction::Mount { .. } => ActionKind::Mount,
            WorldAction::OpenContainer { .. } => ActionKind::OpenContainer,
            WorldAction::CreateShop { .. } => ActionKind::CreateShop,
        }
    }

    pub fn target(&self) -> Target {
        match self {
            WorldAction::PlaceBlock { position, .. }
            | WorldAction::BreakBlock { position }
            | WorldAction::PlaceSign { position, .. }
            | WorldAction::CreateShop { position, .. } => Target::Block {
                position: *position,
            },
            WorldAction::Mount { .. } | WorldAction::OpenContainer { .. } => Target::Agent,
        }
    }

    pub fn expectation(&self) -> Expectation {
        match self {
            WorldAction::PlaceBlock { block, .. } => Expectation::BlockAppears {
                block: block.clone(),
            },
            WorldAction::BreakBlock { .. } => Expectation::BlockRemoved,
            WorldAction::PlaceSign { lines, .. } => Expectation::TextMatches {
                lines: lines.clone(),
            },
            WorldAction::Mount { entity } => Expectation::AttributeSet {
                key: "vehicle".to_string(),
                value: Some(entity.to_string()),
            },
            WorldAction::OpenContainer { .. } => Expectation::AttributeSet {
                key: "open_window".to_string(),
                value: None,
            },
            WorldAction::CreateShop { .. } => Expectation::AnyChange,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn world_action_wire_shape_uses_op_tag() {
        let action = WorldAction::PlaceBlock {
            position: BlockPos::new(10, 64, 10),
            block: "oak_planks".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&action).unwrap(),
            json!({"op": "place_block", "position": {"x": 10, "y": 64, "z": 10}, "block": "oak_planks"})
        );
    }

    #[test]
    fn mount_and_container_observe_the_agent() {
        assert_eq!(WorldAction::Mount { entity: 42 }.target(), Target::Agent);
        assert_eq!(
            WorldAction::OpenContainer {
                position: BlockPos::new(0, 0, 0)
            }
            .target(),
            Target::Agent
        );
    }

    #[test]
    fn only_block_edits_reject_silently() {
        assert!(ActionKind::PlaceBlock.rejects_silently());
        assert!(ActionKind::BreakBlock.rejects_silently());
        assert!(!ActionKind::PlaceSign.rejects_silently());
        assert!(!ActionKind::Mount.rejects_silently());
        assert!(!ActionKind::CreateShop.rejects_silently());
    }
}
