//! Tool arguments to typed world actions.

use serde_json::{Map, Value};
use tether_core::{BlockPos, WorldAction};

use crate::{ToolError, required_i32, required_string, required_u64};

pub(crate) const SIGN_MAX_LINES: usize = 4;
pub(crate) const SIGN_LINE_MAX_CHARS: usize = 32;

/// Names of the tools that run under the verification protocol.
pub(crate) const WORLD_ACTION_TOOLS: [&str; 6] = [
    "tether_place_block",
    "tether_break_block",
    "tether_place_sign",
    "tether_mount",
    "tether_open_container",
    "tether_create_shop",
];

pub(crate) fn is_world_action_tool(name: &str) -> bool {
    WORLD_ACTION_TOOLS.contains(&name)
}

pub(crate) fn world_action_from_args(
    tool: &str,
    args: &Map<String, Value>,
) -> Result<WorldAction, ToolError> {
    let action = match tool {
        "tether_place_block" => WorldAction::PlaceBlock {
            position: position(args)?,
            block: block_id(args)?,
        },
        "tether_break_block" => WorldAction::BreakBlock {
            position: position(args)?,
        },
        "tether_place_sign" => WorldAction::PlaceSign {
            position: position(args)?,
            lines: sign_lines(args)?,
        },
        "tether_mount" => WorldAction::Mount {
            entity: required_u64(args, "entity_id")?,
        },
        "tether_open_container" => WorldAction::OpenContainer {
            position: position(args)?,
        },
        "tether_create_shop" => WorldAction::CreateShop {
            position: position(args)?,
            lines: sign_lines(args)?,
        },
        other => {
            return Err(ToolError::new(
                "unknown_tool",
                format!("'{other}' is not a world action tool"),
            ));
        }
    };
    Ok(action)
}

fn position(args: &Map<String, Value>) -> Result<BlockPos, ToolError> {
    Ok(BlockPos::new(
        required_i32(args, "x")?,
        required_i32(args, "y")?,
        required_i32(args, "z")?,
    ))
}

/// Accepts `oak_planks` or `minecraft:oak_planks`; the namespace is dropped.
fn block_id(args: &Map<String, Value>) -> Result<String, ToolError> {
    let raw = required_string(args, "block")?;
    let trimmed = raw.trim();
    let id = trimmed.strip_prefix("minecraft:").unwrap_or(trimmed);
    let valid = id
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if id.is_empty() || !valid {
        return Err(ToolError::new(
            "validation_failed",
            format!("'block' must be a block id like 'oak_planks', got '{raw}'"),
        )
        .with_field("block"));
    }
    Ok(id.to_string())
}

/// Sign lines keep their position, so blank entries are preserved.
fn sign_lines(args: &Map<String, Value>) -> Result<Vec<String>, ToolError> {
    let invalid =
        |message: String| ToolError::new("validation_failed", message).with_field("lines");
    let items = match args.get("lines") {
        Some(Value::Array(items)) => items,
        None | Some(Value::Null) => {
            return Err(invalid("Missing required field 'lines'".to_string()));
        }
        Some(_) => return Err(invalid("'lines' must be an array of strings".to_string())),
    };
    if items.len() > SIGN_MAX_LINES {
        return Err(invalid(format!(
            "a sign holds at most {SIGN_MAX_LINES} lines, got {}",
            items.len()
        )));
    }

    let mut lines = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        let text = item
            .as_str()
            .ok_or_else(|| invalid("'lines' items must be strings".to_string()))?;
        if text.chars().count() > SIGN_LINE_MAX_CHARS {
            return Err(invalid(format!(
                "line {} exceeds {SIGN_LINE_MAX_CHARS} characters",
                index + 1
            )));
        }
        lines.push(text.to_string());
    }
    if lines.iter().all(|line| line.trim().is_empty()) {
        return Err(invalid("at least one sign line must have text".to_string()));
    }
    Ok(lines)
}
