//! Tools the live session offers out of the box.

use chrono::{Local, SecondsFormat, Utc};
use parley_voice::{ToolDeclaration, ToolRegistry};
use serde_json::json;

/// Registry with every built-in tool.
pub fn builtin_tools() -> ToolRegistry {
    let mut tools = ToolRegistry::new();
    tools.register_fn(
        ToolDeclaration {
            name: "get_current_time".to_string(),
            description: "Returns the current date and time, in UTC and in the local time zone."
                .to_string(),
            parameters: None,
        },
        |_args| {
            let local = Local::now();
            Ok(json!({
                "utc": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
                "local": local.to_rfc3339_opts(SecondsFormat::Secs, false),
                "weekday": local.format("%A").to_string(),
            }))
        },
    );
    tools
}
