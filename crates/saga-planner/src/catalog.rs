// SPDX-License-Identifier: MIT OR Apache-2.0

//! The routable command catalog shown to the planner LLM.

use serde::{Deserialize, Serialize};
use serde_json::json;

/// One routable command with its argument schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Dotted command name (`check`, `sheet.create`, …).
    pub name: String,
    /// One-line description for the prompt.
    pub description: String,
    /// JSON schema of the accepted arguments.
    pub options_schema: serde_json::Value,
}

/// The set of commands the planner may route to.
#[derive(Debug, Clone, Default)]
pub struct CommandCatalog {
    commands: Vec<CommandSpec>,
}

impl CommandCatalog {
    /// An empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a command.
    pub fn register(&mut self, spec: CommandSpec) {
        self.commands.push(spec);
    }

    /// All commands in registration order.
    #[must_use]
    pub fn commands(&self) -> &[CommandSpec] {
        &self.commands
    }

    /// Find a command by dotted name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&CommandSpec> {
        self.commands.iter().find(|c| c.name == name)
    }

    /// Whether the catalog routes this dotted name.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// JSON rendering injected into the planner prompt.
    #[must_use]
    pub fn to_prompt_json(&self) -> String {
        serde_json::to_string(&self.commands).unwrap_or_else(|_| "[]".to_string())
    }
}

/// The default routable catalog.
///
/// Doubles as the planner allowlist: a command absent from the catalog
/// is rejected even if the LLM proposes it.
#[must_use]
pub fn default_catalog() -> CommandCatalog {
    let mut catalog = CommandCatalog::new();
    catalog.register(CommandSpec {
        name: "roll".to_string(),
        description: "Roll a dice expression like 2d6+3".to_string(),
        options_schema: json!({
            "type": "object",
            "properties": {
                "expr": {"type": "string"},
                "advantage": {"type": "boolean"},
                "disadvantage": {"type": "boolean"}
            },
            "required": ["expr"],
            "additionalProperties": false
        }),
    });
    catalog.register(CommandSpec {
        name: "check".to_string(),
        description: "Make an ability check against a difficulty class".to_string(),
        options_schema: json!({
            "type": "object",
            "properties": {
                "ability": {"type": "string"},
                "score": {"type": "integer"},
                "dc": {"type": "integer"},
                "actor": {"type": "string"},
                "proficient": {"type": "boolean"},
                "expertise": {"type": "boolean"}
            },
            "required": ["ability"],
            "additionalProperties": false
        }),
    });
    catalog.register(CommandSpec {
        name: "sheet.create".to_string(),
        description: "Create a character sheet from a JSON body".to_string(),
        options_schema: json!({
            "type": "object",
            "properties": {"json": {"type": "string"}},
            "required": ["json"],
            "additionalProperties": false
        }),
    });
    catalog.register(CommandSpec {
        name: "sheet.show".to_string(),
        description: "Show a character sheet by name".to_string(),
        options_schema: json!({
            "type": "object",
            "properties": {"name": {"type": "string"}},
            "required": ["name"],
            "additionalProperties": false
        }),
    });
    catalog.register(CommandSpec {
        name: "do".to_string(),
        description: "Narrate an in-character action for adjudication".to_string(),
        options_schema: json!({
            "type": "object",
            "properties": {"message": {"type": "string"}},
            "required": ["message"],
            "additionalProperties": false
        }),
    });
    catalog.register(CommandSpec {
        name: "ooc".to_string(),
        description: "Out-of-character table talk".to_string(),
        options_schema: json!({
            "type": "object",
            "properties": {"message": {"type": "string"}},
            "required": ["message"],
            "additionalProperties": false
        }),
    });
    catalog
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_catalog_routes_the_allowlist() {
        let catalog = default_catalog();
        for name in ["roll", "check", "sheet.create", "sheet.show", "do", "ooc"] {
            assert!(catalog.contains(name), "missing {name}");
        }
        assert!(!catalog.contains("attack"));
        assert!(!catalog.contains("sheet"));
    }

    #[test]
    fn prompt_json_is_valid_json() {
        let rendered = default_catalog().to_prompt_json();
        let parsed: serde_json::Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(parsed.as_array().unwrap().len(), 6);
    }
}
