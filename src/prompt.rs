use std::{collections::BTreeMap, fs, path::Path};

use autopilot_plugin::CommandSpec;
use chrono::Local;
use dashmap::DashMap;
use handlebars::{Handlebars, no_escape};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{info, warn};

const SYSTEM_TEMPLATE: &str = r#"You are a task planning assistant running on {{os}} as user {{user}} in {{cwd}} at {{time}}.
Your job is to break the user's request into a sequence of executable actions.

AVAILABLE COMMANDS:
{{#each plugins}}

{{name}} COMMANDS:
{{#each commands}}
  - {{event}}: {{description}}
{{#if params}}
    Parameters: {{params}}
{{/if}}
{{/each}}
{{/each}}
{{#unless plugins}}
  (no commands registered)
{{/unless}}

RESPONSE FORMAT:
Respond with a JSON array of actions. Each action has:
- "event": the event name to publish
- "data": object with parameters for the event
- "description": brief description of what this action does

Example response:
[
  {"event": "output", "data": {"type": "info", "text": "Starting the backup"}, "description": "Tell the user what happens next"},
  {"event": "output", "data": {"type": "success", "text": "Backup finished"}, "description": "Report the result"}
]

IMPORTANT RULES:
1. Respond ONLY with the JSON array, no markdown and no extra text
2. Use only the commands listed above
3. Break complex tasks into simple steps in their logical order"#;

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("prompt template error: {0}")]
    Template(String),
}

/// Builds the text a model receives for a plan request.
pub fn plan_prompt(system_prompt: &str, request: &str) -> String {
    format!("{system_prompt}\n\nUser request: {request}\n\nAnswer (JSON):")
}

/// Commands advertised by plugins, keyed by plugin name.
#[derive(Debug, Default)]
pub struct CommandCatalog {
    commands: DashMap<String, Vec<CommandSpec>>,
}

impl CommandCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, plugin: &str, commands: Vec<CommandSpec>) {
        if commands.is_empty() {
            self.commands.remove(plugin);
        } else {
            self.commands.insert(plugin.to_string(), commands);
        }
    }

    pub fn remove(&self, plugin: &str) -> bool {
        self.commands.remove(plugin).is_some()
    }

    pub fn len(&self) -> usize {
        self.commands.iter().map(|e| e.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn snapshot(&self) -> BTreeMap<String, Vec<CommandSpec>> {
        self.commands
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Reads `<plugin>.json` command lists from `dir`. Unreadable files are
    /// skipped with a warning. Returns the number of plugins loaded.
    pub fn load_dir(&self, dir: &Path) -> usize {
        let Ok(entries) = fs::read_dir(dir) else {
            return 0;
        };
        let mut loaded = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(plugin) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let parsed = fs::read_to_string(&path)
                .map_err(anyhow::Error::from)
                .and_then(|text| Ok(serde_json::from_str::<Vec<CommandSpec>>(&text)?));
            match parsed {
                Ok(commands) => {
                    info!(plugin, count = commands.len(), "loaded command descriptions");
                    self.register(plugin, commands);
                    loaded += 1;
                }
                Err(err) => warn!(path = %path.display(), error = %err, "skipping command file"),
            }
        }
        loaded
    }
}

/// Renders the planner's system prompt from the command catalog.
pub struct PromptBuilder {
    registry: Handlebars<'static>,
}

impl PromptBuilder {
    pub fn new() -> Result<Self, PromptError> {
        let mut registry = Handlebars::new();
        registry.register_escape_fn(no_escape);
        registry
            .register_template_string("system", SYSTEM_TEMPLATE)
            .map_err(|e| PromptError::Template(e.to_string()))?;
        Ok(Self { registry })
    }

    pub fn system_prompt(&self, catalog: &CommandCatalog) -> Result<String, PromptError> {
        let plugins: Vec<Value> = catalog
            .snapshot()
            .into_iter()
            .map(|(plugin, commands)| {
                let commands: Vec<Value> = commands
                    .iter()
                    .map(|c| {
                        json!({
                            "event": c.event,
                            "description": c.description,
                            "params": render_params(&c.parameters),
                        })
                    })
                    .collect();
                json!({ "name": plugin.to_uppercase(), "commands": commands })
            })
            .collect();
        let data = json!({
            "os": std::env::consts::OS,
            "user": std::env::var("USER").unwrap_or_else(|_| "unknown".into()),
            "cwd": std::env::current_dir().map(|p| p.display().to_string()).unwrap_or_default(),
            "time": Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            "plugins": plugins,
        });
        self.registry
            .render("system", &data)
            .map_err(|e| PromptError::Template(e.to_string()))
    }
}

fn render_params(params: &BTreeMap<String, Value>) -> String {
    params
        .iter()
        .map(|(name, kind)| match kind {
            Value::String(s) => format!("{name}: {s}"),
            other => format!("{name}: {other}"),
        })
        .collect::<Vec<_>>()
        .join(", ")
}
