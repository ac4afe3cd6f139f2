use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

use crate::models::{OutputFormat, SafetyLevel};

/// Hard cap on a substituted variable, applied after null-byte
/// stripping. Oversized values are truncated, not rejected.
const MAX_VARIABLE_BYTES: usize = 8192;

/// Appended to the prompt when the first reply could not be parsed.
pub const STRICT_JSON_SUFFIX: &str = "\n\nRespond with ONLY a single JSON object. \
No prose, no code fences, no explanation outside the JSON.";

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{\{(\w+)\}\}").unwrap());

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("unknown template: {0}")]
    Unknown(String),
    #[error("template {template} is missing variable {variable}")]
    VariableMissing { template: String, variable: String },
    #[error("template {name} uses undeclared placeholder {{{{{placeholder}}}}}")]
    UndeclaredPlaceholder { name: String, placeholder: String },
    #[error("template {0} expects json output but its body never asks for JSON")]
    MissingFormatInstruction(String),
    #[error("failed to read template file {path}: {source}")]
    File {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse template file: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// A named, versioned prompt with typed placeholders. Immutable after
/// registration; a new version is a new entry.
#[derive(Debug, Clone, Deserialize)]
pub struct PromptTemplate {
    /// Filled from the file's map key when loading from YAML.
    #[serde(default)]
    pub name: String,
    pub version: String,
    pub safety_level: SafetyLevel,
    pub expected_output: OutputFormat,
    #[serde(rename = "prompt")]
    pub body: String,
    pub variables: Vec<String>,
}

/// Registry of allowlisted prompt templates, loaded once at startup.
/// Template names are a fixed server-side set; callers can never select
/// a template that was not registered here.
pub struct TemplateRegistry {
    templates: HashMap<String, Arc<PromptTemplate>>,
}

impl TemplateRegistry {
    /// The built-in template set.
    pub fn builtin() -> Self {
        let mut registry = Self {
            templates: HashMap::new(),
        };
        for template in default_templates() {
            registry
                .register(template)
                .expect("built-in template must validate");
        }
        registry
    }

    /// Load templates from a YAML file keyed by template name. The
    /// built-in `moderation_prompt` stays available as a fallback.
    pub fn from_file(path: &str) -> Result<Self, TemplateError> {
        let raw = std::fs::read_to_string(path).map_err(|source| TemplateError::File {
            path: path.to_string(),
            source,
        })?;
        let file: BTreeMap<String, PromptTemplate> = serde_yaml::from_str(&raw)?;

        let mut registry = Self::builtin();
        for (name, mut template) in file {
            template.name = name;
            registry.register(template)?;
        }
        Ok(registry)
    }

    /// Validate and add a template. Every `{{placeholder}}` in the body
    /// must be declared, and json templates must instruct the model to
    /// answer in JSON.
    pub fn register(&mut self, template: PromptTemplate) -> Result<(), TemplateError> {
        for cap in PLACEHOLDER.captures_iter(&template.body) {
            let placeholder = &cap[1];
            if !template.variables.iter().any(|v| v == placeholder) {
                return Err(TemplateError::UndeclaredPlaceholder {
                    name: template.name.clone(),
                    placeholder: placeholder.to_string(),
                });
            }
        }
        if template.expected_output == OutputFormat::Json
            && !template.body.to_ascii_lowercase().contains("json")
        {
            return Err(TemplateError::MissingFormatInstruction(template.name.clone()));
        }

        self.templates
            .insert(template.name.clone(), Arc::new(template));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<PromptTemplate>, TemplateError> {
        self.templates
            .get(name)
            .cloned()
            .ok_or_else(|| TemplateError::Unknown(name.to_string()))
    }

    /// Registered template names with versions, for the listing endpoint.
    pub fn list(&self) -> Vec<(String, String)> {
        let mut entries: Vec<_> = self
            .templates
            .values()
            .map(|t| (t.name.clone(), t.version.clone()))
            .collect();
        entries.sort();
        entries
    }

    /// Render a template with the given variables. Fails when the name
    /// is not registered or any declared variable is absent. Values are
    /// stripped of null bytes and capped at `MAX_VARIABLE_BYTES`.
    pub fn render(
        &self,
        name: &str,
        variables: &HashMap<String, String>,
    ) -> Result<String, TemplateError> {
        let template = self.get(name)?;

        let mut rendered = template.body.clone();
        for declared in &template.variables {
            let value = variables
                .get(declared)
                .ok_or_else(|| TemplateError::VariableMissing {
                    template: name.to_string(),
                    variable: declared.clone(),
                })?;
            let clean = sanitize_value(value);
            rendered = rendered.replace(&format!("{{{{{declared}}}}}"), &clean);
        }
        Ok(rendered)
    }
}

fn sanitize_value(value: &str) -> String {
    let stripped: String = value.chars().filter(|&c| c != '\0').collect();
    if stripped.len() <= MAX_VARIABLE_BYTES {
        return stripped;
    }
    let mut cut = MAX_VARIABLE_BYTES;
    while !stripped.is_char_boundary(cut) {
        cut -= 1;
    }
    stripped[..cut].to_string()
}

fn default_templates() -> Vec<PromptTemplate> {
    vec![
        PromptTemplate {
            name: "moderation_prompt".to_string(),
            version: "1.2".to_string(),
            safety_level: SafetyLevel::Medium,
            expected_output: OutputFormat::Json,
            body: "You are a content moderation assistant for a live chat platform.\n\
                   Classify the following chat message:\n\
                   '{{chat_message}}'\n\
                   (channel: {{channel_id}}, user: {{user_id}})\n\n\
                   Respond in JSON format:\n\
                   {\"decision\": \"Toxic|Non-Toxic|Spam|PII|Harassment\", \
                   \"confidence\": 0.95, \"reasoning\": \"one sentence\"}"
                .to_string(),
            variables: vec![
                "chat_message".to_string(),
                "channel_id".to_string(),
                "user_id".to_string(),
            ],
        },
        PromptTemplate {
            name: "moderation_prompt_strict".to_string(),
            version: "1.0".to_string(),
            safety_level: SafetyLevel::High,
            expected_output: OutputFormat::Json,
            body: "You are a content moderation assistant. The user below has prior \
                   violations: {{history_summary}}.\n\
                   Classify this chat message with heightened scrutiny:\n\
                   '{{chat_message}}'\n\
                   (channel: {{channel_id}}, user: {{user_id}})\n\n\
                   Respond in JSON format:\n\
                   {\"decision\": \"Toxic|Non-Toxic|Spam|PII|Harassment\", \
                   \"confidence\": 0.95, \"reasoning\": \"one sentence\"}"
                .to_string(),
            variables: vec![
                "chat_message".to_string(),
                "channel_id".to_string(),
                "user_id".to_string(),
                "history_summary".to_string(),
            ],
        },
    ]
}
