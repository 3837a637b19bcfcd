use crate::accumulator::Resource;
use crate::credential::Credential;
use crate::error::ProbeError;
use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

/// Identifier that no real service object will have. Probes that "act on a
/// missing object" use it to observe permission errors without side effects.
pub const FAKE_ID: &str = "00000000-0000-4000-8000-000000000000";

static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").unwrap());

/// Values available to `{{name}}` placeholders while rendering one request.
#[derive(Debug, Clone, Copy)]
pub struct TemplateContext<'a> {
    pub credential: &'a Credential,
    pub parent: Option<&'a Resource>,
}

impl<'a> TemplateContext<'a> {
    pub fn new(credential: &'a Credential) -> Self {
        Self {
            credential,
            parent: None,
        }
    }

    pub fn with_parent(self, parent: Option<&'a Resource>) -> Self {
        Self { parent, ..self }
    }

    fn resolve(&self, name: &str) -> Option<String> {
        match name {
            "fake_id" => return Some(FAKE_ID.to_string()),
            "parent.id" => return self.parent.map(|p| p.id.clone()),
            "parent.name" => return self.parent.map(|p| p.name.clone()),
            "parent.type" => return self.parent.map(|p| p.resource_type.clone()),
            _ => {}
        }
        if let Some(key) = name.strip_prefix("parent.meta.") {
            return self.parent.and_then(|p| p.metadata.get(key).cloned());
        }
        self.credential.get(name).map(str::to_string)
    }
}

/// Substitute every `{{name}}` in `template`. Unknown names are a
/// configuration error rather than being left in the URL.
pub fn render(template: &str, ctx: &TemplateContext<'_>) -> Result<String, ProbeError> {
    let mut missing = Vec::new();
    let rendered = PLACEHOLDER_RE.replace_all(template, |caps: &regex::Captures| {
        let name = &caps[1];
        match ctx.resolve(name) {
            Some(value) => value,
            None => {
                missing.push(name.to_string());
                String::new()
            }
        }
    });

    if !missing.is_empty() {
        return Err(ProbeError::Config(format!(
            "no value for placeholder(s) {} in '{}'",
            missing.join(", "),
            template
        )));
    }
    Ok(rendered.into_owned())
}

/// Render every string inside a JSON payload.
pub fn render_json(value: &Value, ctx: &TemplateContext<'_>) -> Result<Value, ProbeError> {
    Ok(match value {
        Value::String(s) => Value::String(render(s, ctx)?),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| render_json(item, ctx))
                .collect::<Result<_, _>>()?,
        ),
        Value::Object(map) => {
            let mut rendered = serde_json::Map::with_capacity(map.len());
            for (key, item) in map {
                rendered.insert(key.clone(), render_json(item, ctx)?);
            }
            Value::Object(rendered)
        }
        other => other.clone(),
    })
}

/// Placeholder names used in `template`.
pub fn placeholders(template: &str) -> Vec<String> {
    PLACEHOLDER_RE
        .captures_iter(template)
        .map(|caps| caps[1].to_string())
        .collect()
}
