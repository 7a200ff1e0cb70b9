//! Named message templates with `{{field}}` placeholders.
//!
//! Placeholders are filled from the notification's JSON content. Payloads
//! without a template use `content.subject` / `content.body` directly.

use std::collections::HashMap;

use courier_common::error::ChannelError;
use courier_common::types::NotificationPayload;

const DEFAULT_SUBJECT: &str = "New notification";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    pub subject: String,
    pub body: String,
}

impl Template {
    pub fn new(subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            body: body.into(),
        }
    }
}

/// Rendered subject and body, ready for a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub subject: String,
    pub body: String,
}

pub struct TemplateRegistry {
    templates: HashMap<String, Template>,
}

impl TemplateRegistry {
    /// Registry preloaded with the built-in account templates.
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register(
            "welcome",
            Template::new(
                "Welcome, {{name}}!",
                "Hi {{name}}, your account is ready. Glad to have you on board.",
            ),
        );
        registry.register(
            "verification",
            Template::new(
                "Your verification code",
                "Use {{code}} to verify your email address. The code expires in {{expires_in}}.",
            ),
        );
        registry
    }

    pub fn empty() -> Self {
        Self {
            templates: HashMap::new(),
        }
    }

    pub fn register(&mut self, name: impl Into<String>, template: Template) {
        self.templates.insert(name.into(), template);
    }

    /// Render a payload. Unknown templates and missing fields are terminal:
    /// retrying the same payload can never succeed.
    pub fn render(&self, payload: &NotificationPayload) -> Result<Rendered, ChannelError> {
        let content = &payload.content;

        let Some(name) = payload.template.as_deref() else {
            let subject = content
                .get("subject")
                .and_then(|v| v.as_str())
                .unwrap_or(DEFAULT_SUBJECT)
                .to_string();
            let body = match content.get("body") {
                Some(serde_json::Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => content.to_string(),
            };
            return Ok(Rendered { subject, body });
        };

        let template = self
            .templates
            .get(name)
            .ok_or_else(|| ChannelError::Terminal(format!("unknown template '{}'", name)))?;

        Ok(Rendered {
            subject: fill(&template.subject, content, name)?,
            body: fill(&template.body, content, name)?,
        })
    }
}

impl Default for TemplateRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn fill(text: &str, content: &serde_json::Value, template: &str) -> Result<String, ChannelError> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            // unterminated placeholder, keep verbatim
            out.push_str(&rest[start..]);
            return Ok(out);
        };

        let field = after[..end].trim();
        let value = content.get(field).ok_or_else(|| {
            ChannelError::Terminal(format!(
                "template '{}' needs field '{}'",
                template, field
            ))
        })?;
        match value {
            serde_json::Value::String(s) => out.push_str(s),
            other => out.push_str(&other.to_string()),
        }
        rest = &after[end + 2..];
    }

    out.push_str(rest);
    Ok(out)
}
