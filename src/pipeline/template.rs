//! Template rendering.
//!
//! Substitution is a single linear scan for `{{name}}` pairs (no
//! surrounding whitespace inside the braces). Only names declared in the
//! template's `variables` are substituted; a declared name missing from
//! the context renders as the empty string, and an undeclared placeholder
//! is left in place verbatim. Rendering is a pure function of
//! (template, context).

use std::collections::BTreeMap;

use serde_json::Value;

use crate::event::RoutedEvent;
use crate::store::Template;

/// A value a placeholder can render to.
#[derive(Debug, Clone, PartialEq)]
pub enum TemplateValue {
    Text(String),
    Number(serde_json::Number),
    Bool(bool),
    Null,
}

impl TemplateValue {
    fn render(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Number(n) => n.to_string(),
            Self::Bool(b) => b.to_string(),
            Self::Null => String::new(),
        }
    }
}

impl From<&Value> for TemplateValue {
    fn from(value: &Value) -> Self {
        match value {
            Value::String(s) => Self::Text(s.clone()),
            Value::Number(n) => Self::Number(n.clone()),
            Value::Bool(b) => Self::Bool(*b),
            Value::Null => Self::Null,
            // Structured values render as their JSON text.
            other => Self::Text(other.to_string()),
        }
    }
}

/// Name → value map a template renders against.
#[derive(Debug, Default, Clone)]
pub struct RenderContext {
    values: BTreeMap<String, TemplateValue>,
}

impl RenderContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Event data merged with the injected recipient fields. Injected
    /// fields win on collision.
    pub fn from_event(event: &RoutedEvent) -> Self {
        let mut ctx = Self::new();
        for (name, value) in &event.data {
            ctx.insert(name.clone(), TemplateValue::from(value));
        }

        let user_name = event
            .user_email
            .as_deref()
            .and_then(|email| email.split('@').next())
            .filter(|local| !local.is_empty())
            .unwrap_or("User")
            .to_string();
        ctx.insert("user_name".to_string(), TemplateValue::Text(user_name));
        if let Some(email) = &event.user_email {
            ctx.insert("user_email".to_string(), TemplateValue::Text(email.clone()));
        }
        ctx
    }

    pub fn insert(&mut self, name: String, value: TemplateValue) {
        self.values.insert(name, value);
    }

    fn render(&self, name: &str) -> String {
        self.values.get(name).map(|v| v.render()).unwrap_or_default()
    }
}

/// Substitute declared placeholders in `input`.
pub fn substitute(input: &str, variables: &[String], ctx: &RenderContext) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(open) = rest.find("{{") {
        let after_open = &rest[open + 2..];
        let Some(close) = after_open.find("}}") else {
            break;
        };
        let name = &after_open[..close];

        out.push_str(&rest[..open]);
        if variables.iter().any(|v| v == name) {
            out.push_str(&ctx.render(name));
        } else {
            // Undeclared placeholder stays in place.
            out.push_str(&rest[open..open + 2 + close + 2]);
        }
        rest = &after_open[close + 2..];
    }
    out.push_str(rest);
    out
}

/// Rendered subject/body pair.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedBody {
    pub subject: Option<String>,
    pub body: String,
}

/// Render a routed event against its template.
pub fn render(template: &Template, event: &RoutedEvent) -> RenderedBody {
    let ctx = RenderContext::from_event(event);
    RenderedBody {
        subject: template
            .subject
            .as_deref()
            .map(|s| substitute(s, &template.variables, &ctx)),
        body: substitute(&template.body, &template.variables, &ctx),
    }
}

/// Synthesized output when no template exists for (channel, event type).
pub fn fallback(event: &RoutedEvent) -> RenderedBody {
    RenderedBody {
        subject: Some(format!("Notification: {}", event.event_type)),
        body: serde_json::to_string(&event.data).unwrap_or_else(|_| "{}".to_string()),
    }
}
