//! `{{placeholder}}` substitution.
//!
//! Deliberately not a templating engine: placeholders are replaced by the
//! matching variable, and unresolved placeholders render as the empty string.

use std::borrow::Cow;
use std::collections::HashMap;

/// Template capability used by the dispatcher.
pub trait TemplateRenderer: Send + Sync + std::fmt::Debug {
    fn render(&self, template: &str, variables: &HashMap<String, String>) -> String;
}

/// Default renderer backed by [`render`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaceholderRenderer;

impl TemplateRenderer for PlaceholderRenderer {
    fn render(&self, template: &str, variables: &HashMap<String, String>) -> String {
        render(template, variables)
    }
}

/// Replace every `{{ key }}` in `template` with `variables[key]`.
///
/// Whitespace inside the braces is ignored. An opening `{{` without a closing
/// `}}` is kept verbatim.
pub fn render(template: &str, variables: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];
        match after_open.find("}}") {
            Some(end) => {
                let key = after_open[..end].trim();
                if let Some(value) = variables.get(key) {
                    out.push_str(value);
                } else {
                    tracing::debug!(placeholder = key, "Unresolved template placeholder");
                }
                rest = &after_open[end + 2..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Render only when `text` contains placeholders.
pub fn render_if_needed<'a>(
    renderer: &dyn TemplateRenderer,
    text: &'a str,
    variables: &HashMap<String, String>,
) -> Cow<'a, str> {
    if text.contains("{{") {
        Cow::Owned(renderer.render(text, variables))
    } else {
        Cow::Borrowed(text)
    }
}
