//! Template Renderer - Placeholder substitution and address validation

use lettre::Address;
use regex::{Captures, Regex};
use std::collections::HashMap;
use std::sync::OnceLock;
use thiserror::Error;

/// Template rendering errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RenderError {
    #[error("unterminated placeholder at byte {0}")]
    Unterminated(usize),
}

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    // Both {Name} and {{Name}}
    PATTERN.get_or_init(|| Regex::new(r"\{\{?(\w+)\}?\}").expect("placeholder pattern is valid"))
}

/// Substitutes `{Name}` / `{{Name}}` placeholders from a field map.
///
/// Known names are replaced with their value. Unknown placeholders are left
/// verbatim so a typo is visible in the sent message rather than silently
/// erased. An opening `{{` with no closing `}}` is an error.
#[derive(Debug, Clone, Default)]
pub struct TemplateRenderer {
    defaults: HashMap<String, String>,
}

impl TemplateRenderer {
    /// Create a renderer without default variables
    pub fn new() -> Self {
        Self::default()
    }

    /// Variables available to every template, overridden by per-contact fields
    pub fn with_defaults(defaults: HashMap<String, String>) -> Self {
        Self { defaults }
    }

    /// Render a template with the given fields
    pub fn render(
        &self,
        template: &str,
        fields: &HashMap<String, String>,
    ) -> Result<String, RenderError> {
        check_terminated(template)?;

        let rendered = placeholder_pattern().replace_all(template, |caps: &Captures<'_>| {
            let name = &caps[1];
            fields
                .get(name)
                .or_else(|| self.defaults.get(name))
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        });

        Ok(rendered.into_owned())
    }

    /// Names of all placeholders in a template, in order of first appearance
    pub fn placeholders(template: &str) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for caps in placeholder_pattern().captures_iter(template) {
            let name = caps[1].to_string();
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names
    }

    /// Placeholders that neither `fields` nor the defaults fill, in order of first appearance
    pub fn unknown_placeholders(
        &self,
        template: &str,
        fields: &HashMap<String, String>,
    ) -> Vec<String> {
        Self::placeholders(template)
            .into_iter()
            .filter(|name| !fields.contains_key(name) && !self.defaults.contains_key(name))
            .collect()
    }
}

fn check_terminated(template: &str) -> Result<(), RenderError> {
    let mut offset = 0;
    while let Some(start) = template[offset..].find("{{") {
        let open = offset + start;
        match template[open + 2..].find("}}") {
            Some(end) => offset = open + 2 + end + 2,
            None => return Err(RenderError::Unterminated(open)),
        }
    }
    Ok(())
}

/// Validate an address, returning it normalized (trimmed, lowercase domain)
/// or the reason it is invalid
pub fn validate_address(address: &str) -> Result<String, String> {
    let trimmed = address.trim();
    if trimmed.is_empty() {
        return Err("address is empty".to_string());
    }

    let parsed: Address = trimmed.parse().map_err(|e| format!("{}", e))?;

    if !parsed.domain().contains('.') {
        return Err(format!("domain {} is not fully qualified", parsed.domain()));
    }

    Ok(format!(
        "{}@{}",
        parsed.user(),
        parsed.domain().to_lowercase()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn fields() -> HashMap<String, String> {
        HashMap::from([
            ("FirstName".to_string(), "Jane".to_string()),
            ("Company".to_string(), "Acme Corp".to_string()),
        ])
    }

    #[test]
    fn test_render_both_syntaxes() {
        let renderer = TemplateRenderer::new();
        let result = renderer
            .render("Hi {FirstName} from {{Company}}!", &fields())
            .unwrap();
        assert_eq!(result, "Hi Jane from Acme Corp!");
    }

    #[test]
    fn test_render_keeps_unknown_placeholders() {
        let renderer = TemplateRenderer::new();
        let result = renderer
            .render("Hello {FirstName}, {{Unknown}} and {Other}", &fields())
            .unwrap();
        assert_eq!(result, "Hello Jane, {{Unknown}} and {Other}");
    }

    #[test]
    fn test_render_defaults_are_overridden() {
        let renderer = TemplateRenderer::with_defaults(HashMap::from([
            ("Sender".to_string(), "Sam".to_string()),
            ("FirstName".to_string(), "friend".to_string()),
        ]));
        let result = renderer.render("{FirstName}, {Sender} here", &fields()).unwrap();
        assert_eq!(result, "Jane, Sam here");
    }

    #[test]
    fn test_render_unterminated() {
        let renderer = TemplateRenderer::new();
        assert_eq!(
            renderer.render("Hi {{FirstName", &fields()),
            Err(RenderError::Unterminated(3))
        );
        assert!(renderer.render("{{A}} then {{", &fields()).is_err());
    }

    #[test]
    fn test_render_literal_braces_untouched() {
        let renderer = TemplateRenderer::new();
        let result = renderer.render("a { b } c", &fields()).unwrap();
        assert_eq!(result, "a { b } c");
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(
            TemplateRenderer::placeholders("{A} {{B}} {A}"),
            vec!["A".to_string(), "B".to_string()]
        );
    }

    #[test]
    fn test_unknown_placeholders() {
        let renderer = TemplateRenderer::with_defaults(HashMap::from([(
            "Sender".to_string(),
            "Sam".to_string(),
        )]));
        assert_eq!(
            renderer.unknown_placeholders("{FirstName} {Sender} {{Title}} {Title}", &fields()),
            vec!["Title".to_string()]
        );
    }

    #[test]
    fn test_validate_address() {
        assert_eq!(
            validate_address("  Jane.Doe@Example.COM "),
            Ok("Jane.Doe@example.com".to_string())
        );
        assert!(validate_address("").is_err());
        assert!(validate_address("no-at-sign").is_err());
        assert!(validate_address("user@localhost").is_err());
    }
}
