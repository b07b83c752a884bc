//! `{name}` substitution for system prompt templates.
//!
//! Placeholders are substituted from the node's input view before any LLM
//! call; a placeholder with no backing key is an error surfaced as
//! missing-input, so the provider is never reached with a half-rendered
//! prompt. `{{` and `}}` escape literal braces.

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum TemplateError {
    #[error("prompt template references `{{{name}}}`, which is not in the input view")]
    #[diagnostic(
        code(hivegraph::template::missing_name),
        help("declare `{name}` among the node's input keys and ensure a predecessor produces it")
    )]
    MissingName { name: String },

    #[error("unbalanced `{{` at byte {at}")]
    #[diagnostic(code(hivegraph::template::unbalanced))]
    Unbalanced { at: usize },
}

/// Render a template against a keyed value map.
///
/// String values substitute bare; other values substitute as compact JSON.
///
/// # Examples
///
/// ```
/// use hivegraph::template::render;
/// use rustc_hash::FxHashMap;
/// use serde_json::json;
///
/// let mut values = FxHashMap::default();
/// values.insert("topic".to_string(), json!("Rust"));
/// values.insert("depth".to_string(), json!(3));
///
/// let out = render("Research {topic} to depth {depth}. Use {{braces}} literally.", &values);
/// assert_eq!(out.unwrap(), "Research Rust to depth 3. Use {braces} literally.");
/// ```
pub fn render(template: &str, values: &FxHashMap<String, Value>) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.char_indices().peekable();

    while let Some((at, c)) = chars.next() {
        match c {
            '{' => {
                if chars.peek().map(|&(_, c)| c) == Some('{') {
                    chars.next();
                    out.push('{');
                    continue;
                }
                let mut name = String::new();
                let mut closed = false;
                for (_, c) in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    name.push(c);
                }
                if !closed {
                    return Err(TemplateError::Unbalanced { at });
                }
                let value = values
                    .get(name.trim())
                    .ok_or_else(|| TemplateError::MissingName {
                        name: name.trim().to_string(),
                    })?;
                match value {
                    Value::String(s) => out.push_str(s),
                    other => out.push_str(&other.to_string()),
                }
            }
            '}' => {
                if chars.peek().map(|&(_, c)| c) == Some('}') {
                    chars.next();
                }
                out.push('}');
            }
            _ => out.push(c),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn values(pairs: &[(&str, Value)]) -> FxHashMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn substitutes_strings_and_json() {
        let v = values(&[("name", json!("ada")), ("tags", json!(["a", "b"]))]);
        assert_eq!(
            render("hi {name}: {tags}", &v).unwrap(),
            r#"hi ada: ["a","b"]"#
        );
    }

    #[test]
    fn missing_name_is_an_error() {
        let err = render("hello {who}", &values(&[])).unwrap_err();
        assert!(matches!(err, TemplateError::MissingName { name } if name == "who"));
    }

    #[test]
    fn escaped_braces() {
        assert_eq!(render("{{not a key}}", &values(&[])).unwrap(), "{not a key}");
    }

    #[test]
    fn unterminated_placeholder() {
        assert!(matches!(
            render("oops {tail", &values(&[])),
            Err(TemplateError::Unbalanced { .. })
        ));
    }
}
