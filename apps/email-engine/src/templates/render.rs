//! `{{variable}}` substitution over a template snapshot.
//!
//! Values inserted into the HTML body are escaped; subject and plain-text parts
//! receive them verbatim. `{{unsubscribe_url}}` is always available, and a
//! template-declared unsubscribe placeholder is replaced with the same link.

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::models::template::TemplateSnapshot;

pub const UNSUBSCRIBE_VARIABLE: &str = "unsubscribe_url";

#[derive(Debug, Error, PartialEq)]
pub enum RenderError {
    #[error("variables must be a JSON object")]
    VariablesNotObject,

    #[error("missing template variable '{0}'")]
    MissingVariable(String),

    #[error("unterminated placeholder starting at byte {0}")]
    Unterminated(usize),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderedEmail {
    pub subject: String,
    pub html: String,
    pub text: Option<String>,
}

pub fn render_snapshot(
    snapshot: &TemplateSnapshot,
    variables: &Value,
    unsubscribe_url: &str,
) -> Result<RenderedEmail, RenderError> {
    let empty = Map::new();
    let vars = match variables {
        Value::Object(map) => map,
        Value::Null => &empty,
        _ => return Err(RenderError::VariablesNotObject),
    };

    // The placeholder may itself look like `{{name}}`, so it goes before substitution.
    let placeholder = snapshot
        .unsubscribe_placeholder
        .as_deref()
        .filter(|p| !p.is_empty());
    let with_link = |source: &str, link: &str| match placeholder {
        Some(p) => source.replace(p, link),
        None => source.to_string(),
    };

    let html_source = with_link(&snapshot.html_content, &escape_html(unsubscribe_url));
    Ok(RenderedEmail {
        subject: substitute(&snapshot.subject, vars, unsubscribe_url, false)?,
        html: substitute(&html_source, vars, unsubscribe_url, true)?,
        text: snapshot
            .text_content
            .as_deref()
            .map(|t| substitute(&with_link(t, unsubscribe_url), vars, unsubscribe_url, false))
            .transpose()?,
    })
}

/// Per-recipient unsubscribe link.
pub fn unsubscribe_link(base_url: &str, email_address: &str) -> String {
    format!(
        "{}?email={}",
        base_url.trim_end_matches('/'),
        urlencoding::encode(email_address)
    )
}

fn substitute(
    source: &str,
    vars: &Map<String, Value>,
    unsubscribe_url: &str,
    escape: bool,
) -> Result<String, RenderError> {
    let mut out = String::with_capacity(source.len());
    let mut rest = source;
    let mut offset = 0;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or(RenderError::Unterminated(offset + start))?;
        let name = after[..end].trim();

        let value = match vars.get(name) {
            Some(value) => value_to_string(value),
            None if name == UNSUBSCRIBE_VARIABLE => unsubscribe_url.to_string(),
            None => return Err(RenderError::MissingVariable(name.to_string())),
        };
        if escape {
            out.push_str(&escape_html(&value));
        } else {
            out.push_str(&value);
        }

        let consumed = start + 2 + end + 2;
        offset += consumed;
        rest = &rest[consumed..];
    }
    out.push_str(rest);
    Ok(out)
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::template::EmailType;
    use serde_json::json;

    fn snapshot(html: &str) -> TemplateSnapshot {
        TemplateSnapshot {
            name: "welcome".to_string(),
            version: 1,
            subject: "Hi {{ first_name }}".to_string(),
            html_content: html.to_string(),
            text_content: Some("Hello {{first_name}}".to_string()),
            email_type: EmailType::Marketing,
            unsubscribe_placeholder: None,
        }
    }

    #[test]
    fn test_renders_all_parts() {
        let rendered = render_snapshot(
            &snapshot("<p>{{first_name}}</p>"),
            &json!({"first_name": "Ada"}),
            "https://x/unsub",
        )
        .unwrap();
        assert_eq!(rendered.subject, "Hi Ada");
        assert_eq!(rendered.html, "<p>Ada</p>");
        assert_eq!(rendered.text.as_deref(), Some("Hello Ada"));
    }

    #[test]
    fn test_html_values_are_escaped_but_subject_is_not() {
        let rendered = render_snapshot(
            &snapshot("<p>{{first_name}}</p>"),
            &json!({"first_name": "<b>Tom & Jerry</b>"}),
            "https://x/unsub",
        )
        .unwrap();
        assert_eq!(rendered.html, "<p>&lt;b&gt;Tom &amp; Jerry&lt;/b&gt;</p>");
        assert_eq!(rendered.subject, "Hi <b>Tom & Jerry</b>");
    }

    #[test]
    fn test_missing_variable_is_an_error() {
        let err = render_snapshot(&snapshot("<p>{{first_name}}</p>"), &json!({}), "u").unwrap_err();
        assert_eq!(err, RenderError::MissingVariable("first_name".to_string()));
    }

    #[test]
    fn test_non_string_values_are_stringified() {
        let rendered = render_snapshot(
            &snapshot("{{count}} jobs, remote={{remote}}"),
            &json!({"first_name": "A", "count": 3, "remote": true}),
            "u",
        )
        .unwrap();
        assert_eq!(rendered.html, "3 jobs, remote=true");
    }

    #[test]
    fn test_unterminated_placeholder() {
        let err = render_snapshot(&snapshot("<p>{{first_name</p>"), &json!({"first_name": "A"}), "u")
            .unwrap_err();
        assert!(matches!(err, RenderError::Unterminated(3)));
    }

    #[test]
    fn test_unsubscribe_url_builtin_and_placeholder() {
        let mut snap = snapshot("<a href=\"{{unsubscribe_url}}\">x</a> [[UNSUB]]");
        snap.unsubscribe_placeholder = Some("[[UNSUB]]".to_string());
        let rendered =
            render_snapshot(&snap, &json!({"first_name": "A"}), "https://x/u?email=a").unwrap();
        assert_eq!(
            rendered.html,
            "<a href=\"https://x/u?email=a\">x</a> https://x/u?email=a"
        );
    }

    #[test]
    fn test_braced_placeholder_is_not_a_missing_variable() {
        let mut snap = snapshot("<p>{{first_name}}</p><a href=\"{{unsub}}\">stop</a>");
        snap.text_content = Some("Stop: {{unsub}}".to_string());
        snap.unsubscribe_placeholder = Some("{{unsub}}".to_string());
        let rendered =
            render_snapshot(&snap, &json!({"first_name": "A"}), "https://x/u?email=a&b=1").unwrap();
        assert_eq!(
            rendered.html,
            "<p>A</p><a href=\"https://x/u?email=a&amp;b=1\">stop</a>"
        );
        assert_eq!(rendered.text.as_deref(), Some("Stop: https://x/u?email=a&b=1"));
    }

    #[test]
    fn test_variables_must_be_object() {
        let err = render_snapshot(&snapshot("x"), &json!([1, 2]), "u").unwrap_err();
        assert_eq!(err, RenderError::VariablesNotObject);
    }

    #[test]
    fn test_unsubscribe_link_encodes_address() {
        assert_eq!(
            unsubscribe_link("https://app.example.com/unsubscribe/", "a+b@x.io"),
            "https://app.example.com/unsubscribe?email=a%2Bb%40x.io"
        );
    }
}
