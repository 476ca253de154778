//! Message text composition.

use serde_json::Value;

use super::{Item, Style};
use crate::util::{now_local_str, value_text};

/// Keys shown first in the `fields` style, in this order.
pub const TOP_FIELDS: [&str; 13] = [
    "event",
    "headline",
    "severity",
    "urgency",
    "certainty",
    "mag",
    "place",
    "distance_km_from_origin",
    "distance_km",
    "name",
    "layer",
    "title",
    "link",
];

/// Pick the text for one send. Only the first item is rendered by the
/// `fields` style and by templates; more than one item without either
/// yields a one-line batch summary.
pub fn compose_text(style: Style, title: &str, items: &[Item], template: Option<&str>) -> String {
    if let Some(first) = items.first() {
        if style == Style::Fields {
            return render_fields(first);
        }
        if let Some(t) = template {
            return render_template(t, first);
        }
    }
    if items.len() == 1 {
        return serde_json::to_string_pretty(&items[0]).unwrap_or_default();
    }
    format!(
        "**{title}**\nReceived {} items at {}.",
        items.len(),
        now_local_str()
    )
}

fn is_empty_value(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

pub fn render_fields(item: &Item) -> String {
    let mut lines = Vec::new();
    for k in TOP_FIELDS {
        if let Some(v) = item.get(k).filter(|v| !is_empty_value(v)) {
            lines.push(format!("- **{k}**: {}", value_text(v)));
        }
    }
    for (k, v) in item {
        if TOP_FIELDS.contains(&k.as_str()) || is_empty_value(v) {
            continue;
        }
        lines.push(format!("- **{k}**: {}", value_text(v)));
    }
    if lines.is_empty() {
        return serde_json::to_string_pretty(item).unwrap_or_default();
    }
    lines.join("\n")
}

/// `{key}` substitution; `{{`/`}}` are literal braces and missing keys
/// render empty. A malformed template yields the item as compact JSON.
pub fn render_template(template: &str, item: &Item) -> String {
    substitute(template, item).unwrap_or_else(|| serde_json::to_string(item).unwrap_or_default())
}

fn substitute(template: &str, item: &Item) -> Option<String> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut field = String::new();
                loop {
                    match chars.next()? {
                        '}' => break,
                        '{' => return None,
                        ch => field.push(ch),
                    }
                }
                // format spec / conversion suffixes are accepted and ignored
                let key = field.split([':', '!']).next().unwrap_or("");
                if key.is_empty() {
                    return None;
                }
                if let Some(v) = item.get(key) {
                    out.push_str(&value_text(v));
                }
            }
            '}' => return None,
            c => out.push(c),
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(v: Value) -> Item {
        match v {
            Value::Object(m) => m,
            _ => unreachable!(),
        }
    }

    #[test]
    fn template_substitutes_and_blanks_missing() {
        let it = item(json!({"event": "Flood Watch", "mag": 4.0}));
        assert_eq!(
            render_template("{event} / {mag} / {nope}!", &it),
            "Flood Watch / 4.0 / !"
        );
        assert_eq!(render_template("{{literal}} {event}", &it), "{literal} Flood Watch");
    }

    #[test]
    fn malformed_template_falls_back_to_json() {
        let it = item(json!({"a": 1}));
        assert_eq!(render_template("oops {a", &it), r#"{"a":1}"#);
        assert_eq!(render_template("stray } brace", &it), r#"{"a":1}"#);
        assert_eq!(render_template("positional {}", &it), r#"{"a":1}"#);
    }

    #[test]
    fn fields_style_puts_priority_keys_first() {
        let it = item(json!({
            "zeta": "z",
            "place": "10 km N of Somewhere",
            "mag": 3.1,
            "blank": "",
            "gone": null,
        }));
        let text = render_fields(&it);
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(
            lines,
            [
                "- **mag**: 3.1",
                "- **place**: 10 km N of Somewhere",
                "- **zeta**: z"
            ]
        );
    }

    #[test]
    fn fields_style_with_nothing_to_show_is_json() {
        let it = item(json!({"x": null}));
        assert_eq!(render_fields(&it), "{\n  \"x\": null\n}");
    }

    #[test]
    fn compose_picks_by_style_template_and_count() {
        let one = vec![item(json!({"event": "E"}))];
        assert_eq!(compose_text(Style::Fields, "t", &one, Some("{event}!")), "- **event**: E");
        assert_eq!(compose_text(Style::Markdown, "t", &one, Some("{event}!")), "E!");
        assert_eq!(
            compose_text(Style::Markdown, "t", &one, None),
            "{\n  \"event\": \"E\"\n}"
        );

        let two = vec![item(json!({"a": 1})), item(json!({"a": 2}))];
        let summary = compose_text(Style::Markdown, "USGS", &two, None);
        assert!(summary.starts_with("**USGS**\nReceived 2 items at "));
    }
}
