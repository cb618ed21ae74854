//! `{{object.property}}` substitution.

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::Value as JsonValue;

static TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([a-zA-Z0-9_]+)\.([a-zA-Z0-9_.]+)\s*\}\}")
        .expect("template token pattern is valid")
});

/// Replace every `{{object_type.path}}` token with the value found at `path` in
/// `data`.
///
/// Paths descend through nested objects (and array indices) by dots. A path
/// that resolves to nothing renders as an empty string; tokens naming another
/// object type are left as written. Inserted values are not scanned again.
pub fn render<'a>(template: &'a str, object_type: &str, data: &JsonValue) -> Cow<'a, str> {
    TOKEN.replace_all(template, |caps: &Captures<'_>| {
        if &caps[1] != object_type {
            return caps[0].to_string();
        }
        lookup(data, &caps[2]).map(display).unwrap_or_default()
    })
}

fn lookup<'v>(data: &'v JsonValue, path: &str) -> Option<&'v JsonValue> {
    path.split('.').try_fold(data, |value, segment| match value {
        JsonValue::Object(map) => map.get(segment),
        JsonValue::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn display(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => String::new(),
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn substitutes_matching_tokens() {
        let data = json!({ "name": "Acme", "amount": 1200, "closed": true });
        let out = render(
            "<h1>{{deal.name}}</h1><p>{{ deal.amount }} {{deal.closed}}</p>",
            "deal",
            &data,
        );
        assert_eq!(out, "<h1>Acme</h1><p>1200 true</p>");
    }

    #[test]
    fn nested_paths_and_array_indices() {
        let data = json!({
            "owner": { "email": "ops@example.com" },
            "lines": [{ "sku": "A-1" }, { "sku": "B-2" }],
        });
        assert_eq!(render("{{deal.owner.email}}", "deal", &data), "ops@example.com");
        assert_eq!(render("{{deal.lines.1.sku}}", "deal", &data), "B-2");
    }

    #[test]
    fn unknown_or_null_properties_render_empty() {
        let data = json!({ "name": null });
        let out = render("[{{deal.name}}][{{deal.missing}}][{{deal.a.b}}]", "deal", &data);
        assert_eq!(out, "[][][]");
    }

    #[test]
    fn other_object_types_are_untouched() {
        let data = json!({ "name": "Acme" });
        let out = render("{{contact.name}} / {{deal.name}}", "deal", &data);
        assert_eq!(out, "{{contact.name}} / Acme");
    }

    #[test]
    fn malformed_tokens_are_left_alone() {
        let data = json!({ "name": "Acme" });
        let template = "{{deal}} {{ .name }} {deal.name}";
        assert_eq!(render(template, "deal", &data), template);
    }

    proptest! {
        #[test]
        fn text_without_tokens_is_unchanged(text in "[^{}]*") {
            let out = render(&text, "deal", &json!({ "name": "x" }));
            prop_assert_eq!(out.as_ref(), text.as_str());
        }

        #[test]
        fn string_property_is_inserted_verbatim(
            key in "[a-z_][a-z0-9_]{0,12}",
            value in "\\PC{0,24}",
            prefix in "[^{}]{0,16}",
        ) {
            let data = json!({ key.clone(): value.clone() });
            let template = format!("{prefix}{{{{deal.{key}}}}}");
            let out = render(&template, "deal", &data);
            prop_assert_eq!(out.into_owned(), format!("{prefix}{value}"));
        }
    }
}
