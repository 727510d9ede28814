//! Cache-key templates.
//!
//! A template such as `"order:{orderId}:{tenant}"` names the fragments that
//! make up a cache or correlation key. Token names are matched against
//! parameter and property names ignoring ASCII case; numeric tokens such as
//! `{0}` select a fragment by its declared position instead.

use std::sync::OnceLock;

use regex::Regex;

/// A named fragment extracted from one bound argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKeyFragment {
    pub name: String,
    pub value: String,
    /// Declared position for positional (`{0}`) tokens, if any.
    pub position: Option<usize>,
}

fn token_regex() -> &'static Regex {
    static TOKEN: OnceLock<Regex> = OnceLock::new();
    TOKEN.get_or_init(|| Regex::new(r"\{([^{}]+)\}").expect("static token pattern is valid"))
}

/// Returns the token names of `template` in order of appearance.
#[must_use]
pub fn template_tokens(template: &str) -> Vec<String> {
    token_regex()
        .captures_iter(template)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|name| !name.is_empty())
        .collect()
}

/// Collects the distinct token names across `templates`, keeping first-seen
/// order and ignoring ASCII case when deduplicating.
#[must_use]
pub fn tokens_of(templates: &[String]) -> Vec<String> {
    let mut seen: Vec<String> = Vec::new();
    for token in templates.iter().flat_map(|t| template_tokens(t)) {
        if !seen.iter().any(|s| s.eq_ignore_ascii_case(&token)) {
            seen.push(token);
        }
    }
    seen
}

/// Renders `template`, substituting each token with the fragment of the same
/// name (or, for numeric tokens, the same position). Tokens without a
/// fragment render as an empty string.
#[must_use]
pub fn render_cache_key(template: &str, fragments: &[CacheKeyFragment]) -> String {
    token_regex()
        .replace_all(template, |caps: &regex::Captures<'_>| {
            let name = caps.get(1).map_or("", |m| m.as_str().trim());
            let position = name.parse::<usize>().ok();
            fragments
                .iter()
                .find(|f| match position {
                    Some(pos) => f.position == Some(pos),
                    None => f.name.eq_ignore_ascii_case(name),
                })
                .map(|f| f.value.clone())
                .unwrap_or_default()
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn fragment(name: &str, value: &str) -> CacheKeyFragment {
        CacheKeyFragment {
            name: name.to_string(),
            value: value.to_string(),
            position: None,
        }
    }

    #[test]
    fn extracts_tokens_in_order() {
        assert_eq!(
            template_tokens("order:{orderId}:{ tenant }"),
            vec!["orderId".to_string(), "tenant".to_string()]
        );
        assert!(template_tokens("no tokens").is_empty());
        assert!(template_tokens("{}").is_empty());
    }

    #[test]
    fn tokens_of_dedups_case_insensitively() {
        let templates = vec!["a:{Id}".to_string(), "b:{id}:{name}".to_string()];
        assert_eq!(tokens_of(&templates), vec!["Id".to_string(), "name".to_string()]);
    }

    #[test]
    fn render_matches_ignoring_case() {
        let key = render_cache_key("order:{OrderId}", &[fragment("orderid", "17")]);
        assert_eq!(key, "order:17");
    }

    #[test]
    fn render_blanks_unmatched_tokens() {
        let key = render_cache_key("order:{orderId}:{missing}", &[fragment("orderId", "5")]);
        assert_eq!(key, "order:5:");
    }

    #[test]
    fn render_positional_tokens() {
        let fragments = vec![
            CacheKeyFragment {
                name: "tenant".to_string(),
                value: "acme".to_string(),
                position: Some(1),
            },
            CacheKeyFragment {
                name: "id".to_string(),
                value: "9".to_string(),
                position: Some(0),
            },
        ];
        assert_eq!(render_cache_key("user:{0}:{1}", &fragments), "user:9:acme");
    }

    proptest! {
        #[test]
        fn render_never_panics_on_arbitrary_templates(template in ".{0,64}", value in "[a-z0-9]{0,8}") {
            let _ = render_cache_key(&template, &[fragment("id", &value)]);
        }
    }
}
