//! Route templates such as `/api/order/{orderId:long}/items`.

use std::fmt;

use crate::service::entry::DescriptorError;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    /// Lower-cased literal; matched ignoring ASCII case.
    Literal(String),
    Param {
        name: String,
        constraint: Option<String>,
    },
}

/// A parsed route template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTemplate {
    template: String,
    segments: Vec<Segment>,
}

impl RouteTemplate {
    /// Parses `template`.
    ///
    /// # Errors
    ///
    /// Returns [`DescriptorError::InvalidRoute`] for empty or unbalanced
    /// `{}` segments.
    pub fn parse(template: &str) -> Result<Self, DescriptorError> {
        let invalid = |reason: &str| DescriptorError::InvalidRoute {
            template: template.to_string(),
            reason: reason.to_string(),
        };

        let mut segments = Vec::new();
        for raw in template.split('/').filter(|s| !s.is_empty()) {
            if let Some(inner) = raw.strip_prefix('{') {
                let inner = inner
                    .strip_suffix('}')
                    .ok_or_else(|| invalid("unterminated parameter segment"))?;
                let (name, constraint) = match inner.split_once(':') {
                    Some((name, constraint)) => (name.trim(), Some(constraint.trim().to_ascii_lowercase())),
                    None => (inner.trim(), None),
                };
                if name.is_empty() {
                    return Err(invalid("parameter segment without a name"));
                }
                segments.push(Segment::Param {
                    name: name.to_string(),
                    constraint,
                });
            } else if raw.contains('{') || raw.contains('}') {
                return Err(invalid("braces must enclose a whole segment"));
            } else {
                segments.push(Segment::Literal(raw.to_ascii_lowercase()));
            }
        }

        Ok(Self {
            template: format!("/{}", template.trim_matches('/')),
            segments,
        })
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.template
    }

    /// Names of the parameter segments, in order.
    pub fn param_names(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Param { name, .. } => Some(name.as_str()),
            Segment::Literal(_) => None,
        })
    }

    /// Number of literal segments. More literals means a more specific route.
    #[must_use]
    pub fn specificity(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| matches!(s, Segment::Literal(_)))
            .count()
    }

    /// Normalized shape used for duplicate detection: parameter names and
    /// constraints do not distinguish two routes.
    #[must_use]
    pub fn shape(&self) -> String {
        let parts: Vec<&str> = self
            .segments
            .iter()
            .map(|s| match s {
                Segment::Literal(lit) => lit.as_str(),
                Segment::Param { .. } => "{}",
            })
            .collect();
        format!("/{}", parts.join("/"))
    }

    /// Matches `path` and returns captured `(name, raw value)` pairs.
    #[must_use]
    pub fn matches(&self, path: &str) -> Option<Vec<(String, String)>> {
        let path = path.split('?').next().unwrap_or_default();
        let parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        if parts.len() != self.segments.len() {
            return None;
        }

        let mut captured = Vec::new();
        for (segment, part) in self.segments.iter().zip(parts) {
            match segment {
                Segment::Literal(lit) => {
                    if !lit.eq_ignore_ascii_case(part) {
                        return None;
                    }
                }
                Segment::Param { name, constraint } => {
                    if !satisfies(constraint.as_deref(), part) {
                        return None;
                    }
                    captured.push((name.clone(), part.to_string()));
                }
            }
        }
        Some(captured)
    }

    /// Fills parameter segments with `values`, looked up ignoring case.
    /// Unknown parameters render as empty segments.
    #[must_use]
    pub fn render(&self, values: &[(String, String)]) -> String {
        let parts: Vec<&str> = self
            .segments
            .iter()
            .map(|s| match s {
                Segment::Literal(lit) => lit.as_str(),
                Segment::Param { name, .. } => values
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(name))
                    .map_or("", |(_, v)| v.as_str()),
            })
            .collect();
        format!("/{}", parts.join("/"))
    }
}

fn satisfies(constraint: Option<&str>, raw: &str) -> bool {
    match constraint {
        Some("int" | "long") => raw.parse::<i64>().is_ok(),
        Some("bool") => raw.eq_ignore_ascii_case("true") || raw.eq_ignore_ascii_case("false"),
        Some("double" | "float" | "decimal") => raw.parse::<f64>().is_ok(),
        _ => true,
    }
}

impl fmt::Display for RouteTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.template)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_literals_ignoring_case() {
        let route = RouteTemplate::parse("api/Order/{id}").unwrap();
        assert_eq!(route.as_str(), "/api/Order/{id}");
        let captured = route.matches("/API/order/17").unwrap();
        assert_eq!(captured, vec![("id".to_string(), "17".to_string())]);
        assert!(route.matches("/api/order").is_none());
        assert!(route.matches("/api/basket/17").is_none());
    }

    #[test]
    fn constraints_filter_matches() {
        let route = RouteTemplate::parse("/api/order/{id:long}").unwrap();
        assert!(route.matches("/api/order/42").is_some());
        assert!(route.matches("/api/order/abc").is_none());
    }

    #[test]
    fn query_string_is_ignored() {
        let route = RouteTemplate::parse("/api/order/{id}").unwrap();
        assert!(route.matches("/api/order/3?expand=true").is_some());
    }

    #[test]
    fn rejects_malformed_templates() {
        assert!(RouteTemplate::parse("/api/{}").is_err());
        assert!(RouteTemplate::parse("/api/{id").is_err());
        assert!(RouteTemplate::parse("/api/x{id}").is_err());
    }

    #[test]
    fn shape_ignores_parameter_names() {
        let a = RouteTemplate::parse("/api/order/{id}").unwrap();
        let b = RouteTemplate::parse("/API/order/{orderId:long}").unwrap();
        assert_eq!(a.shape(), b.shape());
        assert_eq!(a.specificity(), 2);
    }

    #[test]
    fn render_fills_parameters() {
        let route = RouteTemplate::parse("/api/order/{id}/lines/{line}").unwrap();
        let path = route.render(&[("ID".into(), "5".into()), ("line".into(), "2".into())]);
        assert_eq!(path, "/api/order/5/lines/2");
        assert!(route.matches(&path).is_some());
    }
}
