//! Path matching and the compiled route table.
//!
//! Patterns are split on `/` and compared segment by segment against the
//! request path. A segment is a literal, a `*` wildcard, or a `{name}`
//! capture.

use crate::config::{Route, RouteMap};
use std::collections::HashMap;

/// A compiled URL pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPattern {
    raw: String,
    segments: Vec<Segment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Wildcard,
    Param(String),
}

impl PathPattern {
    /// Compile a pattern such as `/users/{id}/posts/*`.
    pub fn parse(pattern: &str) -> Self {
        let segments = pattern
            .split('/')
            .map(|segment| {
                if segment == "*" {
                    Segment::Wildcard
                } else if let Some(name) = segment
                    .strip_prefix('{')
                    .and_then(|rest| rest.strip_suffix('}'))
                {
                    Segment::Param(name.to_string())
                } else {
                    Segment::Literal(segment.to_string())
                }
            })
            .collect();

        Self {
            raw: pattern.to_string(),
            segments,
        }
    }

    /// The pattern as authored.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Match a request path, returning captured parameters on success.
    pub fn matches(&self, path: &str) -> Option<HashMap<String, String>> {
        let parts: Vec<&str> = path.split('/').collect();
        if parts.len() != self.segments.len() {
            return None;
        }

        let mut params = HashMap::new();
        for (segment, part) in self.segments.iter().zip(parts) {
            match segment {
                Segment::Wildcard => {}
                Segment::Param(name) => {
                    params.insert(name.clone(), part.to_string());
                }
                Segment::Literal(lit) => {
                    if lit.as_str() != part {
                        return None;
                    }
                }
            }
        }
        Some(params)
    }
}

/// Match `path` against `pattern` without keeping the compiled form.
pub fn match_path(path: &str, pattern: &str) -> Option<HashMap<String, String>> {
    PathPattern::parse(pattern).matches(path)
}

/// Method buckets for one pattern.
#[derive(Debug, Clone)]
pub struct PatternEntry {
    pub pattern: PathPattern,
    /// Lower-cased method → ordered routes
    pub methods: HashMap<String, Vec<Route>>,
}

/// Result of looking up a request path in the table.
#[derive(Debug)]
pub struct PathMatch<'a> {
    pub entry: &'a PatternEntry,
    pub params: HashMap<String, String>,
}

impl<'a> PathMatch<'a> {
    /// Routes registered for `method` (matched case-insensitively).
    pub fn routes(&self, method: &str) -> Option<&'a [Route]> {
        self.entry
            .methods
            .get(&method.to_lowercase())
            .map(Vec::as_slice)
    }
}

/// Immutable, compiled route table. One instance per configuration load.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    entries: Vec<PatternEntry>,
    exact: HashMap<String, usize>,
}

impl RouteTable {
    /// Compile a route map. Methods are expected to be lower-cased already.
    pub fn new(routes: RouteMap) -> Self {
        let mut entries: Vec<PatternEntry> = routes
            .into_iter()
            .map(|(pattern, methods)| PatternEntry {
                pattern: PathPattern::parse(&pattern),
                methods,
            })
            .collect();
        entries.sort_by(|a, b| a.pattern.as_str().cmp(b.pattern.as_str()));

        let exact = entries
            .iter()
            .enumerate()
            .map(|(i, entry)| (entry.pattern.as_str().to_string(), i))
            .collect();

        Self { entries, exact }
    }

    /// Number of patterns in the table.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All compiled entries, in lookup order.
    pub fn entries(&self) -> &[PatternEntry] {
        &self.entries
    }

    /// Find the pattern matching `path`.
    ///
    /// A pattern authored exactly as the request path is preferred; otherwise
    /// patterns are tried in lexical order and the first match wins.
    pub fn find(&self, path: &str) -> Option<PathMatch<'_>> {
        if let Some(&idx) = self.exact.get(path) {
            let entry = &self.entries[idx];
            if let Some(params) = entry.pattern.matches(path) {
                return Some(PathMatch { entry, params });
            }
        }

        self.entries.iter().find_map(|entry| {
            entry
                .pattern
                .matches(path)
                .map(|params| PathMatch { entry, params })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(name: &str) -> Route {
        Route {
            name: Some(name.to_string()),
            ..Route::default()
        }
    }

    fn table(patterns: &[&str]) -> RouteTable {
        let routes = patterns
            .iter()
            .map(|p| {
                let mut methods = HashMap::new();
                methods.insert("get".to_string(), vec![route(p)]);
                (p.to_string(), methods)
            })
            .collect();
        RouteTable::new(routes)
    }

    #[test]
    fn test_literal_segments() {
        assert!(match_path("/api/users", "/api/users").is_some());
        assert!(match_path("/api/Users", "/api/users").is_none());
        assert!(match_path("/api/posts", "/api/users").is_none());
    }

    #[test]
    fn test_named_capture() {
        let params = match_path("/users/42", "/users/{id}").unwrap();
        assert_eq!(params.get("id").map(String::as_str), Some("42"));

        let params = match_path("/users/7/posts/99", "/users/{user}/posts/{post}").unwrap();
        assert_eq!(params["user"], "7");
        assert_eq!(params["post"], "99");
    }

    #[test]
    fn test_wildcard_does_not_capture() {
        let params = match_path("/files/report.pdf", "/files/*").unwrap();
        assert!(params.is_empty());
    }

    #[test]
    fn test_segment_count_must_match() {
        assert!(match_path("/users/42/extra", "/users/{id}").is_none());
        assert!(match_path("/users", "/users/{id}").is_none());
        assert!(match_path("/a/b/c", "/*/*").is_none());
        // trailing slash adds an empty segment
        assert!(match_path("/users/", "/users").is_none());
    }

    #[test]
    fn test_empty_segment_binds_empty_param() {
        let params = match_path("/users/", "/users/{id}").unwrap();
        assert_eq!(params["id"], "");
    }

    #[test]
    fn test_failed_match_has_no_bindings() {
        assert_eq!(match_path("/users/42/edit", "/users/{id}/view"), None);
    }

    #[test]
    fn test_exact_pattern_preferred() {
        let table = table(&["/users/{id}", "/users/me"]);
        let found = table.find("/users/me").unwrap();
        assert_eq!(found.entry.pattern.as_str(), "/users/me");
        assert!(found.params.is_empty());

        let found = table.find("/users/42").unwrap();
        assert_eq!(found.entry.pattern.as_str(), "/users/{id}");
        assert_eq!(found.params["id"], "42");
    }

    #[test]
    fn test_unknown_path() {
        let table = table(&["/ping"]);
        assert!(table.find("/unknown").is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_method_lookup_is_case_insensitive() {
        let table = table(&["/ping"]);
        let found = table.find("/ping").unwrap();
        assert!(found.routes("GET").is_some());
        assert!(found.routes("post").is_none());
    }
}
