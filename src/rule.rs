//! Request rewrite rules
//!
//! A backend's config carries an ordered list of rules. Before a request is
//! forwarded, the single-host rewrite runs first and then every rule runs in
//! declaration order, each seeing the request as the previous step left it.

use hyper::http::request::Parts;
use hyper::http::uri::{Authority, PathAndQuery, Scheme};
use hyper::http::{Uri, Version};
use serde::{Deserialize, Deserializer};

#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("invalid rewritten uri: {0}")]
    InvalidUri(#[from] hyper::http::Error),
    #[error("invalid rewritten uri: {0}")]
    InvalidUriParts(#[from] hyper::http::uri::InvalidUriParts),
    #[error("invalid rewritten path: {0}")]
    InvalidPath(#[from] hyper::http::uri::InvalidUri),
    #[error("target uri has no scheme or authority: {0}")]
    IncompleteTarget(Uri),
}

/// One step that mutates the outbound request
pub trait RequestUpdater: Send + Sync {
    fn direct(&self, parts: &mut Parts) -> Result<(), RuleError>;
}

/// Rules a backend can declare, tagged by `name` in the config document
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum Rule {
    ReplacePath(ReplacePath),
}

impl RequestUpdater for Rule {
    fn direct(&self, parts: &mut Parts) -> Result<(), RuleError> {
        match self {
            Rule::ReplacePath(rule) => rule.direct(parts),
        }
    }
}

/// Replaces up to `times` occurrences of `search` in the request path.
/// A negative `times` replaces every occurrence. A rule without `times`
/// replaces nothing, so configs must say how many occurrences they mean.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ReplacePath {
    pub search: String,
    pub replace: String,
    #[serde(default)]
    pub times: i64,
}

impl ReplacePath {
    pub fn new(search: impl Into<String>, replace: impl Into<String>, times: i64) -> Self {
        Self {
            search: search.into(),
            replace: replace.into(),
            times,
        }
    }

    fn apply(&self, path: &str) -> String {
        match usize::try_from(self.times) {
            Ok(n) => path.replacen(&self.search, &self.replace, n),
            Err(_) => path.replace(&self.search, &self.replace),
        }
    }
}

impl RequestUpdater for ReplacePath {
    fn direct(&self, parts: &mut Parts) -> Result<(), RuleError> {
        let path = self.apply(parts.uri.path());
        parts.uri = replace_path(&parts.uri, &path)?;
        Ok(())
    }
}

/// Ordered rule list as found in a config document.
///
/// Accepts either a bare list of rules or `{"request_updaters": [...]}`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Rules(Vec<Rule>);

impl Rules {
    pub fn as_slice(&self) -> &[Rule] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<Rule>> for Rules {
    fn from(rules: Vec<Rule>) -> Self {
        Self(rules)
    }
}

impl<'de> Deserialize<'de> for Rules {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Shape {
            List(Vec<serde_json::Value>),
            Grouped {
                #[serde(default)]
                request_updaters: Vec<serde_json::Value>,
            },
        }

        let raw = match Option::<Shape>::deserialize(deserializer)? {
            None => return Ok(Self::default()),
            Some(Shape::List(raw)) => raw,
            Some(Shape::Grouped { request_updaters }) => request_updaters,
        };

        // decode each entry separately so an unknown rule name is reported as such
        raw.into_iter()
            .map(|value| serde_json::from_value::<Rule>(value).map_err(serde::de::Error::custom))
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }
}

/// Points the request at a single backend: scheme and authority come from
/// the target, the path is the target's path (the inbound path is cleared
/// first so it is not merged twice), the query is kept.
#[derive(Debug, Clone)]
pub struct SingleHost {
    scheme: Scheme,
    authority: Authority,
    path: String,
}

impl SingleHost {
    pub fn new(target: &Uri) -> Result<Self, RuleError> {
        match (target.scheme(), target.authority()) {
            (Some(scheme), Some(authority)) => Ok(Self {
                scheme: scheme.clone(),
                authority: authority.clone(),
                path: target.path().to_string(),
            }),
            _ => Err(RuleError::IncompleteTarget(target.clone())),
        }
    }
}

impl RequestUpdater for SingleHost {
    fn direct(&self, parts: &mut Parts) -> Result<(), RuleError> {
        let path_and_query = match parts.uri.query() {
            Some(query) => format!("{}?{}", self.path, query),
            None => self.path.clone(),
        };

        parts.uri = Uri::builder()
            .scheme(self.scheme.clone())
            .authority(self.authority.clone())
            .path_and_query(path_and_query)
            .build()?;

        // the upstream pool speaks HTTP/1.1 whatever the client used
        parts.version = Version::HTTP_11;
        Ok(())
    }
}

/// The full director for one request: the single-host rewrite, then `rules`
pub struct DirectorChain<'a> {
    base: SingleHost,
    rules: &'a [Rule],
}

impl<'a> DirectorChain<'a> {
    pub fn new(target: &Uri, rules: &'a [Rule]) -> Result<Self, RuleError> {
        Ok(Self {
            base: SingleHost::new(target)?,
            rules,
        })
    }

    pub fn direct(&self, parts: &mut Parts) -> Result<(), RuleError> {
        std::iter::once(&self.base as &dyn RequestUpdater)
            .chain(self.rules.iter().map(|rule| rule as &dyn RequestUpdater))
            .try_for_each(|director| director.direct(parts))
    }
}

fn replace_path(uri: &Uri, path: &str) -> Result<Uri, RuleError> {
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    };
    let path_and_query = match uri.query() {
        Some(query) => format!("{}?{}", path, query),
        None => path,
    };

    let mut parts = uri.clone().into_parts();
    parts.path_and_query = Some(PathAndQuery::try_from(path_and_query)?);
    Ok(Uri::from_parts(parts)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::Request;

    fn parts_for(uri: &str) -> Parts {
        Request::builder().uri(uri).body(()).unwrap().into_parts().0
    }

    fn rewrite(target: &str, rules: &[Rule], inbound: &str) -> Uri {
        let target: Uri = target.parse().unwrap();
        let mut parts = parts_for(inbound);
        DirectorChain::new(&target, rules)
            .unwrap()
            .direct(&mut parts)
            .unwrap();
        parts.uri
    }

    #[test]
    fn test_single_host_rewrite() {
        let uri = rewrite("http://10.0.0.2:8000/api/users", &[], "/api/users?page=2");
        assert_eq!(uri.to_string(), "http://10.0.0.2:8000/api/users?page=2");
    }

    #[test]
    fn test_single_host_sets_http11() {
        let target: Uri = "http://10.0.0.2:8000/".parse().unwrap();
        let mut parts = Request::builder()
            .uri("/")
            .version(Version::HTTP_2)
            .body(())
            .unwrap()
            .into_parts()
            .0;

        SingleHost::new(&target).unwrap().direct(&mut parts).unwrap();
        assert_eq!(parts.version, Version::HTTP_11);
    }

    #[test]
    fn test_single_host_requires_absolute_target() {
        let target: Uri = "/relative".parse().unwrap();
        assert!(matches!(
            SingleHost::new(&target),
            Err(RuleError::IncompleteTarget(_))
        ));
    }

    #[test]
    fn test_replace_path_first_occurrence() {
        let rules = [Rule::ReplacePath(ReplacePath::new("/a", "/b", 1))];
        let uri = rewrite("http://10.0.0.2:8000/a/a", &rules, "/a/a");
        assert_eq!(uri.path(), "/b/a");
    }

    #[test]
    fn test_replace_path_all_occurrences() {
        let rules = [Rule::ReplacePath(ReplacePath::new("/a", "/b", -1))];
        let uri = rewrite("http://10.0.0.2:8000/a/a", &rules, "/a/a");
        assert_eq!(uri.path(), "/b/b");
    }

    #[test]
    fn test_replace_path_zero_times_is_noop() {
        let rules = [Rule::ReplacePath(ReplacePath::new("/a", "/b", 0))];
        let uri = rewrite("http://10.0.0.2:8000/a/a", &rules, "/a/a");
        assert_eq!(uri.path(), "/a/a");
    }

    #[test]
    fn test_replace_path_keeps_query_and_authority() {
        let rules = [Rule::ReplacePath(ReplacePath::new("/service1", "", 1))];
        let uri = rewrite(
            "http://10.0.0.2:8000/service1/items",
            &rules,
            "/service1/items?sort=asc",
        );
        assert_eq!(uri.to_string(), "http://10.0.0.2:8000/items?sort=asc");
    }

    #[test]
    fn test_replace_path_to_empty_keeps_root() {
        let rules = [Rule::ReplacePath(ReplacePath::new("/service1", "", -1))];
        let uri = rewrite("http://10.0.0.2:8000/service1", &rules, "/service1");
        assert_eq!(uri.path(), "/");
    }

    #[test]
    fn test_rules_apply_in_declaration_order() {
        let rules = [
            Rule::ReplacePath(ReplacePath::new("/a", "/b", 1)),
            Rule::ReplacePath(ReplacePath::new("/b", "/c", 1)),
        ];
        let uri = rewrite("http://10.0.0.2:8000/a", &rules, "/a");
        assert_eq!(uri.path(), "/c");
    }

    #[test]
    fn test_rules_decode_list() {
        let json = r#"[{"name": "replace_path", "search": "/x", "replace": "/y", "times": 1}]"#;
        let rules: Rules = serde_json::from_str(json).unwrap();
        assert_eq!(
            rules.as_slice(),
            &[Rule::ReplacePath(ReplacePath::new("/x", "/y", 1))]
        );
    }

    #[test]
    fn test_rules_decode_grouped() {
        let json = r#"{
            "request_updaters": [
                {"name": "replace_path", "search": "/service1", "replace": "/", "times": -1}
            ]
        }"#;
        let rules: Rules = serde_json::from_str(json).unwrap();
        assert_eq!(rules.len(), 1);
    }

    #[test]
    fn test_rules_missing_times_replaces_nothing() {
        let json = r#"[{"name": "replace_path", "search": "/x", "replace": "/y"}]"#;
        let rules: Rules = serde_json::from_str(json).unwrap();
        assert_eq!(
            rules.as_slice(),
            &[Rule::ReplacePath(ReplacePath::new("/x", "/y", 0))]
        );

        let uri = rewrite("http://10.0.0.2:8000/x", rules.as_slice(), "/x");
        assert_eq!(uri.path(), "/x");
    }

    #[test]
    fn test_rules_null_is_empty() {
        let rules: Rules = serde_json::from_str("null").unwrap();
        assert!(rules.is_empty());
    }

    #[test]
    fn test_rules_reject_unknown_name() {
        let json = r#"[{"name": "strip_headers"}]"#;
        let err = serde_json::from_str::<Rules>(json).unwrap_err();
        assert!(err.to_string().contains("strip_headers"));
    }
}
