//! Service-method identifiers in URL form: `/group/service/method?k=v`.
//!
//! The registry is keyed by the path alone; the query travels with the
//! request and is surfaced through the server-side context.

use crate::error::{ErrorKind, RpcError};
use url::form_urlencoded;

/// Decoded query pairs of a service-method string.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query(Vec<(String, String)>);

impl Query {
    #[inline]
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self(pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }

    /// First value registered under `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    #[inline]
    pub fn pairs(&self) -> &[(String, String)] {
        &self.0
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Pluggable textual format of a service method.
///
/// Must be a bijection between `(path, query)` and the string form, up to
/// percent-encoding equivalence. Parse failures carry
/// [ErrorKind::InvalidServiceMethod] so the server can code-tag them.
pub trait UriFormat: Send + Sync + 'static {
    fn parse(&self, service_method: &str) -> Result<(String, Query), RpcError>;

    fn encode(&self, path: &str, query: &Query) -> String;

    /// Compose a registration path from name segments, lowercased.
    fn join(&self, segments: &[&str]) -> Result<String, RpcError>;
}

/// The default format: `path?query` with standard URL query conventions.
#[derive(Default)]
pub struct UrlFormat;

impl UriFormat for UrlFormat {
    fn parse(&self, service_method: &str) -> Result<(String, Query), RpcError> {
        let (path, qs) = match service_method.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (service_method, None),
        };
        if !path.starts_with('/') || path.len() < 2 {
            return Err(invalid(service_method));
        }
        if path.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(invalid(service_method));
        }
        let query = match qs {
            Some(qs) => Query(
                form_urlencoded::parse(qs.as_bytes())
                    .map(|(k, v)| (k.into_owned(), v.into_owned()))
                    .collect(),
            ),
            None => Query::default(),
        };
        Ok((path.to_string(), query))
    }

    fn encode(&self, path: &str, query: &Query) -> String {
        if query.is_empty() {
            return path.to_string();
        }
        let qs = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(query.pairs().iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .finish();
        format!("{}?{}", path, qs)
    }

    fn join(&self, segments: &[&str]) -> Result<String, RpcError> {
        let mut path = String::new();
        for seg in segments {
            check_name(seg)?;
            path.push('/');
            path.push_str(&seg.to_lowercase());
        }
        if path.is_empty() {
            return Err(invalid("(empty)"));
        }
        Ok(path)
    }
}

#[inline]
fn invalid(s: &str) -> RpcError {
    RpcError::new(ErrorKind::InvalidServiceMethod, format!("invalid service method '{}'", s))
}

/// Validate one name segment used in a registration path.
pub fn check_name(name: &str) -> Result<(), RpcError> {
    if name.is_empty() {
        return Err(RpcError::new(ErrorKind::InvalidServiceMethod, "empty service name"));
    }
    if name
        .chars()
        .any(|c| c.is_whitespace() || c.is_control() || matches!(c, '/' | '?' | '&' | '=' | '#'))
    {
        return Err(RpcError::new(
            ErrorKind::InvalidServiceMethod,
            format!("service name '{}' contains disallowed characters", name),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_path() {
        let f = UrlFormat;
        let (path, query) = f.parse("/arith/mul").expect("parse");
        assert_eq!(path, "/arith/mul");
        assert!(query.is_empty());
    }

    #[test]
    fn test_parse_with_query() {
        let f = UrlFormat;
        let (path, query) = f.parse("/arith/mul?ver=2&tag=a%20b").expect("parse");
        assert_eq!(path, "/arith/mul");
        assert_eq!(query.get("ver"), Some("2"));
        assert_eq!(query.get("tag"), Some("a b"));
        assert_eq!(query.get("nope"), None);
    }

    #[test]
    fn test_parse_rejects() {
        let f = UrlFormat;
        assert!(f.parse("arith/mul").is_err());
        assert!(f.parse("/").is_err());
        assert!(f.parse("/a b/c").is_err());
        let err = f.parse("no-slash").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidServiceMethod);
    }

    #[test]
    fn test_encode_round_trip() {
        let f = UrlFormat;
        let query = Query::from_pairs([("ver", "2"), ("tag", "a b")]);
        let s = f.encode("/arith/mul", &query);
        let (path, back) = f.parse(&s).expect("parse");
        assert_eq!(path, "/arith/mul");
        assert_eq!(back, query);

        assert_eq!(f.encode("/arith/mul", &Query::default()), "/arith/mul");
    }

    #[test]
    fn test_join_lowercases() {
        let f = UrlFormat;
        assert_eq!(f.join(&["Arith", "Mul"]).expect("join"), "/arith/mul");
        assert!(f.join(&["a/b"]).is_err());
        assert!(f.join(&[]).is_err());
    }

    #[test]
    fn test_check_name() {
        assert!(check_name("arith").is_ok());
        assert!(check_name("").is_err());
        assert!(check_name("a b").is_err());
        assert!(check_name("a?b").is_err());
    }
}
