//! Object-store URL handling.
//!
//! Recognizes `s3://bucket/key` and `s3a://bucket/key`. Directory URLs are
//! normalized so the key always ends in `/`.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{GlaiveError, Result};

/// Environment variable holding an optional object-store endpoint override.
pub const ENDPOINT_ENV: &str = "AWS_ENDPOINT";

static S3_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(s3a?)://([^/?#]+)/*([^?#]*)$").expect("static regex is valid")
});

/// A parsed object-store URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectUrl {
    pub scheme: String,
    pub bucket: String,
    pub key: String,
}

impl ObjectUrl {
    /// Parse an `s3://` or `s3a://` URL.
    pub fn parse(url: &str) -> Result<Self> {
        let captures = S3_URL
            .captures(url)
            .ok_or_else(|| GlaiveError::invalid_argument(format!("invalid s3 url: {url:?}")))?;

        Ok(ObjectUrl {
            scheme: captures[1].to_string(),
            bucket: captures[2].to_string(),
            key: captures[3].to_string(),
        })
    }

    /// Parse a directory URL; the key is normalized to end in `/`.
    pub fn parse_dir(url: &str) -> Result<Self> {
        let mut parsed = Self::parse(url)?;
        if !parsed.key.ends_with('/') {
            parsed.key.push('/');
        }
        Ok(parsed)
    }
}

impl fmt::Display for ObjectUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}/{}", self.scheme, self.bucket, self.key)
    }
}

/// Whether `path` addresses the object store rather than the local filesystem.
pub fn is_object_store_url(path: &str) -> bool {
    path.starts_with("s3://") || path.starts_with("s3a://")
}

/// Rewrite an `s3a://` URL to the `s3://` form understood by cloud tooling.
/// Other paths are returned unchanged.
pub fn use_s3(path: &str) -> String {
    match path.strip_prefix("s3a://") {
        Some(rest) => format!("s3://{rest}"),
        None => path.to_string(),
    }
}

/// Append a trailing `/` unless already present.
pub fn ensure_dir(path: &str) -> String {
    if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{path}/")
    }
}

/// Normalize an endpoint override, prepending `http://` when no protocol is given.
pub fn normalize_endpoint(endpoint: Option<String>) -> Option<String> {
    endpoint.map(|endpoint| {
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            endpoint
        } else {
            format!("http://{endpoint}")
        }
    })
}

/// Endpoint override from [`ENDPOINT_ENV`], if any.
pub fn endpoint_from_env() -> Option<String> {
    normalize_endpoint(std::env::var(ENDPOINT_ENV).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_s3_and_s3a() {
        let url = ObjectUrl::parse("s3://models/exp/faiss/part_2_0.dat").unwrap();
        assert_eq!(url.scheme, "s3");
        assert_eq!(url.bucket, "models");
        assert_eq!(url.key, "exp/faiss/part_2_0.dat");

        let url = ObjectUrl::parse("s3a://models/exp").unwrap();
        assert_eq!(url.scheme, "s3a");
        assert_eq!(url.key, "exp");
    }

    #[test]
    fn test_parse_rejects_other_schemes() {
        assert!(ObjectUrl::parse("http://models/exp").is_err());
        assert!(ObjectUrl::parse("/local/path").is_err());
    }

    #[test]
    fn test_parse_dir_appends_slash() {
        let url = ObjectUrl::parse_dir("s3://models/exp/faiss").unwrap();
        assert_eq!(url.key, "exp/faiss/");
        assert_eq!(url.to_string(), "s3://models/exp/faiss/");

        let url = ObjectUrl::parse_dir("s3://models/exp/faiss/").unwrap();
        assert_eq!(url.key, "exp/faiss/");

        let url = ObjectUrl::parse_dir("s3://models").unwrap();
        assert_eq!(url.key, "/");
    }

    #[test]
    fn test_use_s3() {
        assert_eq!(use_s3("s3a://b/k/"), "s3://b/k/");
        assert_eq!(use_s3("s3://b/k/"), "s3://b/k/");
        assert_eq!(use_s3("/tmp/out/"), "/tmp/out/");
    }

    #[test]
    fn test_normalize_endpoint() {
        assert_eq!(
            normalize_endpoint(Some("minio:9000".to_string())),
            Some("http://minio:9000".to_string())
        );
        assert_eq!(
            normalize_endpoint(Some("https://s3.example.com".to_string())),
            Some("https://s3.example.com".to_string())
        );
        assert_eq!(normalize_endpoint(None), None);
    }

    #[test]
    fn test_is_object_store_url() {
        assert!(is_object_store_url("s3://a/b"));
        assert!(is_object_store_url("s3a://a/b"));
        assert!(!is_object_store_url("/a/b"));
    }
}
