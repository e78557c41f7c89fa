//! Target URL decomposition into host, path and campaign tags.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

pub const UTM_SOURCE: &str = "utm_source";
pub const UTM_MEDIUM: &str = "utm_medium";
pub const UTM_CAMPAIGN: &str = "utm_campaign";
pub const UTM_TERM: &str = "utm_term";
pub const UTM_CONTENT: &str = "utm_content";

#[derive(Debug, Error)]
#[error("malformed url {url:?}: {source}")]
pub struct DecomposeError {
    pub url: String,
    #[source]
    pub source: url::ParseError,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlParts {
    pub host: String,
    pub path: String,
    pub utm_source: String,
    pub utm_medium: String,
    pub utm_campaign: String,
    pub utm_term: String,
    pub utm_content: String,
}

/// Split an absolute URL into host, path and the five utm_* parameters.
///
/// Host and path are cut from the input text as written: the host keeps its case
/// and any port, the path keeps dot segments and is only percent-decoded. For every
/// utm_* name the first value wins; a missing parameter becomes the empty string.
pub fn decompose(long_url: &str) -> Result<UrlParts, DecomposeError> {
    let parsed = Url::parse(long_url).map_err(|source| DecomposeError {
        url: long_url.to_string(),
        source,
    })?;

    let (host, raw_path) = split_host_path(long_url);
    let path = urlencoding::decode(raw_path)
        .map(|decoded| decoded.into_owned())
        .unwrap_or_else(|_| raw_path.to_string());

    let query = query_values(&parsed);
    let first = |name: &str| {
        query
            .get(name)
            .and_then(|values| values.first())
            .cloned()
            .unwrap_or_default()
    };

    Ok(UrlParts {
        host: host.to_string(),
        path,
        utm_source: first(UTM_SOURCE),
        utm_medium: first(UTM_MEDIUM),
        utm_campaign: first(UTM_CAMPAIGN),
        utm_term: first(UTM_TERM),
        utm_content: first(UTM_CONTENT),
    })
}

// Authority without userinfo, and the raw path up to the query or fragment.
// Only called on text that already parsed as an absolute URL.
fn split_host_path(long_url: &str) -> (&str, &str) {
    let text = long_url.trim_matches(|c: char| c <= ' ');
    let after_scheme = text.split_once(':').map_or("", |(_, rest)| rest);
    let end = after_scheme.find(['?', '#']).unwrap_or(after_scheme.len());
    let hierarchy = &after_scheme[..end];

    let (authority, path) = match hierarchy.strip_prefix("//") {
        Some(rest) => match rest.find('/') {
            Some(slash) => rest.split_at(slash),
            None => (rest, ""),
        },
        None if hierarchy.starts_with('/') => ("", hierarchy),
        None => ("", ""),
    };
    let host = authority.rsplit_once('@').map_or(authority, |(_, host)| host);
    (host, path)
}

// Case-sensitive names, values kept in query order.
fn query_values(url: &Url) -> HashMap<String, Vec<String>> {
    let mut values: HashMap<String, Vec<String>> = HashMap::new();
    for (name, value) in url.query_pairs() {
        values
            .entry(name.into_owned())
            .or_default()
            .push(value.into_owned());
    }
    values
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_and_path_are_taken_verbatim() {
        let parts = decompose("https://example.com/foo?x=1").unwrap();
        assert_eq!(parts.host, "example.com");
        assert_eq!(parts.path, "/foo");
        assert_eq!(parts.utm_source, "");
    }

    #[test]
    fn first_value_wins_for_duplicate_parameters() {
        let parts = decompose("https://example.com/?utm_source=a&utm_source=b").unwrap();
        assert_eq!(parts.utm_source, "a");
    }

    #[test]
    fn missing_campaign_is_empty() {
        let parts =
            decompose("https://example.com/landing?utm_source=twitter&utm_medium=social").unwrap();
        assert_eq!(parts.utm_campaign, "");
        assert_eq!(parts.utm_source, "twitter");
        assert_eq!(parts.utm_medium, "social");
    }

    #[test]
    fn all_five_tags_are_extracted_and_others_dropped() {
        let parts = decompose(
            "https://blog.example.org/posts/rust?utm_source=nl&utm_medium=email&utm_campaign=spring&utm_term=crab&utm_content=hero&ref=abc",
        )
        .unwrap();
        assert_eq!(
            parts,
            UrlParts {
                host: "blog.example.org".into(),
                path: "/posts/rust".into(),
                utm_source: "nl".into(),
                utm_medium: "email".into(),
                utm_campaign: "spring".into(),
                utm_term: "crab".into(),
                utm_content: "hero".into(),
            }
        );
    }

    #[test]
    fn parameter_names_are_case_sensitive() {
        let parts = decompose("https://example.com/?UTM_SOURCE=upper&utm_source=lower").unwrap();
        assert_eq!(parts.utm_source, "lower");
    }

    #[test]
    fn values_are_percent_decoded() {
        let parts = decompose("https://example.com/?utm_campaign=black%20friday+sale").unwrap();
        assert_eq!(parts.utm_campaign, "black friday sale");
    }

    #[test]
    fn explicit_port_stays_on_host() {
        let parts = decompose("http://localhost:8080/admin").unwrap();
        assert_eq!(parts.host, "localhost:8080");
        assert_eq!(parts.path, "/admin");
    }

    #[test]
    fn dot_segments_are_not_resolved() {
        let parts = decompose("https://example.com/a/./b/../c?utm_source=x").unwrap();
        assert_eq!(parts.path, "/a/./b/../c");
        assert_eq!(parts.utm_source, "x");
    }

    #[test]
    fn host_keeps_case_and_default_port() {
        let parts = decompose("https://Example.COM:443/Foo").unwrap();
        assert_eq!(parts.host, "Example.COM:443");
        assert_eq!(parts.path, "/Foo");
    }

    #[test]
    fn empty_path_stays_empty() {
        let parts = decompose("https://example.com?utm_medium=email").unwrap();
        assert_eq!(parts.host, "example.com");
        assert_eq!(parts.path, "");
        assert_eq!(parts.utm_medium, "email");

        let parts = decompose("https://example.com").unwrap();
        assert_eq!(parts.path, "");
    }

    #[test]
    fn userinfo_is_dropped_and_path_is_percent_decoded() {
        let parts = decompose("https://user:pw@example.com/caf%C3%A9/a%2Fb#top").unwrap();
        assert_eq!(parts.host, "example.com");
        assert_eq!(parts.path, "/café/a/b");
    }

    #[test]
    fn relative_url_is_malformed() {
        let err = decompose("/just/a/path?utm_source=x").unwrap_err();
        assert_eq!(err.url, "/just/a/path?utm_source=x");
        assert_eq!(err.source, url::ParseError::RelativeUrlWithoutBase);
    }
}
