//! Resource-type filter parsing and the built-in telemetry noise filter.

use std::fmt;

use super::types::ResourceType;

/// Invalid tokens found while parsing a resource-type filter.
#[derive(Debug)]
pub struct TypeFilterError {
    pub invalid: Vec<String>,
}

impl fmt::Display for TypeFilterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid resource type(s): {}",
            self.invalid.join(", ")
        )
    }
}

impl std::error::Error for TypeFilterError {}

impl TypeFilterError {
    /// Suggestion text naming the accepted values.
    #[must_use]
    pub fn suggestion() -> String {
        let names: Vec<&str> = ResourceType::ALL.iter().map(|t| t.as_str()).collect();
        format!("Valid types are: {}", names.join(", "))
    }
}

/// Parse a comma-separated resource-type filter.
///
/// Matching is case-insensitive, whitespace around tokens is trimmed, and
/// empty segments are ignored. Input order is preserved and duplicates are
/// not collapsed.
///
/// # Errors
///
/// Returns `TypeFilterError` listing every unrecognized token.
pub fn parse_resource_types(input: &str) -> Result<Vec<ResourceType>, TypeFilterError> {
    let mut types = Vec::new();
    let mut invalid = Vec::new();

    for token in input.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        match ResourceType::from_token(token) {
            Some(t) => types.push(t),
            None => invalid.push(token.to_owned()),
        }
    }

    if invalid.is_empty() {
        Ok(types)
    } else {
        Err(TypeFilterError { invalid })
    }
}

/// URL substrings for requests that are telemetry noise rather than signal.
///
/// Matched case-insensitively against the full request URL. Bypassed when
/// the session was started with `include_all`.
const NOISE_URL_PATTERNS: &[&str] = &[
    "google-analytics.com",
    "analytics.google.com",
    "googletagmanager.com",
    "doubleclick.net",
    "googlesyndication.com",
    "facebook.com/tr",
    "connect.facebook.net",
    "segment.io",
    "segment.com",
    "mixpanel.com",
    "amplitude.com",
    "hotjar.com",
    "fullstory.com",
    "sentry.io/api",
    "newrelic.com",
    "nr-data.net",
    "clarity.ms",
    "/pixel.gif",
    "/collect?",
    "/beacon",
];

/// True when a URL matches the built-in noise filter.
#[must_use]
pub fn is_noise_url(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    NOISE_URL_PATTERNS.iter().any(|p| lower.contains(p))
}
