//! URI template compilation into anchored path matchers.
//!
//! A template such as `/users/:id/orders/:order` compiles to the pattern string
//! `/users/(?P<id>[^/]+)/orders/(?P<order>[^/]+)`. The pattern string is what gets
//! persisted next to the template; [`UriPattern`] anchors and compiles it for matching.
//!
//! Templates are trusted input. Everything except `:name` placeholders is copied
//! verbatim, so regex metacharacters inside a template keep their regex meaning.

use regex::Regex;
use thiserror::Error;

/// Sub-pattern bound to each `:name` placeholder: one or more non-slash characters.
const SEGMENT_PATTERN: &str = "[^/]+";

/// Errors raised when a template does not produce a usable matcher.
#[derive(Debug, Error)]
pub enum PatternError {
    /// The compiled pattern is not a valid regular expression.
    #[error("uri pattern `{pattern}` is not a valid matcher: {source}")]
    Invalid {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Compile a URI template into its portable pattern string.
///
/// Every `:name` token (a colon followed by one or more word characters) becomes a
/// named capture group. A colon not followed by a word character is kept literally.
///
/// # Parameters
///
/// - `uri` - URI template, e.g. `/users/:id`
///
/// # Returns
///
/// Returns the unanchored pattern string. The same template always yields the same string.
pub fn compile(uri: &str) -> String {
    let mut pattern = String::with_capacity(uri.len() + 16);
    let mut chars = uri.chars().peekable();

    while let Some(c) = chars.next() {
        if c != ':' {
            pattern.push(c);
            continue;
        }

        let mut name = String::new();
        while let Some(&next) = chars.peek() {
            if next.is_alphanumeric() || next == '_' {
                name.push(next);
                chars.next();
            } else {
                break;
            }
        }

        if name.is_empty() {
            pattern.push(':');
        } else {
            pattern.push_str("(?P<");
            pattern.push_str(&name);
            pattern.push('>');
            pattern.push_str(SEGMENT_PATTERN);
            pattern.push(')');
        }
    }

    pattern
}

/// A compiled, fully anchored path matcher.
#[derive(Debug, Clone)]
pub struct UriPattern {
    pattern: String,
    regex: Regex,
}

impl UriPattern {
    /// Compile a URI template directly into a matcher.
    ///
    /// # Errors
    ///
    /// Returns `PatternError::Invalid` if the template yields an invalid expression,
    /// e.g. an unbalanced parenthesis or a placeholder name used twice.
    pub fn from_template(uri: &str) -> Result<Self, PatternError> {
        Self::from_pattern(compile(uri))
    }

    /// Build a matcher from a previously compiled pattern string.
    ///
    /// # Errors
    ///
    /// Returns `PatternError::Invalid` if the pattern is not a valid expression.
    pub fn from_pattern(pattern: impl Into<String>) -> Result<Self, PatternError> {
        let pattern = pattern.into();
        match Regex::new(&format!("^(?:{pattern})$")) {
            Ok(regex) => Ok(Self { pattern, regex }),
            Err(source) => Err(PatternError::Invalid { pattern, source }),
        }
    }

    /// The unanchored pattern string, as persisted.
    pub fn as_str(&self) -> &str {
        &self.pattern
    }

    /// Match a request path and extract the named segments.
    ///
    /// # Parameters
    ///
    /// - `path` - Request path without query string
    ///
    /// # Returns
    ///
    /// Returns `Some` with `(name, value)` pairs in template order if the whole path
    /// matches, `None` otherwise.
    pub fn captures(&self, path: &str) -> Option<Vec<(String, String)>> {
        let caps = self.regex.captures(path)?;
        let bound = self
            .regex
            .capture_names()
            .flatten()
            .filter_map(|name| caps.name(name).map(|m| (name.to_owned(), m.as_str().to_owned())))
            .collect();
        Some(bound)
    }

    /// Check whether the path matches without extracting segments.
    pub fn is_match(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }
}
