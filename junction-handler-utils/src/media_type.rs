// Copyright 2024 Wladimir Palant
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Media types (`type/subtype;parameters`) and the `Accept` header.
//!
//! Both the type and the subtype may be the wildcard `*`. Parameter values
//! may be quoted, with a backslash escaping the next character inside
//! quotes; the same parameter key may occur multiple times. The `q`
//! parameter of an `Accept` entry is not a regular parameter, it is
//! extracted as the entry's quality value.

use once_cell::sync::Lazy;
use std::cmp::Ordering;
use std::fmt::{self, Display};
use std::str::FromStr;
use thiserror::Error;

/// Error raised when a media type or `Accept` header cannot be parsed.
#[derive(Debug, Error)]
pub enum MediaTypeError {
    /// The `type/subtype` part is malformed.
    #[error("malformed media type `{0}`")]
    Malformed(String),

    /// A parameter is not a `key=value` pair.
    #[error("malformed parameter `{parameter}` in media type `{input}`")]
    MalformedParameter {
        /// The full input.
        input: String,
        /// The rejected parameter text.
        parameter: String,
    },

    /// A quality value is not a number within `[0, 1]` or occurs twice.
    #[error("invalid quality value in `{0}`")]
    InvalidQuality(String),
}

/// Splits `input` on top-level occurrences of `separator`: separators
/// inside double-quoted runs don't split, and a backslash escapes the next
/// character.
fn split_unquoted(input: &str, separator: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut quoted = false;
    let mut escaped = false;
    for (position, c) in input.char_indices() {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == '"' {
            quoted = !quoted;
        } else if c == separator && !quoted {
            parts.push(&input[start..position]);
            start = position + c.len_utf8();
        }
    }
    parts.push(&input[start..]);
    parts
}

fn unquote(value: &str) -> String {
    let inner = value
        .strip_prefix('"')
        .and_then(|value| value.strip_suffix('"'));
    match inner {
        Some(inner) => {
            let mut result = String::with_capacity(inner.len());
            let mut chars = inner.chars();
            while let Some(c) = chars.next() {
                if c == '\\' {
                    if let Some(next) = chars.next() {
                        result.push(next);
                    }
                } else {
                    result.push(c);
                }
            }
            result
        }
        None => value.to_owned(),
    }
}

fn valid_component(component: &str) -> bool {
    !component.is_empty()
        && !component.contains(|c: char| c.is_whitespace() || c == '/' || c == ',' || c == ';')
}

fn is_token(value: &str) -> bool {
    !value.is_empty()
        && value.chars().all(|c| {
            c.is_ascii_alphanumeric() || "!#$%&'*+-.^_`|~".contains(c)
        })
}

fn multiset_equal(a: &[String], b: &[String]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut a: Vec<_> = a.iter().collect();
    let mut b: Vec<_> = b.iter().collect();
    a.sort();
    b.sort();
    a == b
}

/// A `type/subtype;parameters` media type value.
///
/// ```rust
/// use junction_handler_utils::media_type::MediaType;
///
/// let plain: MediaType = "text/plain;charset=utf-8".parse().unwrap();
/// let any_text: MediaType = "text/*".parse().unwrap();
/// assert!(plain.is(&any_text));
/// assert!(!any_text.is(&plain));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaType {
    type_: String,
    subtype: String,
    parameters: Vec<(String, Vec<String>)>,
}

impl MediaType {
    /// The wildcard media type `*/*`.
    pub fn any() -> &'static MediaType {
        static ANY: Lazy<MediaType> = Lazy::new(|| MediaType {
            type_: "*".to_owned(),
            subtype: "*".to_owned(),
            parameters: Vec::new(),
        });
        &ANY
    }

    /// Returns the type component, `*` for wildcard.
    pub fn type_(&self) -> &str {
        &self.type_
    }

    /// Returns the subtype component, `*` for wildcard.
    pub fn subtype(&self) -> &str {
        &self.subtype
    }

    /// Checks whether either component is a wildcard.
    pub fn has_wildcard(&self) -> bool {
        self.type_ == "*" || self.subtype == "*"
    }

    /// Returns the values recorded for a parameter key if any.
    pub fn parameter(&self, key: &str) -> Option<&[String]> {
        self.parameters
            .iter()
            .find(|(existing, _)| existing == key)
            .map(|(_, values)| values.as_slice())
    }

    /// Iterates over parameter keys and their values.
    pub fn parameters(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.parameters
            .iter()
            .map(|(key, values)| (key.as_str(), values.as_slice()))
    }

    /// Symmetric compatibility check.
    ///
    /// Two media types are compatible when their types and subtypes agree
    /// up to wildcards and every parameter key present on both sides
    /// carries the same multiset of values.
    pub fn compatible_with(&self, other: &MediaType) -> bool {
        fn component_matches(a: &str, b: &str) -> bool {
            a == "*" || b == "*" || a == b
        }

        component_matches(&self.type_, &other.type_)
            && component_matches(&self.subtype, &other.subtype)
            && self.parameters.iter().all(|(key, values)| {
                other
                    .parameter(key)
                    .map_or(true, |other_values| multiset_equal(values, other_values))
            })
    }

    /// Asymmetric instance check: `a.is(b)` holds when `b` describes `a`,
    /// i.e. every constraint of `b` is satisfied by `a`.
    pub fn is(&self, other: &MediaType) -> bool {
        (other.type_ == "*" || other.type_ == self.type_)
            && (other.subtype == "*" || other.subtype == self.subtype)
            && other.parameters.iter().all(|(key, values)| {
                self.parameter(key)
                    .map_or(false, |own_values| multiset_equal(values, own_values))
            })
    }

    /// Compares two media types by specificity.
    ///
    /// This orders media types from most to least specific, so
    /// `Ordering::Less` means `self` should be preferred over `other`: a
    /// wildcard type loses against everything, then a wildcard subtype,
    /// then a lower parameter count.
    pub fn compare_specificity(&self, other: &Self) -> Ordering {
        (self.type_ == "*")
            .cmp(&(other.type_ == "*"))
            .then_with(|| (self.subtype == "*").cmp(&(other.subtype == "*")))
            .then_with(|| other.parameters.len().cmp(&self.parameters.len()))
    }

    /// Extracts the `q` parameter as a quality value, leaving the remaining
    /// parameters in place. Absent means `1.0`.
    fn take_quality(&mut self) -> Result<f32, MediaTypeError> {
        let position = match self.parameters.iter().position(|(key, _)| key == "q") {
            Some(position) => position,
            None => return Ok(1.0),
        };

        let display = self.to_string();
        let (_, values) = self.parameters.remove(position);
        let quality = match values.as_slice() {
            [value] => value.parse::<f32>().ok(),
            _ => None,
        };
        match quality {
            Some(quality) if (0.0..=1.0).contains(&quality) => Ok(quality),
            _ => Err(MediaTypeError::InvalidQuality(display)),
        }
    }
}

impl FromStr for MediaType {
    type Err = MediaTypeError;

    fn from_str(input: &str) -> Result<Self, MediaTypeError> {
        let mut parts = split_unquoted(input, ';').into_iter();
        let full_type = parts.next().unwrap_or("").trim();
        let (type_, subtype) = full_type
            .split_once('/')
            .ok_or_else(|| MediaTypeError::Malformed(input.to_owned()))?;
        if !valid_component(type_) || !valid_component(subtype) {
            return Err(MediaTypeError::Malformed(input.to_owned()));
        }

        let mut parameters: Vec<(String, Vec<String>)> = Vec::new();
        for parameter in parts {
            let parameter = parameter.trim();
            if parameter.is_empty() {
                continue;
            }
            let (key, value) =
                parameter
                    .split_once('=')
                    .ok_or_else(|| MediaTypeError::MalformedParameter {
                        input: input.to_owned(),
                        parameter: parameter.to_owned(),
                    })?;
            let key = key.trim().to_ascii_lowercase();
            let value = unquote(value.trim());
            match parameters.iter_mut().find(|(existing, _)| *existing == key) {
                Some((_, values)) => values.push(value),
                None => parameters.push((key, vec![value])),
            }
        }

        Ok(Self {
            type_: type_.to_ascii_lowercase(),
            subtype: subtype.to_ascii_lowercase(),
            parameters,
        })
    }
}

impl Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.type_, self.subtype)?;
        for (key, values) in &self.parameters {
            for value in values {
                if is_token(value) {
                    write!(f, ";{key}={value}")?;
                } else {
                    write!(f, ";{key}=\"")?;
                    for c in value.chars() {
                        if c == '"' || c == '\\' {
                            f.write_str("\\")?;
                        }
                        write!(f, "{c}")?;
                    }
                    f.write_str("\"")?;
                }
            }
        }
        Ok(())
    }
}

/// A media type from an `Accept` header with its quality value extracted.
#[derive(Debug, Clone, PartialEq)]
pub struct QualifiedMediaType {
    media_type: MediaType,
    quality: f32,
}

impl QualifiedMediaType {
    /// Pairs a media type with a quality value.
    pub fn new(media_type: MediaType, quality: f32) -> Self {
        Self {
            media_type,
            quality,
        }
    }

    /// Returns the media type.
    pub fn media_type(&self) -> &MediaType {
        &self.media_type
    }

    /// Returns the quality value, within `[0, 1]`.
    pub fn quality(&self) -> f32 {
        self.quality
    }
}

/// Parses an `Accept` header value into media types ordered most-preferred
/// first: higher quality wins and the more specific media type breaks ties.
///
/// Commas inside double-quoted runs don't separate entries and a backslash
/// escapes the next character. The whole header fails if any entry fails to
/// parse or carries a duplicate or out-of-range `q` parameter; callers
/// treat a failed header as accepting nothing.
pub fn parse_accept(header: &str) -> Result<Vec<QualifiedMediaType>, MediaTypeError> {
    let mut entries = Vec::new();
    for token in split_unquoted(header, ',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        let mut media_type: MediaType = token.parse()?;
        let quality = media_type.take_quality()?;
        entries.push(QualifiedMediaType {
            media_type,
            quality,
        });
    }

    entries.sort_by(|a, b| {
        b.quality
            .partial_cmp(&a.quality)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.media_type.compare_specificity(&b.media_type))
    });
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    fn media_type(input: &str) -> MediaType {
        input.parse().unwrap()
    }

    #[test]
    fn parsing() {
        let parsed = media_type("text/html");
        assert_eq!(parsed.type_(), "text");
        assert_eq!(parsed.subtype(), "html");
        assert!(!parsed.has_wildcard());

        let parsed = media_type("Text/HTML; Charset=UTF-8");
        assert_eq!(parsed.type_(), "text");
        assert_eq!(parsed.subtype(), "html");
        assert_eq!(
            parsed.parameter("charset"),
            Some(["UTF-8".to_owned()].as_slice())
        );

        let parsed = media_type("a/b;k=1;k=2;other=\"x;y\"");
        assert_eq!(
            parsed.parameter("k"),
            Some(["1".to_owned(), "2".to_owned()].as_slice())
        );
        assert_eq!(
            parsed.parameter("other"),
            Some(["x;y".to_owned()].as_slice())
        );

        assert!("nonsense".parse::<MediaType>().is_err());
        assert!("a/b;broken".parse::<MediaType>().is_err());
        assert!("a b/c".parse::<MediaType>().is_err());
    }

    #[test]
    fn display_round_trip() {
        for input in ["text/html", "text/plain;charset=utf-8", "*/*"] {
            assert_eq!(media_type(input).to_string(), input);
        }
        assert_eq!(
            media_type("a/b;x=\"quo\\\"te\"").to_string(),
            "a/b;x=\"quo\\\"te\""
        );
    }

    #[test]
    fn compatibility() {
        assert!(media_type("text/html").compatible_with(&media_type("text/html")));
        assert!(media_type("text/html").compatible_with(&media_type("text/*")));
        assert!(media_type("*/*").compatible_with(&media_type("application/json")));
        assert!(!media_type("text/html").compatible_with(&media_type("text/plain")));
        assert!(!media_type("text/html").compatible_with(&media_type("image/*")));

        // Parameters only matter when present on both sides.
        assert!(media_type("a/b;k=1").compatible_with(&media_type("a/b")));
        assert!(media_type("a/b;k=1").compatible_with(&media_type("a/b;other=2")));
        assert!(!media_type("a/b;k=1").compatible_with(&media_type("a/b;k=2")));
        assert!(media_type("a/b;k=1;k=2").compatible_with(&media_type("a/b;k=2;k=1")));
        assert!(!media_type("a/b;k=1").compatible_with(&media_type("a/b;k=1;k=1")));
    }

    #[test]
    fn instance_check() {
        assert!(media_type("text/plain;charset=utf-8").is(&media_type("text/plain")));
        assert!(media_type("text/plain;charset=utf-8").is(&media_type("text/*")));
        assert!(media_type("text/plain").is(&media_type("*/*")));
        assert!(!media_type("text/plain").is(&media_type("text/plain;charset=utf-8")));
        assert!(!media_type("*/*").is(&media_type("text/plain")));
    }

    #[test]
    fn specificity() {
        let ordered = [
            "text/plain;charset=utf-8;format=flowed",
            "text/plain;charset=utf-8",
            "text/plain",
            "text/*",
            "*/*",
        ];
        for (i, a) in ordered.iter().enumerate() {
            for (j, b) in ordered.iter().enumerate() {
                assert_eq!(
                    media_type(a).compare_specificity(&media_type(b)),
                    i.cmp(&j),
                    "{a} vs {b}"
                );
            }
        }
    }

    #[test]
    fn accept_ordering() {
        let accepted =
            parse_accept("application/json;q=0.5, text/html;q=0.9, text/*;q=0.9").unwrap();
        let types: Vec<_> = accepted
            .iter()
            .map(|entry| entry.media_type().to_string())
            .collect();
        assert_eq!(types, vec!["text/html", "text/*", "application/json"]);
        assert_eq!(accepted[0].quality(), 0.9);
        assert_eq!(accepted[2].quality(), 0.5);
    }

    #[test]
    fn accept_quality_validation() {
        assert!(parse_accept("text/html;q=1.5").is_err());
        assert!(parse_accept("text/html;q=-0.1").is_err());
        assert!(parse_accept("text/html;q=0.5;q=0.7").is_err());
        assert!(parse_accept("text/html;q=abc").is_err());
        assert!(parse_accept("text/html, garbage").is_err());

        let accepted = parse_accept("text/html").unwrap();
        assert_eq!(accepted[0].quality(), 1.0);
    }

    #[test]
    fn accept_tokenizer() {
        // The comma inside the quoted parameter must not split.
        let accepted = parse_accept("a/b;x=\"1,2\", c/d").unwrap();
        assert_eq!(accepted.len(), 2);
        assert_eq!(
            accepted[0].media_type().parameter("x"),
            Some(["1,2".to_owned()].as_slice())
        );

        // A backslash escapes the next character.
        let accepted = parse_accept("a/b;x=\"quo\\\"te,still\", c/d").unwrap();
        assert_eq!(accepted.len(), 2);
        assert_eq!(
            accepted[0].media_type().parameter("x"),
            Some(["quo\"te,still".to_owned()].as_slice())
        );
    }
}
