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

//! Path patterns: templates like `/users/{id}` or `/files/{path:.+}` that
//! are compiled into anchored regular expressions with one capture group per
//! variable.
//!
//! A variable is written as `{name}` or `{name:expression}`. Without an
//! explicit expression a variable matches one or more non-slash characters.
//! A literal `{` is written as `\{`. Leading and trailing slashes are
//! significant, `/dir` and `/dir/` are different patterns.

use regex::Regex;
use std::cmp::Ordering;
use std::fmt::{self, Debug, Display};
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use thiserror::Error;

/// Value expression used for variables that don't specify one.
const DEFAULT_VALUE_PATTERN: &str = "[^/]+";

/// Error raised when a path pattern cannot be parsed or compiled.
#[derive(Debug, Error)]
pub enum PatternError {
    /// A `{` was never closed.
    #[error("unclosed variable in pattern `{0}`")]
    UnclosedVariable(String),

    /// A variable name is empty or contains forbidden characters.
    #[error("invalid variable name `{name}` in pattern `{pattern}`")]
    InvalidVariableName {
        /// The offending pattern.
        pattern: String,
        /// The rejected variable name.
        name: String,
    },

    /// The same variable name occurs more than once.
    #[error("duplicate variable `{name}` in pattern `{pattern}`")]
    DuplicateVariable {
        /// The offending pattern.
        pattern: String,
        /// The duplicated variable name.
        name: String,
    },

    /// A variable's value expression is not a valid regular expression.
    #[error("invalid value expression in pattern `{pattern}`: {source}")]
    InvalidValueExpression {
        /// The offending pattern.
        pattern: String,
        /// The underlying regular expression error.
        source: regex::Error,
    },
}

/// Variable values captured by a pattern match.
///
/// Pairs are kept in pattern declaration order and names are unique.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Variables {
    entries: Vec<(String, String)>,
}

impl Variables {
    pub(crate) fn new(entries: Vec<(String, String)>) -> Self {
        Self { entries }
    }

    /// Returns the value captured for the given variable.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(entry_name, _)| entry_name == name)
            .map(|(_, value)| value.as_str())
    }

    /// Iterates over name/value pairs in pattern declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    /// Returns the number of captured variables.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Checks whether any variables were captured.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone)]
struct Variable {
    name: String,
    group: usize,
}

/// A compiled path pattern.
///
/// Patterns compare equal and hash by their source text. The specificity
/// order and the matches-same-paths relation are separate comparisons, see
/// [`compare_specificity`](Self::compare_specificity) and
/// [`matches_same_paths`](Self::matches_same_paths).
///
/// ```rust
/// use junction_handler_utils::pattern::PathPattern;
///
/// let pattern: PathPattern = "/users/{id}".parse().unwrap();
/// let variables = pattern.match_path("/users/42").unwrap();
/// assert_eq!(variables.get("id"), Some("42"));
/// assert!(pattern.match_path("/users/42/posts").is_none());
/// ```
#[derive(Clone)]
pub struct PathPattern {
    source: String,
    matcher: Regex,
    variables: Vec<Variable>,
    literal_chars: usize,
    literal_prefix: String,
}

fn valid_variable_name(name: &str) -> bool {
    let mut chars = name.chars();
    let first = match chars.next() {
        Some(first) => first,
        None => return false,
    };
    (first.is_alphabetic() || first == '_' || first == '$')
        && chars.all(|c| c.is_alphanumeric() || c == '_' || c == '$')
}

impl PathPattern {
    /// Parses and compiles a path pattern.
    pub fn parse(source: impl Into<String>) -> Result<Self, PatternError> {
        let source = source.into();
        let mut matcher = String::with_capacity(source.len() + 8);
        matcher.push('^');

        let mut variables = Vec::<Variable>::new();
        let mut groups = 0;
        let mut literal_chars = 0;
        let mut prefix = None;
        let mut pending = String::new();

        let mut chars = source.chars().peekable();
        while let Some(c) = chars.next() {
            if c == '\\' && chars.peek() == Some(&'{') {
                chars.next();
                pending.push('{');
                literal_chars += 1;
            } else if c == '{' {
                if !pending.is_empty() {
                    matcher.push_str(&regex::escape(&pending));
                }
                if prefix.is_none() {
                    prefix = Some(pending.clone());
                }
                pending.clear();

                let mut body = String::new();
                let mut depth = 0usize;
                let mut closed = false;
                while let Some(c) = chars.next() {
                    match c {
                        '\\' => {
                            // Keeps regex escapes intact, the escaped
                            // character doesn't affect brace nesting.
                            body.push('\\');
                            if let Some(next) = chars.next() {
                                body.push(next);
                            }
                        }
                        '{' => {
                            depth += 1;
                            body.push('{');
                        }
                        '}' if depth == 0 => {
                            closed = true;
                            break;
                        }
                        '}' => {
                            depth -= 1;
                            body.push('}');
                        }
                        c => body.push(c),
                    }
                }
                if !closed {
                    return Err(PatternError::UnclosedVariable(source));
                }

                let (name, value_pattern) = match body.split_once(':') {
                    Some((name, value_pattern)) => (name.to_owned(), value_pattern.to_owned()),
                    None => (body, DEFAULT_VALUE_PATTERN.to_owned()),
                };
                if !valid_variable_name(&name) {
                    return Err(PatternError::InvalidVariableName {
                        pattern: source,
                        name,
                    });
                }
                if variables.iter().any(|variable| variable.name == name) {
                    return Err(PatternError::DuplicateVariable {
                        pattern: source,
                        name,
                    });
                }

                let compiled = Regex::new(&value_pattern).map_err(|error| {
                    PatternError::InvalidValueExpression {
                        pattern: source.clone(),
                        source: error,
                    }
                })?;

                variables.push(Variable {
                    name,
                    group: groups + 1,
                });
                // The wrapping group plus any groups nested in the value
                // expression.
                groups += compiled.captures_len();

                matcher.push('(');
                matcher.push_str(&value_pattern);
                matcher.push(')');
            } else {
                pending.push(c);
                literal_chars += 1;
            }
        }

        if !pending.is_empty() {
            matcher.push_str(&regex::escape(&pending));
        }
        matcher.push('$');

        let literal_prefix = prefix.unwrap_or(pending);
        let matcher =
            Regex::new(&matcher).map_err(|error| PatternError::InvalidValueExpression {
                pattern: source.clone(),
                source: error,
            })?;

        Ok(Self {
            source,
            matcher,
            variables,
            literal_chars,
            literal_prefix,
        })
    }

    /// Returns the pattern as it was originally written.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Iterates over the variable names in declaration order.
    pub fn variables(&self) -> impl Iterator<Item = &str> {
        self.variables.iter().map(|variable| variable.name.as_str())
    }

    /// Returns the number of literal characters in the pattern, an escaped
    /// brace counting as one.
    pub fn literal_char_count(&self) -> usize {
        self.literal_chars
    }

    /// Checks whether the pattern contains no variables.
    pub fn is_literal(&self) -> bool {
        self.variables.is_empty()
    }

    /// Returns the literal characters preceding the first variable, or the
    /// entire literal text for patterns without variables.
    pub fn literal_prefix(&self) -> &str {
        &self.literal_prefix
    }

    pub(crate) fn matcher_str(&self) -> &str {
        self.matcher.as_str()
    }

    /// Matches a path against the pattern.
    ///
    /// This is an anchored full-string match. On success the captured
    /// variable values are returned in declaration order.
    pub fn match_path(&self, path: &str) -> Option<Variables> {
        let captures = self.matcher.captures(path)?;
        Some(Variables::new(
            self.variables
                .iter()
                .map(|variable| {
                    let value = captures
                        .get(variable.group)
                        .map(|m| m.as_str().to_owned())
                        .unwrap_or_default();
                    (variable.name.clone(), value)
                })
                .collect(),
        ))
    }

    /// Compares two patterns by specificity.
    ///
    /// This orders patterns from most to least specific, i.e.
    /// `Ordering::Less` means `self` should be tried before `other`:
    /// patterns with fewer variables come first, ties are broken by a
    /// higher literal character count.
    pub fn compare_specificity(&self, other: &Self) -> Ordering {
        self.variables
            .len()
            .cmp(&other.variables.len())
            .then_with(|| other.literal_chars.cmp(&self.literal_chars))
    }

    /// Checks whether two patterns match exactly the same set of paths.
    ///
    /// This compares the compiled matcher expressions, so `/u/{a}` and
    /// `/u/{b}` are considered equivalent. It is conservative: semantically
    /// equivalent value expressions spelled differently (e.g. `[ab]` and
    /// `[ba]`) are not detected.
    pub fn matches_same_paths(&self, other: &Self) -> bool {
        self.matcher.as_str() == other.matcher.as_str()
    }
}

impl FromStr for PathPattern {
    type Err = PatternError;

    fn from_str(source: &str) -> Result<Self, PatternError> {
        Self::parse(source)
    }
}

impl PartialEq for PathPattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for PathPattern {}

impl Hash for PathPattern {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.source.hash(state);
    }
}

impl Debug for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PathPattern({})", self.source)
    }
}

impl Display for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    fn pattern(source: &str) -> PathPattern {
        source.parse().unwrap()
    }

    #[test]
    fn source_round_trip() {
        for source in ["/users/{id}", "/files/{p:.+}", "/plain", "", "/a/\\{b}"] {
            assert_eq!(pattern(source).source(), source);
        }
    }

    #[test]
    fn literal_accounting() {
        let p = pattern("/users/me");
        assert!(p.is_literal());
        assert_eq!(p.literal_char_count(), 9);
        assert_eq!(p.literal_prefix(), "/users/me");

        let p = pattern("/users/{id}/posts");
        assert!(!p.is_literal());
        assert_eq!(p.literal_char_count(), 13);
        assert_eq!(p.literal_prefix(), "/users/");

        // The escaped brace counts as a single literal character.
        let p = pattern("/\\{x/{id}");
        assert_eq!(p.literal_char_count(), 4);
        assert_eq!(p.literal_prefix(), "/{x/");
    }

    #[test]
    fn matching() {
        let p = pattern("/users/{id}");
        let variables = p.match_path("/users/42").unwrap();
        assert_eq!(variables.get("id"), Some("42"));
        assert_eq!(variables.len(), 1);

        assert!(p.match_path("/users/").is_none());
        assert!(p.match_path("/users/42/").is_none());
        assert!(p.match_path("users/42").is_none());

        let p = pattern("/files/{p:.+}");
        let variables = p.match_path("/files/a/b/c.txt").unwrap();
        assert_eq!(variables.get("p"), Some("a/b/c.txt"));
        assert!(p.match_path("/files/").is_none());
    }

    #[test]
    fn variable_extraction_is_complete() {
        let p = pattern("/{a}/{b}/{c:[0-9]+}");
        let variables = p.match_path("/x/y/123").unwrap();
        let names: Vec<_> = variables.iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(
            names,
            p.variables().collect::<Vec<_>>(),
            "captured names must equal declared names"
        );
    }

    #[test]
    fn nested_groups_in_value_expressions() {
        let p = pattern("/{kind:(img|doc)s?}/{name}");
        let variables = p.match_path("/imgs/cat.png").unwrap();
        assert_eq!(variables.get("kind"), Some("imgs"));
        assert_eq!(variables.get("name"), Some("cat.png"));
    }

    #[test]
    fn escaped_braces() {
        let p = pattern("/literal/\\{notavar}");
        assert!(p.is_literal());
        assert!(p.match_path("/literal/{notavar}").is_some());
        assert!(p.match_path("/literal/x").is_none());

        // Braces nested inside a value expression don't terminate it.
        let p = pattern("/{v:[0-9]{2}}");
        assert!(p.match_path("/42").is_some());
        assert!(p.match_path("/4").is_none());
    }

    #[test]
    fn parse_errors() {
        assert!(matches!(
            PathPattern::parse("/{unclosed"),
            Err(PatternError::UnclosedVariable(_))
        ));
        assert!(matches!(
            PathPattern::parse("/{}"),
            Err(PatternError::InvalidVariableName { .. })
        ));
        assert!(matches!(
            PathPattern::parse("/{1abc}"),
            Err(PatternError::InvalidVariableName { .. })
        ));
        assert!(matches!(
            PathPattern::parse("/{a}/{a}"),
            Err(PatternError::DuplicateVariable { .. })
        ));
        assert!(matches!(
            PathPattern::parse("/{a:[}"),
            Err(PatternError::InvalidValueExpression { .. })
        ));
    }

    #[test]
    fn specificity_order() {
        let sorted = ["/users/me", "/users/{id}", "/{w:.*}", "/{a}/{b}"];
        for (i, a) in sorted.iter().enumerate() {
            for (j, b) in sorted.iter().enumerate() {
                let expected = i.cmp(&j);
                assert_eq!(
                    pattern(a).compare_specificity(&pattern(b)),
                    expected,
                    "{a} vs {b}"
                );
            }
        }
    }

    #[test]
    fn same_paths_relation() {
        assert!(pattern("/u/{a}").matches_same_paths(&pattern("/u/{b}")));
        assert!(!pattern("/u/{a}").matches_same_paths(&pattern("/u/{a}/")));
        assert!(!pattern("/u/{a:[ab]}").matches_same_paths(&pattern("/u/{a:[ba]}")));
    }

    #[test]
    fn identity_by_source() {
        assert_eq!(pattern("/u/{a}"), pattern("/u/{a}"));
        assert_ne!(pattern("/u/{a}"), pattern("/u/{b}"));
    }
}
