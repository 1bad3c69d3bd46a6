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

//! Implements best-match routing of request paths to path patterns.
//!
//! Literal patterns live in an exact-match table and always win. Patterns
//! with variables are kept in a list ordered by the builder's comparator,
//! most specific first by default, and are indexed by a prefix trie over
//! their literal prefixes: a lookup only ever evaluates the patterns whose
//! literal prefix actually prefixes the path, in list order, and returns
//! the first match.

use std::cmp::Ordering;
use std::collections::{btree_map, BTreeMap, HashMap};
use std::fmt::Debug;
use std::sync::Mutex;
use thiserror::Error;

use crate::pattern::{PathPattern, PatternError, Variables};
use crate::trie::PrefixTrie;

/// Error raised when adding an endpoint to a router builder.
#[derive(Debug, Error)]
pub enum RouterError {
    /// The pattern could not be parsed.
    #[error(transparent)]
    Pattern(#[from] PatternError),

    /// Another endpoint's pattern already matches the same set of paths.
    #[error("pattern `{pattern}` matches the same paths as `{existing}`")]
    Conflict {
        /// The rejected pattern.
        pattern: String,
        /// The pattern that was added first.
        existing: String,
    },
}

/// A pattern/value pair registered with a router.
#[derive(Debug, Clone)]
pub struct Endpoint<V> {
    pattern: PathPattern,
    value: V,
}

impl<V> Endpoint<V> {
    /// Returns the endpoint's pattern.
    pub fn pattern(&self) -> &PathPattern {
        &self.pattern
    }

    /// Returns the endpoint's value.
    pub fn value(&self) -> &V {
        &self.value
    }
}

/// An endpoint returned from a lookup, along with the variable values
/// captured from the path.
#[derive(Debug)]
pub struct RouteMatch<'a, V> {
    endpoint: &'a Endpoint<V>,
    variables: Variables,
}

impl<'a, V> RouteMatch<'a, V> {
    /// Returns the pattern that matched.
    pub fn pattern(&self) -> &'a PathPattern {
        self.endpoint.pattern()
    }

    /// Returns the value registered for the matched pattern.
    pub fn value(&self) -> &'a V {
        self.endpoint.value()
    }

    /// Returns the captured variable values. Empty for exact matches.
    pub fn variables(&self) -> &Variables {
        &self.variables
    }

    /// Consumes the match, returning the captured variable values.
    pub fn into_variables(self) -> Variables {
        self.variables
    }
}

/// The router implementation.
///
/// A new instance can be created by calling [`PathRouter::builder`]. You add
/// the endpoints and call [`RouterBuilder::build`] to compile an efficient
/// routing data structure:
///
/// ```rust
/// use junction_handler_utils::router::PathRouter;
///
/// let builder = PathRouter::builder();
/// builder.add("/users/me", "me page").unwrap();
/// builder.add("/users/{id}", "user page").unwrap();
///
/// let router = builder.build();
/// assert_eq!(*router.find("/users/me").unwrap().value(), "me page");
///
/// let found = router.find("/users/42").unwrap();
/// assert_eq!(*found.value(), "user page");
/// assert_eq!(found.variables().get("id"), Some("42"));
/// ```
#[derive(Debug)]
pub struct PathRouter<V> {
    exact: HashMap<String, Endpoint<V>>,
    variable: Vec<Endpoint<V>>,
    trie: PrefixTrie,
}

impl<V> PathRouter<V> {
    /// Returns a builder instance that can be used to set up a router.
    ///
    /// Once set up, the router data structure is read-only and can be
    /// queried from any number of tasks concurrently.
    pub fn builder() -> RouterBuilder<V> {
        RouterBuilder {
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Looks up the best match for the given path.
    ///
    /// An exact match on a literal pattern always wins. Otherwise the
    /// parameterized patterns whose literal prefix prefixes the path are
    /// evaluated in builder order and the first positive match is returned.
    pub fn find(&self, path: &str) -> Option<RouteMatch<'_, V>> {
        if let Some(endpoint) = self.exact.get(path) {
            return Some(RouteMatch {
                endpoint,
                variables: Variables::default(),
            });
        }

        let candidates = self.trie.lookup(path);
        candidates.iter().find_map(|index| {
            let endpoint = &self.variable[index];
            endpoint
                .pattern()
                .match_path(path)
                .map(|variables| RouteMatch {
                    endpoint,
                    variables,
                })
        })
    }

    /// Yields every endpoint matching the given path, best match first.
    ///
    /// The exact match, if any, is emitted first; parameterized patterns
    /// are evaluated lazily in builder order.
    pub fn find_all<'a>(&'a self, path: &'a str) -> impl Iterator<Item = RouteMatch<'a, V>> + 'a {
        let exact = self.exact.get(path).map(|endpoint| RouteMatch {
            endpoint,
            variables: Variables::default(),
        });

        let candidates: Vec<usize> = self.trie.lookup(path).iter().collect();
        exact.into_iter().chain(candidates.into_iter().filter_map(
            move |index| {
                let endpoint = &self.variable[index];
                endpoint
                    .pattern()
                    .match_path(path)
                    .map(|variables| RouteMatch {
                        endpoint,
                        variables,
                    })
            },
        ))
    }
}

/// The router builder used to set up a [`PathRouter`] instance.
///
/// Additions are serialized internally, so multiple setup tasks can share a
/// reference to the builder. Building consumes the builder; routers already
/// built are never affected by anything done to a builder afterwards.
#[derive(Debug)]
pub struct RouterBuilder<V> {
    /// Endpoints keyed by their compiled matcher expression. The key
    /// doubles as the conflict check: two patterns matching the same paths
    /// compile to the same expression.
    entries: Mutex<BTreeMap<String, Endpoint<V>>>,
}

impl<V> RouterBuilder<V> {
    /// Parses a pattern and registers it with the given value.
    pub fn add(&self, pattern: &str, value: V) -> Result<(), RouterError> {
        self.add_pattern(pattern.parse()?, value)
    }

    /// Registers a pre-compiled pattern with the given value.
    ///
    /// Fails if a previously added pattern matches the same set of paths.
    pub fn add_pattern(&self, pattern: PathPattern, value: V) -> Result<(), RouterError> {
        let mut entries = self.entries.lock().unwrap();
        match entries.entry(pattern.matcher_str().to_owned()) {
            btree_map::Entry::Occupied(existing) => Err(RouterError::Conflict {
                pattern: pattern.source().to_owned(),
                existing: existing.get().pattern().source().to_owned(),
            }),
            btree_map::Entry::Vacant(vacant) => {
                vacant.insert(Endpoint { pattern, value });
                Ok(())
            }
        }
    }

    /// Compiles the routing table, trying parameterized patterns from most
    /// to least specific.
    pub fn build(self) -> PathRouter<V> {
        self.build_with(PathPattern::compare_specificity)
    }

    /// Compiles the routing table with a custom candidate order.
    ///
    /// The comparator determines the order in which parameterized patterns
    /// are evaluated during lookup, `Ordering::Less` sorting first. Ties
    /// always fall back to the compiled matcher expression so that the
    /// result is deterministic.
    pub fn build_with(
        self,
        comparator: impl Fn(&PathPattern, &PathPattern) -> Ordering,
    ) -> PathRouter<V> {
        let entries = self.entries.into_inner().unwrap();

        let mut exact = HashMap::new();
        let mut variable = Vec::new();
        for (_, endpoint) in entries {
            if endpoint.pattern().is_literal() {
                // Literal patterns match exactly their unescaped text.
                exact.insert(endpoint.pattern().literal_prefix().to_owned(), endpoint);
            } else {
                variable.push(endpoint);
            }
        }

        variable.sort_by(|a, b| {
            comparator(a.pattern(), b.pattern())
                .then_with(|| a.pattern().matcher_str().cmp(b.pattern().matcher_str()))
        });

        // The trie wants its prefixes shortest first.
        let mut order: Vec<usize> = (0..variable.len()).collect();
        order.sort_by_key(|&index| variable[index].pattern().literal_prefix().len());

        let mut trie = PrefixTrie::builder(variable.len());
        for index in order {
            trie.push(variable[index].pattern().literal_prefix(), index);
        }

        PathRouter {
            exact,
            variable,
            trie: trie.build(),
        }
    }
}
