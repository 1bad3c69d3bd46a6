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

//! Dispatches requests by matching the request path against a set of path
//! patterns and forwarding to the handler of the best match.
//!
//! On a hit the matched pattern and the captured variable values are
//! attached to the exchange as a [`RouteState`], where inner handlers can
//! pick them up. A nested path handler overwrites the attachment of the
//! outer one. On a miss the handler responds with `404 Not Found`.

use async_trait::async_trait;
use http::StatusCode;
use junction_handler_utils::exchange::Exchange;
use junction_handler_utils::pattern::Variables;
use junction_handler_utils::router::{PathRouter, RouterBuilder, RouterError};
use junction_handler_utils::standard_response::error_response;
use junction_handler_utils::{HandlerError, RequestHandler};
use log::trace;
use std::fmt::Debug;

/// Path-match result attached to the exchange on every hit.
#[derive(Debug, Clone)]
pub struct RouteState {
    /// Source text of the pattern that matched.
    pub pattern: String,

    /// Variable values captured from the path, empty for literal patterns.
    pub variables: Variables,
}

/// Handler dispatching on the request path via a [`PathRouter`].
pub struct PathHandler {
    router: PathRouter<Box<dyn RequestHandler>>,
}

impl PathHandler {
    /// Returns a builder instance that can be used to set up the handler.
    pub fn builder() -> PathHandlerBuilder {
        PathHandlerBuilder {
            router: PathRouter::builder(),
        }
    }
}

impl Debug for PathHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathHandler").finish_non_exhaustive()
    }
}

#[async_trait]
impl RequestHandler for PathHandler {
    async fn handle(&self, exchange: &mut Exchange) -> Result<(), HandlerError> {
        let path = exchange.relative_path().to_owned();
        if let Some(found) = self.router.find(&path) {
            trace!("Path {path} matched pattern {}", found.pattern());
            let state = RouteState {
                pattern: found.pattern().source().to_owned(),
                variables: found.variables().clone(),
            };
            let handler = found.value();

            // Deliberately replaces the attachment of any outer router.
            exchange.extensions_mut().insert(state);
            handler.handle(exchange).await
        } else {
            trace!("No pattern matched path {path}");
            error_response(exchange, StatusCode::NOT_FOUND).await
        }
    }
}

/// Builder for [`PathHandler`], delegating to the router builder.
///
/// Like the router builder it serializes additions internally and can be
/// shared by multiple setup tasks.
pub struct PathHandlerBuilder {
    router: RouterBuilder<Box<dyn RequestHandler>>,
}

impl Debug for PathHandlerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathHandlerBuilder").finish_non_exhaustive()
    }
}

impl PathHandlerBuilder {
    /// Registers a handler under the given path pattern.
    pub fn add(
        &self,
        pattern: &str,
        handler: impl RequestHandler + 'static,
    ) -> Result<(), RouterError> {
        self.router.add(pattern, Box::new(handler))
    }

    /// Registers a boxed handler under the given path pattern.
    pub fn add_boxed(
        &self,
        pattern: &str,
        handler: Box<dyn RequestHandler>,
    ) -> Result<(), RouterError> {
        self.router.add(pattern, handler)
    }

    /// Finalizes the handler, trying patterns from most to least specific.
    pub fn build(self) -> PathHandler {
        PathHandler {
            router: self.router.build(),
        }
    }
}
