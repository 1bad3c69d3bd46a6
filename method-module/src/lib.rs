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

//! Dispatches requests on the HTTP method.
//!
//! Besides forwarding to the registered handlers this synthesizes the
//! common method plumbing: `OPTIONS` is answered with an `Allow` header and
//! an empty body unless a handler was registered for it, `HEAD` falls back
//! to the `GET` handler (the server suppresses the body), and anything else
//! without a handler is answered with `405 Method Not Allowed`.

use async_trait::async_trait;
use http::{header, HeaderValue, Method, StatusCode};
use junction_handler_utils::exchange::Exchange;
use junction_handler_utils::standard_response::error_response;
use junction_handler_utils::{ConflictError, HandlerError, RequestHandler};
use log::trace;
use std::collections::{hash_map, BTreeSet, HashMap};
use std::fmt::Debug;

/// Handler dispatching on the request method.
pub struct MethodHandler {
    handlers: HashMap<Method, Box<dyn RequestHandler>>,
    allow: HeaderValue,
}

impl MethodHandler {
    /// Returns a builder instance that can be used to set up the handler.
    pub fn builder() -> MethodHandlerBuilder {
        MethodHandlerBuilder {
            handlers: HashMap::new(),
        }
    }
}

impl Debug for MethodHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodHandler")
            .field("allow", &self.allow)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl RequestHandler for MethodHandler {
    async fn handle(&self, exchange: &mut Exchange) -> Result<(), HandlerError> {
        if let Some(handler) = self.handlers.get(exchange.method()) {
            return handler.handle(exchange).await;
        }

        if exchange.method() == Method::OPTIONS {
            trace!("Synthesizing OPTIONS response, Allow: {:?}", self.allow);
            exchange
                .response_mut()
                .headers_mut()
                .insert(header::ALLOW, self.allow.clone());
            exchange.set_status(StatusCode::OK);
            return exchange.finish().await;
        }

        if exchange.method() == Method::HEAD {
            if let Some(handler) = self.handlers.get(&Method::GET) {
                trace!("No HEAD handler, falling back to GET");
                return handler.handle(exchange).await;
            }
        }

        exchange
            .response_mut()
            .headers_mut()
            .insert(header::ALLOW, self.allow.clone());
        error_response(exchange, StatusCode::METHOD_NOT_ALLOWED).await
    }
}

/// Builder for [`MethodHandler`].
pub struct MethodHandlerBuilder {
    handlers: HashMap<Method, Box<dyn RequestHandler>>,
}

impl Debug for MethodHandlerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodHandlerBuilder")
            .field("methods", &self.handlers.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl MethodHandlerBuilder {
    /// Registers a handler for the given method.
    ///
    /// Registering an `OPTIONS` or `HEAD` handler disables the respective
    /// synthesized behavior.
    pub fn add(
        &mut self,
        method: Method,
        handler: impl RequestHandler + 'static,
    ) -> Result<(), ConflictError> {
        match self.handlers.entry(method) {
            hash_map::Entry::Occupied(existing) => Err(ConflictError {
                existing: format!("method {}", existing.key()),
            }),
            hash_map::Entry::Vacant(vacant) => {
                vacant.insert(Box::new(handler));
                Ok(())
            }
        }
    }

    /// Finalizes the handler, computing the `Allow` header value.
    pub fn build(self) -> MethodHandler {
        let mut methods: BTreeSet<&str> = self
            .handlers
            .keys()
            .map(|method| method.as_str())
            .collect();
        methods.insert("OPTIONS");
        if methods.contains("GET") {
            methods.insert("HEAD");
        }
        let allow = methods.into_iter().collect::<Vec<_>>().join(", ");

        MethodHandler {
            // Method names consist of token characters, always a valid
            // header value.
            allow: HeaderValue::from_str(&allow).unwrap(),
            handlers: self.handlers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use junction_handler_utils::exchange::{create_test_exchange, MemorySink, RequestHead};
    use junction_handler_utils::handle_request;
    use response_module::FixedResponseHandler;
    use test_log::test;

    fn make_handler(methods: &[Method]) -> MethodHandler {
        let mut builder = MethodHandler::builder();
        for method in methods {
            builder
                .add(
                    method.clone(),
                    FixedResponseHandler::new(format!("{method} response")),
                )
                .unwrap();
        }
        builder.build()
    }

    async fn request(handler: &MethodHandler, method: Method) -> MemorySink {
        let request = RequestHead::new(method, "/x".try_into().unwrap());
        let (mut exchange, sink) = create_test_exchange(request);
        handle_request(handler, &mut exchange).await;
        sink
    }

    fn allow_header(sink: &MemorySink) -> Vec<String> {
        let head = sink.head().unwrap();
        let value = head.headers().get(header::ALLOW).unwrap().to_str().unwrap().to_owned();
        let mut methods: Vec<String> = value.split(',').map(|m| m.trim().to_owned()).collect();
        methods.sort();
        methods
    }

    #[test(tokio::test)]
    async fn registered_method_forwards() {
        let handler = make_handler(&[Method::GET, Method::POST]);
        let sink = request(&handler, Method::GET).await;
        assert_eq!(sink.head().unwrap().status(), StatusCode::OK);
        assert_eq!(sink.body_str(), "GET response");

        let sink = request(&handler, Method::POST).await;
        assert_eq!(sink.body_str(), "POST response");
    }

    #[test(tokio::test)]
    async fn options_is_synthesized() {
        let handler = make_handler(&[Method::GET]);
        let sink = request(&handler, Method::OPTIONS).await;

        let head = sink.head().unwrap();
        assert_eq!(head.status(), StatusCode::OK);
        assert!(sink.body().is_empty());
        assert_eq!(allow_header(&sink), vec!["GET", "HEAD", "OPTIONS"]);
    }

    #[test(tokio::test)]
    async fn unregistered_method_is_rejected() {
        let handler = make_handler(&[Method::GET]);
        let sink = request(&handler, Method::POST).await;

        let head = sink.head().unwrap();
        assert_eq!(head.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(allow_header(&sink), vec!["GET", "HEAD", "OPTIONS"]);
    }

    #[test(tokio::test)]
    async fn head_falls_back_to_get() {
        let handler = make_handler(&[Method::GET]);
        let sink = request(&handler, Method::HEAD).await;
        // The surrounding server suppresses the body for HEAD.
        assert_eq!(sink.body_str(), "GET response");

        let handler = make_handler(&[Method::POST]);
        let sink = request(&handler, Method::HEAD).await;
        assert_eq!(
            sink.head().unwrap().status(),
            StatusCode::METHOD_NOT_ALLOWED
        );
        assert_eq!(allow_header(&sink), vec!["OPTIONS", "POST"]);
    }

    #[test(tokio::test)]
    async fn explicit_handlers_override_synthesis() {
        let mut builder = MethodHandler::builder();
        builder
            .add(Method::GET, FixedResponseHandler::new("get"))
            .unwrap();
        builder
            .add(Method::OPTIONS, FixedResponseHandler::new("custom options"))
            .unwrap();
        builder
            .add(Method::HEAD, FixedResponseHandler::new("custom head"))
            .unwrap();
        let handler = builder.build();

        let sink = request(&handler, Method::OPTIONS).await;
        assert_eq!(sink.body_str(), "custom options");

        let sink = request(&handler, Method::HEAD).await;
        assert_eq!(sink.body_str(), "custom head");
    }

    #[test(tokio::test)]
    async fn extension_methods() {
        let mut builder = MethodHandler::builder();
        builder
            .add(
                Method::from_bytes(b"PURGE").unwrap(),
                FixedResponseHandler::new("purged"),
            )
            .unwrap();
        let handler = builder.build();

        let sink = request(&handler, Method::from_bytes(b"PURGE").unwrap()).await;
        assert_eq!(sink.body_str(), "purged");
        let sink = request(&handler, Method::GET).await;
        assert_eq!(allow_header(&sink), vec!["OPTIONS", "PURGE"]);
    }

    #[test]
    fn duplicate_method_conflicts() {
        let mut builder = MethodHandler::builder();
        builder
            .add(Method::GET, FixedResponseHandler::new("a"))
            .unwrap();
        assert!(builder
            .add(Method::GET, FixedResponseHandler::new("b"))
            .is_err());
    }
}
