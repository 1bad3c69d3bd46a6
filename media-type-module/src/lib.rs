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

//! Dispatches requests on their `Content-Type` header.
//!
//! The most specific registered media type describing the request wins. A
//! missing or unparseable `Content-Type` is treated as `*/*`, so it only
//! ever reaches a handler registered for a full wildcard. Requests nothing
//! is registered for are answered with `415 Unsupported Media Type`.

use async_trait::async_trait;
use http::{header, StatusCode};
use junction_handler_utils::exchange::Exchange;
use junction_handler_utils::media_type::MediaType;
use junction_handler_utils::standard_response::error_response;
use junction_handler_utils::{ConflictError, HandlerError, RequestHandler};
use log::trace;
use std::fmt::Debug;

fn request_media_type(exchange: &Exchange) -> MediaType {
    exchange
        .request()
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
        .unwrap_or_else(|| MediaType::any().clone())
}

/// Handler dispatching on the request `Content-Type`.
pub struct MediaTypeHandler {
    /// Most specific media types first.
    handlers: Vec<(MediaType, Box<dyn RequestHandler>)>,
}

impl MediaTypeHandler {
    /// Returns a builder instance that can be used to set up the handler.
    pub fn builder() -> MediaTypeHandlerBuilder {
        MediaTypeHandlerBuilder {
            handlers: Vec::new(),
        }
    }
}

impl Debug for MediaTypeHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaTypeHandler")
            .field(
                "media_types",
                &self
                    .handlers
                    .iter()
                    .map(|(media_type, _)| media_type)
                    .collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl RequestHandler for MediaTypeHandler {
    async fn handle(&self, exchange: &mut Exchange) -> Result<(), HandlerError> {
        let content_type = request_media_type(exchange);

        if let Some((media_type, handler)) = self
            .handlers
            .iter()
            .find(|(media_type, _)| content_type.is(media_type))
        {
            trace!("Content type {content_type} dispatched to the {media_type} handler");
            handler.handle(exchange).await
        } else {
            trace!("No handler registered for content type {content_type}");
            error_response(exchange, StatusCode::UNSUPPORTED_MEDIA_TYPE).await
        }
    }
}

/// Builder for [`MediaTypeHandler`].
pub struct MediaTypeHandlerBuilder {
    handlers: Vec<(MediaType, Box<dyn RequestHandler>)>,
}

impl Debug for MediaTypeHandlerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaTypeHandlerBuilder")
            .finish_non_exhaustive()
    }
}

impl MediaTypeHandlerBuilder {
    /// Registers a handler for requests of the given media type.
    ///
    /// Fails if an equivalent media type was registered already.
    pub fn add(
        &mut self,
        media_type: MediaType,
        handler: impl RequestHandler + 'static,
    ) -> Result<(), ConflictError> {
        if let Some((existing, _)) = self
            .handlers
            .iter()
            .find(|(existing, _)| existing.is(&media_type) && media_type.is(existing))
        {
            return Err(ConflictError {
                existing: format!("media type {existing}"),
            });
        }
        self.handlers.push((media_type, Box::new(handler)));
        Ok(())
    }

    /// Finalizes the handler, ordering media types most specific first.
    pub fn build(mut self) -> MediaTypeHandler {
        self.handlers
            .sort_by(|(a, _), (b, _)| a.compare_specificity(b));
        MediaTypeHandler {
            handlers: self.handlers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use http::Method;
    use junction_handler_utils::exchange::{create_test_exchange, MemorySink, RequestHead};
    use junction_handler_utils::handle_request;
    use response_module::FixedResponseHandler;
    use test_log::test;

    fn make_handler(media_types: &[&str]) -> MediaTypeHandler {
        let mut builder = MediaTypeHandler::builder();
        for media_type in media_types {
            builder
                .add(
                    media_type.parse().unwrap(),
                    FixedResponseHandler::new(format!("consumed {media_type}")),
                )
                .unwrap();
        }
        builder.build()
    }

    async fn request(handler: &MediaTypeHandler, content_type: Option<&str>) -> MemorySink {
        let mut request = RequestHead::new(Method::POST, "/x".try_into().unwrap());
        if let Some(content_type) = content_type {
            request
                .headers_mut()
                .insert(header::CONTENT_TYPE, content_type.try_into().unwrap());
        }
        let (mut exchange, sink) = create_test_exchange(request);
        handle_request(handler, &mut exchange).await;
        sink
    }

    #[test(tokio::test)]
    async fn most_specific_type_wins() {
        let handler = make_handler(&["text/plain", "*/*"]);

        let sink = request(&handler, Some("text/plain;charset=utf-8")).await;
        assert_eq!(sink.body_str(), "consumed text/plain");

        let sink = request(&handler, Some("application/json")).await;
        assert_eq!(sink.body_str(), "consumed */*");
    }

    #[test(tokio::test)]
    async fn missing_content_type_is_a_full_wildcard() {
        let handler = make_handler(&["text/plain", "*/*"]);
        let sink = request(&handler, None).await;
        assert_eq!(sink.body_str(), "consumed */*");

        // Without a wildcard registration there is nothing to dispatch to.
        let handler = make_handler(&["text/plain"]);
        let sink = request(&handler, None).await;
        assert_eq!(
            sink.head().unwrap().status(),
            StatusCode::UNSUPPORTED_MEDIA_TYPE
        );
    }

    #[test(tokio::test)]
    async fn unparseable_content_type_is_a_full_wildcard() {
        let handler = make_handler(&["text/plain", "*/*"]);
        let sink = request(&handler, Some("garbage")).await;
        assert_eq!(sink.body_str(), "consumed */*");
    }

    #[test(tokio::test)]
    async fn unsupported_type_is_rejected() {
        let handler = make_handler(&["text/plain"]);
        let sink = request(&handler, Some("application/json")).await;
        assert_eq!(
            sink.head().unwrap().status(),
            StatusCode::UNSUPPORTED_MEDIA_TYPE
        );
    }

    #[test(tokio::test)]
    async fn parameters_constrain_dispatch() {
        let handler = make_handler(&["text/plain;format=flowed", "text/*"]);

        let sink = request(&handler, Some("text/plain;format=flowed")).await;
        assert_eq!(sink.body_str(), "consumed text/plain;format=flowed");

        let sink = request(&handler, Some("text/plain")).await;
        assert_eq!(sink.body_str(), "consumed text/*");
    }

    #[test]
    fn equivalent_media_types_conflict() {
        let mut builder = MediaTypeHandler::builder();
        builder
            .add("text/plain".parse().unwrap(), FixedResponseHandler::new("a"))
            .unwrap();
        assert!(builder
            .add("Text/Plain".parse().unwrap(), FixedResponseHandler::new("b"))
            .is_err());
        builder
            .add(
                "text/plain;charset=utf-8".parse().unwrap(),
                FixedResponseHandler::new("c"),
            )
            .unwrap();
    }
}
