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

//! Negotiates the response media type via the request's `Accept` header.
//!
//! Producers are registered with the media type they produce. The accepted
//! media types are tried most-preferred first (higher quality, then higher
//! specificity), each against the producers in specificity order, and the
//! first compatible producer wins. Requests accepting none of the
//! registered types are answered with `406 Not Acceptable`.
//!
//! Every response gets `Vary: Accept`. The winning producer's media type
//! becomes the response `Content-Type` at commit time, unless the producer
//! type has a wildcard component, a `Content-Type` is present already, the
//! exchange has a recorded error, the status is `204`, or the body is empty
//! with a status outside the 2xx range.

use async_trait::async_trait;
use http::{header, HeaderValue, StatusCode};
use junction_handler_utils::exchange::{Commit, Exchange};
use junction_handler_utils::media_type::{parse_accept, MediaType, QualifiedMediaType};
use junction_handler_utils::standard_response::error_response;
use junction_handler_utils::{ConflictError, HandlerError, RequestHandler};
use log::trace;
use std::fmt::Debug;

fn accepted_media_types(exchange: &Exchange) -> Vec<QualifiedMediaType> {
    let header_value = match exchange.request().headers().get(header::ACCEPT) {
        // No preference means everything is acceptable.
        None => return vec![QualifiedMediaType::new(MediaType::any().clone(), 1.0)],
        Some(value) => value,
    };

    // An unreadable header accepts nothing.
    header_value
        .to_str()
        .ok()
        .and_then(|header| parse_accept(header).ok())
        .unwrap_or_default()
}

fn set_content_type(commit: &mut Commit<'_>, produced: &MediaType) {
    if produced.has_wildcard() {
        return;
    }
    if commit.response.headers().contains_key(header::CONTENT_TYPE) {
        return;
    }
    if commit.error.is_some() {
        return;
    }
    let status = commit.response.status();
    if status == StatusCode::NO_CONTENT {
        return;
    }
    // An empty body outside the 2xx range keeps its Content-Type unset.
    // Kept from the original behavior, possibly subject to revision.
    if commit.content_length == 0 && !status.is_success() {
        return;
    }

    if let Ok(value) = HeaderValue::from_str(&produced.to_string()) {
        commit
            .response
            .headers_mut()
            .insert(header::CONTENT_TYPE, value);
    }
}

/// Handler negotiating the response media type.
pub struct AcceptHandler {
    /// Most specific media types first.
    producers: Vec<(MediaType, Box<dyn RequestHandler>)>,
}

impl AcceptHandler {
    /// Returns a builder instance that can be used to set up the handler.
    pub fn builder() -> AcceptHandlerBuilder {
        AcceptHandlerBuilder {
            producers: Vec::new(),
        }
    }
}

impl Debug for AcceptHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcceptHandler")
            .field(
                "producers",
                &self
                    .producers
                    .iter()
                    .map(|(media_type, _)| media_type)
                    .collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl RequestHandler for AcceptHandler {
    async fn handle(&self, exchange: &mut Exchange) -> Result<(), HandlerError> {
        exchange
            .response_mut()
            .headers_mut()
            .append(header::VARY, HeaderValue::from_static("Accept"));

        let accepted = accepted_media_types(exchange);
        for accepted_type in &accepted {
            for (produced, handler) in &self.producers {
                if accepted_type.media_type().compatible_with(produced) {
                    trace!(
                        "Accepted type {} routed to the {produced} producer",
                        accepted_type.media_type()
                    );
                    let content_type = produced.clone();
                    exchange.on_commit(move |commit| set_content_type(commit, &content_type));
                    return handler.handle(exchange).await;
                }
            }
        }

        trace!("No producer matches the accepted media types");
        error_response(exchange, StatusCode::NOT_ACCEPTABLE).await
    }
}

/// Builder for [`AcceptHandler`].
pub struct AcceptHandlerBuilder {
    producers: Vec<(MediaType, Box<dyn RequestHandler>)>,
}

impl Debug for AcceptHandlerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcceptHandlerBuilder").finish_non_exhaustive()
    }
}

impl AcceptHandlerBuilder {
    /// Registers a producer for the given media type.
    ///
    /// Fails if an equivalent media type was registered already.
    pub fn add(
        &mut self,
        media_type: MediaType,
        handler: impl RequestHandler + 'static,
    ) -> Result<(), ConflictError> {
        if let Some((existing, _)) = self
            .producers
            .iter()
            .find(|(existing, _)| existing.is(&media_type) && media_type.is(existing))
        {
            return Err(ConflictError {
                existing: format!("media type {existing}"),
            });
        }
        self.producers.push((media_type, Box::new(handler)));
        Ok(())
    }

    /// Finalizes the handler, ordering producers most specific first.
    pub fn build(mut self) -> AcceptHandler {
        self.producers
            .sort_by(|(a, _), (b, _)| a.compare_specificity(b));
        AcceptHandler {
            producers: self.producers,
        }
    }
}
