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

//! # Junction handler utilities
//!
//! This crate contains the building blocks shared by all Junction handler
//! crates: the [`Exchange`](exchange::Exchange) type connecting handlers to
//! the web server, the [`RequestHandler`] trait, path patterns and routing,
//! media type matching and standard responses.

pub mod exchange;
pub mod media_type;
pub mod pattern;
pub mod router;
pub mod standard_response;
mod trie;

use async_trait::async_trait;
use http::StatusCode;
use log::{trace, warn};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use thiserror::Error;

use exchange::Exchange;

/// Error raised while a handler processes a request.
///
/// Malformed client input never produces this error, it is mapped to the
/// appropriate client error status instead. This error indicates an actual
/// failure, e.g. the connection going away mid-response or an application
/// handler giving up.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The response could not be written out to the client.
    #[error("failed writing response: {0}")]
    Write(#[source] std::io::Error),

    /// Failure raised by an application handler.
    #[error(transparent)]
    Application(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// Error raised when a builder receives a registration equivalent to an
/// existing one.
#[derive(Debug, Error)]
#[error("already registered: {existing}")]
pub struct ConflictError {
    /// Describes the registration that was added first.
    pub existing: String,
}

/// Trait to be implemented by request handlers.
///
/// A handler implements a single dispatch policy: it consults the request
/// metadata of the exchange and either forwards to an inner handler or
/// writes a terminal response. Handlers are constructed once at startup and
/// shared by all request serving tasks, so implementations carry no mutable
/// state.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Processes the exchange.
    async fn handle(&self, exchange: &mut Exchange) -> Result<(), HandlerError>;
}

#[async_trait]
impl RequestHandler for Box<dyn RequestHandler> {
    async fn handle(&self, exchange: &mut Exchange) -> Result<(), HandlerError> {
        (**self).handle(exchange).await
    }
}

/// Runs a handler over an exchange the way a server does.
///
/// A handler error is recorded on the exchange and turns the response into a
/// 500 unless something was sent already. The response is committed in
/// either case, so commit listeners fire on the error path as well.
pub async fn handle_request(handler: &(impl RequestHandler + ?Sized), exchange: &mut Exchange) {
    if let Err(error) = handler.handle(exchange).await {
        warn!(
            "handler failed for {} {}: {error}",
            exchange.method(),
            exchange.uri()
        );
        if !exchange.committed() {
            exchange.set_status(StatusCode::INTERNAL_SERVER_ERROR);
        }
        exchange.set_error(error);
    }

    if let Err(error) = exchange.finish().await {
        warn!("failed finishing response: {error}");
    }
}

/// Trait for configuration structures that can be loaded from YAML strings.
/// This trait has a blanket implementation for any structure implementing
/// [`serde::Deserialize`].
pub trait FromYaml {
    /// Loads configuration from a YAML string.
    fn from_yaml(yaml_conf: impl AsRef<str>) -> Result<Self, serde_yaml::Error>
    where
        Self: Sized;
}

impl<D> FromYaml for D
where
    D: Debug + DeserializeOwned,
{
    fn from_yaml(yaml_conf: impl AsRef<str>) -> Result<Self, serde_yaml::Error> {
        let conf = serde_yaml::from_str(yaml_conf.as_ref())?;
        trace!("Loaded configuration: {conf:#?}");

        Ok(conf)
    }
}
