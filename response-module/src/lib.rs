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

//! Small leaf and wrapper handlers around response production:
//!
//! * [`FixedResponseHandler`] responds with a configured byte buffer on
//!   every request.
//! * [`Utf8DefaultHandler`] wraps another handler and defaults text-like
//!   responses without a charset to UTF-8.
//! * [`ErrorLoggingHandler`] wraps another handler and logs failed
//!   requests as the response goes out.

use async_trait::async_trait;
use bytes::Bytes;
use http::{header, HeaderName, HeaderValue, StatusCode};
use junction_handler_utils::exchange::{Commit, Exchange};
use junction_handler_utils::media_type::MediaType;
use junction_handler_utils::{HandlerError, RequestHandler};
use log::{debug, error};
use serde::de::{Deserializer, Unexpected};
use serde::Deserialize;
use std::collections::HashMap;
use std::error::Error as _;
use std::fmt::Debug;

fn deserialize_status_code<'de, D>(deserializer: D) -> Result<StatusCode, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    let status = u16::deserialize(deserializer)?;
    status.try_into().map_err(|_| {
        D::Error::invalid_value(Unexpected::Unsigned(status.into()), &"an HTTP status code")
    })
}

/// Configuration file settings of the fixed response handler
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
pub struct FixedResponseConf {
    /// The response text
    #[serde(default)]
    pub response: Option<String>,

    /// HTTP status code of the response
    #[serde(default, deserialize_with = "deserialize_status_code")]
    pub response_status: StatusCode,

    /// HTTP headers to add to the response if any
    #[serde(default)]
    pub response_headers: HashMap<String, String>,
}

/// Error raised when fixed response configuration is invalid.
#[derive(Debug, thiserror::Error)]
pub enum FixedResponseError {
    /// A configured header name is not valid.
    #[error("invalid response header name `{0}`")]
    InvalidHeaderName(String),

    /// A configured header value is not valid.
    #[error("invalid response header value for `{0}`")]
    InvalidHeaderValue(String),
}

/// Handler producing a fixed response on every request.
///
/// The body buffer is shared, concurrent requests serve it without copying
/// or mutating it.
#[derive(Debug, Clone)]
pub struct FixedResponseHandler {
    body: Bytes,
    status: StatusCode,
    headers: Vec<(HeaderName, HeaderValue)>,
}

impl FixedResponseHandler {
    /// Creates a handler responding with the given bytes and status 200.
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            status: StatusCode::OK,
            headers: Vec::new(),
        }
    }
}

impl TryFrom<FixedResponseConf> for FixedResponseHandler {
    type Error = FixedResponseError;

    fn try_from(conf: FixedResponseConf) -> Result<Self, Self::Error> {
        debug!("Fixed response configuration received: {conf:#?}");

        let mut headers = Vec::new();
        for (name, value) in conf.response_headers {
            let header_name = name
                .parse::<HeaderName>()
                .map_err(|_| FixedResponseError::InvalidHeaderName(name.clone()))?;
            let header_value = value
                .parse::<HeaderValue>()
                .map_err(|_| FixedResponseError::InvalidHeaderValue(name.clone()))?;
            headers.push((header_name, header_value));
        }

        Ok(Self {
            body: conf.response.unwrap_or_default().into(),
            status: conf.response_status,
            headers,
        })
    }
}

#[async_trait]
impl RequestHandler for FixedResponseHandler {
    async fn handle(&self, exchange: &mut Exchange) -> Result<(), HandlerError> {
        exchange.set_status(self.status);
        let headers = exchange.response_mut().headers_mut();
        for (name, value) in &self.headers {
            headers.insert(name.clone(), value.clone());
        }
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(self.body.len()));

        exchange.write_body(self.body.clone(), true).await
    }
}

fn is_text_like(media_type: &MediaType) -> bool {
    media_type.type_() == "text"
        || (media_type.type_() == "application" && media_type.subtype() == "javascript")
}

fn default_to_utf8(commit: &mut Commit<'_>) {
    let mut values = commit.response.headers().get_all(header::CONTENT_TYPE).iter();
    let value = match (values.next(), values.next()) {
        (Some(value), None) => value,
        _ => return,
    };
    let media_type: MediaType = match value.to_str().ok().and_then(|value| value.parse().ok()) {
        Some(media_type) => media_type,
        None => return,
    };

    if !is_text_like(&media_type) || media_type.parameter("charset").is_some() {
        return;
    }

    let rewritten = format!("{media_type};charset=utf-8");
    if let Ok(value) = HeaderValue::from_str(&rewritten) {
        commit
            .response
            .headers_mut()
            .insert(header::CONTENT_TYPE, value);
    }
}

/// Wrapper defaulting text responses to UTF-8.
///
/// When the committed response has exactly one `Content-Type` value that
/// parses to `text/*` or `application/javascript` without a charset, the
/// header is rewritten to include `charset=utf-8`. Anything else is left
/// untouched.
pub struct Utf8DefaultHandler {
    inner: Box<dyn RequestHandler>,
}

impl Utf8DefaultHandler {
    /// Wraps the given handler.
    pub fn new(inner: impl RequestHandler + 'static) -> Self {
        Self {
            inner: Box::new(inner),
        }
    }
}

impl Debug for Utf8DefaultHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Utf8DefaultHandler").finish_non_exhaustive()
    }
}

#[async_trait]
impl RequestHandler for Utf8DefaultHandler {
    async fn handle(&self, exchange: &mut Exchange) -> Result<(), HandlerError> {
        exchange.on_commit(default_to_utf8);
        self.inner.handle(exchange).await
    }
}

/// Wrapper logging failed requests.
///
/// When the exchange has a recorded handler error by the time the response
/// goes out, the request method and URI are logged along with the error
/// and its source chain.
pub struct ErrorLoggingHandler {
    inner: Box<dyn RequestHandler>,
}

impl ErrorLoggingHandler {
    /// Wraps the given handler.
    pub fn new(inner: impl RequestHandler + 'static) -> Self {
        Self {
            inner: Box::new(inner),
        }
    }
}

impl Debug for ErrorLoggingHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorLoggingHandler").finish_non_exhaustive()
    }
}

#[async_trait]
impl RequestHandler for ErrorLoggingHandler {
    async fn handle(&self, exchange: &mut Exchange) -> Result<(), HandlerError> {
        exchange.on_commit(|commit| {
            if let Some(handler_error) = commit.error {
                error!(
                    "{} {} failed: {handler_error}",
                    commit.request.method(),
                    commit.request.uri()
                );
                let mut source = handler_error.source();
                while let Some(cause) = source {
                    error!("caused by: {cause}");
                    source = cause.source();
                }
            }
        });
        self.inner.handle(exchange).await
    }
}
