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

//! The boundary between the web server and the handler graph.
//!
//! The server constructs one [`Exchange`] per request and drives the
//! outermost handler with it. Handlers read request metadata from the
//! exchange, stash data for each other in its extensions and produce the
//! response through it. The response is *committed* when the first body
//! byte goes out: at that moment all registered commit listeners run, in
//! registration order, and get a last chance to adjust the response
//! headers.

use async_trait::async_trait;
use bytes::Bytes;
use http::{header, Extensions, HeaderMap, Method, StatusCode, Uri};
use percent_encoding::percent_decode_str;
use std::borrow::Cow;
use std::fmt::Debug;
use std::sync::{Arc, Mutex};

use crate::HandlerError;

/// Request metadata handed to the handler graph by the server.
#[derive(Debug, Clone)]
pub struct RequestHead {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
}

impl RequestHead {
    /// Creates a new request head without any headers.
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            headers: HeaderMap::new(),
        }
    }

    /// Returns the request method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Returns the request URI.
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// Returns the request headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Returns a mutable reference to the request headers, meant for the
    /// server filling in the exchange.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }
}

/// Response status and headers, mutable until the response is committed.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    status: StatusCode,
    headers: HeaderMap,
}

impl ResponseHead {
    /// Returns the response status code.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Changes the response status code.
    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    /// Returns the response headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Returns a mutable reference to the response headers.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }
}

impl Default for ResponseHead {
    fn default() -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
        }
    }
}

/// View of the exchange passed to commit listeners immediately before the
/// first byte of the response is written.
#[derive(Debug)]
pub struct Commit<'a> {
    /// Request metadata.
    pub request: &'a RequestHead,

    /// Response status and headers, still mutable at this point.
    pub response: &'a mut ResponseHead,

    /// Response body length as known at commit time: the declared
    /// `Content-Length` if one is set, the size of the first body chunk
    /// otherwise.
    pub content_length: u64,

    /// Handler error recorded on the exchange if any.
    pub error: Option<&'a HandlerError>,
}

/// Listener invoked exactly once per response, immediately before the first
/// byte is written.
pub type CommitListener = Box<dyn FnOnce(&mut Commit<'_>) + Send>;

/// Server-side output of an exchange.
///
/// The server implements this trait to connect the handler graph to the
/// actual connection. `send_head` is called exactly once, before any body
/// data.
#[async_trait]
pub trait BodySink: Send {
    /// Writes out the response status line and headers.
    async fn send_head(&mut self, head: &ResponseHead) -> Result<(), HandlerError>;

    /// Writes out a chunk of the response body.
    async fn send_body(&mut self, data: Bytes, end_of_stream: bool) -> Result<(), HandlerError>;
}

/// A single request/response round trip passing through the handler graph.
pub struct Exchange {
    request: RequestHead,
    relative_path: Option<String>,
    extensions: Extensions,
    response: ResponseHead,
    listeners: Vec<CommitListener>,
    committed: bool,
    body_bytes: u64,
    error: Option<HandlerError>,
    sink: Box<dyn BodySink>,
}

impl Exchange {
    /// Creates a new exchange for the given request, writing the response
    /// out through the given sink.
    pub fn new(request: RequestHead, sink: Box<dyn BodySink>) -> Self {
        Self {
            request,
            relative_path: None,
            extensions: Extensions::new(),
            response: ResponseHead::default(),
            listeners: Vec::new(),
            committed: false,
            body_bytes: 0,
            error: None,
            sink,
        }
    }

    /// Returns the request metadata.
    pub fn request(&self) -> &RequestHead {
        &self.request
    }

    /// Returns the request method.
    pub fn method(&self) -> &Method {
        self.request.method()
    }

    /// Returns the request URI.
    pub fn uri(&self) -> &Uri {
        self.request.uri()
    }

    /// Returns the request path relative to the enclosing routing context.
    ///
    /// Unless overwritten via [`set_relative_path`](Self::set_relative_path)
    /// this is the URI path.
    pub fn relative_path(&self) -> &str {
        self.relative_path
            .as_deref()
            .unwrap_or_else(|| self.request.uri().path())
    }

    /// Overwrites the relative path, e.g. after stripping a mount prefix.
    pub fn set_relative_path(&mut self, path: impl Into<String>) {
        self.relative_path = Some(path.into());
    }

    /// Decodes the query parameters of the request URI.
    ///
    /// Parameters are returned in their order of occurrence, the same name
    /// can occur multiple times.
    pub fn query_params(&self) -> Vec<(Cow<'_, str>, Cow<'_, str>)> {
        fn decode(input: &str) -> Cow<'_, str> {
            percent_decode_str(input).decode_utf8_lossy()
        }

        self.request
            .uri()
            .query()
            .unwrap_or("")
            .split('&')
            .filter(|part| !part.is_empty())
            .map(|part| {
                let (name, value) = part.split_once('=').unwrap_or((part, ""));
                (decode(name), decode(value))
            })
            .collect()
    }

    /// Returns a reference to the attachments of this exchange.
    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    /// Returns a mutable reference to the attachments of this exchange.
    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    /// Returns the response head.
    ///
    /// After the response has been committed this keeps reflecting what was
    /// sent out.
    pub fn response(&self) -> &ResponseHead {
        &self.response
    }

    /// Returns a mutable reference to the response head.
    ///
    /// Changes made after the response has been committed are not sent.
    pub fn response_mut(&mut self) -> &mut ResponseHead {
        &mut self.response
    }

    /// Changes the response status code.
    pub fn set_status(&mut self, status: StatusCode) {
        self.response.set_status(status);
    }

    /// Registers a listener to run when the response is committed.
    ///
    /// Listeners run in registration order, each exactly once. A listener
    /// registered after the response was committed never runs.
    pub fn on_commit(&mut self, listener: impl FnOnce(&mut Commit<'_>) + Send + 'static) {
        self.listeners.push(Box::new(listener));
    }

    /// Returns the handler error recorded on this exchange if any.
    pub fn error(&self) -> Option<&HandlerError> {
        self.error.as_ref()
    }

    /// Records a handler error on this exchange.
    pub fn set_error(&mut self, error: HandlerError) {
        self.error = Some(error);
    }

    /// Checks whether the response has been committed already.
    pub fn committed(&self) -> bool {
        self.committed
    }

    /// Returns the number of response body bytes written out so far.
    pub fn body_bytes_written(&self) -> u64 {
        self.body_bytes
    }

    fn declared_content_length(&self) -> Option<u64> {
        self.response
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok())
    }

    async fn commit(&mut self, upcoming: usize) -> Result<(), HandlerError> {
        if self.committed {
            return Ok(());
        }
        self.committed = true;

        let content_length = self
            .declared_content_length()
            .unwrap_or(upcoming as u64);
        let mut commit = Commit {
            request: &self.request,
            response: &mut self.response,
            content_length,
            error: self.error.as_ref(),
        };
        for listener in std::mem::take(&mut self.listeners) {
            listener(&mut commit);
        }

        self.sink.send_head(&self.response).await
    }

    /// Writes a chunk of the response body, committing the response first
    /// if that hasn't happened yet.
    pub async fn write_body(
        &mut self,
        data: Bytes,
        end_of_stream: bool,
    ) -> Result<(), HandlerError> {
        self.commit(data.len()).await?;
        self.body_bytes += data.len() as u64;
        self.sink.send_body(data, end_of_stream).await
    }

    /// Completes the response without further body data, committing it
    /// first if necessary. This is how responses without a body go out.
    pub async fn finish(&mut self) -> Result<(), HandlerError> {
        self.write_body(Bytes::new(), true).await
    }
}

impl Debug for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exchange")
            .field("request", &self.request)
            .field("relative_path", &self.relative_path)
            .field("response", &self.response)
            .field("committed", &self.committed)
            .field("body_bytes", &self.body_bytes)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

/// In-memory sink capturing the committed response, for tests and buffering
/// servers. Cloning produces a handle sharing the captured state.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    state: Arc<Mutex<MemorySinkState>>,
}

#[derive(Debug, Default)]
struct MemorySinkState {
    head: Option<ResponseHead>,
    body: Vec<u8>,
}

impl MemorySink {
    /// Creates a new empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the response head as it was committed, if any.
    pub fn head(&self) -> Option<ResponseHead> {
        self.state.lock().unwrap().head.clone()
    }

    /// Returns the body bytes written so far.
    pub fn body(&self) -> Vec<u8> {
        self.state.lock().unwrap().body.clone()
    }

    /// Returns the body written so far, converted to a string.
    pub fn body_str(&self) -> String {
        String::from_utf8_lossy(&self.state.lock().unwrap().body).into_owned()
    }
}

#[async_trait]
impl BodySink for MemorySink {
    async fn send_head(&mut self, head: &ResponseHead) -> Result<(), HandlerError> {
        self.state.lock().unwrap().head = Some(head.clone());
        Ok(())
    }

    async fn send_body(&mut self, data: Bytes, _end_of_stream: bool) -> Result<(), HandlerError> {
        self.state.lock().unwrap().body.extend_from_slice(&data);
        Ok(())
    }
}

/// Creates a new exchange for tests with the given request head.
///
/// The returned sink handle shares state with the exchange and can be used
/// to inspect the committed response.
pub fn create_test_exchange(request: RequestHead) -> (Exchange, MemorySink) {
    let sink = MemorySink::new();
    let exchange = Exchange::new(request, Box::new(sink.clone()));
    (exchange, sink)
}

#[cfg(test)]
mod tests {
    use super::*;

    use http::HeaderValue;
    use test_log::test;

    fn make_exchange(uri: &str) -> (Exchange, MemorySink) {
        create_test_exchange(RequestHead::new(Method::GET, uri.try_into().unwrap()))
    }

    #[test(tokio::test)]
    async fn commit_fires_listeners_in_registration_order() {
        let (mut exchange, sink) = make_exchange("/");

        exchange.on_commit(|commit| {
            commit
                .response
                .headers_mut()
                .insert("X-Test", HeaderValue::from_static("first"));
        });
        exchange.on_commit(|commit| {
            commit
                .response
                .headers_mut()
                .insert("X-Test", HeaderValue::from_static("second"));
        });

        exchange.write_body("hi".into(), true).await.unwrap();

        let head = sink.head().unwrap();
        assert_eq!(head.headers().get("X-Test").unwrap(), "second");
        assert_eq!(sink.body_str(), "hi");
    }

    #[test(tokio::test)]
    async fn commit_fires_once() {
        let (mut exchange, sink) = make_exchange("/");

        exchange.set_status(StatusCode::NOT_FOUND);
        exchange.write_body("a".into(), false).await.unwrap();

        // Status changes after commit aren't sent.
        exchange.set_status(StatusCode::OK);
        exchange.write_body("b".into(), true).await.unwrap();

        assert_eq!(sink.head().unwrap().status(), StatusCode::NOT_FOUND);
        assert_eq!(sink.body_str(), "ab");
        assert_eq!(exchange.body_bytes_written(), 2);
    }

    #[test(tokio::test)]
    async fn content_length_at_commit() {
        let (mut exchange, _sink) = make_exchange("/");
        exchange.on_commit(|commit| assert_eq!(commit.content_length, 2));
        exchange.write_body("hi".into(), true).await.unwrap();

        let (mut exchange, _sink) = make_exchange("/");
        exchange
            .response_mut()
            .headers_mut()
            .insert(header::CONTENT_LENGTH, HeaderValue::from(1234));
        exchange.on_commit(|commit| assert_eq!(commit.content_length, 1234));
        exchange.finish().await.unwrap();
    }

    #[test(tokio::test)]
    async fn error_visible_to_listeners() {
        let (mut exchange, sink) = make_exchange("/");
        exchange.set_error(HandlerError::Application("gone wrong".into()));
        exchange.on_commit(|commit| assert!(commit.error.is_some()));
        exchange.finish().await.unwrap();
        assert!(sink.head().is_some());
    }

    #[test]
    fn query_params() {
        let (exchange, _sink) = make_exchange("/search?q=a%20b&lang=en&flag");
        let params = exchange.query_params();
        assert_eq!(
            params,
            vec![
                ("q".into(), "a b".into()),
                ("lang".into(), "en".into()),
                ("flag".into(), "".into()),
            ]
        );
    }

    #[test]
    fn relative_path_defaults_to_uri_path() {
        let (mut exchange, _sink) = make_exchange("/dir/file?x=1");
        assert_eq!(exchange.relative_path(), "/dir/file");
        exchange.set_relative_path("/file");
        assert_eq!(exchange.relative_path(), "/file");
    }
}
