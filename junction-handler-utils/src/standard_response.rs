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

//! Standard responses for various conditions

use http::{header, HeaderValue, Method, StatusCode};
use maud::{html, DOCTYPE};

use crate::exchange::Exchange;
use crate::HandlerError;

/// Produces the text of a standard response page for the given status code.
pub fn response_text(status: StatusCode) -> String {
    let status_str = status.as_str();
    let reason = status.canonical_reason().unwrap_or("");
    html! {
        (DOCTYPE)
        html {
            head {
                title {
                    (status_str) " " (reason)
                }
            }

            body {
                center {
                    h1 {
                        (status_str) " " (reason)
                    }
                }
            }
        }
    }
    .into()
}

/// Responds with a standard error page for the given status code.
///
/// Response headers set previously, e.g. `Allow` or `Vary`, stay in place.
/// The body is suppressed for `HEAD` requests.
pub async fn error_response(
    exchange: &mut Exchange,
    status: StatusCode,
) -> Result<(), HandlerError> {
    let text = response_text(status);

    exchange.set_status(status);
    let headers = exchange.response_mut().headers_mut();
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(text.len()));
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=utf-8"),
    );

    if exchange.method() == Method::HEAD {
        exchange.finish().await
    } else {
        exchange.write_body(text.into(), true).await
    }
}
