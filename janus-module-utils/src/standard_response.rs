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

use http::{header, method::Method, status::StatusCode};
use maud::{html, DOCTYPE};

use crate::Session;

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

fn response(session: &mut Session, status: StatusCode, location: Option<&str>) {
    let text = response_text(status);

    session.reset_body();
    session.write_header(status);
    session.headers_mut().insert(
        header::CONTENT_TYPE,
        "text/html; charset=utf-8".try_into().expect("static header value"),
    );
    if let Some(location) = location {
        if let Ok(value) = location.try_into() {
            session.headers_mut().insert(header::LOCATION, value);
        }
    }

    if session.req().method() != Method::HEAD {
        session.write_body(text.as_bytes());
    }
}

/// Responds with a standard error page for the given status code.
pub fn error_response(session: &mut Session, status: StatusCode) {
    response(session, status, None);
}

/// Responds with a redirect to the given location.
pub fn redirect_response(session: &mut Session, status: StatusCode, location: &str) {
    response(session, status, Some(location));
}
