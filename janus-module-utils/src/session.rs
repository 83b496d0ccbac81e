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

//! Per-request session with response capture.
//!
//! [`Session`] buffers status, headers and body so that rule commands can
//! inspect and rewrite the response before anything reaches the client. It
//! also owns the per-request scratch data ([`SharedData`]) lazily parsed
//! from the request: cookies, query pairs, form values, basic-auth
//! credentials and the remote IP.

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use http::uri::PathAndQuery;
use http::{header, HeaderMap, HeaderValue, Request, Response, StatusCode, Uri, Version};
use log::error;
use std::net::{IpAddr, SocketAddr};

use crate::query::{parse_cookie_header, parse_query, serialize_cookie_header, serialize_query};

/// Lazy per-request caches of request data.
///
/// Every cache is parsed at most once per request. The mutators write the
/// modified values back into the underlying request so that the upstream
/// sees them.
#[derive(Debug, Default)]
pub struct SharedData {
    cookies: Option<Vec<(String, String)>>,
    queries: Option<Vec<(String, String)>>,
    post_form: Option<Vec<(String, String)>>,
    basic_auth: Option<Option<(String, String)>>,
}

/// Per-request state: the buffered request, the captured response and the
/// shared scratch data.
///
/// The response capture starts out empty; `status` stays unset until a
/// command or the upstream writes one. [`Session::flush_release`] is
/// idempotent and reports accumulated pipeline errors exactly once.
#[derive(Debug)]
pub struct Session {
    request: Request<Vec<u8>>,
    peer_addr: Option<SocketAddr>,
    tls: bool,
    upstream_name: Option<String>,

    status: Option<StatusCode>,
    headers: HeaderMap,
    body: Vec<u8>,

    shared: SharedData,
    errors: Vec<String>,
    flushed: bool,
}

impl Session {
    pub fn new(request: Request<Vec<u8>>) -> Self {
        Self {
            request,
            peer_addr: None,
            tls: false,
            upstream_name: None,
            status: None,
            headers: HeaderMap::new(),
            body: Vec::new(),
            shared: SharedData::default(),
            errors: Vec::new(),
            flushed: false,
        }
    }

    pub fn with_peer_addr(mut self, addr: SocketAddr) -> Self {
        self.peer_addr = Some(addr);
        self
    }

    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    pub fn with_upstream_name(mut self, name: impl Into<String>) -> Self {
        self.upstream_name = Some(name.into());
        self
    }

    pub fn req(&self) -> &Request<Vec<u8>> {
        &self.request
    }

    pub fn req_mut(&mut self) -> &mut Request<Vec<u8>> {
        &mut self.request
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn is_tls(&self) -> bool {
        self.tls
    }

    pub fn upstream_name(&self) -> Option<&str> {
        self.upstream_name.as_deref()
    }

    /// Major HTTP version of the incoming request.
    pub fn proto_major(&self) -> u8 {
        match self.request.version() {
            Version::HTTP_2 => 2,
            Version::HTTP_3 => 3,
            _ => 1,
        }
    }

    /// Host name of the request, from the `Host` header or the request URI.
    pub fn host(&self) -> &str {
        if let Some(host) = self
            .request
            .headers()
            .get(header::HOST)
            .and_then(|value| value.to_str().ok())
        {
            return host;
        }
        self.request.uri().host().unwrap_or("")
    }

    // ---- response capture -------------------------------------------------

    /// Captured status code, `0` when nothing has been written yet.
    pub fn status_code(&self) -> u16 {
        self.status.map(|status| status.as_u16()).unwrap_or(0)
    }

    pub fn has_status(&self) -> bool {
        self.status.is_some()
    }

    /// Sets the response status. Later writes overwrite earlier ones, the
    /// buffered response is only fixed at flush time.
    pub fn write_header(&mut self, status: StatusCode) {
        self.status = Some(status);
    }

    /// The mutable response header map.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn write_body(&mut self, chunk: &[u8]) {
        self.body.extend_from_slice(chunk);
    }

    pub fn reset_body(&mut self) {
        self.body.clear();
    }

    pub fn set_body(&mut self, body: Vec<u8>) {
        self.body = body;
    }

    /// Whether the captured response body may be replaced.
    ///
    /// Replacement is refused for non-identity transfer or content encodings
    /// and for content types that are not text-like. Encoded bodies are
    /// never decoded.
    pub fn may_modify_body(&self) -> bool {
        for value in self.headers.get_all(header::TRANSFER_ENCODING) {
            match value.to_str() {
                Ok(encoding) if encoding.eq_ignore_ascii_case("identity") => {}
                _ => return false,
            }
        }
        if let Some(value) = self.headers.get(header::CONTENT_ENCODING) {
            match value.to_str() {
                Ok(encoding) if encoding.eq_ignore_ascii_case("identity") => {}
                _ => return false,
            }
        }

        let content_type = match self
            .headers
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
        {
            Some(value) => value,
            None => return false,
        };
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();

        essence.starts_with("text/")
            || essence == "application/json"
            || essence.ends_with("+json")
            || essence == "application/xml"
            || essence.ends_with("+xml")
            || essence == "application/x-www-form-urlencoded"
            || ["yaml", "toml", "javascript", "ecmascript", "csv"]
                .iter()
                .any(|marker| essence.contains(marker))
    }

    /// Records a non-fatal error surfaced during pipeline execution. All
    /// accumulated errors are logged on flush.
    pub fn append_error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    /// Marks the response as flushed and reports accumulated errors once.
    /// Safe to call on every exit path.
    pub fn flush_release(&mut self) {
        if self.flushed {
            return;
        }
        self.flushed = true;

        if !self.errors.is_empty() {
            let method = self.request.method().clone();
            let path = self.request.uri().path().to_owned();
            let host = self.host().to_owned();
            for err in &self.errors {
                error!("error executing rules: {err} (method: {method}, url: {host}{path})");
            }
        }
    }

    /// Converts the captured response into an [`http::Response`]. An unset
    /// status becomes `200 OK`; `Content-Length` reflects the buffered body.
    pub fn into_response(mut self) -> Response<Vec<u8>> {
        self.flush_release();

        let mut response = Response::new(Vec::new());
        *response.status_mut() = self.status.unwrap_or(StatusCode::OK);
        *response.headers_mut() = self.headers;
        response.headers_mut().insert(
            header::CONTENT_LENGTH,
            HeaderValue::from_str(&self.body.len().to_string())
                .expect("usize formats as a valid header value"),
        );
        *response.body_mut() = self.body;
        response
    }

    // ---- shared data ------------------------------------------------------

    /// Request cookies, parsed once from the `Cookie` header.
    pub fn cookies(&mut self) -> &[(String, String)] {
        if self.shared.cookies.is_none() {
            let cookies = self
                .request
                .headers()
                .get(header::COOKIE)
                .and_then(|value| value.to_str().ok())
                .map(parse_cookie_header)
                .unwrap_or_default();
            self.shared.cookies = Some(cookies);
        }
        self.shared.cookies.as_deref().unwrap_or_default()
    }

    /// Query pairs, parsed once from the request URI.
    pub fn queries(&mut self) -> &[(String, String)] {
        if self.shared.queries.is_none() {
            let queries = parse_query(self.request.uri().query().unwrap_or(""));
            self.shared.queries = Some(queries);
        }
        self.shared.queries.as_deref().unwrap_or_default()
    }

    /// Form pairs from the request body, parsed once. Empty unless the body
    /// is `application/x-www-form-urlencoded`.
    pub fn post_form(&mut self) -> &[(String, String)] {
        if self.shared.post_form.is_none() {
            let is_form = self
                .request
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .map(|value| {
                    value
                        .split(';')
                        .next()
                        .unwrap_or("")
                        .trim()
                        .eq_ignore_ascii_case("application/x-www-form-urlencoded")
                })
                .unwrap_or(false);
            let pairs = if is_form {
                parse_query(&String::from_utf8_lossy(self.request.body()))
            } else {
                Vec::new()
            };
            self.shared.post_form = Some(pairs);
        }
        self.shared.post_form.as_deref().unwrap_or_default()
    }

    /// First form value for `key`, body values taking precedence over query
    /// values.
    pub fn form_value(&mut self, key: &str) -> Option<String> {
        if let Some((_, value)) = self.post_form().iter().find(|(name, _)| name == key) {
            return Some(value.clone());
        }
        self.queries()
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.clone())
    }

    /// First body-form value for `key`.
    pub fn post_form_value(&mut self, key: &str) -> Option<String> {
        self.post_form()
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.clone())
    }

    /// Decoded basic-auth credentials from the `Authorization` header,
    /// parsed once.
    pub fn basic_auth(&mut self) -> Option<&(String, String)> {
        if self.shared.basic_auth.is_none() {
            let credentials = self
                .request
                .headers()
                .get(header::AUTHORIZATION)
                .and_then(|value| value.to_str().ok())
                .and_then(|auth| {
                    let (scheme, payload) = auth.split_once(' ')?;
                    if scheme != "Basic" {
                        return None;
                    }
                    let decoded = BASE64_STANDARD.decode(payload.trim()).ok()?;
                    let decoded = String::from_utf8(decoded).ok()?;
                    let (user, password) = decoded.split_once(':')?;
                    Some((user.to_owned(), password.to_owned()))
                });
            self.shared.basic_auth = Some(credentials);
        }
        self.shared.basic_auth.as_ref().and_then(|auth| auth.as_ref())
    }

    /// IP address of the remote peer.
    pub fn remote_ip(&self) -> Option<IpAddr> {
        self.peer_addr.map(|addr| addr.ip())
    }

    /// Applies `update` to the cached query pairs and re-serializes them
    /// into the request URI.
    pub fn update_queries(&mut self, update: impl FnOnce(&mut Vec<(String, String)>)) {
        self.queries();
        let queries = self.shared.queries.as_mut().expect("queries just parsed");
        update(queries);
        let serialized = serialize_query(queries);

        let mut parts = self.request.uri().clone().into_parts();
        let path = self.request.uri().path();
        let path_and_query = if serialized.is_empty() {
            path.to_owned()
        } else {
            format!("{path}?{serialized}")
        };
        if let Ok(path_and_query) = path_and_query.parse::<PathAndQuery>() {
            parts.path_and_query = Some(path_and_query);
            if let Ok(uri) = Uri::from_parts(parts) {
                *self.request.uri_mut() = uri;
            }
        }
    }

    /// Applies `update` to the cached cookies and re-serializes them into
    /// the `Cookie` header.
    pub fn update_cookies(&mut self, update: impl FnOnce(&mut Vec<(String, String)>)) {
        self.cookies();
        let cookies = self.shared.cookies.as_mut().expect("cookies just parsed");
        update(cookies);

        if cookies.is_empty() {
            self.request.headers_mut().remove(header::COOKIE);
        } else if let Ok(value) = HeaderValue::from_str(&serialize_cookie_header(cookies)) {
            self.request.headers_mut().insert(header::COOKIE, value);
        }
    }
}
