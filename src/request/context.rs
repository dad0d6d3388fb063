// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use tracing::trace;
use url::{form_urlencoded, Url};

use crate::envelope::{Envelope, EnvelopeOptions};
use crate::network::{ProtocolMode, RequestFrame, RequestHeader, ResponseHeader};
use crate::routing::{RouteParams, Verb};
use crate::transfer::keys;
use crate::{AppError, AppResult};

use super::Extensions;

/// Target of a request, resolved once when the context is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestUri {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub query: Vec<(String, String)>,
}

impl RequestUri {
    /// Host and port come from the `Host` header when present, otherwise from
    /// the local address the request arrived on.
    pub fn resolve(header: &RequestHeader, local_addr: Option<SocketAddr>) -> RequestUri {
        let (default_host, default_port) = match local_addr {
            Some(addr) => (addr.ip().to_string(), addr.port()),
            None => ("localhost".to_string(), 0),
        };

        // absolute-form request target
        if header.path.starts_with("http://") || header.path.starts_with("https://") {
            if let Ok(url) = Url::parse(&header.path) {
                return RequestUri {
                    host: url.host_str().unwrap_or(&default_host).to_string(),
                    port: url.port_or_known_default().unwrap_or(default_port),
                    path: url.path().to_string(),
                    query: url.query_pairs().into_owned().collect(),
                };
            }
        }

        let (host, port) = match header.headers.get("Host") {
            Some(value) => split_host(value, default_port),
            None => (default_host, default_port),
        };
        let (path, query) = match header.path.split_once('?') {
            Some((path, query)) => (
                path.to_string(),
                form_urlencoded::parse(query.as_bytes())
                    .into_owned()
                    .collect(),
            ),
            None => (header.path.clone(), Vec::new()),
        };
        RequestUri {
            host,
            port,
            path,
            query,
        }
    }
}

fn split_host(value: &str, default_port: u16) -> (String, u16) {
    let value = value.trim();
    // [v6]:port
    if let Some(rest) = value.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            let port = tail
                .strip_prefix(':')
                .and_then(|p| p.parse().ok())
                .unwrap_or(default_port);
            return (host.to_string(), port);
        }
    }
    match value.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            (host.to_string(), port.parse().unwrap_or(default_port))
        }
        _ => (value.to_string(), default_port),
    }
}

#[derive(Debug)]
pub struct Request {
    pub header: RequestHeader,
    pub body: BytesMut,
    /// Decoded body of a raw-tcp request.
    pub envelope: Option<Envelope>,
    pub uri: RequestUri,
}

impl Request {
    pub fn new(header: RequestHeader, body: BytesMut, local_addr: Option<SocketAddr>) -> Request {
        let uri = RequestUri::resolve(&header, local_addr);
        Request {
            header,
            body,
            envelope: None,
            uri,
        }
    }

    /// Builds a request from a received frame.
    ///
    /// A raw-tcp body is always an envelope. Its `OpType` and `Path`
    /// properties stand in for the method and path the wire format lacks.
    pub fn from_frame(
        frame: RequestFrame,
        local_addr: Option<SocketAddr>,
        options: &EnvelopeOptions,
    ) -> AppResult<Request> {
        let RequestFrame { mut header, body } = frame;
        if header.protocol == ProtocolMode::Http {
            return Ok(Request::new(header, body, local_addr));
        }

        let envelope = Envelope::decode(&body, options)?;
        let verb = match envelope.property(keys::OP_TYPE) {
            Some(op_type) => op_type.parse::<Verb>()?,
            None => Verb::CREATE,
        };
        let path = envelope.property(keys::PATH).unwrap_or("/").to_string();
        trace!("raw-tcp request normalised to {} {}", verb, path);
        header.rewrite(verb.to_string(), path);

        let mut request = Request::new(header, body, local_addr);
        request.envelope = Some(envelope);
        Ok(request)
    }

    pub fn verb(&self) -> Option<Verb> {
        self.header.verb()
    }

    pub fn protocol(&self) -> ProtocolMode {
        self.header.protocol
    }

    pub fn path(&self) -> &str {
        &self.uri.path
    }
}

#[derive(Debug, Default)]
pub struct Response {
    pub header: ResponseHeader,
    pub body: BytesMut,
    /// Reply envelope of a raw-tcp request, encoded when the response is sent.
    pub envelope: Option<Envelope>,
}

impl Response {
    pub fn text(&mut self, status: u16, text: impl AsRef<str>) {
        self.header.set_status(status);
        self.header.mime_type = "text/plain".to_string();
        self.body.clear();
        self.body.put_slice(text.as_ref().as_bytes());
    }

    pub fn bytes(&mut self, status: u16, mime_type: impl Into<String>, body: &[u8]) {
        self.header.set_status(status);
        self.header.mime_type = mime_type.into();
        self.body.clear();
        self.body.put_slice(body);
    }

    pub fn envelope(&mut self, status: u16, envelope: Envelope) {
        self.header.set_status(status);
        self.envelope = Some(envelope);
    }

    pub fn has_content(&self) -> bool {
        !self.body.is_empty() || self.envelope.is_some()
    }
}

/// Told when the connection a request arrived on goes away, however it ends.
pub trait ConnectionCloseHook: Send + Sync + fmt::Debug {
    fn connection_closed(&self, connection_id: u64);
}

/// State of one request/response cycle.
#[derive(Debug)]
pub struct Context {
    pub request: Request,
    pub response: Response,
    pub params: RouteParams,
    pub extensions: Extensions,
    connection_id: u64,
    close_hooks: Vec<Arc<dyn ConnectionCloseHook>>,
    peer_addr: Option<SocketAddr>,
    envelope_options: EnvelopeOptions,
    cancelled: bool,
    more_data_expected: bool,
    error: Option<AppError>,
}

impl Context {
    pub fn new(request: Request, peer_addr: Option<SocketAddr>) -> Context {
        Context {
            request,
            response: Response::default(),
            params: RouteParams::new(),
            extensions: Extensions::new(),
            connection_id: 0,
            close_hooks: Vec::new(),
            peer_addr,
            envelope_options: EnvelopeOptions::default(),
            cancelled: false,
            more_data_expected: false,
            error: None,
        }
    }

    pub fn with_envelope_options(mut self, options: EnvelopeOptions) -> Context {
        self.envelope_options = options;
        self
    }

    pub fn envelope_options(&self) -> &EnvelopeOptions {
        &self.envelope_options
    }

    pub fn with_connection_id(mut self, connection_id: u64) -> Context {
        self.connection_id = connection_id;
        self
    }

    /// Server-unique id of the connection this request arrived on, 0 outside a server.
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// Runs `hook` once the connection closes. Registering the same hook again
    /// on a later request of the connection does not run it twice.
    pub fn on_connection_close(&mut self, hook: Arc<dyn ConnectionCloseHook>) {
        self.close_hooks.push(hook);
    }

    pub(crate) fn take_close_hooks(&mut self) -> Vec<Arc<dyn ConnectionCloseHook>> {
        std::mem::take(&mut self.close_hooks)
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name)
    }

    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Keeps the connection open for another request once this one is answered.
    pub fn set_more_data_expected(&mut self, expected: bool) {
        self.more_data_expected = expected;
    }

    pub fn more_data_expected(&self) -> bool {
        self.more_data_expected
    }

    /// The error that cancelled this context, if no error handler took it.
    pub fn error(&self) -> Option<&AppError> {
        self.error.as_ref()
    }

    pub(crate) fn fail(&mut self, error: AppError) {
        self.error = Some(error);
        self.cancelled = true;
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use rstest::rstest;

    use super::*;
    use crate::network::HeaderMap;

    fn http_header(path: &str, host: Option<&str>) -> RequestHeader {
        let mut headers = HeaderMap::new();
        if let Some(host) = host {
            headers.insert("Host", host);
        }
        RequestHeader {
            method: "GET".to_string(),
            path: path.to_string(),
            protocol: ProtocolMode::Http,
            http_version: Some("1.1".to_string()),
            content_length: 0,
            header_length: 0,
            headers,
        }
    }

    fn local() -> Option<SocketAddr> {
        Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 7070))
    }

    #[rstest]
    #[case(Some("example.com:8080"), "example.com", 8080)]
    #[case(Some("example.com"), "example.com", 7070)]
    #[case(Some("[::1]:9000"), "::1", 9000)]
    #[case(None, "127.0.0.1", 7070)]
    fn host_and_port_resolution(
        #[case] host: Option<&str>,
        #[case] expected_host: &str,
        #[case] expected_port: u16,
    ) {
        let uri = RequestUri::resolve(&http_header("/", host), local());
        assert_eq!(uri.host, expected_host);
        assert_eq!(uri.port, expected_port);
    }

    #[test]
    fn query_is_decoded() {
        let uri = RequestUri::resolve(&http_header("/search?q=a+b&x=%2F", None), local());
        assert_eq!(uri.path, "/search");
        assert_eq!(
            uri.query,
            vec![
                ("q".to_string(), "a b".to_string()),
                ("x".to_string(), "/".to_string())
            ]
        );
    }

    #[test]
    fn absolute_form_target() {
        let uri = RequestUri::resolve(&http_header("http://vec.example:81/a/b?k=v", None), local());
        assert_eq!(uri.host, "vec.example");
        assert_eq!(uri.port, 81);
        assert_eq!(uri.path, "/a/b");
        assert_eq!(uri.query, vec![("k".to_string(), "v".to_string())]);
    }

    #[test]
    fn raw_frame_is_normalised_from_envelope() {
        let mut envelope = Envelope::new();
        envelope.set_property(keys::OP_TYPE, "Update");
        envelope.set_property(keys::PATH, "/models/7?dry=1");
        let body = envelope.to_bytes();
        let frame = RequestFrame {
            header: RequestHeader::raw_tcp(body.len()),
            body,
        };

        let request = Request::from_frame(frame, local(), &EnvelopeOptions::default()).unwrap();
        assert_eq!(request.verb(), Some(Verb::UPDATE));
        assert_eq!(request.path(), "/models/7");
        assert_eq!(request.uri.query, vec![("dry".to_string(), "1".to_string())]);
        assert!(request.envelope.is_some());
    }

    #[test]
    fn raw_frame_defaults_to_create_on_root() {
        let body = Envelope::new().to_bytes();
        let frame = RequestFrame {
            header: RequestHeader::raw_tcp(body.len()),
            body,
        };
        let request = Request::from_frame(frame, local(), &EnvelopeOptions::default()).unwrap();
        assert_eq!(request.verb(), Some(Verb::CREATE));
        assert_eq!(request.path(), "/");
    }

    #[test]
    fn raw_frame_with_garbage_body_is_rejected() {
        let frame = RequestFrame {
            header: RequestHeader::raw_tcp(3),
            body: BytesMut::from(&b"abc"[..]),
        };
        assert!(matches!(
            Request::from_frame(frame, local(), &EnvelopeOptions::default()),
            Err(AppError::MalformedProtocol(_))
        ));
    }

    #[test]
    fn failing_cancels_and_keeps_the_error() {
        let request = Request::new(http_header("/", None), BytesMut::new(), local());
        let mut ctx = Context::new(request, None);
        assert!(!ctx.is_cancelled());
        ctx.fail(AppError::Handler("boom".into()));
        assert!(ctx.is_cancelled());
        assert_eq!(ctx.error().map(|e| e.status_code()), Some(500));
    }
}
