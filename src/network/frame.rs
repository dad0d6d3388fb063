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

use bytes::{Buf, BytesMut};
use once_cell::sync::Lazy;
use regex::bytes::Regex;
use tracing::trace;

use crate::network::{HeaderMap, TransportOptions};
use crate::routing::Verb;
use crate::AppError::Incomplete;
use crate::{AppError, AppResult};

/// Size of the little-endian i64 length prefix of a raw-tcp frame.
pub const RAW_PREFIX_LEN: usize = 8;

static REQUEST_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)\A([A-Z]+) (\S+) HTTP/(\d+\.\d+)\r?$").expect("request line pattern")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolMode {
    Http,
    RawTcp,
}

impl fmt::Display for ProtocolMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolMode::Http => write!(f, "http"),
            ProtocolMode::RawTcp => write!(f, "raw-tcp"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RequestHeader {
    /// Request method token as received, `POST` for raw-tcp until normalised.
    pub method: String,
    pub path: String,
    pub protocol: ProtocolMode,
    pub http_version: Option<String>,
    pub content_length: usize,
    /// Bytes consumed before the body starts.
    pub header_length: usize,
    pub headers: HeaderMap,
}

enum HttpScan {
    NotHttp,
    Partial,
    Header(RequestHeader),
}

impl RequestHeader {
    pub fn raw_tcp(content_length: usize) -> Self {
        RequestHeader {
            method: "POST".to_string(),
            path: "/".to_string(),
            protocol: ProtocolMode::RawTcp,
            http_version: None,
            content_length,
            header_length: RAW_PREFIX_LEN,
            headers: HeaderMap::new(),
        }
    }

    pub fn verb(&self) -> Option<Verb> {
        match self.protocol {
            ProtocolMode::Http => Verb::from_http_method(&self.method),
            ProtocolMode::RawTcp => self.method.parse().ok(),
        }
    }

    /// Replaces method and path once the real target of a raw-tcp request is known.
    pub(crate) fn rewrite(&mut self, method: impl Into<String>, path: impl Into<String>) {
        self.method = method.into();
        self.path = path.into();
    }

    /// Classifies the start of a request.
    ///
    /// The HTTP request line is tried first; anything that does not parse as HTTP
    /// is read as a raw-tcp length prefix. Returns `Incomplete` while more bytes
    /// are needed to decide, including while the bytes so far are the start of
    /// a request line that has not fully arrived.
    pub fn detect(buffer: &[u8], options: &TransportOptions) -> AppResult<RequestHeader> {
        match Self::scan_http(buffer) {
            HttpScan::Header(header) => {
                if header.header_length > options.max_header_size {
                    return Err(AppError::TooLarge(format!(
                        "header block of {} bytes exceeds limit {}",
                        header.header_length, options.max_header_size
                    )));
                }
                if header.content_length > options.max_package_size {
                    return Err(AppError::TooLarge(format!(
                        "content length {} exceeds limit {}",
                        header.content_length, options.max_package_size
                    )));
                }
                Ok(header)
            }
            HttpScan::Partial => {
                if buffer.len() > options.max_header_size {
                    return Err(AppError::TooLarge(format!(
                        "header block larger than {} bytes",
                        options.max_header_size
                    )));
                }
                Err(Incomplete)
            }
            HttpScan::NotHttp => Self::read_raw_prefix(buffer, options.max_package_size),
        }
    }

    fn read_raw_prefix(buffer: &[u8], max_package_size: usize) -> AppResult<RequestHeader> {
        let content_length = read_length_prefix(buffer, max_package_size)?;
        trace!("raw-tcp request of {} bytes", content_length);
        Ok(RequestHeader::raw_tcp(content_length))
    }

    fn scan_http(buffer: &[u8]) -> HttpScan {
        let captures = match REQUEST_LINE.captures(buffer) {
            Some(captures) => captures,
            None if !buffer.contains(&b'\n') && is_request_line_prefix(buffer) => {
                return HttpScan::Partial
            }
            None => return HttpScan::NotHttp,
        };
        let (whole, method, path, version) = match (
            captures.get(0),
            captures.get(1),
            captures.get(2),
            captures.get(3),
        ) {
            (Some(whole), Some(method), Some(path), Some(version)) => {
                (whole, method, path, version)
            }
            _ => return HttpScan::NotHttp,
        };

        let Some((terminator_at, terminator_len)) = find_terminator(buffer, whole.start()) else {
            return HttpScan::Partial;
        };

        let mut headers = HeaderMap::new();
        let mut content_length = 0usize;
        let block = &buffer[whole.end()..terminator_at];
        for line in block.split(|b| *b == b'\n') {
            let line = trim_cr(line);
            if line.is_empty() {
                continue;
            }
            let Ok(line) = std::str::from_utf8(line) else {
                return HttpScan::NotHttp;
            };
            let Some((name, value)) = line.split_once(':') else {
                return HttpScan::NotHttp;
            };
            let name = name.trim();
            if name.eq_ignore_ascii_case("content-length") {
                match value.trim().parse::<usize>() {
                    Ok(length) => content_length = length,
                    Err(_) => return HttpScan::NotHttp,
                }
            }
            headers.append_raw(name, value);
        }

        let text = |m: regex::bytes::Match<'_>| String::from_utf8_lossy(m.as_bytes()).into_owned();
        HttpScan::Header(RequestHeader {
            method: text(method),
            path: text(path),
            protocol: ProtocolMode::Http,
            http_version: Some(text(version)),
            content_length,
            header_length: terminator_at + terminator_len,
            headers,
        })
    }
}

/// Whether `buffer` opens with an HTTP request line, or with the start of one.
pub(crate) fn starts_like_http(buffer: &[u8]) -> bool {
    match buffer.iter().position(|b| *b == b'\n') {
        Some(end) => REQUEST_LINE.is_match(&buffer[..end]),
        None => is_request_line_prefix(buffer),
    }
}

/// Whether `line` can still grow into `METHOD target HTTP/x.y`.
///
/// A raw-tcp length prefix within any sane size limit carries zero bytes in
/// its upper half, so it never passes for one.
fn is_request_line_prefix(line: &[u8]) -> bool {
    const PROTOCOL: &[u8] = b"HTTP/";
    let line = trim_cr(line);
    let method_len = line.iter().take_while(|b| b.is_ascii_uppercase()).count();
    if method_len == 0 {
        return false;
    }
    let Some(rest) = line[method_len..].strip_prefix(b" ") else {
        return method_len == line.len();
    };
    let target_len = rest.iter().take_while(|b| b.is_ascii_graphic()).count();
    let Some(version) = rest[target_len..].strip_prefix(b" ") else {
        return target_len == rest.len();
    };
    if version.len() <= PROTOCOL.len() {
        return PROTOCOL.starts_with(version);
    }
    version.starts_with(PROTOCOL)
        && version[PROTOCOL.len()..]
            .iter()
            .all(|b| b.is_ascii_digit() || *b == b'.')
}

fn trim_cr(line: &[u8]) -> &[u8] {
    match line.last() {
        Some(b'\r') => &line[..line.len() - 1],
        _ => line,
    }
}

/// Offset and length of the first blank-line terminator at or after `from`.
fn find_terminator(buffer: &[u8], from: usize) -> Option<(usize, usize)> {
    let haystack = &buffer[from..];
    let crlf = haystack.windows(4).position(|w| w == b"\r\n\r\n");
    let lf = haystack.windows(2).position(|w| w == b"\n\n");
    match (crlf, lf) {
        (Some(c), Some(l)) if l < c => Some((from + l, 2)),
        (Some(c), _) => Some((from + c, 4)),
        (None, Some(l)) => Some((from + l, 2)),
        (None, None) => None,
    }
}

/// Reads the little-endian i64 length at the start of a raw-tcp frame.
pub(crate) fn read_length_prefix(buffer: &[u8], max_package_size: usize) -> AppResult<usize> {
    if buffer.len() < RAW_PREFIX_LEN {
        return Err(Incomplete);
    }
    let mut prefix = &buffer[..RAW_PREFIX_LEN];
    let length = prefix.get_i64_le();
    if length < 0 {
        return Err(AppError::MalformedProtocol(format!(
            "frame size {} less than 0",
            length
        )));
    }
    if length as u64 > max_package_size as u64 {
        return Err(AppError::TooLarge(format!(
            "frame of length {} is too large",
            length
        )));
    }
    Ok(length as usize)
}

#[derive(Debug)]
pub struct RequestFrame {
    pub header: RequestHeader,
    pub body: BytesMut,
}

impl RequestFrame {
    /// Cuts one request out of `buffer`.
    ///
    /// `pending` holds the header detected for the request currently being
    /// received, so detection runs once per request while later reads only
    /// accumulate body bytes.
    pub(crate) fn parse(
        buffer: &mut BytesMut,
        pending: &mut Option<RequestHeader>,
        options: &TransportOptions,
    ) -> AppResult<Option<RequestFrame>> {
        if pending.is_none() {
            match RequestHeader::detect(buffer, options) {
                Ok(header) => *pending = Some(header),
                Err(Incomplete) => return Ok(None),
                Err(e) => return Err(e),
            }
        }
        let Some(header) = pending.as_ref() else {
            return Ok(None);
        };
        let total = header.header_length + header.content_length;
        if buffer.len() < total {
            buffer.reserve(total - buffer.len());
            return Ok(None);
        }

        let header = pending.take().ok_or(Incomplete)?;
        buffer.advance(header.header_length);
        let body = buffer.split_to(header.content_length);
        Ok(Some(RequestFrame { header, body }))
    }
}

/// Cuts one raw-tcp frame body out of `buffer`.
pub(crate) fn parse_raw_frame(
    buffer: &mut BytesMut,
    max_package_size: usize,
) -> AppResult<Option<BytesMut>> {
    let length = match read_length_prefix(buffer, max_package_size) {
        Ok(length) => length,
        Err(Incomplete) => return Ok(None),
        Err(e) => return Err(e),
    };
    if buffer.len() < RAW_PREFIX_LEN + length {
        buffer.reserve(RAW_PREFIX_LEN + length - buffer.len());
        return Ok(None);
    }
    buffer.advance(RAW_PREFIX_LEN);
    Ok(Some(buffer.split_to(length)))
}

#[cfg(test)]
mod tests {
    use bytes::BufMut;

    use super::*;

    fn options() -> TransportOptions {
        TransportOptions {
            max_package_size: 1024,
            max_header_size: 256,
            ..Default::default()
        }
    }

    fn raw(body: &[u8]) -> BytesMut {
        let mut buffer = BytesMut::new();
        buffer.put_i64_le(body.len() as i64);
        buffer.put_slice(body);
        buffer
    }

    #[test]
    fn http_request_line_is_detected() {
        let request = b"GET /items/42?x=1 HTTP/1.1\r\nHost: localhost:7070\r\nAccept: a/b, c/d\r\nContent-Length: 4\r\n\r\nbody";
        let header = RequestHeader::detect(request, &options()).unwrap();
        assert_eq!(header.protocol, ProtocolMode::Http);
        assert_eq!(header.method, "GET");
        assert_eq!(header.verb(), Some(Verb::GET));
        assert_eq!(header.path, "/items/42?x=1");
        assert_eq!(header.http_version.as_deref(), Some("1.1"));
        assert_eq!(header.content_length, 4);
        assert_eq!(header.header_length, request.len() - 4);
        assert_eq!(header.headers.get("host"), Some("localhost:7070"));
        assert_eq!(header.headers.get_all("accept"), ["a/b", "c/d"]);
    }

    #[test]
    fn missing_content_length_defaults_to_zero() {
        let header = RequestHeader::detect(b"DELETE /a HTTP/1.0\n\n", &options()).unwrap();
        assert_eq!(header.content_length, 0);
        assert_eq!(header.header_length, 20);
    }

    #[test]
    fn anything_else_is_raw_tcp() {
        let buffer = raw(b"payload");
        let header = RequestHeader::detect(&buffer, &options()).unwrap();
        assert_eq!(header.protocol, ProtocolMode::RawTcp);
        assert_eq!(header.content_length, 7);
        assert_eq!(header.header_length, RAW_PREFIX_LEN);
        assert_eq!(header.path, "/");
    }

    #[test]
    fn verb_lookalike_payload_stays_raw_tcp() {
        // a raw payload whose bytes resemble a verb but not a full request line
        let mut buffer = BytesMut::new();
        buffer.put_slice(b"GET \0\0\0\0");
        let result = RequestHeader::detect(&buffer, &options());
        // the prefix decodes to a huge length, so the frame is rejected as raw-tcp
        assert!(matches!(result, Err(AppError::TooLarge(_))));

        let buffer = raw(b"GET /not-http");
        let header = RequestHeader::detect(&buffer, &options()).unwrap();
        assert_eq!(header.protocol, ProtocolMode::RawTcp);
    }

    #[test]
    fn request_line_inside_a_raw_body_is_ignored() {
        let buffer = raw(b"\nGET /inner HTTP/1.1\r\n\r\n");
        let header = RequestHeader::detect(&buffer, &options()).unwrap();
        assert_eq!(header.protocol, ProtocolMode::RawTcp);
        assert_eq!(header.content_length, 24);
    }

    #[test]
    fn malformed_header_line_falls_back_to_raw_tcp() {
        let result = RequestHeader::detect(b"GET / HTTP/1.1\r\nno colon here\r\n\r\n", &options());
        // "GET / HT" read as a little-endian length is far beyond the limit
        assert!(matches!(result, Err(AppError::TooLarge(_))));
    }

    #[test]
    fn partial_http_header_waits_for_more() {
        let result = RequestHeader::detect(b"GET / HTTP/1.1\r\nHost: x\r\n", &options());
        assert!(matches!(result, Err(Incomplete)));

        let mut oversized = b"GET / HTTP/1.1\r\n".to_vec();
        oversized.extend(std::iter::repeat(b'a').take(300));
        let result = RequestHeader::detect(&oversized, &options());
        assert!(matches!(result, Err(AppError::TooLarge(_))));
        assert!(starts_like_http(&oversized));

        oversized.extend_from_slice(b"\r\n\r\n");
        let result = RequestHeader::detect(&oversized, &options());
        assert!(matches!(result, Err(AppError::TooLarge(_))));
    }

    #[test]
    fn request_line_split_across_reads_waits_for_the_rest() {
        for cut in ["G", "GET", "GET ", "GET / HT", "GET /a/b HTTP/1", "GET / HTTP/1.1\r"] {
            assert!(
                matches!(RequestHeader::detect(cut.as_bytes(), &options()), Err(Incomplete)),
                "{:?}",
                cut
            );
            assert!(starts_like_http(cut.as_bytes()));
        }

        let mut buffer = BytesMut::from(&b"GET / HT"[..]);
        let mut pending = None;
        assert!(RequestFrame::parse(&mut buffer, &mut pending, &options())
            .unwrap()
            .is_none());
        buffer.put_slice(b"TP/1.1\r\nContent-Length: 2\r\n\r\nhi");
        let frame = RequestFrame::parse(&mut buffer, &mut pending, &options())
            .unwrap()
            .unwrap();
        assert_eq!(frame.header.protocol, ProtocolMode::Http);
        assert_eq!(&frame.body[..], b"hi");
    }

    #[test]
    fn broken_request_line_prefix_is_raw_tcp() {
        assert!(!starts_like_http(b"GET / FTP"));
        assert!(!starts_like_http(b"get / HTTP/1.1"));
        assert!(!starts_like_http(&raw(b"GET / HTTP/1.1")));
        assert!(matches!(
            RequestHeader::detect(b"GET / FTP/1.1", &options()),
            Err(AppError::TooLarge(_))
        ));
    }

    #[test]
    fn short_raw_prefix_is_incomplete() {
        assert!(matches!(
            RequestHeader::detect(&[3, 0, 0], &options()),
            Err(Incomplete)
        ));
    }

    #[test]
    fn negative_or_oversized_raw_length_is_rejected() {
        let mut buffer = BytesMut::new();
        buffer.put_i64_le(-1);
        assert!(RequestHeader::detect(&buffer, &options()).is_err());

        let mut buffer = BytesMut::new();
        buffer.put_i64_le(4096);
        assert!(RequestHeader::detect(&buffer, &options()).is_err());
    }

    #[test]
    fn frame_accumulates_body_across_reads() {
        let options = options();
        let mut pending = None;
        let full = raw(b"0123456789");
        let mut buffer = BytesMut::from(&full[..12]);

        assert!(RequestFrame::parse(&mut buffer, &mut pending, &options)
            .unwrap()
            .is_none());
        assert!(pending.is_some());

        buffer.extend_from_slice(&full[12..]);
        buffer.extend_from_slice(b"GET / HTTP/1.1\r\n\r\n");
        let frame = RequestFrame::parse(&mut buffer, &mut pending, &options)
            .unwrap()
            .unwrap();
        assert_eq!(&frame.body[..], b"0123456789");
        assert!(pending.is_none());

        // the next request on the same buffer is detected afresh
        let next = RequestFrame::parse(&mut buffer, &mut pending, &options)
            .unwrap()
            .unwrap();
        assert_eq!(next.header.protocol, ProtocolMode::Http);
        assert!(next.body.is_empty());
        assert!(buffer.is_empty());
    }

    #[test]
    fn raw_frame_split() {
        let mut buffer = raw(b"abc");
        buffer.extend_from_slice(&raw(b"")[..]);
        assert_eq!(&parse_raw_frame(&mut buffer, 64).unwrap().unwrap()[..], b"abc");
        assert!(parse_raw_frame(&mut buffer, 64).unwrap().unwrap().is_empty());
        assert!(parse_raw_frame(&mut buffer, 64).unwrap().is_none());
    }
}
