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

use std::borrow::Cow;

use bytes::{BufMut, BytesMut};
use chrono::Utc;

use crate::network::HeaderMap;

pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";
pub const DEFAULT_ENCODING: &str = "utf-8";

/// Response state a handler mutates; turned into bytes once, at send time.
#[derive(Debug, Clone)]
pub struct ResponseHeader {
    pub status: Option<u16>,
    pub status_text: Option<String>,
    pub mime_type: String,
    pub encoding: String,
    pub headers: HeaderMap,
    pub error: bool,
}

impl Default for ResponseHeader {
    fn default() -> Self {
        ResponseHeader {
            status: None,
            status_text: None,
            mime_type: DEFAULT_MIME_TYPE.to_string(),
            encoding: DEFAULT_ENCODING.to_string(),
            headers: HeaderMap::new(),
            error: false,
        }
    }
}

impl ResponseHeader {
    pub fn set_status(&mut self, status: u16) {
        self.status = Some(status);
        self.error = status >= 400;
    }

    pub fn set_error(&mut self, status: u16, text: impl Into<String>) {
        self.set_status(status);
        self.status_text = Some(text.into());
    }

    pub fn status_or(&self, default: u16) -> u16 {
        self.status.unwrap_or(default)
    }

    pub fn reason(&self) -> &str {
        match &self.status_text {
            Some(text) => text,
            None => reason_phrase(self.status_or(200)),
        }
    }

    fn is_textual(&self) -> bool {
        let mime = self.mime_type.to_ascii_lowercase();
        mime.starts_with("text/") || mime.ends_with("json") || mime.ends_with("xml")
    }

    /// Serialises the status line and headers of an HTTP response.
    ///
    /// Line breaks inside the reason, names or values are dropped, so handler
    /// supplied text cannot start a header line of its own.
    pub fn encode_http(&self, content_length: usize) -> BytesMut {
        let status = self.status_or(200);
        let mut head = String::with_capacity(128);
        head.push_str(&format!(
            "HTTP/1.1 {} {}\r\n",
            status,
            single_line(self.reason())
        ));
        head.push_str(&format!("Content-Length: {}\r\n", content_length));
        head.push_str(&format!(
            "Date: {}\r\n",
            Utc::now().format("%a, %d %b %Y %H:%M:%S GMT")
        ));
        if self.is_textual() {
            head.push_str(&format!(
                "Content-Type: {}; charset={}\r\n",
                single_line(&self.mime_type),
                single_line(&self.encoding)
            ));
        } else {
            head.push_str(&format!(
                "Content-Type: {}\r\n",
                single_line(&self.mime_type)
            ));
        }
        for (name, values) in self.headers.iter() {
            if ["content-length", "date", "content-type"]
                .iter()
                .any(|reserved| name.eq_ignore_ascii_case(reserved))
            {
                continue;
            }
            head.push_str(&format!(
                "{}: {}\r\n",
                single_line(name),
                single_line(&values.join(", "))
            ));
        }
        head.push_str("\r\n");

        let mut bytes = BytesMut::with_capacity(head.len());
        bytes.put_slice(head.as_bytes());
        bytes
    }
}

fn single_line(text: &str) -> Cow<'_, str> {
    if text.contains(['\r', '\n']) {
        Cow::Owned(text.replace(['\r', '\n'], ""))
    } else {
        Cow::Borrowed(text)
    }
}

pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        409 => "Conflict",
        413 => "Payload Too Large",
        422 => "Unprocessable Entity",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}
