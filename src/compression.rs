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

//! Pluggable body compression.
//!
//! The server and the transfer client only ever see a [`CompressionProvider`];
//! the algorithm behind it is irrelevant to framing. Bodies are compressed as a
//! whole after serialisation and decompressed before parsing.

use std::fmt::Debug;
use std::io::{Read, Write};

use bytes::BytesMut;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::{AppError, AppResult};

pub trait CompressionProvider: Send + Sync + Debug {
    fn compress(&self, input: &[u8]) -> AppResult<BytesMut>;
    fn decompress(&self, input: &[u8]) -> AppResult<BytesMut>;
}

/// Decompressed size refused by default, matching the default frame limit.
pub const DEFAULT_MAX_OUTPUT: usize = 256 * 1024 * 1024;

/// gzip on top of flate2.
#[derive(Debug, Clone, Copy)]
pub struct GzipCompression {
    level: u32,
    max_output: usize,
}

impl GzipCompression {
    pub fn new(level: u32) -> Self {
        GzipCompression {
            level: level.min(9),
            max_output: DEFAULT_MAX_OUTPUT,
        }
    }

    /// Caps how large a decompressed body may grow.
    pub fn with_max_output(mut self, max_output: usize) -> Self {
        self.max_output = max_output;
        self
    }
}

impl Default for GzipCompression {
    fn default() -> Self {
        GzipCompression::new(6)
    }
}

impl CompressionProvider for GzipCompression {
    fn compress(&self, input: &[u8]) -> AppResult<BytesMut> {
        let mut encoder = GzEncoder::new(
            Vec::with_capacity(input.len() / 2),
            Compression::new(self.level),
        );
        encoder.write_all(input)?;
        let compressed = encoder.finish()?;
        Ok(BytesMut::from(&compressed[..]))
    }

    fn decompress(&self, input: &[u8]) -> AppResult<BytesMut> {
        // one byte past the cap tells a body at the limit from one beyond it
        let mut decoder = GzDecoder::new(input).take(self.max_output as u64 + 1);
        let mut out = Vec::with_capacity(input.len().saturating_mul(2).min(self.max_output));
        decoder
            .read_to_end(&mut out)
            .map_err(|e| AppError::MalformedProtocol(format!("body is not valid gzip: {}", e)))?;
        if out.len() > self.max_output {
            return Err(AppError::MalformedProtocol(format!(
                "gzip body inflates beyond {} bytes",
                self.max_output
            )));
        }
        Ok(BytesMut::from(&out[..]))
    }
}
