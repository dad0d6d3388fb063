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

//! Envelope Module Implementation
//!
//! The envelope is the payload container every request body and transfer batch
//! travels in: a tree of nodes, each holding string properties, f32 vectors,
//! named binary blobs and child nodes.
//!
//! # Formats
//!
//! - binary: depth-first `PROP`/`DATA`/`BLOB`/`CLRN` sections
//! - XML: nested `prop`/`data`/`blobs`/`clrn` elements, vectors written in one
//!   of the [`VectorFormat`]s
//!
//! Both loaders verify the stored per-node checksum when asked to, and refuse
//! trees nested deeper than [`EnvelopeOptions::max_depth`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use document::{Blob, Envelope, CURRENT_VERSION};

use crate::AppError;

mod binary;
mod document;
mod xml;

/// How vectors are written into XML.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VectorFormat {
    /// One `<v>` element per value.
    Inline,
    /// Little-endian f32 bytes, base64 encoded.
    Base64,
    #[default]
    Csv,
}

impl VectorFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            VectorFormat::Inline => "inline",
            VectorFormat::Base64 => "base64",
            VectorFormat::Csv => "csv",
        }
    }
}

impl fmt::Display for VectorFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VectorFormat {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "inline" => Ok(VectorFormat::Inline),
            "base64" => Ok(VectorFormat::Base64),
            "csv" => Ok(VectorFormat::Csv),
            other => Err(AppError::MalformedProtocol(format!(
                "unknown vector format {:?}",
                other
            ))),
        }
    }
}

/// Deepest child level a loader accepts unless configured otherwise.
pub const DEFAULT_MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy)]
pub struct EnvelopeOptions {
    pub validate_checksum: bool,
    /// Vector encoding used when an envelope is rendered as XML.
    pub vector_format: VectorFormat,
    /// Highest child level accepted on load; the root is level 0.
    pub max_depth: usize,
}

impl Default for EnvelopeOptions {
    fn default() -> Self {
        EnvelopeOptions {
            validate_checksum: true,
            vector_format: VectorFormat::Csv,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

impl EnvelopeOptions {
    /// Defaults with checksum validation switched to `validate`.
    pub fn validating(validate: bool) -> Self {
        EnvelopeOptions {
            validate_checksum: validate,
            ..Default::default()
        }
    }
}
