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

use std::collections::BTreeMap;
use std::str::FromStr;

use bytes::{BufMut, Bytes, BytesMut};
use chrono::Utc;

use crate::{AppError, AppResult};

pub const CURRENT_VERSION: i32 = 1;

/// Named binary payload carried next to the vectors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    pub key: String,
    pub data: Bytes,
}

/// One node of the self-describing payload tree.
///
/// Every node owns its children by value; traversal only ever goes from parent
/// to child. The checksum is never cached, it is recomputed from the current
/// content each time it is asked for.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub(crate) version: i32,
    pub(crate) timestamp: i64,
    pub(crate) properties: BTreeMap<String, String>,
    pub(crate) blobs: Vec<Blob>,
    pub(crate) vectors: Vec<Vec<f32>>,
    pub(crate) children: Vec<Envelope>,
}

impl Default for Envelope {
    fn default() -> Self {
        Envelope::new()
    }
}

impl Envelope {
    pub fn new() -> Self {
        Envelope::with_version(CURRENT_VERSION)
    }

    pub fn with_version(version: i32) -> Self {
        Envelope {
            version,
            timestamp: Utc::now().timestamp_millis(),
            properties: BTreeMap::new(),
            blobs: Vec::new(),
            vectors: Vec::new(),
            children: Vec::new(),
        }
    }

    pub(crate) fn empty(version: i32, timestamp: i64) -> Self {
        Envelope {
            timestamp,
            ..Envelope::with_version(version)
        }
    }

    pub fn version(&self) -> i32 {
        self.version
    }

    /// Creation time in UTC milliseconds.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn set_timestamp(&mut self, timestamp: i64) {
        self.timestamp = timestamp;
    }

    /// Stores `value` under `key`, returning the value it replaced.
    pub fn set_property(&mut self, key: impl Into<String>, value: impl ToString) -> Option<String> {
        self.properties.insert(key.into(), value.to_string())
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Parses the property stored under `key`; a present but unparsable value is an error.
    pub fn property_as<T: FromStr>(&self, key: &str) -> AppResult<Option<T>> {
        match self.properties.get(key) {
            None => Ok(None),
            Some(raw) => raw.parse::<T>().map(Some).map_err(|_| {
                AppError::InvalidValue(format!("property {} has unexpected value {:?}", key, raw))
            }),
        }
    }

    pub fn remove_property(&mut self, key: &str) -> Option<String> {
        self.properties.remove(key)
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    pub fn add_vector(&mut self, vector: impl Into<Vec<f32>>) {
        self.vectors.push(vector.into());
    }

    pub fn vectors(&self) -> &[Vec<f32>] {
        &self.vectors
    }

    pub fn take_vectors(&mut self) -> Vec<Vec<f32>> {
        std::mem::take(&mut self.vectors)
    }

    pub fn add_blob(&mut self, key: impl Into<String>, data: impl Into<Bytes>) {
        self.blobs.push(Blob {
            key: key.into(),
            data: data.into(),
        });
    }

    /// First blob stored under `key`.
    pub fn blob(&self, key: &str) -> Option<&Bytes> {
        self.blobs.iter().find(|b| b.key == key).map(|b| &b.data)
    }

    pub fn blobs(&self) -> &[Blob] {
        &self.blobs
    }

    /// Appends `child` and hands back a reference to the stored node.
    pub fn add_child(&mut self, child: Envelope) -> &mut Envelope {
        self.children.push(child);
        let last = self.children.len() - 1;
        &mut self.children[last]
    }

    pub fn children(&self) -> &[Envelope] {
        &self.children
    }

    pub fn child(&self, index: usize) -> Option<&Envelope> {
        self.children.get(index)
    }

    pub fn child_mut(&mut self, index: usize) -> Option<&mut Envelope> {
        self.children.get_mut(index)
    }

    /// XOR-fold over version, properties, vectors and child checksums.
    ///
    /// This is an integrity check, not a cryptographic guarantee: blobs and the
    /// timestamp are not covered, and identical vectors or children cancel out.
    pub fn checksum(&self) -> i64 {
        self.children
            .iter()
            .fold(self.local_checksum(), |sum, child| sum ^ child.checksum())
    }

    /// The part of [`Envelope::checksum`] this node contributes on its own.
    pub(crate) fn local_checksum(&self) -> i64 {
        let mut sum = self.version as i64 as u64;
        for (key, value) in &self.properties {
            let key_hash = crc32c::crc32c(key.as_bytes()) as u64;
            let value_hash = crc32c::crc32c(value.as_bytes()) as u64;
            sum ^= (key_hash << 32) | value_hash;
        }
        for vector in &self.vectors {
            sum ^= crc32c::crc32c(&vector_bytes(vector)) as u64;
        }
        sum as i64
    }
}

/// Little-endian f32 bytes of `vector`.
pub(crate) fn vector_bytes(vector: &[f32]) -> BytesMut {
    let mut bytes = BytesMut::with_capacity(vector.len() * 4);
    for value in vector {
        bytes.put_f32_le(*value);
    }
    bytes
}

/// Inverse of [`vector_bytes`].
pub(crate) fn vector_from_bytes(bytes: &[u8]) -> AppResult<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(AppError::MalformedProtocol(format!(
            "vector of {} bytes is not a whole number of f32 values",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}
