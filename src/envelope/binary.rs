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

//! Binary layout of an envelope tree.
//!
//! Nodes are written depth-first, pre-order. Each node is
//! `level:i32 version:i32 checksum:i64 timestamp:i64` followed by four named
//! sections in fixed order, every section introduced by its name string and a
//! record count:
//!
//! ```text
//! PROP  count (key:string value:string)*
//! DATA  count (length:i32 bytes)*
//! BLOB  count (key:string length:i32 bytes)*
//! CLRN  count node*            (children at level + 1)
//! ```
//!
//! Integers are little-endian, a string is an i32 byte length plus UTF-8.
//! Reading a node stops at its `CLRN` section.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::trace;

use super::document::{vector_bytes, vector_from_bytes, Blob, Envelope};
use super::EnvelopeOptions;
use crate::{AppError, AppResult};

const PROP: &str = "PROP";
const DATA: &str = "DATA";
const BLOB: &str = "BLOB";
const CLRN: &str = "CLRN";

fn put_string(writer: &mut BytesMut, value: &str) {
    writer.put_i32_le(value.len() as i32);
    writer.put_slice(value.as_bytes());
}

fn get_i32(buffer: &mut impl Buf, what: &str) -> AppResult<i32> {
    if buffer.remaining() < 4 {
        return Err(AppError::MalformedProtocol(format!("can not read {}", what)));
    }
    Ok(buffer.get_i32_le())
}

fn get_i64(buffer: &mut impl Buf, what: &str) -> AppResult<i64> {
    if buffer.remaining() < 8 {
        return Err(AppError::MalformedProtocol(format!("can not read {}", what)));
    }
    Ok(buffer.get_i64_le())
}

fn get_len(buffer: &mut impl Buf, what: &str) -> AppResult<usize> {
    let len = get_i32(buffer, what)?;
    if len < 0 {
        return Err(AppError::MalformedProtocol(format!(
            "negative {}: {}",
            what, len
        )));
    }
    Ok(len as usize)
}

fn get_bytes(buffer: &mut impl Buf, what: &str) -> AppResult<Bytes> {
    let len = get_len(buffer, what)?;
    if buffer.remaining() < len {
        return Err(AppError::MalformedProtocol(format!(
            "{} needs {} bytes, {} left",
            what,
            len,
            buffer.remaining()
        )));
    }
    Ok(buffer.copy_to_bytes(len))
}

fn get_string(buffer: &mut impl Buf, what: &str) -> AppResult<String> {
    let bytes = get_bytes(buffer, what)?;
    String::from_utf8(bytes.to_vec())
        .map_err(|_| AppError::MalformedProtocol(format!("{} is not valid utf-8", what)))
}

impl Envelope {
    /// Appends the whole tree to `writer`.
    pub fn save_binary(&self, writer: &mut BytesMut) {
        self.write_node(writer, 0);
    }

    pub fn to_bytes(&self) -> BytesMut {
        let mut writer = BytesMut::with_capacity(256);
        self.save_binary(&mut writer);
        writer
    }

    fn write_node(&self, writer: &mut BytesMut, level: i32) {
        writer.put_i32_le(level);
        writer.put_i32_le(self.version);
        writer.put_i64_le(self.checksum());
        writer.put_i64_le(self.timestamp);

        put_string(writer, PROP);
        writer.put_i32_le(self.properties.len() as i32);
        for (key, value) in &self.properties {
            put_string(writer, key);
            put_string(writer, value);
        }

        put_string(writer, DATA);
        writer.put_i32_le(self.vectors.len() as i32);
        for vector in &self.vectors {
            let bytes = vector_bytes(vector);
            writer.put_i32_le(bytes.len() as i32);
            writer.put_slice(&bytes);
        }

        put_string(writer, BLOB);
        writer.put_i32_le(self.blobs.len() as i32);
        for blob in &self.blobs {
            put_string(writer, &blob.key);
            writer.put_i32_le(blob.data.len() as i32);
            writer.put_slice(&blob.data);
        }

        put_string(writer, CLRN);
        writer.put_i32_le(self.children.len() as i32);
        for child in &self.children {
            child.write_node(writer, level + 1);
        }
    }

    /// Reads one tree from `buffer`.
    ///
    /// With validation enabled, every node's recomputed checksum must equal
    /// the stored one, or the load fails with [`AppError::Integrity`].
    pub fn load_binary(buffer: &mut impl Buf, options: &EnvelopeOptions) -> AppResult<Envelope> {
        Self::read_node(buffer, 0, options).map(|(envelope, _)| envelope)
    }

    /// Reads a tree that must span all of `bytes`, with default limits.
    pub fn from_bytes(bytes: &[u8], validate: bool) -> AppResult<Envelope> {
        Self::decode(bytes, &EnvelopeOptions::validating(validate))
    }

    /// Reads a tree that must span all of `bytes`.
    pub fn decode(bytes: &[u8], options: &EnvelopeOptions) -> AppResult<Envelope> {
        let mut cursor = bytes;
        let envelope = Self::load_binary(&mut cursor, options)?;
        if cursor.has_remaining() {
            return Err(AppError::MalformedProtocol(format!(
                "{} trailing bytes after envelope",
                cursor.remaining()
            )));
        }
        Ok(envelope)
    }

    /// Returns the node together with its recomputed checksum. Child sums are
    /// folded in as the children come back, so each node is hashed once.
    fn read_node(
        buffer: &mut impl Buf,
        expected_level: i32,
        options: &EnvelopeOptions,
    ) -> AppResult<(Envelope, i64)> {
        let level = get_i32(buffer, "level")?;
        if level != expected_level {
            return Err(AppError::MalformedProtocol(format!(
                "envelope level {} found where level {} was expected",
                level, expected_level
            )));
        }
        let version = get_i32(buffer, "version")?;
        let stored_checksum = get_i64(buffer, "checksum")?;
        let timestamp = get_i64(buffer, "timestamp")?;
        let mut envelope = Envelope::empty(version, timestamp);

        for _ in 0..expect_section(buffer, PROP)? {
            let key = get_string(buffer, "property key")?;
            let value = get_string(buffer, "property value")?;
            envelope.properties.insert(key, value);
        }
        for _ in 0..expect_section(buffer, DATA)? {
            let bytes = get_bytes(buffer, "vector")?;
            envelope.vectors.push(vector_from_bytes(&bytes)?);
        }
        for _ in 0..expect_section(buffer, BLOB)? {
            let key = get_string(buffer, "blob key")?;
            let data = get_bytes(buffer, "blob")?;
            envelope.blobs.push(Blob { key, data });
        }

        let children = expect_section(buffer, CLRN)?;
        if children > 0 && level as usize >= options.max_depth {
            return Err(AppError::MalformedProtocol(format!(
                "envelope nested deeper than {} levels",
                options.max_depth
            )));
        }
        let mut actual = envelope.local_checksum();
        for _ in 0..children {
            let (child, child_checksum) = Self::read_node(buffer, level + 1, options)?;
            actual ^= child_checksum;
            envelope.children.push(child);
        }

        if options.validate_checksum && actual != stored_checksum {
            return Err(AppError::Integrity {
                level,
                expected: stored_checksum,
                actual,
            });
        }
        trace!(
            "loaded envelope level {} with {} properties, {} vectors, {} children",
            level,
            envelope.properties.len(),
            envelope.vectors.len(),
            envelope.children.len()
        );
        Ok((envelope, actual))
    }
}

/// Reads a section header, which must be `name`, and returns its record count.
fn expect_section(buffer: &mut impl Buf, name: &str) -> AppResult<usize> {
    let section = get_string(buffer, "section name")?;
    if section != name {
        return Err(AppError::MalformedProtocol(format!(
            "expected envelope section {} but found {:?}",
            name, section
        )));
    }
    get_len(buffer, "section count")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Envelope {
        let mut root = Envelope::new();
        root.set_property("Id", "op-1");
        root.set_property("empty", "");
        root.add_vector(vec![0.25, -1.0, 3.5]);
        root.add_vector(Vec::new());
        root.add_blob("weights", Bytes::from_static(b"\x00\xffraw"));

        let child = root.add_child(Envelope::with_version(7));
        child.set_property("name", "child");
        child.add_vector(vec![42.0]);
        child
            .add_child(Envelope::new())
            .set_property("name", "grandchild");
        root.add_child(Envelope::new());
        root
    }

    fn find(haystack: &[u8], needle: &[u8]) -> usize {
        haystack
            .windows(needle.len())
            .position(|w| w == needle)
            .unwrap()
    }

    #[test]
    fn tree_round_trip_keeps_every_level() {
        let root = sample();
        let bytes = root.to_bytes();
        let loaded = Envelope::from_bytes(&bytes, true).unwrap();

        assert_eq!(loaded, root);
        assert_eq!(loaded.checksum(), root.checksum());
        let grandchild = &loaded.children()[0].children()[0];
        assert_eq!(grandchild.property("name"), Some("grandchild"));
        assert_eq!(loaded.children()[0].version(), 7);
        assert_eq!(loaded.blob("weights").unwrap().as_ref(), b"\x00\xffraw");
    }

    #[test]
    fn flipped_property_byte_fails_validation() {
        let mut root = Envelope::new();
        root.set_property("label", "hello");
        let mut bytes = root.to_bytes();
        let at = find(&bytes, b"hello");
        bytes[at] = b'j';

        let result = Envelope::from_bytes(&bytes, true);
        assert!(matches!(result, Err(AppError::Integrity { level: 0, .. })));

        let loaded = Envelope::from_bytes(&bytes, false).unwrap();
        assert_eq!(loaded.property("label"), Some("jello"));
    }

    #[test]
    fn flipped_vector_byte_in_child_fails_at_child_level() {
        let mut root = Envelope::new();
        root.add_child(Envelope::new()).add_vector(vec![1.0, 2.0]);
        let mut bytes = root.to_bytes();
        let at = find(&bytes, &2.0f32.to_le_bytes());
        bytes[at + 3] ^= 0x01;

        let result = Envelope::from_bytes(&bytes, true);
        assert!(matches!(result, Err(AppError::Integrity { level: 1, .. })));

        let loaded = Envelope::from_bytes(&bytes, false).unwrap();
        assert_ne!(loaded.children()[0].vectors()[0][1], 2.0);
    }

    #[test]
    fn wrong_level_is_a_format_error() {
        let mut bytes = Envelope::new().to_bytes();
        bytes[0] = 1;
        assert!(matches!(
            Envelope::from_bytes(&bytes, false),
            Err(AppError::MalformedProtocol(_))
        ));
    }

    #[test]
    fn truncated_input_is_a_format_error() {
        let bytes = sample().to_bytes();
        for cut in [0, 3, 20, bytes.len() / 2, bytes.len() - 1] {
            assert!(
                matches!(
                    Envelope::from_bytes(&bytes[..cut], false),
                    Err(AppError::MalformedProtocol(_))
                ),
                "cut at {}",
                cut
            );
        }
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut bytes = Envelope::new().to_bytes();
        bytes.put_u8(0);
        assert!(Envelope::from_bytes(&bytes, true).is_err());
    }

    fn nested(depth: usize) -> Envelope {
        let mut node = Envelope::new();
        node.set_property("depth", depth);
        for level in (0..depth).rev() {
            let mut parent = Envelope::new();
            parent.set_property("depth", level);
            parent.add_child(node);
            node = parent;
        }
        node
    }

    #[test]
    fn nesting_beyond_the_limit_is_refused() {
        let options = EnvelopeOptions {
            max_depth: 4,
            ..Default::default()
        };
        let at_limit = nested(4);
        let loaded = Envelope::decode(&at_limit.to_bytes(), &options).unwrap();
        assert_eq!(loaded, at_limit);

        let too_deep = nested(5).to_bytes();
        assert!(matches!(
            Envelope::decode(&too_deep, &options),
            Err(AppError::MalformedProtocol(_))
        ));
    }

    #[test]
    fn hostile_nesting_fails_without_recursing_through_it() {
        // a long chain of empty nodes, each claiming one child
        let mut bytes = BytesMut::new();
        for level in 0..100_000 {
            bytes.put_i32_le(level);
            bytes.put_i32_le(1);
            bytes.put_i64_le(0);
            bytes.put_i64_le(0);
            for section in [PROP, DATA, BLOB] {
                put_string(&mut bytes, section);
                bytes.put_i32_le(0);
            }
            put_string(&mut bytes, CLRN);
            bytes.put_i32_le(1);
        }
        let result = Envelope::from_bytes(&bytes, true);
        assert!(matches!(result, Err(AppError::MalformedProtocol(_))));
    }

    #[test]
    fn sections_out_of_order_are_rejected() {
        let mut bytes = BytesMut::new();
        bytes.put_i32_le(0);
        bytes.put_i32_le(1);
        bytes.put_i64_le(1);
        bytes.put_i64_le(0);
        for section in [DATA, PROP, BLOB, CLRN] {
            put_string(&mut bytes, section);
            bytes.put_i32_le(0);
        }
        assert!(matches!(
            Envelope::from_bytes(&bytes, false),
            Err(AppError::MalformedProtocol(_))
        ));

        let mut bytes = BytesMut::new();
        bytes.put_i32_le(0);
        bytes.put_i32_le(1);
        bytes.put_i64_le(1);
        bytes.put_i64_le(0);
        for section in [PROP, PROP, DATA, BLOB, CLRN] {
            put_string(&mut bytes, section);
            bytes.put_i32_le(0);
        }
        assert!(Envelope::from_bytes(&bytes, false).is_err());
    }

    #[test]
    fn unknown_section_is_rejected() {
        let mut bytes = BytesMut::new();
        bytes.put_i32_le(0);
        bytes.put_i32_le(1);
        bytes.put_i64_le(1);
        bytes.put_i64_le(0);
        put_string(&mut bytes, "JUNK");
        bytes.put_i32_le(0);
        assert!(matches!(
            Envelope::from_bytes(&bytes, false),
            Err(AppError::MalformedProtocol(_))
        ));
    }
}
