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

//! XML rendition of an envelope tree.
//!
//! ```xml
//! <envelope level="0" version="1" checksum="..." timestamp="...">
//!   <prop key="Id">op-1</prop>
//!   <data format="csv">0.25,-1,3.5</data>
//!   <blobs key="weights">AP9yYXc=</blobs>
//!   <clrn>
//!     <envelope level="1" ...>...</envelope>
//!   </clrn>
//! </envelope>
//! ```

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use tracing::trace;

use super::document::{vector_bytes, vector_from_bytes, Blob, Envelope};
use super::{EnvelopeOptions, VectorFormat};
use crate::{AppError, AppResult};

const ENVELOPE: &[u8] = b"envelope";
const PROP: &[u8] = b"prop";
const DATA: &[u8] = b"data";
const BLOBS: &[u8] = b"blobs";
const CLRN: &[u8] = b"clrn";
const VALUE: &[u8] = b"v";

fn malformed(message: impl std::fmt::Display) -> AppError {
    AppError::MalformedProtocol(format!("xml envelope: {}", message))
}

impl Envelope {
    /// Renders the tree as indented XML, vectors encoded as `format`.
    pub fn export_xml(&self, format: VectorFormat) -> AppResult<String> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        self.write_xml(&mut writer, 0, format)?;
        String::from_utf8(writer.into_inner()).map_err(malformed)
    }

    fn write_xml(
        &self,
        writer: &mut Writer<Vec<u8>>,
        level: i32,
        format: VectorFormat,
    ) -> AppResult<()> {
        let level_attr = level.to_string();
        let version_attr = self.version.to_string();
        let checksum_attr = self.checksum().to_string();
        let timestamp_attr = self.timestamp.to_string();
        let mut start = BytesStart::new("envelope");
        start.push_attribute(("level", level_attr.as_str()));
        start.push_attribute(("version", version_attr.as_str()));
        start.push_attribute(("checksum", checksum_attr.as_str()));
        start.push_attribute(("timestamp", timestamp_attr.as_str()));
        writer.write_event(Event::Start(start))?;

        for (key, value) in &self.properties {
            let mut prop = BytesStart::new("prop");
            prop.push_attribute(("key", key.as_str()));
            write_text_element(writer, prop, "prop", value)?;
        }

        for vector in &self.vectors {
            let mut data = BytesStart::new("data");
            data.push_attribute(("format", format.as_str()));
            match format {
                VectorFormat::Inline if !vector.is_empty() => {
                    writer.write_event(Event::Start(data))?;
                    for value in vector {
                        write_text_element(writer, BytesStart::new("v"), "v", &value.to_string())?;
                    }
                    writer.write_event(Event::End(BytesEnd::new("data")))?;
                }
                VectorFormat::Inline => {
                    writer.write_event(Event::Empty(data))?;
                }
                VectorFormat::Base64 => {
                    let encoded = STANDARD.encode(vector_bytes(vector));
                    write_text_element(writer, data, "data", &encoded)?;
                }
                VectorFormat::Csv => {
                    let joined = vector
                        .iter()
                        .map(|v| v.to_string())
                        .collect::<Vec<_>>()
                        .join(",");
                    write_text_element(writer, data, "data", &joined)?;
                }
            }
        }

        for blob in &self.blobs {
            let mut element = BytesStart::new("blobs");
            element.push_attribute(("key", blob.key.as_str()));
            write_text_element(writer, element, "blobs", &STANDARD.encode(&blob.data))?;
        }

        if self.children.is_empty() {
            writer.write_event(Event::Empty(BytesStart::new("clrn")))?;
        } else {
            writer.write_event(Event::Start(BytesStart::new("clrn")))?;
            for child in &self.children {
                child.write_xml(writer, level + 1, format)?;
            }
            writer.write_event(Event::End(BytesEnd::new("clrn")))?;
        }

        writer.write_event(Event::End(BytesEnd::new("envelope")))?;
        Ok(())
    }

    /// Parses a tree produced by [`Envelope::export_xml`].
    ///
    /// Each `data` element names its own format, so documents mixing formats
    /// are accepted. With `validate` set the `checksum` attribute of every
    /// level must match the recomputed value.
    pub fn import_xml(xml: &str, validate: bool) -> AppResult<Envelope> {
        Self::import_xml_with(xml, &EnvelopeOptions::validating(validate))
    }

    /// [`Envelope::import_xml`] under explicit options, including the depth
    /// limit.
    pub fn import_xml_with(xml: &str, options: &EnvelopeOptions) -> AppResult<Envelope> {
        let mut reader = Reader::from_str(xml);
        loop {
            match reader.read_event()? {
                Event::Start(start) if start.name().as_ref() == ENVELOPE => {
                    return read_envelope(&mut reader, &start, 0, options)
                        .map(|(envelope, _)| envelope);
                }
                Event::Decl(_) | Event::Comment(_) | Event::PI(_) | Event::DocType(_) => {}
                Event::Text(text) if is_blank(&text) => {}
                Event::Eof => return Err(malformed("no envelope element")),
                other => return Err(malformed(format!("unexpected {:?}", other))),
            }
        }
    }
}

fn write_text_element(
    writer: &mut Writer<Vec<u8>>,
    start: BytesStart<'_>,
    name: &str,
    text: &str,
) -> AppResult<()> {
    if text.is_empty() {
        writer.write_event(Event::Empty(start))?;
        return Ok(());
    }
    writer.write_event(Event::Start(start))?;
    writer.write_event(Event::Text(BytesText::new(text)))?;
    writer.write_event(Event::End(BytesEnd::new(name)))?;
    Ok(())
}

fn is_blank(text: &BytesText<'_>) -> bool {
    text.iter().all(|b| b.is_ascii_whitespace())
}

fn attribute(start: &BytesStart<'_>, name: &str) -> AppResult<Option<String>> {
    for attr in start.attributes() {
        let attr = attr.map_err(malformed)?;
        if attr.key.as_ref() == name.as_bytes() {
            let value = attr.unescape_value().map_err(malformed)?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

fn required_attribute<T: std::str::FromStr>(start: &BytesStart<'_>, name: &str) -> AppResult<T> {
    let raw = attribute(start, name)?
        .ok_or_else(|| malformed(format!("missing attribute {}", name)))?;
    raw.parse::<T>()
        .map_err(|_| malformed(format!("attribute {}={:?} is not a number", name, raw)))
}

/// Collects the text content up to the end tag of the element just opened.
fn read_text(reader: &mut Reader<&[u8]>, end: &[u8]) -> AppResult<String> {
    let mut content = String::new();
    loop {
        match reader.read_event()? {
            Event::Text(text) => content.push_str(&text.unescape().map_err(malformed)?),
            Event::CData(data) => content.push_str(&String::from_utf8_lossy(&data)),
            Event::End(e) if e.name().as_ref() == end => return Ok(content),
            Event::Comment(_) => {}
            Event::Eof => return Err(malformed("unexpected end of document")),
            other => return Err(malformed(format!("unexpected {:?} in text", other))),
        }
    }
}

fn parse_csv(text: &str) -> AppResult<Vec<f32>> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(Vec::new());
    }
    text.split(',')
        .map(|v| {
            v.trim()
                .parse::<f32>()
                .map_err(|_| malformed(format!("bad vector value {:?}", v)))
        })
        .collect()
}

fn read_inline(reader: &mut Reader<&[u8]>) -> AppResult<Vec<f32>> {
    let mut vector = Vec::new();
    loop {
        match reader.read_event()? {
            Event::Start(e) if e.name().as_ref() == VALUE => {
                let text = read_text(reader, VALUE)?;
                vector.push(
                    text.trim()
                        .parse::<f32>()
                        .map_err(|_| malformed(format!("bad vector value {:?}", text)))?,
                );
            }
            Event::End(e) if e.name().as_ref() == DATA => return Ok(vector),
            Event::Text(text) if is_blank(&text) => {}
            Event::Comment(_) => {}
            Event::Eof => return Err(malformed("unexpected end of document")),
            other => return Err(malformed(format!("unexpected {:?} in data", other))),
        }
    }
}

fn decode_vector(format: VectorFormat, text: &str) -> AppResult<Vec<f32>> {
    match format {
        VectorFormat::Csv | VectorFormat::Inline => parse_csv(text),
        VectorFormat::Base64 => {
            let bytes = STANDARD.decode(text.trim()).map_err(malformed)?;
            vector_from_bytes(&bytes)
        }
    }
}

fn data_format(start: &BytesStart<'_>) -> AppResult<VectorFormat> {
    match attribute(start, "format")? {
        Some(raw) => raw.parse(),
        None => Ok(VectorFormat::Csv),
    }
}

/// Reads the children of a `clrn` element and returns their folded checksum.
fn read_children(
    reader: &mut Reader<&[u8]>,
    envelope: &mut Envelope,
    level: i32,
    options: &EnvelopeOptions,
) -> AppResult<i64> {
    let mut folded = 0;
    loop {
        match reader.read_event()? {
            Event::Start(e) if e.name().as_ref() == ENVELOPE => {
                if level as usize >= options.max_depth {
                    return Err(malformed(format!(
                        "nested deeper than {} levels",
                        options.max_depth
                    )));
                }
                let (child, checksum) = read_envelope(reader, &e, level + 1, options)?;
                folded ^= checksum;
                envelope.children.push(child);
            }
            Event::End(e) if e.name().as_ref() == CLRN => return Ok(folded),
            Event::Text(text) if is_blank(&text) => {}
            Event::Comment(_) => {}
            Event::Eof => return Err(malformed("unexpected end of document")),
            other => return Err(malformed(format!("unexpected {:?} in clrn", other))),
        }
    }
}

fn read_envelope(
    reader: &mut Reader<&[u8]>,
    start: &BytesStart<'_>,
    expected_level: i32,
    options: &EnvelopeOptions,
) -> AppResult<(Envelope, i64)> {
    let level: i32 = required_attribute(start, "level")?;
    if level != expected_level {
        return Err(malformed(format!(
            "level {} found where level {} was expected",
            level, expected_level
        )));
    }
    let version: i32 = required_attribute(start, "version")?;
    let stored_checksum: i64 = required_attribute(start, "checksum")?;
    let timestamp: i64 = required_attribute(start, "timestamp")?;
    let mut envelope = Envelope::empty(version, timestamp);
    let mut children_checksum = 0;

    loop {
        match reader.read_event()? {
            Event::Start(e) => match e.name().as_ref() {
                PROP => {
                    let key = attribute(&e, "key")?.ok_or_else(|| malformed("prop without key"))?;
                    let value = read_text(reader, PROP)?;
                    envelope.properties.insert(key, value);
                }
                DATA => {
                    let vector = match data_format(&e)? {
                        VectorFormat::Inline => read_inline(reader)?,
                        format => decode_vector(format, &read_text(reader, DATA)?)?,
                    };
                    envelope.vectors.push(vector);
                }
                BLOBS => {
                    let key = attribute(&e, "key")?.ok_or_else(|| malformed("blob without key"))?;
                    let text = read_text(reader, BLOBS)?;
                    let data = STANDARD.decode(text.trim()).map_err(malformed)?;
                    envelope.blobs.push(Blob {
                        key,
                        data: Bytes::from(data),
                    });
                }
                CLRN => children_checksum ^= read_children(reader, &mut envelope, level, options)?,
                other => {
                    return Err(malformed(format!(
                        "unknown element {}",
                        String::from_utf8_lossy(other)
                    )))
                }
            },
            Event::Empty(e) => match e.name().as_ref() {
                PROP => {
                    let key = attribute(&e, "key")?.ok_or_else(|| malformed("prop without key"))?;
                    envelope.properties.insert(key, String::new());
                }
                DATA => {
                    data_format(&e)?;
                    envelope.vectors.push(Vec::new());
                }
                BLOBS => {
                    let key = attribute(&e, "key")?.ok_or_else(|| malformed("blob without key"))?;
                    envelope.blobs.push(Blob {
                        key,
                        data: Bytes::new(),
                    });
                }
                CLRN => {}
                other => {
                    return Err(malformed(format!(
                        "unknown element {}",
                        String::from_utf8_lossy(other)
                    )))
                }
            },
            Event::End(e) if e.name().as_ref() == ENVELOPE => break,
            Event::Text(text) if is_blank(&text) => {}
            Event::Comment(_) => {}
            Event::Eof => return Err(malformed("unexpected end of document")),
            other => return Err(malformed(format!("unexpected {:?}", other))),
        }
    }

    let actual = envelope.local_checksum() ^ children_checksum;
    if options.validate_checksum && actual != stored_checksum {
        return Err(AppError::Integrity {
            level,
            expected: stored_checksum,
            actual,
        });
    }
    trace!("imported xml envelope level {}", level);
    Ok((envelope, actual))
}
