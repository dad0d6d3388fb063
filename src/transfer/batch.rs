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

use crate::envelope::Envelope;
use crate::routing::Verb;
use crate::transfer::keys;
use crate::{AppError, AppResult};

/// Typed view of the session properties of a batch envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchHeader {
    pub id: String,
    pub client_id: String,
    pub op_type: Verb,
    pub batch: u64,
    pub keep_alive: bool,
    pub send_response: bool,
    pub forward_to: Option<String>,
    pub path: String,
}

fn flag(envelope: &Envelope, key: &str) -> AppResult<bool> {
    match envelope.property(key) {
        None => Ok(false),
        Some(raw) if raw.eq_ignore_ascii_case("true") || raw == "1" => Ok(true),
        Some(raw) if raw.eq_ignore_ascii_case("false") || raw == "0" || raw.is_empty() => Ok(false),
        Some(raw) => Err(AppError::InvalidValue(format!(
            "property {} has unexpected value {:?}",
            key, raw
        ))),
    }
}

impl BatchHeader {
    pub fn read_from(envelope: &Envelope) -> AppResult<BatchHeader> {
        let id = envelope
            .property(keys::ID)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| AppError::InvalidValue("batch envelope without Id".to_string()))?;
        let op_type = match envelope.property(keys::OP_TYPE) {
            Some(op_type) => op_type.parse()?,
            None => Verb::CREATE,
        };
        Ok(BatchHeader {
            id: id.to_string(),
            client_id: envelope.property(keys::CLIENT_ID).unwrap_or_default().to_string(),
            op_type,
            batch: envelope.property_as::<u64>(keys::BATCH)?.unwrap_or(0),
            keep_alive: flag(envelope, keys::KEEP_ALIVE)?,
            send_response: flag(envelope, keys::SEND_RESPONSE)?,
            forward_to: envelope
                .property(keys::FORWARD_TO)
                .filter(|target| !target.is_empty())
                .map(str::to_string),
            path: envelope.property(keys::PATH).unwrap_or("/").to_string(),
        })
    }

    pub fn write_to(&self, envelope: &mut Envelope) {
        envelope.set_property(keys::ID, &self.id);
        envelope.set_property(keys::CLIENT_ID, &self.client_id);
        envelope.set_property(keys::OP_TYPE, self.op_type);
        envelope.set_property(keys::BATCH, self.batch);
        envelope.set_property(keys::KEEP_ALIVE, self.keep_alive);
        envelope.set_property(keys::SEND_RESPONSE, self.send_response);
        envelope.set_property(keys::PATH, &self.path);
        match &self.forward_to {
            Some(target) => {
                envelope.set_property(keys::FORWARD_TO, target);
            }
            None => {
                envelope.remove_property(keys::FORWARD_TO);
            }
        }
    }

    pub fn is_terminal(&self) -> bool {
        !self.keep_alive
    }
}

/// Reply sent in place of a result when a raw-tcp request fails.
pub fn error_envelope(status: u16, message: &str) -> Envelope {
    let mut envelope = Envelope::new();
    envelope.set_property(keys::STATUS, status);
    envelope.set_property(keys::ERROR, message);
    envelope
}

/// The error an error reply describes, if `envelope` is one.
pub fn remote_error(envelope: &Envelope) -> Option<AppError> {
    let status = envelope.property(keys::STATUS)?.parse::<u16>().ok()?;
    if status < 400 {
        return None;
    }
    Some(AppError::Remote {
        status,
        message: envelope.property(keys::ERROR).unwrap_or_default().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips_through_properties() {
        let header = BatchHeader {
            id: "op-1".to_string(),
            client_id: "client-a".to_string(),
            op_type: Verb::UPDATE,
            batch: 2,
            keep_alive: true,
            send_response: false,
            forward_to: Some("tcp://127.0.0.1:9000/sink".to_string()),
            path: "/models".to_string(),
        };
        let mut envelope = Envelope::new();
        header.write_to(&mut envelope);

        assert_eq!(envelope.property(keys::OP_TYPE), Some("Update"));
        assert_eq!(envelope.property(keys::KEEP_ALIVE), Some("true"));
        assert_eq!(BatchHeader::read_from(&envelope).unwrap(), header);

        let terminal = BatchHeader {
            keep_alive: false,
            forward_to: None,
            ..header
        };
        terminal.write_to(&mut envelope);
        assert_eq!(envelope.property(keys::FORWARD_TO), None);
        assert!(BatchHeader::read_from(&envelope).unwrap().is_terminal());
    }

    #[test]
    fn defaults_for_missing_properties() {
        let mut envelope = Envelope::new();
        envelope.set_property(keys::ID, "op");
        envelope.set_property(keys::KEEP_ALIVE, "True");
        let header = BatchHeader::read_from(&envelope).unwrap();
        assert_eq!(header.op_type, Verb::CREATE);
        assert_eq!(header.batch, 0);
        assert!(header.keep_alive);
        assert!(!header.send_response);
        assert_eq!(header.path, "/");
    }

    #[test]
    fn id_is_required() {
        assert!(BatchHeader::read_from(&Envelope::new()).is_err());
        let mut envelope = Envelope::new();
        envelope.set_property(keys::ID, "op");
        envelope.set_property(keys::BATCH, "second");
        assert!(BatchHeader::read_from(&envelope).is_err());
    }

    #[test]
    fn error_replies_surface_as_remote_errors() {
        let reply = error_envelope(409, "cannot acquire lock op-1");
        match remote_error(&reply) {
            Some(AppError::Remote { status, message }) => {
                assert_eq!(status, 409);
                assert!(message.contains("op-1"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(remote_error(&Envelope::new()).is_none());
    }
}
