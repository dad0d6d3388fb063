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

use chrono::Utc;
use dashmap::DashMap;
use tracing::debug;

use crate::transfer::BatchHeader;
use crate::{AppError, AppResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    pub client_id: String,
    pub next_batch: u64,
    pub batches_received: u64,
    /// UTC millis of batch 0.
    pub started_at: i64,
    /// Connection the latest batch arrived on.
    pub connection_id: u64,
}

/// Receiving side bookkeeping of open transfer sessions, keyed by session id.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, SessionState>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        SessionRegistry::default()
    }

    /// Checks `header` against the session's expected sequence and records it.
    ///
    /// Batch 0 always (re)starts the session. A terminal batch closes it. The
    /// session belongs to `connection_id` until a later batch moves it.
    pub fn accept(&self, header: &BatchHeader, connection_id: u64) -> AppResult<SessionState> {
        let state = if header.batch == 0 {
            let state = SessionState {
                client_id: header.client_id.clone(),
                next_batch: 1,
                batches_received: 1,
                started_at: Utc::now().timestamp_millis(),
                connection_id,
            };
            if self
                .sessions
                .insert(header.id.clone(), state.clone())
                .is_some()
            {
                debug!("session {} restarted", header.id);
            }
            state
        } else {
            let mut entry = self.sessions.get_mut(&header.id).ok_or_else(|| {
                AppError::MalformedProtocol(format!(
                    "batch {} of unknown session {}",
                    header.batch, header.id
                ))
            })?;
            if entry.client_id != header.client_id {
                return Err(AppError::MalformedProtocol(format!(
                    "session {} belongs to client {:?}, not {:?}",
                    header.id, entry.client_id, header.client_id
                )));
            }
            if entry.next_batch != header.batch {
                return Err(AppError::MalformedProtocol(format!(
                    "session {} expected batch {}, got {}",
                    header.id, entry.next_batch, header.batch
                )));
            }
            entry.next_batch += 1;
            entry.batches_received += 1;
            entry.connection_id = connection_id;
            entry.clone()
        };

        if header.is_terminal() {
            self.sessions.remove(&header.id);
            debug!(
                "session {} finished after {} batches",
                header.id, state.batches_received
            );
        }
        Ok(state)
    }

    pub fn get(&self, id: &str) -> Option<SessionState> {
        self.sessions.get(id).map(|state| state.clone())
    }

    /// Drops the session so its next batch must start over at 0.
    pub fn end(&self, id: &str) -> Option<SessionState> {
        self.sessions.remove(id).map(|(_, state)| state)
    }

    /// Drops every session whose last batch came in on `connection_id`.
    pub fn end_connection(&self, connection_id: u64) -> usize {
        let mut ended = 0;
        self.sessions.retain(|id, state| {
            if state.connection_id != connection_id {
                return true;
            }
            debug!(
                "session {} abandoned after {} batches, connection {} closed",
                id, state.batches_received, connection_id
            );
            ended += 1;
            false
        });
        ended
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
