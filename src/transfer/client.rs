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
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::compression::CompressionProvider;
use crate::envelope::{Envelope, EnvelopeOptions};
use crate::network::{Connection, TransportOptions};
use crate::routing::Verb;
use crate::transfer::{remote_error, BatchHeader};
use crate::{AppError, AppResult};

/// Everything a transfer client needs to reach a peer.
#[derive(Clone)]
pub struct TransferOptions {
    pub transport: TransportOptions,
    pub connect_timeout: Duration,
    pub client_id: String,
    pub envelope: EnvelopeOptions,
    pub compression: Option<Arc<dyn CompressionProvider>>,
}

impl Default for TransferOptions {
    fn default() -> Self {
        TransferOptions {
            transport: TransportOptions::default(),
            connect_timeout: Duration::from_secs(5),
            client_id: Uuid::new_v4().to_string(),
            envelope: EnvelopeOptions::default(),
            compression: None,
        }
    }
}

impl fmt::Debug for TransferOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferOptions")
            .field("transport", &self.transport)
            .field("connect_timeout", &self.connect_timeout)
            .field("client_id", &self.client_id)
            .field("envelope", &self.envelope)
            .field("compression", &self.compression)
            .finish()
    }
}

/// Raw-tcp client side of the batch protocol.
#[derive(Debug)]
pub struct TransferClient {
    connection: Connection,
    options: TransferOptions,
    addr: String,
}

impl TransferClient {
    pub async fn connect(addr: &str, options: TransferOptions) -> AppResult<TransferClient> {
        let connection =
            Connection::connect(addr, options.transport.clone(), options.connect_timeout).await?;
        debug!("transfer client {} connected to {}", options.client_id, addr);
        Ok(TransferClient {
            connection,
            options,
            addr: addr.to_string(),
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn client_id(&self) -> &str {
        &self.options.client_id
    }

    /// Starts a session dispatched to `path` with `op_type`.
    pub fn session(&mut self, path: &str, op_type: Verb) -> TransferSession<'_> {
        TransferSession {
            client: self,
            id: Uuid::new_v4().to_string(),
            path: path.to_string(),
            op_type,
            next_batch: 0,
            forward_to: None,
            send_response: false,
            finished: false,
        }
    }

    /// Sends one envelope and reads the reply frame.
    ///
    /// An empty reply is `None`; an error reply becomes [`AppError::Remote`].
    pub async fn exchange(&mut self, envelope: &Envelope) -> AppResult<Option<Envelope>> {
        let mut body = envelope.to_bytes();
        if let Some(compression) = &self.options.compression {
            if !body.is_empty() {
                body = compression.compress(&body)?;
            }
        }
        self.connection.write_frame(&body).await?;

        let reply = self
            .connection
            .read_frame()
            .await?
            .ok_or(AppError::ConnectionClosed)?;
        let reply = self.decompress(reply)?;
        if reply.is_empty() {
            return Ok(None);
        }
        let envelope = Envelope::decode(&reply, &self.options.envelope)?;
        if let Some(error) = remote_error(&envelope) {
            return Err(error);
        }
        Ok(Some(envelope))
    }

    fn decompress(&self, body: BytesMut) -> AppResult<BytesMut> {
        match &self.options.compression {
            Some(compression) if !body.is_empty() => compression.decompress(&body),
            _ => Ok(body),
        }
    }

    pub async fn close(mut self) -> AppResult<()> {
        self.connection.shutdown().await
    }
}

/// One operation id's sequence of batches.
#[derive(Debug)]
pub struct TransferSession<'a> {
    client: &'a mut TransferClient,
    id: String,
    path: String,
    op_type: Verb,
    next_batch: u64,
    forward_to: Option<String>,
    send_response: bool,
    finished: bool,
}

impl<'a> TransferSession<'a> {
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Has the receiver pass the terminal batch on to `target` (`tcp://host:port/path`).
    pub fn with_forward_to(mut self, target: impl Into<String>) -> Self {
        self.forward_to = Some(target.into());
        self
    }

    pub fn with_send_response(mut self, send_response: bool) -> Self {
        self.send_response = send_response;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn next_batch(&self) -> u64 {
        self.next_batch
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Sends `batch` as the next batch; `keep_alive == false` ends the session.
    ///
    /// Returns the receiver's reply envelope when one was sent. A failed batch
    /// also ends the session since the receiver drops the connection.
    pub async fn send_batch(
        &mut self,
        mut batch: Envelope,
        keep_alive: bool,
    ) -> AppResult<Option<Envelope>> {
        if self.finished {
            return Err(AppError::IllegalStateError(format!(
                "session {} already sent its last batch",
                self.id
            )));
        }
        let header = BatchHeader {
            id: self.id.clone(),
            client_id: self.client.options.client_id.clone(),
            op_type: self.op_type,
            batch: self.next_batch,
            keep_alive,
            send_response: self.send_response,
            // only the terminal batch is forwarded
            forward_to: if keep_alive {
                None
            } else {
                self.forward_to.clone()
            },
            path: self.path.clone(),
        };
        header.write_to(&mut batch);
        trace!(
            "session {} sending batch {} keep_alive={}",
            self.id,
            self.next_batch,
            keep_alive
        );

        match self.client.exchange(&batch).await {
            Ok(reply) => {
                self.next_batch += 1;
                self.finished = !keep_alive;
                Ok(reply)
            }
            Err(e) => {
                self.finished = true;
                Err(e)
            }
        }
    }
}
