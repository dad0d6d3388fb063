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

use std::net::SocketAddr;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::time;
use tracing::trace;

use crate::network::frame::{parse_raw_frame, starts_like_http};
use crate::network::{ProtocolMode, RequestFrame, RequestHeader, ResponseHeader};
use crate::{AppError, AppResult};

#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Socket buffer size and chunk size of the send buffer.
    pub buffer_size: usize,
    /// Upper bound for a single read; exceeding it fails the read with `Timeout`.
    pub idle_timeout: Duration,
    pub max_package_size: usize,
    pub max_header_size: usize,
}

impl Default for TransportOptions {
    fn default() -> Self {
        TransportOptions {
            buffer_size: 64 * 1024,
            idle_timeout: Duration::from_secs(30),
            max_package_size: 256 * 1024 * 1024,
            max_header_size: 64 * 1024,
        }
    }
}

impl TransportOptions {
    fn socket_buffer_size(&self) -> u32 {
        u32::try_from(self.buffer_size).unwrap_or(u32::MAX)
    }

    /// A socket carrying this transport's buffer sizes, ready to bind or connect.
    pub(crate) fn socket_for(&self, addr: &SocketAddr) -> AppResult<TcpSocket> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_send_buffer_size(self.socket_buffer_size())?;
        socket.set_recv_buffer_size(self.socket_buffer_size())?;
        Ok(socket)
    }
}

/// Buffered, timeout-bounded byte stream over one connected socket.
///
/// Incoming bytes accumulate in `buffer` until a whole request (or raw frame)
/// can be cut out of it. Outgoing bytes are copied through a fixed send buffer
/// of `buffer_size` bytes; the last chunk only carries what is left, so no
/// padding is ever written.
#[derive(Debug)]
pub struct Connection {
    stream: BufWriter<TcpStream>,
    buffer: BytesMut,
    send_buffer: BytesMut,
    pending: Option<RequestHeader>,
    options: TransportOptions,
    peer_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
}

impl Connection {
    pub fn new(socket: TcpStream, options: TransportOptions) -> Connection {
        if let Err(e) = socket.set_nodelay(true) {
            trace!("could not disable nagle: {}", e);
        }
        let peer_addr = socket.peer_addr().ok();
        let local_addr = socket.local_addr().ok();
        let buffer_size = options.buffer_size.max(1);
        Connection {
            stream: BufWriter::with_capacity(buffer_size, socket),
            buffer: BytesMut::with_capacity(buffer_size),
            send_buffer: BytesMut::with_capacity(buffer_size),
            pending: None,
            options,
            peer_addr,
            local_addr,
        }
    }

    /// Opens a client connection, bounded by `connect_timeout`.
    pub async fn connect(
        addr: &str,
        options: TransportOptions,
        connect_timeout: Duration,
    ) -> AppResult<Connection> {
        let target = lookup_host(addr)
            .await?
            .next()
            .ok_or_else(|| AppError::DetailedIoError(format!("cannot resolve {}", addr)))?;
        let socket = options.socket_for(&target)?;
        let stream = time::timeout(connect_timeout, socket.connect(target))
            .await
            .map_err(|_| AppError::Timeout(format!("connecting to {}", target)))??;
        trace!("connected to {}", target);
        Ok(Connection::new(stream, options))
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn options(&self) -> &TransportOptions {
        &self.options
    }

    /// Protocol of the request being received, judged from the bytes so far.
    ///
    /// Lets a request that failed framing still be answered in its own protocol.
    pub fn incoming_protocol(&self) -> ProtocolMode {
        match &self.pending {
            Some(header) => header.protocol,
            None if starts_like_http(&self.buffer) => ProtocolMode::Http,
            None => ProtocolMode::RawTcp,
        }
    }

    /// One bounded read into the receive buffer. `Ok(0)` means the peer closed.
    async fn fill_buffer(&mut self) -> AppResult<usize> {
        let idle_timeout = self.options.idle_timeout;
        match time::timeout(idle_timeout, self.stream.read_buf(&mut self.buffer)).await {
            Ok(read) => Ok(read?),
            Err(_) => Err(AppError::Timeout(format!(
                "no data from {:?} within {:?}",
                self.peer_addr, idle_timeout
            ))),
        }
    }

    fn closed_result<T>(&self) -> AppResult<Option<T>> {
        if self.buffer.is_empty() && self.pending.is_none() {
            // client has closed the connection gracefully
            Ok(None)
        } else {
            Err(AppError::ConnectionClosed)
        }
    }

    /// Reads the next request, detecting its protocol mode.
    ///
    /// Returns `None` if the peer closed the connection between requests.
    pub async fn read_request(&mut self) -> AppResult<Option<RequestFrame>> {
        loop {
            if let Some(frame) =
                RequestFrame::parse(&mut self.buffer, &mut self.pending, &self.options)?
            {
                trace!(
                    "read {} request {} {} ({} body bytes)",
                    frame.header.protocol,
                    frame.header.method,
                    frame.header.path,
                    frame.body.len()
                );
                return Ok(Some(frame));
            }
            if 0 == self.fill_buffer().await? {
                return self.closed_result();
            }
        }
    }

    /// Reads the next raw-tcp frame body, the way responses come back to a client.
    pub async fn read_frame(&mut self) -> AppResult<Option<BytesMut>> {
        loop {
            if let Some(body) = parse_raw_frame(&mut self.buffer, self.options.max_package_size)? {
                return Ok(Some(body));
            }
            if 0 == self.fill_buffer().await? {
                return self.closed_result();
            }
        }
    }

    /// Writes an 8-byte little-endian length prefix followed by `body`.
    pub async fn write_frame(&mut self, body: &[u8]) -> AppResult<usize> {
        let prefix = (body.len() as i64).to_le_bytes();
        let mut sent = self.send_chunked(&prefix).await?;
        sent += self.send_chunked(body).await?;
        self.flush().await?;
        Ok(sent)
    }

    /// Writes an HTTP response head followed by `body`.
    pub async fn write_http(&mut self, header: &ResponseHeader, body: &[u8]) -> AppResult<usize> {
        let head = header.encode_http(body.len());
        let mut sent = self.send_chunked(&head).await?;
        sent += self.send_chunked(body).await?;
        self.flush().await?;
        Ok(sent)
    }

    /// Writes raw bytes with no framing, e.g. a hand-built request.
    pub async fn write_bytes(&mut self, bytes: &[u8]) -> AppResult<usize> {
        let sent = self.send_chunked(bytes).await?;
        self.flush().await?;
        Ok(sent)
    }

    async fn send_chunked(&mut self, bytes: &[u8]) -> AppResult<usize> {
        let chunk_size = self.options.buffer_size.max(1);
        let mut sent = 0;
        for chunk in bytes.chunks(chunk_size) {
            self.send_buffer.clear();
            self.send_buffer.extend_from_slice(chunk);
            self.stream.write_all(&self.send_buffer).await.map_err(|e| {
                AppError::DetailedIoError(format!("write to {:?} failed: {}", self.peer_addr, e))
            })?;
            sent += chunk.len();
        }
        Ok(sent)
    }

    async fn flush(&mut self) -> AppResult<()> {
        self.stream.flush().await.map_err(|e| {
            AppError::DetailedIoError(format!("flush to {:?} failed: {}", self.peer_addr, e))
        })
    }

    /// Flushes pending output and closes the write half.
    pub async fn shutdown(&mut self) -> AppResult<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}
