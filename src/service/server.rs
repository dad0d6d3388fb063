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
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::net::{lookup_host, TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};
use tracing::{debug, error, info, trace, warn};

use crate::compression::CompressionProvider;
use crate::envelope::EnvelopeOptions;
use crate::network::{Connection, ProtocolMode, RequestFrame, TransportOptions};
use crate::request::{
    ConnectionCloseHook, Context, ErrorHandler, Middleware, Pipeline, Request, Response, Stage,
};
use crate::routing::Router;
use crate::transfer::error_envelope;
use crate::{AppError, AppResult};

use super::{ServerConfig, Shutdown, ShutdownHandle, ShutdownNotifier};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

const ENVELOPE_MIME_TYPE: &str = "application/x-vecwire-envelope";
const XML_MIME_TYPE: &str = "application/xml";

/// Consecutive accept failures tolerated before the accept loop backs off.
const ACCEPT_FAILURES_BEFORE_BACKOFF: u32 = 3;
const MIN_ACCEPT_BACKOFF: Duration = Duration::from_millis(10);
const MAX_ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    Stopped,
    Running,
    ShuttingDown,
    /// The accept loop died on a fatal transport error.
    Broken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDisposition {
    Continue,
    Fatal,
}

/// Decides whether a transport error in the accept loop ends the server.
pub trait TransportErrorHook: Send + Sync {
    fn on_transport_error(&self, error: &AppError) -> ErrorDisposition;
}

impl<F> TransportErrorHook for F
where
    F: Fn(&AppError) -> ErrorDisposition + Send + Sync,
{
    fn on_transport_error(&self, error: &AppError) -> ErrorDisposition {
        self(error)
    }
}

/// Logs the error and keeps accepting.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogTransportErrors;

impl TransportErrorHook for LogTransportErrors {
    fn on_transport_error(&self, error: &AppError) -> ErrorDisposition {
        warn!("transport error while accepting: {}", error);
        ErrorDisposition::Continue
    }
}

/// What every connection handler shares.
struct Shared {
    router: Router,
    pipeline: Pipeline,
    compression: Option<Arc<dyn CompressionProvider>>,
    envelope: EnvelopeOptions,
    transport: TransportOptions,
}

impl Shared {
    fn decompress(&self, body: BytesMut) -> AppResult<BytesMut> {
        match &self.compression {
            Some(compression) if !body.is_empty() => compression.decompress(&body),
            _ => Ok(body),
        }
    }

    fn compress(&self, body: BytesMut) -> AppResult<BytesMut> {
        match &self.compression {
            Some(compression) if !body.is_empty() => compression.compress(&body),
            _ => Ok(body),
        }
    }
}

pub struct ServerBuilder {
    config: Arc<ServerConfig>,
    router: Router,
    pipeline: Pipeline,
    compression: Option<Arc<dyn CompressionProvider>>,
    hook: Arc<dyn TransportErrorHook>,
}

impl ServerBuilder {
    pub fn new(config: Arc<ServerConfig>) -> Self {
        let compression = config.compression_provider();
        ServerBuilder {
            config,
            router: Router::new(),
            pipeline: Pipeline::new(),
            compression,
            hook: Arc::new(LogTransportErrors),
        }
    }

    pub fn router(mut self, router: Router) -> Self {
        self.router = router.bind_any_host(self.config.network.bind_any_host);
        self
    }

    pub fn middleware(mut self, stage: Stage, middleware: Arc<dyn Middleware>) -> Self {
        self.pipeline.add(stage, middleware);
        self
    }

    pub fn error_handler(mut self, handler: Arc<dyn ErrorHandler>) -> Self {
        self.pipeline.add_error_handler(handler);
        self
    }

    /// Replaces the provider derived from the configuration.
    pub fn compression(mut self, compression: Option<Arc<dyn CompressionProvider>>) -> Self {
        self.compression = compression;
        self
    }

    pub fn transport_error_hook(mut self, hook: Arc<dyn TransportErrorHook>) -> Self {
        self.hook = hook;
        self
    }

    pub fn build(self) -> Server {
        let shared = Shared {
            router: self.router,
            pipeline: self.pipeline,
            compression: self.compression,
            envelope: self.config.envelope.options(),
            transport: self.config.network.transport_options(),
        };
        Server {
            config: self.config,
            shared: Arc::new(shared),
            hook: self.hook,
            status: Arc::new(Mutex::new(ServerStatus::Stopped)),
            shutdown: None,
            supervisor: None,
            local_addr: None,
        }
    }
}

/// Listens on the configured address and runs every accepted connection
/// through the pipeline on its own task.
pub struct Server {
    config: Arc<ServerConfig>,
    shared: Arc<Shared>,
    hook: Arc<dyn TransportErrorHook>,
    status: Arc<Mutex<ServerStatus>>,
    shutdown: Option<ShutdownNotifier>,
    supervisor: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("listen_address", &self.config.network.listen_address())
            .field("local_addr", &self.local_addr)
            .field("status", &self.status())
            .finish()
    }
}

impl Server {
    pub fn builder(config: Arc<ServerConfig>) -> ServerBuilder {
        ServerBuilder::new(config)
    }

    pub fn status(&self) -> ServerStatus {
        *self.status.lock()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Binds the listener and spawns the accept loop.
    ///
    /// Returns the bound address, which differs from the configured one when
    /// port 0 was requested.
    #[tracing::instrument(skip(self))]
    pub async fn start(&mut self) -> AppResult<SocketAddr> {
        let status = self.status();
        if status != ServerStatus::Stopped {
            return Err(AppError::IllegalStateError(format!(
                "cannot start a server that is {:?}",
                status
            )));
        }

        let listen_address = self.config.network.listen_address();
        let addr = lookup_host(&listen_address)
            .await?
            .next()
            .ok_or_else(|| {
                AppError::DetailedIoError(format!("cannot resolve {}", listen_address))
            })?;
        let listener = match self.bind(addr) {
            Ok(listener) => listener,
            Err(err) => {
                error!(
                    "Failed to bind server to address: {} - Error: {}",
                    listen_address, err
                );
                return Err(err);
            }
        };
        let local_addr = listener.local_addr()?;
        info!("tcp server binding to {} for listening", local_addr);

        let notifier = ShutdownNotifier::new();
        let acceptor = Acceptor {
            listener,
            limit_connections: Arc::new(Semaphore::new(self.config.network.max_connection)),
            shutdown: notifier.handle(),
            shared: self.shared.clone(),
            hook: self.hook.clone(),
        };

        *self.status.lock() = ServerStatus::Running;
        let status = self.status.clone();
        let supervisor = tokio::spawn(async move {
            if let Err(err) = acceptor.run().await {
                error!("accept loop failed: {}", err);
                *status.lock() = ServerStatus::Broken;
            }
        });

        self.shutdown = Some(notifier);
        self.supervisor = Some(supervisor);
        self.local_addr = Some(local_addr);
        Ok(local_addr)
    }

    fn bind(&self, addr: SocketAddr) -> AppResult<TcpListener> {
        let socket = self.shared.transport.socket_for(&addr)?;
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        Ok(socket.listen(1024)?)
    }

    /// Signals the accept loop and every connection to finish.
    ///
    /// With `wait`, blocks until all of them exited or the wait elapsed.
    /// Connections in the middle of a request finish that cycle first.
    #[tracing::instrument(skip(self))]
    pub async fn stop(&mut self, wait: Option<Duration>) -> AppResult<()> {
        let Some(notifier) = self.shutdown.take() else {
            debug!("stop called on a server that is not started");
            return Ok(());
        };
        *self.status.lock() = ServerStatus::ShuttingDown;
        let listening = notifier.notify();
        debug!("shutdown signalled to {} tasks", listening);

        let supervisor = self.supervisor.take();
        if let Some(wait) = wait {
            let drained = async move {
                if let Some(supervisor) = supervisor {
                    let _ = supervisor.await;
                }
                notifier.drained().await;
            };
            if time::timeout(wait, drained).await.is_err() {
                warn!("server did not drain within {:?}", wait);
            }
        }

        *self.status.lock() = ServerStatus::Stopped;
        self.local_addr = None;
        info!("tcp server stopped");
        Ok(())
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Some(notifier) = self.shutdown.take() {
            notifier.notify();
        }
        debug!("tcp server dropped");
    }
}

/// The accept loop, running as its own task.
struct Acceptor {
    listener: TcpListener,
    limit_connections: Arc<Semaphore>,
    shutdown: ShutdownHandle,
    shared: Arc<Shared>,
    hook: Arc<dyn TransportErrorHook>,
}

impl Acceptor {
    /// Accepts until shutdown is signalled. Each connection holds a permit of
    /// the connection semaphore for as long as it is open.
    async fn run(self) -> AppResult<()> {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let permit = tokio::select! {
                permit = self.limit_connections.clone().acquire_owned() => {
                    permit.map_err(|e| AppError::IllegalStateError(e.to_string()))?
                }
                _ = shutdown.recv() => break,
            };

            let socket = tokio::select! {
                res = self.accept() => res?,
                _ = shutdown.recv() => break,
            };

            let connection = Connection::new(socket, self.shared.transport.clone());
            let connection_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
            debug!(
                "accepted connection {} from {:?}",
                connection_id,
                connection.peer_addr()
            );

            let mut handler = ConnectionHandler {
                connection_id,
                connection,
                shared: self.shared.clone(),
                shutdown: self.shutdown.subscribe(),
                _shutdown_handle: self.shutdown.clone(),
                close_hooks: Vec::new(),
            };

            tokio::spawn(async move {
                if let Err(err) = handler.handle_connection().await {
                    if err.is_transport() {
                        debug!("connection {} closed: {}", handler.connection_id, err);
                    } else {
                        error!("Connection error: {:?}", err);
                    }
                }
                // whether gracefully or unexpectedly closed, release connection
                drop(permit);
            });
        }
        debug!("accept loop exited");
        Ok(())
    }

    /// Accepts one socket. Failures go through the transport error hook;
    /// after a few in a row the loop sleeps with doubling backoff.
    async fn accept(&self) -> AppResult<TcpStream> {
        let mut failures = 0u32;
        let mut backoff = MIN_ACCEPT_BACKOFF;

        loop {
            match self.listener.accept().await {
                Ok((socket, _)) => return Ok(socket),
                Err(err) => {
                    let err = AppError::DetailedIoError(format!("accept tcp server error: {}", err));
                    if self.hook.on_transport_error(&err) == ErrorDisposition::Fatal {
                        return Err(err);
                    }
                    failures += 1;
                }
            }

            if failures >= ACCEPT_FAILURES_BEFORE_BACKOFF {
                time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_ACCEPT_BACKOFF);
            }
        }
    }
}

// handler for each connection
struct ConnectionHandler {
    connection_id: u64,
    connection: Connection,
    shared: Arc<Shared>,
    shutdown: Shutdown,
    _shutdown_handle: ShutdownHandle,
    /// Hooks requests on this connection asked to run when it closes.
    close_hooks: Vec<Arc<dyn ConnectionCloseHook>>,
}

impl ConnectionHandler {
    /// Runs request/response cycles strictly one after another.
    ///
    /// The connection stays open only while the last cycle asked for more data.
    async fn handle_connection(&mut self) -> AppResult<()> {
        loop {
            // read request from client, if client close the connection gracefully, return None,
            // if client close the connection unexpectedly, return Err
            let maybe_frame = tokio::select! {
                res = self.connection.read_request() => res,
                _ = self.shutdown.recv() => {
                    debug!("connection handler exit read loop after recv shutdown signal");
                    return Ok(());
                }
            };
            let maybe_frame = match maybe_frame {
                Ok(maybe_frame) => maybe_frame,
                Err(err) if err.is_transport() => return Err(err),
                Err(err) => {
                    // the stream cannot be resynchronised after a framing error
                    let protocol = self.connection.incoming_protocol();
                    self.reject(protocol, err).await?;
                    break;
                }
            };

            let Some(frame) = maybe_frame else {
                // client close the connection gracefully
                return Ok(());
            };

            if !self.process(frame).await? {
                break;
            }
        }
        trace!("connection {} done, disconnecting", self.connection_id);
        self.connection.shutdown().await
    }

    /// One cycle; returns whether the connection should stay open.
    async fn process(&mut self, frame: RequestFrame) -> AppResult<bool> {
        let protocol = frame.header.protocol;
        let request = self.shared.decompress(frame.body).and_then(|body| {
            let frame = RequestFrame {
                header: frame.header,
                body,
            };
            Request::from_frame(frame, self.connection.local_addr(), &self.shared.envelope)
        });
        let request = match request {
            Ok(request) => request,
            Err(err) => {
                self.reject(protocol, err).await?;
                return Ok(false);
            }
        };
        let xml_reply = protocol == ProtocolMode::Http && accepts_xml(&request);

        let mut ctx = Context::new(request, self.connection.peer_addr())
            .with_envelope_options(self.shared.envelope)
            .with_connection_id(self.connection_id);
        self.shared
            .pipeline
            .execute(&mut ctx, &self.shared.router)
            .await;
        for hook in ctx.take_close_hooks() {
            if !self.close_hooks.iter().any(|known| Arc::ptr_eq(known, &hook)) {
                self.close_hooks.push(hook);
            }
        }

        let more_data_expected = ctx.more_data_expected() && !ctx.is_cancelled();
        trace!(
            "{} {} answered {:?}",
            ctx.request.header.method,
            ctx.request.path(),
            ctx.response.header.status
        );
        self.respond(protocol, ctx.response, xml_reply).await?;
        Ok(more_data_expected)
    }

    /// Answers a request that never reached the pipeline with the error's status.
    async fn reject(&mut self, protocol: ProtocolMode, err: AppError) -> AppResult<usize> {
        warn!(
            "rejecting {} request on connection {}: {}",
            protocol, self.connection_id, err
        );
        let mut response = Response::default();
        response.text(err.status_code(), err.to_string());
        self.respond(protocol, response, false).await
    }

    async fn respond(
        &mut self,
        protocol: ProtocolMode,
        response: Response,
        xml_reply: bool,
    ) -> AppResult<usize> {
        let Response {
            mut header,
            body,
            envelope,
        } = response;

        let body = match protocol {
            ProtocolMode::Http => match envelope {
                Some(envelope) if body.is_empty() && xml_reply => {
                    header.mime_type = XML_MIME_TYPE.to_string();
                    let xml = envelope.export_xml(self.shared.envelope.vector_format)?;
                    BytesMut::from(xml.as_bytes())
                }
                Some(envelope) if body.is_empty() => {
                    header.mime_type = ENVELOPE_MIME_TYPE.to_string();
                    envelope.to_bytes()
                }
                _ => body,
            },
            ProtocolMode::RawTcp if header.error => {
                let message = match &header.status_text {
                    Some(text) => text.clone(),
                    None if !body.is_empty() => String::from_utf8_lossy(&body).into_owned(),
                    None => header.reason().to_string(),
                };
                error_envelope(header.status_or(500), &message).to_bytes()
            }
            ProtocolMode::RawTcp => match envelope {
                Some(envelope) => envelope.to_bytes(),
                None => body,
            },
        };
        let body = self.shared.compress(body)?;

        match protocol {
            ProtocolMode::Http => self.connection.write_http(&header, &body).await,
            ProtocolMode::RawTcp => self.connection.write_frame(&body).await,
        }
    }
}

/// Whether the client listed an XML media type in `Accept`.
fn accepts_xml(request: &Request) -> bool {
    request
        .header
        .headers
        .get_all("accept")
        .iter()
        .any(|value| {
            let media_type = value.split(';').next().unwrap_or_default().trim();
            media_type.eq_ignore_ascii_case(XML_MIME_TYPE)
                || media_type.eq_ignore_ascii_case("text/xml")
        })
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        for hook in self.close_hooks.drain(..) {
            hook.connection_closed(self.connection_id);
        }
        trace!("connection handler {} dropped", self.connection_id);
    }
}
