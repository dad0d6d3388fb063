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

//! Dual-protocol TCP transport for structured vector envelopes.
//!
//! One listener serves HTTP-style text requests and raw-tcp frames side by
//! side. Requests run through a middleware pipeline into a template router;
//! raw-tcp bodies are [`Envelope`]s, hierarchical documents with a checksum per
//! level. The transfer layer streams multi-batch sessions of envelopes on top.

pub mod compression;
pub mod envelope;
pub mod network;
pub mod request;
pub mod routing;
pub mod transfer;

mod service;

pub use compression::{CompressionProvider, GzipCompression};
pub use envelope::{Blob, Envelope, EnvelopeOptions, VectorFormat};
pub use service::{
    setup_local_tracing, setup_tracing, AppError, AppResult, CompressionConfig, EnvelopeConfig,
    ErrorDisposition, LogTransportErrors, NetworkConfig, Server, ServerBuilder, ServerConfig,
    ServerStatus, Shutdown, ShutdownHandle, ShutdownNotifier, TracingGuard, TransferConfig,
    TransportErrorHook,
};
