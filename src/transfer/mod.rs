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

//! Transfer Module Implementation
//!
//! Multi-batch streaming of envelopes over raw-tcp connections.
//!
//! A session is a run of batch envelopes sharing one `Id`, numbered from 0 in
//! the `Batch` property. Every batch but the last carries `KeepAlive=true`,
//! which keeps the server side connection open for the next one. The last
//! batch may name a `ForwardTo` endpoint the receiver passes it on to.
//!
//! # Components
//!
//! - `TransferClient` / `TransferSession`: sending side
//! - `TransferService`: receiving side, installs routes on a `Router`
//! - `NamedLocks`: at most one batch of a session is handled at a time
//! - `SessionRegistry`: sequence checks of open sessions

pub use batch::{error_envelope, remote_error, BatchHeader};
pub use client::{TransferClient, TransferOptions, TransferSession};
pub use handler::{BatchHandler, SyncBatchHandler};
pub use lock::{NamedLockGuard, NamedLocks};
pub use service::TransferService;
pub use session::{SessionRegistry, SessionState};

mod batch;
mod client;
mod handler;
pub mod keys;
mod lock;
mod service;
mod session;
