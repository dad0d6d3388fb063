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

//! Property keys carried by batch envelopes.

/// Operation id shared by every batch of one session.
pub const ID: &str = "Id";
pub const CLIENT_ID: &str = "ClientId";
/// Verb name the batch is dispatched with.
pub const OP_TYPE: &str = "OpType";
/// Zero-based sequence number within the session.
pub const BATCH: &str = "Batch";
/// `true` while more batches follow on the same connection.
pub const KEEP_ALIVE: &str = "KeepAlive";
/// Asks the receiver to answer with an envelope.
pub const SEND_RESPONSE: &str = "SendResponse";
/// `tcp://host:port/path` the terminal batch is passed on to.
pub const FORWARD_TO: &str = "ForwardTo";
/// Route path the batch is dispatched to.
pub const PATH: &str = "Path";
/// Status code of an error reply.
pub const STATUS: &str = "Status";
/// Message of an error reply.
pub const ERROR: &str = "Error";
