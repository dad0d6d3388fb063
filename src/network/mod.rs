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

//! Network Module Implementation
//!
//! Byte-level plumbing shared by the server and the transfer client.
//!
//! # Components
//!
//! - `Connection`: buffered reads and chunked writes over one TCP socket, every
//!   read bounded by the idle timeout
//! - `RequestHeader` / `RequestFrame`: decides from the first bytes whether a
//!   request is HTTP-style text or a raw-tcp frame (8-byte little-endian length
//!   followed by the body) and cuts complete requests out of the receive buffer
//! - `ResponseHeader`: response state mutated by handlers and serialised once
//!   at send time
//! - `HeaderMap`: case-insensitive multi-value headers

pub use connection::{Connection, TransportOptions};
pub use frame::{ProtocolMode, RequestFrame, RequestHeader, RAW_PREFIX_LEN};
pub use headers::HeaderMap;
pub use response::{reason_phrase, ResponseHeader};
mod connection;
mod frame;
mod headers;
mod response;
