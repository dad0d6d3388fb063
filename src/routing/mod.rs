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

//! Routing Module Implementation
//!
//! Maps a request path and verb onto a handler.
//!
//! Templates look like `/items/{id}/*?limit={max}&sort=asc`: literal segments
//! must match exactly, `{name}` captures one segment, `*` captures one segment
//! or, in last position, the rest of the path, and declared query keys are
//! copied into the parameters. Every query pair is also exposed as
//! `query.<key>`.

pub use route::{Handler, Predicate, Route, SyncHandler, DEFAULT_ENDPOINT};
pub use router::Router;
pub use template::{Part, RouteParams, RouteTemplate, QUERY_PREFIX, WILDCARD_KEY};
pub use verb::Verb;

mod route;
mod router;
mod template;
mod verb;
