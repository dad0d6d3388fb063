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

//! Request Module Implementation
//!
//! Everything one request/response cycle works on: the [`Context`] built by the
//! connection handler, typed [`Extensions`] for middleware to share state, and
//! the [`Pipeline`] that drives pre-handlers, the router and post-handlers
//! against it.

pub use context::{ConnectionCloseHook, Context, Request, RequestUri, Response};
pub use extensions::Extensions;
pub use pipeline::{ErrorHandler, Middleware, Pipeline, Stage, StatusErrorHandler, SyncMiddleware};

mod context;
mod extensions;
mod pipeline;
