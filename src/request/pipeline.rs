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

use std::fmt::Debug;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::network::ProtocolMode;
use crate::routing::Router;
use crate::{AppError, AppResult};

use super::Context;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Runs before the router picks and invokes a handler.
    PreHandler,
    /// Runs after the handler, even when the route was not found.
    PostHandler,
}

pub trait Middleware: Send + Sync + Debug {
    fn handle<'a>(
        &'a self,
        ctx: &'a mut Context,
    ) -> Pin<Box<dyn Future<Output = AppResult<()>> + Send + 'a>>;
}

/// Wraps a plain closure as a [`Middleware`].
pub struct SyncMiddleware<F> {
    name: &'static str,
    f: F,
}

impl<F> SyncMiddleware<F>
where
    F: Fn(&mut Context) -> AppResult<()> + Send + Sync,
{
    pub fn new(name: &'static str, f: F) -> Self {
        SyncMiddleware { name, f }
    }
}

impl<F> Debug for SyncMiddleware<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncMiddleware")
            .field("name", &self.name)
            .finish()
    }
}

impl<F> Middleware for SyncMiddleware<F>
where
    F: Fn(&mut Context) -> AppResult<()> + Send + Sync,
{
    fn handle<'a>(
        &'a self,
        ctx: &'a mut Context,
    ) -> Pin<Box<dyn Future<Output = AppResult<()>> + Send + 'a>> {
        let result = (self.f)(ctx);
        Box::pin(async move { result })
    }
}

/// Offered every error a middleware or handler returns.
///
/// Returning `true` marks the error handled and stops it from reaching the
/// remaining handlers.
pub trait ErrorHandler: Send + Sync {
    fn handle_error(&self, ctx: &mut Context, error: &AppError) -> bool;
}

impl<F> ErrorHandler for F
where
    F: Fn(&mut Context, &AppError) -> bool + Send + Sync,
{
    fn handle_error(&self, ctx: &mut Context, error: &AppError) -> bool {
        self(ctx, error)
    }
}

/// Answers every error with its status code and message as plain text.
#[derive(Debug, Default, Clone, Copy)]
pub struct StatusErrorHandler;

impl ErrorHandler for StatusErrorHandler {
    fn handle_error(&self, ctx: &mut Context, error: &AppError) -> bool {
        ctx.response.text(error.status_code(), error.to_string());
        true
    }
}

/// Ordered middleware stages around the router.
#[derive(Default, Clone)]
pub struct Pipeline {
    pre_handlers: Vec<Arc<dyn Middleware>>,
    post_handlers: Vec<Arc<dyn Middleware>>,
    error_handlers: Vec<Arc<dyn ErrorHandler>>,
}

impl Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("pre_handlers", &self.pre_handlers)
            .field("post_handlers", &self.post_handlers)
            .field("error_handlers", &self.error_handlers.len())
            .finish()
    }
}

impl Pipeline {
    pub fn new() -> Self {
        Pipeline::default()
    }

    /// Appends `middleware` to `stage`; registration order is execution order.
    pub fn add(&mut self, stage: Stage, middleware: Arc<dyn Middleware>) {
        match stage {
            Stage::PreHandler => self.pre_handlers.push(middleware),
            Stage::PostHandler => self.post_handlers.push(middleware),
        }
    }

    pub fn add_error_handler(&mut self, handler: Arc<dyn ErrorHandler>) {
        self.error_handlers.push(handler);
    }

    /// Runs pre-handlers, the router and post-handlers, stopping at the first
    /// cancellation, then the finishing stage.
    pub async fn execute(&self, ctx: &mut Context, router: &Router) {
        'stages: {
            for middleware in &self.pre_handlers {
                let result = middleware.handle(ctx).await;
                self.settle(ctx, result);
                if ctx.is_cancelled() {
                    debug!("pipeline cancelled by pre-handler {:?}", middleware);
                    break 'stages;
                }
            }

            let result = router.dispatch(ctx).await;
            self.settle(ctx, result);
            if ctx.is_cancelled() {
                break 'stages;
            }

            for middleware in &self.post_handlers {
                let result = middleware.handle(ctx).await;
                self.settle(ctx, result);
                if ctx.is_cancelled() {
                    debug!("pipeline cancelled by post-handler {:?}", middleware);
                    break 'stages;
                }
            }
        }
        Self::finish(ctx, router);
    }

    fn settle(&self, ctx: &mut Context, result: AppResult<()>) {
        let Err(error) = result else {
            return;
        };
        for handler in &self.error_handlers {
            if handler.handle_error(ctx, &error) {
                trace!("error handled: {}", error);
                return;
            }
        }
        warn!(
            "unhandled error on {} {}: {}",
            ctx.request.header.method,
            ctx.request.path(),
            error
        );
        ctx.fail(error);
    }

    /// Fills in the status nobody set and advertises allowed verbs on 405.
    fn finish(ctx: &mut Context, router: &Router) {
        if ctx.response.header.status.is_none() {
            match ctx.error() {
                Some(error) => {
                    let status = error.status_code();
                    let message = error.to_string();
                    if ctx.response.has_content() {
                        ctx.response.header.set_error(status, message);
                    } else {
                        ctx.response.text(status, message);
                    }
                }
                None if ctx.response.has_content() => ctx.response.header.set_status(200),
                None => ctx.response.header.set_status(404),
            }
        }

        if ctx.response.header.status == Some(405) && !ctx.response.header.headers.contains("Accept")
        {
            let verbs = router.allowed_verbs(ctx);
            let names = match ctx.request.protocol() {
                ProtocolMode::Http => verbs.http_methods(),
                ProtocolMode::RawTcp => verbs.names(),
            };
            for name in names {
                ctx.response.header.headers.append("Accept", name);
            }
        }
    }
}
