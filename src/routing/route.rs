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
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use url::Url;

use crate::request::Context;
use crate::routing::{RouteTemplate, Verb};
use crate::{AppError, AppResult};

/// Endpoint used by routes that do not name one.
pub const DEFAULT_ENDPOINT: &str = "http://localhost/";

/// Produces the response for a matched route.
pub trait Handler: Send + Sync {
    fn call<'a>(
        &'a self,
        ctx: &'a mut Context,
    ) -> Pin<Box<dyn Future<Output = AppResult<()>> + Send + 'a>>;
}

/// Adapts a synchronous closure into a [`Handler`].
pub struct SyncHandler<F> {
    f: F,
}

impl<F> SyncHandler<F>
where
    F: Fn(&mut Context) -> AppResult<()> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        SyncHandler { f }
    }
}

impl<F> Handler for SyncHandler<F>
where
    F: Fn(&mut Context) -> AppResult<()> + Send + Sync,
{
    fn call<'a>(
        &'a self,
        ctx: &'a mut Context,
    ) -> Pin<Box<dyn Future<Output = AppResult<()>> + Send + 'a>> {
        let result = (self.f)(ctx);
        Box::pin(async move { result })
    }
}

pub type Predicate = Arc<dyn Fn(&Context) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct Route {
    endpoint: Url,
    template: RouteTemplate,
    verbs: Verb,
    predicate: Option<Predicate>,
    handler: Arc<dyn Handler>,
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("endpoint", &self.endpoint.as_str())
            .field("template", &self.template.as_str())
            .field("verbs", &self.verbs)
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}

impl Route {
    pub fn new(template: &str, verbs: Verb, handler: impl Handler + 'static) -> AppResult<Route> {
        Route::with_handler(template, verbs, Arc::new(handler))
    }

    pub fn with_handler(template: &str, verbs: Verb, handler: Arc<dyn Handler>) -> AppResult<Route> {
        let endpoint = Url::parse(DEFAULT_ENDPOINT)
            .map_err(|e| AppError::InvalidValue(format!("default endpoint: {}", e)))?;
        Ok(Route {
            endpoint,
            template: RouteTemplate::parse(template)?,
            verbs,
            predicate: None,
            handler,
        })
    }

    /// Places the route under `endpoint`: its host and port must match the
    /// request unless the router binds any host, and its path prefixes the
    /// template.
    pub fn at(mut self, endpoint: &str) -> AppResult<Route> {
        let url = Url::parse(endpoint)
            .map_err(|e| AppError::InvalidValue(format!("endpoint {:?}: {}", endpoint, e)))?;
        self.template = self.template.prefixed(url.path())?;
        self.endpoint = url;
        Ok(self)
    }

    /// Extra condition the context must satisfy for the route to match.
    pub fn when(mut self, predicate: impl Fn(&Context) -> bool + Send + Sync + 'static) -> Route {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn template(&self) -> &RouteTemplate {
        &self.template
    }

    pub fn verbs(&self) -> Verb {
        self.verbs
    }

    pub fn handler(&self) -> &Arc<dyn Handler> {
        &self.handler
    }

    pub(crate) fn matches_host(&self, host: &str, port: u16) -> bool {
        let host_matches = self
            .endpoint
            .host_str()
            .map(|h| h.eq_ignore_ascii_case(host))
            .unwrap_or(false);
        host_matches && self.endpoint.port_or_known_default() == Some(port)
    }

    pub(crate) fn accepts(&self, verb: Option<Verb>) -> bool {
        verb.map(|v| !v.is_empty() && self.verbs.contains(v))
            .unwrap_or(false)
    }

    pub(crate) fn admits(&self, ctx: &Context) -> bool {
        self.predicate.as_ref().map(|p| p(ctx)).unwrap_or(true)
    }
}
