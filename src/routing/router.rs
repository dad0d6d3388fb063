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

use tracing::trace;

use crate::request::Context;
use crate::routing::{Route, RouteParams, Verb};
use crate::{AppError, AppResult};

/// Ordered route table; the first registered route that matches wins.
#[derive(Debug, Clone)]
pub struct Router {
    routes: Vec<Route>,
    default_route: Option<Route>,
    bind_any_host: bool,
}

impl Default for Router {
    fn default() -> Self {
        Router::new()
    }
}

impl Router {
    pub fn new() -> Self {
        Router {
            routes: Vec::new(),
            default_route: None,
            bind_any_host: true,
        }
    }

    pub fn route(mut self, route: Route) -> Self {
        self.add_route(route);
        self
    }

    pub fn add_route(&mut self, route: Route) {
        self.routes.push(route);
    }

    /// Route used when no template matches the request path.
    pub fn default_route(mut self, route: Route) -> Self {
        self.default_route = Some(route);
        self
    }

    /// When disabled, a route only matches requests addressed to its endpoint's host and port.
    pub fn bind_any_host(mut self, any: bool) -> Self {
        self.bind_any_host = any;
        self
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    fn host_matches(&self, route: &Route, ctx: &Context) -> bool {
        self.bind_any_host || route.matches_host(&ctx.request.uri.host, ctx.request.uri.port)
    }

    /// Picks the route for `ctx` and the parameters its template captured.
    pub fn resolve(&self, ctx: &Context) -> AppResult<(&Route, RouteParams)> {
        let uri = &ctx.request.uri;
        let verb = ctx.request.verb();
        let mut template_matched = false;

        for route in &self.routes {
            if !self.host_matches(route, ctx) {
                continue;
            }
            let Some(params) = route.template().matches(&uri.path, &uri.query) else {
                continue;
            };
            if !route.admits(ctx) {
                continue;
            }
            if !route.accepts(verb) {
                template_matched = true;
                continue;
            }
            trace!("{} matched route {}", uri.path, route.template().as_str());
            return Ok((route, params));
        }

        if template_matched {
            return Err(AppError::MethodNotAllowed(format!(
                "{} {}",
                ctx.request.header.method, uri.path
            )));
        }
        match &self.default_route {
            Some(route) => {
                let mut params = RouteParams::new();
                params.insert_query(&uri.query);
                Ok((route, params))
            }
            None => Err(AppError::NotFound(uri.path.clone())),
        }
    }

    /// Union of the verbs of every route whose template matches the request path.
    pub fn allowed_verbs(&self, ctx: &Context) -> Verb {
        let uri = &ctx.request.uri;
        self.routes
            .iter()
            .filter(|route| self.host_matches(route, ctx))
            .filter(|route| route.template().matches(&uri.path, &uri.query).is_some())
            .fold(Verb::empty(), |verbs, route| verbs | route.verbs())
    }

    /// Resolves the route for `ctx`, stores its parameters and runs its handler.
    pub async fn dispatch(&self, ctx: &mut Context) -> AppResult<()> {
        let (route, params) = self.resolve(ctx)?;
        ctx.params = params;
        route.handler().call(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    use bytes::BytesMut;

    use super::*;
    use crate::network::{HeaderMap, ProtocolMode, RequestHeader};
    use crate::request::Request;
    use crate::routing::SyncHandler;

    fn context(method: &str, path: &str, host: Option<&str>) -> Context {
        let mut headers = HeaderMap::new();
        if let Some(host) = host {
            headers.insert("Host", host);
        }
        let header = RequestHeader {
            method: method.to_string(),
            path: path.to_string(),
            protocol: ProtocolMode::Http,
            http_version: Some("1.1".to_string()),
            content_length: 0,
            header_length: 0,
            headers,
        };
        let local = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 7070);
        Context::new(Request::new(header, BytesMut::new(), Some(local)), None)
    }

    fn tagged(template: &str, verbs: Verb, tag: &'static str) -> Route {
        Route::new(
            template,
            verbs,
            SyncHandler::new(move |ctx: &mut Context| {
                ctx.response.text(200, tag);
                Ok(())
            }),
        )
        .unwrap()
    }

    async fn answer(router: &Router, ctx: &mut Context) -> AppResult<String> {
        router.dispatch(ctx).await?;
        Ok(String::from_utf8_lossy(&ctx.response.body).into_owned())
    }

    #[tokio::test]
    async fn first_registered_match_wins() {
        let router = Router::new()
            .route(tagged("/items/*", Verb::ALL, "wildcard"))
            .route(tagged("/items/{id}", Verb::GET, "specific"));

        let mut ctx = context("GET", "/items/42", None);
        assert_eq!(answer(&router, &mut ctx).await.unwrap(), "wildcard");
        assert_eq!(ctx.params.wildcard(), Some("42"));
    }

    #[tokio::test]
    async fn verb_mismatch_falls_through_to_later_routes() {
        let router = Router::new()
            .route(tagged("/items/{id}", Verb::DELETE, "delete"))
            .route(tagged("/items/{id}", Verb::GET, "get"));

        let mut ctx = context("GET", "/items/1", None);
        assert_eq!(answer(&router, &mut ctx).await.unwrap(), "get");
        assert_eq!(ctx.param("id"), Some("1"));
        assert_eq!(router.allowed_verbs(&ctx), Verb::GET | Verb::DELETE);
    }

    #[tokio::test]
    async fn no_match_uses_default_route_or_fails() {
        let bare = Router::new().route(tagged("/a", Verb::ALL, "a"));
        let mut ctx = context("GET", "/b?x=1", None);
        assert!(matches!(
            bare.dispatch(&mut ctx).await,
            Err(AppError::NotFound(_))
        ));

        let with_default = bare.default_route(tagged("/", Verb::ALL, "fallback"));
        let mut ctx = context("GET", "/b?x=1", None);
        assert_eq!(answer(&with_default, &mut ctx).await.unwrap(), "fallback");
        assert_eq!(ctx.params.query("x"), Some("1"));
    }

    #[tokio::test]
    async fn verb_mismatch_is_not_a_default_route_case() {
        let router = Router::new()
            .route(tagged("/a", Verb::GET, "a"))
            .default_route(tagged("/", Verb::ALL, "fallback"));
        let mut ctx = context("DELETE", "/a", None);
        assert!(matches!(
            router.dispatch(&mut ctx).await,
            Err(AppError::MethodNotAllowed(_))
        ));
    }

    #[tokio::test]
    async fn unknown_method_matches_no_verb() {
        let router = Router::new().route(tagged("/a", Verb::ALL, "a"));
        let mut ctx = context("TRACE", "/a", None);
        assert!(matches!(
            router.dispatch(&mut ctx).await,
            Err(AppError::MethodNotAllowed(_))
        ));
    }

    #[tokio::test]
    async fn predicate_can_veto_a_route() {
        let router = Router::new()
            .route(
                tagged("/a", Verb::ALL, "admin")
                    .when(|ctx: &Context| ctx.request.header.headers.contains("X-Admin")),
            )
            .route(tagged("/a", Verb::ALL, "public"));
        let mut ctx = context("GET", "/a", None);
        assert_eq!(answer(&router, &mut ctx).await.unwrap(), "public");
    }

    #[tokio::test]
    async fn endpoints_prefix_paths_and_filter_hosts() {
        let route = tagged("/items/{id}", Verb::GET, "v1")
            .at("http://vec.example:9000/api/v1")
            .unwrap();
        let strict = Router::new().route(route.clone()).bind_any_host(false);
        let loose = Router::new().route(route);

        let mut ctx = context("GET", "/api/v1/items/3", Some("vec.example:9000"));
        assert_eq!(answer(&strict, &mut ctx).await.unwrap(), "v1");

        let mut ctx = context("GET", "/api/v1/items/3", Some("other.example:9000"));
        assert!(strict.dispatch(&mut ctx).await.is_err());
        let mut ctx = context("GET", "/api/v1/items/3", Some("other.example:9000"));
        assert_eq!(answer(&loose, &mut ctx).await.unwrap(), "v1");
    }
}
