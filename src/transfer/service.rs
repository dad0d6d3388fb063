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

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::{debug, info};
use url::Url;

use crate::envelope::Envelope;
use crate::request::{ConnectionCloseHook, Context};
use crate::routing::{Handler, Route, Router, Verb};
use crate::transfer::{
    keys, BatchHandler, BatchHeader, NamedLocks, SessionRegistry, TransferClient, TransferOptions,
};
use crate::{AppError, AppResult};

#[derive(Debug)]
struct Inner {
    locks: NamedLocks,
    sessions: SessionRegistry,
    options: TransferOptions,
}

impl ConnectionCloseHook for Inner {
    fn connection_closed(&self, connection_id: u64) {
        let ended = self.sessions.end_connection(connection_id);
        if ended > 0 {
            debug!(
                "connection {} closed with {} unfinished sessions",
                connection_id, ended
            );
        }
    }
}

/// Receiving side of the batch protocol.
///
/// Routes registered through the service share one lock table and one session
/// registry, so a session id is exclusive across all of them.
#[derive(Debug, Clone)]
pub struct TransferService {
    inner: Arc<Inner>,
}

impl TransferService {
    /// `options` configure the client used to forward terminal batches.
    pub fn new(options: TransferOptions) -> Self {
        TransferService {
            inner: Arc::new(Inner {
                locks: NamedLocks::new(),
                sessions: SessionRegistry::new(),
                options,
            }),
        }
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.inner.sessions
    }

    pub fn locks(&self) -> &NamedLocks {
        &self.inner.locks
    }

    /// Adds a route on `path` feeding every batch sent with `verb` to `handler`.
    pub fn register(
        &self,
        router: &mut Router,
        path: &str,
        verb: Verb,
        handler: impl BatchHandler + 'static,
    ) -> AppResult<()> {
        let route = BatchRoute {
            inner: self.inner.clone(),
            handler: Arc::new(handler),
        };
        router.add_route(Route::new(path, verb, route)?);
        info!("transfer endpoint {} registered for {}", path, verb);
        Ok(())
    }
}

struct BatchRoute {
    inner: Arc<Inner>,
    handler: Arc<dyn BatchHandler>,
}

impl Handler for BatchRoute {
    fn call<'a>(
        &'a self,
        ctx: &'a mut Context,
    ) -> Pin<Box<dyn Future<Output = AppResult<()>> + Send + 'a>> {
        Box::pin(async move {
            let mut batch = ctx.request.envelope.take().ok_or_else(|| {
                AppError::InvalidValue("transfer request carries no envelope".to_string())
            })?;
            let header = BatchHeader::read_from(&batch)?;

            let _guard = self.inner.locks.try_acquire(&header.id)?;
            ctx.on_connection_close(self.inner.clone());
            self.inner.sessions.accept(&header, ctx.connection_id())?;
            let reply = match self.handler.handle(&mut batch, &header).await {
                Ok(reply) => reply,
                Err(e) => {
                    self.inner.sessions.end(&header.id);
                    return Err(e);
                }
            };
            let reply = match reply {
                Some(reply) if header.send_response => Some(reply),
                None if header.send_response => Some(batch.clone()),
                _ => None,
            };

            // the sender only hears success once the forward went through
            if header.is_terminal() {
                if let Some(target) = &header.forward_to {
                    forward(&self.inner.options, target, &header, batch).await?;
                }
            }

            ctx.set_more_data_expected(header.keep_alive);
            match reply {
                Some(reply) => ctx.response.envelope(200, reply),
                None => ctx.response.header.set_status(200),
            }
            Ok(())
        })
    }
}

/// Splits `tcp://host:port/path` into a socket address and a route path.
pub(crate) fn parse_target(target: &str) -> AppResult<(String, String)> {
    let url = Url::parse(target)
        .map_err(|e| AppError::InvalidValue(format!("forward target {:?}: {}", target, e)))?;
    let host = url
        .host_str()
        .ok_or_else(|| AppError::InvalidValue(format!("forward target {:?} has no host", target)))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| AppError::InvalidValue(format!("forward target {:?} has no port", target)))?;
    let addr = if host.contains(':') {
        format!("[{}]:{}", host.trim_matches(|c| c == '[' || c == ']'), port)
    } else {
        format!("{}:{}", host, port)
    };
    let mut path = url.path().to_string();
    if path.is_empty() {
        path.push('/');
    }
    if let Some(query) = url.query() {
        path.push('?');
        path.push_str(query);
    }
    Ok((addr, path))
}

/// Resends the terminal batch as a single-batch session of its own.
async fn forward(
    options: &TransferOptions,
    target: &str,
    header: &BatchHeader,
    mut batch: Envelope,
) -> AppResult<()> {
    let (addr, path) = parse_target(target)?;
    batch.remove_property(keys::FORWARD_TO);
    debug!("forwarding session {} to {}{}", header.id, addr, path);

    let mut client = TransferClient::connect(&addr, options.clone()).await?;
    let mut session = client
        .session(&path, header.op_type)
        .with_id(header.id.clone());
    session.send_batch(batch, false).await?;
    client.close().await
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("tcp://127.0.0.1:9000/sink", "127.0.0.1:9000", "/sink")]
    #[case("tcp://127.0.0.1:9000", "127.0.0.1:9000", "/")]
    #[case("http://vec.example/a/b?x=1", "vec.example:80", "/a/b?x=1")]
    #[case("tcp://[::1]:7000/v6", "[::1]:7000", "/v6")]
    fn forward_targets(#[case] target: &str, #[case] addr: &str, #[case] path: &str) {
        assert_eq!(
            parse_target(target).unwrap(),
            (addr.to_string(), path.to_string())
        );
    }

    #[test]
    fn target_without_port_is_rejected() {
        assert!(parse_target("tcp://127.0.0.1/sink").is_err());
        assert!(parse_target("not a url").is_err());
    }
}
