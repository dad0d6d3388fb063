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

use tokio::sync::{broadcast, mpsc};

/// Listens for the server-wide shutdown signal.
#[derive(Debug)]
pub struct Shutdown {
    is_shutdown: bool,
    notify: broadcast::Receiver<()>,
}

impl Shutdown {
    pub fn new(notify: broadcast::Receiver<()>) -> Shutdown {
        Shutdown {
            is_shutdown: false,
            notify,
        }
    }
    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown
    }

    /// Resolves once shutdown was signalled, immediately on every later call.
    pub async fn recv(&mut self) {
        if self.is_shutdown {
            return;
        }
        let _ = self.notify.recv().await;
        self.is_shutdown = true;
    }
}

/// Held by every task the server waits for on shutdown.
///
/// Tasks subscribe through it and keep it alive for as long as they run; the
/// notifier's drain completes once the last handle is dropped.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    notify: broadcast::Sender<()>,
    _complete_tx: mpsc::Sender<()>,
}

impl ShutdownHandle {
    pub fn subscribe(&self) -> Shutdown {
        Shutdown::new(self.notify.subscribe())
    }
}

/// Owning side of the shutdown signal.
#[derive(Debug)]
pub struct ShutdownNotifier {
    notify: broadcast::Sender<()>,
    complete_tx: mpsc::Sender<()>,
    complete_rx: mpsc::Receiver<()>,
}

impl Default for ShutdownNotifier {
    fn default() -> Self {
        ShutdownNotifier::new()
    }
}

impl ShutdownNotifier {
    pub fn new() -> Self {
        let (notify, _) = broadcast::channel(1);
        let (complete_tx, complete_rx) = mpsc::channel(1);
        ShutdownNotifier {
            notify,
            complete_tx,
            complete_rx,
        }
    }

    pub fn handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            notify: self.notify.clone(),
            _complete_tx: self.complete_tx.clone(),
        }
    }

    /// Signals every current subscriber; returns how many were listening.
    pub fn notify(&self) -> usize {
        self.notify.send(()).unwrap_or(0)
    }

    /// Waits until every [`ShutdownHandle`] is gone.
    pub async fn drained(self) {
        let ShutdownNotifier {
            notify,
            complete_tx,
            mut complete_rx,
        } = self;
        drop(complete_tx);
        // recv yields None once all senders are dropped
        let _ = complete_rx.recv().await;
        drop(notify);
    }
}
