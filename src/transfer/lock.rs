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

use std::sync::Arc;

use dashmap::DashSet;
use tracing::trace;

use crate::{AppError, AppResult};

/// Non-blocking mutual exclusion keyed by name.
///
/// A second acquisition of a held name fails immediately instead of waiting.
#[derive(Debug, Default, Clone)]
pub struct NamedLocks {
    held: Arc<DashSet<String>>,
}

/// Releases its name when dropped, whether the holder succeeded or failed.
#[derive(Debug)]
pub struct NamedLockGuard {
    held: Arc<DashSet<String>>,
    name: String,
}

impl NamedLocks {
    pub fn new() -> Self {
        NamedLocks::default()
    }

    pub fn try_acquire(&self, name: &str) -> AppResult<NamedLockGuard> {
        if !self.held.insert(name.to_string()) {
            return Err(AppError::InvalidOperation(format!(
                "cannot acquire lock {}",
                name
            )));
        }
        trace!("lock {} acquired", name);
        Ok(NamedLockGuard {
            held: self.held.clone(),
            name: name.to_string(),
        })
    }

    pub fn is_held(&self, name: &str) -> bool {
        self.held.contains(name)
    }
}

impl NamedLockGuard {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for NamedLockGuard {
    fn drop(&mut self) {
        self.held.remove(&self.name);
        trace!("lock {} released", self.name);
    }
}
