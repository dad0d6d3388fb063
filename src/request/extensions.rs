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

use std::any::{type_name, Any, TypeId};
use std::collections::{HashMap, HashSet};

use crate::{AppError, AppResult};

/// Typed per-request storage, at most one value per type.
///
/// A locked type can still be read but no longer replaced, removed or
/// borrowed mutably.
#[derive(Debug, Default)]
pub struct Extensions {
    values: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
    locked: HashSet<TypeId>,
}

impl Extensions {
    pub fn new() -> Self {
        Extensions::default()
    }

    fn check_unlocked<T: 'static>(&self) -> AppResult<()> {
        if self.locked.contains(&TypeId::of::<T>()) {
            return Err(AppError::IllegalStateError(format!(
                "extension {} is locked",
                type_name::<T>()
            )));
        }
        Ok(())
    }

    /// Stores `value`, returning the value of the same type it replaced.
    pub fn insert<T: Send + Sync + 'static>(&mut self, value: T) -> AppResult<Option<T>> {
        self.check_unlocked::<T>()?;
        Ok(self
            .values
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|old| old.downcast::<T>().ok())
            .map(|old| *old))
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.values
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
    }

    pub fn get_mut<T: Send + Sync + 'static>(&mut self) -> AppResult<Option<&mut T>> {
        self.check_unlocked::<T>()?;
        Ok(self
            .values
            .get_mut(&TypeId::of::<T>())
            .and_then(|value| value.downcast_mut::<T>()))
    }

    pub fn remove<T: Send + Sync + 'static>(&mut self) -> AppResult<Option<T>> {
        self.check_unlocked::<T>()?;
        Ok(self
            .values
            .remove(&TypeId::of::<T>())
            .and_then(|old| old.downcast::<T>().ok())
            .map(|old| *old))
    }

    pub fn contains<T: Send + Sync + 'static>(&self) -> bool {
        self.values.contains_key(&TypeId::of::<T>())
    }

    /// Freezes the entry for `T`, present or not, for the rest of the request.
    pub fn lock<T: Send + Sync + 'static>(&mut self) {
        self.locked.insert(TypeId::of::<T>());
    }

    pub fn is_locked<T: Send + Sync + 'static>(&self) -> bool {
        self.locked.contains(&TypeId::of::<T>())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
