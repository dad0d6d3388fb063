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

use crate::envelope::Envelope;
use crate::transfer::BatchHeader;
use crate::AppResult;

/// Consumes the batches of the sessions routed to it.
///
/// The handler may edit the batch in place; the edited batch is what gets
/// forwarded or echoed back. Returning an envelope replaces the echo.
pub trait BatchHandler: Send + Sync {
    fn handle<'a>(
        &'a self,
        batch: &'a mut Envelope,
        header: &'a BatchHeader,
    ) -> Pin<Box<dyn Future<Output = AppResult<Option<Envelope>>> + Send + 'a>>;
}

pub struct SyncBatchHandler<F> {
    f: F,
}

impl<F> SyncBatchHandler<F>
where
    F: Fn(&mut Envelope, &BatchHeader) -> AppResult<Option<Envelope>> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        SyncBatchHandler { f }
    }
}

impl<F> BatchHandler for SyncBatchHandler<F>
where
    F: Fn(&mut Envelope, &BatchHeader) -> AppResult<Option<Envelope>> + Send + Sync,
{
    fn handle<'a>(
        &'a self,
        batch: &'a mut Envelope,
        header: &'a BatchHeader,
    ) -> Pin<Box<dyn Future<Output = AppResult<Option<Envelope>>> + Send + 'a>> {
        let result = (self.f)(batch, header);
        Box::pin(async move { result })
    }
}
