// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use thiserror::Error;

use crate::job_engine::task::Payload;

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("a refresh is already taking place")]
    Busy,
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/// Re-fetches the current state of a job descriptor right before it is used.
#[async_trait(?Send)]
pub trait DataSource {
    async fn refresh(&self, payload: Payload) -> Result<Payload, RefreshError>;
}

/// Hands the payload back untouched, for setups without a metadata repository.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThrough;

#[async_trait(?Send)]
impl DataSource for PassThrough {
    async fn refresh(&self, payload: Payload) -> Result<Payload, RefreshError> {
        Ok(payload)
    }
}

/// Lets one refresh run at a time; racing callers get [`RefreshError::Busy`]
/// instead of waiting.
#[derive(Debug, Default)]
pub struct SingleFlight<S> {
    inner: S,
    in_flight: AtomicBool,
}

struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<S> SingleFlight<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }
}

#[async_trait(?Send)]
impl<S: DataSource> DataSource for SingleFlight<S> {
    async fn refresh(&self, payload: Payload) -> Result<Payload, RefreshError> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(RefreshError::Busy);
        }
        // released on completion and when the caller drops the future
        let _guard = InFlight(&self.in_flight);
        self.inner.refresh(payload).await
    }
}
