// SPDX-License-Identifier: MIT OR Apache-2.0

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::UserId;

const FALLBACK_DEBOUNCE: Duration = Duration::from_millis(50);

/// Configuration of a privilege service.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// User on whose behalf privileges are reconciled. Only entities they administer or created
    /// are touched.
    pub(crate) current_user: UserId,

    /// How long the fallback accumulator collects updates made outside of any transaction before
    /// flushing them.
    ///
    /// Default: 50 milliseconds.
    pub(crate) debounce: Duration,

    /// Hand updates which could not be flushed inside their transaction over to the fallback
    /// accumulator instead of dropping them.
    ///
    /// Default: true.
    pub(crate) requeue_failed_flushes: bool,
}

impl Config {
    pub fn new(current_user: UserId) -> Self {
        Self {
            current_user,
            debounce: FALLBACK_DEBOUNCE,
            requeue_failed_flushes: true,
        }
    }

    pub fn debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn requeue_failed_flushes(mut self, requeue: bool) -> Self {
        self.requeue_failed_flushes = requeue;
        self
    }

    pub fn current_user(&self) -> &UserId {
        &self.current_user
    }
}
