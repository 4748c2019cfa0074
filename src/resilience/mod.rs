/*
 *  Copyright 2025 Colliery Software
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! Resilience primitives: circuit breakers and bounded retries around the
//! external dependencies this crate calls directly — the container runtime
//! (or cluster API) and the object-storage log backup. Out-of-scope
//! collaborators (the git synchroniser, OAuth flows) build their own
//! breakers from [`CircuitBreaker::new`].

pub mod backoff;
pub mod circuit_breaker;

pub use backoff::{retry_with_backoff, BackoffPolicy};
pub use circuit_breaker::{BreakerState, CircuitBreaker, CircuitBreakerError};

use std::sync::Arc;

/// The orchestrator's named breakers.
///
/// One instance is created at startup and shared; avoid a global.
#[derive(Debug, Clone)]
pub struct Breakers {
    pub container_runtime: Arc<CircuitBreaker>,
    pub object_storage: Arc<CircuitBreaker>,
}

impl Default for Breakers {
    fn default() -> Self {
        Self {
            container_runtime: Arc::new(CircuitBreaker::container_runtime()),
            object_storage: Arc::new(CircuitBreaker::object_storage()),
        }
    }
}

impl Breakers {
    /// Resets all breakers; called during graceful shutdown.
    pub fn reset_all(&self) {
        self.container_runtime.reset();
        self.object_storage.reset();
    }
}
