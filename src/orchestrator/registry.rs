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

//! The live-run registry.
//!
//! Exclusively owns the in-process state of every live run: the workload
//! handle, the bounded log/metric fan-out queues, and admission accounting
//! against the global concurrency cap. One mutex guards all mutations;
//! queues are `tokio::sync::broadcast` channels whose lagging subscribers
//! drop the oldest entries.
//!
//! Entries exist from admission (pre-heat may still be running, so the
//! handle can be absent) until finalisation removes them; SSE consumers that
//! subscribe after removal read the persisted files instead.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::executor::WorkloadHandle;

/// In-process state of one live run.
struct LiveRun {
    pipeline_name: String,
    handle: Option<WorkloadHandle>,
    log_queue: broadcast::Sender<String>,
    metric_queue: broadcast::Sender<String>,
}

/// Why an admission was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionError {
    /// The global live-run cap is reached
    ConcurrencyLimit { limit: usize },
}

/// Registry of live runs.
pub struct RunRegistry {
    max_concurrent: usize,
    queue_capacity: usize,
    inner: Mutex<HashMap<Uuid, LiveRun>>,
}

impl RunRegistry {
    pub fn new(max_concurrent: usize, queue_capacity: usize) -> Self {
        Self {
            max_concurrent,
            queue_capacity: queue_capacity.max(1),
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Admits a run under the global cap, creating its fan-out queues.
    ///
    /// The count covers pending and running entries alike, so a burst of
    /// submissions cannot overshoot while workloads are still launching.
    pub fn admit(&self, run_id: Uuid, pipeline_name: &str) -> Result<(), AdmissionError> {
        let mut inner = self.inner.lock().expect("run registry poisoned");
        if inner.len() >= self.max_concurrent {
            return Err(AdmissionError::ConcurrencyLimit {
                limit: self.max_concurrent,
            });
        }
        let (log_queue, _) = broadcast::channel(self.queue_capacity);
        let (metric_queue, _) = broadcast::channel(self.queue_capacity);
        inner.insert(
            run_id,
            LiveRun {
                pipeline_name: pipeline_name.to_string(),
                handle: None,
                log_queue,
                metric_queue,
            },
        );
        Ok(())
    }

    /// Records the workload handle once the backend has launched it.
    pub fn set_handle(&self, run_id: Uuid, handle: WorkloadHandle) {
        let mut inner = self.inner.lock().expect("run registry poisoned");
        if let Some(run) = inner.get_mut(&run_id) {
            run.handle = Some(handle);
        }
    }

    pub fn handle(&self, run_id: Uuid) -> Option<WorkloadHandle> {
        let inner = self.inner.lock().expect("run registry poisoned");
        inner.get(&run_id).and_then(|run| run.handle.clone())
    }

    pub fn contains(&self, run_id: Uuid) -> bool {
        self.inner
            .lock()
            .expect("run registry poisoned")
            .contains_key(&run_id)
    }

    pub fn live_count(&self) -> usize {
        self.inner.lock().expect("run registry poisoned").len()
    }

    /// Removes a finalised run; subsequent queue lookups return None.
    pub fn remove(&self, run_id: Uuid) {
        let mut inner = self.inner.lock().expect("run registry poisoned");
        inner.remove(&run_id);
    }

    /// Sender half of the log queue (the lifecycle task pushes lines).
    pub fn log_sender(&self, run_id: Uuid) -> Option<broadcast::Sender<String>> {
        let inner = self.inner.lock().expect("run registry poisoned");
        inner.get(&run_id).map(|run| run.log_queue.clone())
    }

    pub fn metric_sender(&self, run_id: Uuid) -> Option<broadcast::Sender<String>> {
        let inner = self.inner.lock().expect("run registry poisoned");
        inner.get(&run_id).map(|run| run.metric_queue.clone())
    }

    /// SSE subscription to a live run's log lines.
    pub fn subscribe_logs(&self, run_id: Uuid) -> Option<broadcast::Receiver<String>> {
        let inner = self.inner.lock().expect("run registry poisoned");
        inner.get(&run_id).map(|run| run.log_queue.subscribe())
    }

    /// SSE subscription to a live run's metric samples (JSON lines).
    pub fn subscribe_metrics(&self, run_id: Uuid) -> Option<broadcast::Receiver<String>> {
        let inner = self.inner.lock().expect("run registry poisoned");
        inner.get(&run_id).map(|run| run.metric_queue.subscribe())
    }

    /// Snapshot of the live run ids with their pipelines.
    pub fn live_runs(&self) -> Vec<(Uuid, String)> {
        let inner = self.inner.lock().expect("run registry poisoned");
        inner
            .iter()
            .map(|(id, run)| (*id, run.pipeline_name.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(run_id: Uuid) -> WorkloadHandle {
        WorkloadHandle {
            run_id,
            id: "c0ffee".to_string(),
        }
    }

    #[test]
    fn test_admission_enforces_cap() {
        let registry = RunRegistry::new(2, 8);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();

        registry.admit(a, "p").unwrap();
        registry.admit(b, "p").unwrap();
        assert_eq!(
            registry.admit(c, "p"),
            Err(AdmissionError::ConcurrencyLimit { limit: 2 })
        );

        // A slot frees when a run finalises
        registry.remove(a);
        registry.admit(c, "p").unwrap();
        assert_eq!(registry.live_count(), 2);
    }

    #[test]
    fn test_handle_round_trip() {
        let registry = RunRegistry::new(4, 8);
        let id = Uuid::new_v4();
        registry.admit(id, "p").unwrap();
        assert!(registry.handle(id).is_none());

        registry.set_handle(id, handle(id));
        assert_eq!(registry.handle(id).unwrap().id, "c0ffee");

        registry.remove(id);
        assert!(registry.handle(id).is_none());
        assert!(!registry.contains(id));
    }

    #[tokio::test]
    async fn test_queue_fan_out() {
        let registry = RunRegistry::new(4, 8);
        let id = Uuid::new_v4();
        registry.admit(id, "p").unwrap();

        let mut subscriber = registry.subscribe_logs(id).unwrap();
        registry.log_sender(id).unwrap().send("line".to_string()).unwrap();
        assert_eq!(subscriber.recv().await.unwrap(), "line");

        // Queues vanish with the run
        registry.remove(id);
        assert!(registry.subscribe_logs(id).is_none());
    }

    #[tokio::test]
    async fn test_queue_drops_oldest_on_overflow() {
        let registry = RunRegistry::new(4, 2);
        let id = Uuid::new_v4();
        registry.admit(id, "p").unwrap();

        let mut subscriber = registry.subscribe_logs(id).unwrap();
        let sender = registry.log_sender(id).unwrap();
        for i in 0..5 {
            sender.send(format!("line-{}", i)).unwrap();
        }

        // The lagged subscriber resumes at the oldest retained entry
        assert!(matches!(
            subscriber.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
        assert_eq!(subscriber.recv().await.unwrap(), "line-3");
        assert_eq!(subscriber.recv().await.unwrap(), "line-4");
    }
}
