//! Periodic copy of one block from a source endpoint to a destination.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::client::{ClientError, ResilientClient};
use crate::config::{BridgeBlock, RegisterKind};

/// Errors from a single iteration. They are logged, never propagated.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Read from '{endpoint}' failed: {source}")]
    Read {
        endpoint: String,
        #[source]
        source: ClientError,
    },

    #[error("Write to '{endpoint}' failed: {source}")]
    Write {
        endpoint: String,
        #[source]
        source: ClientError,
    },

    #[error("Cannot bridge {src} to {dst}")]
    Mapping { src: RegisterKind, dst: RegisterKind },
}

/// Worker lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Created,
    Running,
    Stopped,
}

/// Snapshot of a worker's progress.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStats {
    pub block: String,
    pub state: WorkerState,
    pub iterations: u64,
    pub failures: u64,
    pub consecutive_failures: u64,
    /// Unix timestamp (ms) of the last successful iteration
    pub last_success_ms: Option<i64>,
    pub last_error: Option<String>,
}

impl WorkerStats {
    fn new(block: String) -> Self {
        Self {
            block,
            state: WorkerState::Created,
            iterations: 0,
            failures: 0,
            consecutive_failures: 0,
            last_success_ms: None,
            last_error: None,
        }
    }
}

type SharedStats = Arc<Mutex<WorkerStats>>;

fn lock(stats: &SharedStats) -> MutexGuard<'_, WorkerStats> {
    stats.lock().unwrap_or_else(PoisonError::into_inner)
}

enum Payload {
    Bits(Vec<bool>),
    Words(Vec<u16>),
}

/// Copies one [`BridgeBlock`] on a fixed interval.
///
/// The worker borrows its clients; closing them is the supervisor's job.
pub struct BridgeWorker {
    block: BridgeBlock,
    label: String,
    src: Arc<ResilientClient>,
    dst: Arc<ResilientClient>,
    interval: Duration,
    stats: SharedStats,
}

impl BridgeWorker {
    pub fn new(
        block: BridgeBlock,
        src: Arc<ResilientClient>,
        dst: Arc<ResilientClient>,
        interval: Duration,
    ) -> Self {
        let label = block.label();
        Self {
            stats: Arc::new(Mutex::new(WorkerStats::new(label.clone()))),
            block,
            label,
            src,
            dst,
            interval,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn stats(&self) -> WorkerStats {
        lock(&self.stats).clone()
    }

    /// Run one iteration: read from the source, write to the destination.
    pub async fn iterate(&self) -> Result<(), WorkerError> {
        let payload = self.read_source().await?;
        self.write_destination(payload).await
    }

    async fn read_source(&self) -> Result<Payload, WorkerError> {
        let b = &self.block;
        let src = &self.src;
        let result = match b.src_register {
            RegisterKind::Coils => src
                .read_coils(b.src_offset, b.length, None)
                .await
                .map(Payload::Bits),
            RegisterKind::DiscreteInputs => src
                .read_discrete_inputs(b.src_offset, b.length, None)
                .await
                .map(Payload::Bits),
            RegisterKind::HoldingRegisters => src
                .read_holding_registers(b.src_offset, b.length, None)
                .await
                .map(Payload::Words),
            RegisterKind::InputRegisters => src
                .read_input_registers(b.src_offset, b.length, None)
                .await
                .map(Payload::Words),
        };
        result.map_err(|source| WorkerError::Read {
            endpoint: src.name().to_string(),
            source,
        })
    }

    async fn write_destination(&self, payload: Payload) -> Result<(), WorkerError> {
        let b = &self.block;
        let dst = &self.dst;
        let result = match (b.dst_register, payload) {
            (RegisterKind::Coils, Payload::Bits(bits)) => {
                dst.write_coils(b.dst_offset, &bits, None).await
            }
            (RegisterKind::HoldingRegisters, Payload::Words(words)) => {
                dst.write_registers(b.dst_offset, &words, None).await
            }
            _ => {
                return Err(WorkerError::Mapping {
                    src: b.src_register,
                    dst: b.dst_register,
                });
            }
        };
        result.map_err(|source| WorkerError::Write {
            endpoint: dst.name().to_string(),
            source,
        })
    }

    fn record(&self, result: &Result<(), WorkerError>) {
        let mut stats = lock(&self.stats);
        stats.iterations += 1;
        match result {
            Ok(()) => {
                stats.consecutive_failures = 0;
                stats.last_success_ms = Some(chrono::Utc::now().timestamp_millis());
                debug!(block = %self.label, "Block copied");
            }
            Err(e) => {
                stats.failures += 1;
                stats.consecutive_failures += 1;
                stats.last_error = Some(e.to_string());
                warn!(
                    block = %self.label,
                    consecutive = stats.consecutive_failures,
                    error = %e,
                    "Bridge iteration failed"
                );
            }
        }
    }

    fn set_state(&self, state: WorkerState) {
        lock(&self.stats).state = state;
    }

    /// Start the worker on the current runtime.
    pub fn spawn(self) -> WorkerHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let label = self.label.clone();
        let stats = self.stats.clone();
        self.set_state(WorkerState::Running);
        let task = tokio::spawn(self.run(stop_rx));
        WorkerHandle {
            label,
            stop: stop_tx,
            task,
            stats,
        }
    }

    async fn run(self, mut stop: watch::Receiver<bool>) {
        info!(block = %self.label, interval_ms = self.interval.as_millis() as u64, "Bridge worker started");

        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                // A dropped handle counts as a stop request.
                _ = stop.changed() => break,
                _ = ticker.tick() => {}
            }

            // In-flight I/O always completes; the write is skipped once
            // a stop has been requested.
            let result = match self.read_source().await {
                Ok(payload) => {
                    let stopping = *stop.borrow();
                    if stopping {
                        break;
                    }
                    self.write_destination(payload).await
                }
                Err(e) => Err(e),
            };
            self.record(&result);
        }

        self.set_state(WorkerState::Stopped);
        info!(block = %self.label, "Bridge worker stopped");
    }
}

/// Handle to a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    label: String,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
    stats: SharedStats,
}

impl WorkerHandle {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn stats(&self) -> WorkerStats {
        lock(&self.stats).clone()
    }

    /// Ask the worker to stop without waiting for it.
    pub fn signal_stop(&self) {
        // Err only means the task already exited.
        let _ = self.stop.send(true);
    }

    /// Signal the worker and wait for it to exit.
    pub async fn stop(self) {
        self.signal_stop();
        if let Err(e) = self.task.await {
            warn!(block = %self.label, error = %e, "Bridge worker task failed");
            lock(&self.stats).state = WorkerState::Stopped;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EndpointConfig;
    use crate::mock::{MockConnector, WriteRecord};

    async fn clients(connector: &Arc<MockConnector>) -> (Arc<ResilientClient>, Arc<ResilientClient>) {
        let a = ResilientClient::connect(
            EndpointConfig::new("A", "tcp://10.0.0.1:502"),
            connector.clone(),
        )
        .await
        .unwrap();
        let b = ResilientClient::connect(
            EndpointConfig::new("B", "tcp://10.0.0.2:502"),
            connector.clone(),
        )
        .await
        .unwrap();
        (Arc::new(a), Arc::new(b))
    }

    fn block(src: RegisterKind, dst: RegisterKind, length: u16) -> BridgeBlock {
        BridgeBlock {
            name: None,
            src: "A".to_string(),
            src_offset: 0,
            src_register: src,
            dst: "B".to_string(),
            dst_offset: 10,
            dst_register: dst,
            length,
        }
    }

    async fn wait_for_writes(device: &crate::mock::MockDevice) {
        for _ in 0..200 {
            if !device.writes().is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("no write observed");
    }

    #[tokio::test]
    async fn test_holding_registers_copied_to_offset() {
        let connector = Arc::new(MockConnector::new());
        connector.device("A").set_holding_registers(0, &[1, 2, 3, 4]);
        let (a, b) = clients(&connector).await;

        let worker = BridgeWorker::new(
            block(RegisterKind::HoldingRegisters, RegisterKind::HoldingRegisters, 4),
            a,
            b,
            Duration::from_millis(10),
        );
        let handle = worker.spawn();
        let dst = connector.device("B");
        wait_for_writes(&dst).await;
        handle.stop().await;

        assert_eq!(
            dst.writes()[0],
            WriteRecord::Registers {
                address: 10,
                values: vec![1, 2, 3, 4]
            }
        );
        assert_eq!(dst.holding_registers(10, 4), vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_discrete_inputs_copied_to_coils() {
        let connector = Arc::new(MockConnector::new());
        connector
            .device("A")
            .set_discrete_inputs(0, &[true, false, true]);
        let (a, b) = clients(&connector).await;

        let worker = BridgeWorker::new(
            block(RegisterKind::DiscreteInputs, RegisterKind::Coils, 3),
            a,
            b,
            Duration::from_secs(60),
        );
        worker.iterate().await.unwrap();
        assert_eq!(connector.device("B").coils(10, 3), vec![true, false, true]);
    }

    #[tokio::test]
    async fn test_read_failure_skips_write() {
        let connector = Arc::new(MockConnector::new());
        connector.device("A").fail_all(true);
        let (a, b) = clients(&connector).await;

        let worker = BridgeWorker::new(
            block(RegisterKind::InputRegisters, RegisterKind::HoldingRegisters, 2),
            a,
            b,
            Duration::from_secs(60),
        );
        let err = worker.iterate().await.unwrap_err();
        assert!(matches!(err, WorkerError::Read { .. }));
        assert!(connector.device("B").writes().is_empty());
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_the_worker() {
        let connector = Arc::new(MockConnector::new());
        let src = connector.device("A");
        src.set_holding_registers(0, &[9]);
        src.fail_all(true);
        let (a, b) = clients(&connector).await;

        let handle = BridgeWorker::new(
            block(RegisterKind::HoldingRegisters, RegisterKind::HoldingRegisters, 1),
            a,
            b,
            Duration::from_millis(5),
        )
        .spawn();

        for _ in 0..200 {
            if handle.stats().failures >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(handle.stats().failures >= 2);
        assert_eq!(handle.stats().state, WorkerState::Running);

        src.fail_all(false);
        wait_for_writes(&connector.device("B")).await;
        // Let the recording of the successful iteration land.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let stats = handle.stats();
        assert!(stats.last_success_ms.is_some());
        assert!(stats.last_error.is_some());

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_stop_during_read_skips_write() {
        let connector = Arc::new(MockConnector::new());
        let src = connector.device("A");
        src.set_holding_registers(0, &[1, 2]);
        src.set_latency(Duration::from_millis(100));
        let (a, b) = clients(&connector).await;

        let handle = BridgeWorker::new(
            block(RegisterKind::HoldingRegisters, RegisterKind::HoldingRegisters, 2),
            a,
            b,
            Duration::from_millis(10),
        )
        .spawn();
        let stats = handle.stats.clone();

        // First tick at 10ms, so the read is in flight by now
        tokio::time::sleep(Duration::from_millis(40)).await;
        handle.stop().await;

        assert_eq!(src.log().len(), 1);
        assert!(connector.device("B").writes().is_empty());
        let stats = lock(&stats).clone();
        assert_eq!(stats.iterations, 0);
        assert_eq!(stats.state, WorkerState::Stopped);
    }

    #[tokio::test]
    async fn test_first_tick_waits_one_interval() {
        let connector = Arc::new(MockConnector::new());
        let (a, b) = clients(&connector).await;

        let worker = BridgeWorker::new(
            block(RegisterKind::Coils, RegisterKind::Coils, 1),
            a,
            b,
            Duration::from_secs(3600),
        );
        assert_eq!(worker.stats().state, WorkerState::Created);

        let handle = worker.spawn();
        let stats = handle.stats.clone();
        handle.stop().await;

        let stats = lock(&stats).clone();
        assert_eq!(stats.iterations, 0);
        assert_eq!(stats.state, WorkerState::Stopped);
        assert!(connector.device("A").log().is_empty());
    }
}
