//! Ownership of endpoint clients and bridge workers.
//!
//! The supervisor is the only owner of client lifetimes. Each
//! reconfiguration builds a fresh [`ClientRegistry`]; if any endpoint
//! fails, the ones that did open are closed again and every failure is
//! reported together.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::client::ResilientClient;
use crate::config::{BridgeSettings, EndpointConfig};
use crate::transport::Connector;
use crate::worker::{BridgeWorker, WorkerHandle, WorkerStats};

/// One endpoint that could not be built or closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointFailure {
    pub endpoint: String,
    pub error: String,
}

impl fmt::Display for EndpointFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.endpoint, self.error)
    }
}

pub(crate) fn join_failures(failures: &[EndpointFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Supervisor errors.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Failed to build {} endpoint(s): {}", .0.len(), join_failures(.0))]
    Build(Vec<EndpointFailure>),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Named clients owned by one supervisor.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: BTreeMap<String, Arc<ResilientClient>>,
}

impl ClientRegistry {
    /// Open every endpoint, or none.
    pub async fn build(
        endpoints: &[EndpointConfig],
        connector: Arc<dyn Connector>,
    ) -> Result<Self, SupervisorError> {
        let mut names = HashSet::new();
        for endpoint in endpoints {
            if !names.insert(endpoint.name.as_str()) {
                return Err(SupervisorError::Config(format!(
                    "Duplicate endpoint name '{}'",
                    endpoint.name
                )));
            }
        }

        let mut registry = Self::default();
        let mut failures = Vec::new();

        for endpoint in endpoints {
            if let Err(e) = endpoint.validate() {
                failures.push(EndpointFailure {
                    endpoint: endpoint.name.clone(),
                    error: e.to_string(),
                });
                continue;
            }

            match ResilientClient::connect(endpoint.clone(), connector.clone()).await {
                Ok(client) => {
                    registry
                        .clients
                        .insert(endpoint.name.clone(), Arc::new(client));
                }
                Err(e) => {
                    warn!(endpoint = %endpoint.name, error = %e, "Failed to build endpoint");
                    failures.push(EndpointFailure {
                        endpoint: endpoint.name.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        if failures.is_empty() {
            return Ok(registry);
        }

        let opened = registry.len();
        for failure in registry.close_all().await {
            warn!(endpoint = %failure.endpoint, error = %failure.error, "Rollback close failed");
        }
        warn!(
            failed = failures.len(),
            rolled_back = opened,
            "Endpoint build failed, rolled back"
        );
        Err(SupervisorError::Build(failures))
    }

    pub fn get(&self, name: &str) -> Option<Arc<ResilientClient>> {
        self.clients.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.clients.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Close and drop every client, returning the close failures.
    pub async fn close_all(&mut self) -> Vec<EndpointFailure> {
        let mut failures = Vec::new();
        for (name, client) in std::mem::take(&mut self.clients) {
            if let Err(e) = client.close().await {
                failures.push(EndpointFailure {
                    endpoint: name,
                    error: e.to_string(),
                });
            }
        }
        failures
    }
}

/// Serializable view of a supervisor.
#[derive(Debug, Clone, Serialize)]
pub struct BridgeReadings {
    pub active_endpoints: usize,
    pub blocks: Vec<WorkerStats>,
}

/// Owns the clients and workers of one bridge configuration.
pub struct BridgeSupervisor {
    connector: Arc<dyn Connector>,
    registry: ClientRegistry,
    workers: Vec<WorkerHandle>,
}

impl BridgeSupervisor {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            registry: ClientRegistry::default(),
            workers: Vec::new(),
        }
    }

    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Replace the running configuration.
    ///
    /// The previous workers and clients are shut down first. On error
    /// nothing from the new configuration stays open.
    pub async fn reconfigure(&mut self, settings: &BridgeSettings) -> Result<(), SupervisorError> {
        self.shutdown().await;

        if settings.update_time_ms == 0 {
            return Err(SupervisorError::Config(
                "update_time_ms must be greater than 0".to_string(),
            ));
        }

        let mut registry =
            ClientRegistry::build(&settings.endpoints, self.connector.clone()).await?;

        let mut workers = Vec::with_capacity(settings.blocks.len());
        for block in &settings.blocks {
            let resolved = block
                .validate()
                .map_err(|e| e.to_string())
                .and_then(|()| {
                    let src = registry.get(&block.src).ok_or_else(|| {
                        format!("Block '{}': unknown endpoint '{}'", block.label(), block.src)
                    })?;
                    let dst = registry.get(&block.dst).ok_or_else(|| {
                        format!("Block '{}': unknown endpoint '{}'", block.label(), block.dst)
                    })?;
                    Ok((src, dst))
                });

            match resolved {
                Ok((src, dst)) => workers.push(BridgeWorker::new(
                    block.clone(),
                    src,
                    dst,
                    settings.update_interval(),
                )),
                Err(msg) => {
                    for failure in registry.close_all().await {
                        warn!(endpoint = %failure.endpoint, error = %failure.error, "Rollback close failed");
                    }
                    return Err(SupervisorError::Config(msg));
                }
            }
        }

        self.workers = workers.into_iter().map(BridgeWorker::spawn).collect();
        self.registry = registry;

        info!(
            endpoints = self.registry.len(),
            blocks = self.workers.len(),
            "Bridge configured"
        );
        Ok(())
    }

    /// Stop every worker, then close every client.
    ///
    /// Close failures are logged and returned but never abort shutdown.
    pub async fn shutdown(&mut self) -> Vec<EndpointFailure> {
        let workers = std::mem::take(&mut self.workers);
        for worker in &workers {
            worker.signal_stop();
        }
        for worker in workers {
            worker.stop().await;
        }

        let failures = self.registry.close_all().await;
        for failure in &failures {
            warn!(endpoint = %failure.endpoint, error = %failure.error, "Failed to close endpoint");
        }
        failures
    }

    /// Snapshot of the endpoint count and per-block worker stats.
    pub fn readings(&self) -> BridgeReadings {
        BridgeReadings {
            active_endpoints: self.registry.len(),
            blocks: self.workers.iter().map(WorkerHandle::stats).collect(),
        }
    }
}
