//! Registry of named connection pools.
//!
//! One [`Manager`] maps logical downstream service names such as
//! `"order-service"` to their [`ConnectionPool`]. It is an ordinary value:
//! create it at startup, share it by reference or `Arc`, close it on
//! shutdown.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use rpcpool_config::DownstreamConfig;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::connection::Connector;
use crate::errors::PoolError;
use crate::grpc::GrpcConnector;
use crate::pool::{ConnectionPool, PoolConfig, PoolStats};
use crate::scheduler::{IntervalScheduler, Scheduler};

/// Concurrency-safe map from service name to pool.
pub struct Manager<K: Connector = GrpcConnector> {
    pools: RwLock<HashMap<String, Arc<ConnectionPool<K>>>>,
    connector: Arc<K>,
    scheduler: Arc<dyn Scheduler>,
}

impl Manager<GrpcConnector> {
    /// Empty manager dialing gRPC connections.
    pub fn new() -> Self {
        Self::with_connector(Arc::new(GrpcConnector), Arc::new(IntervalScheduler))
    }
}

impl Default for Manager<GrpcConnector> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Connector> Manager<K> {
    /// Empty manager whose pools share `connector` and `scheduler`.
    pub fn with_connector(connector: Arc<K>, scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
            connector,
            scheduler,
        }
    }

    /// Pool registered under `service`, building it from `config` on first
    /// use.
    ///
    /// Concurrent first calls for the same name construct exactly one pool
    /// and all receive it.
    pub async fn get_or_create(
        &self,
        service: &str,
        config: PoolConfig,
    ) -> Result<Arc<ConnectionPool<K>>, PoolError> {
        if let Some(pool) = self.pools.read().await.get(service) {
            return Ok(Arc::clone(pool));
        }

        let mut pools = self.pools.write().await;
        if let Some(pool) = pools.get(service) {
            return Ok(Arc::clone(pool));
        }

        info!(service = %service, target = %config.target, "Creating pool for service");
        let pool = ConnectionPool::with_connector(
            config,
            Arc::clone(&self.connector),
            self.scheduler.as_ref(),
        )
        .await
        .map_err(|e| e.for_service(service))?;

        let pool = Arc::new(pool);
        pools.insert(service.to_string(), Arc::clone(&pool));
        Ok(pool)
    }

    /// Lookup only; never constructs.
    pub async fn get(&self, service: &str) -> Option<Arc<ConnectionPool<K>>> {
        self.pools.read().await.get(service).cloned()
    }

    /// Create a pool for every service with a non-empty target.
    ///
    /// Stops at the first construction failure. Pools created before it
    /// stay registered.
    pub async fn create_common_pools(
        &self,
        services: &BTreeMap<String, String>,
        pool_size: usize,
    ) -> Result<(), PoolError> {
        for (service, target) in services {
            if target.trim().is_empty() {
                debug!(service = %service, "No target configured, skipping");
                continue;
            }
            self.get_or_create(service, PoolConfig::new(target.as_str()).with_pool_size(pool_size))
                .await?;
        }
        Ok(())
    }

    /// Like [`create_common_pools`](Self::create_common_pools) with every
    /// pool default taken from `config`. Returns the number of configured
    /// services.
    pub async fn provision(&self, config: &DownstreamConfig) -> Result<usize, PoolError> {
        let mut provisioned = 0;
        for (service, target) in config.configured_services() {
            self.get_or_create(service, PoolConfig::from_defaults(target, &config.pool))
                .await?;
            provisioned += 1;
        }
        info!(services = provisioned, "Downstream pools provisioned");
        Ok(provisioned)
    }

    /// Stats for every registered pool, keyed by service name.
    pub async fn get_all_stats(&self) -> BTreeMap<String, PoolStats> {
        self.pools
            .read()
            .await
            .iter()
            .map(|(service, pool)| (service.clone(), pool.get_stats()))
            .collect()
    }

    /// Registered service names, sorted.
    pub async fn list(&self) -> Vec<String> {
        let mut services: Vec<String> = self.pools.read().await.keys().cloned().collect();
        services.sort();
        services
    }

    /// Close every pool and empty the registry.
    ///
    /// Every pool is attempted even if an earlier one fails.
    pub async fn close(&self) -> Result<(), PoolError> {
        let drained: Vec<(String, Arc<ConnectionPool<K>>)> =
            self.pools.write().await.drain().collect();

        info!(pools = drained.len(), "Closing all connection pools");

        let mut failures = Vec::new();
        for (service, pool) in drained {
            if let Err(e) = pool.close().await {
                warn!(service = %service, error = %e, "Failed to close pool");
                failures.push(format!("{}: {}", service, e));
            }
        }
        failures.sort();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(PoolError::CloseFailed {
                scope: "manager".to_string(),
                failures,
            })
        }
    }
}

impl<K: Connector> std::fmt::Debug for Manager<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager").finish_non_exhaustive()
    }
}
