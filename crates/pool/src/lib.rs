//! Self-healing pools of long-lived RPC client connections.
//!
//! A [`ConnectionPool`] keeps a fixed number of connections to one target,
//! hands them out round-robin (or health-filtered), and repairs broken or
//! aged connections in the background. A [`Manager`] registers one pool per
//! logical downstream service.
//!
//! ```ignore
//! use rpcpool::{Manager, PoolConfig};
//!
//! let manager = Manager::new();
//! let pool = manager
//!     .get_or_create("order-service", PoolConfig::new("orders.internal:9000"))
//!     .await?;
//!
//! let conn = pool.get()?;
//! let mut client = OrderServiceClient::new(conn.channel()?);
//! let result = client.get_order(request).await;
//! conn.observe(&result);
//! ```
//!
//! # Module Organization
//!
//! - [`pool`]: the per-target pool, its configuration and statistics
//! - [`manager`]: the service name registry
//! - [`connection`]: connection and connector traits
//! - [`grpc`]: tonic implementation of those traits
//! - [`scheduler`]: repair pass triggers
//! - [`state`]: connectivity states
//! - [`transport`]: transport options
//! - [`errors`]: error type

pub mod connection;
pub mod errors;
pub mod grpc;
pub mod manager;
pub mod pool;
pub mod scheduler;
pub mod state;
pub mod transport;

#[cfg(test)]
mod mock;

// ============================================================================
// Re-exports
// ============================================================================

pub use connection::{Connection, Connector};
pub use errors::PoolError;
pub use grpc::{GrpcConnection, GrpcConnector};
pub use manager::Manager;
pub use pool::{
    ConnectionPool, ConnectionStat, PoolConfig, PoolStats, RepairReport, DEFAULT_POOL_SIZE,
    DEFAULT_REPAIR_INTERVAL,
};
pub use scheduler::{IntervalScheduler, ManualScheduler, Scheduler, TickHandle, Ticker};
pub use state::ConnectivityState;
pub use transport::{ExtraOption, TransportOptions};

pub use rpcpool_config::{DownstreamConfig, PoolDefaults};

pub use tokio_util::sync::CancellationToken;
