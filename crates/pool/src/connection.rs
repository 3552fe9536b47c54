//! Seams between the pool and the RPC transport.
//!
//! The pool never speaks the wire protocol itself. It only needs to observe
//! a connection's state, wait for that state to move, close it, and dial
//! new ones.

use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::PoolError;
use crate::state::ConnectivityState;
use crate::transport::TransportOptions;

/// An established client connection owned by a pool slot.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Current connectivity state.
    fn state(&self) -> ConnectivityState;

    /// Resolve with the new state once it differs from `from`.
    ///
    /// Returns immediately if the state already differs. Callers bound the
    /// wait with their own deadline.
    async fn wait_for_state_change(&self, from: ConnectivityState) -> ConnectivityState;

    /// Close the connection. Closing twice must be harmless.
    async fn close(&self) -> Result<(), PoolError>;
}

/// Dials connections to a target.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Conn: Connection;

    async fn connect(
        &self,
        target: &str,
        options: &TransportOptions,
    ) -> Result<Arc<Self::Conn>, PoolError>;
}
