//! gRPC connections over tonic.
//!
//! Tonic channels do not expose their connectivity, so a [`GrpcConnection`]
//! tracks it alongside the channel: ready after the eager dial, idle once
//! unused for longer than `max_idle`, transient failure when a caller
//! reports an unavailable status, shutdown after close. Closing drops the
//! connection's channel; the socket goes once callers release their clones.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Status};
use tracing::{debug, trace};

use crate::connection::{Connection, Connector};
use crate::errors::PoolError;
use crate::state::ConnectivityState;
use crate::transport::{ExtraOption, TransportOptions};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// A tonic channel plus the state the pool observes.
pub struct GrpcConnection {
    id: u64,
    target: String,
    channel: Mutex<Option<Channel>>,
    state: watch::Sender<ConnectivityState>,
    last_used: Mutex<Instant>,
    max_idle: Duration,
}

impl GrpcConnection {
    pub(crate) fn from_channel(target: impl Into<String>, channel: Channel, max_idle: Duration) -> Self {
        let (state, _) = watch::channel(ConnectivityState::Ready);
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            target: target.into(),
            channel: Mutex::new(Some(channel)),
            state,
            last_used: Mutex::new(Instant::now()),
            max_idle,
        }
    }

    /// Process-unique identifier, handy for log correlation.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Channel to build a typed client on. Counts as use of the connection.
    ///
    /// Fails once the connection is closed.
    pub fn channel(&self) -> Result<Channel, PoolError> {
        let channel = self
            .channel
            .lock()
            .clone()
            .ok_or_else(|| PoolError::ConnectionClosed {
                target: self.target.clone(),
            })?;

        let was_idle = self.state() == ConnectivityState::Idle;
        *self.last_used.lock() = Instant::now();
        if was_idle {
            // wake anyone waiting on the idle -> ready edge
            self.state.send_modify(|_| {});
        }
        Ok(channel)
    }

    /// Feed a call outcome back into the connection state.
    ///
    /// `Unavailable` is the status tonic reports for transport breakage;
    /// any other outcome proves the transport still works.
    pub fn observe<T>(&self, result: &Result<T, Status>) {
        match result {
            Err(status) if status.code() == Code::Unavailable => {
                self.report_transport_failure();
            }
            _ => {
                self.set_state(ConnectivityState::Ready);
            }
        }
    }

    /// Mark the connection as failing so the next repair pass replaces it.
    pub fn report_transport_failure(&self) {
        if self.set_state(ConnectivityState::TransientFailure) {
            debug!(target = %self.target, connection = self.id, "Connection reported transient failure");
        }
    }

    fn set_state(&self, next: ConnectivityState) -> bool {
        self.state.send_if_modified(|current| {
            if *current == ConnectivityState::Shutdown || *current == next {
                false
            } else {
                *current = next;
                true
            }
        })
    }
}

#[async_trait]
impl Connection for GrpcConnection {
    fn state(&self) -> ConnectivityState {
        let state = *self.state.borrow();
        if state == ConnectivityState::Ready && self.last_used.lock().elapsed() >= self.max_idle {
            ConnectivityState::Idle
        } else {
            state
        }
    }

    async fn wait_for_state_change(&self, from: ConnectivityState) -> ConnectivityState {
        let mut rx = self.state.subscribe();
        loop {
            let current = self.state();
            if current != from {
                return current;
            }
            if rx.changed().await.is_err() {
                return ConnectivityState::Shutdown;
            }
        }
    }

    async fn close(&self) -> Result<(), PoolError> {
        let channel = self.channel.lock().take();
        self.set_state(ConnectivityState::Shutdown);
        if channel.is_some() {
            trace!(target = %self.target, connection = self.id, "Connection closed");
        }
        Ok(())
    }
}

impl std::fmt::Debug for GrpcConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrpcConnection")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("state", &self.state())
            .finish()
    }
}

/// Dials eager tonic channels.
#[derive(Debug, Clone, Copy, Default)]
pub struct GrpcConnector;

impl GrpcConnector {
    /// Build the endpoint for a target, applying keepalive settings and the
    /// pass-through options in order.
    pub fn endpoint(target: &str, options: &TransportOptions) -> Result<Endpoint, PoolError> {
        let uri = if target.contains("://") {
            target.to_string()
        } else if options.tls().is_some() {
            format!("https://{}", target)
        } else {
            format!("http://{}", target)
        };

        let mut endpoint = Endpoint::from_shared(uri)
            .map_err(|e| PoolError::InvalidTarget(format!("{}: {}", target, e)))?
            .http2_keep_alive_interval(options.keepalive_interval)
            .keep_alive_timeout(options.keepalive_timeout)
            .keep_alive_while_idle(true);

        for option in &options.extra {
            endpoint = match option {
                ExtraOption::Tls(tls) => endpoint
                    .tls_config(tls.clone())
                    .map_err(|e| PoolError::InvalidTarget(format!("{}: {}", target, e)))?,
                ExtraOption::ConnectTimeout(timeout) => endpoint.connect_timeout(*timeout),
                ExtraOption::RequestTimeout(timeout) => endpoint.timeout(*timeout),
                ExtraOption::ConcurrencyLimit(limit) => endpoint.concurrency_limit(*limit),
                ExtraOption::UserAgent(agent) => endpoint
                    .user_agent(agent.clone())
                    .map_err(|e| PoolError::InvalidTarget(format!("{}: {}", target, e)))?,
                ExtraOption::InitialStreamWindow(size) => endpoint.initial_stream_window_size(*size),
                ExtraOption::TcpNodelay(enabled) => endpoint.tcp_nodelay(*enabled),
            };
        }

        Ok(endpoint)
    }
}

#[async_trait]
impl Connector for GrpcConnector {
    type Conn = GrpcConnection;

    async fn connect(
        &self,
        target: &str,
        options: &TransportOptions,
    ) -> Result<Arc<GrpcConnection>, PoolError> {
        let endpoint = Self::endpoint(target, options)?;
        let channel = endpoint
            .connect()
            .await
            .map_err(|e| PoolError::connection_failed(target, e))?;

        let conn = GrpcConnection::from_channel(target, channel, options.max_idle);
        debug!(target = %target, connection = conn.id, "Established gRPC connection");
        Ok(Arc::new(conn))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::transport::ClientTlsConfig;

    fn options(extra: Vec<ExtraOption>) -> TransportOptions {
        TransportOptions {
            keepalive_interval: Duration::from_secs(10),
            keepalive_timeout: Duration::from_secs(3),
            max_idle: Duration::from_secs(60),
            max_age: Duration::from_secs(1800),
            max_age_grace: Duration::from_secs(5),
            extra,
        }
    }

    fn lazy_connection(max_idle: Duration) -> GrpcConnection {
        let channel = Endpoint::from_static("http://127.0.0.1:1").connect_lazy();
        GrpcConnection::from_channel("127.0.0.1:1", channel, max_idle)
    }

    #[test]
    fn test_endpoint_adds_scheme() {
        let endpoint = GrpcConnector::endpoint("orders.internal:50051", &options(vec![])).unwrap();
        assert_eq!(endpoint.uri().scheme_str(), Some("http"));
        assert_eq!(endpoint.uri().host(), Some("orders.internal"));
        assert_eq!(endpoint.uri().port_u16(), Some(50051));

        let endpoint = GrpcConnector::endpoint(
            "orders.internal:50051",
            &options(vec![ExtraOption::Tls(ClientTlsConfig::new())]),
        )
        .unwrap();
        assert_eq!(endpoint.uri().scheme_str(), Some("https"));
    }

    #[test]
    fn test_endpoint_rejects_garbage() {
        let err = GrpcConnector::endpoint("not a uri", &options(vec![])).unwrap_err();
        assert!(matches!(err, PoolError::InvalidTarget(_)));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let opts = options(vec![ExtraOption::ConnectTimeout(Duration::from_secs(2))]);
        let err = GrpcConnector.connect(&addr.to_string(), &opts).await.unwrap_err();
        assert!(matches!(err, PoolError::ConnectionFailed { .. }));
    }

    #[tokio::test]
    async fn test_observe_drives_state() {
        let conn = lazy_connection(Duration::from_secs(60));
        assert_eq!(conn.state(), ConnectivityState::Ready);

        conn.observe::<()>(&Err(Status::unavailable("connection reset")));
        assert_eq!(conn.state(), ConnectivityState::TransientFailure);

        // application errors do not count against the transport
        conn.observe::<()>(&Err(Status::not_found("no such order")));
        assert_eq!(conn.state(), ConnectivityState::Ready);

        conn.close().await.unwrap();
        conn.observe(&Ok(()));
        assert_eq!(conn.state(), ConnectivityState::Shutdown);
        assert!(conn.close().await.is_ok());
    }

    #[tokio::test]
    async fn test_close_releases_channel() {
        use tokio::io::AsyncReadExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            // drain until the client hangs up
            loop {
                match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(_) => {}
                }
            }
        });

        let opts = options(vec![ExtraOption::ConnectTimeout(Duration::from_secs(2))]);
        let conn = GrpcConnector.connect(&addr.to_string(), &opts).await.unwrap();
        assert!(conn.channel().is_ok());

        conn.close().await.unwrap();
        assert_eq!(conn.state(), ConnectivityState::Shutdown);
        assert!(matches!(conn.channel(), Err(PoolError::ConnectionClosed { .. })));

        // connection is still referenced, yet the server sees the hang-up
        tokio::time::timeout(Duration::from_secs(3), server)
            .await
            .expect("socket not released after close")
            .unwrap();
        drop(conn);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_after_max_idle() {
        let conn = lazy_connection(Duration::from_secs(30));
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(conn.state(), ConnectivityState::Idle);

        let _channel = conn.channel().unwrap();
        assert_eq!(conn.state(), ConnectivityState::Ready);
    }

    #[tokio::test]
    async fn test_wait_for_state_change() {
        let conn = Arc::new(lazy_connection(Duration::from_secs(60)));
        conn.report_transport_failure();

        let waiter = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move {
                conn.wait_for_state_change(ConnectivityState::TransientFailure).await
            })
        };
        tokio::task::yield_now().await;
        conn.observe(&Ok(()));

        assert_eq!(waiter.await.unwrap(), ConnectivityState::Ready);
    }
}
