//! Transport options shared by every connection of a pool.

use std::time::Duration;

use tonic::transport::ClientTlsConfig;

/// Transport-level option passed through to the connector untouched.
#[derive(Debug, Clone)]
pub enum ExtraOption {
    /// TLS settings; switches the dial scheme to https.
    Tls(ClientTlsConfig),
    /// Bound on establishing the transport.
    ConnectTimeout(Duration),
    /// Per-request timeout applied by the transport.
    RequestTimeout(Duration),
    /// Maximum in-flight requests per connection.
    ConcurrencyLimit(usize),
    /// User agent sent with every request.
    UserAgent(String),
    /// Initial HTTP/2 stream window size in bytes.
    InitialStreamWindow(u32),
    /// Disable Nagle's algorithm on the socket.
    TcpNodelay(bool),
}

/// Options computed once per pool and reused for every dial, including
/// the dials made by the repair pass.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Interval between keepalive pings.
    pub keepalive_interval: Duration,
    /// How long to wait for a ping acknowledgement.
    pub keepalive_timeout: Duration,
    /// Unused time after which a ready connection reports idle.
    pub max_idle: Duration,
    /// Age after which a connection is due for recycling.
    pub max_age: Duration,
    /// Extra time granted to an aged connection before it is recycled.
    pub max_age_grace: Duration,
    /// Pass-through options, in the order they were supplied.
    pub extra: Vec<ExtraOption>,
}

impl TransportOptions {
    /// Total lifetime of a connection before the repair pass recycles it.
    pub fn lifetime(&self) -> Duration {
        self.max_age.saturating_add(self.max_age_grace)
    }

    pub fn tls(&self) -> Option<&ClientTlsConfig> {
        self.extra.iter().find_map(|opt| match opt {
            ExtraOption::Tls(tls) => Some(tls),
            _ => None,
        })
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.extra.iter().rev().find_map(|opt| match opt {
            ExtraOption::ConnectTimeout(d) => Some(*d),
            _ => None,
        })
    }
}
