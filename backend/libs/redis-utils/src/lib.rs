use anyhow::{anyhow, Context, Result};
use redis::aio::ConnectionManager;
use redis::{Client, ConnectionAddr, ConnectionInfo, IntoConnectionInfo};
use std::time::Duration;
use tracing::info;

/// Connection settings for [`RedisPool::connect`].
#[derive(Clone, Debug)]
pub struct RedisConfig {
    pub url: String,
    /// Upper bound for establishing the connection and answering the startup PING
    pub connect_timeout: Duration,
}

impl RedisConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Multiplexed Redis connection that reconnects on its own after drops.
///
/// `ConnectionManager` is cheap to clone; every clone shares the same
/// underlying multiplexed connection.
#[derive(Clone)]
pub struct RedisPool {
    manager: ConnectionManager,
    endpoint: String,
}

impl RedisPool {
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let info: ConnectionInfo = config
            .url
            .as_str()
            .into_connection_info()
            .context("failed to parse REDIS_URL connection string")?;
        let endpoint = endpoint_label(&info.addr);

        let client = Client::open(info).context("failed to construct Redis client")?;

        let mut manager = tokio::time::timeout(config.connect_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| anyhow!("timed out connecting to Redis at {}", endpoint))?
            .context("failed to initialize Redis connection manager")?;

        let pong: String = tokio::time::timeout(
            config.connect_timeout,
            redis::cmd("PING").query_async(&mut manager),
        )
        .await
        .map_err(|_| anyhow!("timed out waiting for PING reply from {}", endpoint))?
        .context("Redis PING failed")?;

        info!(endpoint = %endpoint, reply = %pong, "Redis connection established");

        Ok(Self { manager, endpoint })
    }

    pub fn manager(&self) -> ConnectionManager {
        self.manager.clone()
    }

    /// `host:port` (or socket path) of the connected node, safe to log.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

fn endpoint_label(addr: &ConnectionAddr) -> String {
    match addr {
        ConnectionAddr::Tcp(host, port) => format!("{}:{}", host, port),
        ConnectionAddr::TcpTls { host, port, .. } => format!("{}:{} (tls)", host, port),
        ConnectionAddr::Unix(path) => path.display().to_string(),
    }
}

/// Strip credentials from a Redis URL before it is logged.
pub fn redact_url(raw: &str) -> String {
    match raw.split_once("://") {
        Some((scheme, rest)) => match rest.rsplit_once('@') {
            Some((_, host)) => format!("{}://[REDACTED]@{}", scheme, host),
            None => raw.to_string(),
        },
        None => raw.to_string(),
    }
}
