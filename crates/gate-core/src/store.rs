use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

/// Counter primitives the rate limiter needs from a key-value store.
///
/// `ttl` follows Redis conventions: `-2` when the key does not exist and
/// `-1` when it exists without an expiry.
#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn ping(&self) -> anyhow::Result<()>;
    async fn incr(&self, key: &str) -> anyhow::Result<u64>;
    async fn expire(&self, key: &str, secs: u64) -> anyhow::Result<()>;
    async fn ttl(&self, key: &str) -> anyhow::Result<i64>;
}

/// Expired counters are dropped at most this often.
const SWEEP_EVERY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct Counter {
    count: u64,
    expires_at: Option<Instant>,
}

impl Counter {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Debug)]
struct Counters {
    entries: HashMap<String, Counter>,
    last_sweep: Instant,
}

impl Counters {
    fn sweep(&mut self, now: Instant) {
        if now.duration_since(self.last_sweep) >= SWEEP_EVERY {
            self.entries.retain(|_, c| c.is_live(now));
            self.last_sweep = now;
        }
    }

    fn drop_expired(&mut self, key: &str, now: Instant) {
        if self.entries.get(key).is_some_and(|c| !c.is_live(now)) {
            self.entries.remove(key);
        }
    }

    fn live(&mut self, key: &str, now: Instant) -> Option<&mut Counter> {
        self.drop_expired(key, now);
        self.entries.get_mut(key)
    }
}

/// Process-local counters. Good for a single instance and for tests.
#[derive(Debug)]
pub struct InMemoryCounterStore {
    counters: Mutex<Counters>,
}

impl Default for InMemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(Counters {
                entries: HashMap::new(),
                last_sweep: Instant::now(),
            }),
        }
    }

    /// Number of keys held, expired ones not yet swept included.
    pub async fn len(&self) -> usize {
        self.counters.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn ping(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn incr(&self, key: &str) -> anyhow::Result<u64> {
        let now = Instant::now();
        let mut counters = self.counters.lock().await;
        counters.sweep(now);
        counters.drop_expired(key, now);
        let counter = counters.entries.entry(key.to_string()).or_insert(Counter {
            count: 0,
            expires_at: None,
        });
        counter.count += 1;
        Ok(counter.count)
    }

    async fn expire(&self, key: &str, secs: u64) -> anyhow::Result<()> {
        let now = Instant::now();
        let expires_at = now
            .checked_add(Duration::from_secs(secs))
            .with_context(|| format!("expiry of {secs}s is out of range"))?;
        let mut counters = self.counters.lock().await;
        if let Some(counter) = counters.live(key, now) {
            counter.expires_at = Some(expires_at);
        }
        Ok(())
    }

    async fn ttl(&self, key: &str) -> anyhow::Result<i64> {
        let now = Instant::now();
        let mut counters = self.counters.lock().await;
        let ttl = match counters.live(key, now) {
            None => -2,
            Some(Counter {
                expires_at: None, ..
            }) => -1,
            Some(Counter {
                expires_at: Some(at),
                ..
            }) => {
                // whole seconds, rounded up
                let millis = at.duration_since(now).as_millis();
                i64::try_from((millis + 999) / 1000).unwrap_or(i64::MAX)
            }
        };
        Ok(ttl)
    }
}

/// Where to find the shared counter store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Takes precedence over host, port and password when set.
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: "127.0.0.1".into(),
            port: 6379,
            password: None,
        }
    }
}

#[cfg(feature = "redis")]
pub mod redis_store {
    use super::{CounterStore, StoreConfig};
    use anyhow::Context;
    use async_trait::async_trait;
    use redis::aio::ConnectionManager;
    use redis::{
        AsyncCommands, ConnectionAddr, ConnectionInfo, IntoConnectionInfo, RedisConnectionInfo,
    };
    use std::sync::Arc;
    use tokio::sync::OnceCell;
    use tracing::debug;

    impl StoreConfig {
        pub fn connection_info(&self) -> anyhow::Result<ConnectionInfo> {
            if let Some(url) = &self.url {
                return url
                    .as_str()
                    .into_connection_info()
                    .context("parse redis url");
            }
            Ok(ConnectionInfo {
                addr: ConnectionAddr::Tcp(self.host.clone(), self.port),
                redis: RedisConnectionInfo {
                    password: self.password.clone().filter(|p| !p.is_empty()),
                    ..RedisConnectionInfo::default()
                },
            })
        }
    }

    /// Redis-backed counters. One managed connection is opened on first use
    /// and shared by every later call.
    #[derive(Clone)]
    pub struct RedisCounterStore {
        client: redis::Client,
        conn: Arc<OnceCell<ConnectionManager>>,
    }

    impl RedisCounterStore {
        pub fn new(client: redis::Client) -> Self {
            Self {
                client,
                conn: Arc::new(OnceCell::new()),
            }
        }

        pub fn open(config: &StoreConfig) -> anyhow::Result<Self> {
            let client =
                redis::Client::open(config.connection_info()?).context("open redis client")?;
            Ok(Self::new(client))
        }

        async fn conn(&self) -> anyhow::Result<ConnectionManager> {
            let conn = self
                .conn
                .get_or_try_init(|| async {
                    debug!("opening redis connection");
                    ConnectionManager::new(self.client.clone()).await
                })
                .await
                .context("connect to redis")?;
            Ok(conn.clone())
        }
    }

    #[async_trait]
    impl CounterStore for RedisCounterStore {
        async fn ping(&self) -> anyhow::Result<()> {
            let mut conn = self.conn().await?;
            let _pong: String = redis::cmd("PING")
                .query_async(&mut conn)
                .await
                .context("redis PING")?;
            Ok(())
        }

        async fn incr(&self, key: &str) -> anyhow::Result<u64> {
            let mut conn = self.conn().await?;
            let count: u64 = conn.incr(key, 1u64).await.context("redis INCR")?;
            Ok(count)
        }

        async fn expire(&self, key: &str, secs: u64) -> anyhow::Result<()> {
            let secs = i64::try_from(secs).context("expiry out of range")?;
            let mut conn = self.conn().await?;
            let _: i64 = conn.expire(key, secs).await.context("redis EXPIRE")?;
            Ok(())
        }

        async fn ttl(&self, key: &str) -> anyhow::Result<i64> {
            let mut conn = self.conn().await?;
            let ttl: i64 = conn.ttl(key).await.context("redis TTL")?;
            Ok(ttl)
        }
    }

}
