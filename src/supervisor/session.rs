//! Shared HTTP session with generation tracking
//!
//! Every collaborator borrows the same `reqwest::Client` through a
//! [`SessionHandle`]. The client is replaced periodically and on demand; each
//! replacement bumps a generation number announced over a watch channel.
//!
//! Recreation is single-flight. Callers pass the generation they observed
//! failing, and only the first caller whose generation is still current
//! builds a new client. Everyone else gets the fresh one.

use chrono::{DateTime, Utc};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex, RwLock};

/// Session errors
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("failed to build HTTP client: {0}")]
    Build(#[from] reqwest::Error),
}

/// HTTP client settings
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Whole-request timeout
    pub timeout: Duration,

    /// TCP connect timeout
    pub connect_timeout: Duration,

    /// User-Agent header
    pub user_agent: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            user_agent: format!("herald/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl SessionConfig {
    fn build_client(&self) -> Result<Client, SessionError> {
        Ok(Client::builder()
            .timeout(self.timeout)
            .connect_timeout(self.connect_timeout)
            .user_agent(&self.user_agent)
            .gzip(true)
            .cookie_store(true)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?)
    }
}

/// A client borrowed from the session, tagged with its generation
#[derive(Debug, Clone)]
pub struct SessionLease {
    pub client: Client,
    pub generation: u64,
}

#[derive(Debug)]
struct Slot {
    client: Client,
    generation: u64,
    created_at: DateTime<Utc>,
    closed: bool,
}

/// Owner of the shared HTTP client
#[derive(Debug)]
pub struct SessionHandle {
    config: SessionConfig,
    slot: RwLock<Slot>,
    rebuild: Mutex<()>,
    generation_tx: watch::Sender<u64>,
}

impl SessionHandle {
    /// Build the first client (generation 1)
    pub fn new(config: SessionConfig) -> Result<Arc<Self>, SessionError> {
        let client = config.build_client()?;
        let (generation_tx, _) = watch::channel(1);
        Ok(Arc::new(Self {
            config,
            slot: RwLock::new(Slot {
                client,
                generation: 1,
                created_at: Utc::now(),
                closed: false,
            }),
            rebuild: Mutex::new(()),
            generation_tx,
        }))
    }

    /// Current client, recreating it first if the session was closed
    pub async fn acquire(&self) -> Result<SessionLease, SessionError> {
        let observed = {
            let slot = self.slot.read().await;
            if !slot.closed {
                return Ok(SessionLease {
                    client: slot.client.clone(),
                    generation: slot.generation,
                });
            }
            slot.generation
        };
        self.recreate(observed).await
    }

    /// Replace the client if `observed` is still the current generation
    pub async fn recreate(&self, observed: u64) -> Result<SessionLease, SessionError> {
        let _guard = self.rebuild.lock().await;

        {
            let slot = self.slot.read().await;
            if slot.generation != observed && !slot.closed {
                return Ok(SessionLease {
                    client: slot.client.clone(),
                    generation: slot.generation,
                });
            }
        }

        let client = self.config.build_client()?;
        let mut slot = self.slot.write().await;
        slot.client = client;
        slot.generation += 1;
        slot.created_at = Utc::now();
        slot.closed = false;
        let generation = slot.generation;
        let lease = SessionLease {
            client: slot.client.clone(),
            generation,
        };
        drop(slot);

        self.generation_tx.send_replace(generation);
        tracing::info!(generation = generation, "HTTP session recreated");
        Ok(lease)
    }

    /// Unconditional periodic replacement
    pub async fn refresh(&self) -> Result<u64, SessionError> {
        let current = self.generation().await;
        let result = self.recreate(current).await.map(|lease| lease.generation);
        crate::metrics::record_session_refresh(result.is_ok());
        result
    }

    /// Mark `generation` as broken; the next `acquire` rebuilds
    pub async fn invalidate(&self, generation: u64) {
        let mut slot = self.slot.write().await;
        if slot.generation == generation && !slot.closed {
            slot.closed = true;
            tracing::warn!(generation = generation, "HTTP session invalidated");
        }
    }

    /// Close the session
    pub async fn close(&self) {
        let mut slot = self.slot.write().await;
        slot.closed = true;
        tracing::info!(generation = slot.generation, "HTTP session closed");
    }

    /// Whether the session is closed
    pub async fn is_closed(&self) -> bool {
        self.slot.read().await.closed
    }

    /// Current generation
    pub async fn generation(&self) -> u64 {
        self.slot.read().await.generation
    }

    /// When the current client was built
    pub async fn created_at(&self) -> DateTime<Utc> {
        self.slot.read().await.created_at
    }

    /// Receive every new generation number
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation_tx.subscribe()
    }
}
