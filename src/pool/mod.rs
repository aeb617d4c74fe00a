//! Session pool management.
//!
//! The manager owns up to 16 authenticated secure channels and keeps the
//! pool healthy in the background: every 15 seconds each channel is probed
//! with an echo, channels that fail the probe or approach their message cap
//! are retired, and the pool is refilled to its configured size. User
//! commands are routed to a uniformly random member, so callers never deal
//! with individual sessions expiring.
//!
//! ```text
//!            ┌──────────────────────────────┐
//! caller ──> │        SessionManager        │
//!            │  ┌────┐  ┌────┐  ┌────┐      │   housekeeper (15 s):
//!            │  │ch 0│  │ch 1│  │ch 2│ ...  │   probe / retire / refill
//!            │  └────┘  └────┘  └────┘      │
//!            └──────────────────────────────┘
//!                │        │        │
//!                └────────┴────────┴──> connector
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{broadcast, watch, Mutex, RwLock};

use crate::channel::{SecureChannel, SecurityLevel, MAX_MESSAGES_PER_SESSION};
use crate::command::{CommandMessage, Response};
use crate::config::Config;
use crate::connector::{Connector, HttpConnector};
use crate::error::{HsmError, Result};

/// Devices support at most 16 concurrent sessions
pub const MAX_POOL_SIZE: usize = 16;

/// Retire a channel once it has used 90% of its message allowance
const RETIRE_THRESHOLD: u32 = MAX_MESSAGES_PER_SESSION / 10 * 9;

const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(15);

/// Probe payload; the echoed bytes must match
const KEEPALIVE: &[u8] = b"keepalive";

type PooledChannel = Arc<Mutex<SecureChannel>>;

/// A self-healing pool of authenticated secure channels.
///
/// Safe to share across tasks; see [`send_encrypted`](Self::send_encrypted).
/// The manager is single-use: once [`destroy`](Self::destroy) runs it stays
/// destroyed.
pub struct SessionManager {
    inner: Arc<Inner>,
    shutdown: broadcast::Sender<()>,
}

struct Inner {
    connector: Arc<dyn Connector>,
    auth_key_slot: u16,
    password: String,
    pool_size: usize,
    channels: RwLock<Vec<PooledChannel>>,
    destroyed: AtomicBool,
    /// Carries the live pool size; the first `1` is the connected signal
    pool_watch: watch::Sender<usize>,
}

impl SessionManager {
    /// Create a manager and populate its pool.
    ///
    /// One housekeeping pass runs inline; if it cannot authenticate a single
    /// channel the first error is surfaced and no manager is returned. After
    /// that, transient connector failures only log and the next tick retries.
    pub async fn new(
        connector: Arc<dyn Connector>,
        auth_key_slot: u16,
        password: &str,
        pool_size: u8,
    ) -> Result<Self> {
        if pool_size == 0 || usize::from(pool_size) > MAX_POOL_SIZE {
            return Err(HsmError::InvalidConfig(format!(
                "pool size {pool_size} is outside 1..={MAX_POOL_SIZE}"
            )));
        }

        let (pool_watch, _) = watch::channel(0);
        let inner = Arc::new(Inner {
            connector,
            auth_key_slot,
            password: password.to_string(),
            pool_size: usize::from(pool_size),
            channels: RwLock::new(Vec::new()),
            destroyed: AtomicBool::new(false),
            pool_watch,
        });

        let first_error = inner.housekeeping().await;
        if inner.channels.read().await.is_empty() {
            return Err(first_error.unwrap_or(HsmError::NoSessionAvailable));
        }

        let (shutdown, mut shutdown_rx) = broadcast::channel(1);
        let housekeeper = Arc::clone(&inner);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(HOUSEKEEPING_INTERVAL) => {
                        if housekeeper.destroyed.load(Ordering::SeqCst) {
                            break;
                        }
                        let _ = housekeeper.housekeeping().await;
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
            tracing::debug!("housekeeper stopped");
        });

        Ok(Self { inner, shutdown })
    }

    /// Create a manager from a [`Config`], using the HTTP connector.
    pub async fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        let connector = Arc::new(HttpConnector::new(config.connector_url.clone()));
        Self::new(
            connector,
            config.auth_key_slot,
            &config.password,
            config.pool_size,
        )
        .await
    }

    /// Route an encrypted command through a random pool member.
    ///
    /// The pool lock is only held to pick the channel; the exchange itself
    /// runs under that channel's own lock, so commands on different channels
    /// proceed in parallel.
    pub async fn send_encrypted(&self, command: &CommandMessage) -> Result<Response> {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return Err(HsmError::Destroyed);
        }

        let channel = {
            let pool = self.inner.channels.read().await;
            if pool.is_empty() {
                return Err(HsmError::NoSessionAvailable);
            }
            let index = rand::thread_rng().gen_range(0..pool.len());
            Arc::clone(&pool[index])
        };

        let result = channel.lock().await.send_encrypted(command).await;
        result
    }

    /// Number of channels currently pooled.
    pub async fn active_sessions(&self) -> usize {
        self.inner.channels.read().await.len()
    }

    /// Wait until at least one channel has authenticated.
    pub async fn wait_connected(&self) {
        self.wait_for_pool(1).await;
    }

    /// Wait until the pool holds at least `count` channels.
    ///
    /// The connected signal can fire before the pool is fully populated;
    /// callers that need the whole pool should wait for `pool_size` here.
    pub async fn wait_for_pool(&self, count: usize) {
        let mut rx = self.inner.pool_watch.subscribe();
        while *rx.borrow_and_update() < count {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Close every channel and stop the housekeeper. The manager cannot be
    /// revived afterwards.
    pub async fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown.send(());

        let channels: Vec<PooledChannel> =
            self.inner.channels.write().await.drain(..).collect();
        for channel in channels {
            // Best-effort: the device reaps unclosed sessions on its own
            let _ = channel.lock().await.close().await;
        }
        self.inner.pool_watch.send_replace(0);
        tracing::info!("session manager destroyed");
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        // Stop the housekeeper even when destroy() was never called
        let _ = self.shutdown.send(());
    }
}

impl Inner {
    /// One pass: retire unhealthy channels, then refill the pool.
    /// Returns the first channel-creation error for the constructor.
    async fn housekeeping(&self) -> Option<HsmError> {
        let snapshot: Vec<PooledChannel> = self.channels.read().await.clone();

        let mut retired = Vec::new();
        for channel in snapshot {
            if !probe(&channel).await {
                retired.push(channel);
            }
        }

        if !retired.is_empty() {
            let mut pool = self.channels.write().await;
            pool.retain(|member| !retired.iter().any(|dead| Arc::ptr_eq(dead, member)));
            self.pool_watch.send_replace(pool.len());

            tracing::debug!(count = retired.len(), "retired unhealthy sessions");
            for channel in retired {
                tokio::spawn(async move {
                    let _ = channel.lock().await.close().await;
                });
            }
        }

        let mut first_error = None;
        while !self.destroyed.load(Ordering::SeqCst) {
            if self.channels.read().await.len() >= self.pool_size {
                break;
            }

            match self.create_channel().await {
                Ok(channel) => {
                    let mut pool = self.channels.write().await;
                    pool.push(channel);
                    let count = pool.len();
                    drop(pool);
                    self.pool_watch.send_replace(count);
                    tracing::debug!(pool = count, "authenticated new session");
                }
                Err(err) => {
                    tracing::warn!(error = %err, "failed to create session, will retry");
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                    break;
                }
            }
        }

        first_error
    }

    async fn create_channel(&self) -> Result<PooledChannel> {
        let mut channel = SecureChannel::new(
            Arc::clone(&self.connector),
            self.auth_key_slot,
            &self.password,
        );
        channel.authenticate().await?;
        Ok(Arc::new(Mutex::new(channel)))
    }
}

/// A channel stays pooled iff it is authenticated, has messages left before
/// its cap, and echoes the keepalive payload back unchanged.
async fn probe(channel: &PooledChannel) -> bool {
    let mut channel = channel.lock().await;

    if channel.security_level() != SecurityLevel::Authenticated {
        return false;
    }
    if channel.counter() > RETIRE_THRESHOLD {
        return false;
    }

    match channel
        .send_encrypted(&CommandMessage::echo(KEEPALIVE.to_vec()))
        .await
    {
        Ok(Response::Echo(data)) => data == KEEPALIVE,
        Ok(_) | Err(_) => false,
    }
}
