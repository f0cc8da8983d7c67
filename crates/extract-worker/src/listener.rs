// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Queue wake-ups for the worker loop.
//!
//! A notification means "recheck now", never "a specific run exists". When
//! the notification connection is lost the listener degrades to timed
//! polling and reconnects with exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const RECONNECT_BACKOFF_MIN: Duration = Duration::from_secs(1);
const RECONNECT_BACKOFF_MAX: Duration = Duration::from_secs(60);

/// Why a wait returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wakeup {
    /// A producer published, or the channel was lost and the queue should be rechecked.
    Notified,
    /// The timeout elapsed.
    TimedOut,
}

/// Blocks the worker loop until the queue may have changed.
#[async_trait]
pub trait QueueListener: Send + Sync {
    /// Wait at most `timeout` for a wake-up.
    async fn wait(&mut self, timeout: Duration) -> Wakeup;
}

/// LISTEN on a PostgreSQL notification channel, with polling fallback.
pub struct PgQueueListener {
    pool: PgPool,
    channel: String,
    listener: Option<PgListener>,
    backoff: Duration,
    reconnect_at: Instant,
}

impl PgQueueListener {
    /// Listener that connects lazily on the first wait.
    pub fn new(pool: PgPool, channel: impl Into<String>) -> Self {
        Self {
            pool,
            channel: channel.into(),
            listener: None,
            backoff: RECONNECT_BACKOFF_MIN,
            reconnect_at: Instant::now(),
        }
    }

    /// Listener with the subscription established up front.
    pub async fn connect(pool: PgPool, channel: impl Into<String>) -> Result<Self, sqlx::Error> {
        let mut this = Self::new(pool, channel);
        this.listener = Some(this.subscribe().await?);
        info!(channel = %this.channel, "Listening for queued runs");
        Ok(this)
    }

    /// Whether a live subscription exists.
    pub fn is_connected(&self) -> bool {
        self.listener.is_some()
    }

    async fn subscribe(&self) -> Result<PgListener, sqlx::Error> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(&self.channel).await?;
        Ok(listener)
    }

    async fn try_reconnect(&mut self) {
        if Instant::now() < self.reconnect_at {
            return;
        }
        match self.subscribe().await {
            Ok(listener) => {
                info!(channel = %self.channel, "Queue listener reconnected");
                self.listener = Some(listener);
                self.backoff = RECONNECT_BACKOFF_MIN;
            }
            Err(e) => {
                warn!(
                    channel = %self.channel,
                    error = %e,
                    retry_in_secs = self.backoff.as_secs(),
                    "Queue listener reconnect failed, polling"
                );
                self.reconnect_at = Instant::now() + self.backoff;
                self.backoff = (self.backoff * 2).min(RECONNECT_BACKOFF_MAX);
            }
        }
    }

    fn connection_lost(&mut self) {
        self.listener = None;
        self.reconnect_at = Instant::now() + self.backoff;
        self.backoff = (self.backoff * 2).min(RECONNECT_BACKOFF_MAX);
    }
}

#[async_trait]
impl QueueListener for PgQueueListener {
    async fn wait(&mut self, timeout: Duration) -> Wakeup {
        if self.listener.is_none() {
            self.try_reconnect().await;
        }

        let Some(listener) = self.listener.as_mut() else {
            // Polling fallback; wake in time for the next reconnect attempt.
            let until_reconnect = self.reconnect_at.saturating_duration_since(Instant::now());
            tokio::time::sleep(timeout.min(until_reconnect.max(Duration::from_millis(10)))).await;
            return Wakeup::TimedOut;
        };

        match tokio::time::timeout(timeout, listener.try_recv()).await {
            Err(_) => Wakeup::TimedOut,
            Ok(Ok(Some(notification))) => {
                debug!(channel = %self.channel, payload = %notification.payload(), "Queue notification");
                Wakeup::Notified
            }
            Ok(Ok(None)) => {
                warn!(channel = %self.channel, "Queue listener connection lost");
                self.connection_lost();
                Wakeup::Notified
            }
            Ok(Err(e)) => {
                warn!(channel = %self.channel, error = %e, "Queue listener failed");
                self.connection_lost();
                Wakeup::Notified
            }
        }
    }
}

/// Sleep-only listener: pure timed polling.
#[derive(Debug, Default, Clone, Copy)]
pub struct PollingListener;

#[async_trait]
impl QueueListener for PollingListener {
    async fn wait(&mut self, timeout: Duration) -> Wakeup {
        tokio::time::sleep(timeout).await;
        Wakeup::TimedOut
    }
}

/// In-process listener woken through a shared [`Notify`].
#[derive(Debug, Clone)]
pub struct NotifyListener {
    notify: Arc<Notify>,
}

impl NotifyListener {
    /// Listen on `notify`.
    pub fn new(notify: Arc<Notify>) -> Self {
        Self { notify }
    }
}

#[async_trait]
impl QueueListener for NotifyListener {
    async fn wait(&mut self, timeout: Duration) -> Wakeup {
        tokio::select! {
            _ = self.notify.notified() => Wakeup::Notified,
            _ = tokio::time::sleep(timeout) => Wakeup::TimedOut,
        }
    }
}
