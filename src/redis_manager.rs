//! Redis Manager - Centralized Redis connection and operations
//!
//! This module handles all Redis-related operations including:
//! - Job queue operations (BLPOP)
//! - Reply delivery (RPUSH + expiry) and publishing
//!
//! The queue connection blocks inside BLPOP, so replies go out over a
//! second connection owned by `ResultPublisher`.

use std::time::Duration;

use anyhow::{Context, Result};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tracing::{info, warn};

use crate::jobs::execute::ExecuteReply;
use crate::jobs::WorkerJob;

/// Redis key constants
pub mod keys {
    /// Execute result channel (for pub/sub)
    pub const EXECUTE_RESULT_CHANNEL: &str = "executor:results";
}

const RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Owns the queue connection
pub struct RedisManager {
    client: redis::Client,
    conn: MultiplexedConnection,
    queue: String,
}

impl RedisManager {
    pub async fn connect(redis_url: &str, queue: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("Failed to create Redis client")?;
        let conn = get_connection_with_retry(&client).await?;
        info!("Connected to Redis at {}", redis_url);

        Ok(Self {
            client,
            conn,
            queue: queue.to_string(),
        })
    }

    /// Open the reply connection
    pub async fn publisher(&self, result_ttl_secs: u64) -> Result<ResultPublisher> {
        let conn = get_connection_with_retry(&self.client).await?;
        Ok(ResultPublisher {
            client: self.client.clone(),
            conn,
            result_ttl_secs,
        })
    }

    /// Block and wait for the next job from the queue.
    ///
    /// Automatically reconnects on connection failure; malformed payloads
    /// are logged and skipped.
    pub async fn pop_job(&mut self) -> Result<WorkerJob> {
        loop {
            let result: Option<(String, String)> = match self.conn.blpop(&self.queue, 0.0).await {
                Ok(res) => res,
                Err(e) => {
                    warn!("Redis BLPOP failed: {}. Reconnecting...", e);
                    self.conn = get_connection_with_retry(&self.client).await?;
                    continue;
                }
            };

            if let Some((_, job_data)) = result {
                match serde_json::from_str::<WorkerJob>(&job_data) {
                    Ok(job) => return Ok(job),
                    Err(e) => {
                        warn!("Failed to parse job data: {}. Skipping ({} bytes)", e, job_data.len());
                        continue;
                    }
                }
            }
        }
    }
}

/// Cloneable handle for delivering replies from job tasks
#[derive(Clone)]
pub struct ResultPublisher {
    client: redis::Client,
    conn: MultiplexedConnection,
    result_ttl_secs: u64,
}

impl ResultPublisher {
    /// Push the reply onto `key` for the caller's BLPOP, set its expiry so
    /// it does not linger if the caller went away, and publish it.
    pub async fn store_reply(&mut self, key: &str, reply: &ExecuteReply) -> Result<()> {
        let json = serde_json::to_string(reply)?;

        if let Err(e) = self.conn.rpush::<_, _, ()>(key, &json).await {
            warn!("Failed to push execute reply: {}. Reconnecting...", e);
            self.conn = get_connection_with_retry(&self.client).await?;
            self.conn.rpush::<_, _, ()>(key, &json).await?;
        }

        let ttl = i64::try_from(self.result_ttl_secs).unwrap_or(i64::MAX);
        if let Err(e) = self.conn.expire::<_, ()>(key, ttl).await {
            warn!("Failed to set expiry on {}: {}", key, e);
        }

        // No subscribers is fine
        let _ = self
            .conn
            .publish::<_, _, ()>(keys::EXECUTE_RESULT_CHANNEL, &json)
            .await;

        Ok(())
    }
}

/// Get a Redis connection with retry logic
async fn get_connection_with_retry(client: &redis::Client) -> Result<MultiplexedConnection> {
    loop {
        match client.get_multiplexed_async_connection().await {
            Ok(conn) => return Ok(conn),
            Err(e) => {
                warn!(
                    "Failed to connect to Redis: {}. Retrying in {} seconds...",
                    e,
                    RECONNECT_DELAY.as_secs()
                );
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}
