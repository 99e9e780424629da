//! # Redis
//!
//! One sorted set per poll, `<prefix>:<poll_id>:votes`, member = option id,
//! score = vote count.
//!
//! - `ZINCRBY` is atomic on the server, so concurrent votes queue up there
//!   instead of racing in the application
//! - `ZREVRANGE .. WITHSCORES` returns the whole tally in one round trip,
//!   proportional to the number of voted options
//! - Redis breaks score ties by descending member, so the tally is re-sorted
//!   locally to get ascending option ids
use super::VoteCounterStore;
use crate::error::StoreError;
use crate::models::{OptionId, PollId, TallyEntry, sort_tally};
use futures::future::BoxFuture;
use redis::{
    AsyncCommands, Client, RedisError,
    aio::{ConnectionManager, ConnectionManagerConfig},
};
use std::future::Future;
use std::time::Duration;

pub struct RedisCounterStore {
    connection: ConnectionManager,
    key_prefix: String,
    timeout: Duration,
}

impl RedisCounterStore {
    pub async fn connect(
        redis_url: &str,
        key_prefix: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, StoreError> {
        let config = ConnectionManagerConfig::new()
            .set_number_of_retries(1)
            .set_connection_timeout(timeout);

        let client = Client::open(redis_url)?;
        let connection = client.get_connection_manager_with_config(config).await?;

        Ok(Self {
            connection,
            key_prefix: key_prefix.into(),
            timeout,
        })
    }

    fn key(&self, poll_id: &PollId) -> String {
        votes_key(&self.key_prefix, poll_id)
    }

    async fn bounded<T>(
        &self,
        key: &str,
        op: impl Future<Output = Result<T, RedisError>>,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(self.timeout, op).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) if e.code() == Some("WRONGTYPE") => Err(StoreError::KeyRejected {
                key: key.to_string(),
                reason: e.to_string(),
            }),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(StoreError::TimedOut(self.timeout)),
        }
    }
}

fn votes_key(prefix: &str, poll_id: &PollId) -> String {
    format!("{prefix}:{poll_id}:votes")
}

// Scores are only ever written by ZINCRBY with integer deltas.
fn score_to_count(score: f64) -> u64 {
    if score.is_finite() && score > 0.0 {
        score.round() as u64
    } else {
        0
    }
}

impl VoteCounterStore for RedisCounterStore {
    fn record_vote<'a>(
        &'a self,
        poll_id: &'a PollId,
        option_id: &'a OptionId,
    ) -> BoxFuture<'a, Result<u64, StoreError>> {
        Box::pin(async move {
            let key = self.key(poll_id);
            let mut connection = self.connection.clone();
            let score: f64 = self
                .bounded(&key, connection.zincr(&key, option_id.as_str(), 1))
                .await?;
            Ok(score_to_count(score))
        })
    }

    fn get_tally<'a>(
        &'a self,
        poll_id: &'a PollId,
    ) -> BoxFuture<'a, Result<Vec<TallyEntry>, StoreError>> {
        Box::pin(async move {
            let key = self.key(poll_id);
            let mut connection = self.connection.clone();
            let rows: Vec<(String, f64)> = self
                .bounded(&key, connection.zrevrange_withscores(&key, 0, -1))
                .await?;

            let mut entries: Vec<TallyEntry> = rows
                .into_iter()
                .map(|(option_id, score)| TallyEntry::new(option_id, score_to_count(score)))
                .collect();
            sort_tally(&mut entries);
            Ok(entries)
        })
    }
}
