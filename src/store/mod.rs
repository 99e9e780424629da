//! Per-poll vote counters.
//!
//! Every backend keeps one sorted counter set per poll, keyed by option, and
//! exposes increment as its only mutation. Callers never read-modify-write a
//! count.

use crate::error::StoreError;
use crate::models::{OptionId, PollId, TallyEntry, TallySnapshot};
use futures::future::BoxFuture;

mod memory;
mod redis_store;

pub use memory::MemoryCounterStore;
pub use redis_store::RedisCounterStore;

pub trait VoteCounterStore: Send + Sync + 'static {
    /// Atomically adds one vote and returns the option's new count.
    fn record_vote<'a>(
        &'a self,
        poll_id: &'a PollId,
        option_id: &'a OptionId,
    ) -> BoxFuture<'a, Result<u64, StoreError>>;

    /// Every voted option of the poll, by descending count then ascending id.
    /// A poll without votes yields an empty tally.
    fn get_tally<'a>(&'a self, poll_id: &'a PollId)
    -> BoxFuture<'a, Result<Vec<TallyEntry>, StoreError>>;

    fn get_total<'a>(&'a self, poll_id: &'a PollId) -> BoxFuture<'a, Result<u64, StoreError>> {
        Box::pin(async move {
            let tally = self.get_tally(poll_id).await?;
            Ok(tally.iter().map(|entry| entry.count).sum())
        })
    }
}

pub async fn read_snapshot(
    store: &dyn VoteCounterStore,
    poll_id: &PollId,
) -> Result<TallySnapshot, StoreError> {
    let options = store.get_tally(poll_id).await?;
    Ok(TallySnapshot::new(poll_id.clone(), options))
}
