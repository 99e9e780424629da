use super::VoteCounterStore;
use crate::error::StoreError;
use crate::models::{OptionId, PollId, TallyEntry, sort_tally};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// Process-local counter store.
///
/// Increments on an option that already has a counter take only shared locks
/// and a single atomic add; the maps are write-locked just to create a
/// poll's or option's first counter.
#[derive(Default)]
pub struct MemoryCounterStore {
    polls: RwLock<HashMap<PollId, Arc<PollCounters>>>,
}

#[derive(Default)]
struct PollCounters {
    options: RwLock<HashMap<OptionId, AtomicU64>>,
}

impl PollCounters {
    fn increment(&self, option_id: &OptionId) -> u64 {
        {
            let options = self.options.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(counter) = options.get(option_id) {
                return counter.fetch_add(1, Ordering::AcqRel) + 1;
            }
        }

        let mut options = self.options.write().unwrap_or_else(PoisonError::into_inner);
        options
            .entry(option_id.clone())
            .or_default()
            .fetch_add(1, Ordering::AcqRel)
            + 1
    }

    fn entries(&self) -> Vec<TallyEntry> {
        let options = self.options.read().unwrap_or_else(PoisonError::into_inner);
        options
            .iter()
            .map(|(option_id, counter)| TallyEntry {
                option_id: option_id.clone(),
                count: counter.load(Ordering::Acquire),
            })
            .collect()
    }
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn counters(&self, poll_id: &PollId) -> Option<Arc<PollCounters>> {
        self.polls
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(poll_id)
            .cloned()
    }

    fn counters_or_create(&self, poll_id: &PollId) -> Arc<PollCounters> {
        if let Some(counters) = self.counters(poll_id) {
            return counters;
        }
        self.polls
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(poll_id.clone())
            .or_default()
            .clone()
    }
}

impl VoteCounterStore for MemoryCounterStore {
    fn record_vote<'a>(
        &'a self,
        poll_id: &'a PollId,
        option_id: &'a OptionId,
    ) -> BoxFuture<'a, Result<u64, StoreError>> {
        Box::pin(async move { Ok(self.counters_or_create(poll_id).increment(option_id)) })
    }

    fn get_tally<'a>(
        &'a self,
        poll_id: &'a PollId,
    ) -> BoxFuture<'a, Result<Vec<TallyEntry>, StoreError>> {
        Box::pin(async move {
            let mut entries = match self.counters(poll_id) {
                Some(counters) => counters.entries(),
                None => return Ok(Vec::new()),
            };
            sort_tally(&mut entries);
            Ok(entries)
        })
    }
}
