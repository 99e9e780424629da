use crate::models::{OptionId, PollId};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::{Mutex, PoisonError};
use uuid::Uuid;

/// Opaque per-browser identity used for duplicate-vote checks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VoterToken(String);

impl VoterToken {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl From<&str> for VoterToken {
    fn from(token: &str) -> Self {
        Self(token.to_owned())
    }
}

impl fmt::Display for VoterToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Admission check consulted before a vote is counted.
pub trait VoteGate: Send + Sync + 'static {
    /// Admits (and claims) the vote, or refuses it.
    fn allow<'a>(
        &'a self,
        poll_id: &'a PollId,
        option_id: &'a OptionId,
        voter: &'a VoterToken,
    ) -> BoxFuture<'a, bool>;

    /// Gives back an admission whose vote could not be recorded.
    fn release<'a>(&'a self, _poll_id: &'a PollId, _voter: &'a VoterToken) -> BoxFuture<'a, ()> {
        Box::pin(async {})
    }
}

pub struct OpenGate;

impl VoteGate for OpenGate {
    fn allow<'a>(
        &'a self,
        _poll_id: &'a PollId,
        _option_id: &'a OptionId,
        _voter: &'a VoterToken,
    ) -> BoxFuture<'a, bool> {
        Box::pin(async { true })
    }
}

/// One vote per voter per poll, remembered for the life of the process.
#[derive(Default)]
pub struct OncePerVoterGate {
    voted: Mutex<HashSet<(PollId, VoterToken)>>,
}

impl OncePerVoterGate {
    pub fn new() -> Self {
        Self::default()
    }
}

impl VoteGate for OncePerVoterGate {
    fn allow<'a>(
        &'a self,
        poll_id: &'a PollId,
        _option_id: &'a OptionId,
        voter: &'a VoterToken,
    ) -> BoxFuture<'a, bool> {
        let admitted = self
            .voted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((poll_id.clone(), voter.clone()));
        Box::pin(async move { admitted })
    }

    fn release<'a>(&'a self, poll_id: &'a PollId, voter: &'a VoterToken) -> BoxFuture<'a, ()> {
        self.voted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(poll_id.clone(), voter.clone()));
        Box::pin(async {})
    }
}
