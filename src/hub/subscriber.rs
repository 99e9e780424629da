use crate::error::DeliveryFailure;
use crate::models::{PollId, TallySnapshot};
use futures::future::{self, BoxFuture};
use std::sync::Arc;
use uuid::Uuid;

/// A live observer connection that can receive tally snapshots.
///
/// Implemented once per transport. The hub drives each subscriber from its
/// own task, so a slow `send` only delays that subscriber.
pub trait Subscriber: Send + Sync + 'static {
    fn send(&self, snapshot: Arc<TallySnapshot>) -> BoxFuture<'_, Result<(), DeliveryFailure>>;

    /// Called once when the registration ends, whatever the reason.
    fn close(&self) -> BoxFuture<'_, ()>;

    /// Resolves when the peer has gone away. Transports that cannot observe
    /// this never resolve and rely on `send` failing or an explicit
    /// unsubscribe instead.
    fn closed(&self) -> BoxFuture<'_, ()> {
        Box::pin(future::pending())
    }
}

/// Handle returned by `TallyHub::subscribe`, used to unsubscribe.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    pub id: Uuid,
    pub poll_id: PollId,
}

impl Subscription {
    pub(crate) fn new(poll_id: PollId) -> Self {
        Self {
            id: Uuid::new_v4(),
            poll_id,
        }
    }
}
