//! Live tally fan-out.
//!
//! Each poll with observers has a topic holding its registrations. A
//! registration is a latest-value channel plus a delivery task that owns the
//! subscriber, so publishing only swaps channel values and never waits on a
//! connection. Snapshot reads for one poll are serialized by the topic's
//! sequencer, which keeps the totals each subscriber sees non-decreasing.
//!
//! Votes only mark their topic dirty. One refresher per topic reads the tally,
//! and votes arriving during a read are folded into a single follow-up read.

mod subscriber;

pub use subscriber::{Subscriber, Subscription};

use crate::error::SubscribeError;
use crate::models::{OptionId, PollId, TallySnapshot};
use crate::store::{VoteCounterStore, read_snapshot};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub struct HubConfig {
    /// Close subscribers that received nothing for this long.
    pub idle_timeout: Option<Duration>,
}

#[derive(Clone)]
pub struct TallyHub {
    inner: Arc<HubInner>,
}

struct HubInner {
    store: Arc<dyn VoteCounterStore>,
    topics: RwLock<HashMap<PollId, Arc<PollTopic>>>,
    config: HubConfig,
    closing: AtomicBool,
}

#[derive(Default)]
struct PollTopic {
    sequencer: tokio::sync::Mutex<()>,
    refresh: Mutex<RefreshState>,
    registry: Mutex<Registry>,
}

#[derive(Default)]
struct RefreshState {
    running: bool,
    pending: bool,
}

#[derive(Default)]
struct Registry {
    // Set once the topic has left the hub's map; late registrations must retry.
    retired: bool,
    registrations: HashMap<Uuid, Registration>,
}

struct Registration {
    updates: watch::Sender<Arc<TallySnapshot>>,
    task: JoinHandle<()>,
}

#[derive(Debug, Clone, Copy)]
enum CloseReason {
    Unsubscribed,
    Disconnected,
    DeliveryFailed,
    IdleTimeout,
}

impl PollTopic {
    fn registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns true when the caller must start the refresher.
    fn mark_dirty(&self) -> bool {
        let mut refresh = self.refresh.lock().unwrap_or_else(PoisonError::into_inner);
        if refresh.running {
            refresh.pending = true;
            false
        } else {
            refresh.running = true;
            true
        }
    }

    /// Returns true when votes arrived during the last read.
    fn finish_round(&self) -> bool {
        let mut refresh = self.refresh.lock().unwrap_or_else(PoisonError::into_inner);
        if refresh.pending {
            refresh.pending = false;
            true
        } else {
            refresh.running = false;
            false
        }
    }

    fn is_idle(&self) -> bool {
        self.registry().registrations.is_empty()
    }

    fn publish(&self, snapshot: Arc<TallySnapshot>) -> usize {
        let registry = self.registry();
        for registration in registry.registrations.values() {
            registration.updates.send_replace(snapshot.clone());
        }
        registry.registrations.len()
    }
}

impl HubInner {
    fn topic(&self, poll_id: &PollId) -> Option<Arc<PollTopic>> {
        self.topics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(poll_id)
            .cloned()
    }

    fn topic_or_create(&self, poll_id: &PollId) -> Arc<PollTopic> {
        if let Some(topic) = self.topic(poll_id) {
            return topic;
        }
        self.topics
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(poll_id.clone())
            .or_default()
            .clone()
    }

    /// Registers under the topic unless it was retired meanwhile, in which
    /// case the subscriber is handed back.
    fn register(
        self: &Arc<Self>,
        topic: &PollTopic,
        poll_id: &PollId,
        subscriber: Box<dyn Subscriber>,
        snapshot: Arc<TallySnapshot>,
    ) -> Result<Subscription, Box<dyn Subscriber>> {
        let mut registry = topic.registry();
        if registry.retired {
            return Err(subscriber);
        }

        let subscription = Subscription::new(poll_id.clone());
        let (updates, receiver) = watch::channel(snapshot.clone());
        let task = tokio::spawn(deliver(
            Arc::downgrade(self),
            subscription.clone(),
            subscriber,
            snapshot,
            receiver,
            self.config.idle_timeout,
        ));
        registry
            .registrations
            .insert(subscription.id, Registration { updates, task });
        Ok(subscription)
    }

    fn remove(&self, subscription: &Subscription) -> Option<Registration> {
        let topic = self.topic(&subscription.poll_id)?;
        let removed = topic.registry().registrations.remove(&subscription.id);
        if removed.is_some() {
            self.retire_if_idle(&subscription.poll_id, &topic);
        }
        removed
    }

    async fn refresh(&self, poll_id: &PollId, topic: &PollTopic) {
        let _turn = topic.sequencer.lock().await;
        if topic.is_idle() {
            return;
        }

        let snapshot = match read_snapshot(self.store.as_ref(), poll_id).await {
            Ok(snapshot) => Arc::new(snapshot),
            Err(e) => {
                warn!(poll_id = %poll_id, error = %e, "skipping broadcast, tally unavailable");
                return;
            }
        };

        let total = snapshot.total;
        let delivered = topic.publish(snapshot);
        trace!(poll_id = %poll_id, total, delivered, "published tally");
    }

    fn retire_if_idle(&self, poll_id: &PollId, topic: &Arc<PollTopic>) {
        let mut topics = self.topics.write().unwrap_or_else(PoisonError::into_inner);
        let mut registry = topic.registry();
        if registry.retired || !registry.registrations.is_empty() {
            return;
        }
        if topics
            .get(poll_id)
            .is_some_and(|current| Arc::ptr_eq(current, topic))
        {
            topics.remove(poll_id);
        }
        registry.retired = true;
        trace!(poll_id = %poll_id, "retired idle topic");
    }
}

impl TallyHub {
    pub fn new(store: Arc<dyn VoteCounterStore>, config: HubConfig) -> Self {
        Self {
            inner: Arc::new(HubInner {
                store,
                topics: RwLock::new(HashMap::new()),
                config,
                closing: AtomicBool::new(false),
            }),
        }
    }

    /// Registers `subscriber` for `poll_id` and queues the poll's current
    /// snapshot as its first delivery.
    ///
    /// On error the subscriber has already been closed.
    pub async fn subscribe(
        &self,
        subscriber: Box<dyn Subscriber>,
        poll_id: PollId,
    ) -> Result<Subscription, SubscribeError> {
        let mut subscriber = subscriber;
        loop {
            if self.inner.closing.load(Ordering::Acquire) {
                subscriber.close().await;
                return Err(SubscribeError::ShuttingDown);
            }

            let topic = self.inner.topic_or_create(&poll_id);
            let _turn = topic.sequencer.lock().await;

            let snapshot = match read_snapshot(self.inner.store.as_ref(), &poll_id).await {
                Ok(snapshot) => Arc::new(snapshot),
                Err(e) => {
                    warn!(poll_id = %poll_id, error = %e, "failed to read initial snapshot");
                    drop(_turn);
                    self.inner.retire_if_idle(&poll_id, &topic);
                    subscriber.close().await;
                    return Err(e.into());
                }
            };

            match self
                .inner
                .register(&topic, &poll_id, subscriber, snapshot)
            {
                Ok(subscription) => {
                    debug!(poll_id = %poll_id, subscription = %subscription.id, "subscribed");
                    return Ok(subscription);
                }
                Err(returned) => subscriber = returned,
            }
        }
    }

    /// Ends a registration. Unknown or already-closed subscriptions are a no-op.
    pub fn unsubscribe(&self, subscription: &Subscription) {
        if let Some(registration) = self.inner.remove(subscription) {
            debug!(poll_id = %subscription.poll_id, subscription = %subscription.id, "unsubscribed");
            // Dropping the sender ends the delivery task, which closes the subscriber.
            drop(registration);
        }
    }

    /// Schedules a fresh snapshot of `poll_id` for everyone watching it.
    ///
    /// Returns immediately. Failures are logged and never reach the voter.
    pub fn on_vote_recorded(&self, poll_id: &PollId, option_id: &OptionId, new_count: u64) {
        let Some(topic) = self.inner.topic(poll_id) else {
            trace!(poll_id = %poll_id, "no observers for vote");
            return;
        };
        trace!(poll_id = %poll_id, option_id = %option_id, new_count, "vote recorded");
        if !topic.mark_dirty() {
            return;
        }

        let inner = self.inner.clone();
        let poll_id = poll_id.clone();
        tokio::spawn(async move {
            loop {
                inner.refresh(&poll_id, &topic).await;
                if !topic.finish_round() {
                    break;
                }
            }
        });
    }

    pub fn subscriber_count(&self, poll_id: &PollId) -> usize {
        self.inner
            .topic(poll_id)
            .map(|topic| topic.registry().registrations.len())
            .unwrap_or(0)
    }

    /// Refuses new subscriptions, ends every registration and waits up to
    /// `grace` for subscribers to be closed.
    pub async fn shutdown(&self, grace: Duration) {
        self.inner.closing.store(true, Ordering::Release);

        let topics: Vec<Arc<PollTopic>> = self
            .inner
            .topics
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, topic)| topic)
            .collect();

        let mut tasks = Vec::new();
        for topic in topics {
            let mut registry = topic.registry();
            registry.retired = true;
            tasks.extend(registry.registrations.drain().map(|(_, r)| r.task));
        }

        info!(subscribers = tasks.len(), "draining subscribers");
        let aborts: Vec<_> = tasks.iter().map(JoinHandle::abort_handle).collect();
        if tokio::time::timeout(grace, futures::future::join_all(tasks))
            .await
            .is_err()
        {
            warn!(?grace, "subscribers did not close in time, aborting");
            for abort in aborts {
                abort.abort();
            }
        }
    }
}

async fn deliver(
    hub: Weak<HubInner>,
    subscription: Subscription,
    subscriber: Box<dyn Subscriber>,
    initial: Arc<TallySnapshot>,
    mut updates: watch::Receiver<Arc<TallySnapshot>>,
    idle_timeout: Option<Duration>,
) {
    let reason = run_delivery(subscriber.as_ref(), initial, &mut updates, idle_timeout).await;
    debug!(
        poll_id = %subscription.poll_id,
        subscription = %subscription.id,
        ?reason,
        "subscriber closed"
    );

    if let Some(hub) = hub.upgrade() {
        hub.remove(&subscription);
    }
    subscriber.close().await;
}

// The subscription-time snapshot always goes out first; the channel starts
// out seen, so anything published meanwhile follows as a change.
async fn run_delivery(
    subscriber: &dyn Subscriber,
    initial: Arc<TallySnapshot>,
    updates: &mut watch::Receiver<Arc<TallySnapshot>>,
    idle_timeout: Option<Duration>,
) -> CloseReason {
    let mut snapshot = initial;
    loop {
        tokio::select! {
            sent = subscriber.send(snapshot) => {
                if let Err(e) = sent {
                    warn!(error = %e, "snapshot delivery failed");
                    return CloseReason::DeliveryFailed;
                }
            }
            _ = subscriber.closed() => return CloseReason::Disconnected,
        }

        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    return CloseReason::Unsubscribed;
                }
            }
            _ = subscriber.closed() => return CloseReason::Disconnected,
            _ = idle(idle_timeout) => return CloseReason::IdleTimeout,
        }
        snapshot = Arc::clone(&updates.borrow_and_update());
    }
}

async fn idle(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => tokio::time::sleep(timeout).await,
        None => futures::future::pending().await,
    }
}
