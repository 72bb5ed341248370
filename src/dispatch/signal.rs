//! In-process signals with concurrent fan-out.
//!
//! A receiver is registered under a receiver key for one sender. Sending
//! runs every receiver registered for that sender concurrently and returns
//! once all of them finished.

use std::any::Any;
use std::borrow::Cow;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use futures_util::future::{join_all, BoxFuture};

use crate::error::SignalError;
use crate::model::{ModelTypeId, Schema};

/// Identity of a sender: a model type or a free-form name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SenderKey {
    /// Instances of one model type.
    Model(ModelTypeId),
    /// A free-form name.
    Named(Cow<'static, str>),
}

impl From<&Schema> for SenderKey {
    fn from(schema: &Schema) -> Self {
        Self::Model(schema.id())
    }
}

impl From<&Arc<Schema>> for SenderKey {
    fn from(schema: &Arc<Schema>) -> Self {
        Self::Model(schema.id())
    }
}

impl From<ModelTypeId> for SenderKey {
    fn from(id: ModelTypeId) -> Self {
        Self::Model(id)
    }
}

impl From<&'static str> for SenderKey {
    fn from(name: &'static str) -> Self {
        Self::Named(Cow::Borrowed(name))
    }
}

impl From<String> for SenderKey {
    fn from(name: String) -> Self {
        Self::Named(Cow::Owned(name))
    }
}

impl fmt::Display for SenderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Model(id) => write!(f, "{id}"),
            Self::Named(name) => f.write_str(name),
        }
    }
}

/// Identity of a receiver.
pub type ReceiverKey = Cow<'static, str>;

/// Handle returned by `connect`; pass it to `disconnect` on teardown.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    receiver: ReceiverKey,
    sender: SenderKey,
}

impl Subscription {
    /// Key of the receiver.
    #[must_use]
    pub fn receiver(&self) -> &str {
        &self.receiver
    }

    /// Sender the receiver listens to.
    #[must_use]
    pub const fn sender(&self) -> &SenderKey {
        &self.sender
    }
}

type ReceiverResult<R> = BoxFuture<'static, anyhow::Result<R>>;
type ReceiverFn<P, R> = Arc<dyn Fn(Arc<P>) -> Option<ReceiverResult<R>> + Send + Sync>;

struct Entry<P, R> {
    subscription: Subscription,
    call: ReceiverFn<P, R>,
    owner: Option<Weak<dyn Any + Send + Sync>>,
}

impl<P, R> Entry<P, R> {
    fn is_alive(&self) -> bool {
        self.owner.as_ref().map_or(true, |owner| owner.strong_count() > 0)
    }
}

/// A typed signal carrying payloads of type `P` to receivers returning `R`.
pub struct Signal<P, R = ()> {
    name: &'static str,
    receivers: RwLock<Vec<Entry<P, R>>>,
}

impl<P, R> Signal<P, R>
where
    P: Send + Sync + 'static,
    R: Send + 'static,
{
    /// Signal named `name` with no receivers.
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            receivers: RwLock::new(Vec::new()),
        }
    }

    /// Signal name, used in logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Entry<P, R>>> {
        self.receivers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Entry<P, R>>> {
        self.receivers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn register(
        &self,
        subscription: Subscription,
        call: ReceiverFn<P, R>,
        owner: Option<Weak<dyn Any + Send + Sync>>,
    ) -> Subscription {
        let mut receivers = self.write();
        if let Some(existing) = receivers
            .iter()
            .find(|e| e.subscription == subscription && e.is_alive())
        {
            return existing.subscription.clone();
        }
        receivers.retain(|e| e.subscription != subscription);
        tracing::info!(
            signal = self.name,
            receiver = %subscription.receiver,
            sender = %subscription.sender,
            "receiver connected"
        );
        receivers.push(Entry {
            subscription: subscription.clone(),
            call,
            owner,
        });
        subscription
    }

    /// Registers `receiver` for payloads sent by `sender`. Connecting the same
    /// receiver key for the same sender again is a no-op that returns the
    /// existing subscription.
    pub fn connect<F, Fut>(
        &self,
        receiver: impl Into<ReceiverKey>,
        sender: impl Into<SenderKey>,
        f: F,
    ) -> Subscription
    where
        F: Fn(Arc<P>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        let subscription = Subscription {
            receiver: receiver.into(),
            sender: sender.into(),
        };
        let call: ReceiverFn<P, R> = Arc::new(move |payload| -> Option<ReceiverResult<R>> {
            Some(Box::pin(f(payload)))
        });
        self.register(subscription, call, None)
    }

    /// Registers a receiver bound to `owner` without keeping it alive. Once
    /// the owner is dropped the receiver is skipped and later pruned.
    pub fn connect_owned<T, F, Fut>(
        &self,
        receiver: impl Into<ReceiverKey>,
        sender: impl Into<SenderKey>,
        owner: &Arc<T>,
        f: F,
    ) -> Subscription
    where
        T: Send + Sync + 'static,
        F: Fn(Arc<T>, Arc<P>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        let subscription = Subscription {
            receiver: receiver.into(),
            sender: sender.into(),
        };
        let weak: Weak<T> = Arc::downgrade(owner);
        let liveness: Weak<dyn Any + Send + Sync> = weak.clone();
        let call: ReceiverFn<P, R> = Arc::new(move |payload| -> Option<ReceiverResult<R>> {
            let owner = weak.upgrade()?;
            Some(Box::pin(f(owner, payload)))
        });
        self.register(subscription, call, Some(liveness))
    }

    /// Removes a subscription. Returns whether it was registered.
    pub fn disconnect(&self, subscription: &Subscription) -> bool {
        let mut receivers = self.write();
        let before = receivers.len();
        receivers.retain(|e| &e.subscription != subscription);
        let removed = receivers.len() != before;
        if removed {
            tracing::info!(
                signal = self.name,
                receiver = %subscription.receiver,
                sender = %subscription.sender,
                "receiver disconnected"
            );
        }
        removed
    }

    /// Number of live receivers registered for `sender`.
    #[must_use]
    pub fn receiver_count(&self, sender: impl Into<SenderKey>) -> usize {
        let sender = sender.into();
        self.read()
            .iter()
            .filter(|e| e.subscription.sender == sender && e.is_alive())
            .count()
    }

    /// Starts every live receiver for `sender`, dropping entries whose owner
    /// is gone.
    fn start(&self, sender: &SenderKey, payload: P) -> Vec<(ReceiverKey, ReceiverResult<R>)> {
        let calls: Vec<(ReceiverKey, ReceiverFn<P, R>)> = self
            .read()
            .iter()
            .filter(|e| &e.subscription.sender == sender)
            .map(|e| (e.subscription.receiver.clone(), Arc::clone(&e.call)))
            .collect();
        if calls.is_empty() {
            return Vec::new();
        }

        let payload = Arc::new(payload);
        let mut started = Vec::with_capacity(calls.len());
        let mut dead = false;
        for (key, call) in calls {
            match call(Arc::clone(&payload)) {
                Some(fut) => started.push((key, fut)),
                None => dead = true,
            }
        }
        if dead {
            self.write().retain(Entry::is_alive);
        }
        started
    }

    /// Runs all receivers for `sender` concurrently and waits for all of
    /// them. Results follow registration order.
    ///
    /// # Errors
    ///
    /// Returns the first failure in registration order once every receiver
    /// has finished.
    pub async fn send(&self, sender: impl Into<SenderKey>, payload: P) -> Result<Vec<R>, SignalError> {
        let started = self.start(&sender.into(), payload);
        if started.is_empty() {
            return Ok(Vec::new());
        }
        let (keys, futures): (Vec<_>, Vec<_>) = started.into_iter().unzip();
        let outcomes = join_all(futures).await;
        keys.into_iter()
            .zip(outcomes)
            .map(|(receiver, outcome)| {
                outcome.map_err(|error| SignalError {
                    receiver: receiver.into_owned(),
                    error,
                })
            })
            .collect()
    }

    /// Like `send`, but reports every receiver's outcome individually so a
    /// failing receiver does not hide the others' results.
    pub async fn send_robust(
        &self,
        sender: impl Into<SenderKey>,
        payload: P,
    ) -> Vec<(ReceiverKey, anyhow::Result<R>)> {
        let started = self.start(&sender.into(), payload);
        if started.is_empty() {
            return Vec::new();
        }
        let (keys, futures): (Vec<_>, Vec<_>) = started.into_iter().unzip();
        keys.into_iter().zip(join_all(futures).await).collect()
    }
}

impl<P, R> fmt::Debug for Signal<P, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let receivers = self.receivers.read().map_or(0, |r| r.len());
        f.debug_struct("Signal")
            .field("name", &self.name)
            .field("receivers", &receivers)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::field::Field;
    use crate::model::SchemaBuilder;

    #[tokio::test]
    async fn test_send_without_receivers_is_empty() {
        let signal: Signal<u32, u32> = Signal::new("noop");
        assert!(signal.send("nobody", 1).await.unwrap().is_empty());
        assert!(signal.send_robust("nobody", 1).await.is_empty());
    }

    #[tokio::test]
    async fn test_connect_is_idempotent_per_sender() {
        let signal: Signal<u32, u32> = Signal::new("dedupe");
        let first = signal.connect("double", "a", |n: Arc<u32>| async move { Ok(*n * 2) });
        let again = signal.connect("double", "a", |n: Arc<u32>| async move { Ok(*n * 3) });
        assert_eq!(first, again);
        assert_eq!(signal.receiver_count("a"), 1);
        assert_eq!(signal.send("a", 4).await.unwrap(), vec![8]);

        signal.connect("double", "b", |n: Arc<u32>| async move { Ok(*n) });
        assert_eq!(signal.receiver_count("b"), 1);
    }

    #[tokio::test]
    async fn test_only_matching_sender_receives() {
        let schema = SchemaBuilder::new("Hat")
            .field("sku", Field::string())
            .build()
            .unwrap();
        let other = SchemaBuilder::new("Shoe").build().unwrap();
        let signal: Signal<&'static str, &'static str> = Signal::new("typed");
        signal.connect("hat", &schema, |_p: Arc<&'static str>| async { Ok("hat") });

        assert_eq!(signal.send(&schema, "x").await.unwrap(), vec!["hat"]);
        assert!(signal.send(&other, "x").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_receivers_run_concurrently() {
        let signal: Signal<(), usize> = Signal::new("gather");
        let running = Arc::new(AtomicUsize::new(0));
        for i in 0..3 {
            let running = Arc::clone(&running);
            signal.connect(format!("r{i}"), "s", move |_p: Arc<()>| {
                let running = Arc::clone(&running);
                async move {
                    running.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok(running.load(Ordering::SeqCst))
                }
            });
        }
        let seen = signal.send("s", ()).await.unwrap();
        assert_eq!(seen, vec![3, 3, 3]);
    }

    #[tokio::test]
    async fn test_send_reports_failure_after_all_ran() {
        let signal: Signal<(), u8> = Signal::new("failing");
        let ran = Arc::new(AtomicUsize::new(0));
        signal.connect("bad", "s", |_p: Arc<()>| async { Err(anyhow::anyhow!("boom")) });
        let counter = Arc::clone(&ran);
        signal.connect("good", "s", move |_p: Arc<()>| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(7)
            }
        });

        let err = signal.send("s", ()).await.unwrap_err();
        assert_eq!(err.receiver, "bad");
        assert_eq!(ran.load(Ordering::SeqCst), 1);

        let outcomes = signal.send_robust("s", ()).await;
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes[0].1.is_err());
        assert_eq!(outcomes[1].1.as_ref().ok(), Some(&7));
    }

    #[tokio::test]
    async fn test_owned_receiver_dropped_with_owner() {
        struct Audit {
            seen: AtomicUsize,
        }

        let signal: Signal<u32> = Signal::new("owned");
        let audit = Arc::new(Audit {
            seen: AtomicUsize::new(0),
        });
        signal.connect_owned("audit", "s", &audit, |owner: Arc<Audit>, _p: Arc<u32>| async move {
            owner.seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        signal.send("s", 1).await.unwrap();
        assert_eq!(audit.seen.load(Ordering::SeqCst), 1);

        drop(audit);
        assert_eq!(signal.receiver_count("s"), 0);
        assert!(signal.send("s", 2).await.unwrap().is_empty());
        assert_eq!(signal.read().len(), 0);
    }

    #[tokio::test]
    async fn test_disconnect() {
        let signal: Signal<u32> = Signal::new("disconnect");
        let sub = signal.connect("r", "s", |_p: Arc<u32>| async { Ok(()) });
        assert_eq!(sub.receiver(), "r");
        assert!(signal.disconnect(&sub));
        assert!(!signal.disconnect(&sub));
        assert_eq!(signal.receiver_count("s"), 0);
    }
}
