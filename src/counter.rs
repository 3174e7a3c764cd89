use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::engine::{Engine, EngineError};
use crate::model::Event;
use crate::notify::{Channel, NotifyHub};

/// Where a counter reads the current unread total from.
#[async_trait]
pub trait UnreadSource: Send + Sync + 'static {
    async fn count_unread(&self, user_id: Ulid) -> Result<usize, EngineError>;
}

#[async_trait]
impl UnreadSource for Engine {
    async fn count_unread(&self, user_id: Ulid) -> Result<usize, EngineError> {
        self.unread_count(&user_id).await
    }
}

/// How often a counter with no known value retries its read while the inbox is quiet.
const UNKNOWN_RETRY: Duration = Duration::from_secs(1);

/// A user's live unread-notification count.
///
/// Every change on the user's inbox channel triggers a fresh count from the
/// source; nothing is incremented or decremented locally, so a missed or
/// reordered event cannot make the number drift. The value is `None` until
/// the first read succeeds, and a later failed read keeps the last good value.
/// The background task lives until [`UnreadCounter::unsubscribe`] or drop.
pub struct UnreadCounter {
    user_id: Ulid,
    rx: watch::Receiver<Option<usize>>,
    task: Option<JoinHandle<()>>,
}

/// The counter task's inbox subscription. Dropping it, including when the
/// task is aborted, closes the hub channel if nobody else listens.
struct InboxFeed {
    // Declared first so the receiver is gone before `release` runs.
    events: broadcast::Receiver<Event>,
    release: ReleaseChannel,
}

struct ReleaseChannel {
    hub: Arc<NotifyHub>,
    channel: Channel,
}

impl Drop for ReleaseChannel {
    fn drop(&mut self) {
        self.hub.remove_if_idle(self.channel);
    }
}

impl UnreadCounter {
    pub async fn subscribe<S: UnreadSource>(source: Arc<S>, hub: Arc<NotifyHub>, user_id: Ulid) -> Self {
        let channel = Channel::Inbox(user_id);
        // Subscribe before the first read so a change landing in between is not lost.
        let mut feed = InboxFeed {
            events: hub.subscribe(channel),
            release: ReleaseChannel { hub, channel },
        };
        let initial = match source.count_unread(user_id).await {
            Ok(n) => Some(n),
            Err(e) => {
                warn!("initial unread count for {user_id} failed, retrying: {e}");
                None
            }
        };
        let (tx, rx) = watch::channel(initial);

        let task = tokio::spawn(async move {
            loop {
                let known = tx.borrow().is_some();
                let woke = if known {
                    Some(feed.events.recv().await)
                } else {
                    tokio::select! {
                        r = feed.events.recv() => Some(r),
                        () = tokio::time::sleep(UNKNOWN_RETRY) => None,
                    }
                };
                match woke {
                    Some(Ok(_)) | None => {}
                    // Missed events only mean we recount, which we do anyway.
                    Some(Err(RecvError::Lagged(skipped))) => debug!("{} lagged by {skipped}", feed.release.channel),
                    Some(Err(RecvError::Closed)) => break,
                }
                match source.count_unread(user_id).await {
                    Ok(n) => {
                        tx.send_replace(Some(n));
                    }
                    Err(e) => warn!(
                        "unread count for {user_id} unavailable, keeping {:?}: {e}",
                        *tx.borrow()
                    ),
                }
            }
        });

        Self {
            user_id,
            rx,
            task: Some(task),
        }
    }

    pub fn user_id(&self) -> Ulid {
        self.user_id
    }

    /// Last known count, `None` while no read has succeeded yet.
    pub fn get(&self) -> Option<usize> {
        *self.rx.borrow()
    }

    /// Wait for the next recomputed value. `None` once the counter has stopped.
    pub async fn changed(&mut self) -> Option<usize> {
        self.rx.changed().await.ok()?;
        *self.rx.borrow_and_update()
    }

    /// An independent handle on the same value, e.g. for a badge renderer.
    pub fn watch(&self) -> watch::Receiver<Option<usize>> {
        self.rx.clone()
    }

    /// Stop recomputing and release the inbox subscription. Once this returns
    /// no further reads are issued for this user on the counter's behalf and
    /// the channel is gone unless someone else still listens.
    pub async fn unsubscribe(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
    }
}

impl Drop for UnreadCounter {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::model::Event;

    /// Serves a settable count and can be told to fail.
    struct FlakySource {
        count: AtomicUsize,
        failing: AtomicBool,
        reads: AtomicUsize,
    }

    impl FlakySource {
        fn new(count: usize) -> Arc<Self> {
            Arc::new(Self {
                count: AtomicUsize::new(count),
                failing: AtomicBool::new(false),
                reads: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl UnreadSource for FlakySource {
        async fn count_unread(&self, _user_id: Ulid) -> Result<usize, EngineError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(EngineError::StoreUnavailable("down".into()));
            }
            Ok(self.count.load(Ordering::SeqCst))
        }
    }

    fn poke(hub: &NotifyHub, user_id: Ulid) {
        hub.send(Channel::Inbox(user_id), &Event::AllNotificationsRead { user_id });
    }

    async fn next(counter: &mut UnreadCounter) -> usize {
        tokio::time::timeout(Duration::from_secs(2), counter.changed())
            .await
            .expect("counter did not update")
            .expect("counter stopped")
    }

    #[tokio::test]
    async fn recomputes_on_every_change() {
        let hub = Arc::new(NotifyHub::new());
        let source = FlakySource::new(3);
        let user_id = Ulid::new();
        let mut counter = UnreadCounter::subscribe(source.clone(), hub.clone(), user_id).await;
        assert_eq!(counter.get(), Some(3));

        source.count.store(5, Ordering::SeqCst);
        poke(&hub, user_id);
        assert_eq!(next(&mut counter).await, 5);

        source.count.store(1, Ordering::SeqCst);
        poke(&hub, user_id);
        assert_eq!(next(&mut counter).await, 1);
    }

    #[tokio::test]
    async fn failed_read_keeps_previous_value() {
        let hub = Arc::new(NotifyHub::new());
        let source = FlakySource::new(4);
        let user_id = Ulid::new();
        let counter = UnreadCounter::subscribe(source.clone(), hub.clone(), user_id).await;

        source.failing.store(true, Ordering::SeqCst);
        poke(&hub, user_id);
        // Wait until the failed recount has happened.
        tokio::time::timeout(Duration::from_secs(2), async {
            while source.reads.load(Ordering::SeqCst) < 2 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(counter.get(), Some(4));
    }

    #[tokio::test]
    async fn unknown_until_first_read_succeeds() {
        let hub = Arc::new(NotifyHub::new());
        let source = FlakySource::new(6);
        source.failing.store(true, Ordering::SeqCst);
        let user_id = Ulid::new();
        let mut counter = UnreadCounter::subscribe(source.clone(), hub.clone(), user_id).await;
        assert_eq!(counter.get(), None);

        // The read is retried without waiting for an inbox change.
        source.failing.store(false, Ordering::SeqCst);
        let value = tokio::time::timeout(UNKNOWN_RETRY * 5, counter.changed())
            .await
            .expect("counter did not recover")
            .expect("counter stopped");
        assert_eq!(value, 6);
        assert_eq!(counter.get(), Some(6));
    }

    #[tokio::test]
    async fn unsubscribe_releases_channel() {
        let hub = Arc::new(NotifyHub::new());
        let source = FlakySource::new(0);
        let user_id = Ulid::new();
        let counter = UnreadCounter::subscribe(source.clone(), hub.clone(), user_id).await;
        assert_eq!(hub.receiver_count(Channel::Inbox(user_id)), 1);

        counter.unsubscribe().await;
        assert_eq!(hub.receiver_count(Channel::Inbox(user_id)), 0);
        assert_eq!(hub.channel_count(), 0);

        let reads = source.reads.load(Ordering::SeqCst);
        poke(&hub, user_id);
        tokio::task::yield_now().await;
        assert_eq!(source.reads.load(Ordering::SeqCst), reads);
    }

    #[tokio::test]
    async fn drop_releases_channel() {
        let hub = Arc::new(NotifyHub::new());
        let user_id = Ulid::new();
        let counter = UnreadCounter::subscribe(FlakySource::new(0), hub.clone(), user_id).await;
        assert_eq!(hub.channel_count(), 1);

        drop(counter);
        // The aborted task lets go of its subscription on its next poll.
        tokio::time::timeout(Duration::from_secs(2), async {
            while hub.channel_count() > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("channel still open after drop");
        assert_eq!(hub.receiver_count(Channel::Inbox(user_id)), 0);
    }

    #[tokio::test]
    async fn shared_channel_outlives_one_counter() {
        let hub = Arc::new(NotifyHub::new());
        let user_id = Ulid::new();
        let first = UnreadCounter::subscribe(FlakySource::new(0), hub.clone(), user_id).await;
        let second = UnreadCounter::subscribe(FlakySource::new(0), hub.clone(), user_id).await;

        first.unsubscribe().await;
        assert_eq!(hub.channel_count(), 1);
        assert_eq!(hub.receiver_count(Channel::Inbox(user_id)), 1);

        second.unsubscribe().await;
        assert_eq!(hub.channel_count(), 0);
    }

    #[tokio::test]
    async fn watchers_see_updates() {
        let hub = Arc::new(NotifyHub::new());
        let source = FlakySource::new(0);
        let user_id = Ulid::new();
        let counter = UnreadCounter::subscribe(source.clone(), hub.clone(), user_id).await;
        let mut badge = counter.watch();

        source.count.store(2, Ordering::SeqCst);
        poke(&hub, user_id);
        tokio::time::timeout(Duration::from_secs(2), badge.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*badge.borrow(), Some(2));
        drop(counter);
    }
}
