//! Priority-based outgoing message queue.
//!
//! Messages are bucketed by [`Priority`] and pulled by weighted round-robin
//! (HIGH 4, MEDIUM 2, LOW 1). The weights are laid out as a fixed cycle of
//! slots; each pull moves a persistent cursor to the next slot whose bucket
//! is non-empty. A non-empty bucket is therefore passed over at most as many
//! times as the other buckets have slots: 3 for HIGH, 5 for MEDIUM, 6 for LOW.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot, Notify};

use crate::error::{Result, SyncError};
use crate::messages::{Priority, SyncMessage};

/// Slot cycle realising the 4:2:1 weights.
const SLOTS: [Priority; 7] = [
    Priority::High,
    Priority::High,
    Priority::High,
    Priority::High,
    Priority::Medium,
    Priority::Medium,
    Priority::Low,
];

/// Resolves once the message has been handed to the transport.
#[must_use = "dropping a Dispatch does not cancel the send"]
pub struct Dispatch {
    rx: oneshot::Receiver<Result<()>>,
}

impl Future for Dispatch {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(SyncError::Disconnected)))
    }
}

/// A queued message with its completion handle.
pub struct Pending {
    pub message: SyncMessage,
    done: oneshot::Sender<Result<()>>,
}

impl Pending {
    /// Resolve the sender's [`Dispatch`].
    pub fn complete(self, result: Result<()>) {
        let _ = self.done.send(result);
    }

    fn split(self) -> (SyncMessage, oneshot::Sender<Result<()>>) {
        (self.message, self.done)
    }
}

#[derive(Default)]
struct QueueInner {
    buckets: [VecDeque<Pending>; 3],
    cursor: usize,
    closed: bool,
}

/// Fair, starvation-free scheduler for one peer's outgoing messages.
#[derive(Default)]
pub struct PriorityBasedMessageQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl PriorityBasedMessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a message. Returns a future resolving when it is dispatched,
    /// or with [`SyncError::Disconnected`] if the queue is closed first.
    pub fn push(&self, message: SyncMessage) -> Dispatch {
        let (done, rx) = oneshot::channel();
        let pending = Pending { message, done };
        match self.inner.lock() {
            Ok(mut inner) if !inner.closed => {
                let bucket = pending.message.priority().index();
                inner.buckets[bucket].push_back(pending);
                drop(inner);
                self.notify.notify_one();
            }
            _ => pending.complete(Err(SyncError::Disconnected)),
        }
        Dispatch { rx }
    }

    /// Take the next message according to the slot cycle, if any.
    pub fn pull(&self) -> Option<Pending> {
        let mut inner = self.inner.lock().ok()?;
        if inner.buckets.iter().all(VecDeque::is_empty) {
            return None;
        }
        for _ in 0..SLOTS.len() {
            let slot = SLOTS[inner.cursor];
            inner.cursor = (inner.cursor + 1) % SLOTS.len();
            if let Some(pending) = inner.buckets[slot.index()].pop_front() {
                return Some(pending);
            }
        }
        None
    }

    /// Wait for the next message; `None` once the queue is closed.
    pub async fn next(&self) -> Option<Pending> {
        loop {
            if let Some(pending) = self.pull() {
                return Some(pending);
            }
            if self.is_closed() {
                return None;
            }
            self.notify.notified().await;
        }
    }

    /// Close the queue, resolving everything still queued as disconnected.
    pub fn close(&self) {
        let drained: Vec<Pending> = match self.inner.lock() {
            Ok(mut inner) => {
                inner.closed = true;
                inner.buckets.iter_mut().flat_map(|b| b.drain(..)).collect()
            }
            Err(_) => Vec::new(),
        };
        for pending in drained {
            pending.complete(Err(SyncError::Disconnected));
        }
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().map(|i| i.closed).unwrap_or(true)
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .map(|i| i.buckets.iter().map(VecDeque::len).sum())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Move messages from the queue into a peer's outgoing channel.
///
/// The bounded channel provides backpressure: a message is only counted as
/// dispatched once the channel accepted it. Ends when the queue is closed or
/// the channel's receiver is gone (which closes the queue).
pub async fn run_dispatcher(queue: Arc<PriorityBasedMessageQueue>, outgoing: mpsc::Sender<SyncMessage>) {
    while let Some(pending) = queue.next().await {
        let (message, done) = pending.split();
        match outgoing.send(message).await {
            Ok(()) => {
                let _ = done.send(Ok(()));
            }
            Err(_) => {
                let _ = done.send(Err(SyncError::Disconnected));
                queue.close();
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use covalent_core::{CoId, KnownState};
    use crate::messages::ContentMessage;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    fn content(byte: u8, priority: Priority) -> SyncMessage {
        SyncMessage::Content(ContentMessage {
            id: CoId([byte; 32]),
            header: None,
            new: BTreeMap::new(),
            priority,
        })
    }

    fn drain(queue: &PriorityBasedMessageQueue) -> Vec<Priority> {
        std::iter::from_fn(|| queue.pull())
            .map(|p| p.message.priority())
            .collect()
    }

    #[test]
    fn test_weighted_round_robin_order() {
        let queue = PriorityBasedMessageQueue::new();
        for i in 0..5 {
            let _ = queue.push(content(i, Priority::High));
        }
        for i in 0..3 {
            let _ = queue.push(content(10 + i, Priority::Medium));
        }
        for i in 0..3 {
            let _ = queue.push(content(20 + i, Priority::Low));
        }

        use Priority::{High as H, Low as L, Medium as M};
        assert_eq!(drain(&queue), vec![H, H, H, H, M, M, L, H, M, L, L]);
    }

    #[test]
    fn test_fifo_within_bucket() {
        let queue = PriorityBasedMessageQueue::new();
        let _ = queue.push(content(1, Priority::Medium));
        let _ = queue.push(content(2, Priority::Medium));
        assert_eq!(*queue.pull().unwrap().message.id(), CoId([1; 32]));
        assert_eq!(*queue.pull().unwrap().message.id(), CoId([2; 32]));
    }

    #[test]
    fn test_control_messages_are_high() {
        let queue = PriorityBasedMessageQueue::new();
        let _ = queue.push(content(1, Priority::Low));
        let _ = queue.push(SyncMessage::Load(KnownState::empty(CoId([2; 32]))));
        assert_eq!(queue.pull().unwrap().message.action(), "load");
    }

    #[test]
    fn test_low_is_never_starved_beyond_bound() {
        let queue = PriorityBasedMessageQueue::new();
        let _ = queue.push(content(0, Priority::Low));
        let mut skipped = 0;
        loop {
            // Keep the other buckets full.
            let _ = queue.push(content(1, Priority::High));
            let _ = queue.push(content(2, Priority::Medium));
            let pulled = queue.pull().unwrap();
            if pulled.message.priority() == Priority::Low {
                break;
            }
            skipped += 1;
        }
        assert!(skipped <= 6);
    }

    #[derive(Debug, Clone)]
    enum Step {
        Push(Priority),
        Pull,
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            2 => prop_oneof![
                Just(Priority::High),
                Just(Priority::Medium),
                Just(Priority::Low),
            ]
            .prop_map(Step::Push),
            1 => Just(Step::Pull),
        ]
    }

    fn numbered(n: u32, priority: Priority) -> SyncMessage {
        let mut bytes = [0u8; 32];
        bytes[..4].copy_from_slice(&n.to_be_bytes());
        SyncMessage::Content(ContentMessage {
            id: CoId(bytes),
            header: None,
            new: BTreeMap::new(),
            priority,
        })
    }

    proptest! {
        /// However pushes and pulls interleave, every message comes out once,
        /// in order within its bucket, and a waiting bucket is passed over at
        /// most 3 (HIGH), 5 (MEDIUM) or 6 (LOW) pulls in a row.
        #[test]
        fn test_interleaved_pulls_stay_fair(steps in proptest::collection::vec(step(), 0..200)) {
            let queue = PriorityBasedMessageQueue::new();
            let bound = [3usize, 5, 6];
            let mut expected: [VecDeque<CoId>; 3] = Default::default();
            let mut skipped = [0usize; 3];
            let mut next = 0u32;

            for step in steps {
                match step {
                    Step::Push(priority) => {
                        let message = numbered(next, priority);
                        next += 1;
                        expected[priority.index()].push_back(*message.id());
                        let _ = queue.push(message);
                    }
                    Step::Pull => {
                        let Some(pending) = queue.pull() else {
                            prop_assert!(expected.iter().all(VecDeque::is_empty));
                            continue;
                        };
                        let served = pending.message.priority().index();
                        prop_assert_eq!(expected[served].pop_front(), Some(*pending.message.id()));
                        for bucket in 0..3 {
                            if bucket == served || expected[bucket].is_empty() {
                                skipped[bucket] = 0;
                            } else {
                                skipped[bucket] += 1;
                                prop_assert!(skipped[bucket] <= bound[bucket]);
                            }
                        }
                    }
                }
            }
        }
    }

    #[tokio::test]
    async fn test_push_resolves_on_dispatch() {
        let queue = Arc::new(PriorityBasedMessageQueue::new());
        let (tx, mut rx) = mpsc::channel(4);
        let dispatcher = tokio::spawn(run_dispatcher(Arc::clone(&queue), tx));

        let sent = queue.push(content(1, Priority::Medium));
        sent.await.unwrap();
        assert_eq!(*rx.recv().await.unwrap().id(), CoId([1; 32]));

        queue.close();
        dispatcher.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_resolves_pending_as_disconnected() {
        let queue = PriorityBasedMessageQueue::new();
        let pending = queue.push(content(1, Priority::Low));
        queue.close();
        assert!(matches!(pending.await, Err(SyncError::Disconnected)));

        let after = queue.push(content(2, Priority::Low));
        assert!(matches!(after.await, Err(SyncError::Disconnected)));
        assert!(queue.next().await.is_none());
    }

    #[tokio::test]
    async fn test_dispatcher_stops_when_receiver_is_gone() {
        let queue = Arc::new(PriorityBasedMessageQueue::new());
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let dispatcher = tokio::spawn(run_dispatcher(Arc::clone(&queue), tx));

        let sent = queue.push(content(1, Priority::High));
        assert!(matches!(sent.await, Err(SyncError::Disconnected)));
        dispatcher.await.unwrap();
        assert!(queue.is_closed());
    }
}
