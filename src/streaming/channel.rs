//! Bounded per-camera frame distribution
//!
//! Decouples the encoder pump from HTTP delivery. Publishing never blocks the
//! producer. In shared mode the configured `OverflowPolicy` decides which
//! frame is lost when the queue is full; in per-subscriber mode frames go out
//! over a `tokio::sync::broadcast` channel and a lagging viewer skips its
//! oldest frames. Frames are `Bytes`, so every subscriber shares the same
//! allocation.

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::sync::Notify;
use tracing::{debug, info};

/// What happens to a frame published into a full shared queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Producer priority: the incoming frame is discarded
    #[default]
    DropNewest,
    /// The oldest buffered frame is evicted to make room
    DropOldest,
}

/// How subscribers share a camera's frames
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FanOut {
    /// Every subscriber pops from one shared queue; concurrent viewers
    /// compete for frames and may each see gaps
    #[default]
    Shared,
    /// Each subscriber receives every published frame. A subscriber that
    /// falls `capacity` frames behind loses its oldest ones, whatever the
    /// overflow policy says.
    PerSubscriber,
}

/// Result of a single `publish` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Frame queued for every recipient
    Queued,
    /// The shared queue was full and a frame was dropped
    Dropped,
    /// Per-subscriber channel with nobody listening
    NoSubscribers,
    /// Channel already closed
    Closed,
}

/// Statistics for monitoring frame distribution
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChannelStats {
    pub frames_published: u64,
    /// Frames lost to a full shared queue, or skipped by lagging subscribers
    pub frames_dropped: u64,
    pub frames_delivered: u64,
    pub buffered: usize,
    pub subscribers: usize,
    pub capacity: usize,
}

/// A bounded FIFO with an explicit overflow policy
struct FrameQueue {
    frames: Mutex<VecDeque<Bytes>>,
    notify: Notify,
    capacity: usize,
    policy: OverflowPolicy,
}

impl FrameQueue {
    fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
            policy,
        }
    }

    /// Returns false when a frame had to be dropped
    fn push(&self, frame: Bytes) -> bool {
        let accepted = {
            let mut frames = self.frames.lock();
            if frames.len() < self.capacity {
                frames.push_back(frame);
                true
            } else {
                match self.policy {
                    OverflowPolicy::DropNewest => false,
                    OverflowPolicy::DropOldest => {
                        frames.pop_front();
                        frames.push_back(frame);
                        false
                    }
                }
            }
        };
        self.notify.notify_one();
        accepted
    }

    fn pop(&self) -> Option<Bytes> {
        self.frames.lock().pop_front()
    }

    fn len(&self) -> usize {
        self.frames.lock().len()
    }
}

enum Distribution {
    /// One queue all subscribers pop from
    Shared(Arc<FrameQueue>),
    /// Taken on close so receivers drain and then see the end
    PerSubscriber(Mutex<Option<broadcast::Sender<Bytes>>>),
}

struct Shared {
    capacity: usize,
    distribution: Distribution,
    closed: AtomicBool,
    /// Wakes shared-queue receivers when the channel closes
    closed_notify: Notify,
    frames_published: AtomicU64,
    frames_dropped: AtomicU64,
    frames_delivered: AtomicU64,
    subscriber_count: AtomicU64,
}

impl Shared {
    fn record_delivery(&self) {
        self.frames_delivered.fetch_add(1, Ordering::Relaxed);
    }

    fn record_lag(&self, skipped: u64) {
        debug!(skipped, "Subscriber lagged, frames skipped");
        self.frames_dropped.fetch_add(skipped, Ordering::Relaxed);
    }
}

/// Per-camera distribution channel
#[derive(Clone)]
pub struct FrameChannel {
    shared: Arc<Shared>,
}

impl FrameChannel {
    /// Creates a channel buffering at most `capacity` frames per queue
    pub fn new(capacity: usize, policy: OverflowPolicy, fan_out: FanOut) -> Self {
        let capacity = capacity.max(1);

        debug!(capacity, ?policy, ?fan_out, "Frame channel created");

        let distribution = match fan_out {
            FanOut::Shared => Distribution::Shared(Arc::new(FrameQueue::new(capacity, policy))),
            FanOut::PerSubscriber => {
                let (sender, _) = broadcast::channel(capacity);
                Distribution::PerSubscriber(Mutex::new(Some(sender)))
            }
        };

        Self {
            shared: Arc::new(Shared {
                capacity,
                distribution,
                closed: AtomicBool::new(false),
                closed_notify: Notify::new(),
                frames_published: AtomicU64::new(0),
                frames_dropped: AtomicU64::new(0),
                frames_delivered: AtomicU64::new(0),
                subscriber_count: AtomicU64::new(0),
            }),
        }
    }

    /// Publishes a frame without ever blocking the caller
    pub fn publish(&self, frame: Bytes) -> PublishOutcome {
        let shared = &self.shared;
        if shared.closed.load(Ordering::Acquire) {
            return PublishOutcome::Closed;
        }

        let outcome = match &shared.distribution {
            Distribution::Shared(queue) => {
                if queue.push(frame) {
                    PublishOutcome::Queued
                } else {
                    shared.frames_dropped.fetch_add(1, Ordering::Relaxed);
                    PublishOutcome::Dropped
                }
            }
            Distribution::PerSubscriber(sender) => {
                let guard = sender.lock();
                let Some(sender) = &*guard else {
                    return PublishOutcome::Closed;
                };
                match sender.send(frame) {
                    Ok(_) => PublishOutcome::Queued,
                    Err(_) => {
                        shared.frames_dropped.fetch_add(1, Ordering::Relaxed);
                        PublishOutcome::NoSubscribers
                    }
                }
            }
        };

        shared.frames_published.fetch_add(1, Ordering::Relaxed);
        outcome
    }

    /// Creates a new consumer of this camera's frames
    pub fn subscribe(&self) -> FrameSubscription {
        let shared = &self.shared;
        let source = match &shared.distribution {
            Distribution::Shared(queue) => Source::Queue(Arc::clone(queue)),
            Distribution::PerSubscriber(sender) => {
                Source::Broadcast((*sender.lock()).as_ref().map(broadcast::Sender::subscribe))
            }
        };

        let total = shared.subscriber_count.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(subscribers = total, "New frame subscriber");

        FrameSubscription {
            source,
            shared: Arc::clone(&self.shared),
        }
    }

    /// Closes the channel; receivers drain what is buffered and then end
    pub fn close(&self) {
        if !self.shared.closed.swap(true, Ordering::AcqRel) {
            if let Distribution::PerSubscriber(sender) = &self.shared.distribution {
                sender.lock().take();
            }
            self.shared.closed_notify.notify_waiters();
            let stats = self.stats();
            info!(
                published = stats.frames_published,
                dropped = stats.frames_dropped,
                delivered = stats.frames_delivered,
                "Frame channel closed"
            );
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Frames currently buffered (frames the slowest subscriber has not seen
    /// in per-subscriber mode)
    pub fn len(&self) -> usize {
        match &self.shared.distribution {
            Distribution::Shared(queue) => queue.len(),
            Distribution::PerSubscriber(sender) => (*sender.lock()).as_ref().map_or(0, |s| s.len()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get statistics about frame distribution
    pub fn stats(&self) -> ChannelStats {
        let shared = &self.shared;
        ChannelStats {
            frames_published: shared.frames_published.load(Ordering::Relaxed),
            frames_dropped: shared.frames_dropped.load(Ordering::Relaxed),
            frames_delivered: shared.frames_delivered.load(Ordering::Relaxed),
            buffered: self.len(),
            subscribers: shared.subscriber_count.load(Ordering::Relaxed) as usize,
            capacity: shared.capacity,
        }
    }
}

enum Source {
    Queue(Arc<FrameQueue>),
    /// `None` once the channel closed before or after subscribing
    Broadcast(Option<broadcast::Receiver<Bytes>>),
}

/// One consumer's view of a `FrameChannel`
pub struct FrameSubscription {
    source: Source,
    shared: Arc<Shared>,
}

impl FrameSubscription {
    /// Next frame without waiting
    pub fn try_recv(&mut self) -> Option<Bytes> {
        let frame = match &mut self.source {
            Source::Queue(queue) => queue.pop()?,
            Source::Broadcast(slot) => loop {
                let receiver = slot.as_mut()?;
                match receiver.try_recv() {
                    Ok(frame) => break frame,
                    Err(TryRecvError::Lagged(skipped)) => self.shared.record_lag(skipped),
                    Err(TryRecvError::Empty) => return None,
                    Err(TryRecvError::Closed) => {
                        *slot = None;
                        return None;
                    }
                }
            },
        };
        self.shared.record_delivery();
        Some(frame)
    }

    /// Waits for the next frame.
    ///
    /// Returns `None` once the channel is closed and this subscriber has
    /// drained what was buffered for it.
    pub async fn recv(&mut self) -> Option<Bytes> {
        let frame = match &mut self.source {
            Source::Queue(queue) => recv_queued(queue, &self.shared).await?,
            Source::Broadcast(slot) => loop {
                let receiver = slot.as_mut()?;
                match receiver.recv().await {
                    Ok(frame) => break frame,
                    Err(RecvError::Lagged(skipped)) => self.shared.record_lag(skipped),
                    Err(RecvError::Closed) => {
                        *slot = None;
                        return None;
                    }
                }
            },
        };
        self.shared.record_delivery();
        Some(frame)
    }
}

async fn recv_queued(queue: &FrameQueue, shared: &Shared) -> Option<Bytes> {
    loop {
        let frame_ready = queue.notify.notified();
        let closed = shared.closed_notify.notified();
        tokio::pin!(frame_ready, closed);
        frame_ready.as_mut().enable();
        closed.as_mut().enable();

        if let Some(frame) = queue.pop() {
            return Some(frame);
        }
        if shared.closed.load(Ordering::Acquire) {
            return None;
        }

        tokio::select! {
            _ = &mut frame_ready => {}
            _ = &mut closed => {}
        }
    }
}

impl Drop for FrameSubscription {
    fn drop(&mut self) {
        self.shared.subscriber_count.fetch_sub(1, Ordering::Relaxed);
        // A shared-queue wakeup consumed by a departing receiver goes to the next one
        if let Source::Queue(queue) = &self.source {
            if queue.len() > 0 {
                queue.notify.notify_one();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    fn frame(i: usize) -> Bytes {
        Bytes::from(format!("frame {}", i))
    }

    #[tokio::test]
    async fn test_basic_delivery_in_order() {
        let channel = FrameChannel::new(10, OverflowPolicy::DropNewest, FanOut::Shared);
        let mut rx = channel.subscribe();

        for i in 0..3 {
            assert_eq!(channel.publish(frame(i)), PublishOutcome::Queued);
        }

        for i in 0..3 {
            assert_eq!(rx.recv().await.unwrap(), frame(i));
        }
        assert_eq!(channel.stats().frames_delivered, 3);
    }

    #[test]
    fn test_drop_newest_keeps_first_frames() {
        let channel = FrameChannel::new(5, OverflowPolicy::DropNewest, FanOut::Shared);

        let outcomes: Vec<_> = (0..20).map(|i| channel.publish(frame(i))).collect();
        assert!(outcomes[..5].iter().all(|o| *o == PublishOutcome::Queued));
        assert!(outcomes[5..].iter().all(|o| *o == PublishOutcome::Dropped));

        let mut rx = channel.subscribe();
        let buffered: Vec<_> = std::iter::from_fn(|| rx.try_recv()).collect();
        assert_eq!(buffered, (0..5).map(frame).collect::<Vec<_>>());

        let stats = channel.stats();
        assert_eq!(stats.frames_published, 20);
        assert_eq!(stats.frames_dropped, 15);
    }

    #[test]
    fn test_drop_oldest_keeps_most_recent_frames() {
        let channel = FrameChannel::new(5, OverflowPolicy::DropOldest, FanOut::Shared);

        for i in 0..20 {
            channel.publish(frame(i));
        }
        assert_eq!(channel.len(), 5);

        let mut rx = channel.subscribe();
        let buffered: Vec<_> = std::iter::from_fn(|| rx.try_recv()).collect();
        assert_eq!(buffered, (15..20).map(frame).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_shared_viewers_compete_for_frames() {
        let channel = FrameChannel::new(10, OverflowPolicy::DropNewest, FanOut::Shared);
        let mut rx1 = channel.subscribe();
        let mut rx2 = channel.subscribe();

        for i in 0..4 {
            channel.publish(frame(i));
        }

        let a = rx1.try_recv().unwrap();
        let b = rx2.try_recv().unwrap();
        assert_ne!(a, b);
        assert_eq!(channel.len(), 2);
    }

    #[tokio::test]
    async fn test_per_subscriber_fan_out() {
        let channel = FrameChannel::new(10, OverflowPolicy::DropOldest, FanOut::PerSubscriber);
        assert_eq!(channel.publish(frame(0)), PublishOutcome::NoSubscribers);

        let mut rx1 = channel.subscribe();
        let mut rx2 = channel.subscribe();
        channel.publish(frame(1));
        channel.publish(frame(2));

        for rx in [&mut rx1, &mut rx2] {
            assert_eq!(rx.recv().await.unwrap(), frame(1));
            assert_eq!(rx.recv().await.unwrap(), frame(2));
        }

        drop(rx2);
        assert_eq!(channel.stats().subscribers, 1);
        assert_eq!(channel.publish(frame(3)), PublishOutcome::Queued);
        assert_eq!(rx1.recv().await.unwrap(), frame(3));
    }

    #[tokio::test]
    async fn test_lagging_subscriber_skips_oldest_and_counts_drops() {
        let channel = FrameChannel::new(4, OverflowPolicy::DropNewest, FanOut::PerSubscriber);
        let mut slow = channel.subscribe();
        let mut fast = channel.subscribe();

        let mut fast_frames = Vec::new();
        for i in 0..20 {
            assert_eq!(channel.publish(frame(i)), PublishOutcome::Queued);
            fast_frames.push(fast.try_recv().unwrap());
        }
        assert_eq!(fast_frames, (0..20).map(frame).collect::<Vec<_>>());

        let slow_frames: Vec<_> = std::iter::from_fn(|| slow.try_recv()).collect();
        assert!(slow_frames.len() < 20);
        assert_eq!(slow_frames.last(), Some(&frame(19)));

        let stats = channel.stats();
        assert_eq!(stats.frames_dropped as usize, 20 - slow_frames.len());
        assert_eq!(stats.frames_delivered as usize, 20 + slow_frames.len());
    }

    #[tokio::test]
    async fn test_per_subscriber_close_drains_then_ends() {
        let channel = FrameChannel::new(4, OverflowPolicy::DropNewest, FanOut::PerSubscriber);
        let mut rx = channel.subscribe();
        channel.publish(frame(1));
        channel.close();

        assert_eq!(channel.publish(frame(2)), PublishOutcome::Closed);
        assert_eq!(rx.recv().await, Some(frame(1)));
        assert_eq!(timeout(Duration::from_secs(1), rx.recv()).await.unwrap(), None);
        assert_eq!(channel.subscribe().recv().await, None);
    }

    #[tokio::test]
    async fn test_recv_wakes_on_publish() {
        let channel = FrameChannel::new(4, OverflowPolicy::DropNewest, FanOut::Shared);
        let mut rx = channel.subscribe();

        let publisher = channel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish(frame(7));
        });

        let got = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(got, Some(frame(7)));
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let channel = FrameChannel::new(4, OverflowPolicy::DropNewest, FanOut::Shared);
        let mut rx = channel.subscribe();
        channel.publish(frame(1));
        channel.close();

        assert_eq!(channel.publish(frame(2)), PublishOutcome::Closed);
        assert_eq!(rx.recv().await, Some(frame(1)));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_close_wakes_waiting_receiver() {
        let channel = FrameChannel::new(4, OverflowPolicy::DropNewest, FanOut::Shared);
        let mut rx = channel.subscribe();

        let closer = channel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            closer.close();
        });

        let got = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(got, None);
    }
}
