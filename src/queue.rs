//! Bounded queues between pipeline tasks.
//!
//! Each queue encodes one saturation policy from the session design: the
//! outbound media queue favors recency (stale realtime media is useless),
//! while text and playback queues favor delivery (a lost user message or a
//! dropped playback chunk is user-perceptible).

use crate::events::OutboundMessage;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Outbound media queue shared by the capture pipeline (producers) and the
/// uplink worker (consumer).
///
/// Audio pushes evict the oldest queued audio chunk when full. Image pushes
/// drop the incoming frame instead: image cadence is already low, and
/// blocking here would stall audio capture.
pub struct MediaQueue {
    inner: Mutex<VecDeque<OutboundMessage>>,
    capacity: usize,
    ready: Notify,
}

impl MediaQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            ready: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<OutboundMessage>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enqueue an audio chunk, evicting the oldest queued audio chunk when
    /// the queue is full. Order of the remaining entries is preserved.
    pub fn push_audio(&self, msg: OutboundMessage) {
        {
            let mut queue = self.lock();
            if queue.len() >= self.capacity {
                let evict = queue
                    .iter()
                    .position(|m| matches!(m, OutboundMessage::AudioChunk { .. }))
                    .unwrap_or(0);
                queue.remove(evict);
                debug!("outbound queue full, dropped oldest audio chunk");
            }
            queue.push_back(msg);
        }
        self.ready.notify_one();
    }

    /// Enqueue an image frame. Returns false when the queue is full and the
    /// incoming frame was dropped.
    pub fn push_image(&self, msg: OutboundMessage) -> bool {
        {
            let mut queue = self.lock();
            if queue.len() >= self.capacity {
                return false;
            }
            queue.push_back(msg);
        }
        self.ready.notify_one();
        true
    }

    /// Wait until the queue is non-empty without removing anything.
    pub async fn ready(&self) {
        loop {
            let notified = self.ready.notified();
            if !self.lock().is_empty() {
                return;
            }
            notified.await;
        }
    }

    pub fn try_pop(&self) -> Option<OutboundMessage> {
        self.lock().pop_front()
    }

    /// Discard everything queued; used when a connection is torn down since
    /// in-flight realtime media has no replay value.
    pub fn drain(&self) -> usize {
        let mut queue = self.lock();
        let dropped = queue.len();
        queue.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Bounded FIFO whose producer blocks while the queue is full.
///
/// With `evict_after` set, a producer stuck past that deadline evicts the
/// oldest entry instead of waiting forever, bounding end-to-end latency; the
/// playback buffer uses this. Without it the producer waits for space, which
/// is the delivery guarantee the text queue needs.
pub struct BlockingQueue<T> {
    inner: Mutex<VecDeque<T>>,
    capacity: usize,
    evict_after: Option<Duration>,
    ready: Notify,
    space: Notify,
}

impl<T> BlockingQueue<T> {
    pub fn new(capacity: usize, evict_after: Option<Duration>) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            evict_after,
            ready: Notify::new(),
            space: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<T>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub async fn push(&self, item: T) {
        loop {
            let space = self.space.notified();
            {
                let mut queue = self.lock();
                if queue.len() < self.capacity {
                    queue.push_back(item);
                    self.ready.notify_one();
                    return;
                }
            }
            match self.evict_after {
                Some(deadline) => {
                    if timeout(deadline, space).await.is_err() {
                        let mut queue = self.lock();
                        if queue.len() >= self.capacity {
                            queue.pop_front();
                            warn!(
                                waited_ms = deadline.as_millis() as u64,
                                "queue stalled past deadline, evicted oldest entry"
                            );
                        }
                        queue.push_back(item);
                        drop(queue);
                        self.ready.notify_one();
                        return;
                    }
                }
                None => space.await,
            }
        }
    }

    pub async fn pop(&self) -> T {
        loop {
            let notified = self.ready.notified();
            if let Some(item) = self.try_pop() {
                return item;
            }
            notified.await;
        }
    }

    pub fn try_pop(&self) -> Option<T> {
        let item = self.lock().pop_front();
        if item.is_some() {
            self.space.notify_one();
        }
        item
    }

    /// Wait until the queue is non-empty without removing anything.
    pub async fn ready(&self) {
        loop {
            let notified = self.ready.notified();
            if !self.lock().is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Discard everything buffered. Idempotent.
    pub fn flush(&self) -> usize {
        let dropped = {
            let mut queue = self.lock();
            let dropped = queue.len();
            queue.clear();
            dropped
        };
        if dropped > 0 {
            self.space.notify_one();
        }
        dropped
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn audio(tag: u8) -> OutboundMessage {
        OutboundMessage::AudioChunk {
            pcm: vec![tag],
            sample_rate: 16_000,
        }
    }

    fn image(tag: u8) -> OutboundMessage {
        OutboundMessage::ImageChunk { jpeg: vec![tag] }
    }

    #[test]
    fn audio_push_evicts_oldest_and_preserves_order() {
        let queue = MediaQueue::new(3);
        for tag in 1..=4 {
            queue.push_audio(audio(tag));
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.try_pop(), Some(audio(2)));
        assert_eq!(queue.try_pop(), Some(audio(3)));
        assert_eq!(queue.try_pop(), Some(audio(4)));
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn audio_eviction_skips_image_frames() {
        let queue = MediaQueue::new(3);
        assert!(queue.push_image(image(9)));
        queue.push_audio(audio(1));
        queue.push_audio(audio(2));
        queue.push_audio(audio(3));
        assert_eq!(queue.try_pop(), Some(image(9)));
        assert_eq!(queue.try_pop(), Some(audio(2)));
        assert_eq!(queue.try_pop(), Some(audio(3)));
    }

    #[test]
    fn full_queue_rejects_incoming_image() {
        let queue = MediaQueue::new(2);
        queue.push_audio(audio(1));
        queue.push_audio(audio(2));
        assert!(!queue.push_image(image(9)));
        assert_eq!(queue.try_pop(), Some(audio(1)));
        assert_eq!(queue.try_pop(), Some(audio(2)));
        assert_eq!(queue.try_pop(), None);
    }

    #[tokio::test]
    async fn ready_wakes_consumer_on_push() {
        let queue = Arc::new(MediaQueue::new(4));
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue.ready().await;
                queue.try_pop()
            })
        };
        tokio::task::yield_now().await;
        queue.push_audio(audio(7));
        assert_eq!(waiter.await.unwrap(), Some(audio(7)));
    }

    #[tokio::test]
    async fn blocking_queue_delivers_in_order() {
        let queue = BlockingQueue::new(4, None);
        queue.push(1u8).await;
        queue.push(2).await;
        assert_eq!(queue.pop().await, 1);
        assert_eq!(queue.pop().await, 2);
    }

    #[tokio::test]
    async fn blocking_push_waits_for_space() {
        let queue = Arc::new(BlockingQueue::new(1, None));
        queue.push(1u8).await;
        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.push(2).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop().await, 1);
        producer.await.unwrap();
        assert_eq!(queue.pop().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_push_evicts_oldest_after_deadline() {
        let queue = BlockingQueue::new(1, Some(Duration::from_millis(100)));
        queue.push(1u8).await;
        queue.push(2).await;
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop().await, 2);
    }

    #[test]
    fn flush_discards_everything_and_is_idempotent() {
        let queue = BlockingQueue::new(8, None);
        {
            let mut inner = queue.lock();
            inner.push_back(1u8);
            inner.push_back(2);
        }
        assert_eq!(queue.flush(), 2);
        assert_eq!(queue.flush(), 0);
        assert!(queue.is_empty());
    }
}
