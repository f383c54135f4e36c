//! Bounded recent-history windows.
//!
//! [`WindowBuffer`] is a fixed-capacity ring buffer with FIFO eviction.
//! [`StreamWindow`] owns one, attaches it to a topic through the registry and
//! detaches on drop.

use crate::error::{FeedError, FeedResult};
use crate::registry::{ListenerHandle, TopicSubscriptionRegistry};
use crate::sample::Sample;
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};
use vitals_telemetry::Metrics;

/// Samples kept per window unless configured otherwise.
pub const DEFAULT_WINDOW_CAPACITY: usize = 50;

static NEXT_WINDOW_ID: AtomicU64 = AtomicU64::new(1);

/// Fixed-capacity FIFO ring buffer.
#[derive(Debug, Clone)]
pub struct WindowBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> WindowBuffer<T> {
    pub fn new(capacity: usize) -> FeedResult<Self> {
        if capacity == 0 {
            return Err(FeedError::InvalidCapacity);
        }
        Ok(Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        })
    }

    /// Append at the tail; returns the evicted head when full.
    pub fn push(&mut self, item: T) -> Option<T> {
        let evicted = if self.items.len() == self.capacity {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(item);
        evicted
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn latest(&self) -> Option<&T> {
        self.items.back()
    }

    /// Oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

impl<T: Clone> WindowBuffer<T> {
    pub fn snapshot(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }
}

/// Read-only, cloneable view of a window's buffer.
#[derive(Debug, Clone)]
pub struct WindowReader {
    id: u64,
    topic: Arc<str>,
    buffer: Arc<RwLock<WindowBuffer<Sample>>>,
}

impl WindowReader {
    fn new(topic: &str, capacity: usize) -> FeedResult<Self> {
        Ok(Self {
            id: NEXT_WINDOW_ID.fetch_add(1, Ordering::Relaxed),
            topic: Arc::from(topic),
            buffer: Arc::new(RwLock::new(WindowBuffer::new(capacity)?)),
        })
    }

    /// Append and publish the new fill level.
    fn push(&self, sample: Sample) {
        let len = {
            let mut buffer = self.buffer.write();
            buffer.push(sample);
            buffer.len()
        };
        Metrics::window_len(&self.topic, self.id, len);
    }

    /// Process-unique; labels this window's metrics.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn snapshot(&self) -> Vec<Sample> {
        self.buffer.read().snapshot()
    }

    pub fn len(&self) -> usize {
        self.buffer.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.read().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.buffer.read().capacity()
    }

    pub fn latest(&self) -> Option<Sample> {
        self.buffer.read().latest().cloned()
    }
}

/// Recent samples of one topic, fed by the dispatcher.
///
/// Registered with the registry for as long as it lives; dropping it (or
/// calling [`close`](Self::close)) revokes its listener.
pub struct StreamWindow {
    reader: WindowReader,
    registry: Arc<TopicSubscriptionRegistry>,
    handle: Option<ListenerHandle>,
}

impl StreamWindow {
    /// Create a window and subscribe it to `topic`. Returns a window only if
    /// the subscription succeeded.
    pub async fn open(
        registry: Arc<TopicSubscriptionRegistry>,
        topic: &str,
        capacity: usize,
    ) -> FeedResult<Self> {
        let reader = WindowReader::new(topic, capacity)?;

        let sink = reader.clone();
        let handle = registry
            .subscribe(topic, move |sample: &Sample| {
                sink.push(sample.clone());
                Ok(())
            })
            .await?;

        info!(topic, capacity, "Stream window opened");
        Ok(Self {
            reader,
            registry,
            handle: Some(handle),
        })
    }

    pub fn append(&self, sample: Sample) {
        self.reader.push(sample);
    }

    /// Arrival order, oldest first.
    pub fn snapshot(&self) -> Vec<Sample> {
        self.reader.snapshot()
    }

    pub fn len(&self) -> usize {
        self.reader.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reader.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.reader.capacity()
    }

    pub fn topic(&self) -> &str {
        self.reader.topic()
    }

    pub fn latest(&self) -> Option<Sample> {
        self.reader.latest()
    }

    pub fn reader(&self) -> WindowReader {
        self.reader.clone()
    }

    /// Still registered. False after `close()` or once the broker session
    /// has ended and the registry was cleared.
    pub fn is_attached(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|handle| self.registry.contains(handle))
    }

    /// Stop receiving samples. The buffered history stays readable.
    pub fn close(&mut self) -> bool {
        match self.handle.take() {
            Some(handle) => {
                let removed = self.registry.unsubscribe(&handle);
                debug!(topic = self.topic(), removed, "Stream window closed");
                removed
            }
            None => false,
        }
    }
}

impl fmt::Debug for StreamWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamWindow")
            .field("topic", &self.topic())
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("handle", &self.handle)
            .finish()
    }
}

impl Drop for StreamWindow {
    fn drop(&mut self) {
        self.close();
        Metrics::window_removed(self.topic(), self.reader.id);
    }
}
