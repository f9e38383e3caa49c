// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Non-blocking fan-out of live notifications to many consumers.
//!
//! Every consumer owns a bounded queue. Publishing clones the item into each
//! queue without waiting: when a queue is full its oldest item is evicted and
//! the consumer's overrun counter is incremented. A slow consumer therefore
//! loses its own backlog but never stalls ingestion or other consumers.
//!
//! # Architecture
//!
//! ```text
//!                  publish(&event)          (never blocks)
//!                        │
//!        ┌───────────────┼────────────────┐
//!        ▼               ▼                ▼
//!   ┌─────────┐     ┌─────────┐      ┌─────────┐
//!   │ queue A │     │ queue B │      │ queue C │   bounded, drop-oldest
//!   └────┬────┘     └────┬────┘      └────┬────┘
//!        ▼               ▼                ▼
//!     recv()          recv()           recv()
//! ```
//!
//! Registration and deregistration may happen concurrently with delivery.
//!
//! # Example
//!
//! ```
//! use vigil_core::fanout::{ConsumerOptions, NotificationFanout};
//!
//! let fanout = NotificationFanout::<u32>::new(2);
//! let mut rx = fanout.register(ConsumerOptions::new("dashboard"));
//!
//! fanout.publish(&1);
//! fanout.publish(&2);
//! fanout.publish(&3); // evicts 1
//!
//! assert_eq!(rx.try_recv(), Some(2));
//! assert_eq!(rx.overruns(), 1);
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::types::{DataChangeEvent, DataChangeListener};

/// Default queue capacity per consumer.
pub const DEFAULT_CONSUMER_CAPACITY: usize = 1024;

// =============================================================================
// ConsumerId
// =============================================================================

/// Identifier of a registered consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConsumerId(pub u64);

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "consumer-{}", self.0)
    }
}

// =============================================================================
// ConsumerOptions
// =============================================================================

type Filter<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

/// Options for registering a consumer.
pub struct ConsumerOptions<T> {
    name: String,
    capacity: Option<usize>,
    filter: Option<Filter<T>>,
}

impl<T> ConsumerOptions<T> {
    /// Creates options with the fan-out's default capacity and no filter.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capacity: None,
            filter: None,
        }
    }

    /// Sets the queue capacity (minimum 1).
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity.max(1));
        self
    }

    /// Only items matching `filter` are enqueued for this consumer.
    pub fn filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Box::new(filter));
        self
    }
}

// =============================================================================
// ConsumerQueue
// =============================================================================

struct ConsumerQueue<T> {
    id: ConsumerId,
    name: String,
    capacity: usize,
    items: Mutex<VecDeque<T>>,
    notify: Notify,
    closed: AtomicBool,
    filter: Option<Filter<T>>,
    delivered: AtomicU64,
    overruns: AtomicU64,
}

impl<T> ConsumerQueue<T> {
    fn accepts(&self, item: &T) -> bool {
        self.filter.as_ref().map_or(true, |f| f(item))
    }

    /// Enqueues without waiting. Returns `true` if an old item was evicted.
    fn push(&self, item: T) -> bool {
        let evicted = {
            let mut items = self.items.lock();
            let evicted = if items.len() >= self.capacity {
                items.pop_front();
                true
            } else {
                false
            };
            items.push_back(item);
            evicted
        };

        self.delivered.fetch_add(1, Ordering::Relaxed);
        if evicted {
            self.overruns.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
        evicted
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn snapshot(&self) -> ConsumerStats {
        ConsumerStats {
            id: self.id,
            name: self.name.clone(),
            capacity: self.capacity,
            queued: self.items.lock().len(),
            delivered: self.delivered.load(Ordering::Relaxed),
            overruns: self.overruns.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// NotificationFanout
// =============================================================================

/// Distributes items to registered consumers with drop-oldest backpressure.
pub struct NotificationFanout<T> {
    consumers: DashMap<ConsumerId, Arc<ConsumerQueue<T>>>,
    next_id: AtomicU64,
    default_capacity: usize,
    stats: AtomicFanoutStats,
}

#[derive(Debug, Default)]
struct AtomicFanoutStats {
    published: AtomicU64,
    deliveries: AtomicU64,
    overruns: AtomicU64,
    registered: AtomicU64,
    removed: AtomicU64,
}

impl<T: Clone + Send + 'static> NotificationFanout<T> {
    /// Creates a fan-out whose consumers default to `default_capacity` slots.
    pub fn new(default_capacity: usize) -> Self {
        Self {
            consumers: DashMap::new(),
            next_id: AtomicU64::new(1),
            default_capacity: default_capacity.max(1),
            stats: AtomicFanoutStats::default(),
        }
    }

    /// Registers a consumer and returns its receiving end.
    pub fn register(&self, options: ConsumerOptions<T>) -> ConsumerReceiver<T> {
        let id = ConsumerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let capacity = options.capacity.unwrap_or(self.default_capacity);

        let queue = Arc::new(ConsumerQueue {
            id,
            name: options.name,
            capacity,
            items: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            filter: options.filter,
            delivered: AtomicU64::new(0),
            overruns: AtomicU64::new(0),
        });

        self.consumers.insert(id, queue.clone());
        self.stats.registered.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(consumer = %id, name = %queue.name, capacity, "Consumer registered");

        ConsumerReceiver { queue }
    }

    /// Removes a consumer. Its receiver drains what is queued, then ends.
    ///
    /// Returns `false` if the consumer was not registered.
    pub fn deregister(&self, id: ConsumerId) -> bool {
        match self.consumers.remove(&id) {
            Some((_, queue)) => {
                queue.close();
                self.stats.removed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(consumer = %id, "Consumer deregistered");
                true
            }
            None => false,
        }
    }

    /// Enqueues `item` to every interested consumer without blocking.
    ///
    /// Returns the number of queues the item was placed in.
    pub fn publish(&self, item: &T) -> usize {
        self.stats.published.fetch_add(1, Ordering::Relaxed);

        let mut delivered = 0usize;
        let mut closed = Vec::new();

        for entry in self.consumers.iter() {
            let queue = entry.value();
            if queue.is_closed() {
                closed.push(*entry.key());
                continue;
            }
            if !queue.accepts(item) {
                continue;
            }
            if queue.push(item.clone()) {
                self.stats.overruns.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(consumer = %queue.id, "Consumer overrun, oldest item evicted");
            }
            delivered += 1;
        }

        // Receivers dropped without deregistering.
        for id in closed {
            if self.consumers.remove(&id).is_some() {
                self.stats.removed.fetch_add(1, Ordering::Relaxed);
            }
        }

        self.stats.deliveries.fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    /// Closes every consumer queue.
    pub fn close_all(&self) {
        let ids: Vec<ConsumerId> = self.consumers.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.deregister(id);
        }
    }

    /// Returns the number of live consumers.
    pub fn consumer_count(&self) -> usize {
        self.consumers.iter().filter(|e| !e.value().is_closed()).count()
    }

    /// Returns the overrun counter of a consumer.
    pub fn overruns(&self, id: ConsumerId) -> Option<u64> {
        self.consumers
            .get(&id)
            .map(|q| q.overruns.load(Ordering::Relaxed))
    }

    /// Returns per-consumer statistics.
    pub fn consumer_stats(&self) -> Vec<ConsumerStats> {
        let mut stats: Vec<ConsumerStats> =
            self.consumers.iter().map(|e| e.value().snapshot()).collect();
        stats.sort_by_key(|s| s.id);
        stats
    }

    /// Returns aggregate statistics.
    pub fn stats(&self) -> FanoutStats {
        FanoutStats {
            published: self.stats.published.load(Ordering::Relaxed),
            deliveries: self.stats.deliveries.load(Ordering::Relaxed),
            overruns: self.stats.overruns.load(Ordering::Relaxed),
            consumers_registered: self.stats.registered.load(Ordering::Relaxed),
            consumers_removed: self.stats.removed.load(Ordering::Relaxed),
            active_consumers: self.consumer_count() as u64,
        }
    }
}

impl<T: Clone + Send + 'static> Default for NotificationFanout<T> {
    fn default() -> Self {
        Self::new(DEFAULT_CONSUMER_CAPACITY)
    }
}

impl<T> fmt::Debug for NotificationFanout<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationFanout")
            .field("consumers", &self.consumers.len())
            .field("default_capacity", &self.default_capacity)
            .finish()
    }
}

impl DataChangeListener for NotificationFanout<DataChangeEvent> {
    fn name(&self) -> &str {
        "fanout"
    }

    fn on_data_change(&self, event: &DataChangeEvent) {
        self.publish(event);
    }
}

// =============================================================================
// ConsumerReceiver
// =============================================================================

/// Receiving end of a consumer queue.
///
/// Dropping the receiver closes the queue; the fan-out prunes it on the next
/// publish.
pub struct ConsumerReceiver<T> {
    queue: Arc<ConsumerQueue<T>>,
}

impl<T> ConsumerReceiver<T> {
    /// Waits for the next item.
    ///
    /// Returns `None` once the consumer has been deregistered and its queue
    /// is drained.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            let next = self.queue.items.lock().pop_front();
            if let Some(item) = next {
                return Some(item);
            }
            if self.queue.is_closed() {
                return None;
            }
            self.queue.notify.notified().await;
        }
    }

    /// Takes the next item if one is queued.
    pub fn try_recv(&mut self) -> Option<T> {
        self.queue.items.lock().pop_front()
    }

    /// Takes everything currently queued.
    pub fn drain(&mut self) -> Vec<T> {
        self.queue.items.lock().drain(..).collect()
    }

    /// Returns the consumer ID.
    pub fn id(&self) -> ConsumerId {
        self.queue.id
    }

    /// Returns the number of queued items.
    pub fn len(&self) -> usize {
        self.queue.items.lock().len()
    }

    /// Returns `true` if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns how many items were evicted from this queue.
    pub fn overruns(&self) -> u64 {
        self.queue.overruns.load(Ordering::Relaxed)
    }

    /// Returns `true` if the consumer has been deregistered.
    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }
}

impl<T> Drop for ConsumerReceiver<T> {
    fn drop(&mut self) {
        self.queue.close();
    }
}

impl<T> fmt::Debug for ConsumerReceiver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerReceiver")
            .field("id", &self.queue.id)
            .field("name", &self.queue.name)
            .field("capacity", &self.queue.capacity)
            .finish()
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Per-consumer statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerStats {
    /// Consumer ID.
    pub id: ConsumerId,
    /// Consumer name.
    pub name: String,
    /// Queue capacity.
    pub capacity: usize,
    /// Items currently queued.
    pub queued: usize,
    /// Items enqueued in total.
    pub delivered: u64,
    /// Items evicted because the queue was full.
    pub overruns: u64,
}

/// Aggregate fan-out statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanoutStats {
    /// Items published.
    pub published: u64,
    /// Enqueue operations across all consumers.
    pub deliveries: u64,
    /// Evictions across all consumers.
    pub overruns: u64,
    /// Consumers ever registered.
    pub consumers_registered: u64,
    /// Consumers removed.
    pub consumers_removed: u64,
    /// Consumers currently registered.
    pub active_consumers: u64,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::time::Duration;

    #[test]
    fn test_publish_reaches_every_consumer() {
        let fanout = NotificationFanout::<u32>::new(8);
        let mut a = fanout.register(ConsumerOptions::new("a"));
        let mut b = fanout.register(ConsumerOptions::new("b"));

        assert_eq!(fanout.publish(&7), 2);
        assert_eq!(a.try_recv(), Some(7));
        assert_eq!(b.try_recv(), Some(7));
        assert_eq!(fanout.stats().deliveries, 2);
    }

    #[test]
    fn test_drop_oldest_on_overrun() {
        let fanout = NotificationFanout::<u32>::new(3);
        let mut slow = fanout.register(ConsumerOptions::new("slow"));
        let mut fast = fanout.register(ConsumerOptions::new("fast").capacity(16));

        for i in 0..5 {
            fanout.publish(&i);
        }

        assert_eq!(slow.drain(), vec![2, 3, 4]);
        assert_eq!(slow.overruns(), 2);
        assert_eq!(fanout.overruns(slow.id()), Some(2));

        assert_eq!(fast.drain(), vec![0, 1, 2, 3, 4]);
        assert_eq!(fast.overruns(), 0);
        assert_eq!(fanout.stats().overruns, 2);
    }

    #[test]
    fn test_filter() {
        let fanout = NotificationFanout::<u32>::new(8);
        let mut even = fanout.register(ConsumerOptions::new("even").filter(|v: &u32| v % 2 == 0));

        for i in 0..6 {
            fanout.publish(&i);
        }
        assert_eq!(even.drain(), vec![0, 2, 4]);
    }

    #[test]
    fn test_dropped_receiver_is_pruned() {
        let fanout = NotificationFanout::<u32>::new(8);
        let rx = fanout.register(ConsumerOptions::new("gone"));
        assert_eq!(fanout.consumer_count(), 1);

        drop(rx);
        assert_eq!(fanout.consumer_count(), 0);
        assert_eq!(fanout.publish(&1), 0);
        assert_eq!(fanout.stats().consumers_removed, 1);
    }

    #[tokio::test]
    async fn test_recv_waits_for_items() {
        let fanout = Arc::new(NotificationFanout::<u32>::new(8));
        let mut rx = fanout.register(ConsumerOptions::new("waiter"));

        let publisher = fanout.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            publisher.publish(&42);
        });

        let item = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("recv timed out");
        assert_eq!(item, Some(42));
    }

    #[tokio::test]
    async fn test_deregister_drains_then_ends() {
        let fanout = NotificationFanout::<u32>::new(8);
        let mut rx = fanout.register(ConsumerOptions::new("x"));

        fanout.publish(&1);
        assert!(fanout.deregister(rx.id()));
        assert!(!fanout.deregister(rx.id()));
        fanout.publish(&2);

        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_concurrent_registration_during_delivery() {
        let fanout = Arc::new(NotificationFanout::<u64>::new(4));

        let publisher = {
            let fanout = fanout.clone();
            tokio::spawn(async move {
                for i in 0..2_000u64 {
                    fanout.publish(&i);
                    if i % 100 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            })
        };

        let churn = {
            let fanout = fanout.clone();
            tokio::spawn(async move {
                for _ in 0..50 {
                    let rx = fanout.register(ConsumerOptions::new("churn"));
                    tokio::task::yield_now().await;
                    fanout.deregister(rx.id());
                }
            })
        };

        publisher.await.unwrap();
        churn.await.unwrap();

        assert_eq!(fanout.consumer_count(), 0);
        assert_eq!(fanout.stats().published, 2_000);
    }

    #[test]
    fn test_listener_impl() {
        let fanout = NotificationFanout::<DataChangeEvent>::new(4);
        let mut rx = fanout.register(ConsumerOptions::new("live"));
        let listener: &dyn DataChangeListener = &fanout;

        listener.on_data_change(&DataChangeEvent::new("n1", 1.0f64, Utc::now(), 1));
        assert_eq!(rx.try_recv().map(|e| e.node_id.into_inner()), Some("n1".to_string()));
        assert_eq!(listener.name(), "fanout");
    }
}
