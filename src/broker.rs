// src/broker.rs
//
// Fan-out broker: a fixed pool of N receiver slots, each a bounded queue a
// session drains. Registered senders live behind a free-list channel of
// slot indices rather than a pointer-tagged `in_use` flag, and shutdown is
// a typed `QueueItem` variant rather than a sentinel DLC value.

use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};

use crate::error::AdapterError;
use crate::frame::CanFrame;

/// Number of statically preallocated receiver slots.
pub const SLOT_COUNT: usize = 5;

/// Per-slot queue capacity.
pub const QUEUE_CAPACITY: usize = 32;

/// An item flowing through a receiver's queue: either a bus frame to
/// forward, or a shutdown request that terminates the consuming session.
#[derive(Clone, Debug)]
pub enum QueueItem {
    Frame(CanFrame),
    Shutdown,
}

type Registry = Vec<RwLock<Option<mpsc::Sender<QueueItem>>>>;

/// A fan-out broker with `SLOT_COUNT` consumer slots.
pub struct Broker {
    registry: Arc<Registry>,
    free_tx: mpsc::Sender<usize>,
    free_rx: tokio::sync::Mutex<mpsc::Receiver<usize>>,
    dropped: std::sync::atomic::AtomicU64,
    received_from_bus: std::sync::atomic::AtomicU64,
}

/// A handle to an acquired slot. Dropping it without calling `release`
/// leaks the slot permanently (same as forgetting to close a socket); callers
/// are expected to release explicitly during session teardown.
pub struct SlotHandle {
    pub id: usize,
    pub rx: mpsc::Receiver<QueueItem>,
}

impl Broker {
    pub fn new() -> Arc<Self> {
        let mut registry = Vec::with_capacity(SLOT_COUNT);
        let (free_tx, free_rx) = mpsc::channel(SLOT_COUNT);
        for id in 0..SLOT_COUNT {
            registry.push(RwLock::new(None));
            // Safe: channel capacity == SLOT_COUNT, so this never blocks.
            free_tx.try_send(id).expect("free-list channel sized to SLOT_COUNT");
        }
        Arc::new(Self {
            registry: Arc::new(registry),
            free_tx,
            free_rx: tokio::sync::Mutex::new(free_rx),
            dropped: std::sync::atomic::AtomicU64::new(0),
            received_from_bus: std::sync::atomic::AtomicU64::new(0),
        })
    }

    /// Acquires a free slot, registering its sender side in the broker and
    /// returning the receiver half to the caller. Fails with `Exhausted` if
    /// all `SLOT_COUNT` slots are in use.
    pub async fn acquire(&self) -> Result<SlotHandle, AdapterError> {
        let id = {
            let mut free_rx = self.free_rx.lock().await;
            match free_rx.try_recv() {
                Ok(id) => id,
                Err(_) => return Err(AdapterError::Exhausted),
            }
        };
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        *self.registry[id].write().await = Some(tx);
        Ok(SlotHandle { id, rx })
    }

    /// Releases a previously acquired slot, returning it to the free list.
    pub async fn release(&self, slot: usize) {
        *self.registry[slot].write().await = None;
        // Capacity == SLOT_COUNT, so this can only fail if `slot` was
        // released twice, which would be a caller bug; surface it loudly
        // rather than silently dropping a double-release.
        if self.free_tx.try_send(slot).is_err() {
            debug_assert!(false, "slot {slot} released more times than acquired");
        }
    }

    /// Pushes `frame` to every registered slot except `except`, non-blocking.
    /// A full consumer queue means that consumer is slow; the frame is
    /// dropped for that consumer and the broker's drop counter is bumped,
    /// per the broker's non-blocking ingress invariant.
    pub async fn enqueue_except(&self, frame: CanFrame, except: Option<usize>) {
        for (id, slot) in self.registry.iter().enumerate() {
            if Some(id) == except {
                continue;
            }
            let guard = slot.read().await;
            if let Some(tx) = guard.as_ref() {
                if tx.try_send(QueueItem::Frame(frame.clone())).is_err() {
                    self.dropped
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                }
            }
        }
    }

    /// Sends a shutdown sentinel to a single slot, used during session
    /// teardown to unblock a `bus_to_tcp` task waiting on its queue.
    pub async fn shutdown_slot(&self, slot: usize) {
        let guard = self.registry[slot].read().await;
        if let Some(tx) = guard.as_ref() {
            let _ = tx.try_send(QueueItem::Shutdown);
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Fans `frame` out to every session, as received from the physical bus
    /// rather than from a peer session, and counts it under
    /// `frames_received_from_bus`.
    pub async fn enqueue_from_bus(&self, frame: CanFrame) {
        self.received_from_bus
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.enqueue_except(frame, None).await;
    }

    pub fn received_from_bus_count(&self) -> u64 {
        self.received_from_bus.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub async fn active_slots(&self) -> usize {
        let mut n = 0;
        for slot in self.registry.iter() {
            if slot.read().await.is_some() {
                n += 1;
            }
        }
        n
    }

    pub async fn free_slots(&self) -> usize {
        SLOT_COUNT - self.active_slots().await
    }
}
