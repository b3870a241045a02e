// src/can/loopback.rs
//
// In-memory CAN driver used by tests and any non-Linux build. Echoes every
// transmitted frame back out as received, so the broker/session/supervisor
// chain can be exercised without real hardware: the non-Linux half of the
// `#[cfg(target_os = "linux")]` split, usable rather than an error stub.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::sync::mpsc;

use super::{BusState, CanCounters, CanDriver};
use crate::error::AdapterError;
use crate::frame::CanFrame;

const ACTIVE: u8 = 0;
const BUS_OFF: u8 = 1;
const STOPPED: u8 = 2;

pub struct LoopbackDriver {
    tx: mpsc::Sender<CanFrame>,
    rx: Mutex<mpsc::Receiver<CanFrame>>,
    state: AtomicU8,
    queued_for_tx: AtomicU64,
    waiting_for_rx: AtomicU64,
    failed_tx: AtomicU64,
}

impl LoopbackDriver {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(256);
        Self {
            tx,
            rx: Mutex::new(rx),
            state: AtomicU8::new(ACTIVE),
            queued_for_tx: AtomicU64::new(0),
            waiting_for_rx: AtomicU64::new(0),
            failed_tx: AtomicU64::new(0),
        }
    }

    /// Test hook: force the reported bus state, as if a controller fault occurred.
    pub fn set_state(&self, state: BusState) {
        let v = match state {
            BusState::Active => ACTIVE,
            BusState::BusOff => BUS_OFF,
            BusState::Stopped => STOPPED,
        };
        self.state.store(v, Ordering::SeqCst);
    }
}

impl Default for LoopbackDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CanDriver for LoopbackDriver {
    async fn transmit(&self, frame: CanFrame, deadline: Duration) -> Result<(), AdapterError> {
        match self.state.load(Ordering::SeqCst) {
            BUS_OFF => return Err(AdapterError::BusOff),
            STOPPED => return Err(AdapterError::Stopped),
            _ => {}
        }
        self.queued_for_tx.fetch_add(1, Ordering::Relaxed);
        match tokio::time::timeout(deadline, self.tx.send(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => {
                self.failed_tx.fetch_add(1, Ordering::Relaxed);
                Err(AdapterError::Internal("loopback channel closed".into()))
            }
            Err(_) => {
                self.failed_tx.fetch_add(1, Ordering::Relaxed);
                Err(AdapterError::Timeout)
            }
        }
    }

    async fn receive(&self) -> Result<CanFrame, AdapterError> {
        self.waiting_for_rx.fetch_add(1, Ordering::Relaxed);
        let mut rx = self.rx.lock().await;
        rx.recv()
            .await
            .ok_or_else(|| AdapterError::Internal("loopback channel closed".into()))
    }

    fn state(&self) -> BusState {
        match self.state.load(Ordering::SeqCst) {
            BUS_OFF => BusState::BusOff,
            STOPPED => BusState::Stopped,
            _ => BusState::Active,
        }
    }

    async fn recover(&self) -> Result<(), AdapterError> {
        self.state.store(ACTIVE, Ordering::SeqCst);
        Ok(())
    }

    async fn start(&self) -> Result<(), AdapterError> {
        self.state.store(ACTIVE, Ordering::SeqCst);
        Ok(())
    }

    fn counters(&self) -> CanCounters {
        CanCounters {
            queued_for_tx: self.queued_for_tx.load(Ordering::Relaxed),
            waiting_for_rx: self.waiting_for_rx.load(Ordering::Relaxed),
            failed_tx: self.failed_tx.load(Ordering::Relaxed),
            ..Default::default()
        }
    }
}
