// src/can/mod.rs
//
// CAN driver abstraction: a trait so the broker, supervisor and tests can
// all share one interface regardless of target, with a Linux-only
// SocketCAN-backed implementation and an in-memory loopback implementation
// for everything else.

pub mod bus_reader;
pub mod loopback;
#[cfg(target_os = "linux")]
pub mod socketcan_driver;
pub mod supervisor;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::AdapterError;
use crate::frame::CanFrame;

/// Controller bus state, polled by the supervisor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BusState {
    Active,
    BusOff,
    Stopped,
}

/// Controller-level bus counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct CanCounters {
    pub queued_for_tx: u64,
    pub waiting_for_rx: u64,
    pub tx_errors: u64,
    pub rx_errors: u64,
    pub failed_tx: u64,
    pub missed_rx: u64,
    pub overrun: u64,
    pub arbitration_lost: u64,
    pub bus_errors: u64,
}

/// Abstraction over a physical or simulated CAN controller.
#[async_trait]
pub trait CanDriver: Send + Sync {
    async fn transmit(&self, frame: CanFrame, deadline: Duration) -> Result<(), AdapterError>;
    async fn receive(&self) -> Result<CanFrame, AdapterError>;
    fn state(&self) -> BusState;
    async fn recover(&self) -> Result<(), AdapterError>;
    async fn start(&self) -> Result<(), AdapterError>;
    fn counters(&self) -> CanCounters;
}
