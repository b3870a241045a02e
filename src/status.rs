// src/status.rs
//
// Status document assembled from broker/CAN/session/Cyphal counters, built
// as a serde_json::Value the way this codebase's other JSON payloads are
// constructed. Deliberately keeps all counters as unquoted JSON numbers,
// rather than quoting them as strings.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde_json::json;
use tokio::sync::RwLock;

use crate::broker::Broker;
use crate::can::CanDriver;
use crate::config::AdapterConfig;

/// Aggregate socketcand session counters, summed across all active sessions.
#[derive(Default)]
pub struct SocketcandCounters {
    /// `< send ... >` lines successfully decoded.
    pub frames_received: AtomicU64,
    /// `< frame ... >` lines successfully written back to a client.
    pub frames_sent: AtomicU64,
    /// Malformed socketcand lines (bad handshake or bad `< send ... >`).
    pub invalid_frames_received: AtomicU64,
    /// Decoded frames successfully handed to the CAN driver.
    pub frames_transmitted_to_bus: AtomicU64,
    /// CAN driver transmit deadline exceeded.
    pub bus_transmit_timeouts: AtomicU64,
    /// Connections rejected because the broker had no free slot.
    pub sessions_rejected: AtomicU64,
}

/// Cyphal heartbeat client counters.
#[derive(Default)]
pub struct CyphalCounters {
    pub heartbeats_sent: AtomicU64,
    pub heartbeats_received: AtomicU64,
}

pub struct StatusAggregator {
    started_at: Instant,
    broker: Arc<Broker>,
    driver: Arc<dyn CanDriver>,
    config: Arc<RwLock<AdapterConfig>>,
    pub socketcand: SocketcandCounters,
    pub cyphal: CyphalCounters,
}

impl StatusAggregator {
    pub fn new(broker: Arc<Broker>, driver: Arc<dyn CanDriver>, config: Arc<RwLock<AdapterConfig>>) -> Self {
        Self {
            started_at: Instant::now(),
            broker,
            driver,
            config,
            socketcand: SocketcandCounters::default(),
            cyphal: CyphalCounters::default(),
        }
    }

    /// Renders the current snapshot as a JSON document with keys
    /// `uptime_secs`, `link`, `can`, `broker`, `socketcand`, `cyphal`.
    pub async fn snapshot(&self) -> serde_json::Value {
        let can_counters = self.driver.counters();
        let bus_state = match self.driver.state() {
            crate::can::BusState::Active => "active",
            crate::can::BusState::BusOff => "bus_off",
            crate::can::BusState::Stopped => "stopped",
        };
        let config = self.config.read().await;

        json!({
            "uptime_secs": self.started_at.elapsed().as_secs(),
            "link": {
                "can0": bus_state,
            },
            "can": {
                "state": bus_state,
                "queued_for_tx": can_counters.queued_for_tx,
                "waiting_for_rx": can_counters.waiting_for_rx,
                "tx_errors": can_counters.tx_errors,
                "rx_errors": can_counters.rx_errors,
                "failed_tx": can_counters.failed_tx,
                "missed_rx": can_counters.missed_rx,
                "overrun": can_counters.overrun,
                "arbitration_lost": can_counters.arbitration_lost,
                "bus_errors": can_counters.bus_errors,
            },
            "broker": {
                "frames_received_from_bus": self.broker.received_from_bus_count(),
                "frames_dropped_to_slow_consumer": self.broker.dropped_count(),
                "active_sessions": self.broker.active_slots().await,
                "free_slots": self.broker.free_slots().await,
            },
            "socketcand": {
                "socketcand_frames_received": self.socketcand.frames_received.load(Ordering::Relaxed),
                "socketcand_frames_sent": self.socketcand.frames_sent.load(Ordering::Relaxed),
                "invalid_socketcand_frames_received": self.socketcand.invalid_frames_received.load(Ordering::Relaxed),
                "frames_transmitted_to_bus": self.socketcand.frames_transmitted_to_bus.load(Ordering::Relaxed),
                "bus_transmit_timeouts": self.socketcand.bus_transmit_timeouts.load(Ordering::Relaxed),
                "sessions_rejected": self.socketcand.sessions_rejected.load(Ordering::Relaxed),
                "port": config.socketcand_port,
            },
            "cyphal": {
                "enabled": config.cyphal_enabled,
                "heartbeats_sent": self.cyphal.heartbeats_sent.load(Ordering::Relaxed),
                "heartbeats_received": self.cyphal.heartbeats_received.load(Ordering::Relaxed),
            },
        })
    }
}
