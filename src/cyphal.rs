// src/cyphal.rs
//
// Cyphal/CAN heartbeat client: emits a uavcan.node.Heartbeat.1.0 message
// once a second and counts heartbeats received from other nodes. Grounded
// on original_source/main/cyphal_node.c for the DSDL wire layout (uptime,
// health, mode, vendor status byte) and the 1 Hz heartbeat task; no Cyphal
// transport crate exists in the corpus, so the single-frame encode/decode
// is hand-rolled, kept intentionally small since multi-frame Cyphal
// transfers are a declared non-goal.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::broker::{Broker, QueueItem};
use crate::can::CanDriver;
use crate::frame::CanFrame;
use crate::status::StatusAggregator;
use crate::tlog;

/// Fixed subject id for uavcan.node.Heartbeat.1.0.
pub const HEARTBEAT_SUBJECT_ID: u32 = 7509;
/// Nominal message priority, shifted into its CAN ID bit position.
const PRIORITY_NOMINAL: u32 = 6 << 26;
const HEARTBEAT_PAYLOAD_LEN: usize = 7;

pub const HEALTH_NOMINAL: u8 = 0;
pub const MODE_OPERATIONAL: u8 = 0;

fn heartbeat_can_id(node_id: u8) -> u32 {
    PRIORITY_NOMINAL | (HEARTBEAT_SUBJECT_ID << 8) | node_id as u32
}

/// Encodes a heartbeat payload: `uptime: u32 LE`, `health: u2`, `mode: u3`,
/// 5 reserved bits (zero), `vendor_specific_status_code: u8`.
fn encode_heartbeat(uptime_secs: u32) -> [u8; HEARTBEAT_PAYLOAD_LEN] {
    let mut payload = [0u8; HEARTBEAT_PAYLOAD_LEN];
    payload[0..4].copy_from_slice(&uptime_secs.to_le_bytes());
    payload[4] = (HEALTH_NOMINAL & 0b11) | ((MODE_OPERATIONAL & 0b111) << 2);
    payload[5] = 0; // reserved
    payload[6] = 0; // vendor_specific_status_code
    payload
}

/// True if `frame` looks like a single-frame Cyphal heartbeat: subject id
/// matches and the payload carries at least the 7 required bytes. Frames
/// failing either check are silently ignored rather than erroring.
fn looks_like_heartbeat(frame: &CanFrame) -> bool {
    frame.extended
        && frame.dlc as usize >= HEARTBEAT_PAYLOAD_LEN
        && ((frame.id >> 8) & 0x1FFF) == HEARTBEAT_SUBJECT_ID
}

/// Runs the heartbeat transmit loop (1/sec) until `shutdown` fires.
/// Acquires a broker slot like any session so its own heartbeats fan out to
/// socketcand clients, and feeds transmitted frames to the CAN driver.
pub async fn run_heartbeat_sender(
    node_id: u8,
    broker: Arc<Broker>,
    driver: Arc<dyn CanDriver>,
    status: Arc<StatusAggregator>,
    mut shutdown: watch::Receiver<bool>,
) {
    let started = Instant::now();
    let mut ticker = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
                continue;
            }
        }

        let uptime = started.elapsed().as_secs() as u32;
        let payload = encode_heartbeat(uptime);
        let frame = CanFrame {
            id: heartbeat_can_id(node_id),
            extended: true,
            dlc: HEARTBEAT_PAYLOAD_LEN as u8,
            data: payload.to_vec(),
        };

        match driver.transmit(frame.clone(), Duration::from_secs(2)).await {
            Ok(()) => {
                broker.enqueue_except(frame, None).await;
                status.cyphal.heartbeats_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => tlog!("[cyphal] heartbeat transmit failed: {e}"),
        }
    }
}

/// Runs the heartbeat receive loop, draining a dedicated broker slot and
/// counting frames that look like Cyphal heartbeats. Runs until its slot is
/// closed (shutdown sentinel or registry release) or `shutdown` fires.
pub async fn run_heartbeat_listener(
    broker: Arc<Broker>,
    status: Arc<StatusAggregator>,
    mut shutdown: watch::Receiver<bool>,
) {
    let slot = match broker.acquire().await {
        Ok(slot) => slot,
        Err(e) => {
            tlog!("[cyphal] couldn't acquire broker slot for heartbeat listener: {e}");
            return;
        }
    };
    let mut rx = slot.rx;

    loop {
        tokio::select! {
            item = rx.recv() => {
                match item {
                    Some(QueueItem::Frame(frame)) => {
                        if looks_like_heartbeat(&frame) {
                            status.cyphal.heartbeats_received.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    Some(QueueItem::Shutdown) | None => break,
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    broker.release(slot.id).await;
}
