// src/can/socketcan_driver.rs
//
// Linux SocketCAN backend: CanFdSocket, CanDataFrame, Id::{Standard,Extended}
// and the EmbeddedFrame/Frame/Socket traits from the `socketcan` crate, with
// the crate's blocking calls wrapped in spawn_blocking.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use socketcan::{CanDataFrame, CanFdSocket, EmbeddedFrame, ExtendedId, Frame, Id, Socket, StandardId};

use super::{BusState, CanCounters, CanDriver};
use crate::error::AdapterError;
use crate::frame::CanFrame;

const ACTIVE: u8 = 0;
const BUS_OFF: u8 = 1;
const STOPPED: u8 = 2;

pub struct SocketCanDriver {
    socket: std::sync::Arc<CanFdSocket>,
    interface: String,
    state: AtomicU8,
    queued_for_tx: AtomicU64,
    waiting_for_rx: AtomicU64,
    failed_tx: AtomicU64,
    rx_errors: AtomicU64,
}

impl SocketCanDriver {
    pub fn open(interface: &str) -> Result<Self, AdapterError> {
        let socket = CanFdSocket::open(interface)
            .map_err(|e| AdapterError::io(format!("socketcan({interface})"), e))?;
        socket
            .set_read_timeout(Duration::from_millis(200))
            .map_err(|e| AdapterError::io(format!("socketcan({interface})"), e))?;
        Ok(Self {
            socket: std::sync::Arc::new(socket),
            interface: interface.to_string(),
            state: AtomicU8::new(ACTIVE),
            queued_for_tx: AtomicU64::new(0),
            waiting_for_rx: AtomicU64::new(0),
            failed_tx: AtomicU64::new(0),
            rx_errors: AtomicU64::new(0),
        })
    }

    fn device_name(&self) -> String {
        format!("socketcan({})", self.interface)
    }
}

fn to_socketcan_frame(frame: &CanFrame) -> Result<CanDataFrame, AdapterError> {
    let id = if frame.extended {
        let id = ExtendedId::new(frame.id)
            .ok_or_else(|| AdapterError::InvalidArgument(format!("invalid extended id 0x{:X}", frame.id)))?;
        Id::Extended(id)
    } else {
        let id = StandardId::new(frame.id as u16)
            .ok_or_else(|| AdapterError::InvalidArgument(format!("invalid standard id 0x{:X}", frame.id)))?;
        Id::Standard(id)
    };
    CanDataFrame::new(id, &frame.data)
        .ok_or_else(|| AdapterError::InvalidArgument("failed to build CAN data frame".into()))
}

fn from_socketcan_frame(frame: CanDataFrame) -> CanFrame {
    CanFrame {
        id: frame.raw_id() & 0x1FFF_FFFF,
        extended: frame.is_extended(),
        dlc: frame.len() as u8,
        data: frame.data().to_vec(),
    }
}

#[async_trait]
impl CanDriver for SocketCanDriver {
    async fn transmit(&self, frame: CanFrame, deadline: Duration) -> Result<(), AdapterError> {
        if self.state.load(Ordering::SeqCst) != ACTIVE {
            return Err(match self.state.load(Ordering::SeqCst) {
                BUS_OFF => AdapterError::BusOff,
                _ => AdapterError::Stopped,
            });
        }
        let wire_frame = to_socketcan_frame(&frame)?;
        self.queued_for_tx.fetch_add(1, Ordering::Relaxed);

        let socket = self.socket.clone();
        let device = self.device_name();
        let result = tokio::time::timeout(
            deadline,
            tokio::task::spawn_blocking(move || socket.write_frame(&wire_frame)),
        )
        .await;

        match result {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => {
                self.failed_tx.fetch_add(1, Ordering::Relaxed);
                Err(AdapterError::io(device, e))
            }
            Ok(Err(join_err)) => {
                self.failed_tx.fetch_add(1, Ordering::Relaxed);
                Err(AdapterError::Internal(format!("transmit task panicked: {join_err}")))
            }
            Err(_) => {
                self.failed_tx.fetch_add(1, Ordering::Relaxed);
                Err(AdapterError::Timeout)
            }
        }
    }

    async fn receive(&self) -> Result<CanFrame, AdapterError> {
        self.waiting_for_rx.fetch_add(1, Ordering::Relaxed);
        let socket = self.socket.clone();
        let device = self.device_name();
        loop {
            let socket = socket.clone();
            let outcome = tokio::task::spawn_blocking(move || socket.read_frame())
                .await
                .map_err(|e| AdapterError::Internal(format!("receive task panicked: {e}")))?;
            match outcome {
                Ok(socketcan::CanAnyFrame::Normal(f)) => return Ok(from_socketcan_frame(f)),
                Ok(_) => continue, // remote/error/FD frames are out of scope (classic CAN only)
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                Err(e) => {
                    self.rx_errors.fetch_add(1, Ordering::Relaxed);
                    return Err(AdapterError::io(device, e));
                }
            }
        }
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
            rx_errors: self.rx_errors.load(Ordering::Relaxed),
            ..Default::default()
        }
    }
}
