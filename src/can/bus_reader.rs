// src/can/bus_reader.rs
//
// Pulls frames off the physical bus via CanDriver::receive and fans them out
// to every socketcand session through the broker.

use std::sync::Arc;

use tokio::sync::watch;

use super::CanDriver;
use crate::broker::Broker;
use crate::error::AdapterError;
use crate::tlog;

/// Runs until `shutdown` fires, forwarding every frame `driver.receive()`
/// yields to all sessions via the broker. Transient receive errors are
/// logged and the loop continues; a driver that never recovers just keeps
/// erroring, which the supervisor task (run alongside this one) is
/// responsible for reacting to.
pub async fn run_bus_reader(
    driver: Arc<dyn CanDriver>,
    broker: Arc<Broker>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = driver.receive() => {
                match result {
                    Ok(frame) => broker.enqueue_from_bus(frame).await,
                    Err(AdapterError::Timeout) => {}
                    Err(e) => tlog!("[bus_reader] receive error: {e}"),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::can::loopback::LoopbackDriver;
    use crate::frame::CanFrame;
    use std::time::Duration;

    #[tokio::test]
    async fn forwards_received_frames_to_broker() {
        let driver: Arc<dyn CanDriver> = Arc::new(LoopbackDriver::new());
        let broker = Broker::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut slot = broker.acquire().await.unwrap();

        let reader_driver = driver.clone();
        let reader_broker = broker.clone();
        let handle = tokio::spawn(run_bus_reader(reader_driver, reader_broker, shutdown_rx));

        driver
            .transmit(
                CanFrame { id: 1, extended: false, dlc: 1, data: vec![0xAA] },
                Duration::from_secs(1),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(broker.received_from_bus_count(), 1);
        assert!(slot.rx.try_recv().is_ok());

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
