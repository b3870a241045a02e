// src/listener.rs
//
// TCP accept loop for socketcand rawmode clients, bounded at N concurrent
// sessions: timeout-bounded accept so the shutdown flag is checked
// regularly, and a per-connection tokio::spawn. The hard cap is enforced
// right here, on accept, by acquiring a broker slot before any handshake
// traffic is exchanged — per spec.md:190 an over-capacity client is
// "immediately closed", not walked through the handshake first.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::broker::{Broker, SLOT_COUNT};
use crate::can::CanDriver;
use crate::error::AdapterError;
use crate::session;
use crate::status::StatusAggregator;
use crate::tlog;

const ACCEPT_POLL: Duration = Duration::from_millis(500);

/// Binds `addr` and accepts socketcand rawmode connections until `shutdown`
/// fires. Concurrency is bounded by the broker's slot count: once all
/// `SLOT_COUNT` slots are taken, `broker.acquire()` fails for further
/// accepts and those sockets are closed immediately, with no handshake
/// traffic sent.
pub async fn run_listener(
    addr: SocketAddr,
    broker: Arc<Broker>,
    driver: Arc<dyn CanDriver>,
    status: Arc<StatusAggregator>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tlog!("[listener] listening on {addr} (max {SLOT_COUNT} concurrent sessions)");

    loop {
        tokio::select! {
            accepted = tokio::time::timeout(ACCEPT_POLL, listener.accept()) => {
                match accepted {
                    Ok(Ok((stream, peer))) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            tlog!("[listener] failed to disable Nagle for {peer}: {e}");
                        }

                        match broker.acquire().await {
                            Ok(slot) => {
                                tlog!("[listener] accepted connection from {peer}, slot {}", slot.id);
                                let broker = broker.clone();
                                let driver = driver.clone();
                                let status = status.clone();
                                tokio::spawn(async move {
                                    session::run_session(stream, peer, broker, driver, status, slot).await;
                                });
                            }
                            Err(AdapterError::Exhausted) => {
                                tlog!("[listener] broker exhausted, dropping connection from {peer}");
                                status.socketcand.sessions_rejected.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                                drop(stream);
                            }
                            Err(e) => tlog!("[listener] unexpected acquire error for {peer}: {e}"),
                        }
                    }
                    Ok(Err(e)) => tlog!("[listener] accept error: {e}"),
                    Err(_) => {} // poll timeout, loop back to check shutdown
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    tlog!("[listener] shutting down");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::can::loopback::LoopbackDriver;
    use crate::config::AdapterConfig;
    use crate::status::StatusAggregator;
    use std::sync::atomic::Ordering;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn handshake(stream: &mut TcpStream) {
        let mut buf = [0u8; 6];
        stream.read_exact(&mut buf).await.unwrap(); // < hi >
        stream.write_all(b"< open can0 >").await.unwrap();
        stream.read_exact(&mut buf).await.unwrap(); // < ok >
        stream.write_all(b"< rawmode >").await.unwrap();
        stream.read_exact(&mut buf).await.unwrap(); // < ok >
    }

    #[tokio::test]
    async fn rejects_connections_beyond_slot_count() {
        let broker = Broker::new();
        let driver: Arc<dyn CanDriver> = Arc::new(LoopbackDriver::new());
        let config = Arc::new(tokio::sync::RwLock::new(AdapterConfig::default()));
        let status = Arc::new(StatusAggregator::new(broker.clone(), driver.clone(), config));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let bind_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = bind_listener.local_addr().unwrap();
        drop(bind_listener); // free the port for run_listener to rebind

        let l_broker = broker.clone();
        let l_driver = driver.clone();
        let l_status = status.clone();
        let handle = tokio::spawn(async move {
            run_listener(addr, l_broker, l_driver, l_status, shutdown_rx).await
        });

        // Give the listener a moment to bind.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut clients = Vec::new();
        for _ in 0..SLOT_COUNT {
            let mut client = TcpStream::connect(addr).await.unwrap();
            handshake(&mut client).await;
            clients.push(client);
        }

        // The (SLOT_COUNT + 1)th connection finds the broker exhausted and
        // is closed immediately, with no handshake bytes sent at all.
        let mut overflow = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut probe = [0u8; 1];
        let n = overflow.read(&mut probe).await.unwrap_or(0);
        assert_eq!(n, 0, "over-capacity client should see the socket closed with no data");

        assert_eq!(status.socketcand.sessions_rejected.load(Ordering::Relaxed), 1);
        assert_eq!(broker.active_slots().await, SLOT_COUNT);

        shutdown_tx.send(true).unwrap();
        let _ = handle.await;
    }
}
