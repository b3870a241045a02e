// src/main.rs
//
// Process entry point: loads config, builds the CAN driver for the target
// platform, and spawns every subsystem task under one shared shutdown
// signal.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use socketcand_bridge::can::bus_reader::run_bus_reader;
use socketcand_bridge::can::supervisor::run_supervisor;
use socketcand_bridge::can::CanDriver;
use socketcand_bridge::config;
use socketcand_bridge::cyphal::{run_heartbeat_listener, run_heartbeat_sender};
use socketcand_bridge::runtime::Runtime;
use socketcand_bridge::{beacon, http, listener, tlog};

/// Best-effort local IPv4 address, used only for the beacon's advertised
/// `can://` URL. Falls back to loopback if no route exists (e.g. sandboxed
/// CI), since a wrong advertised address only misleads discovery, it
/// doesn't affect the socketcand/HTTP listeners themselves.
async fn local_ipv4() -> Ipv4Addr {
    match tokio::net::UdpSocket::bind("0.0.0.0:0").await {
        Ok(socket) => match socket.connect("8.8.8.8:80").await {
            Ok(()) => match socket.local_addr() {
                Ok(SocketAddr::V4(addr)) => *addr.ip(),
                _ => Ipv4Addr::LOCALHOST,
            },
            Err(_) => Ipv4Addr::LOCALHOST,
        },
        Err(_) => Ipv4Addr::LOCALHOST,
    }
}

#[cfg(target_os = "linux")]
async fn build_driver() -> Arc<dyn CanDriver> {
    match socketcand_bridge::can::socketcan_driver::SocketCanDriver::open("can0") {
        Ok(driver) => Arc::new(driver),
        Err(e) => {
            tlog!("[main] failed to open can0 ({e}), falling back to loopback driver");
            Arc::new(socketcand_bridge::can::loopback::LoopbackDriver::new())
        }
    }
}

#[cfg(not(target_os = "linux"))]
async fn build_driver() -> Arc<dyn CanDriver> {
    Arc::new(socketcand_bridge::can::loopback::LoopbackDriver::new())
}

#[tokio::main]
async fn main() {
    let config = config::load_config();
    tlog!("[main] starting, hostname={}, bitrate={:?}", config.hostname, config.can_bitrate);

    let driver = build_driver().await;
    if let Err(e) = driver.start().await {
        tlog!("[main] driver start failed: {e}");
    }

    let socketcand_addr = SocketAddr::from(([0, 0, 0, 0], config.socketcand_port));
    let status_addr = SocketAddr::V4(config.status_bind);
    let cyphal_enabled = config.cyphal_enabled;
    let cyphal_node_id = config.cyphal_node_id;
    let local_ip = local_ipv4().await;

    let runtime = Runtime::new(driver.clone(), config);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let mut tasks: Vec<tokio::task::JoinHandle<()>> = Vec::new();

    {
        let broker = runtime.broker.clone();
        let driver = runtime.driver.clone();
        let status = runtime.status.clone();
        let shutdown_rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = listener::run_listener(socketcand_addr, broker, driver, status, shutdown_rx).await {
                tlog!("[main] listener exited: {e}");
            }
        }));
    }

    tasks.push(tokio::spawn(run_bus_reader(
        runtime.driver.clone(),
        runtime.broker.clone(),
        shutdown_rx.clone(),
    )));

    tasks.push(tokio::spawn(run_supervisor(runtime.driver.clone(), shutdown_rx.clone())));

    {
        let runtime = runtime.clone();
        let shutdown_rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = http::run_http_server(status_addr, runtime, shutdown_rx).await {
                tlog!("[main] http server exited: {e}");
            }
        }));
    }

    {
        let config = runtime.config.read().await.clone();
        let shutdown_rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(beacon::run_beacon(config, local_ip, shutdown_rx)));
    }

    if cyphal_enabled {
        let broker = runtime.broker.clone();
        let driver = runtime.driver.clone();
        let status = runtime.status.clone();
        let shutdown_rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(run_heartbeat_sender(
            cyphal_node_id,
            broker,
            driver,
            status,
            shutdown_rx,
        )));

        let broker = runtime.broker.clone();
        let status = runtime.status.clone();
        let shutdown_rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(run_heartbeat_listener(broker, status, shutdown_rx)));
    }

    tlog!("[main] socketcand on {socketcand_addr}, http on {status_addr}");

    if let Err(e) = tokio::signal::ctrl_c().await {
        tlog!("[main] failed to listen for ctrl-c: {e}");
    }
    tlog!("[main] shutdown signal received, stopping");
    let _ = shutdown_tx.send(true);

    for task in tasks {
        let _ = task.await;
    }
    tlog!("[main] stopped");
}
