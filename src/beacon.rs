// src/beacon.rs
//
// UDP discovery beacon: periodically broadcasts a `<CANBeacon>` XML
// advertisement so LAN tooling can find this adapter without a fixed
// address. Grounded on original_source/main/discovery_beacon.c for the XML
// shape and broadcast-socket setup; loop cadence follows the same
// tokio::time::sleep poll-loop idiom used by the supervisor and status
// modules elsewhere in this repository.

use std::net::Ipv4Addr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::watch;

use crate::config::AdapterConfig;
use crate::tlog;

const BEACON_INTERVAL: Duration = Duration::from_secs(2);
const BROADCAST_ADDR: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 255);

fn beacon_xml(local_ip: Ipv4Addr, port: u16) -> String {
    format!(
        "<CANBeacon name='socketcand-bridge' type='adapter' description='socketcand bridge'>\n\
         <URL>can://{local_ip}:{port}</URL>\n\
         <Bus name='can0'/>\n\
         </CANBeacon>\n"
    )
}

/// Broadcasts the beacon every two seconds until `shutdown` fires. Socket
/// errors are logged and the loop continues, as in the original firmware's
/// never-exiting beacon task.
pub async fn run_beacon(config: AdapterConfig, local_ip: Ipv4Addr, mut shutdown: watch::Receiver<bool>) {
    let socket = match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await {
        Ok(s) => s,
        Err(e) => {
            tlog!("[beacon] failed to bind UDP socket: {e}");
            return;
        }
    };
    if let Err(e) = socket.set_broadcast(true) {
        tlog!("[beacon] failed to enable broadcast: {e}");
        return;
    }

    let mut ticker = tokio::time::interval(BEACON_INTERVAL);
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

        let xml = beacon_xml(local_ip, config.socketcand_port);
        if let Err(e) = socket.send_to(xml.as_bytes(), (BROADCAST_ADDR, config.beacon_port)).await {
            tlog!("[beacon] send failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xml_contains_expected_shape() {
        let xml = beacon_xml(Ipv4Addr::new(192, 168, 1, 50), 29536);
        assert!(xml.contains("<CANBeacon"));
        assert!(xml.contains("<URL>can://192.168.1.50:29536</URL>"));
        assert!(xml.contains("<Bus name='can0'/>"));
        assert!(xml.trim_end().ends_with("</CANBeacon>"));
    }
}
