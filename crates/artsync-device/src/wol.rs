//! Wake-on-LAN magic packets.

use std::net::{Ipv4Addr, SocketAddrV4};

use tokio::net::UdpSocket;

use artsync_core::config::parse_mac;

use crate::error::{DeviceError, DeviceResult};

pub const WOL_PORT: u16 = 9;

/// Six `0xff` bytes followed by the MAC repeated sixteen times.
pub fn magic_packet(mac: [u8; 6]) -> [u8; 102] {
    let mut packet = [0xffu8; 102];
    for chunk in packet[6..].chunks_exact_mut(6) {
        chunk.copy_from_slice(&mac);
    }
    packet
}

/// Broadcast one magic packet for `mac` to `broadcast:9`.
pub async fn send_magic_packet(mac: &str, broadcast: &str) -> DeviceResult<()> {
    let mac = parse_mac(mac).map_err(|e| DeviceError::Transport(e.to_string()))?;
    let addr: Ipv4Addr = broadcast
        .parse()
        .map_err(|_| DeviceError::Transport(format!("invalid broadcast address {broadcast:?}")))?;

    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.set_broadcast(true)?;
    let packet = magic_packet(mac);
    let sent = socket
        .send_to(&packet, SocketAddrV4::new(addr, WOL_PORT))
        .await?;
    if sent != packet.len() {
        return Err(DeviceError::Transport(format!(
            "short WoL send: {sent}/{} bytes",
            packet.len()
        )));
    }
    tracing::debug!(%broadcast, "sent WoL magic packet");
    Ok(())
}
