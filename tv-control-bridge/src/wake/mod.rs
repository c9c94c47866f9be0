//! Turn-on paths. The legacy transport cannot power a TV on, so this goes
//! around it: a configured on-action command, or wake-on-LAN.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::process::Command;

pub const WOL_PORT: u16 = 9;

#[derive(Debug, Error)]
pub enum WakeError {
    #[error("invalid MAC address: {0}")]
    InvalidMac(String),
    #[error("wake packet failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("on action failed: {0}")]
    Script(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacAddress([u8; 6]);

impl FromStr for MacAddress {
    type Err = WakeError;

    /// Accepts `aa:bb:cc:dd:ee:ff`, `aa-bb-cc-dd-ee-ff` and bare hex.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits: String = s
            .trim()
            .chars()
            .filter(|c| *c != ':' && *c != '-' && *c != '.')
            .collect();
        if digits.len() != 12 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(WakeError::InvalidMac(s.to_string()));
        }
        let mut octets = [0u8; 6];
        for (i, octet) in octets.iter_mut().enumerate() {
            *octet = u8::from_str_radix(&digits[i * 2..i * 2 + 2], 16)
                .map_err(|_| WakeError::InvalidMac(s.to_string()))?;
        }
        Ok(Self(octets))
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

/// Six 0xFF bytes followed by the MAC repeated sixteen times.
pub fn magic_packet(mac: MacAddress) -> [u8; 102] {
    let mut packet = [0xFFu8; 102];
    for chunk in packet[6..].chunks_exact_mut(6) {
        chunk.copy_from_slice(&mac.0);
    }
    packet
}

async fn send_to(packet: &[u8], target: SocketAddr, broadcast: bool) -> Result<(), WakeError> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.set_broadcast(broadcast)?;
    socket.send_to(packet, target).await?;
    Ok(())
}

/// Sends the magic packet to the TV's last known address and then as a
/// broadcast, in case the address changed while it slept.
pub async fn wake_on_lan(mac: MacAddress, host: &str) -> Result<(), WakeError> {
    wake_on_lan_to(mac, host, WOL_PORT, Ipv4Addr::BROADCAST).await
}

async fn wake_on_lan_to(
    mac: MacAddress,
    host: &str,
    port: u16,
    broadcast: Ipv4Addr,
) -> Result<(), WakeError> {
    let packet = magic_packet(mac);
    match tokio::net::lookup_host((host, port)).await {
        Ok(mut addrs) => {
            if let Some(addr) = addrs.find(SocketAddr::is_ipv4) {
                send_to(&packet, addr, false).await?;
            }
        }
        Err(err) => tracing::debug!(host, error = %err, "cannot resolve host for wake packet"),
    }
    send_to(&packet, SocketAddr::from((broadcast, port)), true).await?;
    tracing::debug!(%mac, host, "wake-on-lan sent");
    Ok(())
}

/// Runs the configured on-action command and waits for it to exit.
pub async fn run_on_action(argv: &[String]) -> Result<(), WakeError> {
    let Some((program, args)) = argv.split_first() else {
        return Err(WakeError::Script("empty command".to_string()));
    };
    let status = Command::new(program)
        .args(args)
        .status()
        .await
        .map_err(|e| WakeError::Script(format!("{program}: {e}")))?;
    if !status.success() {
        return Err(WakeError::Script(format!("{program} exited with {status}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_common_mac_notations() {
        let expected = MacAddress([0xaa, 0xbb, 0xcc, 0x01, 0x02, 0x03]);
        assert_eq!("aa:bb:cc:01:02:03".parse::<MacAddress>().unwrap(), expected);
        assert_eq!("AA-BB-CC-01-02-03".parse::<MacAddress>().unwrap(), expected);
        assert_eq!("aabbcc010203".parse::<MacAddress>().unwrap(), expected);
        assert_eq!(expected.to_string(), "aa:bb:cc:01:02:03");
    }

    #[test]
    fn rejects_malformed_mac() {
        assert!("aa:bb:cc".parse::<MacAddress>().is_err());
        assert!("zz:bb:cc:01:02:03".parse::<MacAddress>().is_err());
        assert!("".parse::<MacAddress>().is_err());
    }

    #[test]
    fn magic_packet_layout() {
        let mac: MacAddress = "01:23:45:67:89:ab".parse().unwrap();
        let packet = magic_packet(mac);
        assert_eq!(&packet[..6], &[0xFF; 6]);
        for chunk in packet[6..].chunks(6) {
            assert_eq!(chunk, &[0x01, 0x23, 0x45, 0x67, 0x89, 0xab]);
        }
    }

    #[tokio::test]
    async fn sends_to_host_and_broadcast_address() {
        let receiver = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = receiver.local_addr().unwrap().port();
        let mac: MacAddress = "01:23:45:67:89:ab".parse().unwrap();

        // Loopback stands in for the broadcast address so both packets land here.
        wake_on_lan_to(mac, "127.0.0.1", port, Ipv4Addr::LOCALHOST)
            .await
            .unwrap();

        let mut buf = [0u8; 256];
        for _ in 0..2 {
            let (len, _) = receiver.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[..len], &magic_packet(mac)[..]);
        }
    }

    #[tokio::test]
    async fn on_action_reports_failure() {
        assert!(run_on_action(&[]).await.is_err());
        assert!(run_on_action(&["false".to_string()]).await.is_err());
        assert!(run_on_action(&["true".to_string()]).await.is_ok());
    }
}
