//! Wake-on-LAN magic packets
//!
//! A magic packet is six `0xFF` bytes followed by the target's hardware
//! address repeated sixteen times. It is sent as a single UDP broadcast
//! datagram; delivery is never acknowledged, so callers resend on every
//! retry instead of checking for success.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4};
use std::str::FromStr;
use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::{debug, info};

/// Conventional Wake-on-LAN port (discard)
pub const WOL_PORT: u16 = 9;

/// Number of times the hardware address is repeated in a magic packet
const MAC_REPETITIONS: usize = 16;

/// Total magic packet length: 6 sync bytes + 16 * 6 address bytes
pub const MAGIC_PACKET_LEN: usize = 6 + MAC_REPETITIONS * 6;

/// Default destination for magic packets (limited broadcast on port 9)
pub fn default_broadcast_addr() -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, WOL_PORT))
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MacAddressError {
    #[error("expected 6 octets separated by ':' or '-', got {0:?}")]
    Format(String),
    #[error("invalid hex octet {octet:?} in {input:?}")]
    Octet { octet: String, input: String },
}

/// A 6-byte hardware address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Build the 102-byte magic packet for this address
    pub fn magic_packet(&self) -> [u8; MAGIC_PACKET_LEN] {
        let mut packet = [0xFF; MAGIC_PACKET_LEN];
        for chunk in packet[6..].chunks_exact_mut(6) {
            chunk.copy_from_slice(&self.0);
        }
        packet
    }
}

impl FromStr for MacAddress {
    type Err = MacAddressError;

    /// Parses `AA:BB:CC:DD:EE:FF` or `aa-bb-cc-dd-ee-ff`. Mixing separators is rejected.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let input = s.trim();
        let separator = if input.contains(':') { ':' } else { '-' };
        let parts: Vec<&str> = input.split(separator).collect();

        if parts.len() != 6 {
            return Err(MacAddressError::Format(input.to_string()));
        }

        let mut bytes = [0u8; 6];
        for (byte, part) in bytes.iter_mut().zip(&parts) {
            if part.len() != 2 || !part.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(MacAddressError::Octet {
                    octet: part.to_string(),
                    input: input.to_string(),
                });
            }
            *byte = u8::from_str_radix(part, 16).map_err(|_| MacAddressError::Octet {
                octet: part.to_string(),
                input: input.to_string(),
            })?;
        }

        Ok(Self(bytes))
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

#[derive(Debug, Error)]
#[error("failed to send magic packet for {mac} to {target}: {source}")]
pub struct PacketSendError {
    pub mac: MacAddress,
    pub target: SocketAddr,
    #[source]
    pub source: std::io::Error,
}

/// Transmits magic packets. Sending never suspends the caller.
pub trait PacketSender: Send + Sync {
    fn send(&self, mac: &MacAddress) -> Result<(), PacketSendError>;
}

/// Sends magic packets as UDP broadcast datagrams over one bound socket
#[derive(Debug)]
pub struct UdpBroadcastSender {
    socket: UdpSocket,
    target: SocketAddr,
}

impl UdpBroadcastSender {
    /// Bind an ephemeral broadcast-capable socket for packets to `target`
    pub async fn bind(target: SocketAddr) -> std::io::Result<Self> {
        let bind_addr: SocketAddr = match target {
            SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.set_broadcast(true)?;
        debug!(local = %socket.local_addr()?, target = %target, "Magic packet socket bound");
        Ok(Self { socket, target })
    }
}

impl PacketSender for UdpBroadcastSender {
    fn send(&self, mac: &MacAddress) -> Result<(), PacketSendError> {
        let packet = mac.magic_packet();
        info!(mac = %mac, target = %self.target, "Sending Wake-on-LAN magic packet");

        // Non-blocking; a full send buffer is reported like any other failure
        let sent = self
            .socket
            .try_send_to(&packet, self.target)
            .map_err(|source| PacketSendError {
                mac: *mac,
                target: self.target,
                source,
            })?;

        debug!(mac = %mac, bytes = sent, "Magic packet sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_magic_packet_layout() {
        let mac: MacAddress = "AA:BB:CC:DD:EE:FF".parse().unwrap();
        let packet = mac.magic_packet();

        assert_eq!(packet.len(), 102);
        assert_eq!(&packet[..6], &[0xFF; 6]);
        for repetition in packet[6..].chunks(6) {
            assert_eq!(repetition, &[0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        }
        assert_eq!(packet[6..].chunks(6).count(), 16);
    }

    #[test]
    fn test_parse_colon_and_hyphen() {
        let colon: MacAddress = "00:11:22:33:44:55".parse().unwrap();
        let hyphen: MacAddress = "00-11-22-33-44-55".parse().unwrap();
        assert_eq!(colon, hyphen);
        assert_eq!(colon.octets(), [0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
    }

    #[test]
    fn test_parse_is_case_insensitive() {
        let lower: MacAddress = "aa:bb:cc:dd:ee:ff".parse().unwrap();
        let upper: MacAddress = "AA:BB:CC:DD:EE:FF".parse().unwrap();
        assert_eq!(lower, upper);
        assert_eq!(lower.to_string(), "AA:BB:CC:DD:EE:FF");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(matches!(
            "00:11:22:33:44".parse::<MacAddress>(),
            Err(MacAddressError::Format(_))
        ));
        assert!(matches!(
            "00:11:22:33:44:55:66".parse::<MacAddress>(),
            Err(MacAddressError::Format(_))
        ));
        assert!(matches!(
            "00:11:22:33:44:GG".parse::<MacAddress>(),
            Err(MacAddressError::Octet { .. })
        ));
        assert!(matches!(
            "00:11-22:33:44:55".parse::<MacAddress>(),
            Err(MacAddressError::Format(_))
        ));
        assert!("001122334455".parse::<MacAddress>().is_err());
        assert!("".parse::<MacAddress>().is_err());
    }

    #[tokio::test]
    async fn test_udp_sender_delivers_payload() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let sender = UdpBroadcastSender::bind(receiver.local_addr().unwrap()).await.unwrap();
        let mac = MacAddress::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);

        // Same socket serves every attempt
        sender.send(&mac).unwrap();
        sender.send(&mac).unwrap();

        for _ in 0..2 {
            let mut buf = [0u8; 256];
            let (n, _) = tokio::time::timeout(Duration::from_secs(2), receiver.recv_from(&mut buf))
                .await
                .expect("packet within 2s")
                .unwrap();
            assert_eq!(n, MAGIC_PACKET_LEN);
            assert_eq!(&buf[..n], &mac.magic_packet()[..]);
        }
    }

    #[test]
    fn test_default_target_is_broadcast_port_9() {
        assert_eq!(default_broadcast_addr().to_string(), "255.255.255.255:9");
    }
}
