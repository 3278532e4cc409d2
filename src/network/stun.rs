use async_trait::async_trait;
use log::{debug, info};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::net::UdpSocket;
use tokio::time::{timeout, Duration};

use crate::network::discovery::Stun;
use crate::utils::{Result, WeaveError};

const BINDING_REQUEST: u16 = 0x0001;
const BINDING_RESPONSE: u16 = 0x0101;
const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const MAGIC_COOKIE: u32 = 0x2112_A442;

/// Minimal RFC 5389 binding-request client. One query per call over a
/// fresh ephemeral socket; the mapped port therefore reflects the NAT's
/// mapping for that probe socket, not for the TCP listener.
pub struct StunClient {
    timeout: Duration,
}

impl StunClient {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Stun for StunClient {
    async fn query(&self, server: &str) -> Result<SocketAddr> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;

        let transaction_id: [u8; 12] = rand::random();
        let request = build_binding_request(&transaction_id);

        socket.send_to(&request, server).await?;
        debug!("Sent STUN binding request to {}", server);

        let mut buf = [0u8; 576];
        let (len, _) = timeout(self.timeout, socket.recv_from(&mut buf))
            .await
            .map_err(|_| {
                WeaveError::DiscoveryFailed(format!("STUN request to {} timed out", server))
            })??;

        let mapped = parse_binding_response(&buf[..len], &transaction_id)?;
        info!("STUN mapped address via {}: {}", server, mapped);
        Ok(mapped)
    }
}

fn build_binding_request(transaction_id: &[u8; 12]) -> [u8; 20] {
    let mut packet = [0u8; 20];
    packet[0..2].copy_from_slice(&BINDING_REQUEST.to_be_bytes());
    // message length stays 0: no attributes
    packet[4..8].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    packet[8..20].copy_from_slice(transaction_id);
    packet
}

fn parse_binding_response(data: &[u8], expected_txn: &[u8; 12]) -> Result<SocketAddr> {
    if data.len() < 20 {
        return Err(WeaveError::DiscoveryFailed(
            "STUN response too short".to_string(),
        ));
    }

    let msg_type = u16::from_be_bytes([data[0], data[1]]);
    if msg_type != BINDING_RESPONSE {
        return Err(WeaveError::DiscoveryFailed(format!(
            "unexpected STUN message type 0x{:04x}",
            msg_type
        )));
    }

    let cookie = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    if cookie != MAGIC_COOKIE {
        return Err(WeaveError::DiscoveryFailed(
            "invalid STUN magic cookie".to_string(),
        ));
    }

    if &data[8..20] != expected_txn {
        return Err(WeaveError::DiscoveryFailed(
            "STUN transaction id mismatch".to_string(),
        ));
    }

    let mut fallback: Option<SocketAddr> = None;
    let mut pos = 20;
    while pos + 4 <= data.len() {
        let attr_type = u16::from_be_bytes([data[pos], data[pos + 1]]);
        let attr_len = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
        pos += 4;

        if pos + attr_len > data.len() {
            break;
        }

        match attr_type {
            ATTR_XOR_MAPPED_ADDRESS => {
                if let Some(addr) = parse_address(&data[pos..pos + attr_len], true) {
                    return Ok(addr);
                }
            }
            ATTR_MAPPED_ADDRESS => {
                if let Some(addr) = parse_address(&data[pos..pos + attr_len], false) {
                    fallback = Some(addr);
                }
            }
            _ => {}
        }

        // attributes are padded to 4-byte boundaries
        pos += (attr_len + 3) & !3;
    }

    fallback.ok_or_else(|| {
        WeaveError::DiscoveryFailed("no mapped address in STUN response".to_string())
    })
}

/// Decode a (XOR-)MAPPED-ADDRESS attribute. Only the IPv4 family is
/// handled; every server in the default list answers IPv4.
fn parse_address(data: &[u8], xor: bool) -> Option<SocketAddr> {
    if data.len() < 8 || data[1] != 0x01 {
        return None;
    }

    let cookie = MAGIC_COOKIE.to_be_bytes();

    let mut port = u16::from_be_bytes([data[2], data[3]]);
    if xor {
        port ^= u16::from_be_bytes([cookie[0], cookie[1]]);
    }

    let mut ip = [data[4], data[5], data[6], data[7]];
    if xor {
        for (byte, mask) in ip.iter_mut().zip(cookie.iter()) {
            *byte ^= mask;
        }
    }

    Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(ip)), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response_with_attr(txn: &[u8; 12], attr_type: u16, attr: &[u8]) -> Vec<u8> {
        let mut packet = Vec::new();
        packet.extend_from_slice(&BINDING_RESPONSE.to_be_bytes());
        packet.extend_from_slice(&((attr.len() as u16 + 4).to_be_bytes()));
        packet.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        packet.extend_from_slice(txn);
        packet.extend_from_slice(&attr_type.to_be_bytes());
        packet.extend_from_slice(&(attr.len() as u16).to_be_bytes());
        packet.extend_from_slice(attr);
        packet
    }

    #[test]
    fn test_request_layout() {
        let txn = [7u8; 12];
        let request = build_binding_request(&txn);

        assert_eq!(&request[0..2], &[0x00, 0x01]);
        assert_eq!(&request[2..4], &[0x00, 0x00]);
        assert_eq!(&request[4..8], &MAGIC_COOKIE.to_be_bytes());
        assert_eq!(&request[8..20], &txn);
    }

    #[test]
    fn test_parse_xor_mapped_address() {
        let txn = [3u8; 12];
        let cookie = MAGIC_COOKIE.to_be_bytes();

        // 203.0.113.9:54321, XOR-encoded
        let port = 54321u16 ^ u16::from_be_bytes([cookie[0], cookie[1]]);
        let ip = [203 ^ cookie[0], 0 ^ cookie[1], 113 ^ cookie[2], 9 ^ cookie[3]];

        let mut attr = vec![0x00, 0x01];
        attr.extend_from_slice(&port.to_be_bytes());
        attr.extend_from_slice(&ip);

        let packet = response_with_attr(&txn, ATTR_XOR_MAPPED_ADDRESS, &attr);
        let addr = parse_binding_response(&packet, &txn).unwrap();
        assert_eq!(addr, "203.0.113.9:54321".parse().unwrap());
    }

    #[test]
    fn test_parse_plain_mapped_address_fallback() {
        let txn = [9u8; 12];

        let mut attr = vec![0x00, 0x01];
        attr.extend_from_slice(&19302u16.to_be_bytes());
        attr.extend_from_slice(&[198, 51, 100, 4]);

        let packet = response_with_attr(&txn, ATTR_MAPPED_ADDRESS, &attr);
        let addr = parse_binding_response(&packet, &txn).unwrap();
        assert_eq!(addr, "198.51.100.4:19302".parse().unwrap());
    }

    #[test]
    fn test_parse_rejects_wrong_transaction() {
        let txn = [1u8; 12];
        let other = [2u8; 12];

        let mut attr = vec![0x00, 0x01];
        attr.extend_from_slice(&80u16.to_be_bytes());
        attr.extend_from_slice(&[192, 0, 2, 1]);

        let packet = response_with_attr(&txn, ATTR_MAPPED_ADDRESS, &attr);
        let err = parse_binding_response(&packet, &other).unwrap_err();
        assert!(matches!(err, WeaveError::DiscoveryFailed(_)));
    }

    #[test]
    fn test_parse_rejects_truncated_packet() {
        let err = parse_binding_response(&[0u8; 8], &[0u8; 12]).unwrap_err();
        assert!(matches!(err, WeaveError::DiscoveryFailed(_)));
    }
}
