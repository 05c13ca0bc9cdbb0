//! IP packet header parsing.
//!
//! The router only needs enough of the header to route: version, declared
//! length, protocol and the address pair. Anything past the fixed header is
//! opaque payload that belongs to the encryption pipeline.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::ProtocolError;

/// IP version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpVersion {
    V4,
    V6,
}

/// Parsed view over a raw IP packet. Borrows the packet bytes.
#[derive(Debug, Clone)]
pub struct IpPacket<'a> {
    /// IP version.
    pub version: IpVersion,
    /// Fixed + options header length in bytes.
    pub header_len: usize,
    /// Total packet length the header declares.
    pub total_len: usize,
    /// Transport protocol number (IPv6: next header after the fixed header).
    pub protocol: u8,
    /// Source address.
    pub src_addr: IpAddr,
    /// Destination address. The router keys endpoint lookup on this.
    pub dst_addr: IpAddr,
    /// The raw packet bytes.
    pub data: &'a [u8],
}

impl<'a> IpPacket<'a> {
    /// Parse the IP header out of raw bytes.
    pub fn parse(data: &'a [u8]) -> Result<Self, ProtocolError> {
        let first = *data.first().ok_or(ProtocolError::EmptyPacket)?;
        match first >> 4 {
            4 => Self::parse_v4(data),
            6 => Self::parse_v6(data),
            v => Err(ProtocolError::UnknownVersion(v)),
        }
    }

    fn parse_v4(data: &'a [u8]) -> Result<Self, ProtocolError> {
        if data.len() < 20 {
            return Err(ProtocolError::TruncatedHeader {
                got: data.len(),
                need: 20,
            });
        }
        let header_len = ((data[0] & 0x0f) as usize) * 4;
        if header_len < 20 {
            return Err(ProtocolError::MalformedPacket(format!(
                "IPv4 IHL {header_len} below minimum header"
            )));
        }
        if data.len() < header_len {
            return Err(ProtocolError::TruncatedHeader {
                got: data.len(),
                need: header_len,
            });
        }
        let total_len = u16::from_be_bytes([data[2], data[3]]) as usize;
        if total_len < header_len || total_len > data.len() {
            return Err(ProtocolError::MalformedPacket(format!(
                "IPv4 total length {total_len} inconsistent with {} bytes",
                data.len()
            )));
        }
        Ok(Self {
            version: IpVersion::V4,
            header_len,
            total_len,
            protocol: data[9],
            src_addr: IpAddr::V4(Ipv4Addr::new(data[12], data[13], data[14], data[15])),
            dst_addr: IpAddr::V4(Ipv4Addr::new(data[16], data[17], data[18], data[19])),
            data,
        })
    }

    fn parse_v6(data: &'a [u8]) -> Result<Self, ProtocolError> {
        if data.len() < 40 {
            return Err(ProtocolError::TruncatedHeader {
                got: data.len(),
                need: 40,
            });
        }
        let payload_len = u16::from_be_bytes([data[4], data[5]]) as usize;
        if 40 + payload_len > data.len() {
            return Err(ProtocolError::MalformedPacket(format!(
                "IPv6 payload length {payload_len} inconsistent with {} bytes",
                data.len()
            )));
        }
        let mut src = [0u8; 16];
        let mut dst = [0u8; 16];
        src.copy_from_slice(&data[8..24]);
        dst.copy_from_slice(&data[24..40]);
        Ok(Self {
            version: IpVersion::V6,
            header_len: 40,
            total_len: 40 + payload_len,
            protocol: data[6],
            src_addr: IpAddr::V6(Ipv6Addr::from(src)),
            dst_addr: IpAddr::V6(Ipv6Addr::from(dst)),
            data,
        })
    }

    /// Bytes after the IP header.
    pub fn payload(&self) -> &[u8] {
        &self.data[self.header_len.min(self.data.len())..]
    }
}

/// Build a minimal valid IPv4 UDP packet. Handy for demos and tests; the
/// checksum fields are left zero.
pub fn build_ipv4_udp(src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8]) -> Vec<u8> {
    let total_len = 20 + 8 + payload.len();
    let mut packet = Vec::with_capacity(total_len);
    packet.push(0x45);
    packet.push(0);
    packet.extend_from_slice(&(total_len as u16).to_be_bytes());
    packet.extend_from_slice(&[0, 0, 0, 0]); // id, flags, fragment offset
    packet.push(64); // ttl
    packet.push(17); // udp
    packet.extend_from_slice(&[0, 0]); // header checksum
    packet.extend_from_slice(&src.octets());
    packet.extend_from_slice(&dst.octets());
    packet.extend_from_slice(&[0x13, 0x88, 0x13, 0x88]); // ports 5000/5000
    packet.extend_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
    packet.extend_from_slice(&[0, 0]); // udp checksum
    packet.extend_from_slice(payload);
    packet
}
