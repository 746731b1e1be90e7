use byteorder::{BigEndian, ByteOrder, ReadBytesExt};
use std::io::{Cursor, Read};

use crate::error::PingError;

pub const ICMP_ECHO_REPLY: u8 = 0;
pub const ICMP_DEST_UNREACHABLE: u8 = 3;
pub const ICMP_ECHO_REQUEST: u8 = 8;
pub const ICMP_TIME_EXCEEDED: u8 = 11;

pub const ICMPV6_DEST_UNREACHABLE: u8 = 1;
pub const ICMPV6_TIME_EXCEEDED: u8 = 3;
pub const ICMPV6_ECHO_REQUEST: u8 = 128;
pub const ICMPV6_ECHO_REPLY: u8 = 129;

pub const ICMP_HEADER_LEN: usize = 8;
const IPV4_MIN_HEADER_LEN: usize = 20;
const IPV6_HEADER_LEN: usize = 40;

/// Default payload size, same as the Windows ping.
pub const DEFAULT_PAYLOAD_SIZE: usize = 32;
const PAYLOAD_FILL: u8 = 0x61;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IcmpPacket {
    pub icmp_type: u8,
    pub code: u8,
    pub checksum: u16,
    pub identifier: u16,
    pub sequence: u16,
    pub payload: Vec<u8>,
}

/// Identifier/sequence pair of an echo request, either ours or quoted inside an ICMP error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EchoId {
    pub identifier: u16,
    pub sequence: u16,
}

/// What an inbound datagram turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketKind {
    EchoReply {
        identifier: u16,
        sequence: u16,
        ttl: Option<u8>,
        payload: Vec<u8>,
    },
    /// Our own request looped back (pinging a local address on a raw socket).
    EchoRequest {
        identifier: u16,
        sequence: u16,
        ttl: Option<u8>,
        payload: Vec<u8>,
    },
    TimeExceeded {
        ttl: Option<u8>,
        original: Option<EchoId>,
    },
    DestinationUnreachable {
        code: u8,
        ttl: Option<u8>,
        original: Option<EchoId>,
    },
    Unrecognized {
        icmp_type: u8,
        code: u8,
    },
}

impl IcmpPacket {
    pub fn new(icmp_type: u8, identifier: u16, sequence: u16, payload: Vec<u8>) -> Self {
        let mut packet = Self {
            icmp_type,
            code: 0,
            checksum: 0,
            identifier,
            sequence,
            payload,
        };

        packet.calculate_checksum();
        packet
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, PingError> {
        if data.len() < ICMP_HEADER_LEN {
            return Err(PingError::MalformedPacket(format!(
                "ICMP packet too short: {} bytes",
                data.len()
            )));
        }

        let truncated = |e: std::io::Error| PingError::MalformedPacket(e.to_string());
        let mut cursor = Cursor::new(data);
        let icmp_type = cursor.read_u8().map_err(truncated)?;
        let code = cursor.read_u8().map_err(truncated)?;
        let checksum = cursor.read_u16::<BigEndian>().map_err(truncated)?;
        let identifier = cursor.read_u16::<BigEndian>().map_err(truncated)?;
        let sequence = cursor.read_u16::<BigEndian>().map_err(truncated)?;

        let mut payload = Vec::new();
        cursor.read_to_end(&mut payload).map_err(truncated)?;

        Ok(Self {
            icmp_type,
            code,
            checksum,
            identifier,
            sequence,
            payload,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; ICMP_HEADER_LEN + self.payload.len()];
        bytes[0] = self.icmp_type;
        bytes[1] = self.code;
        BigEndian::write_u16(&mut bytes[2..4], self.checksum);
        BigEndian::write_u16(&mut bytes[4..6], self.identifier);
        BigEndian::write_u16(&mut bytes[6..8], self.sequence);
        bytes[ICMP_HEADER_LEN..].copy_from_slice(&self.payload);
        bytes
    }

    pub fn calculate_checksum(&mut self) {
        self.checksum = 0;
        let bytes = self.to_bytes();
        self.checksum = compute_checksum(&bytes);
    }

    pub fn verify_checksum(&self) -> bool {
        compute_checksum(&self.to_bytes()) == 0
    }
}

/// RFC 1071 internet checksum.
pub fn compute_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut words = data.chunks_exact(2);

    for word in &mut words {
        sum += BigEndian::read_u16(word) as u32;
    }

    // Odd trailing byte is padded with zero
    if let [last] = words.remainder() {
        sum += (*last as u32) << 8;
    }

    while (sum >> 16) != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !sum as u16
}

pub fn echo_payload(payload_size: usize) -> Vec<u8> {
    vec![PAYLOAD_FILL; payload_size]
}

/// Build an echo request ready to hand to the transport.
pub fn encode(identifier: u16, sequence: u16, payload: &[u8], is_ipv6: bool) -> Vec<u8> {
    let icmp_type = if is_ipv6 { ICMPV6_ECHO_REQUEST } else { ICMP_ECHO_REQUEST };
    IcmpPacket::new(icmp_type, identifier, sequence, payload.to_vec()).to_bytes()
}

/// Classify an inbound datagram.
///
/// IPv4 datagrams from a raw socket start with the IP header, datagram sockets
/// hand over the bare ICMP message; both are accepted. ICMPv6 checksums cover
/// a pseudo header the kernel already verified, so only ICMPv4 checksums are
/// checked here.
pub fn decode(data: &[u8], is_ipv6: bool) -> Result<PacketKind, PingError> {
    let (icmp_data, ttl) = if is_ipv6 { (data, None) } else { strip_ipv4_header(data)? };

    let packet = IcmpPacket::from_bytes(icmp_data)?;
    if !is_ipv6 && !packet.verify_checksum() {
        return Err(PingError::MalformedPacket("ICMP checksum mismatch".to_string()));
    }

    log::debug!(
        "Decoded ICMP type {} code {} ({} bytes)",
        packet.icmp_type,
        packet.code,
        icmp_data.len()
    );

    let (reply, request, unreachable, exceeded) = if is_ipv6 {
        (ICMPV6_ECHO_REPLY, ICMPV6_ECHO_REQUEST, ICMPV6_DEST_UNREACHABLE, ICMPV6_TIME_EXCEEDED)
    } else {
        (ICMP_ECHO_REPLY, ICMP_ECHO_REQUEST, ICMP_DEST_UNREACHABLE, ICMP_TIME_EXCEEDED)
    };

    let kind = match packet.icmp_type {
        t if t == reply => PacketKind::EchoReply {
            identifier: packet.identifier,
            sequence: packet.sequence,
            ttl,
            payload: packet.payload,
        },
        t if t == request => PacketKind::EchoRequest {
            identifier: packet.identifier,
            sequence: packet.sequence,
            ttl,
            payload: packet.payload,
        },
        t if t == exceeded => PacketKind::TimeExceeded {
            ttl,
            original: quoted_echo(&packet.payload, is_ipv6),
        },
        t if t == unreachable => PacketKind::DestinationUnreachable {
            code: packet.code,
            ttl,
            original: quoted_echo(&packet.payload, is_ipv6),
        },
        other => PacketKind::Unrecognized {
            icmp_type: other,
            code: packet.code,
        },
    };

    Ok(kind)
}

fn strip_ipv4_header(data: &[u8]) -> Result<(&[u8], Option<u8>), PingError> {
    let Some(first) = data.first() else {
        return Err(PingError::MalformedPacket("empty datagram".to_string()));
    };

    if first >> 4 != 4 {
        return Ok((data, None));
    }

    let header_len = ((first & 0x0f) as usize) * 4;
    if header_len < IPV4_MIN_HEADER_LEN || data.len() < header_len {
        return Err(PingError::MalformedPacket(format!(
            "truncated IPv4 header: {} of {} bytes",
            data.len(),
            header_len.max(IPV4_MIN_HEADER_LEN)
        )));
    }

    // macOS hands raw datagrams over with total length rewritten in host order
    if !cfg!(target_os = "macos") && compute_checksum(&data[..header_len]) != 0 {
        return Err(PingError::MalformedPacket("IPv4 header checksum mismatch".to_string()));
    }

    Ok((&data[header_len..], Some(data[8])))
}

fn quoted_echo(body: &[u8], is_ipv6: bool) -> Option<EchoId> {
    let inner = if is_ipv6 {
        body.get(IPV6_HEADER_LEN..)?
    } else {
        let header_len = ((*body.first()? & 0x0f) as usize) * 4;
        if header_len < IPV4_MIN_HEADER_LEN {
            return None;
        }
        body.get(header_len..)?
    };

    let expected = if is_ipv6 { ICMPV6_ECHO_REQUEST } else { ICMP_ECHO_REQUEST };
    if inner.len() < ICMP_HEADER_LEN || inner[0] != expected {
        return None;
    }

    Some(EchoId {
        identifier: BigEndian::read_u16(&inner[4..6]),
        sequence: BigEndian::read_u16(&inner[6..8]),
    })
}
