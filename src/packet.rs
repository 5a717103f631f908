//! ICMP / ICMPv6 Echo encoding, decoding and the Internet checksum.
//!
//! Both families share the same 8-byte echo header:
//! type, code, checksum, identifier, sequence, followed by the payload.

use std::net::{IpAddr, Ipv6Addr};

use crate::error::DecodeError;

pub const ICMP_HEADER_LEN: usize = 8;
const IPV4_MIN_HEADER_LEN: usize = 20;
const IPPROTO_ICMP: u8 = 1;
const IPPROTO_ICMPV6: u8 = 58;

pub const ICMPV4_ECHO_REQUEST: u8 = 8;
pub const ICMPV4_ECHO_REPLY: u8 = 0;
pub const ICMPV6_ECHO_REQUEST: u8 = 128;
pub const ICMPV6_ECHO_REPLY: u8 = 129;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }

    fn echo_request_type(self) -> u8 {
        match self {
            Family::V4 => ICMPV4_ECHO_REQUEST,
            Family::V6 => ICMPV6_ECHO_REQUEST,
        }
    }

    fn echo_reply_type(self) -> u8 {
        match self {
            Family::V4 => ICMPV4_ECHO_REPLY,
            Family::V6 => ICMPV6_ECHO_REPLY,
        }
    }
}

/// The IPv6 pseudo-header that ICMPv6 checksums cover (RFC 4443 §2.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PseudoHeader {
    pub source: Ipv6Addr,
    pub destination: Ipv6Addr,
}

impl PseudoHeader {
    pub fn new(source: Ipv6Addr, destination: Ipv6Addr) -> Self {
        Self { source, destination }
    }

    fn sum(&self, upper_layer_len: usize) -> u32 {
        let mut buf = [0u8; 40];
        buf[..16].copy_from_slice(&self.source.octets());
        buf[16..32].copy_from_slice(&self.destination.octets());
        buf[32..36].copy_from_slice(&(upper_layer_len as u32).to_be_bytes());
        buf[39] = IPPROTO_ICMPV6;
        sum_words(&buf, 0)
    }
}

/// Echo Request as it leaves the engine. Only lives as long as the send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EchoRequest {
    pub identifier: u16,
    pub sequence: u16,
    pub payload: Vec<u8>,
    pub sent_at_ns: u128,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EchoReply {
    pub identifier: u16,
    pub sequence: u16,
    pub payload: Vec<u8>,
    pub source: IpAddr,
    /// The ICMP message itself, IP header stripped.
    pub message: Vec<u8>,
}

/// Why a datagram on the shared raw socket was not one of our echo replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unexpected {
    NotIcmp { protocol: u8 },
    BadChecksum,
    WrongType { icmp_type: u8, code: u8 },
    ForeignIdentifier(u16),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Reply(EchoReply),
    Unexpected(Unexpected),
}

fn sum_words(data: &[u8], initial: u32) -> u32 {
    let mut sum = initial;
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum += u16::from_be_bytes([word[0], word[1]]) as u32;
        sum = (sum & 0xffff) + (sum >> 16);
    }
    if let [last] = chunks.remainder() {
        sum += u16::from_be_bytes([*last, 0]) as u32;
    }
    sum
}

fn fold(mut sum: u32) -> u16 {
    while (sum >> 16) != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// RFC 1071 Internet checksum. An odd trailing byte is zero padded.
pub fn checksum(data: &[u8]) -> u16 {
    fold(sum_words(data, 0))
}

fn icmp_checksum(message: &[u8], pseudo: Option<&PseudoHeader>) -> u16 {
    let initial = pseudo.map(|p| p.sum(message.len())).unwrap_or(0);
    fold(sum_words(message, initial))
}

fn encode_echo(
    icmp_type: u8,
    identifier: u16,
    sequence: u16,
    payload: &[u8],
    pseudo: Option<&PseudoHeader>,
    family: Family,
) -> Vec<u8> {
    let mut packet = Vec::with_capacity(ICMP_HEADER_LEN + payload.len());
    packet.push(icmp_type);
    packet.push(0);
    packet.extend_from_slice(&[0, 0]);
    packet.extend_from_slice(&identifier.to_be_bytes());
    packet.extend_from_slice(&sequence.to_be_bytes());
    packet.extend_from_slice(payload);

    // Without a pseudo-header the kernel fills in the ICMPv6 checksum.
    let sum = match (family, pseudo) {
        (Family::V4, _) => Some(icmp_checksum(&packet, None)),
        (Family::V6, Some(p)) => Some(icmp_checksum(&packet, Some(p))),
        (Family::V6, None) => None,
    };
    if let Some(sum) = sum {
        packet[2..4].copy_from_slice(&sum.to_be_bytes());
    }
    packet
}

/// Builds an Echo Request (type 8 / 128) with its checksum filled in.
pub fn encode_echo_request(
    identifier: u16,
    sequence: u16,
    payload: &[u8],
    family: Family,
    pseudo: Option<&PseudoHeader>,
) -> Vec<u8> {
    encode_echo(family.echo_request_type(), identifier, sequence, payload, pseudo, family)
}

/// Builds an Echo Reply (type 0 / 129). Used by responders and loopback tests.
pub fn encode_echo_reply(
    identifier: u16,
    sequence: u16,
    payload: &[u8],
    family: Family,
    pseudo: Option<&PseudoHeader>,
) -> Vec<u8> {
    encode_echo(family.echo_reply_type(), identifier, sequence, payload, pseudo, family)
}

/// Returns the ICMP message inside an IPv4 datagram as delivered by a raw socket.
fn strip_ipv4_header(datagram: &[u8]) -> Result<Result<&[u8], Unexpected>, DecodeError> {
    if datagram.len() < IPV4_MIN_HEADER_LEN {
        return Err(DecodeError::Truncated {
            len: datagram.len(),
            needed: IPV4_MIN_HEADER_LEN,
        });
    }
    let version = datagram[0] >> 4;
    if version != 4 {
        return Err(DecodeError::NotIpv4(version));
    }
    let header_len = ((datagram[0] & 0x0f) as usize) * 4;
    if header_len < IPV4_MIN_HEADER_LEN {
        return Err(DecodeError::BadHeaderLength(header_len));
    }
    if datagram.len() < header_len + ICMP_HEADER_LEN {
        return Err(DecodeError::Truncated {
            len: datagram.len(),
            needed: header_len + ICMP_HEADER_LEN,
        });
    }
    let protocol = datagram[9];
    if protocol != IPPROTO_ICMP {
        return Ok(Err(Unexpected::NotIcmp { protocol }));
    }
    Ok(Ok(&datagram[header_len..]))
}

/// Parses a datagram read from a raw socket of `family`.
///
/// IPv4 datagrams carry their IP header, IPv6 ones do not. Anything that is
/// well framed but not a valid Echo Reply comes back as `Decoded::Unexpected`;
/// only broken framing is an error. The identifier is not checked here.
///
/// For IPv6 the checksum is verified only when `pseudo` is given (oriented
/// from the replying peer to us); otherwise the kernel has already checked it.
pub fn decode(
    datagram: &[u8],
    family: Family,
    source: IpAddr,
    pseudo: Option<&PseudoHeader>,
) -> Result<Decoded, DecodeError> {
    let message = match family {
        Family::V4 => match strip_ipv4_header(datagram)? {
            Ok(message) => message,
            Err(unexpected) => return Ok(Decoded::Unexpected(unexpected)),
        },
        Family::V6 => {
            if datagram.len() < ICMP_HEADER_LEN {
                return Err(DecodeError::Truncated {
                    len: datagram.len(),
                    needed: ICMP_HEADER_LEN,
                });
            }
            datagram
        }
    };

    let valid = match (family, pseudo) {
        (Family::V4, _) => icmp_checksum(message, None) == 0,
        (Family::V6, Some(p)) => icmp_checksum(message, Some(p)) == 0,
        (Family::V6, None) => true,
    };
    if !valid {
        return Ok(Decoded::Unexpected(Unexpected::BadChecksum));
    }

    let (icmp_type, code) = (message[0], message[1]);
    if icmp_type != family.echo_reply_type() || code != 0 {
        return Ok(Decoded::Unexpected(Unexpected::WrongType { icmp_type, code }));
    }

    Ok(Decoded::Reply(EchoReply {
        identifier: u16::from_be_bytes([message[4], message[5]]),
        sequence: u16::from_be_bytes([message[6], message[7]]),
        payload: message[ICMP_HEADER_LEN..].to_vec(),
        source,
        message: message.to_vec(),
    }))
}

#[cfg(test)]
pub(crate) fn ipv4_datagram(source: std::net::Ipv4Addr, icmp: &[u8]) -> Vec<u8> {
    let mut header = vec![0u8; IPV4_MIN_HEADER_LEN];
    header[0] = 0x45;
    header[2..4].copy_from_slice(&((IPV4_MIN_HEADER_LEN + icmp.len()) as u16).to_be_bytes());
    header[8] = 64;
    header[9] = IPPROTO_ICMP;
    header[12..16].copy_from_slice(&source.octets());
    header[16..20].copy_from_slice(&[127, 0, 0, 1]);
    let sum = checksum(&header);
    header[10..12].copy_from_slice(&sum.to_be_bytes());
    header.extend_from_slice(icmp);
    header
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::net::Ipv4Addr;

    const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn v6_pseudo() -> PseudoHeader {
        PseudoHeader::new("fe80::1".parse().unwrap(), "2001:db8::7".parse().unwrap())
    }

    #[test]
    fn checksum_of_known_header() {
        let mut header = [0x08, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x01];
        let sum = checksum(&header);
        assert_eq!(sum, 0xf7fd);

        header[2..4].copy_from_slice(&sum.to_be_bytes());
        assert_eq!(checksum(&header), 0);
    }

    #[test]
    fn checksum_pads_odd_byte() {
        assert_eq!(checksum(&[0x12]), !0x1200);
        assert_eq!(checksum(&[0xab, 0xcd, 0x12]), !(0xabcdu16 + 0x1200));
    }

    #[test]
    fn encodes_v4_request_header() {
        let packet = encode_echo_request(0x1234, 7, b"hi", Family::V4, None);
        assert_eq!(packet.len(), ICMP_HEADER_LEN + 2);
        assert_eq!(&packet[..2], &[8, 0]);
        assert_eq!(&packet[4..8], &[0x12, 0x34, 0x00, 0x07]);
        assert_eq!(&packet[8..], b"hi");
        assert_eq!(checksum(&packet), 0);
    }

    #[test]
    fn v6_request_without_pseudo_leaves_checksum_to_kernel() {
        let packet = encode_echo_request(1, 1, &[], Family::V6, None);
        assert_eq!(packet[0], ICMPV6_ECHO_REQUEST);
        assert_eq!(&packet[2..4], &[0, 0]);
    }

    #[test]
    fn v6_checksum_covers_pseudo_header() {
        let pseudo = v6_pseudo();
        let packet = encode_echo_request(1, 1, b"abc", Family::V6, Some(&pseudo));
        assert_eq!(icmp_checksum(&packet, Some(&pseudo)), 0);
        assert_ne!(checksum(&packet), 0);
    }

    #[test]
    fn request_is_not_a_reply() {
        let packet = encode_echo_request(1, 1, &[], Family::V4, None);
        let datagram = ipv4_datagram(Ipv4Addr::LOCALHOST, &packet);
        assert_eq!(
            decode(&datagram, Family::V4, LOOPBACK, None),
            Ok(Decoded::Unexpected(Unexpected::WrongType { icmp_type: 8, code: 0 }))
        );
    }

    #[test]
    fn skips_ipv4_options() {
        let reply = encode_echo_reply(9, 3, b"xyz", Family::V4, None);
        let mut datagram = ipv4_datagram(Ipv4Addr::LOCALHOST, &[]);
        datagram[0] = 0x46;
        datagram.extend_from_slice(&[1, 1, 1, 0]);
        datagram.extend_from_slice(&reply);

        match decode(&datagram, Family::V4, LOOPBACK, None) {
            Ok(Decoded::Reply(r)) => {
                assert_eq!((r.identifier, r.sequence), (9, 3));
                assert_eq!(r.payload, b"xyz");
                assert_eq!(r.message, reply);
            }
            other => panic!("unexpected decode result {other:?}"),
        }
    }

    #[test]
    fn rejects_non_icmp_protocol() {
        let reply = encode_echo_reply(9, 3, &[], Family::V4, None);
        let mut datagram = ipv4_datagram(Ipv4Addr::LOCALHOST, &reply);
        datagram[9] = 17;
        assert_eq!(
            decode(&datagram, Family::V4, LOOPBACK, None),
            Ok(Decoded::Unexpected(Unexpected::NotIcmp { protocol: 17 }))
        );
    }

    #[test]
    fn framing_errors() {
        assert_eq!(
            decode(&[0x45; 10], Family::V4, LOOPBACK, None),
            Err(DecodeError::Truncated { len: 10, needed: 20 })
        );

        let mut datagram = ipv4_datagram(Ipv4Addr::LOCALHOST, &[0; 8]);
        datagram[0] = 0x60;
        assert_eq!(
            decode(&datagram, Family::V4, LOOPBACK, None),
            Err(DecodeError::NotIpv4(6))
        );

        datagram[0] = 0x44;
        assert_eq!(
            decode(&datagram, Family::V4, LOOPBACK, None),
            Err(DecodeError::BadHeaderLength(16))
        );

        let datagram = ipv4_datagram(Ipv4Addr::LOCALHOST, &[0; 4]);
        assert_eq!(
            decode(&datagram, Family::V4, LOOPBACK, None),
            Err(DecodeError::Truncated { len: 24, needed: 28 })
        );

        let src: IpAddr = "::1".parse().unwrap();
        assert_eq!(
            decode(&[129, 0, 0], Family::V6, src, None),
            Err(DecodeError::Truncated { len: 3, needed: 8 })
        );
    }

    #[test]
    fn v6_reply_with_bad_checksum_is_unexpected() {
        let pseudo = v6_pseudo();
        let mut reply = encode_echo_reply(4, 4, b"p", Family::V6, Some(&pseudo));
        reply[8] ^= 0x01;
        let src = IpAddr::V6(pseudo.source);
        assert_eq!(
            decode(&reply, Family::V6, src, Some(&pseudo)),
            Ok(Decoded::Unexpected(Unexpected::BadChecksum))
        );
        // Kernel-verified path trusts the message as-is.
        assert!(matches!(
            decode(&reply, Family::V6, src, None),
            Ok(Decoded::Reply(_))
        ));
    }

    proptest! {
        #[test]
        fn v4_reply_roundtrip(id in any::<u16>(), seq in any::<u16>(),
                              payload in prop::collection::vec(any::<u8>(), 0..128)) {
            let reply = encode_echo_reply(id, seq, &payload, Family::V4, None);
            prop_assert_eq!(checksum(&reply), 0);
            let datagram = ipv4_datagram(Ipv4Addr::new(10, 0, 0, 1), &reply);
            match decode(&datagram, Family::V4, LOOPBACK, None) {
                Ok(Decoded::Reply(r)) => {
                    prop_assert_eq!(r.identifier, id);
                    prop_assert_eq!(r.sequence, seq);
                    prop_assert_eq!(r.payload, payload);
                }
                other => prop_assert!(false, "decode failed: {:?}", other),
            }
        }

        #[test]
        fn v6_reply_roundtrip(id in any::<u16>(), seq in any::<u16>(),
                              payload in prop::collection::vec(any::<u8>(), 0..128)) {
            let pseudo = v6_pseudo();
            let reply = encode_echo_reply(id, seq, &payload, Family::V6, Some(&pseudo));
            let src = IpAddr::V6(pseudo.source);
            match decode(&reply, Family::V6, src, Some(&pseudo)) {
                Ok(Decoded::Reply(r)) => {
                    prop_assert_eq!(r.sequence, seq);
                    prop_assert_eq!(r.payload, payload);
                    prop_assert_eq!(r.source, src);
                }
                other => prop_assert!(false, "decode failed: {:?}", other),
            }
        }

        #[test]
        fn single_bit_corruption_is_never_a_reply(
            payload in prop::collection::vec(any::<u8>(), 0..64),
            bit in any::<prop::sample::Index>(),
        ) {
            let reply = encode_echo_reply(0xbeef, 42, &payload, Family::V4, None);
            let mut corrupted = reply.clone();
            let bit = bit.index(reply.len() * 8);
            corrupted[bit / 8] ^= 1 << (bit % 8);

            let datagram = ipv4_datagram(Ipv4Addr::LOCALHOST, &corrupted);
            let decoded = decode(&datagram, Family::V4, LOOPBACK, None);
            prop_assert!(matches!(decoded, Ok(Decoded::Unexpected(_))), "got {:?}", decoded);
        }

        #[test]
        fn decode_never_panics(data in prop::collection::vec(any::<u8>(), 0..256)) {
            let _ = decode(&data, Family::V4, LOOPBACK, None);
            let _ = decode(&data, Family::V6, LOOPBACK, Some(&v6_pseudo()));
        }
    }
}
