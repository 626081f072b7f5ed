use std::fmt;
use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::Rng;
use slog;

use coding::{self, BufExt, BufMutExt};
use crypto::Crypto;
use {MAX_CID_SIZE, MIN_CID_SIZE, VERSION};

/// Length of the authentication tag the packet-protection AEAD appends.
pub const AEAD_TAG_SIZE: usize = 16;

/// An opaque connection identifier, 4-18 bytes (or empty).
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct ConnectionId {
    len: u8,
    bytes: [u8; MAX_CID_SIZE],
}

impl ConnectionId {
    pub fn new(data: &[u8]) -> Self {
        debug_assert!(data.is_empty() || (data.len() >= MIN_CID_SIZE && data.len() <= MAX_CID_SIZE));
        let mut bytes = [0; MAX_CID_SIZE];
        bytes[..data.len()].copy_from_slice(data);
        ConnectionId {
            len: data.len() as u8,
            bytes,
        }
    }

    pub fn random<R: Rng>(rng: &mut R, len: usize) -> Self {
        debug_assert!(len <= MAX_CID_SIZE);
        let mut bytes = [0; MAX_CID_SIZE];
        rng.fill_bytes(&mut bytes[..len]);
        ConnectionId {
            len: len as u8,
            bytes,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }
}

impl ::std::ops::Deref for ConnectionId {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for byte in self.iter() {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl slog::Value for ConnectionId {
    fn serialize(
        &self,
        _: &slog::Record,
        key: slog::Key,
        serializer: &mut slog::Serializer,
    ) -> slog::Result {
        serializer.emit_arguments(key, &format_args!("{}", self))
    }
}

/// A packet number as it appears on the wire: truncated relative to the
/// largest acknowledged number.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PacketNumber {
    U8(u8),
    U16(u16),
    U24(u32),
    U32(u32),
}

impl PacketNumber {
    pub fn new(n: u64, largest_acked: u64) -> Self {
        let range = (n - largest_acked) * 2;
        if range < 1 << 8 {
            PacketNumber::U8(n as u8)
        } else if range < 1 << 16 {
            PacketNumber::U16(n as u16)
        } else {
            debug_assert!(range < 1 << 32);
            PacketNumber::U32(n as u32)
        }
    }

    pub fn len(self) -> usize {
        match self {
            PacketNumber::U8(_) => 1,
            PacketNumber::U16(_) => 2,
            PacketNumber::U24(_) => 3,
            PacketNumber::U32(_) => 4,
        }
    }

    pub fn encode<W: BufMut>(self, w: &mut W) {
        match self {
            PacketNumber::U8(x) => w.put_u8(x),
            PacketNumber::U16(x) => w.put_u16(x),
            PacketNumber::U24(x) => {
                w.put_u8((x >> 16) as u8);
                w.put_u16(x as u16);
            }
            PacketNumber::U32(x) => w.put_u32(x),
        }
    }

    pub fn decode(len: usize, bytes: &[u8]) -> Self {
        let mut x = 0u32;
        for &b in &bytes[..len] {
            x = x << 8 | b as u32;
        }
        match len {
            1 => PacketNumber::U8(x as u8),
            2 => PacketNumber::U16(x as u16),
            3 => PacketNumber::U24(x),
            _ => PacketNumber::U32(x),
        }
    }

    /// Recover the full packet number given the next number we expect to see.
    pub fn expand(self, expected: u64) -> u64 {
        let (truncated, nbits) = match self {
            PacketNumber::U8(x) => (x as u64, 8),
            PacketNumber::U16(x) => (x as u64, 16),
            PacketNumber::U24(x) => (x as u64, 24),
            PacketNumber::U32(x) => (x as u64, 32),
        };
        let win = 1u64 << nbits;
        let hwin = win / 2;
        let mask = win - 1;
        let candidate = (expected & !mask) | truncated;
        if expected.checked_add(hwin).is_some() && candidate + hwin <= expected {
            candidate + win
        } else if candidate > expected + hwin && candidate >= win {
            candidate - win
        } else {
            candidate
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LongType {
    Handshake,
    ZeroRtt,
}

/// The cleartext portion of a packet.
#[derive(Debug, Clone)]
pub enum Header {
    Initial {
        src_cid: ConnectionId,
        dst_cid: ConnectionId,
        token: Bytes,
        number: PacketNumber,
    },
    Long {
        ty: LongType,
        src_cid: ConnectionId,
        dst_cid: ConnectionId,
        number: PacketNumber,
    },
    Retry {
        src_cid: ConnectionId,
        dst_cid: ConnectionId,
        orig_dst_cid: ConnectionId,
    },
    Short {
        dst_cid: ConnectionId,
        number: PacketNumber,
        key_phase: bool,
    },
    VersionNegotiate {
        random: u8,
        src_cid: ConnectionId,
        dst_cid: ConnectionId,
    },
}

impl Header {
    pub fn number(&self) -> Option<PacketNumber> {
        match *self {
            Header::Initial { number, .. }
            | Header::Long { number, .. }
            | Header::Short { number, .. } => Some(number),
            _ => None,
        }
    }

    pub fn src_cid(&self) -> Option<ConnectionId> {
        match *self {
            Header::Initial { src_cid, .. }
            | Header::Long { src_cid, .. }
            | Header::Retry { src_cid, .. }
            | Header::VersionNegotiate { src_cid, .. } => Some(src_cid),
            Header::Short { .. } => None,
        }
    }

    /// Write the header, returning state needed to protect it once the
    /// payload has been written and encrypted.
    pub fn encode(&self, w: &mut Vec<u8>) -> PartialEncode {
        use self::Header::*;
        match *self {
            Initial {
                ref src_cid,
                ref dst_cid,
                ref token,
                number,
            } => {
                w.put_u8(0xc0 | (number.len() as u8 - 1));
                w.write::<u32>(VERSION);
                w.put_u8(cid_lengths(dst_cid, src_cid));
                w.put_slice(dst_cid);
                w.put_slice(src_cid);
                w.write_var(token.len() as u64);
                w.put_slice(token);
                w.put_u16(0x4000); // length; patched by set_payload_length
                let pn_offset = w.len();
                number.encode(w);
                PartialEncode {
                    pn_offset: Some(pn_offset),
                }
            }
            Long {
                ty,
                ref src_cid,
                ref dst_cid,
                number,
            } => {
                let ty_bits = match ty {
                    LongType::ZeroRtt => 0x1,
                    LongType::Handshake => 0x2,
                };
                w.put_u8(0xc0 | ty_bits << 4 | (number.len() as u8 - 1));
                w.write::<u32>(VERSION);
                w.put_u8(cid_lengths(dst_cid, src_cid));
                w.put_slice(dst_cid);
                w.put_slice(src_cid);
                w.put_u16(0x4000);
                let pn_offset = w.len();
                number.encode(w);
                PartialEncode {
                    pn_offset: Some(pn_offset),
                }
            }
            Retry {
                ref src_cid,
                ref dst_cid,
                ref orig_dst_cid,
            } => {
                w.put_u8(0xc0 | 0x3 << 4 | encode_cid_length(orig_dst_cid));
                w.write::<u32>(VERSION);
                w.put_u8(cid_lengths(dst_cid, src_cid));
                w.put_slice(dst_cid);
                w.put_slice(src_cid);
                w.put_slice(orig_dst_cid);
                // The retry token is the remainder of the packet
                PartialEncode { pn_offset: None }
            }
            Short {
                ref dst_cid,
                number,
                key_phase,
            } => {
                w.put_u8(
                    0x40 | if key_phase { 0x04 } else { 0 } | (number.len() as u8 - 1),
                );
                w.put_slice(dst_cid);
                let pn_offset = w.len();
                number.encode(w);
                PartialEncode {
                    pn_offset: Some(pn_offset),
                }
            }
            VersionNegotiate {
                random,
                ref src_cid,
                ref dst_cid,
            } => {
                w.put_u8(0x80 | random & 0x7f);
                w.write::<u32>(0);
                w.put_u8(cid_lengths(dst_cid, src_cid));
                w.put_slice(dst_cid);
                w.put_slice(src_cid);
                // The supported version list is the packet payload
                PartialEncode { pn_offset: None }
            }
        }
    }
}

/// Deferred header-protection step of packet encoding.
pub struct PartialEncode {
    pn_offset: Option<usize>,
}

impl PartialEncode {
    pub fn finish(self, packet: &mut [u8], crypto: &Crypto) {
        let pn_offset = match self.pn_offset {
            Some(x) => x,
            None => return,
        };
        crypto.encrypt_header(pn_offset, packet);
    }
}

/// Patch the long-header length field once the plaintext payload is in place.
///
/// The field covers the packet number and the payload including the AEAD tag.
pub fn set_payload_length(packet: &mut [u8], header_len: usize, pn_len: usize) {
    let len = packet.len() - header_len + pn_len + AEAD_TAG_SIZE;
    debug_assert!(len < 1 << 14);
    let pos = header_len - pn_len - 2;
    packet[pos] = 0x40 | (len >> 8) as u8;
    packet[pos + 1] = len as u8;
}

/// A packet with its header decoded and protection removed from the header,
/// but its payload still encrypted.
#[derive(Debug)]
pub struct Packet {
    pub header: Header,
    /// The bytes the header occupied, needed as AEAD associated data
    pub header_data: Bytes,
    pub payload: BytesMut,
}

/// Packet decoding up to the point where header protection must be removed.
///
/// Completing the decode requires the packet-protection keys for the packet's
/// encryption level, which the connection selects based on what `new` was
/// able to read.
pub struct PartialDecode {
    buf: BytesMut,
    plan: Plan,
    pn_offset: usize,
    end: usize,
}

#[derive(Debug)]
enum Plan {
    Initial {
        src_cid: ConnectionId,
        dst_cid: ConnectionId,
        token: Bytes,
    },
    Handshake {
        src_cid: ConnectionId,
        dst_cid: ConnectionId,
    },
    ZeroRtt {
        src_cid: ConnectionId,
        dst_cid: ConnectionId,
    },
    Retry {
        src_cid: ConnectionId,
        dst_cid: ConnectionId,
        orig_dst_cid: ConnectionId,
    },
    VersionNegotiate {
        random: u8,
        src_cid: ConnectionId,
        dst_cid: ConnectionId,
        payload_offset: usize,
    },
    Short {
        dst_cid: ConnectionId,
    },
}

impl PartialDecode {
    pub fn new(bytes: BytesMut, local_cid_len: usize) -> Result<Self, PacketDecodeError> {
        let (plan, pn_offset, end) = {
            let mut buf = io::Cursor::new(&bytes[..]);
            let first = buf.get::<u8>()?;
            if first & 0x80 != 0 {
                let version = buf.get::<u32>()?;
                let cil = buf.get::<u8>()?;
                let dcil = decode_cid_length(cil >> 4);
                let scil = decode_cid_length(cil & 0xf);
                let dst_cid = get_cid(&mut buf, dcil)?;
                let src_cid = get_cid(&mut buf, scil)?;
                if version == 0 {
                    let payload_offset = buf.position() as usize;
                    (
                        Plan::VersionNegotiate {
                            random: first & 0x7f,
                            src_cid,
                            dst_cid,
                            payload_offset,
                        },
                        0,
                        bytes.len(),
                    )
                } else if version != VERSION {
                    return Err(PacketDecodeError::UnsupportedVersion {
                        source: src_cid,
                        destination: dst_cid,
                    });
                } else {
                    match (first >> 4) & 0x3 {
                        0x0 => {
                            let token_len = buf.get_var()? as usize;
                            if buf.remaining() < token_len {
                                return Err(PacketDecodeError::InvalidHeader("token too long"));
                            }
                            let token_start = buf.position() as usize;
                            buf.advance(token_len);
                            let token =
                                Bytes::copy_from_slice(&bytes[token_start..token_start + token_len]);
                            let len = buf.get_var()? as usize;
                            let pn_offset = buf.position() as usize;
                            let end = pn_offset.checked_add(len).ok_or(
                                PacketDecodeError::InvalidHeader("payload length overflow"),
                            )?;
                            if end > bytes.len() {
                                return Err(PacketDecodeError::InvalidHeader(
                                    "payload longer than packet",
                                ));
                            }
                            (
                                Plan::Initial {
                                    src_cid,
                                    dst_cid,
                                    token,
                                },
                                pn_offset,
                                end,
                            )
                        }
                        ty @ 0x1 | ty @ 0x2 => {
                            let len = buf.get_var()? as usize;
                            let pn_offset = buf.position() as usize;
                            let end = pn_offset.checked_add(len).ok_or(
                                PacketDecodeError::InvalidHeader("payload length overflow"),
                            )?;
                            if end > bytes.len() {
                                return Err(PacketDecodeError::InvalidHeader(
                                    "payload longer than packet",
                                ));
                            }
                            let plan = if ty == 0x1 {
                                Plan::ZeroRtt { src_cid, dst_cid }
                            } else {
                                Plan::Handshake { src_cid, dst_cid }
                            };
                            (plan, pn_offset, end)
                        }
                        _ => {
                            let odcil = decode_cid_length(first & 0xf);
                            let orig_dst_cid = get_cid(&mut buf, odcil)?;
                            let pn_offset = buf.position() as usize;
                            (
                                Plan::Retry {
                                    src_cid,
                                    dst_cid,
                                    orig_dst_cid,
                                },
                                pn_offset,
                                bytes.len(),
                            )
                        }
                    }
                }
            } else {
                if first & 0x40 == 0 {
                    return Err(PacketDecodeError::InvalidHeader("fixed bit unset"));
                }
                let dst_cid = get_cid(&mut buf, local_cid_len)?;
                let pn_offset = buf.position() as usize;
                (Plan::Short { dst_cid }, pn_offset, bytes.len())
            }
        };
        Ok(PartialDecode {
            buf: bytes,
            plan,
            pn_offset,
            end,
        })
    }

    pub fn dst_cid(&self) -> ConnectionId {
        use self::Plan::*;
        match self.plan {
            Initial { dst_cid, .. }
            | Handshake { dst_cid, .. }
            | ZeroRtt { dst_cid, .. }
            | Retry { dst_cid, .. }
            | VersionNegotiate { dst_cid, .. }
            | Short { dst_cid } => dst_cid,
        }
    }

    pub fn is_initial(&self) -> bool {
        match self.plan {
            Plan::Initial { .. } => true,
            _ => false,
        }
    }

    pub fn src_cid(&self) -> Option<ConnectionId> {
        use self::Plan::*;
        match self.plan {
            Initial { src_cid, .. }
            | Handshake { src_cid, .. }
            | ZeroRtt { src_cid, .. }
            | Retry { src_cid, .. }
            | VersionNegotiate { src_cid, .. } => Some(src_cid),
            Short { .. } => None,
        }
    }

    pub fn has_long_header(&self) -> bool {
        match self.plan {
            Plan::Short { .. } => false,
            _ => true,
        }
    }

    /// Which encryption level's keys are needed to finish decoding, if any.
    pub fn level(&self) -> Option<::crypto::EncryptionLevel> {
        use crypto::EncryptionLevel;
        match self.plan {
            Plan::Initial { .. } => Some(EncryptionLevel::Initial),
            Plan::Handshake { .. } => Some(EncryptionLevel::Handshake),
            Plan::Short { .. } => Some(EncryptionLevel::OneRtt),
            _ => None,
        }
    }

    /// Remove header protection and split off this packet, returning any
    /// remaining coalesced data.
    pub fn finish(
        self,
        crypto: Option<&Crypto>,
    ) -> Result<(Packet, Option<BytesMut>), PacketDecodeError> {
        let PartialDecode {
            mut buf,
            plan,
            pn_offset,
            end,
        } = self;
        let rest = if end < buf.len() {
            Some(buf.split_off(end))
        } else {
            None
        };
        match plan {
            Plan::Retry {
                src_cid,
                dst_cid,
                orig_dst_cid,
            } => {
                let payload = buf.split_off(pn_offset);
                Ok((
                    Packet {
                        header: Header::Retry {
                            src_cid,
                            dst_cid,
                            orig_dst_cid,
                        },
                        header_data: buf.freeze(),
                        payload,
                    },
                    rest,
                ))
            }
            Plan::VersionNegotiate {
                random,
                src_cid,
                dst_cid,
                payload_offset,
            } => {
                let payload = buf.split_off(payload_offset);
                Ok((
                    Packet {
                        header: Header::VersionNegotiate {
                            random,
                            src_cid,
                            dst_cid,
                        },
                        header_data: buf.freeze(),
                        payload,
                    },
                    rest,
                ))
            }
            plan => {
                let crypto =
                    crypto.ok_or(PacketDecodeError::InvalidHeader("no keys for this space"))?;
                let pn_len = crypto
                    .decrypt_header(pn_offset, &mut buf[..])
                    .map_err(|()| PacketDecodeError::InvalidHeader("header protection failed"))?;
                let first = buf[0];
                let number = PacketNumber::decode(pn_len, &buf[pn_offset..]);
                let header = match plan {
                    Plan::Initial {
                        src_cid,
                        dst_cid,
                        token,
                    } => Header::Initial {
                        src_cid,
                        dst_cid,
                        token,
                        number,
                    },
                    Plan::Handshake { src_cid, dst_cid } => Header::Long {
                        ty: LongType::Handshake,
                        src_cid,
                        dst_cid,
                        number,
                    },
                    Plan::ZeroRtt { src_cid, dst_cid } => Header::Long {
                        ty: LongType::ZeroRtt,
                        src_cid,
                        dst_cid,
                        number,
                    },
                    Plan::Short { dst_cid } => Header::Short {
                        dst_cid,
                        number,
                        key_phase: first & 0x04 != 0,
                    },
                    _ => unreachable!(),
                };
                let payload = buf.split_off(pn_offset + pn_len);
                Ok((
                    Packet {
                        header,
                        header_data: buf.freeze(),
                        payload,
                    },
                    rest,
                ))
            }
        }
    }
}

fn get_cid<B: Buf>(buf: &mut B, len: usize) -> Result<ConnectionId, PacketDecodeError> {
    if buf.remaining() < len {
        return Err(PacketDecodeError::InvalidHeader("connection ID truncated"));
    }
    let mut bytes = [0; MAX_CID_SIZE];
    buf.copy_to_slice(&mut bytes[..len]);
    Ok(ConnectionId::new(&bytes[..len]))
}

fn encode_cid_length(cid: &ConnectionId) -> u8 {
    if cid.is_empty() {
        0
    } else {
        cid.len() as u8 - 3
    }
}

fn decode_cid_length(x: u8) -> usize {
    if x == 0 {
        0
    } else {
        x as usize + 3
    }
}

fn cid_lengths(dst: &ConnectionId, src: &ConnectionId) -> u8 {
    encode_cid_length(dst) << 4 | encode_cid_length(src)
}

#[derive(Debug, Fail)]
pub enum PacketDecodeError {
    #[fail(display = "unsupported version")]
    UnsupportedVersion {
        source: ConnectionId,
        destination: ConnectionId,
    },
    #[fail(display = "invalid header: {}", _0)]
    InvalidHeader(&'static str),
}

impl From<coding::UnexpectedEnd> for PacketDecodeError {
    fn from(_: coding::UnexpectedEnd) -> Self {
        PacketDecodeError::InvalidHeader("unexpected end of packet")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crypto::EncryptionLevel;
    use Side;

    #[test]
    fn pn_truncation() {
        assert_matches!(PacketNumber::new(1, 0), PacketNumber::U8(1));
        assert_matches!(PacketNumber::new(300, 0), PacketNumber::U16(300));
        assert_matches!(PacketNumber::new(2, 1), PacketNumber::U8(2));
        assert_matches!(PacketNumber::new(40_000, 0), PacketNumber::U32(40_000));
    }

    #[test]
    fn pn_expansion() {
        // Within the window
        assert_eq!(PacketNumber::U8(3).expand(3), 3);
        assert_eq!(PacketNumber::U8(200).expand(198), 200);
        // Wrapped past a byte boundary
        assert_eq!(PacketNumber::U8(2).expand(257), 258);
        assert_eq!(PacketNumber::U16(0x0002).expand(0x1_0001), 0x1_0002);
    }

    #[test]
    fn initial_roundtrip() {
        let dst_cid = ConnectionId::new(&[0xab; 8]);
        let src_cid = ConnectionId::new(&[0xcd; 5]);
        let client = Crypto::new_initial(&dst_cid, Side::Client);
        let server = Crypto::new_initial(&dst_cid, Side::Server);

        let number = 1;
        let header = Header::Initial {
            src_cid,
            dst_cid,
            token: Bytes::from_static(b"tok"),
            number: PacketNumber::new(number, 0),
        };
        let mut buf = Vec::new();
        let partial = header.encode(&mut buf);
        let header_len = buf.len();
        buf.extend_from_slice(b"some payload bytes");
        set_payload_length(&mut buf, header_len, 1);
        client.encrypt(number, &mut buf, header_len);
        partial.finish(&mut buf, &client);

        let decode = PartialDecode::new(buf[..].into(), 8).unwrap();
        assert!(decode.is_initial());
        assert_eq!(decode.level(), Some(EncryptionLevel::Initial));
        assert_eq!(&decode.dst_cid()[..], &dst_cid[..]);
        let (mut packet, rest) = decode.finish(Some(&server)).unwrap();
        assert!(rest.is_none());
        match packet.header {
            Header::Initial {
                token,
                number: got,
                ..
            } => {
                assert_eq!(&token[..], b"tok");
                assert_eq!(got.expand(1), 1);
            }
            ref h => panic!("unexpected header {:?}", h),
        }
        server
            .decrypt(number, &packet.header_data, &mut packet.payload)
            .unwrap();
        assert_eq!(&packet.payload[..], b"some payload bytes");
    }

    #[test]
    fn short_roundtrip() {
        let dst_cid = ConnectionId::new(&[0x11; 8]);
        let client = Crypto::new_initial(&dst_cid, Side::Client);
        let server = Crypto::new_initial(&dst_cid, Side::Server);

        let number = 42;
        let header = Header::Short {
            dst_cid,
            number: PacketNumber::new(number, 0),
            key_phase: false,
        };
        let mut buf = Vec::new();
        let partial = header.encode(&mut buf);
        let header_len = buf.len();
        buf.extend_from_slice(b"ping!");
        client.encrypt(number, &mut buf, header_len);
        partial.finish(&mut buf, &client);

        let decode = PartialDecode::new(buf[..].into(), 8).unwrap();
        assert!(!decode.has_long_header());
        let (mut packet, rest) = decode.finish(Some(&server)).unwrap();
        assert!(rest.is_none());
        let got = packet.header.number().unwrap().expand(number);
        assert_eq!(got, number);
        server
            .decrypt(got, &packet.header_data, &mut packet.payload)
            .unwrap();
        assert_eq!(&packet.payload[..], b"ping!");
    }

    #[test]
    fn coalesced_rest_is_returned() {
        let dst_cid = ConnectionId::new(&[0x22; 8]);
        let src_cid = ConnectionId::new(&[0x33; 8]);
        let client = Crypto::new_initial(&dst_cid, Side::Client);
        let server = Crypto::new_initial(&dst_cid, Side::Server);

        let header = Header::Initial {
            src_cid,
            dst_cid,
            token: Bytes::new(),
            number: PacketNumber::new(1, 0),
        };
        let mut buf = Vec::new();
        let partial = header.encode(&mut buf);
        let header_len = buf.len();
        buf.extend_from_slice(b"first packet");
        set_payload_length(&mut buf, header_len, 1);
        client.encrypt(1, &mut buf, header_len);
        partial.finish(&mut buf, &client);
        let trailing = b"trailing data for the next packet";
        buf.extend_from_slice(trailing);

        let decode = PartialDecode::new(buf[..].into(), 8).unwrap();
        let (_, rest) = decode.finish(Some(&server)).unwrap();
        assert_eq!(&rest.unwrap()[..], &trailing[..]);
    }

    #[test]
    fn version_negotiation_roundtrip() {
        let header = Header::VersionNegotiate {
            random: 0x2a,
            src_cid: ConnectionId::new(&[0x55; 8]),
            dst_cid: ConnectionId::new(&[0x66; 8]),
        };
        let mut buf = Vec::new();
        header.encode(&mut buf);
        use coding::BufMutExt;
        buf.write::<u32>(VERSION);

        let decode = PartialDecode::new(buf[..].into(), 0).unwrap();
        assert_matches!(decode.level(), None);
        let (packet, rest) = decode.finish(None).unwrap();
        assert!(rest.is_none());
        assert_matches!(packet.header, Header::VersionNegotiate { .. });
        assert_eq!(packet.payload.len(), 4);
    }

    #[test]
    fn unsupported_version_reports_cids() {
        let mut buf = Vec::new();
        buf.push(0xc0);
        use coding::BufMutExt;
        buf.write::<u32>(0xff00_0001);
        buf.push(cid_lengths(
            &ConnectionId::new(&[0x77; 8]),
            &ConnectionId::new(&[0x88; 4]),
        ));
        buf.extend_from_slice(&[0x77; 8]);
        buf.extend_from_slice(&[0x88; 4]);
        match PartialDecode::new(buf[..].into(), 0) {
            Err(PacketDecodeError::UnsupportedVersion {
                source,
                destination,
            }) => {
                assert_eq!(&source[..], &[0x88; 4]);
                assert_eq!(&destination[..], &[0x77; 8]);
            }
            x => panic!("unexpected result: {:?}", x.err()),
        }
    }
}
