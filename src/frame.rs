use std::fmt;
use std::ops::RangeInclusive;

use bytes::{Buf, BufMut, Bytes};

use coding::{self, BufExt, BufMutExt};
use packet::ConnectionId;
use range_set::RangeSet;
use {Directionality, StreamId, TransportError, MAX_CID_SIZE, MIN_CID_SIZE};

/// A frame type identifier.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Type(pub u64);

impl Type {
    pub const PADDING: Type = Type(0x00);
    pub const PING: Type = Type(0x01);
    pub const ACK: Type = Type(0x02);
    pub const ACK_ECN: Type = Type(0x03);
    pub const RESET_STREAM: Type = Type(0x04);
    pub const STOP_SENDING: Type = Type(0x05);
    pub const CRYPTO: Type = Type(0x06);
    pub const NEW_TOKEN: Type = Type(0x07);
    pub const MAX_DATA: Type = Type(0x10);
    pub const MAX_STREAM_DATA: Type = Type(0x11);
    pub const MAX_STREAMS_BIDI: Type = Type(0x12);
    pub const MAX_STREAMS_UNI: Type = Type(0x13);
    pub const DATA_BLOCKED: Type = Type(0x14);
    pub const STREAM_DATA_BLOCKED: Type = Type(0x15);
    pub const STREAMS_BLOCKED_BIDI: Type = Type(0x16);
    pub const STREAMS_BLOCKED_UNI: Type = Type(0x17);
    pub const NEW_CONNECTION_ID: Type = Type(0x18);
    pub const RETIRE_CONNECTION_ID: Type = Type(0x19);
    pub const PATH_CHALLENGE: Type = Type(0x1a);
    pub const PATH_RESPONSE: Type = Type(0x1b);
    pub const CONNECTION_CLOSE: Type = Type(0x1c);
    pub const APPLICATION_CLOSE: Type = Type(0x1d);

    fn is_stream(self) -> bool {
        self.0 >= 0x08 && self.0 <= 0x0f
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_stream() {
            return write!(f, "STREAM({:#x})", self.0);
        }
        let name = match *self {
            Type::PADDING => "PADDING",
            Type::PING => "PING",
            Type::ACK => "ACK",
            Type::ACK_ECN => "ACK_ECN",
            Type::RESET_STREAM => "RESET_STREAM",
            Type::STOP_SENDING => "STOP_SENDING",
            Type::CRYPTO => "CRYPTO",
            Type::NEW_TOKEN => "NEW_TOKEN",
            Type::MAX_DATA => "MAX_DATA",
            Type::MAX_STREAM_DATA => "MAX_STREAM_DATA",
            Type::MAX_STREAMS_BIDI => "MAX_STREAMS_BIDI",
            Type::MAX_STREAMS_UNI => "MAX_STREAMS_UNI",
            Type::DATA_BLOCKED => "DATA_BLOCKED",
            Type::STREAM_DATA_BLOCKED => "STREAM_DATA_BLOCKED",
            Type::STREAMS_BLOCKED_BIDI => "STREAMS_BLOCKED_BIDI",
            Type::STREAMS_BLOCKED_UNI => "STREAMS_BLOCKED_UNI",
            Type::NEW_CONNECTION_ID => "NEW_CONNECTION_ID",
            Type::RETIRE_CONNECTION_ID => "RETIRE_CONNECTION_ID",
            Type::PATH_CHALLENGE => "PATH_CHALLENGE",
            Type::PATH_RESPONSE => "PATH_RESPONSE",
            Type::CONNECTION_CLOSE => "CONNECTION_CLOSE",
            Type::APPLICATION_CLOSE => "APPLICATION_CLOSE",
            _ => return write!(f, "UNKNOWN({:#x})", self.0),
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub enum Frame {
    Padding,
    Ping,
    Ack(Ack),
    ResetStream(ResetStream),
    StopSending { id: StreamId, error_code: u16 },
    Crypto(Crypto),
    NewToken { token: Bytes },
    Stream(Stream),
    MaxData(u64),
    MaxStreamData { id: StreamId, offset: u64 },
    MaxStreams { directionality: Directionality, count: u64 },
    DataBlocked { offset: u64 },
    StreamDataBlocked { id: StreamId, offset: u64 },
    StreamsBlocked { directionality: Directionality, limit: u64 },
    NewConnectionId { sequence: u64, id: ConnectionId, reset_token: [u8; 16] },
    RetireConnectionId { sequence: u64 },
    PathChallenge(u64),
    PathResponse(u64),
    ConnectionClose(ConnectionClose),
    ApplicationClose(ApplicationClose),
    /// A frame that could not be decoded; terminates payload processing.
    Invalid(Type),
}

impl Frame {
    pub fn ty(&self) -> Type {
        use self::Frame::*;
        match *self {
            Padding => Type::PADDING,
            Ping => Type::PING,
            Ack(_) => Type::ACK,
            ResetStream(_) => Type::RESET_STREAM,
            StopSending { .. } => Type::STOP_SENDING,
            Crypto(_) => Type::CRYPTO,
            NewToken { .. } => Type::NEW_TOKEN,
            Stream(ref s) => {
                let mut ty = 0x08;
                if s.offset != 0 {
                    ty |= 0x04;
                }
                if s.fin {
                    ty |= 0x01;
                }
                Type(ty)
            }
            MaxData(_) => Type::MAX_DATA,
            MaxStreamData { .. } => Type::MAX_STREAM_DATA,
            MaxStreams { directionality: Directionality::Bi, .. } => Type::MAX_STREAMS_BIDI,
            MaxStreams { .. } => Type::MAX_STREAMS_UNI,
            DataBlocked { .. } => Type::DATA_BLOCKED,
            StreamDataBlocked { .. } => Type::STREAM_DATA_BLOCKED,
            StreamsBlocked { directionality: Directionality::Bi, .. } => {
                Type::STREAMS_BLOCKED_BIDI
            }
            StreamsBlocked { .. } => Type::STREAMS_BLOCKED_UNI,
            NewConnectionId { .. } => Type::NEW_CONNECTION_ID,
            RetireConnectionId { .. } => Type::RETIRE_CONNECTION_ID,
            PathChallenge(_) => Type::PATH_CHALLENGE,
            PathResponse(_) => Type::PATH_RESPONSE,
            ConnectionClose(_) => Type::CONNECTION_CLOSE,
            ApplicationClose(_) => Type::APPLICATION_CLOSE,
            Invalid(ty) => ty,
        }
    }

    /// Whether receipt of this frame makes the packet it arrived in worth
    /// acknowledging, and the frame itself worth retransmitting.
    pub fn is_ack_eliciting(&self) -> bool {
        match *self {
            Frame::Ack(_)
            | Frame::Padding
            | Frame::ConnectionClose(_)
            | Frame::ApplicationClose(_) => false,
            _ => true,
        }
    }

    pub fn encode<W: BufMut>(&self, buf: &mut W) {
        use self::Frame::*;
        match *self {
            Padding => buf.write_var(0x00),
            Ping => buf.write_var(0x01),
            Ack(ref ack) => {
                buf.write_var(0x02);
                buf.write_var(ack.largest);
                buf.write_var(ack.delay);
                buf.write_var(ack.blocks.len() as u64 - 1);
                let first = &ack.blocks[0];
                buf.write_var(first.end() - first.start());
                let mut prev = *first.start();
                for block in &ack.blocks[1..] {
                    buf.write_var(prev - block.end() - 2);
                    buf.write_var(block.end() - block.start());
                    prev = *block.start();
                }
            }
            ResetStream(ref frame) => {
                buf.write_var(0x04);
                buf.write_var(frame.id.0);
                buf.put_u16(frame.error_code);
                buf.write_var(frame.final_size);
            }
            StopSending { id, error_code } => {
                buf.write_var(0x05);
                buf.write_var(id.0);
                buf.put_u16(error_code);
            }
            Crypto(ref frame) => {
                buf.write_var(0x06);
                buf.write_var(frame.offset);
                buf.write_var(frame.data.len() as u64);
                buf.put_slice(&frame.data);
            }
            NewToken { ref token } => {
                buf.write_var(0x07);
                buf.write_var(token.len() as u64);
                buf.put_slice(token);
            }
            Stream(ref frame) => frame.encode(true, buf),
            MaxData(max) => {
                buf.write_var(0x10);
                buf.write_var(max);
            }
            MaxStreamData { id, offset } => {
                buf.write_var(0x11);
                buf.write_var(id.0);
                buf.write_var(offset);
            }
            MaxStreams {
                directionality,
                count,
            } => {
                buf.write_var(match directionality {
                    Directionality::Bi => 0x12,
                    Directionality::Uni => 0x13,
                });
                buf.write_var(count);
            }
            DataBlocked { offset } => {
                buf.write_var(0x14);
                buf.write_var(offset);
            }
            StreamDataBlocked { id, offset } => {
                buf.write_var(0x15);
                buf.write_var(id.0);
                buf.write_var(offset);
            }
            StreamsBlocked {
                directionality,
                limit,
            } => {
                buf.write_var(match directionality {
                    Directionality::Bi => 0x16,
                    Directionality::Uni => 0x17,
                });
                buf.write_var(limit);
            }
            NewConnectionId {
                sequence,
                ref id,
                ref reset_token,
            } => {
                buf.write_var(0x18);
                buf.write_var(sequence);
                buf.put_u8(id.len() as u8);
                buf.put_slice(id);
                buf.put_slice(reset_token);
            }
            RetireConnectionId { sequence } => {
                buf.write_var(0x19);
                buf.write_var(sequence);
            }
            PathChallenge(token) => {
                buf.write_var(0x1a);
                buf.put_u64(token);
            }
            PathResponse(token) => {
                buf.write_var(0x1b);
                buf.put_u64(token);
            }
            ConnectionClose(ref frame) => {
                buf.write_var(0x1c);
                buf.put_u16(frame.error_code.0);
                buf.write_var(frame.frame_type.map_or(0, |x| x.0));
                buf.write_var(frame.reason.len() as u64);
                buf.put_slice(&frame.reason);
            }
            ApplicationClose(ref frame) => {
                buf.write_var(0x1d);
                buf.put_u16(frame.error_code);
                buf.write_var(frame.reason.len() as u64);
                buf.put_slice(&frame.reason);
            }
            Invalid(ty) => debug_assert!(false, "tried to encode invalid frame {}", ty),
        }
    }
}

/// Handshake bytes at an offset within an encryption level's crypto stream.
#[derive(Debug, Clone)]
pub struct Crypto {
    pub offset: u64,
    pub data: Bytes,
}

#[derive(Debug, Clone)]
pub struct Stream {
    pub id: StreamId,
    pub offset: u64,
    pub fin: bool,
    pub data: Bytes,
}

impl Stream {
    /// `length` selects whether an explicit length is written; without one
    /// the frame extends to the end of the packet.
    pub fn encode<W: BufMut>(&self, length: bool, buf: &mut W) {
        let mut ty = 0x08u64;
        if self.offset != 0 {
            ty |= 0x04;
        }
        if length {
            ty |= 0x02;
        }
        if self.fin {
            ty |= 0x01;
        }
        buf.write_var(ty);
        buf.write_var(self.id.0);
        if self.offset != 0 {
            buf.write_var(self.offset);
        }
        if length {
            buf.write_var(self.data.len() as u64);
        }
        buf.put_slice(&self.data);
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ResetStream {
    pub id: StreamId,
    pub error_code: u16,
    pub final_size: u64,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ConnectionClose {
    pub error_code: TransportError,
    pub frame_type: Option<Type>,
    pub reason: Bytes,
}

impl fmt::Display for ConnectionClose {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.error_code)?;
        if !self.reason.is_empty() {
            write!(f, ": {}", String::from_utf8_lossy(&self.reason))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ApplicationClose {
    pub error_code: u16,
    pub reason: Bytes,
}

impl fmt::Display for ApplicationClose {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.error_code)?;
        if !self.reason.is_empty() {
            write!(f, ": {}", String::from_utf8_lossy(&self.reason))?;
        }
        Ok(())
    }
}

/// An ACK frame: the blocks of packet numbers the peer has received,
/// descending, the block containing the largest first.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Ack {
    pub largest: u64,
    pub delay: u64,
    blocks: Vec<RangeInclusive<u64>>,
}

impl Ack {
    /// Encode the current received set. `ranges` must be non-empty.
    pub fn encode<W: BufMut>(delay: u64, ranges: &RangeSet, buf: &mut W) {
        debug_assert!(!ranges.is_empty());
        let mut rest = ranges.iter().rev();
        let first = rest.next().unwrap();
        let largest = first.end - 1;
        buf.write_var(0x02);
        buf.write_var(largest);
        buf.write_var(delay);
        buf.write_var(ranges.len() as u64 - 1);
        buf.write_var(first.end - first.start - 1);
        let mut prev = first.start;
        for block in rest {
            buf.write_var(prev - block.end - 1);
            buf.write_var(block.end - block.start - 1);
            prev = block.start;
        }
    }

    pub fn iter(&self) -> ::std::iter::Cloned<::std::slice::Iter<RangeInclusive<u64>>> {
        self.blocks.iter().cloned()
    }
}

impl<'a> IntoIterator for &'a Ack {
    type Item = RangeInclusive<u64>;
    type IntoIter = ::std::iter::Cloned<::std::slice::Iter<'a, RangeInclusive<u64>>>;
    fn into_iter(self) -> Self::IntoIter {
        self.blocks.iter().cloned()
    }
}

/// Walks the frames in a decrypted packet payload.
pub struct Iter {
    bytes: Bytes,
    last_ty: Type,
}

impl Iter {
    pub fn new(payload: Bytes) -> Self {
        Iter {
            bytes: payload,
            last_ty: Type::PADDING,
        }
    }

    fn take_len(&mut self) -> Result<Bytes, coding::UnexpectedEnd> {
        let len = self.bytes.get_var()?;
        if len > self.bytes.remaining() as u64 {
            return Err(coding::UnexpectedEnd);
        }
        Ok(self.bytes.split_to(len as usize))
    }

    fn try_next(&mut self) -> Result<Frame, coding::UnexpectedEnd> {
        let ty = Type(self.bytes.get_var()?);
        self.last_ty = ty;
        Ok(match ty {
            Type::PADDING => Frame::Padding,
            Type::PING => Frame::Ping,
            Type::ACK | Type::ACK_ECN => {
                let ack = self.parse_ack()?;
                if ty == Type::ACK_ECN {
                    // ECN counts; unused
                    self.bytes.get_var()?;
                    self.bytes.get_var()?;
                    self.bytes.get_var()?;
                }
                Frame::Ack(ack)
            }
            Type::RESET_STREAM => Frame::ResetStream(ResetStream {
                id: StreamId(self.bytes.get_var()?),
                error_code: self.bytes.get()?,
                final_size: self.bytes.get_var()?,
            }),
            Type::STOP_SENDING => Frame::StopSending {
                id: StreamId(self.bytes.get_var()?),
                error_code: self.bytes.get()?,
            },
            Type::CRYPTO => {
                let offset = self.bytes.get_var()?;
                let data = self.take_len()?;
                Frame::Crypto(Crypto { offset, data })
            }
            Type::NEW_TOKEN => Frame::NewToken {
                token: self.take_len()?,
            },
            _ if ty.is_stream() => {
                let id = StreamId(self.bytes.get_var()?);
                let offset = if ty.0 & 0x04 != 0 {
                    self.bytes.get_var()?
                } else {
                    0
                };
                let data = if ty.0 & 0x02 != 0 {
                    self.take_len()?
                } else {
                    self.bytes.split_to(self.bytes.len())
                };
                Frame::Stream(Stream {
                    id,
                    offset,
                    fin: ty.0 & 0x01 != 0,
                    data,
                })
            }
            Type::MAX_DATA => Frame::MaxData(self.bytes.get_var()?),
            Type::MAX_STREAM_DATA => Frame::MaxStreamData {
                id: StreamId(self.bytes.get_var()?),
                offset: self.bytes.get_var()?,
            },
            Type::MAX_STREAMS_BIDI => Frame::MaxStreams {
                directionality: Directionality::Bi,
                count: self.bytes.get_var()?,
            },
            Type::MAX_STREAMS_UNI => Frame::MaxStreams {
                directionality: Directionality::Uni,
                count: self.bytes.get_var()?,
            },
            Type::DATA_BLOCKED => Frame::DataBlocked {
                offset: self.bytes.get_var()?,
            },
            Type::STREAM_DATA_BLOCKED => Frame::StreamDataBlocked {
                id: StreamId(self.bytes.get_var()?),
                offset: self.bytes.get_var()?,
            },
            Type::STREAMS_BLOCKED_BIDI => Frame::StreamsBlocked {
                directionality: Directionality::Bi,
                limit: self.bytes.get_var()?,
            },
            Type::STREAMS_BLOCKED_UNI => Frame::StreamsBlocked {
                directionality: Directionality::Uni,
                limit: self.bytes.get_var()?,
            },
            Type::NEW_CONNECTION_ID => {
                let sequence = self.bytes.get_var()?;
                let len = self.bytes.get::<u8>()? as usize;
                if len < MIN_CID_SIZE || len > MAX_CID_SIZE
                    || self.bytes.remaining() < len + 16
                {
                    return Err(coding::UnexpectedEnd);
                }
                let cid = self.bytes.split_to(len);
                let id = ConnectionId::new(&cid);
                let mut reset_token = [0; 16];
                self.bytes.copy_to_slice(&mut reset_token);
                Frame::NewConnectionId {
                    sequence,
                    id,
                    reset_token,
                }
            }
            Type::RETIRE_CONNECTION_ID => Frame::RetireConnectionId {
                sequence: self.bytes.get_var()?,
            },
            Type::PATH_CHALLENGE => Frame::PathChallenge(self.bytes.get()?),
            Type::PATH_RESPONSE => Frame::PathResponse(self.bytes.get()?),
            Type::CONNECTION_CLOSE => Frame::ConnectionClose(ConnectionClose {
                error_code: TransportError(self.bytes.get()?),
                frame_type: match self.bytes.get_var()? {
                    0 => None,
                    x => Some(Type(x)),
                },
                reason: self.take_len()?,
            }),
            Type::APPLICATION_CLOSE => Frame::ApplicationClose(ApplicationClose {
                error_code: self.bytes.get()?,
                reason: self.take_len()?,
            }),
            _ => return Err(coding::UnexpectedEnd),
        })
    }

    fn parse_ack(&mut self) -> Result<Ack, coding::UnexpectedEnd> {
        let largest = self.bytes.get_var()?;
        let delay = self.bytes.get_var()?;
        let count = self.bytes.get_var()?;
        let first = self.bytes.get_var()?;
        if first > largest {
            return Err(coding::UnexpectedEnd);
        }
        let mut smallest = largest - first;
        let mut blocks = Vec::new();
        blocks.push(smallest..=largest);
        for _ in 0..count {
            let gap = self.bytes.get_var()?;
            if smallest < gap + 2 {
                return Err(coding::UnexpectedEnd);
            }
            let next_largest = smallest - gap - 2;
            let len = self.bytes.get_var()?;
            if len > next_largest {
                return Err(coding::UnexpectedEnd);
            }
            smallest = next_largest - len;
            blocks.push(smallest..=next_largest);
        }
        Ok(Ack {
            largest,
            delay,
            blocks,
        })
    }
}

impl Iterator for Iter {
    type Item = Frame;
    fn next(&mut self) -> Option<Frame> {
        if !self.bytes.has_remaining() {
            return None;
        }
        match self.try_next() {
            Ok(frame) => Some(frame),
            Err(_) => {
                // Can't resynchronize after a malformed or unknown frame
                self.bytes.clear();
                Some(Frame::Invalid(self.last_ty))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use Side;

    fn frames(buf: Vec<u8>) -> Vec<Frame> {
        Iter::new(buf.into()).collect()
    }

    #[test]
    fn ack_single_block() {
        let mut received = RangeSet::new();
        received.insert_one(3);
        let mut buf = Vec::new();
        Ack::encode(0, &received, &mut buf);
        let decoded = frames(buf);
        assert_eq!(decoded.len(), 1);
        match decoded[0] {
            Frame::Ack(ref ack) => {
                assert_eq!(ack.largest, 3);
                assert_eq!(ack.iter().collect::<Vec<_>>(), vec![3..=3]);
            }
            ref x => panic!("unexpected frame {:?}", x),
        }
    }

    #[test]
    fn ack_blocks_descend_from_largest() {
        let mut received = RangeSet::new();
        received.insert(1..4);
        received.insert_one(6);
        received.insert(9..11);
        let mut buf = Vec::new();
        Ack::encode(7, &received, &mut buf);
        match &frames(buf)[0] {
            &Frame::Ack(ref ack) => {
                assert_eq!(ack.largest, 10);
                assert_eq!(ack.delay, 7);
                assert_eq!(ack.iter().collect::<Vec<_>>(), vec![9..=10, 6..=6, 1..=3]);
            }
            x => panic!("unexpected frame {:?}", x),
        }
    }

    #[test]
    fn ack_reencode() {
        let mut received = RangeSet::new();
        received.insert(2..5);
        received.insert_one(9);
        let mut buf = Vec::new();
        Ack::encode(0, &received, &mut buf);
        let first = frames(buf);
        let mut buf = Vec::new();
        first[0].encode(&mut buf);
        let second = frames(buf);
        match (&first[0], &second[0]) {
            (&Frame::Ack(ref a), &Frame::Ack(ref b)) => assert_eq!(a, b),
            x => panic!("unexpected frames {:?}", x),
        }
    }

    #[test]
    fn stream_roundtrip() {
        let frame = Stream {
            id: StreamId::new(Side::Server, Directionality::Bi, 3),
            offset: 5,
            fin: true,
            data: Bytes::from_static(b"world"),
        };
        let mut buf = Vec::new();
        frame.encode(true, &mut buf);
        buf.push(0x00); // trailing PADDING
        let decoded = frames(buf);
        assert_eq!(decoded.len(), 2);
        match decoded[0] {
            Frame::Stream(ref s) => {
                assert_eq!(s.id, frame.id);
                assert_eq!(s.offset, 5);
                assert!(s.fin);
                assert_eq!(&s.data[..], b"world");
            }
            ref x => panic!("unexpected frame {:?}", x),
        }
        assert_matches!(decoded[1], Frame::Padding);
    }

    #[test]
    fn stream_without_length_extends_to_end() {
        let frame = Stream {
            id: StreamId(4),
            offset: 0,
            fin: false,
            data: Bytes::from_static(b"tail"),
        };
        let mut buf = Vec::new();
        frame.encode(false, &mut buf);
        let decoded = frames(buf);
        assert_eq!(decoded.len(), 1);
        match decoded[0] {
            Frame::Stream(ref s) => assert_eq!(&s.data[..], b"tail"),
            ref x => panic!("unexpected frame {:?}", x),
        }
    }

    #[test]
    fn crypto_roundtrip() {
        let frame = Frame::Crypto(Crypto {
            offset: 7,
            data: Bytes::from_static(b"client hello"),
        });
        let mut buf = Vec::new();
        frame.encode(&mut buf);
        match frames(buf)[0] {
            Frame::Crypto(ref c) => {
                assert_eq!(c.offset, 7);
                assert_eq!(&c.data[..], b"client hello");
            }
            ref x => panic!("unexpected frame {:?}", x),
        }
    }

    #[test]
    fn connection_close_roundtrip() {
        let frame = Frame::ConnectionClose(ConnectionClose {
            error_code: TransportError(123),
            frame_type: Some(Type(0x08)),
            reason: Bytes::from_static(b"Closed"),
        });
        let mut buf = Vec::new();
        frame.encode(&mut buf);
        match frames(buf)[0] {
            Frame::ConnectionClose(ref c) => {
                assert_eq!(c.error_code.0, 123);
                assert_eq!(c.frame_type, Some(Type(0x08)));
                assert_eq!(&c.reason[..], b"Closed");
            }
            ref x => panic!("unexpected frame {:?}", x),
        }
    }

    #[test]
    fn unknown_type_terminates() {
        let mut buf = Vec::new();
        buf.write_var(0x01); // PING
        buf.write_var(0x3eu64); // unknown
        buf.extend_from_slice(b"junk that cannot be parsed");
        let decoded = frames(buf);
        assert_eq!(decoded.len(), 2);
        assert_matches!(decoded[0], Frame::Ping);
        assert_matches!(decoded[1], Frame::Invalid(Type(0x3e)));
    }

    #[test]
    fn truncated_frame_is_invalid() {
        let mut buf = Vec::new();
        buf.write_var(0x06); // CRYPTO
        buf.write_var(0u64); // offset
        buf.write_var(100u64); // length longer than the payload
        let decoded = frames(buf);
        assert_eq!(decoded.len(), 1);
        assert_matches!(decoded[0], Frame::Invalid(Type::CRYPTO));
    }
}
