use bytes::{Buf, BufMut};

use coding::{self, BufExt, BufMutExt};
use endpoint::Config;
use packet::ConnectionId;
use {Side, TransportError, MAX_CID_SIZE, MIN_CID_SIZE};

/// QUIC endpoint parameters, exchanged inside the TLS handshake.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TransportParameters {
    pub initial_max_data: u64,
    pub initial_max_stream_data_bidi_local: u64,
    pub initial_max_stream_data_bidi_remote: u64,
    pub initial_max_stream_data_uni: u64,
    pub initial_max_streams_bidi: u64,
    pub initial_max_streams_uni: u64,
    /// Milliseconds; 0 disables the idle timeout.
    pub max_idle_timeout: u64,
    pub ack_delay_exponent: u8,
    /// Milliseconds.
    pub max_ack_delay: u64,
    pub active_connection_id_limit: u64,
    /// Sent by a server that issued a Retry; echoes the client's first
    /// destination connection ID.
    pub original_connection_id: Option<ConnectionId>,
}

impl Default for TransportParameters {
    fn default() -> Self {
        TransportParameters {
            initial_max_data: 0,
            initial_max_stream_data_bidi_local: 0,
            initial_max_stream_data_bidi_remote: 0,
            initial_max_stream_data_uni: 0,
            initial_max_streams_bidi: 0,
            initial_max_streams_uni: 0,
            max_idle_timeout: 0,
            ack_delay_exponent: 3,
            max_ack_delay: 25,
            active_connection_id_limit: 0,
            original_connection_id: None,
        }
    }
}

const ORIGINAL_CONNECTION_ID: u16 = 0x0000;
const IDLE_TIMEOUT: u16 = 0x0001;
const INITIAL_MAX_DATA: u16 = 0x0004;
const INITIAL_MAX_STREAM_DATA_BIDI_LOCAL: u16 = 0x0005;
const INITIAL_MAX_STREAM_DATA_BIDI_REMOTE: u16 = 0x0006;
const INITIAL_MAX_STREAM_DATA_UNI: u16 = 0x0007;
const INITIAL_MAX_STREAMS_BIDI: u16 = 0x0008;
const INITIAL_MAX_STREAMS_UNI: u16 = 0x0009;
const ACK_DELAY_EXPONENT: u16 = 0x000a;
const MAX_ACK_DELAY: u16 = 0x000b;
const ACTIVE_CONNECTION_ID_LIMIT: u16 = 0x000e;

impl TransportParameters {
    pub fn new(config: &Config) -> Self {
        TransportParameters {
            initial_max_data: config.initial_max_data,
            initial_max_stream_data_bidi_local: config.initial_max_stream_data_bidi_local,
            initial_max_stream_data_bidi_remote: config.initial_max_stream_data_bidi_remote,
            initial_max_stream_data_uni: config.initial_max_stream_data_uni,
            initial_max_streams_bidi: config.initial_max_streams_bidi,
            initial_max_streams_uni: config.initial_max_streams_uni,
            max_idle_timeout: config.max_idle_timeout,
            ack_delay_exponent: config.ack_delay_exponent,
            max_ack_delay: config.max_ack_delay,
            active_connection_id_limit: config.active_connection_id_limit,
            original_connection_id: None,
        }
    }

    pub fn write<W: BufMut>(&self, w: &mut W) {
        let mut body = Vec::new();
        if let Some(ref id) = self.original_connection_id {
            body.put_u16(ORIGINAL_CONNECTION_ID);
            body.put_u16(id.len() as u16);
            body.put_slice(id);
        }
        write_varint_param(&mut body, IDLE_TIMEOUT, self.max_idle_timeout);
        write_varint_param(&mut body, INITIAL_MAX_DATA, self.initial_max_data);
        write_varint_param(
            &mut body,
            INITIAL_MAX_STREAM_DATA_BIDI_LOCAL,
            self.initial_max_stream_data_bidi_local,
        );
        write_varint_param(
            &mut body,
            INITIAL_MAX_STREAM_DATA_BIDI_REMOTE,
            self.initial_max_stream_data_bidi_remote,
        );
        write_varint_param(
            &mut body,
            INITIAL_MAX_STREAM_DATA_UNI,
            self.initial_max_stream_data_uni,
        );
        write_varint_param(&mut body, INITIAL_MAX_STREAMS_BIDI, self.initial_max_streams_bidi);
        write_varint_param(&mut body, INITIAL_MAX_STREAMS_UNI, self.initial_max_streams_uni);
        write_varint_param(&mut body, ACK_DELAY_EXPONENT, self.ack_delay_exponent as u64);
        write_varint_param(&mut body, MAX_ACK_DELAY, self.max_ack_delay);
        write_varint_param(
            &mut body,
            ACTIVE_CONNECTION_ID_LIMIT,
            self.active_connection_id_limit,
        );
        w.put_u16(body.len() as u16);
        w.put_slice(&body);
    }

    /// Decode parameters received from the peer. `side` is the local side;
    /// parameters only a server may send are rejected when the local side is
    /// the client's peer.
    pub fn read<R: Buf>(side: Side, r: &mut R) -> Result<Self, Error> {
        let mut params = TransportParameters::default();
        let list_len = r.get::<u16>()? as usize;
        if list_len != r.remaining() {
            return Err(Error::Malformed);
        }
        let mut seen = 0u64;
        while r.remaining() > 0 {
            let id = r.get::<u16>()?;
            let len = r.get::<u16>()? as usize;
            if r.remaining() < len {
                return Err(Error::Malformed);
            }
            if id < 64 {
                if seen & 1 << id != 0 {
                    return Err(Error::Malformed);
                }
                seen |= 1 << id;
            }
            match id {
                ORIGINAL_CONNECTION_ID => {
                    if side == Side::Server {
                        // Only servers issue Retries
                        return Err(Error::IllegalValue);
                    }
                    if len < MIN_CID_SIZE || len > MAX_CID_SIZE {
                        return Err(Error::Malformed);
                    }
                    let mut bytes = [0; MAX_CID_SIZE];
                    r.copy_to_slice(&mut bytes[..len]);
                    params.original_connection_id = Some(ConnectionId::new(&bytes[..len]));
                }
                IDLE_TIMEOUT => params.max_idle_timeout = read_varint(r, len)?,
                INITIAL_MAX_DATA => params.initial_max_data = read_varint(r, len)?,
                INITIAL_MAX_STREAM_DATA_BIDI_LOCAL => {
                    params.initial_max_stream_data_bidi_local = read_varint(r, len)?
                }
                INITIAL_MAX_STREAM_DATA_BIDI_REMOTE => {
                    params.initial_max_stream_data_bidi_remote = read_varint(r, len)?
                }
                INITIAL_MAX_STREAM_DATA_UNI => {
                    params.initial_max_stream_data_uni = read_varint(r, len)?
                }
                INITIAL_MAX_STREAMS_BIDI => {
                    params.initial_max_streams_bidi = read_varint(r, len)?
                }
                INITIAL_MAX_STREAMS_UNI => params.initial_max_streams_uni = read_varint(r, len)?,
                ACK_DELAY_EXPONENT => {
                    let x = read_varint(r, len)?;
                    if x > 20 {
                        return Err(Error::Malformed);
                    }
                    params.ack_delay_exponent = x as u8;
                }
                MAX_ACK_DELAY => params.max_ack_delay = read_varint(r, len)?,
                ACTIVE_CONNECTION_ID_LIMIT => {
                    params.active_connection_id_limit = read_varint(r, len)?
                }
                _ => {
                    // Unknown parameters are ignored
                    r.advance(len);
                }
            }
        }
        Ok(params)
    }
}

fn write_varint_param<W: BufMut>(w: &mut W, id: u16, value: u64) {
    w.put_u16(id);
    w.put_u16(varint_size(value));
    w.write_var(value);
}

fn varint_size(x: u64) -> u16 {
    if x < 1 << 6 {
        1
    } else if x < 1 << 14 {
        2
    } else if x < 1 << 30 {
        4
    } else {
        8
    }
}

fn read_varint<R: Buf>(r: &mut R, len: usize) -> Result<u64, Error> {
    if len > 8 {
        return Err(Error::Malformed);
    }
    let before = r.remaining();
    let x = r.get_var()?;
    if before - r.remaining() != len {
        return Err(Error::Malformed);
    }
    Ok(x)
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Fail)]
pub enum Error {
    #[fail(display = "parameter had malformed value")]
    Malformed,
    #[fail(display = "parameter illegal for this peer")]
    IllegalValue,
}

impl From<Error> for TransportError {
    fn from(_: Error) -> Self {
        TransportError::TRANSPORT_PARAMETER_ERROR
    }
}

impl From<coding::UnexpectedEnd> for Error {
    fn from(_: coding::UnexpectedEnd) -> Self {
        Error::Malformed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample() -> TransportParameters {
        TransportParameters {
            initial_max_data: 1_048_576,
            initial_max_stream_data_bidi_local: 65_536,
            initial_max_stream_data_bidi_remote: 65_536,
            initial_max_stream_data_uni: 32_768,
            initial_max_streams_bidi: 16,
            initial_max_streams_uni: 8,
            max_idle_timeout: 10_000,
            ack_delay_exponent: 3,
            max_ack_delay: 25,
            active_connection_id_limit: 2,
            original_connection_id: None,
        }
    }

    #[test]
    fn roundtrip() {
        let params = sample();
        let mut buf = Vec::new();
        params.write(&mut buf);
        let read = TransportParameters::read(Side::Server, &mut Cursor::new(&buf[..])).unwrap();
        assert_eq!(read, params);
    }

    #[test]
    fn original_connection_id_from_server_only() {
        let mut params = sample();
        params.original_connection_id = Some(ConnectionId::new(&[0xaa; 8]));
        let mut buf = Vec::new();
        params.write(&mut buf);
        // A client accepts it...
        let read = TransportParameters::read(Side::Client, &mut Cursor::new(&buf[..])).unwrap();
        assert_eq!(read.original_connection_id, params.original_connection_id);
        // ...a server must not
        assert_eq!(
            TransportParameters::read(Side::Server, &mut Cursor::new(&buf[..])),
            Err(Error::IllegalValue),
        );
    }

    #[test]
    fn duplicate_parameter() {
        let mut buf = Vec::new();
        let mut body = Vec::new();
        write_varint_param(&mut body, INITIAL_MAX_DATA, 100);
        write_varint_param(&mut body, INITIAL_MAX_DATA, 200);
        buf.put_u16(body.len() as u16);
        buf.put_slice(&body);
        assert_eq!(
            TransportParameters::read(Side::Server, &mut Cursor::new(&buf[..])),
            Err(Error::Malformed),
        );
    }

    #[test]
    fn unknown_parameter_skipped() {
        let mut buf = Vec::new();
        let mut body = Vec::new();
        body.put_u16(0x7fee);
        body.put_u16(3);
        body.put_slice(b"???");
        write_varint_param(&mut body, INITIAL_MAX_DATA, 4242);
        buf.put_u16(body.len() as u16);
        buf.put_slice(&body);
        let read = TransportParameters::read(Side::Server, &mut Cursor::new(&buf[..])).unwrap();
        assert_eq!(read.initial_max_data, 4242);
    }

    #[test]
    fn truncated_list() {
        let mut buf = Vec::new();
        buf.put_u16(40);
        buf.put_u16(INITIAL_MAX_DATA);
        assert_matches!(
            TransportParameters::read(Side::Server, &mut Cursor::new(&buf[..])),
            Err(Error::Malformed)
        );
    }
}
