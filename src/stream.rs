use std::cmp;
use std::collections::BTreeMap;

use bytes::{Buf, Bytes};
use fnv::FnvHashMap;
use slog::Logger;

use frame;
use transport_parameters::TransportParameters;
use {Directionality, Side, StreamId, TransportError};

/// Receives ordered stream data from a connection.
pub trait StreamListener {
    /// Bytes delivered in offset order. `fin` is true exactly when `data`
    /// ends the stream.
    fn on_data(&mut self, id: StreamId, data: Bytes, fin: bool);
    /// The peer abruptly terminated the stream; no further data follows.
    fn on_reset(&mut self, id: StreamId, error_code: u16);
}

/// Reorders stream fragments into a contiguous byte stream.
///
/// Identical bytes received twice are discarded; overlapping fragments with
/// conflicting content are a protocol violation.
pub struct Assembler {
    data: BTreeMap<u64, Bytes>,
    offset: u64,
}

impl Assembler {
    pub fn new() -> Self {
        Assembler {
            data: BTreeMap::new(),
            offset: 0,
        }
    }

    /// Offset of the next byte to be read.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn insert(&mut self, mut offset: u64, mut data: Bytes) -> Result<(), TransportError> {
        if offset < self.offset {
            // Already-delivered prefix; nothing left to verify it against
            let skip = cmp::min((self.offset - offset) as usize, data.len());
            data.advance(skip);
            offset += skip as u64;
        }
        if data.is_empty() {
            return Ok(());
        }
        let end = offset + data.len() as u64;
        let overlaps = self
            .data
            .range(..end)
            .rev()
            .take_while(|&(&start, ref chunk)| start + chunk.len() as u64 > offset)
            .map(|(&start, chunk)| (start, chunk.clone()))
            .collect::<Vec<_>>();
        let mut pieces = Vec::new();
        let mut cursor = offset;
        for &(start, ref chunk) in overlaps.iter().rev() {
            if data.is_empty() {
                break;
            }
            if start > cursor {
                let gap = cmp::min((start - cursor) as usize, data.len());
                pieces.push((cursor, data.split_to(gap)));
                cursor = start;
            }
            if data.is_empty() {
                break;
            }
            let chunk_end = start + chunk.len() as u64;
            let overlap = cmp::min(chunk_end.saturating_sub(cursor) as usize, data.len());
            if overlap > 0 {
                let mine = data.split_to(overlap);
                let at = (cursor - start) as usize;
                if mine != chunk[at..at + overlap] {
                    return Err(TransportError::PROTOCOL_VIOLATION);
                }
                cursor += overlap as u64;
            }
        }
        if !data.is_empty() {
            pieces.push((cursor, data));
        }
        for (off, piece) in pieces {
            self.data.insert(off, piece);
        }
        Ok(())
    }

    /// Take the next contiguous chunk, if one is available.
    pub fn read(&mut self) -> Option<Bytes> {
        let first = *self.data.keys().next()?;
        if first > self.offset {
            return None;
        }
        let chunk = self.data.remove(&first).unwrap();
        debug_assert_eq!(first, self.offset);
        self.offset += chunk.len() as u64;
        Some(chunk)
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }
}

pub struct Recv {
    assembler: Assembler,
    final_offset: Option<u64>,
    fin_delivered: bool,
    aborted: bool,
}

impl Recv {
    fn new() -> Self {
        Recv {
            assembler: Assembler::new(),
            final_offset: None,
            fin_delivered: false,
            aborted: false,
        }
    }
}

pub struct Send {
    pub offset: u64,
    pub fin_sent: bool,
}

impl Send {
    fn new() -> Self {
        Send {
            offset: 0,
            fin_sent: false,
        }
    }
}

pub struct Stream {
    recv: Option<Recv>,
    send: Option<Send>,
}

impl Stream {
    fn new_bi() -> Self {
        Stream {
            recv: Some(Recv::new()),
            send: Some(Send::new()),
        }
    }

    fn new_recv() -> Self {
        Stream {
            recv: Some(Recv::new()),
            send: None,
        }
    }

    fn new_send() -> Self {
        Stream {
            recv: None,
            send: Some(Send::new()),
        }
    }
}

/// Owns all streams of one connection: admission, reassembly, and delivery.
pub struct StreamManager {
    log: Logger,
    side: Side,
    streams: FnvHashMap<StreamId, Stream>,
    next_bi: u64,
    next_uni: u64,
    /// Locally initiated stream limits, dictated by the peer
    max_bi: u64,
    max_uni: u64,
    /// Peer-initiated stream limits, dictated by us
    max_remote_bi: u64,
    max_remote_uni: u64,
    listener: Box<dyn StreamListener>,
}

impl StreamManager {
    pub fn new(
        log: Logger,
        side: Side,
        max_remote_bi: u64,
        max_remote_uni: u64,
        listener: Box<dyn StreamListener>,
    ) -> Self {
        StreamManager {
            log,
            side,
            streams: FnvHashMap::default(),
            next_bi: 0,
            next_uni: 0,
            max_bi: 0,
            max_uni: 0,
            max_remote_bi,
            max_remote_uni,
            listener,
        }
    }

    /// Adopt the stream limits the peer advertised during the handshake.
    pub fn apply_params(&mut self, params: &TransportParameters) {
        self.max_bi = cmp::max(self.max_bi, params.initial_max_streams_bidi);
        self.max_uni = cmp::max(self.max_uni, params.initial_max_streams_uni);
    }

    pub fn on_max_streams(&mut self, directionality: Directionality, count: u64) {
        let limit = match directionality {
            Directionality::Bi => &mut self.max_bi,
            Directionality::Uni => &mut self.max_uni,
        };
        if count > *limit {
            trace!(self.log, "stream limit increased"; "directionality" => ?directionality, "count" => count);
            *limit = count;
        }
    }

    /// Create a fresh locally-initiated stream, if the peer's limit allows.
    pub fn open(&mut self, directionality: Directionality) -> Option<StreamId> {
        {
            let (next, max) = match directionality {
                Directionality::Bi => (&self.next_bi, self.max_bi),
                Directionality::Uni => (&self.next_uni, self.max_uni),
            };
            if *next >= max {
                return None;
            }
        }
        let next = match directionality {
            Directionality::Bi => &mut self.next_bi,
            Directionality::Uni => &mut self.next_uni,
        };
        let id = StreamId::new(self.side, directionality, *next);
        *next += 1;
        let stream = match directionality {
            Directionality::Bi => Stream::new_bi(),
            Directionality::Uni => Stream::new_send(),
        };
        self.streams.insert(id, stream);
        Some(id)
    }

    /// Process an incoming STREAM frame, delivering any newly contiguous
    /// bytes to the listener.
    pub fn on_stream(&mut self, frame: frame::Stream) -> Result<(), TransportError> {
        let id = frame.id;
        self.ensure_recv_stream(id)?;
        let mut deliveries = Vec::new();
        {
            let rs = self
                .streams
                .get_mut(&id)
                .unwrap()
                .recv
                .as_mut()
                .unwrap();
            if rs.aborted {
                trace!(self.log, "dropping frame for reset stream"; "stream" => %id);
                return Ok(());
            }
            let end = frame.offset + frame.data.len() as u64;
            if let Some(final_offset) = rs.final_offset {
                if end > final_offset || (frame.fin && end != final_offset) {
                    debug!(self.log, "final size violated"; "stream" => %id,
                           "end" => end, "final offset" => final_offset);
                    return Err(TransportError::FINAL_SIZE_ERROR);
                }
            }
            if frame.fin {
                if end < rs.assembler.offset() {
                    return Err(TransportError::FINAL_SIZE_ERROR);
                }
                rs.final_offset = Some(end);
            }
            rs.assembler.insert(frame.offset, frame.data)?;
            while let Some(chunk) = rs.assembler.read() {
                let fin = rs.final_offset == Some(rs.assembler.offset());
                if fin {
                    rs.fin_delivered = true;
                }
                deliveries.push((chunk, fin));
            }
            if !rs.fin_delivered && rs.final_offset == Some(rs.assembler.offset()) {
                // FIN with no data left owed
                rs.fin_delivered = true;
                deliveries.push((Bytes::new(), true));
            }
        }
        for (chunk, fin) in deliveries {
            trace!(self.log, "delivering"; "stream" => %id, "len" => chunk.len(), "fin" => fin);
            self.listener.on_data(id, chunk, fin);
        }
        Ok(())
    }

    pub fn on_reset(&mut self, frame: frame::ResetStream) -> Result<(), TransportError> {
        let id = frame.id;
        self.ensure_recv_stream(id)?;
        {
            let rs = self
                .streams
                .get_mut(&id)
                .unwrap()
                .recv
                .as_mut()
                .unwrap();
            if rs.aborted || rs.fin_delivered {
                return Ok(());
            }
            rs.aborted = true;
            rs.assembler.clear();
        }
        debug!(self.log, "stream reset by peer"; "stream" => %id, "error" => frame.error_code);
        self.listener.on_reset(id, frame.error_code);
        Ok(())
    }

    /// Produce a STREAM frame carrying `data` at the stream's send offset.
    ///
    /// # Panics
    /// - when applied to an unknown stream or one without an outgoing channel
    /// - when the stream has already been finished
    pub fn write(&mut self, id: StreamId, data: Bytes, fin: bool) -> frame::Stream {
        let ss = self
            .streams
            .get_mut(&id)
            .expect("unknown stream")
            .send
            .as_mut()
            .expect("recv-only stream");
        assert!(!ss.fin_sent, "stream already finished");
        let offset = ss.offset;
        ss.offset += data.len() as u64;
        if fin {
            ss.fin_sent = true;
        }
        frame::Stream {
            id,
            offset,
            fin,
            data,
        }
    }

    fn ensure_recv_stream(&mut self, id: StreamId) -> Result<(), TransportError> {
        if let Some(stream) = self.streams.get(&id) {
            return if stream.recv.is_some() {
                Ok(())
            } else {
                Err(TransportError::STREAM_STATE_ERROR)
            };
        }
        if id.initiator() == self.side {
            // Data for a local stream we never opened
            return Err(TransportError::STREAM_STATE_ERROR);
        }
        let limit = match id.directionality() {
            Directionality::Bi => self.max_remote_bi,
            Directionality::Uni => self.max_remote_uni,
        };
        if id.index() >= limit {
            debug!(self.log, "peer exceeded stream limit"; "stream" => %id);
            return Err(TransportError::STREAM_LIMIT_ERROR);
        }
        let stream = match id.directionality() {
            Directionality::Bi => Stream::new_bi(),
            Directionality::Uni => Stream::new_recv(),
        };
        self.streams.insert(id, stream);
        Ok(())
    }
}
