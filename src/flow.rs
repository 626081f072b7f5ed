use fnv::FnvHashMap;
use slog::Logger;

use frame::Frame;
use transport_parameters::TransportParameters;
use StreamId;

/// Queue through which a flow-control hook injects frames into the
/// connection's next outgoing packet.
#[derive(Default)]
pub struct FrameSender {
    frames: Vec<Frame>,
}

impl FrameSender {
    pub fn new() -> Self {
        FrameSender { frames: Vec::new() }
    }

    pub fn send(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub(crate) fn into_frames(self) -> Vec<Frame> {
        self.frames
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SendDecision {
    Proceed,
    /// Credit is insufficient; the connection holds the frames back.
    Defer,
}

/// Credit-accounting hooks run on either side of the packet buffer.
///
/// `before_send_packet` may inject MAX_* frames or defer the packet;
/// `on_receive_packet` observes received byte counts and replenishes the
/// peer's credit. The algorithm behind the hooks is an implementation
/// choice; [`NoopFlowControl`] applies no limits at all.
pub trait FlowControl {
    fn before_send_packet(&mut self, _frames: &[Frame], _out: &mut FrameSender) -> SendDecision {
        SendDecision::Proceed
    }

    fn on_receive_packet(&mut self, _frames: &[Frame], _out: &mut FrameSender) {}

    /// The peer's transport parameters became available.
    fn on_transport_parameters(&mut self, _params: &TransportParameters) {}
}

/// Applies no credit accounting whatsoever.
pub struct NoopFlowControl;

impl FlowControl for NoopFlowControl {}

/// Fixed-window credit accounting: connection- and stream-level limits are
/// reissued once half the window has been consumed.
pub struct WindowedFlowControl {
    log: Logger,
    window: u64,
    stream_window: u64,
    local_max_data: u64,
    /// Sum of the highest end offsets seen per stream; an upper bound on
    /// delivered bytes
    recvd: u64,
    stream_ends: FnvHashMap<StreamId, u64>,
    stream_limits: FnvHashMap<StreamId, u64>,
    peer_max_data: u64,
    data_sent: u64,
}

impl WindowedFlowControl {
    pub fn new(log: Logger, window: u64, stream_window: u64) -> Self {
        WindowedFlowControl {
            log,
            window,
            stream_window,
            local_max_data: window,
            recvd: 0,
            stream_ends: FnvHashMap::default(),
            stream_limits: FnvHashMap::default(),
            peer_max_data: 0,
            data_sent: 0,
        }
    }
}

impl FlowControl for WindowedFlowControl {
    fn on_transport_parameters(&mut self, params: &TransportParameters) {
        if params.initial_max_data > self.peer_max_data {
            self.peer_max_data = params.initial_max_data;
        }
    }

    fn before_send_packet(&mut self, frames: &[Frame], _out: &mut FrameSender) -> SendDecision {
        let bytes: u64 = frames
            .iter()
            .filter_map(|f| match *f {
                Frame::Stream(ref s) => Some(s.data.len() as u64),
                _ => None,
            })
            .sum();
        if bytes > 0 && self.data_sent + bytes > self.peer_max_data {
            trace!(self.log, "deferring packet; no connection credit";
                   "sent" => self.data_sent, "max" => self.peer_max_data, "bytes" => bytes);
            return SendDecision::Defer;
        }
        self.data_sent += bytes;
        SendDecision::Proceed
    }

    fn on_receive_packet(&mut self, frames: &[Frame], out: &mut FrameSender) {
        for frame in frames {
            match *frame {
                Frame::Stream(ref s) => {
                    let end = s.offset + s.data.len() as u64;
                    let seen = self.stream_ends.entry(s.id).or_insert(0);
                    if end > *seen {
                        self.recvd += end - *seen;
                        *seen = end;
                    }
                    let limit = self.stream_limits.entry(s.id).or_insert(self.stream_window);
                    if limit.saturating_sub(end) < self.stream_window / 2 {
                        *limit = end + self.stream_window;
                        trace!(self.log, "replenishing stream credit"; "stream" => %s.id, "max" => *limit);
                        out.send(Frame::MaxStreamData {
                            id: s.id,
                            offset: *limit,
                        });
                    }
                }
                Frame::MaxData(max) => {
                    if max > self.peer_max_data {
                        self.peer_max_data = max;
                    }
                }
                _ => {}
            }
        }
        if self.local_max_data.saturating_sub(self.recvd) < self.window / 2 {
            self.local_max_data = self.recvd + self.window;
            trace!(self.log, "replenishing connection credit"; "max" => self.local_max_data);
            out.send(Frame::MaxData(self.local_max_data));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use frame;
    use {Directionality, Side};

    fn logger() -> Logger {
        Logger::root(::slog::Discard, o!())
    }

    fn stream_frame(offset: u64, len: usize) -> Frame {
        Frame::Stream(frame::Stream {
            id: StreamId::new(Side::Client, Directionality::Uni, 0),
            offset,
            fin: false,
            data: Bytes::from(vec![0x5c; len]),
        })
    }

    #[test]
    fn noop_always_proceeds() {
        let mut flow = NoopFlowControl;
        let mut out = FrameSender::new();
        assert_eq!(
            flow.before_send_packet(&[stream_frame(0, 10_000)], &mut out),
            SendDecision::Proceed,
        );
        flow.on_receive_packet(&[stream_frame(0, 10_000)], &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn replenishes_connection_credit() {
        let mut flow = WindowedFlowControl::new(logger(), 1000, 1_000_000);
        let mut out = FrameSender::new();
        flow.on_receive_packet(&[stream_frame(0, 100)], &mut out);
        assert!(out.is_empty());
        flow.on_receive_packet(&[stream_frame(100, 500)], &mut out);
        let frames = out.into_frames();
        assert_eq!(frames.len(), 1);
        assert_matches!(frames[0], Frame::MaxData(1600));
    }

    #[test]
    fn replenishes_stream_credit() {
        let mut flow = WindowedFlowControl::new(logger(), 1_000_000, 1000);
        let mut out = FrameSender::new();
        flow.on_receive_packet(&[stream_frame(0, 700)], &mut out);
        let frames = out.into_frames();
        assert_eq!(frames.len(), 1);
        assert_matches!(frames[0], Frame::MaxStreamData { offset: 1700, .. });
    }

    #[test]
    fn duplicate_data_counted_once() {
        let mut flow = WindowedFlowControl::new(logger(), 1000, 1_000_000);
        let mut out = FrameSender::new();
        for _ in 0..10 {
            flow.on_receive_packet(&[stream_frame(0, 100)], &mut out);
        }
        assert!(out.is_empty());
    }

    #[test]
    fn defers_without_peer_credit() {
        let mut flow = WindowedFlowControl::new(logger(), 1000, 1000);
        let mut out = FrameSender::new();
        assert_eq!(
            flow.before_send_packet(&[stream_frame(0, 10)], &mut out),
            SendDecision::Defer,
        );
        let params = TransportParameters {
            initial_max_data: 1000,
            ..TransportParameters::default()
        };
        flow.on_transport_parameters(&params);
        assert_eq!(
            flow.before_send_packet(&[stream_frame(0, 10)], &mut out),
            SendDecision::Proceed,
        );
        // Non-stream frames never consume credit
        assert_eq!(
            flow.before_send_packet(&[Frame::Ping], &mut out),
            SendDecision::Proceed,
        );
    }
}
