//! C1: turns an arbitrary byte stream from one serial port into discrete
//! radio frames (spec §4.1). Two framings coexist on the same stream; the
//! reassembler tries the RM024 0x81 envelope first, then a raw Gen2 frame,
//! discarding unmatched bytes ahead of whatever it does find.

use crate::error::FramingError;

/// Largest frame either framing can produce: `3 + 255` for an envelope
/// with the widest possible LEN, or `12 + 255 + 1` for a Gen2 P1 frame
/// with the widest possible text block. Used to bound the accumulator.
const MAX_FRAME_LEN: usize = 12 + 255 + 1;
/// Bytes of backtracking allowed while hunting for the next frame start
/// before the accumulator is forcibly truncated (spec §4.1).
const RESYNC_WINDOW: usize = 256;
/// How many bytes past a matched envelope's header+payload to peek at for
/// RSSI extraction (spec §9 Open Question a). This peek does not consume
/// bytes from the accumulator — the next scan pass walks over them again,
/// same as any other un-framed byte.
const TRAILER_PEEK_LEN: usize = 8;

/// A whole radio frame as the reassembler found it. `Envelope::bytes` is
/// exactly the `0x81, LEN, 0x00, PAYLOAD[LEN]` slice; the trailer that
/// nominally follows it is never consumed as part of the frame (spec's
/// "TRAILER[variable]" gives no way to bound its length), only peeked for
/// RSSI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Gen2 { bytes: Vec<u8> },
    Envelope { bytes: Vec<u8>, trailer_peek: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReassemblerEvent {
    Frame(Frame),
    Error(FramingError),
}

#[derive(Debug, Default)]
pub struct FrameReassembler {
    buf: Vec<u8>,
}

impl FrameReassembler {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Number of bytes currently held, waiting for more data or a resync
    /// truncation. Exposed for the bound-invariant test (spec §8 property 3).
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    /// Append `data` to the accumulator and extract every whole frame that
    /// can now be found, in order.
    pub fn feed(&mut self, data: &[u8]) -> Vec<ReassemblerEvent> {
        self.buf.extend_from_slice(data);
        let mut events = Vec::new();

        loop {
            match self.try_extract_one() {
                ExtractOutcome::Frame(frame) => events.push(ReassemblerEvent::Frame(frame)),
                ExtractOutcome::Error(err) => events.push(ReassemblerEvent::Error(err)),
                ExtractOutcome::NeedMoreData => break,
            }
        }

        self.enforce_bound(&mut events);
        events
    }

    /// Drop any partial frame on a cooperative shutdown (spec §5).
    pub fn reset(&mut self) {
        self.buf.clear();
    }

    fn enforce_bound(&mut self, events: &mut Vec<ReassemblerEvent>) {
        let cap = MAX_FRAME_LEN + RESYNC_WINDOW;
        if self.buf.len() > cap {
            let drop_count = self.buf.len() - cap;
            self.buf.drain(0..drop_count);
            events.push(ReassemblerEvent::Error(FramingError::NoSync {
                window: RESYNC_WINDOW,
            }));
        }
    }

    fn try_extract_one(&mut self) -> ExtractOutcome {
        let mut pos = 0usize;

        while pos < self.buf.len() && pos < RESYNC_WINDOW {
            let remaining = &self.buf[pos..];

            match try_match_envelope(remaining) {
                MatchOutcome::Matched { consumed, frame } => {
                    self.buf.drain(0..pos + consumed);
                    return ExtractOutcome::Frame(frame);
                }
                MatchOutcome::Invalid(err) => {
                    // LEN=0: drop just this leading 0x81 byte and keep
                    // scanning rather than abandoning the whole prefix.
                    self.buf.drain(0..pos + 1);
                    return ExtractOutcome::Error(err);
                }
                MatchOutcome::NeedMoreData => return ExtractOutcome::NeedMoreData,
                MatchOutcome::NoMatch => {}
            }

            match try_match_gen2(remaining) {
                MatchOutcome::Matched { consumed, frame } => {
                    self.buf.drain(0..pos + consumed);
                    return ExtractOutcome::Frame(frame);
                }
                MatchOutcome::Invalid(_) => unreachable!("gen2 matcher never returns Invalid"),
                MatchOutcome::NeedMoreData => return ExtractOutcome::NeedMoreData,
                MatchOutcome::NoMatch => {}
            }

            pos += 1;
        }

        if pos > 0 {
            // Exhausted the resync window without a match: discard the
            // scanned prefix as garbage and report it, then let the caller
            // loop back in for another pass over what's left.
            self.buf.drain(0..pos);
            return ExtractOutcome::Error(FramingError::NoSync {
                window: RESYNC_WINDOW,
            });
        }

        ExtractOutcome::NeedMoreData
    }
}

enum ExtractOutcome {
    Frame(Frame),
    Error(FramingError),
    NeedMoreData,
}

enum MatchOutcome {
    Matched { consumed: usize, frame: Frame },
    Invalid(FramingError),
    NeedMoreData,
    NoMatch,
}

fn try_match_envelope(data: &[u8]) -> MatchOutcome {
    if data.is_empty() || data[0] != 0x81 {
        return MatchOutcome::NoMatch;
    }
    if data.len() < 2 {
        return MatchOutcome::NeedMoreData;
    }
    let len = data[1];
    if len == 0 {
        return MatchOutcome::Invalid(FramingError::ZeroLength);
    }
    let total = 3 + len as usize;
    if data.len() < total {
        return MatchOutcome::NeedMoreData;
    }
    let bytes = data[0..total].to_vec();
    let peek_end = (total + TRAILER_PEEK_LEN).min(data.len());
    let trailer_peek = data[total..peek_end].to_vec();
    MatchOutcome::Matched {
        consumed: total,
        frame: Frame::Envelope {
            bytes,
            trailer_peek,
        },
    }
}

fn try_match_gen2(data: &[u8]) -> MatchOutcome {
    if data.len() < 3 {
        return MatchOutcome::NeedMoreData;
    }
    if data[2] != 0x01 {
        return MatchOutcome::NoMatch;
    }
    if data.len() < 11 {
        return MatchOutcome::NeedMoreData;
    }
    let has_text = data[10] & 0x01 != 0;
    let total = if has_text {
        if data.len() < 12 {
            return MatchOutcome::NeedMoreData;
        }
        let text_len = data[11] as usize;
        12 + text_len + 1
    } else {
        12
    };
    if data.len() < total {
        return MatchOutcome::NeedMoreData;
    }
    MatchOutcome::Matched {
        consumed: total,
        frame: Frame::Gen2 {
            bytes: data[0..total].to_vec(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gen2_frame(has_text: bool) -> Vec<u8> {
        let mut buf = vec![0x00, 0x07, 0x01, 0, 0, 0, 0, 0, 100, 6, if has_text { 1 } else { 0 }];
        if has_text {
            buf.push(4);
            buf.extend_from_slice(b"abcd");
        }
        let sum = buf.iter().fold(0u8, |a, b| a.wrapping_add(*b));
        buf.push(sum);
        buf
    }

    fn envelope_frame(len: u8) -> Vec<u8> {
        let mut buf = vec![0x81, len, 0x00];
        buf.extend(std::iter::repeat(0xAA).take(len as usize));
        buf
    }

    #[test]
    fn extracts_single_gen2_frame() {
        let mut r = FrameReassembler::new();
        let frame = gen2_frame(false);
        let events = r.feed(&frame);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], ReassemblerEvent::Frame(Frame::Gen2 { bytes }) if bytes == &frame));
        assert_eq!(r.buffered_len(), 0);
    }

    #[test]
    fn extracts_gen2_frame_with_text() {
        let mut r = FrameReassembler::new();
        let frame = gen2_frame(true);
        let events = r.feed(&frame);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], ReassemblerEvent::Frame(Frame::Gen2 { .. })));
    }

    #[test]
    fn extracts_envelope_frame_and_peeks_trailer() {
        let mut r = FrameReassembler::new();
        let mut stream = envelope_frame(5);
        stream.extend_from_slice(&[0x01, 0x02, 0x03]); // trailer
        let events = r.feed(&stream);
        assert_eq!(events.len(), 1);
        match &events[0] {
            ReassemblerEvent::Frame(Frame::Envelope { bytes, trailer_peek }) => {
                assert_eq!(bytes.len(), 8);
                assert_eq!(trailer_peek, &vec![0x01, 0x02, 0x03]);
            }
            other => panic!("expected envelope frame, got {other:?}"),
        }
    }

    #[test]
    fn waits_for_more_data_on_partial_frame() {
        let mut r = FrameReassembler::new();
        let frame = gen2_frame(false);
        let events = r.feed(&frame[0..6]);
        assert!(events.is_empty());
        assert_eq!(r.buffered_len(), 6);

        let events = r.feed(&frame[6..]);
        assert_eq!(events.len(), 1);
        assert_eq!(r.buffered_len(), 0);
    }

    #[test]
    fn discards_garbage_before_a_match() {
        let mut r = FrameReassembler::new();
        let mut stream = vec![0xDE, 0xAD, 0xBE, 0xEF];
        stream.extend(gen2_frame(false));
        let events = r.feed(&stream);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], ReassemblerEvent::Frame(_)));
    }

    #[test]
    fn zero_length_envelope_is_a_framing_error_not_fatal() {
        let mut r = FrameReassembler::new();
        let mut stream = vec![0x81, 0x00];
        stream.extend(gen2_frame(false));
        let events = r.feed(&stream);
        assert!(events
            .iter()
            .any(|e| matches!(e, ReassemblerEvent::Error(FramingError::ZeroLength))));
        assert!(events.iter().any(|e| matches!(e, ReassemblerEvent::Frame(_))));
    }

    #[test]
    fn extracts_multiple_frames_from_one_feed() {
        let mut r = FrameReassembler::new();
        let mut stream = gen2_frame(false);
        stream.extend(gen2_frame(false));
        let events = r.feed(&stream);
        assert_eq!(events.len(), 2);
        assert!(events
            .iter()
            .all(|e| matches!(e, ReassemblerEvent::Frame(_))));
    }

    #[test]
    fn buffer_length_is_bounded_after_long_garbage_run() {
        let mut r = FrameReassembler::new();
        let garbage = vec![0x00u8; 10_000];
        let _ = r.feed(&garbage);
        assert!(r.buffered_len() <= MAX_FRAME_LEN + RESYNC_WINDOW);
    }

    #[test]
    fn reset_drops_partial_frame() {
        let mut r = FrameReassembler::new();
        let frame = gen2_frame(false);
        let _ = r.feed(&frame[0..6]);
        assert_eq!(r.buffered_len(), 6);
        r.reset();
        assert_eq!(r.buffered_len(), 0);
    }
}
