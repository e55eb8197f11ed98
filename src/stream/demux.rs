//! Frame demultiplexer
//!
//! Splits a combined byte stream of length-prefixed, channel-tagged frames
//! back into raw payload bytes. Frame layout: 1 tag byte, 3 reserved bytes,
//! 4-byte big-endian payload length, then the payload. The stream arrives
//! arbitrarily fragmented; the parser must resume mid-header or mid-payload,
//! down to one byte per call.

use crate::error::SluiceError;
use crate::stream::StreamPusher;

pub const TAG_STDIN: u8 = 0;
pub const TAG_STDOUT: u8 = 1;
pub const TAG_STDERR: u8 = 2;

const HEADER_LEN: usize = 8;

enum State {
    Header { buf: [u8; HEADER_LEN], seen: usize },
    Payload { remaining: usize },
}

impl State {
    fn header() -> Self {
        State::Header {
            buf: [0; HEADER_LEN],
            seen: 0,
        }
    }
}

/// Pusher that decodes frames and forwards payload bytes to the wrapped
/// sink. Channel routing, if any, is the wrapped sink's job.
pub struct FrameDemux<P: StreamPusher> {
    sink: P,
    state: State,
}

impl<P: StreamPusher> FrameDemux<P> {
    pub fn new(sink: P) -> Self {
        Self {
            sink,
            state: State::header(),
        }
    }

    pub fn into_inner(self) -> P {
        self.sink
    }
}

impl<P: StreamPusher> StreamPusher for FrameDemux<P> {
    fn write(&mut self, mut data: &[u8]) -> Result<(), SluiceError> {
        while !data.is_empty() {
            match &mut self.state {
                State::Header { buf, seen } => {
                    let take = (HEADER_LEN - *seen).min(data.len());
                    buf[*seen..*seen + take].copy_from_slice(&data[..take]);
                    *seen += take;
                    data = &data[take..];

                    if *seen == HEADER_LEN {
                        let tag = buf[0];
                        if tag > TAG_STDERR {
                            return Err(SluiceError::MalformedFrame { tag });
                        }
                        let size = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
                        // A zero-size payload completes immediately.
                        self.state = if size == 0 {
                            State::header()
                        } else {
                            State::Payload { remaining: size }
                        };
                    }
                }
                State::Payload { remaining } => {
                    let take = (*remaining).min(data.len());
                    self.sink.write(&data[..take])?;
                    *remaining -= take;
                    data = &data[take..];
                    if *remaining == 0 {
                        self.state = State::header();
                    }
                }
            }
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), SluiceError> {
        self.sink.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{shared_buffer, AccumulateBinding};

    fn frame(tag: u8, payload: &[u8]) -> Vec<u8> {
        let mut bytes = vec![tag, 0, 0, 0];
        bytes.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        bytes.extend_from_slice(payload);
        bytes
    }

    #[test]
    fn two_frames_in_one_write() {
        let buffer = shared_buffer();
        let mut demux = FrameDemux::new(AccumulateBinding::new(buffer.clone()));

        let mut bytes = frame(TAG_STDERR, b"this is stderr data\n");
        bytes.extend(frame(TAG_STDOUT, b"this is stdout data\n"));
        demux.write(&bytes).unwrap();

        assert_eq!(
            &*buffer.lock(),
            b"this is stderr data\nthis is stdout data\n"
        );
    }

    #[test]
    fn byte_at_a_time_matches_whole_buffer() {
        let mut bytes = frame(TAG_STDERR, b"this is stderr data\n");
        bytes.extend(frame(TAG_STDOUT, b"this is stdout data\n"));

        let whole = shared_buffer();
        let mut demux = FrameDemux::new(AccumulateBinding::new(whole.clone()));
        demux.write(&bytes).unwrap();

        let trickled = shared_buffer();
        let mut demux = FrameDemux::new(AccumulateBinding::new(trickled.clone()));
        for byte in &bytes {
            demux.write(std::slice::from_ref(byte)).unwrap();
        }

        assert_eq!(&*whole.lock(), &*trickled.lock());
    }

    #[test]
    fn zero_length_payload_resets() {
        let buffer = shared_buffer();
        let mut demux = FrameDemux::new(AccumulateBinding::new(buffer.clone()));

        let mut bytes = frame(TAG_STDOUT, b"");
        bytes.extend(frame(TAG_STDOUT, b"after"));
        demux.write(&bytes).unwrap();
        assert_eq!(&*buffer.lock(), b"after");
    }

    #[test]
    fn unknown_tag_is_protocol_error() {
        let mut demux = FrameDemux::new(AccumulateBinding::new(shared_buffer()));
        let err = demux.write(&frame(9, b"payload")).unwrap_err();
        assert!(matches!(err, SluiceError::MalformedFrame { tag: 9 }));
    }

    #[test]
    fn payload_split_across_writes() {
        let buffer = shared_buffer();
        let mut demux = FrameDemux::new(AccumulateBinding::new(buffer.clone()));

        let bytes = frame(TAG_STDOUT, b"split payload");
        demux.write(&bytes[..10]).unwrap();
        demux.write(&bytes[10..]).unwrap();
        assert_eq!(&*buffer.lock(), b"split payload");
    }
}
