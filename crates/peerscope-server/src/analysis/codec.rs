//! Frame delimiting for the transcoder's output stream.
//!
//! The encoded format decides how frames are cut out of the byte stream:
//! MJPEG streams are delimited by JPEG SOI/EOI markers, length-prefixed
//! streams by a four-byte big-endian prefix.

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, LengthDelimitedCodec};

use crate::config::FrameFormat;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame exceeds {max} bytes without a frame boundary")]
    FrameTooLarge { max: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub enum FrameCodec {
    Mjpeg(MjpegCodec),
    LengthPrefixed(LengthDelimitedCodec),
}

impl FrameCodec {
    pub fn new(format: FrameFormat, max_frame_bytes: usize) -> Self {
        match format {
            FrameFormat::Mjpeg => Self::Mjpeg(MjpegCodec {
                max: max_frame_bytes,
            }),
            FrameFormat::LengthPrefixed => Self::LengthPrefixed(
                LengthDelimitedCodec::builder()
                    .max_frame_length(max_frame_bytes)
                    .new_codec(),
            ),
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, CodecError> {
        match self {
            FrameCodec::Mjpeg(codec) => codec.decode(src),
            FrameCodec::LengthPrefixed(codec) => {
                Ok(codec.decode(src)?.map(BytesMut::freeze))
            }
        }
    }
}

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

/// Cuts JPEG images out of a concatenated MJPEG stream. Bytes before a
/// start-of-image marker are discarded.
pub struct MjpegCodec {
    max: usize,
}

impl Decoder for MjpegCodec {
    type Item = Bytes;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, CodecError> {
        let Some(start) = find_marker(src, &SOI) else {
            // keep one byte in case the buffer ends halfway through a marker
            if src.len() > 1 {
                src.advance(src.len() - 1);
            }
            return Ok(None);
        };
        if start > 0 {
            src.advance(start);
        }

        match find_marker(&src[2..], &EOI) {
            Some(end) => {
                let frame = src.split_to(2 + end + 2).freeze();
                Ok(Some(frame))
            }
            None => {
                if src.len() > self.max {
                    return Err(CodecError::FrameTooLarge { max: self.max });
                }
                Ok(None)
            }
        }
    }
}

fn find_marker(haystack: &[u8], marker: &[u8; 2]) -> Option<usize> {
    haystack
        .windows(2)
        .position(|window| window == marker)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::analyzer::test_support::fake_jpeg;

    fn mjpeg() -> FrameCodec {
        FrameCodec::new(FrameFormat::Mjpeg, 1024)
    }

    #[test]
    fn splits_consecutive_jpeg_frames() {
        let mut codec = mjpeg();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&fake_jpeg(320, 240));
        buf.extend_from_slice(&fake_jpeg(320, 240));

        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&first[..2], &SOI);
        assert_eq!(&first[first.len() - 2..], &EOI);

        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(second.len(), first.len());
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn waits_for_a_complete_frame() {
        let mut codec = mjpeg();
        let frame = fake_jpeg(320, 240);
        let mut buf = BytesMut::new();

        buf.extend_from_slice(&frame[..5]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&frame[5..]);
        assert!(codec.decode(&mut buf).unwrap().is_some());
    }

    #[test]
    fn discards_garbage_before_the_first_marker() {
        let mut codec = mjpeg();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"rtp noise");
        buf.extend_from_slice(&fake_jpeg(16, 16));

        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame[..2], &SOI);
    }

    #[test]
    fn oversized_frames_error_out() {
        let mut codec = FrameCodec::new(FrameFormat::Mjpeg, 8);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&SOI);
        buf.extend_from_slice(&[0u8; 32]);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::FrameTooLarge { max: 8 })
        ));
    }

    #[test]
    fn length_prefixed_frames_round_trip() {
        let mut codec = FrameCodec::new(FrameFormat::LengthPrefixed, 1024);
        let payload = b"frame payload";
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(payload);

        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame[..], payload);
    }
}
