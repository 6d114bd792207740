//! Length-delimited `MsgPack` frame codec.

use std::io;

use bytes::{Bytes, BytesMut};
use skiff_core::{Code, Frame, FrameError, Status};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    TooLarge { size: usize, max: usize },
}

impl CodecError {
    /// True when only the frame being written failed and the stream itself
    /// is still intact, so the connection can carry on.
    #[must_use]
    pub fn is_frame_local(&self) -> bool {
        matches!(self, Self::TooLarge { .. } | Self::Frame(_))
    }

    /// The status reported to the caller whose frame could not be written.
    #[must_use]
    pub fn status(&self) -> Status {
        match self {
            Self::TooLarge { .. } => Status::new(Code::ResourceExhausted, self.to_string()),
            _ => Status::internal(self.to_string()),
        }
    }
}

/// Frames are a 4-byte big-endian length followed by one encoded [`Frame`].
/// Frames above `max_frame` bytes are refused in both directions.
#[derive(Debug)]
pub struct FrameCodec {
    inner: LengthDelimitedCodec,
    max_frame: usize,
}

impl FrameCodec {
    #[must_use]
    pub fn new(max_frame: usize) -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .max_frame_length(max_frame)
                .new_codec(),
            max_frame,
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        match self.inner.decode(src)? {
            Some(bytes) => Ok(Some(Frame::decode(&bytes)?)),
            None => Ok(None),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), CodecError> {
        let bytes = item.encode()?;
        if bytes.len() > self.max_frame {
            return Err(CodecError::TooLarge {
                size: bytes.len(),
                max: self.max_frame,
            });
        }
        self.inner.encode(Bytes::from(bytes), dst)?;
        Ok(())
    }
}
