use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use super::ProtocolError;

/// Largest frame either side accepts. Bigger length prefixes fail the read.
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

pub fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .little_endian()
        .length_field_length(4)
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

/// A length-prefixed string channel over any byte stream.
#[derive(Debug)]
pub struct FrameStream<S> {
    inner: Framed<S, LengthDelimitedCodec>,
}

impl<S> FrameStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(io: S) -> Self {
        Self {
            inner: Framed::new(io, frame_codec()),
        }
    }

    pub async fn send(&mut self, text: &str) -> Result<(), ProtocolError> {
        self.inner
            .send(Bytes::copy_from_slice(text.as_bytes()))
            .await?;
        Ok(())
    }

    /// Next frame as text, or `None` once the peer has closed the stream.
    pub async fn recv(&mut self) -> Result<Option<String>, ProtocolError> {
        let Some(frame) = self.inner.next().await else {
            return Ok(None);
        };
        let frame = frame?;
        String::from_utf8(frame.to_vec())
            .map(Some)
            .map_err(|_| ProtocolError::Malformed("frame is not valid UTF-8".to_string()))
    }

    /// Like [`recv`](Self::recv) but a closed stream is an error.
    pub async fn expect(&mut self) -> Result<String, ProtocolError> {
        self.recv().await?.ok_or(ProtocolError::Closed)
    }

    pub async fn close(&mut self) -> Result<(), ProtocolError> {
        SinkExt::<Bytes>::close(&mut self.inner).await?;
        Ok(())
    }

    pub fn into_inner(self) -> S {
        self.inner.into_inner()
    }
}
