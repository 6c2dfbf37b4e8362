//! The writing half of the length-prefixed framing.

use std::io;

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::{LEN_TYPE_SIZE, LenType, MAX_FRAME_LEN, Serialize};

/// Writes one length-prefixed frame per message.
pub struct FrameSender<W>
where
    W: AsyncWrite + Unpin,
{
    tx: W,
    head: Vec<u8>,
    bytes_sent: u64,
}

impl<W: AsyncWrite + Unpin> FrameSender<W> {
    pub(super) fn new(tx: W) -> Self {
        Self {
            tx,
            head: Vec::new(),
            bytes_sent: 0,
        }
    }

    /// The amount of bytes written so far, length prefixes included.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// Frames and writes `msg`.
    ///
    /// The length prefix and the owned part of the message are written from an
    /// internal buffer, a borrowed numeric payload straight from its slice.
    ///
    /// # Arguments
    /// * `msg` - A serializable object.
    ///
    /// # Returns
    /// An io error if encoding fails, the frame is larger than the receiving
    /// end accepts or the writer fails.
    pub async fn send<'a, T: Serialize<'a>>(&mut self, msg: &'a T) -> io::Result<()> {
        let Self {
            tx,
            head,
            bytes_sent,
        } = self;

        head.clear();
        head.extend_from_slice(&[0; LEN_TYPE_SIZE]);

        let tail = msg.serialize(head)?.unwrap_or_default();
        let len = head.len() - LEN_TYPE_SIZE + tail.len();
        if len > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("frame of {len} bytes exceeds the {MAX_FRAME_LEN} byte limit"),
            ));
        }

        head[..LEN_TYPE_SIZE].copy_from_slice(&(len as LenType).to_be_bytes());
        tx.write_all(head).await?;
        if !tail.is_empty() {
            tx.write_all(tail).await?;
        }
        tx.flush().await?;

        *bytes_sent += (LEN_TYPE_SIZE + len) as u64;
        Ok(())
    }
}
