//! Newline-delimited JSON framing over any byte stream

use super::message::Message;
use crate::error::{Error, Result};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Outbound queue depth per connection
pub const OUTBOUND_BUFFER: usize = 256;

/// Longest accepted line; longer lines are dropped unparsed
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Reads one message per line, skipping lines that do not parse
pub struct MessageReader<R> {
    reader: BufReader<R>,
    frame: Vec<u8>,
}

enum Frame {
    Complete,
    Oversized,
    Closed,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    /// Wrap the read half of a stream
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            frame: Vec::new(),
        }
    }

    /// Next message, or `None` once the peer closed the stream
    ///
    /// Lines that are not valid JSON messages, including invalid UTF-8 and
    /// lines over [`MAX_FRAME_SIZE`], are logged and skipped.
    pub async fn next(&mut self) -> Result<Option<Message>> {
        loop {
            match self.read_frame().await? {
                Frame::Closed => return Ok(None),
                Frame::Oversized => {
                    tracing::warn!(limit = MAX_FRAME_SIZE, "Ignoring oversized control message");
                }
                Frame::Complete => {
                    if self.frame.iter().all(u8::is_ascii_whitespace) {
                        continue;
                    }
                    match serde_json::from_slice(&self.frame) {
                        Ok(message) => return Ok(Some(message)),
                        Err(e) => {
                            tracing::warn!(error = %e, "Ignoring malformed control message");
                        }
                    }
                }
            }
        }
    }

    async fn read_frame(&mut self) -> Result<Frame> {
        self.frame.clear();
        let mut oversized = false;
        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                return Ok(match (oversized, self.frame.is_empty()) {
                    (true, _) => Frame::Oversized,
                    (false, true) => Frame::Closed,
                    (false, false) => Frame::Complete,
                });
            }

            let (used, done) = match available.iter().position(|b| *b == b'\n') {
                Some(at) => (at + 1, true),
                None => (available.len(), false),
            };
            if !oversized && self.frame.len() + used <= MAX_FRAME_SIZE {
                self.frame.extend_from_slice(&available[..used]);
            } else {
                oversized = true;
                self.frame.clear();
            }
            self.reader.consume(used);

            if done {
                return Ok(if oversized {
                    Frame::Oversized
                } else {
                    Frame::Complete
                });
            }
        }
    }
}

/// Encode a message as one JSON line
pub fn encode(message: &Message) -> Result<Vec<u8>> {
    let mut frame = serde_json::to_vec(message)?;
    frame.push(b'\n');
    Ok(frame)
}

/// Spawn a task that writes queued messages to `writer` in order
///
/// The task ends, shutting the stream down, once every sender is dropped,
/// and fails on the first write error.
pub fn spawn_writer<W>(writer: W) -> (mpsc::Sender<Message>, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_BUFFER);
    let handle = tokio::spawn(async move {
        let mut writer = writer;
        while let Some(message) = rx.recv().await {
            let frame = encode(&message)?;
            writer.write_all(&frame).await.map_err(Error::transport)?;
            writer.flush().await.map_err(Error::transport)?;
        }
        let _ = writer.shutdown().await;
        Ok(())
    });
    (tx, handle)
}
