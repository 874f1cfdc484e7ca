//! Newline-delimited JSON framing for stream transports.
//!
//! Each frame is one [`SyncMessage`] serialized as a single JSON line.
//! Frames that fail to parse are logged and skipped; they never tear down
//! the connection.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, Lines};

use crate::error::{Result, SyncError};
use crate::messages::SyncMessage;

/// Serialize a message as one frame, including the trailing newline.
pub fn encode_frame(message: &SyncMessage) -> Result<String> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// Parse one frame (with or without its trailing newline).
pub fn decode_frame(line: &str) -> Result<SyncMessage> {
    serde_json::from_str(line.trim_end())
        .map_err(|e| SyncError::MalformedMessage(e.to_string()))
}

/// Reads frames from a buffered reader.
pub struct FrameReader<R> {
    lines: Lines<R>,
    dropped: u64,
}

impl<R: AsyncBufRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            dropped: 0,
        }
    }

    /// Next well-formed message, or `None` at end of stream.
    pub async fn next(&mut self) -> Result<Option<SyncMessage>> {
        while let Some(line) = self.lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            match decode_frame(&line) {
                Ok(message) => return Ok(Some(message)),
                Err(e) => {
                    self.dropped += 1;
                    tracing::warn!(error = %e, "dropping malformed frame");
                }
            }
        }
        Ok(None)
    }

    /// Number of malformed frames skipped so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Writes frames to a writer.
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub async fn send(&mut self, message: &SyncMessage) -> Result<()> {
        let frame = encode_frame(message)?;
        self.writer.write_all(frame.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use covalent_core::{CoId, KnownState};
    use tokio::io::BufReader;

    #[test]
    fn test_frame_is_one_line() {
        let frame = encode_frame(&SyncMessage::Load(KnownState::empty(CoId([1; 32])))).unwrap();
        assert!(frame.ends_with('\n'));
        assert_eq!(frame.matches('\n').count(), 1);
        assert_eq!(
            decode_frame(&frame).unwrap(),
            SyncMessage::Load(KnownState::empty(CoId([1; 32])))
        );
    }

    #[tokio::test]
    async fn test_malformed_frames_are_skipped() {
        let good = encode_frame(&SyncMessage::known(KnownState::empty(CoId([2; 32])))).unwrap();
        let input = format!("{{not json\n\n{}{{\"action\":\"nope\"}}\n", good);
        let mut reader = FrameReader::new(BufReader::new(input.as_bytes()));

        let first = reader.next().await.unwrap().unwrap();
        assert_eq!(first.action(), "known");
        assert!(reader.next().await.unwrap().is_none());
        assert_eq!(reader.dropped(), 2);
    }

    #[tokio::test]
    async fn test_writer_reader_over_duplex() {
        let (a, b) = tokio::io::duplex(1024);
        let mut writer = FrameWriter::new(a);
        let mut reader = FrameReader::new(BufReader::new(b));

        let msg = SyncMessage::Load(KnownState::empty(CoId([9; 32])));
        writer.send(&msg).await.unwrap();
        writer.shutdown().await.unwrap();

        assert_eq!(reader.next().await.unwrap(), Some(msg));
        assert_eq!(reader.next().await.unwrap(), None);
    }
}
