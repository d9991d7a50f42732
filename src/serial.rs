//! Serial plumbing shared by the GPS and modem links.
//!
//! Serial delivery is not line-atomic: a read may return half a sentence or
//! several at once. [`LineBuffer`] reassembles complete lines across reads.
//! Line settings (baud rate, raw mode) of the tty devices are configured by
//! the OS before the tracker starts.

use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{TrackerError, TrackerResult};

/// Accumulates bytes and yields complete CR/LF terminated lines.
#[derive(Debug)]
pub struct LineBuffer {
    buf: Vec<u8>,
    max_line: usize,
    /// Dropping the tail of an overlong line until its terminator arrives.
    discarding: bool,
}

impl LineBuffer {
    pub fn new(max_line: usize) -> Self {
        Self {
            buf: Vec::with_capacity(max_line),
            max_line,
            discarding: false,
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
        if !self.buf.contains(&b'\n') && self.buf.len() > self.max_line {
            self.buf.clear();
            self.discarding = true;
        }
    }

    /// Next complete line without its terminator, skipping empty lines.
    pub fn next_line(&mut self) -> Option<String> {
        loop {
            let pos = self.buf.iter().position(|&b| b == b'\n')?;
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();

            if self.discarding {
                self.discarding = false;
                continue;
            }
            if raw.len() > self.max_line + 2 {
                continue;
            }

            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_matches(|c| c == '\r' || c == '\n' || c == '\0');
            if !line.trim().is_empty() {
                return Some(line.to_string());
            }
        }
    }

    /// Consume everything up to and including `marker` if it is buffered.
    ///
    /// The SMS prompt `> ` is not followed by a line terminator, so it has to
    /// be found in the raw buffer.
    pub fn take_through(&mut self, marker: u8) -> bool {
        match self.buf.iter().position(|&b| b == marker) {
            Some(pos) => {
                self.buf.drain(..=pos);
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.discarding = false;
    }
}

/// Open a serial device for reading and writing.
pub async fn open_device(path: &Path) -> std::io::Result<tokio::fs::File> {
    tokio::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .await
}

/// Read one chunk, failing if nothing arrives in time.
///
/// Returns `Ok(0)` on end of stream.
pub async fn read_chunk<R>(reader: &mut R, buf: &mut [u8], timeout: Duration) -> TrackerResult<usize>
where
    R: AsyncRead + Unpin,
{
    match tokio::time::timeout(timeout, reader.read(buf)).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(TrackerError::SerialTimeout("serial data".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reassembles_split_lines() {
        let mut lines = LineBuffer::new(82);
        lines.extend(b"$GPGGA,1234");
        assert_eq!(lines.next_line(), None);

        lines.extend(b"56*00\r\n$GPR");
        assert_eq!(lines.next_line().as_deref(), Some("$GPGGA,123456*00"));
        assert_eq!(lines.next_line(), None);

        lines.extend(b"MC\r\n\r\n");
        assert_eq!(lines.next_line().as_deref(), Some("$GPRMC"));
        assert_eq!(lines.next_line(), None);
    }

    #[test]
    fn test_discards_overlong_line() {
        let mut lines = LineBuffer::new(16);
        lines.extend(&[b'x'; 40]);
        lines.extend(b"tail\r\nOK\r\n");
        assert_eq!(lines.next_line().as_deref(), Some("OK"));
    }

    #[test]
    fn test_take_through_prompt() {
        let mut lines = LineBuffer::new(82);
        lines.extend(b"\r\n> ");
        assert!(!lines.take_through(b'#'));
        assert!(lines.take_through(b'>'));
        lines.extend(b"\r\n+CMGS: 4\r\n");
        assert_eq!(lines.next_line().as_deref(), Some("+CMGS: 4"));
    }

    #[tokio::test]
    async fn test_read_chunk_times_out() {
        let (_tx, mut rx) = tokio::io::duplex(64);
        let mut buf = [0u8; 8];
        let result = read_chunk(&mut rx, &mut buf, Duration::from_millis(10)).await;
        assert!(matches!(result, Err(TrackerError::SerialTimeout(_))));
    }
}
