// TCP connection to the telemetry source
// Frames are newline-delimited JSON text

use std::io;
use std::mem;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::time;

use crate::constants::MAX_FRAME_BYTES;

/// One line off the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Frame bytes without the line ending. Not yet checked for UTF-8.
    Line(Vec<u8>),
    /// A line over the size limit; this many bytes were skipped
    Oversized(usize),
}

/// A single connection to the data source. Read-only: the client never sends.
pub struct Connection {
    reader: BufReader<TcpStream>,
    peer_addr: SocketAddr,
    max_frame: usize,
    /// Bytes of the current line read so far
    pending: Vec<u8>,
    /// Nonzero once the current line went over `max_frame`
    skipped: usize,
}

impl Connection {
    pub fn new(stream: TcpStream, peer_addr: SocketAddr) -> Self {
        Connection {
            reader: BufReader::new(stream),
            peer_addr,
            max_frame: MAX_FRAME_BYTES,
            pending: Vec::new(),
            skipped: 0,
        }
    }

    /// Connect to `addr` (host:port), giving up after `timeout`.
    pub async fn connect(addr: String, timeout: Duration) -> io::Result<Self> {
        let stream = match time::timeout(timeout, TcpStream::connect(&addr)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {} timed out", addr),
                ))
            }
        };
        stream.set_nodelay(true)?;
        let peer_addr = stream.peer_addr()?;
        Ok(Self::new(stream, peer_addr))
    }

    pub fn with_max_frame(mut self, max_frame: usize) -> Self {
        self.max_frame = max_frame.max(1);
        self
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Next frame; None once the peer closes.
    ///
    /// Only socket errors are returned as `Err`. A line that is not text, or
    /// is too long, still comes back as a frame so the caller can drop it and
    /// keep reading. Cancel safe: a partly read line is kept in `self`, so
    /// this can sit in a `select!` next to the render ticker.
    pub async fn next_frame(&mut self) -> io::Result<Option<Frame>> {
        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                if self.skipped == 0 && self.pending.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(self.take_frame()));
            }

            let newline = available.iter().position(|b| *b == b'\n');
            let chunk = &available[..newline.unwrap_or(available.len())];
            if self.skipped > 0 || self.pending.len() + chunk.len() > self.max_frame {
                self.skipped += self.pending.len() + chunk.len();
                self.pending.clear();
            } else {
                self.pending.extend_from_slice(chunk);
            }

            let consumed = match newline {
                Some(i) => i + 1,
                None => chunk.len(),
            };
            self.reader.consume(consumed);

            if newline.is_some() {
                return Ok(Some(self.take_frame()));
            }
        }
    }

    fn take_frame(&mut self) -> Frame {
        if self.skipped > 0 {
            return Frame::Oversized(mem::take(&mut self.skipped));
        }
        let mut line = mem::take(&mut self.pending);
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Frame::Line(line)
    }
}
