//! Direct line streams
//!
//! A raw, newline-delimited channel to one peer, negotiated with the same
//! `Hello` handshake as overlay connections but under its own protocol id.

use log::{error, info, warn};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use super::{NetworkError, PeerId};

/// Longest line accepted on a direct stream, excluding the newline
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Future returned by a stream handler
pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Handler invoked for every inbound stream of a registered protocol
pub type StreamHandler = Arc<dyn Fn(InboundStream) -> BoxFuture + Send + Sync>;

/// Stream accepted from a remote peer
pub struct InboundStream {
    pub peer_id: PeerId,
    pub reader: BufReader<OwnedReadHalf>,
    pub writer: OwnedWriteHalf,
}

impl InboundStream {
    pub fn new(peer_id: PeerId, socket: TcpStream) -> Self {
        let (reader, writer) = socket.into_split();
        Self {
            peer_id,
            reader: BufReader::new(reader),
            writer,
        }
    }
}

/// Stream opened to a remote peer
pub struct LineStream {
    peer_id: PeerId,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl LineStream {
    pub fn new(peer_id: PeerId, socket: TcpStream) -> Self {
        let (reader, writer) = socket.into_split();
        Self {
            peer_id,
            reader: BufReader::new(reader),
            writer,
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Write one line; a trailing newline is added
    pub async fn write_line(&mut self, line: &str) -> Result<(), NetworkError> {
        self.writer.write_all(line.trim_end_matches('\n').as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Read one line; `None` at end of stream
    pub async fn read_line(&mut self) -> Result<Option<String>, NetworkError> {
        let mut buffer = Vec::new();
        match read_bounded_line(&mut self.reader, &mut buffer).await? {
            Line::Eof => Ok(None),
            Line::TooLong => Err(NetworkError::InvalidFrame(format!(
                "line longer than {MAX_LINE_LEN} bytes"
            ))),
            Line::Read => {
                let line = String::from_utf8(trim_newline(&buffer).to_vec())
                    .map_err(|e| NetworkError::InvalidFrame(e.to_string()))?;
                Ok(Some(line))
            }
        }
    }

    /// Close the write side
    pub async fn close(mut self) -> Result<(), NetworkError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

/// Why a line read loop ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEnd {
    /// Remote closed the stream
    Eof,
    /// Consecutive unreadable lines reached the configured limit
    TooManyErrors(u32),
    /// Transport failure
    Failed(String),
}

enum Line {
    Read,
    TooLong,
    Eof,
}

/// Read up to and including the next newline into `buffer`.
///
/// Past [`MAX_LINE_LEN`] the rest of the line is discarded without
/// buffering it.
async fn read_bounded_line<R>(reader: &mut R, buffer: &mut Vec<u8>) -> io::Result<Line>
where
    R: AsyncBufRead + Unpin,
{
    // Newline plus an optional carriage return
    let limit = (MAX_LINE_LEN + 2) as u64;
    let read = (&mut *reader).take(limit).read_until(b'\n', buffer).await?;
    if read == 0 {
        return Ok(Line::Eof);
    }
    let ended = buffer.last() == Some(&b'\n') || (read as u64) < limit;
    if !ended {
        skip_line(reader).await?;
        return Ok(Line::TooLong);
    }
    if trim_newline(buffer).len() > MAX_LINE_LEN {
        return Ok(Line::TooLong);
    }
    Ok(Line::Read)
}

async fn skip_line<R>(reader: &mut R) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(());
        }
        let (consumed, done) = match available.iter().position(|b| *b == b'\n') {
            Some(i) => (i + 1, true),
            None => (available.len(), false),
        };
        reader.consume(consumed);
        if done {
            return Ok(());
        }
    }
}

fn trim_newline(bytes: &[u8]) -> &[u8] {
    let mut end = bytes.len();
    while end > 0 && matches!(bytes[end - 1], b'\n' | b'\r') {
        end -= 1;
    }
    &bytes[..end]
}

/// Read newline-delimited lines until end of stream.
///
/// A line that is not valid UTF-8, or is longer than [`MAX_LINE_LEN`],
/// is logged and skipped. With `max_errors` set, that many consecutive
/// bad lines end the loop.
pub async fn read_lines<R, F>(reader: &mut R, max_errors: Option<u32>, mut on_line: F) -> StreamEnd
where
    R: AsyncBufRead + Unpin,
    F: FnMut(String),
{
    let mut buffer = Vec::new();
    let mut consecutive = 0u32;

    loop {
        buffer.clear();
        let problem = match read_bounded_line(reader, &mut buffer).await {
            Ok(Line::Eof) => return StreamEnd::Eof,
            Ok(Line::TooLong) => format!("line longer than {MAX_LINE_LEN} bytes"),
            Ok(Line::Read) => match std::str::from_utf8(trim_newline(&buffer)) {
                Ok(line) => {
                    consecutive = 0;
                    on_line(line.to_string());
                    continue;
                }
                Err(e) => e.to_string(),
            },
            Err(e) => return StreamEnd::Failed(e.to_string()),
        };

        consecutive += 1;
        error!(target: "stream", "Unreadable line from stream: {problem}");
        if max_errors.is_some_and(|max| consecutive >= max) {
            return StreamEnd::TooManyErrors(consecutive);
        }
    }
}

/// Default handler: log every received line
pub fn logging_handler(max_errors: Option<u32>) -> StreamHandler {
    Arc::new(move |stream: InboundStream| -> BoxFuture {
        Box::pin(log_lines(stream, max_errors))
    })
}

async fn log_lines(mut stream: InboundStream, max_errors: Option<u32>) {
    let peer = stream.peer_id;
    info!(target: "stream", "Stream opened by {peer}");
    let end = read_lines(&mut stream.reader, max_errors, |line| {
        info!(target: "stream", "{peer}: {line}");
    })
    .await;

    match end {
        StreamEnd::Eof => info!(target: "stream", "Stream from {peer} closed"),
        StreamEnd::TooManyErrors(n) => {
            warn!(target: "stream", "Closing stream from {peer} after {n} unreadable lines")
        }
        StreamEnd::Failed(e) => warn!(target: "stream", "Stream from {peer} failed: {e}"),
    }
    let _ = stream.writer.shutdown().await;
}
