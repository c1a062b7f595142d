//! Newline-delimited JSON framing.
//!
//! - Messages are UTF-8 encoded JSON-RPC
//! - Messages are delimited by newlines
//! - Messages must not contain embedded newlines
//!
//! The reader and writer are generic over any async byte stream so the same
//! framing serves stdin/stdout and in-memory pipes in tests. On stdio,
//! stderr is reserved for logging.

use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Stdin, Stdout};

/// Reads newline-delimited frames.
#[derive(Debug)]
pub struct LineReader<R> {
    reader: R,
    buffer: Vec<u8>,
}

impl<R: AsyncBufRead + Unpin> LineReader<R> {
    /// Wraps a buffered reader.
    pub const fn new(reader: R) -> Self {
        Self {
            reader,
            buffer: Vec::new(),
        }
    }

    /// Reads the next frame without its line terminator.
    ///
    /// Returns `None` at EOF. Invalid UTF-8 is passed through so the
    /// protocol layer can answer it with a parse error.
    ///
    /// # Errors
    ///
    /// Returns an error if reading fails.
    pub async fn read_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        self.buffer.clear();
        let bytes_read = self.reader.read_until(b'\n', &mut self.buffer).await?;

        if bytes_read == 0 {
            return Ok(None);
        }

        if self.buffer.last() == Some(&b'\n') {
            self.buffer.pop();
            if self.buffer.last() == Some(&b'\r') {
                self.buffer.pop();
            }
        }

        Ok(Some(std::mem::take(&mut self.buffer)))
    }
}

impl LineReader<BufReader<Stdin>> {
    /// Reader over the process's stdin.
    #[must_use]
    pub fn stdin() -> Self {
        Self::new(BufReader::new(tokio::io::stdin()))
    }
}

/// Writes newline-delimited frames.
#[derive(Debug)]
pub struct LineWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> LineWriter<W> {
    /// Wraps a writer.
    pub const fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Writes one frame followed by a newline, then flushes.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame contains a newline or writing fails.
    pub async fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        if frame.contains(&b'\n') {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "frame must not contain embedded newlines",
            ));
        }

        self.writer.write_all(frame).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await
    }
}

impl LineWriter<Stdout> {
    /// Writer over the process's stdout.
    #[must_use]
    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }
}
