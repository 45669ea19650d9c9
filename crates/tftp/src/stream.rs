//! Byte sinks and sources a transfer reads from or writes to.

use std::fmt;
use std::io;
use std::path::Path;

use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Path that selects the process's standard streams
pub const STDIO_SENTINEL: &str = "-";

/// Where downloaded (or uploaded-to-server) bytes go
pub enum Sink {
    /// Process standard output
    Stdout,
    Writer(Box<dyn AsyncWrite + Send + Unpin>),
}

impl Sink {
    pub fn writer<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::Writer(Box::new(writer))
    }

    /// Create (or truncate) a file, or select stdout for `"-"`
    pub async fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        if path.as_os_str() == STDIO_SENTINEL {
            return Ok(Self::Stdout);
        }
        Ok(Self::writer(File::create(path).await?))
    }

    fn into_writer(self) -> Box<dyn AsyncWrite + Send + Unpin> {
        match self {
            Self::Stdout => Box::new(tokio::io::stdout()),
            Self::Writer(writer) => writer,
        }
    }
}

impl fmt::Debug for Sink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdout => f.write_str("Sink::Stdout"),
            Self::Writer(_) => f.write_str("Sink::Writer(..)"),
        }
    }
}

/// Where uploaded (or served) bytes come from
pub enum Source {
    /// Process standard input
    Stdin,
    Reader(Box<dyn AsyncRead + Send + Unpin>),
}

impl Source {
    pub fn reader<R>(reader: R) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self::Reader(Box::new(reader))
    }

    /// In-memory content, as produced by a [`FileResolver`]
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self::reader(io::Cursor::new(bytes.into()))
    }

    /// Open a file for reading, or select stdin for `"-"`
    pub async fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        if path.as_os_str() == STDIO_SENTINEL {
            return Ok(Self::Stdin);
        }
        Ok(Self::reader(File::open(path).await?))
    }

    fn into_reader(self) -> Box<dyn AsyncRead + Send + Unpin> {
        match self {
            Self::Stdin => Box::new(tokio::io::stdin()),
            Self::Reader(reader) => reader,
        }
    }
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdin => f.write_str("Source::Stdin"),
            Self::Reader(_) => f.write_str("Source::Reader(..)"),
        }
    }
}

/// Synthesizes content for files that do not exist under the server root
///
/// Any `Fn(&str) -> Option<Source>` closure is a resolver.
pub trait FileResolver: Send + Sync {
    fn resolve(&self, filename: &str) -> Option<Source>;
}

impl<F> FileResolver for F
where
    F: Fn(&str) -> Option<Source> + Send + Sync,
{
    fn resolve(&self, filename: &str) -> Option<Source> {
        self(filename)
    }
}

/// The stream a transfer context owns
pub(crate) enum TransferStream {
    /// Nothing opened yet (server before the request is handled)
    Closed,
    Writing(Box<dyn AsyncWrite + Send + Unpin>),
    Reading(Box<dyn AsyncRead + Send + Unpin>),
}

impl TransferStream {
    pub(crate) fn sink(sink: Sink) -> Self {
        Self::Writing(sink.into_writer())
    }

    pub(crate) fn source(source: Source) -> Self {
        Self::Reading(source.into_reader())
    }

    pub(crate) async fn write_block(&mut self, payload: &[u8]) -> io::Result<()> {
        match self {
            Self::Writing(writer) => writer.write_all(payload).await,
            _ => Err(io::Error::other("transfer stream is not open for writing")),
        }
    }

    /// Read up to `size` bytes; fewer only at end of input
    pub(crate) async fn read_block(&mut self, size: usize) -> io::Result<Vec<u8>> {
        match self {
            Self::Reading(reader) => {
                let mut block = Vec::with_capacity(size);
                (&mut **reader).take(size as u64).read_to_end(&mut block).await?;
                Ok(block)
            }
            _ => Err(io::Error::other("transfer stream is not open for reading")),
        }
    }

    /// Flush pending writes and release the stream
    pub(crate) async fn close(&mut self) -> io::Result<()> {
        let stream = std::mem::replace(self, Self::Closed);
        if let Self::Writing(mut writer) = stream {
            writer.flush().await?;
            writer.shutdown().await?;
        }
        Ok(())
    }
}
