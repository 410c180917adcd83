use std::{
    net::SocketAddr,
    sync::atomic::{AtomicBool, Ordering},
};

use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    net::TcpStream,
    sync::Mutex,
};
use tracing::debug;

use crate::{
    error::{Error, Result},
    frame::{Frame, read_frame, write_frame},
};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A framed, full-duplex byte stream shared between tasks.
///
/// Reads and writes have separate locks: one task can sit in [`receive`]
/// while any number of others call [`send`]. Each `send` writes a whole frame
/// before the write lock is released, so frames never interleave.
///
/// [`receive`]: Connection::receive
/// [`send`]: Connection::send
pub struct Connection {
    reader: Mutex<BufReader<BoxedReader>>,
    writer: Mutex<BoxedWriter>,
    closed: AtomicBool,
    peer: Option<SocketAddr>,
}

impl Connection {
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Mutex::new(BufReader::new(Box::new(reader))),
            writer: Mutex::new(Box::new(writer)),
            closed: AtomicBool::new(false),
            peer: None,
        }
    }

    pub fn from_stream(stream: TcpStream) -> Self {
        let peer = stream.peer_addr().ok();
        let (reader, writer) = stream.into_split();
        Self {
            peer,
            ..Self::new(reader, writer)
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub async fn send(&self, frame: &Frame) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, frame).await
    }

    /// Waits for the next frame. A clean end of stream is reported as
    /// [`Error::ConnectionClosed`].
    pub async fn receive(&self) -> Result<Frame> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        let mut reader = self.reader.lock().await;
        read_frame(&mut *reader)
            .await?
            .ok_or(Error::ConnectionClosed)
    }

    /// Shuts down the write side. Calling it again is a no-op.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut writer = self.writer.lock().await;
        match writer.shutdown().await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotConnected => {
                debug!(peer = ?self.peer, "connection already disconnected at close");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}
