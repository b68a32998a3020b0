//! Abstract byte transport the connection engine performs I/O through.
//!
//! The engine never touches a socket directly: it reads and writes through
//! these traits, which are the only places it suspends on I/O. Every
//! operation takes an explicit cancellation token that aborts the pending
//! call; cancellation surfaces as an [`io::ErrorKind::Interrupted`] error so
//! the engine can tell it apart from transport failure.
//!
//! Blanket implementations cover anything implementing tokio's `AsyncRead`
//! and `AsyncWrite`, including the halves produced by `tokio::io::split`, so
//! TCP and TLS streams plug in unchanged.

use std::future::Future;
use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

fn interrupted() -> io::Error {
    io::Error::new(io::ErrorKind::Interrupted, "operation cancelled")
}

/// Read half of the transport. `read` returning 0 with a non-empty
/// destination means the peer has half-closed the stream.
pub trait TransportRead: Send {
    fn read<'a>(
        &'a mut self,
        dst: &'a mut [u8],
        cancel: &'a CancellationToken,
    ) -> impl Future<Output = io::Result<usize>> + Send + 'a;
}

/// Write half of the transport.
pub trait TransportWrite: Send {
    fn write<'a>(
        &'a mut self,
        src: &'a [u8],
        cancel: &'a CancellationToken,
    ) -> impl Future<Output = io::Result<()>> + Send + 'a;

    fn flush<'a>(&'a mut self, cancel: &'a CancellationToken) -> impl Future<Output = io::Result<()>> + Send + 'a;

    fn close(&mut self) -> impl Future<Output = io::Result<()>> + Send + '_;
}

impl<T: AsyncRead + Unpin + Send> TransportRead for T {
    fn read<'a>(
        &'a mut self,
        dst: &'a mut [u8],
        cancel: &'a CancellationToken,
    ) -> impl Future<Output = io::Result<usize>> + Send + 'a {
        async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(interrupted()),
                read = AsyncReadExt::read(self, dst) => read,
            }
        }
    }
}

impl<T: AsyncWrite + Unpin + Send> TransportWrite for T {
    fn write<'a>(
        &'a mut self,
        src: &'a [u8],
        cancel: &'a CancellationToken,
    ) -> impl Future<Output = io::Result<()>> + Send + 'a {
        async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(interrupted()),
                written = self.write_all(src) => written,
            }
        }
    }

    fn flush<'a>(&'a mut self, cancel: &'a CancellationToken) -> impl Future<Output = io::Result<()>> + Send + 'a {
        async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(interrupted()),
                flushed = AsyncWriteExt::flush(self) => flushed,
            }
        }
    }

    fn close(&mut self) -> impl Future<Output = io::Result<()>> + Send + '_ {
        self.shutdown()
    }
}
