//! Buffered, poll-based message framing over a [`Socket`].
use std::{
    io,
    task::{Context, Poll},
};

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::{
    net::Socket,
    postgres::{FrontendProtocol, frontend},
};

const DEFAULT_BUF_CAPACITY: usize = 8 * 1024;

/// Message header size: 1 byte tag + 4 byte length (length includes itself).
const HEADER_LEN: usize = 1 + 4;

/// A buffered, length-prefixed-message framed stream.
///
/// Does not interpret message content; [`PgStream::poll_recv_raw`] hands back
/// a `(msgtype, body)` pair for the caller to dispatch.
pub struct PgStream {
    socket: Socket,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

impl PgStream {
    pub fn new(socket: Socket) -> Self {
        Self {
            socket,
            read_buf: BytesMut::with_capacity(DEFAULT_BUF_CAPACITY),
            write_buf: BytesMut::with_capacity(DEFAULT_BUF_CAPACITY),
        }
    }

    pub fn socket_mut(&mut self) -> &mut Socket {
        &mut self.socket
    }

    /// Replace the underlying socket, e.g. after installing TLS.
    pub fn set_socket(&mut self, socket: Socket) {
        self.socket = socket;
    }

    /// Decompose into the raw socket and buffers, e.g. to install TLS around
    /// the socket while keeping any buffered bytes.
    pub(crate) fn into_parts(self) -> (Socket, BytesMut, BytesMut) {
        (self.socket, self.read_buf, self.write_buf)
    }

    pub(crate) fn from_parts(socket: Socket, read_buf: BytesMut, write_buf: BytesMut) -> Self {
        Self { socket, read_buf, write_buf }
    }

    pub fn send<F: FrontendProtocol>(&mut self, message: F) {
        frontend::write(message, &mut self.write_buf);
    }

    pub fn send_startup(&mut self, startup: crate::postgres::frontend::Startup) {
        startup.write(&mut self.write_buf);
    }

    pub fn send_ssl_request(&mut self) {
        crate::postgres::frontend::SSLRequest::write(&mut self.write_buf);
    }

    /// Write-through a single byte header response check: read the single-byte
    /// SSL negotiation reply (`'S'` or `'N'`), not length-prefixed.
    pub fn poll_recv_ssl_reply(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<u8>> {
        loop {
            if let Some(b) = self.read_buf.first().copied() {
                self.read_buf.advance(1);
                return Poll::Ready(Ok(b));
            }
            match self.poll_fill_buf(cx) {
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "server closed the connection during SSL negotiation",
                    )));
                }
                Poll::Ready(Ok(_)) => continue,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
    }

    pub fn poll_flush(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        use std::pin::Pin;

        while !self.write_buf.is_empty() {
            let n = std::task::ready!(Pin::new(&mut self.socket).poll_write(cx, &self.write_buf))?;
            if n == 0 {
                return Poll::Ready(Err(io::Error::new(io::ErrorKind::WriteZero, "failed to write to socket")));
            }
            self.write_buf.advance(n);
        }

        std::task::ready!(Pin::new(&mut self.socket).poll_flush(cx))?;
        Poll::Ready(Ok(()))
    }

    fn poll_fill_buf(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<usize>> {
        use std::pin::Pin;

        self.read_buf.reserve(DEFAULT_BUF_CAPACITY);
        let mut read_buf = ReadBuf::uninit(self.read_buf.spare_capacity_mut());
        std::task::ready!(Pin::new(&mut self.socket).poll_read(cx, &mut read_buf))?;
        let n = read_buf.filled().len();
        // SAFETY: `poll_read` only reports `n` bytes filled, which `ReadBuf` guarantees are initialized.
        unsafe { self.read_buf.set_len(self.read_buf.len() + n) };
        Poll::Ready(Ok(n))
    }

    /// Read one full message frame: tag byte, then `body`, the length-prefixed
    /// payload with the 4-byte length itself stripped.
    pub fn poll_recv_raw(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<(u8, Bytes)>> {
        loop {
            if self.read_buf.len() >= HEADER_LEN {
                let tag = self.read_buf[0];
                let len = i32::from_be_bytes(self.read_buf[1..5].try_into().unwrap()) as usize;
                if self.read_buf.len() >= HEADER_LEN + (len - 4) {
                    self.read_buf.advance(HEADER_LEN);
                    let body = self.read_buf.split_to(len - 4).freeze();
                    return Poll::Ready(Ok((tag, body)));
                }
            }

            if std::task::ready!(self.poll_fill_buf(cx))? == 0 {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "server closed the connection",
                )));
            }
        }
    }
}
