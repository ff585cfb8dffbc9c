//! Accepted connection stream, plain TCP or TLS.

use pin_project_lite::pin_project;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream as ServerTlsStream;

pin_project! {
    /// The socket handed to a provider. Dropping it closes the connection.
    #[project = NetStreamProj]
    pub enum NetStream {
        Plain { #[pin] stream: TcpStream },
        Tls { #[pin] stream: Box<ServerTlsStream<TcpStream>> },
    }
}

impl NetStream {
    pub fn plain(stream: TcpStream) -> Self {
        NetStream::Plain { stream }
    }

    pub fn tls(stream: ServerTlsStream<TcpStream>) -> Self {
        NetStream::Tls {
            stream: Box::new(stream),
        }
    }

    /// Returns whether this stream is TLS-encrypted.
    pub fn is_tls(&self) -> bool {
        matches!(self, NetStream::Tls { .. })
    }

    /// The underlying TCP socket.
    pub fn tcp(&self) -> &TcpStream {
        match self {
            NetStream::Plain { stream } => stream,
            NetStream::Tls { stream } => stream.get_ref().0,
        }
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.tcp().peer_addr()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.tcp().local_addr()
    }
}

impl AsyncRead for NetStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project() {
            NetStreamProj::Plain { stream } => stream.poll_read(cx, buf),
            NetStreamProj::Tls { stream } => stream.poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for NetStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.project() {
            NetStreamProj::Plain { stream } => stream.poll_write(cx, buf),
            NetStreamProj::Tls { stream } => stream.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            NetStreamProj::Plain { stream } => stream.poll_flush(cx),
            NetStreamProj::Tls { stream } => stream.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            NetStreamProj::Plain { stream } => stream.poll_shutdown(cx),
            NetStreamProj::Tls { stream } => stream.poll_shutdown(cx),
        }
    }
}
