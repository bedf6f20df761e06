//! Socket and listener enums over the supported transports.
//!
//! The public API is the [`Listener`] / [`Socket`] pair; each variant wraps
//! the corresponding tokio type and calls are delegated per variant. A new
//! endpoint kind (the spec's legacy message-bus binding, say) would be one
//! more variant here and nowhere else.

use std::io;

use tokio::net::{tcp, unix, TcpListener, TcpStream, UnixListener, UnixStream};

use crate::{read_frame, write_frame, EndpointSpec, Frame, TransportError};

/// A bound, listening endpoint.
#[derive(Debug)]
pub enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl Listener {
    /// Bind a listening socket for the given endpoint.
    pub async fn bind(spec: &EndpointSpec) -> io::Result<Self> {
        match spec {
            EndpointSpec::Tcp(addr) => Ok(Self::Tcp(TcpListener::bind(addr.as_str()).await?)),
            EndpointSpec::Unix(path) => Ok(Self::Unix(UnixListener::bind(path)?)),
        }
    }

    /// Accept one pending connection.
    pub async fn accept(&self) -> io::Result<Socket> {
        match self {
            Self::Tcp(l) => {
                let (stream, _) = l.accept().await?;
                Ok(Socket::Tcp(stream))
            }
            Self::Unix(l) => {
                let (stream, _) = l.accept().await?;
                Ok(Socket::Unix(stream))
            }
        }
    }
}

/// A connected socket, either side.
#[derive(Debug)]
pub enum Socket {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Socket {
    /// Open a client connection to the given endpoint.
    pub async fn connect(spec: &EndpointSpec) -> io::Result<Self> {
        match spec {
            EndpointSpec::Tcp(addr) => Ok(Self::Tcp(TcpStream::connect(addr.as_str()).await?)),
            EndpointSpec::Unix(path) => Ok(Self::Unix(UnixStream::connect(path).await?)),
        }
    }

    /// Split into owned read and write halves for full-duplex use.
    pub fn into_split(self) -> (ReadSocket, WriteSocket) {
        match self {
            Self::Tcp(stream) => {
                let (r, w) = stream.into_split();
                (ReadSocket::Tcp(r), WriteSocket::Tcp(w))
            }
            Self::Unix(stream) => {
                let (r, w) = stream.into_split();
                (ReadSocket::Unix(r), WriteSocket::Unix(w))
            }
        }
    }
}

/// Owned read half of a [`Socket`].
#[derive(Debug)]
pub enum ReadSocket {
    Tcp(tcp::OwnedReadHalf),
    Unix(unix::OwnedReadHalf),
}

impl ReadSocket {
    /// Read one complete frame.
    pub async fn recv(&mut self) -> Result<Frame, TransportError> {
        match self {
            Self::Tcp(r) => read_frame(r).await,
            Self::Unix(r) => read_frame(r).await,
        }
    }
}

/// Owned write half of a [`Socket`].
#[derive(Debug)]
pub enum WriteSocket {
    Tcp(tcp::OwnedWriteHalf),
    Unix(unix::OwnedWriteHalf),
}

impl WriteSocket {
    /// Write one frame and flush it.
    pub async fn send(&mut self, frame: &Frame) -> Result<(), TransportError> {
        match self {
            Self::Tcp(w) => write_frame(w, frame).await,
            Self::Unix(w) => write_frame(w, frame).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn unix_listener_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let spec = EndpointSpec::Unix(dir.path().join("net.sock"));

        let listener = Listener::bind(&spec).await.unwrap();
        let client = Socket::connect(&spec).await.unwrap();
        let server = listener.accept().await.unwrap();

        let (_cr, mut cw) = client.into_split();
        let (mut sr, _sw) = server.into_split();

        let frame = Frame::SignalEmit {
            handler_id: 5,
            args: Bytes::from_static(b"tick"),
        };
        cw.send(&frame).await.unwrap();
        assert_eq!(sr.recv().await.unwrap(), frame);
    }

    #[tokio::test]
    async fn tcp_listener_round_trip() {
        let listener = Listener::bind(&EndpointSpec::Tcp("127.0.0.1:0".into()))
            .await
            .unwrap();
        let addr = match &listener {
            Listener::Tcp(l) => l.local_addr().unwrap(),
            _ => unreachable!(),
        };

        let client = Socket::connect(&EndpointSpec::Tcp(addr.to_string()))
            .await
            .unwrap();
        let server = listener.accept().await.unwrap();

        let (_cr, mut cw) = client.into_split();
        let (mut sr, _sw) = server.into_split();

        let frame = Frame::SignalUnregister { handler_id: 99 };
        cw.send(&frame).await.unwrap();
        assert_eq!(sr.recv().await.unwrap(), frame);
    }
}
