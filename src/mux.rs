//! Single-port connection multiplexer.
//!
//! One TCP listener carries replication, client RPC and HTTP traffic. Each
//! accepted connection is classified by its first bytes: the replication
//! marker, the HTTP/2 client preface (gRPC), or an HTTP/1.x request line.
//! Matching order matters: replication first, then gRPC, then HTTP. Once
//! the marker lane is peeled off, gRPC is the only h2 traffic left on the
//! port. Anything unclassifiable is closed.
//!
//! Sniffed bytes are replayed to the sub-listener through [`MuxStream`];
//! only the replication marker is consumed.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tonic::transport::server::{Connected, TcpConnectInfo};
use tracing::{debug, warn};

use crate::error::Result;

/// Leading byte of every outgoing replication stream.
pub const REPLICATION_MARKER: u8 = 0x01;

const H2_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";
const HTTP1_METHODS: &[&[u8]] = &[
    b"GET ", b"POST ", b"PUT ", b"DELETE ", b"HEAD ", b"OPTIONS ", b"PATCH ",
];

/// Longest prefix classification may need: the h2 preface.
const SNIFF_LIMIT: usize = 24;

const LANE_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Class {
    Replication,
    Rpc,
    Http,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Ready(Class),
    NeedMore,
    Reject,
}

fn classify(buf: &[u8]) -> Decision {
    let Some(first) = buf.first() else {
        return Decision::NeedMore;
    };
    if *first == REPLICATION_MARKER {
        return Decision::Ready(Class::Replication);
    }

    if buf.len() >= H2_PREFACE.len() && buf.starts_with(H2_PREFACE) {
        return Decision::Ready(Class::Rpc);
    }
    if H2_PREFACE.starts_with(buf) {
        return Decision::NeedMore;
    }

    for method in HTTP1_METHODS {
        if buf.starts_with(method) {
            return Decision::Ready(Class::Http);
        }
        if method.starts_with(buf) {
            return Decision::NeedMore;
        }
    }

    Decision::Reject
}

/// A connection accepted by the mux, with its sniffed bytes put back in
/// front of the downstream reader.
pub struct MuxStream {
    prefix: Bytes,
    offset: usize,
    inner: TcpStream,
}

impl MuxStream {
    fn new(prefix: Bytes, inner: TcpStream) -> Self {
        Self {
            prefix,
            offset: 0,
            inner,
        }
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.offset < this.prefix.len() {
            let remaining = &this.prefix[this.offset..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            this.offset += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

impl Connected for MuxStream {
    type ConnectInfo = TcpConnectInfo;

    fn connect_info(&self) -> Self::ConnectInfo {
        self.inner.connect_info()
    }
}

/// Receiving ends of the three traffic lanes.
pub struct MuxLanes {
    pub replication: mpsc::Receiver<MuxStream>,
    pub rpc: mpsc::Receiver<MuxStream>,
    pub http: mpsc::Receiver<MuxStream>,
}

/// The process-wide listener plus the sending ends of the lanes.
pub struct Mux {
    listener: TcpListener,
    replication: mpsc::Sender<MuxStream>,
    rpc: mpsc::Sender<MuxStream>,
    http: mpsc::Sender<MuxStream>,
}

impl Mux {
    pub async fn bind(addr: &str) -> Result<(Mux, MuxLanes)> {
        let listener = TcpListener::bind(addr).await?;
        let (replication_tx, replication_rx) = mpsc::channel(LANE_CAPACITY);
        let (rpc_tx, rpc_rx) = mpsc::channel(LANE_CAPACITY);
        let (http_tx, http_rx) = mpsc::channel(LANE_CAPACITY);

        Ok((
            Mux {
                listener,
                replication: replication_tx,
                rpc: rpc_tx,
                http: http_tx,
            },
            MuxLanes {
                replication: replication_rx,
                rpc: rpc_rx,
                http: http_rx,
            },
        ))
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept loop. Classification runs on a per-connection task, so a
    /// slow sub-listener consumer never stalls accepting.
    pub async fn serve(self) {
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };

            let replication = self.replication.clone();
            let rpc = self.rpc.clone();
            let http = self.http.clone();
            tokio::spawn(async move {
                if let Err(e) = dispatch(stream, replication, rpc, http).await {
                    debug!(peer = %peer, error = %e, "dropping connection");
                }
            });
        }
    }
}

async fn dispatch(
    mut stream: TcpStream,
    replication: mpsc::Sender<MuxStream>,
    rpc: mpsc::Sender<MuxStream>,
    http: mpsc::Sender<MuxStream>,
) -> io::Result<()> {
    let mut sniffed = [0u8; SNIFF_LIMIT];
    let mut len = 0usize;

    let class = loop {
        let read = stream.read(&mut sniffed[len..]).await?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "closed before classification",
            ));
        }
        len += read;

        match classify(&sniffed[..len]) {
            Decision::Ready(class) => break class,
            Decision::NeedMore if len < SNIFF_LIMIT => continue,
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "unrecognized protocol",
                ))
            }
        }
    };

    // the replication marker is consumed; everything else is replayed
    let (lane, prefix) = match class {
        Class::Replication => (replication, Bytes::copy_from_slice(&sniffed[1..len])),
        Class::Rpc => (rpc, Bytes::copy_from_slice(&sniffed[..len])),
        Class::Http => (http, Bytes::copy_from_slice(&sniffed[..len])),
    };

    lane.send(MuxStream::new(prefix, stream))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "sub-listener closed"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn classifies_replication_marker_first() {
        assert_eq!(
            classify(&[REPLICATION_MARKER]),
            Decision::Ready(Class::Replication)
        );
        // even marker-then-h2 bytes stay on the replication lane
        let mut buf = vec![REPLICATION_MARKER];
        buf.extend_from_slice(H2_PREFACE);
        assert_eq!(classify(&buf), Decision::Ready(Class::Replication));
    }

    #[test]
    fn classifies_h2_preface_as_rpc() {
        assert_eq!(classify(&H2_PREFACE[..4]), Decision::NeedMore);
        assert_eq!(classify(H2_PREFACE), Decision::Ready(Class::Rpc));
    }

    #[test]
    fn classifies_http1_methods() {
        assert_eq!(classify(b"GE"), Decision::NeedMore);
        assert_eq!(classify(b"GET /key HTTP/1.1"), Decision::Ready(Class::Http));
        assert_eq!(classify(b"POST /key"), Decision::Ready(Class::Http));
        assert_eq!(classify(b"DELETE /key"), Decision::Ready(Class::Http));
    }

    #[test]
    fn rejects_unknown_protocols() {
        assert_eq!(classify(b"XYZZY"), Decision::Reject);
        assert_eq!(classify(&[0x16, 0x03, 0x01]), Decision::Reject); // TLS hello
    }

    #[tokio::test]
    async fn marked_stream_lands_on_replication_lane_without_marker() {
        let (mux, mut lanes) = Mux::bind("127.0.0.1:0").await.unwrap();
        let addr = mux.local_addr().unwrap();
        tokio::spawn(mux.serve());

        let mut conn = TcpStream::connect(addr).await.unwrap();
        conn.write_all(&[REPLICATION_MARKER, b'h', b'i']).await.unwrap();

        let mut stream = lanes.replication.recv().await.unwrap();
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[tokio::test]
    async fn http_request_line_lands_on_http_lane_intact() {
        let (mux, mut lanes) = Mux::bind("127.0.0.1:0").await.unwrap();
        let addr = mux.local_addr().unwrap();
        tokio::spawn(mux.serve());

        let request = b"GET /testkey HTTP/1.1\r\n\r\n";
        let mut conn = TcpStream::connect(addr).await.unwrap();
        conn.write_all(request).await.unwrap();
        conn.shutdown().await.unwrap();

        let mut stream = lanes.http.recv().await.unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, request);
    }

    #[tokio::test]
    async fn unrecognized_protocol_is_closed() {
        let (mux, _lanes) = Mux::bind("127.0.0.1:0").await.unwrap();
        let addr = mux.local_addr().unwrap();
        tokio::spawn(mux.serve());

        let mut conn = TcpStream::connect(addr).await.unwrap();
        conn.write_all(b"NOPE\r\n").await.unwrap();

        let mut buf = [0u8; 1];
        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }
}
