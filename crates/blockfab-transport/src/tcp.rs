//! Outbound TCP connections with framed request/reply I/O.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use log::{debug, trace};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

use blockfab_proto::header::{REPLY_HEADER_SIZE, REQUEST_HEADER_SIZE};
use blockfab_proto::{
    Command, Payload, ReplyHeader, RequestHeader, SelectImageReply, SelectImageRequest,
    MIN_SUPPORTED_PEER, PROTOCOL_VERSION,
};

use crate::{TransportError, CONNECT_RETRIES, RTT_BLOCK_SIZE};

/// A framed connection to a peer speaking the block protocol.
pub struct BlockConnection {
    stream: TcpStream,
    peer: SocketAddr,
    timeout: Duration,
}

impl BlockConnection {
    /// Connects with at most [`CONNECT_RETRIES`] attempts, TCP_NODELAY, and
    /// the given timeout applied to the connect call and every subsequent
    /// read/write (derive it with [`crate::rtt_timeout`]).
    pub async fn connect(peer: SocketAddr, io_timeout: Duration) -> crate::Result<Self> {
        let mut last_err = std::io::Error::other("no connect attempt made");
        for attempt in 1..=CONNECT_RETRIES {
            match timeout(io_timeout, TcpStream::connect(peer)).await {
                Ok(Ok(stream)) => {
                    stream.set_nodelay(true)?;
                    trace!("connected to {peer} (attempt {attempt})");
                    return Ok(Self {
                        stream,
                        peer,
                        timeout: io_timeout,
                    });
                }
                Ok(Err(e)) => last_err = e,
                Err(_) => last_err = std::io::ErrorKind::TimedOut.into(),
            }
            debug!("connect to {peer} attempt {attempt}/{CONNECT_RETRIES} failed: {last_err}");
        }
        Err(TransportError::ConnectFailed {
            addr: peer,
            attempts: CONNECT_RETRIES,
            source: last_err,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn io_timeout(&self) -> Duration {
        self.timeout
    }

    /// Writes a request header and optional payload as one buffer.
    pub async fn send_request(
        &mut self,
        header: &RequestHeader,
        payload: Option<&[u8]>,
    ) -> crate::Result<()> {
        let mut buf = Vec::with_capacity(REQUEST_HEADER_SIZE + payload.map_or(0, <[u8]>::len));
        header.write_to(&mut buf)?;
        if let Some(payload) = payload {
            buf.extend_from_slice(payload);
        }
        timed(self.timeout, self.stream.write_all(&buf)).await?;
        Ok(())
    }

    /// Reads the next reply header. Fails the connection on a short read or
    /// bad magic; both are protocol violations.
    pub async fn read_reply(&mut self) -> crate::Result<ReplyHeader> {
        let mut raw = [0u8; REPLY_HEADER_SIZE];
        read_all(&mut self.stream, &mut raw, self.timeout).await?;
        Ok(ReplyHeader::read_from(&raw)?)
    }

    /// Reads exactly `buf.len()` payload bytes following a reply header.
    pub async fn read_payload(&mut self, buf: &mut [u8]) -> crate::Result<()> {
        read_all(&mut self.stream, buf, self.timeout).await
    }

    /// Performs the `SELECT_IMAGE` handshake and validates the peer against
    /// the requested identity. `is_server` marks proxy handshakes.
    pub async fn select_image(
        &mut self,
        name: &str,
        rid: u16,
        is_server: bool,
    ) -> crate::Result<SelectImageReply> {
        let request = SelectImageRequest {
            protocol_version: PROTOCOL_VERSION,
            name: name.to_string(),
            rid,
            is_server,
        };
        let payload = request.serialize()?;
        let header =
            RequestHeader::with_payload(Command::SelectImage, 0, payload.len() as u32);
        self.send_request(&header, Some(payload.as_bytes())).await?;

        let reply = self.read_reply().await?;
        if reply.command != Command::SelectImage {
            return Err(TransportError::protocol(format!(
                "handshake answered with {}",
                reply.command
            )));
        }
        if reply.size < 4 || reply.size as usize > blockfab_proto::serializer::PAYLOAD_CAPACITY {
            return Err(TransportError::protocol("implausible handshake payload size"));
        }
        let mut raw = vec![0u8; reply.size as usize];
        self.read_payload(&mut raw).await?;
        let reply = SelectImageReply::deserialize(&mut Payload::from_bytes(raw))?;

        if reply.protocol_version < MIN_SUPPORTED_PEER {
            return Err(TransportError::PeerTooOld {
                got: reply.protocol_version,
                min: MIN_SUPPORTED_PEER,
            });
        }
        if reply.name != name || (rid != 0 && reply.rid != rid) {
            return Err(TransportError::ImageMismatch {
                expected: format!("{name}:{rid}"),
                got: format!("{}:{}", reply.name, reply.rid),
            });
        }
        Ok(reply)
    }

    /// Issues the fixed-offset test read and returns the wall-clock RTT in
    /// microseconds. The payload is drained and discarded.
    pub async fn measure_rtt(&mut self) -> crate::Result<u64> {
        let started = Instant::now();
        let header = RequestHeader::get_block(0, 0, RTT_BLOCK_SIZE);
        self.send_request(&header, None).await?;
        let reply = self.read_reply().await?;
        if reply.command != Command::GetBlock || reply.size != RTT_BLOCK_SIZE {
            return Err(TransportError::protocol("unexpected test block reply"));
        }
        let mut sink = vec![0u8; RTT_BLOCK_SIZE as usize];
        self.read_payload(&mut sink).await?;
        Ok(started.elapsed().as_micros() as u64)
    }

    /// Splits into independently owned read/write halves so a receiver task
    /// can run beside the sender.
    pub fn into_split(self) -> (ConnReader, ConnWriter) {
        let (rx, tx) = self.stream.into_split();
        (
            ConnReader {
                half: rx,
                peer: self.peer,
            },
            ConnWriter {
                half: tx,
                peer: self.peer,
                timeout: self.timeout,
            },
        )
    }
}

/// Read half of a split [`BlockConnection`].
pub struct ConnReader {
    half: OwnedReadHalf,
    peer: SocketAddr,
}

impl ConnReader {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Waits up to `idle_timeout` for the next reply header. The long wait
    /// is the keepalive window, not a per-byte timeout.
    pub async fn read_reply(&mut self, idle_timeout: Duration) -> crate::Result<ReplyHeader> {
        let mut raw = [0u8; REPLY_HEADER_SIZE];
        read_all(&mut self.half, &mut raw, idle_timeout).await?;
        Ok(ReplyHeader::read_from(&raw)?)
    }

    pub async fn read_payload(&mut self, buf: &mut [u8], timeout: Duration) -> crate::Result<()> {
        read_all(&mut self.half, buf, timeout).await
    }
}

/// Write half of a split [`BlockConnection`].
pub struct ConnWriter {
    half: OwnedWriteHalf,
    peer: SocketAddr,
    timeout: Duration,
}

impl ConnWriter {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub async fn send_request(
        &mut self,
        header: &RequestHeader,
        payload: Option<&[u8]>,
    ) -> crate::Result<()> {
        let mut buf = Vec::with_capacity(REQUEST_HEADER_SIZE + payload.map_or(0, <[u8]>::len));
        header.write_to(&mut buf)?;
        if let Some(payload) = payload {
            buf.extend_from_slice(payload);
        }
        timed(self.timeout, self.half.write_all(&buf)).await?;
        Ok(())
    }
}

async fn timed<T>(
    limit: Duration,
    fut: impl std::future::Future<Output = std::io::Result<T>>,
) -> crate::Result<T> {
    match timeout(limit, fut).await {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(TransportError::Timeout(limit)),
    }
}

async fn read_all<S: AsyncReadExt + Unpin>(
    stream: &mut S,
    buf: &mut [u8],
    limit: Duration,
) -> crate::Result<()> {
    match timeout(limit, stream.read_exact(buf)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(TransportError::ConnectionClosed)
        }
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(TransportError::Timeout(limit)),
    }
}
