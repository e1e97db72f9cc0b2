//! # Stream Transport
//!
//! Endpoints are `tcp://host:port` or `ipc:///path` strings (`inproc://`
//! names exist only through `connect_inproc` and never touch this module's
//! sockets). Every connection carries length-prefixed frame records; curve
//! connections additionally encrypt each record through the session cipher
//! established in [`crate::noise`].

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

use crate::error::Error;
use crate::frame::{self, Frame, MAX_FRAME_SIZE};
use crate::identity::Identity;
use crate::noise::{SessionCipher, MAX_SEGMENT};

/// A remote endpoint to dial: the URL plus, for curve endpoints, the
/// listener's long-term pubkey.
#[derive(Clone, Debug)]
pub struct Address {
    pub url: String,
    pub pubkey: Option<Identity>,
}

impl Address {
    /// A plain-text endpoint; the connection is anonymous and unencrypted.
    pub fn plain(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            pubkey: None,
        }
    }

    /// A curve endpoint; dialing verifies the listener against `pubkey`.
    pub fn curve(url: impl Into<String>, pubkey: Identity) -> Self {
        Self {
            url: url.into(),
            pubkey: Some(pubkey),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Endpoint {
    Tcp(String),
    Ipc(PathBuf),
    Inproc(String),
}

pub(crate) fn parse_endpoint(addr: &str) -> Result<Endpoint, Error> {
    if let Some(rest) = addr.strip_prefix("tcp://") {
        if rest.is_empty() {
            return Err(Error::BadEndpoint(addr.to_string()));
        }
        return Ok(Endpoint::Tcp(rest.to_string()));
    }
    if let Some(rest) = addr.strip_prefix("ipc://") {
        if rest.is_empty() {
            return Err(Error::BadEndpoint(addr.to_string()));
        }
        return Ok(Endpoint::Ipc(PathBuf::from(rest)));
    }
    if let Some(rest) = addr.strip_prefix("inproc://") {
        if rest.is_empty() {
            return Err(Error::BadEndpoint(addr.to_string()));
        }
        return Ok(Endpoint::Inproc(rest.to_string()));
    }
    Err(Error::BadEndpoint(addr.to_string()))
}

// ============================================================================
// Sockets
// ============================================================================

pub(crate) trait StreamIo: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send {}
impl<T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send> StreamIo for T {}

pub(crate) type BoxedStream = Box<dyn StreamIo>;

pub(crate) enum ListenerSocket {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

impl ListenerSocket {
    pub async fn bind(endpoint: &Endpoint) -> Result<Self> {
        match endpoint {
            Endpoint::Tcp(hostport) => {
                let listener = TcpListener::bind(hostport)
                    .await
                    .with_context(|| format!("failed to bind tcp://{hostport}"))?;
                Ok(ListenerSocket::Tcp(listener))
            }
            Endpoint::Ipc(path) => {
                #[cfg(unix)]
                {
                    // A dead socket file from an earlier run would fail the
                    // bind; only a live listener should.
                    if path.exists() && UnixStream::connect(path).await.is_err() {
                        let _ = std::fs::remove_file(path);
                    }
                    let listener = UnixListener::bind(path)
                        .with_context(|| format!("failed to bind ipc://{}", path.display()))?;
                    Ok(ListenerSocket::Unix(listener))
                }
                #[cfg(not(unix))]
                {
                    bail!("ipc:// endpoints require unix sockets")
                }
            }
            Endpoint::Inproc(name) => bail!("cannot bind in-process endpoint inproc://{name}"),
        }
    }

    /// Accept one connection, returning the stream and the peer IP (empty
    /// for unix-socket peers).
    pub async fn accept(&self) -> Result<(BoxedStream, String)> {
        match self {
            ListenerSocket::Tcp(listener) => {
                let (stream, addr) = listener.accept().await.context("tcp accept failed")?;
                stream.set_nodelay(true).ok();
                Ok((Box::new(stream), addr.ip().to_string()))
            }
            #[cfg(unix)]
            ListenerSocket::Unix(listener) => {
                let (stream, _) = listener.accept().await.context("unix accept failed")?;
                Ok((Box::new(stream), String::new()))
            }
        }
    }
}

pub(crate) async fn dial(endpoint: &Endpoint) -> Result<BoxedStream> {
    match endpoint {
        Endpoint::Tcp(hostport) => {
            let stream = TcpStream::connect(hostport)
                .await
                .with_context(|| format!("failed to connect to tcp://{hostport}"))?;
            stream.set_nodelay(true).ok();
            Ok(Box::new(stream))
        }
        Endpoint::Ipc(path) => {
            #[cfg(unix)]
            {
                let stream = UnixStream::connect(path)
                    .await
                    .with_context(|| format!("failed to connect to ipc://{}", path.display()))?;
                Ok(Box::new(stream))
            }
            #[cfg(not(unix))]
            {
                bail!("ipc:// endpoints require unix sockets")
            }
        }
        Endpoint::Inproc(name) => bail!("cannot dial in-process endpoint inproc://{name}"),
    }
}

// ============================================================================
// Framed IO
// ============================================================================

/// Split a connected (and, for curve, handshaken) stream into framed halves.
pub(crate) fn framed(
    stream: BoxedStream,
    cipher: Option<Arc<SessionCipher>>,
) -> (FrameReader, FrameWriter) {
    let (read, write) = tokio::io::split(stream);
    (
        FrameReader {
            io: read,
            cipher: cipher.clone(),
            buf: Vec::new(),
        },
        FrameWriter { io: write, cipher },
    )
}

pub(crate) struct FrameReader {
    io: ReadHalf<BoxedStream>,
    cipher: Option<Arc<SessionCipher>>,
    /// Decrypted bytes not yet consumed; an encrypted segment may span
    /// record boundaries.
    buf: Vec<u8>,
}

impl FrameReader {
    async fn fill(&mut self, need: usize) -> Result<()> {
        match &self.cipher {
            None => {
                let have = self.buf.len();
                if have < need {
                    self.buf.resize(need, 0);
                    self.io.read_exact(&mut self.buf[have..]).await?;
                }
            }
            Some(cipher) => {
                while self.buf.len() < need {
                    let mut len_buf = [0u8; 2];
                    self.io.read_exact(&mut len_buf).await?;
                    let seg_len = u16::from_be_bytes(len_buf) as usize;
                    let mut ciphertext = vec![0u8; seg_len];
                    self.io.read_exact(&mut ciphertext).await?;
                    let plaintext = cipher.decrypt(&ciphertext)?;
                    self.buf.extend_from_slice(&plaintext);
                }
            }
        }
        Ok(())
    }

    /// Read one complete frame. Any error, including a peer exceeding the
    /// frame limits, is terminal for the connection.
    pub async fn read_frame(&mut self) -> Result<Frame> {
        self.fill(4).await?;
        let len = u32::from_be_bytes(self.buf[..4].try_into().expect("4 bytes")) as usize;
        if len > MAX_FRAME_SIZE {
            bail!("peer announced oversized frame of {len} bytes");
        }
        self.fill(4 + len).await?;
        let parts = frame::decode(&self.buf[4..4 + len])?;
        self.buf.drain(..4 + len);
        Ok(parts)
    }
}

pub(crate) struct FrameWriter {
    io: WriteHalf<BoxedStream>,
    cipher: Option<Arc<SessionCipher>>,
}

impl FrameWriter {
    pub async fn write_frame(&mut self, parts: &Frame) -> Result<()> {
        let payload = frame::encode(parts)?;
        let mut record = Vec::with_capacity(4 + payload.len());
        record.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        record.extend_from_slice(&payload);

        match &self.cipher {
            None => self.io.write_all(&record).await?,
            Some(cipher) => {
                for chunk in record.chunks(MAX_SEGMENT) {
                    let ciphertext = cipher.encrypt(chunk)?;
                    let seg_len = ciphertext.len() as u16;
                    self.io.write_all(&seg_len.to_be_bytes()).await?;
                    self.io.write_all(&ciphertext).await?;
                }
            }
        }
        self.io.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) {
        let _ = self.io.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;
    use crate::noise;

    #[test]
    fn endpoint_parsing() {
        assert_eq!(
            parse_endpoint("tcp://127.0.0.1:7777").unwrap(),
            Endpoint::Tcp("127.0.0.1:7777".to_string())
        );
        assert_eq!(
            parse_endpoint("ipc:///tmp/x.sock").unwrap(),
            Endpoint::Ipc(PathBuf::from("/tmp/x.sock"))
        );
        assert_eq!(
            parse_endpoint("inproc://control").unwrap(),
            Endpoint::Inproc("control".to_string())
        );
        assert!(parse_endpoint("udp://1.2.3.4:1").is_err());
        assert!(parse_endpoint("tcp://").is_err());
        assert!(parse_endpoint("127.0.0.1:7777").is_err());
    }

    fn big_frame() -> Frame {
        vec![b"cat.cmd".to_vec(), vec![7u8; 200_000], b"tail".to_vec()]
    }

    #[tokio::test]
    async fn plain_frame_round_trip() {
        let (a, b) = tokio::io::duplex(1 << 20);
        let (mut reader, _w) = framed(Box::new(a), None);
        let (_r, mut writer) = framed(Box::new(b), None);

        let f1 = vec![b"public.hello".to_vec()];
        let f2 = big_frame();
        writer.write_frame(&f1).await.unwrap();
        writer.write_frame(&f2).await.unwrap();
        assert_eq!(reader.read_frame().await.unwrap(), f1);
        assert_eq!(reader.read_frame().await.unwrap(), f2);
    }

    #[tokio::test]
    async fn encrypted_frame_round_trip_with_segmentation() {
        let server_kp = Keypair::generate();
        let client_kp = Keypair::generate();
        let server_id = server_kp.identity();

        let (mut client_io, mut server_io) = tokio::io::duplex(1 << 22);
        let server = tokio::spawn(async move {
            let (cipher, _peer) = noise::handshake_responder(&mut server_io, &server_kp)
                .await
                .unwrap();
            (cipher, server_io)
        });
        let client_cipher = noise::handshake_initiator(&mut client_io, &client_kp, &server_id)
            .await
            .unwrap();
        let (server_cipher, server_io) = server.await.unwrap();

        let (_r, mut writer) = framed(Box::new(client_io), Some(Arc::new(client_cipher)));
        let (mut reader, _w) = framed(Box::new(server_io), Some(Arc::new(server_cipher)));

        // Larger than one noise segment, so it must split and reassemble.
        let f = big_frame();
        writer.write_frame(&f).await.unwrap();
        assert_eq!(reader.read_frame().await.unwrap(), f);

        let small = vec![b"a.b".to_vec(), b"x".to_vec()];
        writer.write_frame(&small).await.unwrap();
        assert_eq!(reader.read_frame().await.unwrap(), small);
    }

    #[tokio::test]
    async fn oversized_announced_length_rejected() {
        let (a, b) = tokio::io::duplex(4096);
        let (mut reader, _w) = framed(Box::new(a), None);
        let mut raw = b;
        raw.write_all(&u32::MAX.to_be_bytes()).await.unwrap();
        assert!(reader.read_frame().await.is_err());
    }

    #[tokio::test]
    async fn truncated_stream_is_an_error() {
        let (a, b) = tokio::io::duplex(4096);
        let (mut reader, _w) = framed(Box::new(a), None);
        let mut raw = b;
        raw.write_all(&100u32.to_be_bytes()).await.unwrap();
        raw.write_all(&[1, 2, 3]).await.unwrap();
        drop(raw);
        assert!(reader.read_frame().await.is_err());
    }
}
