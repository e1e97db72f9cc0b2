//! # Curve Transport Sessions
//!
//! Curve-authenticated endpoints run a Noise IK handshake
//! (`Noise_IK_25519_ChaChaPoly_BLAKE2s`) directly on the freshly-opened
//! stream, before any frame is exchanged. The dialer must already know the
//! listener's 32-byte pubkey (that is what makes the endpoint "curve"); the
//! listener learns the dialer's pubkey from the handshake. Ed25519 identity
//! keys are mapped onto X25519 for the DH, and the initiator proves the
//! mapping by sending its Ed25519 key as the first handshake payload, which
//! the responder checks against the handshake's remote static.
//!
//! After the handshake each frame record is carried as one or more encrypted
//! segments, each a u16-BE ciphertext length followed by the ciphertext,
//! since a single Noise message tops out at 64 KiB.

use std::sync::{Mutex, OnceLock};

use anyhow::{bail, Context, Result};
use snow::{params::NoiseParams, Builder, TransportState};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::identity::{Identity, Keypair};

const NOISE_PATTERN: &str = "Noise_IK_25519_ChaChaPoly_BLAKE2s";

/// Largest Noise message, a protocol constant.
const MAX_NOISE_MSG: usize = 65535;

/// AEAD tag appended to every encrypted segment.
const TAG_LEN: usize = 16;

/// Largest plaintext that fits a single encrypted segment.
pub(crate) const MAX_SEGMENT: usize = MAX_NOISE_MSG - TAG_LEN;

fn noise_params() -> &'static NoiseParams {
    static PARAMS: OnceLock<NoiseParams> = OnceLock::new();
    PARAMS.get_or_init(|| NOISE_PATTERN.parse().expect("hardcoded noise pattern is valid"))
}

/// Established transport cipher, shared by a connection's read and write
/// halves. The lock is held only for the in-memory cipher operation, never
/// across socket IO.
pub(crate) struct SessionCipher {
    state: Mutex<TransportState>,
}

impl SessionCipher {
    fn new(state: TransportState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        if plaintext.len() > MAX_SEGMENT {
            bail!("segment of {} bytes exceeds noise limit", plaintext.len());
        }
        let mut buf = vec![0u8; plaintext.len() + TAG_LEN];
        let n = self
            .state
            .lock()
            .expect("cipher mutex poisoned")
            .write_message(plaintext, &mut buf)
            .context("noise encryption failed")?;
        buf.truncate(n);
        Ok(buf)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; ciphertext.len()];
        let n = self
            .state
            .lock()
            .expect("cipher mutex poisoned")
            .read_message(ciphertext, &mut buf)
            .context("noise decryption failed")?;
        buf.truncate(n);
        Ok(buf)
    }
}

/// Dial-side handshake. `remote` is the listener's long-term pubkey.
pub(crate) async fn handshake_initiator<S>(
    stream: &mut S,
    keypair: &Keypair,
    remote: &Identity,
) -> Result<SessionCipher>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let local = keypair.to_x25519();
    let remote_x = remote
        .to_x25519()
        .context("remote pubkey is not a valid curve point")?;
    let mut hs = Builder::new(noise_params().clone())
        .local_private_key(&local.private)
        .remote_public_key(&remote_x)
        .build_initiator()
        .context("failed to build handshake initiator")?;

    // msg1 carries our Ed25519 identity so the responder can bind it to the
    // X25519 static authenticated by the handshake.
    let mut buf = vec![0u8; 256];
    let n = hs
        .write_message(keypair.identity().as_bytes(), &mut buf)
        .context("failed to write handshake init")?;
    write_hs_msg(stream, &buf[..n]).await?;

    let msg2 = read_hs_msg(stream).await?;
    let mut payload = vec![0u8; msg2.len()];
    hs.read_message(&msg2, &mut payload)
        .context("handshake response rejected")?;

    let transport = hs
        .into_transport_mode()
        .context("handshake did not complete")?;
    Ok(SessionCipher::new(transport))
}

/// Accept-side handshake. Returns the cipher and the dialer's verified
/// identity.
pub(crate) async fn handshake_responder<S>(
    stream: &mut S,
    keypair: &Keypair,
) -> Result<(SessionCipher, Identity)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let local = keypair.to_x25519();
    let mut hs = Builder::new(noise_params().clone())
        .local_private_key(&local.private)
        .build_responder()
        .context("failed to build handshake responder")?;

    let msg1 = read_hs_msg(stream).await?;
    let mut payload = vec![0u8; msg1.len()];
    let n = hs
        .read_message(&msg1, &mut payload)
        .context("handshake init rejected")?;

    // The payload claims an Ed25519 identity; it must map onto the X25519
    // static the handshake actually authenticated.
    if n != 32 {
        bail!("handshake payload is {} bytes, expected a 32-byte identity", n);
    }
    let mut id_bytes = [0u8; 32];
    id_bytes.copy_from_slice(&payload[..32]);
    let claimed = Identity::from_bytes(id_bytes);
    let claimed_x = claimed
        .to_x25519()
        .context("claimed identity is not a valid curve point")?;
    let remote_static = hs
        .get_remote_static()
        .context("handshake exposed no remote static")?;
    if remote_static != claimed_x.as_slice() {
        bail!(
            "identity mismatch: claimed {} does not own the handshake static",
            claimed.log_id()
        );
    }

    let mut resp = vec![0u8; 256];
    let n = hs
        .write_message(&[], &mut resp)
        .context("failed to write handshake response")?;
    write_hs_msg(stream, &resp[..n]).await?;

    let transport = hs
        .into_transport_mode()
        .context("handshake did not complete")?;
    Ok((SessionCipher::new(transport), claimed))
}

async fn write_hs_msg<S: AsyncWrite + Unpin>(stream: &mut S, msg: &[u8]) -> Result<()> {
    let len = u16::try_from(msg.len()).context("handshake message too large")?;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(msg).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_hs_msg<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 2];
    stream
        .read_exact(&mut len_buf)
        .await
        .context("connection closed during handshake")?;
    let len = u16::from_be_bytes(len_buf) as usize;
    let mut msg = vec![0u8; len];
    stream
        .read_exact(&mut msg)
        .await
        .context("connection closed during handshake")?;
    Ok(msg)
}
