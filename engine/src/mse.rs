//! Obfuscated peer transport (spec.md §4.G). No repo in the retrieval pack
//! implements this; the Diffie-Hellman exchange and RC4 keystream derivation
//! follow the publicly documented Message Stream Encryption protocol, with
//! the simplifications recorded in DESIGN.md: fixed-length public keys and no
//! random padding, so the handshake is one fixed-size round trip per side
//! rather than the marker-search synchronization the full protocol uses to
//! tolerate variable padding.

use num_bigint::BigUint;
use rand::RngCore;
use rc4::{consts::U20, KeyInit, Rc4, StreamCipher};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{config::MseAllowedLevel, TorrentId};

/// 768-bit MODP group (RFC 2409, group 1) used by mainline's MSE.
const PRIME_HEX: &str = "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7EDEE386BFB5A899FA5AE9F24117C4B1FE649286651ECE65381FFFFFFFFFFFFFFFF";
const GENERATOR: u64 = 2;
/// Byte width a public key is padded/truncated to before it goes on the wire.
const PUBLIC_KEY_LEN: usize = 96;
/// Keystream bytes discarded after key derivation (RC4-drop1024).
const KEYSTREAM_DROP: usize = 1024;

const CRYPTO_PLAINTEXT: u8 = 0x01;
const CRYPTO_RC4: u8 = 0x02;

#[derive(Debug, thiserror::Error)]
pub enum MseError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake verification failed")]
    VerificationFailed,

    #[error("peer offered no encoding we accept")]
    NoCommonEncoding,

    #[error("rc4 key derivation failed")]
    KeyDerivation,
}

pub type Result<T> = std::result::Result<T, MseError>;

/// Which payload encoding a negotiated connection ended up using.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiatedEncoding {
    Plaintext,
    Rc4,
}

fn prime() -> BigUint {
    BigUint::parse_bytes(PRIME_HEX.as_bytes(), 16).expect("hardcoded prime is valid hex")
}

fn sha1(parts: &[&[u8]]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

struct KeyPair {
    private: BigUint,
    public: BigUint,
}

impl KeyPair {
    fn generate(prime: &BigUint) -> Self {
        let mut seed = [0u8; 20];
        rand::thread_rng().fill_bytes(&mut seed);
        let private = BigUint::from_bytes_be(&seed);
        let public = BigUint::from(GENERATOR).modpow(&private, prime);
        KeyPair { private, public }
    }

    fn public_bytes(&self) -> [u8; PUBLIC_KEY_LEN] {
        let raw = self.public.to_bytes_be();
        let mut out = [0u8; PUBLIC_KEY_LEN];
        let start = PUBLIC_KEY_LEN.saturating_sub(raw.len());
        out[start..].copy_from_slice(&raw[raw.len().saturating_sub(PUBLIC_KEY_LEN)..]);
        out
    }
}

fn crypto_provide(allowed: MseAllowedLevel) -> u8 {
    match allowed {
        MseAllowedLevel::Plaintext => CRYPTO_PLAINTEXT,
        MseAllowedLevel::Rc4 => CRYPTO_RC4,
        MseAllowedLevel::Both => CRYPTO_PLAINTEXT | CRYPTO_RC4,
    }
}

fn pick_encoding(provided: u8, allowed: MseAllowedLevel) -> Result<NegotiatedEncoding> {
    let acceptable = crypto_provide(allowed);
    // Prefer RC4 whenever both sides can do it; plaintext is the fallback.
    if provided & acceptable & CRYPTO_RC4 != 0 {
        Ok(NegotiatedEncoding::Rc4)
    } else if provided & acceptable & CRYPTO_PLAINTEXT != 0 {
        Ok(NegotiatedEncoding::Plaintext)
    } else {
        Err(MseError::NoCommonEncoding)
    }
}

fn derive_rc4(shared_secret: &[u8; PUBLIC_KEY_LEN], info_hash: &TorrentId, local_label: &[u8], remote_label: &[u8]) -> Result<(Rc4<U20>, Rc4<U20>)> {
    let send_key = sha1(&[local_label, shared_secret, info_hash]);
    let recv_key = sha1(&[remote_label, shared_secret, info_hash]);

    let mut send_cipher = Rc4::<U20>::new_from_slice(&send_key).map_err(|_| MseError::KeyDerivation)?;
    let mut recv_cipher = Rc4::<U20>::new_from_slice(&recv_key).map_err(|_| MseError::KeyDerivation)?;

    let mut drop_buf = [0u8; KEYSTREAM_DROP];
    send_cipher.apply_keystream(&mut drop_buf);
    let mut drop_buf = [0u8; KEYSTREAM_DROP];
    recv_cipher.apply_keystream(&mut drop_buf);

    Ok((send_cipher, recv_cipher))
}

/// A socket wrapped in the negotiated obfuscation, applied transparently on
/// every read and write. Plaintext negotiation leaves bytes untouched.
pub struct MseStream<S> {
    inner: S,
    encoding: NegotiatedEncoding,
    send_cipher: Option<Rc4<U20>>,
    recv_cipher: Option<Rc4<U20>>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> MseStream<S> {
    pub fn encoding(&self) -> NegotiatedEncoding {
        self.encoding
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    pub async fn write_frame(&mut self, data: &[u8]) -> Result<()> {
        let mut buf = data.to_vec();
        if let Some(cipher) = &mut self.send_cipher {
            cipher.apply_keystream(&mut buf);
        }
        self.inner.write_all(&buf).await?;
        Ok(())
    }

    pub async fn read_frame(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.inner.read_exact(&mut buf).await?;
        if let Some(cipher) = &mut self.recv_cipher {
            cipher.apply_keystream(&mut buf);
        }
        Ok(buf)
    }

    /// Runs the handshake as the connecting side (spec.md §4.G outbound).
    pub async fn outbound(mut socket: S, info_hash: &TorrentId, allowed: MseAllowedLevel) -> Result<Self> {
        let p = prime();
        let keys = KeyPair::generate(&p);

        socket.write_all(&keys.public_bytes()).await?;
        let mut peer_public = [0u8; PUBLIC_KEY_LEN];
        socket.read_exact(&mut peer_public).await?;

        let shared = BigUint::from_bytes_be(&peer_public).modpow(&keys.private, &p);
        let shared_bytes = {
            let raw = shared.to_bytes_be();
            let mut out = [0u8; PUBLIC_KEY_LEN];
            let start = PUBLIC_KEY_LEN.saturating_sub(raw.len());
            out[start..].copy_from_slice(&raw[raw.len().saturating_sub(PUBLIC_KEY_LEN)..]);
            out
        };

        socket.write_all(&sha1(&[b"req1", &shared_bytes])).await?;
        let mut peer_sync = [0u8; 20];
        socket.read_exact(&mut peer_sync).await?;
        if peer_sync != sha1(&[b"req1", &shared_bytes]) {
            return Err(MseError::VerificationFailed);
        }

        let (mut send_cipher, mut recv_cipher) = derive_rc4(&shared_bytes, info_hash, b"keyA", b"keyB")?;

        let provide = crypto_provide(allowed);
        let mut provide_buf = [provide];
        send_cipher.apply_keystream(&mut provide_buf);
        socket.write_all(&provide_buf).await?;

        let mut selected_buf = [0u8; 1];
        socket.read_exact(&mut selected_buf).await?;
        recv_cipher.apply_keystream(&mut selected_buf);
        let encoding = pick_encoding(selected_buf[0], allowed)?;

        Ok(Self::finish(socket, encoding, send_cipher, recv_cipher))
    }

    /// Runs the handshake as the accepting side (spec.md §4.G inbound).
    pub async fn inbound(mut socket: S, info_hash: &TorrentId, allowed: MseAllowedLevel) -> Result<Self> {
        let p = prime();
        let keys = KeyPair::generate(&p);

        let mut peer_public = [0u8; PUBLIC_KEY_LEN];
        socket.read_exact(&mut peer_public).await?;
        socket.write_all(&keys.public_bytes()).await?;

        let shared = BigUint::from_bytes_be(&peer_public).modpow(&keys.private, &p);
        let shared_bytes = {
            let raw = shared.to_bytes_be();
            let mut out = [0u8; PUBLIC_KEY_LEN];
            let start = PUBLIC_KEY_LEN.saturating_sub(raw.len());
            out[start..].copy_from_slice(&raw[raw.len().saturating_sub(PUBLIC_KEY_LEN)..]);
            out
        };

        let mut peer_sync = [0u8; 20];
        socket.read_exact(&mut peer_sync).await?;
        if peer_sync != sha1(&[b"req1", &shared_bytes]) {
            return Err(MseError::VerificationFailed);
        }
        socket.write_all(&sha1(&[b"req1", &shared_bytes])).await?;

        // Keys are swapped relative to the initiator: what it calls "keyA" it
        // sends with and we receive with, and vice versa.
        let (mut send_cipher, mut recv_cipher) = derive_rc4(&shared_bytes, info_hash, b"keyB", b"keyA")?;

        let mut provided_buf = [0u8; 1];
        socket.read_exact(&mut provided_buf).await?;
        recv_cipher.apply_keystream(&mut provided_buf);
        let encoding = pick_encoding(provided_buf[0], allowed)?;

        let mut selected_buf = [match encoding {
            NegotiatedEncoding::Plaintext => CRYPTO_PLAINTEXT,
            NegotiatedEncoding::Rc4 => CRYPTO_RC4,
        }];
        send_cipher.apply_keystream(&mut selected_buf);
        socket.write_all(&selected_buf).await?;

        Ok(Self::finish(socket, encoding, send_cipher, recv_cipher))
    }

    fn finish(socket: S, encoding: NegotiatedEncoding, send_cipher: Rc4<U20>, recv_cipher: Rc4<U20>) -> Self {
        match encoding {
            NegotiatedEncoding::Rc4 => MseStream {
                inner: socket,
                encoding,
                send_cipher: Some(send_cipher),
                recv_cipher: Some(recv_cipher),
            },
            NegotiatedEncoding::Plaintext => MseStream { inner: socket, encoding, send_cipher: None, recv_cipher: None },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diffie_hellman_agrees_on_a_shared_secret() {
        let p = prime();
        let a = KeyPair::generate(&p);
        let b = KeyPair::generate(&p);

        let shared_a = b.public.modpow(&a.private, &p);
        let shared_b = a.public.modpow(&b.private, &p);

        assert_eq!(shared_a, shared_b);
    }

    #[tokio::test]
    async fn handshake_negotiates_rc4_when_both_sides_allow_it() {
        let info_hash: TorrentId = [9u8; 20];
        let (client, server) = tokio::io::duplex(4096);

        let client_task = tokio::spawn(async move {
            MseStream::outbound(client, &[9u8; 20], MseAllowedLevel::Both).await
        });
        let server_task = tokio::spawn(async move {
            MseStream::inbound(server, &info_hash, MseAllowedLevel::Both).await
        });

        let (client_result, server_result) = tokio::join!(client_task, server_task);
        let client_stream = client_result.unwrap().unwrap();
        let server_stream = server_result.unwrap().unwrap();

        assert_eq!(client_stream.encoding(), NegotiatedEncoding::Rc4);
        assert_eq!(server_stream.encoding(), NegotiatedEncoding::Rc4);
    }

    #[tokio::test]
    async fn handshake_falls_back_to_plaintext_when_one_side_requires_it() {
        let info_hash: TorrentId = [3u8; 20];
        let (client, server) = tokio::io::duplex(4096);

        let client_task =
            tokio::spawn(async move { MseStream::outbound(client, &[3u8; 20], MseAllowedLevel::Plaintext).await });
        let server_task = tokio::spawn(async move { MseStream::inbound(server, &info_hash, MseAllowedLevel::Both).await });

        let (client_result, server_result) = tokio::join!(client_task, server_task);
        assert_eq!(client_result.unwrap().unwrap().encoding(), NegotiatedEncoding::Plaintext);
        assert_eq!(server_result.unwrap().unwrap().encoding(), NegotiatedEncoding::Plaintext);
    }
}
