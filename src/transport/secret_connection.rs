//! Authenticated, encrypted message channel.
//!
//! Speaks the CometBFT secret connection protocol, so the signer can dial a
//! stock node's `priv_validator_laddr`.
//!
//! ## Handshake
//!
//! 1. Both sides send a fresh X25519 ephemeral public key, wrapped in a
//!    length-delimited `BytesValue`, and read the peer's.
//! 2. The two keys, sorted, and the Diffie-Hellman secret are fed into a
//!    Merlin transcript. HKDF-SHA256 over the secret yields the receive and
//!    send keys; the side with the lower ephemeral key receives with the
//!    first. The 32-byte challenge is drawn from the transcript.
//! 3. Each side sends an `AuthSigMessage` (its ed25519 key and a signature
//!    over the challenge) as the first encrypted message, and verifies the
//!    peer's.
//!
//! ## Framing
//!
//! Every sealed frame carries 1028 bytes of plaintext: a `u32` LE chunk
//! length, up to 1024 data bytes, zero padding. The frames form a byte
//! stream in which each message is a uvarint length followed by the payload.
//!
//! A channel that hits any framing, decryption or I/O error is poisoned and
//! refuses all further traffic. The stream cannot be resynchronized.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use ed25519_dalek::{Signature, VerifyingKey};
use hkdf::Hkdf;
use merlin::Transcript;
use prost::Message as _;
use rand_core::OsRng;
use sha2::Sha256;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use x25519_dalek::{EphemeralSecret, PublicKey as EphemeralPublic};
use zeroize::Zeroizing;

use crate::error::{KmsError, KmsResult};
use crate::keystore::Identity;
use crate::proto::crypto::{PublicKey, public_key};
use crate::proto::p2p::{AuthSigMessage, BytesValue};

/// Largest message accepted in either direction.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Data bytes carried by one frame.
const DATA_MAX_SIZE: usize = 1024;
const LENGTH_PREFIX: usize = 4;
const FRAME_SIZE: usize = LENGTH_PREFIX + DATA_MAX_SIZE;
const TAG_SIZE: usize = 16;
const SEALED_FRAME_SIZE: usize = FRAME_SIZE + TAG_SIZE;

/// Longest uvarint a length prefix may take.
const MAX_VARINT_LEN: usize = 10;

/// Upper bound for the plaintext handshake message.
const MAX_EPHEMERAL_MESSAGE: usize = 64;

const TRANSCRIPT_LABEL: &[u8] = b"TENDERMINT_SECRET_CONNECTION_TRANSCRIPT_HASH";
const LABEL_EPHEMERAL_LOWER: &[u8] = b"EPHEMERAL_LOWER_PUBLIC_KEY";
const LABEL_EPHEMERAL_UPPER: &[u8] = b"EPHEMERAL_UPPER_PUBLIC_KEY";
const LABEL_DH_SECRET: &[u8] = b"DH_SECRET";
const LABEL_SECRET_CONNECTION_MAC: &[u8] = b"SECRET_CONNECTION_MAC";
const KDF_INFO: &[u8] = b"TENDERMINT_SECRET_CONNECTION_KEY_AND_CHALLENGE_GEN";

/// One direction of the channel: its cipher and frame counter.
struct Half {
    cipher: ChaCha20Poly1305,
    counter: u64,
}

impl Half {
    fn new(key: &[u8]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
            counter: 0,
        }
    }

    /// 96-bit nonce with the frame counter in bytes 4..12.
    fn next_nonce(&mut self) -> KmsResult<[u8; 12]> {
        let mut nonce = [0u8; 12];
        nonce[4..].copy_from_slice(&self.counter.to_le_bytes());
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or_else(|| KmsError::Transport("frame counter exhausted".to_string()))?;
        Ok(nonce)
    }
}

/// Secure channel to a single peer.
pub struct SecretConnection<S> {
    stream: S,
    send: Half,
    recv: Half,
    recv_buffer: Vec<u8>,
    remote_public_key: Option<VerifyingKey>,
    poisoned: bool,
}

impl<S: AsyncRead + AsyncWrite + Unpin> SecretConnection<S> {
    /// Run the handshake over `stream`, authenticating as `identity`.
    pub async fn handshake(mut stream: S, identity: &Identity) -> KmsResult<Self> {
        let local_secret = EphemeralSecret::random_from_rng(OsRng);
        let local_ephemeral = EphemeralPublic::from(&local_secret);

        let hello = BytesValue {
            value: local_ephemeral.as_bytes().to_vec(),
        }
        .encode_length_delimited_to_vec();
        stream
            .write_all(&hello)
            .await
            .map_err(|e| handshake_err("send ephemeral key", e))?;
        stream
            .flush()
            .await
            .map_err(|e| handshake_err("send ephemeral key", e))?;

        let remote_ephemeral = EphemeralPublic::from(read_ephemeral(&mut stream).await?);

        if remote_ephemeral.as_bytes() == local_ephemeral.as_bytes() {
            return Err(KmsError::Handshake(
                "peer reflected our ephemeral key".to_string(),
            ));
        }

        let local_is_low = local_ephemeral.as_bytes() < remote_ephemeral.as_bytes();
        let (low, high) = if local_is_low {
            (local_ephemeral.as_bytes(), remote_ephemeral.as_bytes())
        } else {
            (remote_ephemeral.as_bytes(), local_ephemeral.as_bytes())
        };

        let mut transcript = Transcript::new(TRANSCRIPT_LABEL);
        transcript.append_message(LABEL_EPHEMERAL_LOWER, low);
        transcript.append_message(LABEL_EPHEMERAL_UPPER, high);

        let shared = local_secret.diffie_hellman(&remote_ephemeral);
        if !shared.was_contributory() {
            return Err(KmsError::Handshake(
                "low-order ephemeral key from peer".to_string(),
            ));
        }
        transcript.append_message(LABEL_DH_SECRET, shared.as_bytes());

        let mut okm = Zeroizing::new([0u8; 64]);
        Hkdf::<Sha256>::new(None, shared.as_bytes())
            .expand(KDF_INFO, &mut okm[..])
            .map_err(|e| KmsError::Handshake(format!("key derivation failed: {e}")))?;

        let (key_a, key_b) = okm.split_at(32);
        let (recv_key, send_key) = if local_is_low {
            (key_a, key_b)
        } else {
            (key_b, key_a)
        };

        let mut challenge = [0u8; 32];
        transcript.challenge_bytes(LABEL_SECRET_CONNECTION_MAC, &mut challenge);

        let mut conn = Self {
            stream,
            send: Half::new(send_key),
            recv: Half::new(recv_key),
            recv_buffer: Vec::new(),
            remote_public_key: None,
            poisoned: false,
        };

        let auth = AuthSigMessage {
            pub_key: Some(PublicKey::ed25519(identity.public_key().as_bytes())),
            sig: identity.sign(&challenge).to_bytes().to_vec(),
        };
        conn.write_message(&auth.encode_to_vec())
            .await
            .map_err(|e| KmsError::Handshake(format!("send auth message: {e}")))?;

        let remote_auth = conn
            .read_message()
            .await
            .map_err(|e| KmsError::Handshake(format!("read auth message: {e}")))?;
        let remote_key = verify_auth(&remote_auth, &challenge)?;
        conn.remote_public_key = Some(remote_key);

        tracing::debug!(
            remote = %hex::encode(remote_key.as_bytes()),
            "Secret connection established"
        );
        Ok(conn)
    }

    /// Long-term key the peer authenticated with.
    pub fn remote_public_key(&self) -> Option<&VerifyingKey> {
        self.remote_public_key.as_ref()
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Send one message.
    pub async fn write_message(&mut self, payload: &[u8]) -> KmsResult<()> {
        self.ensure_usable()?;
        let result = self.write_frames(payload).await;
        self.poison_on_error(result)
    }

    /// Receive one message.
    pub async fn read_message(&mut self) -> KmsResult<Vec<u8>> {
        self.ensure_usable()?;
        let result = self.read_frames().await;
        self.poison_on_error(result)
    }

    fn ensure_usable(&self) -> KmsResult<()> {
        if self.poisoned {
            return Err(KmsError::Transport("channel is poisoned".to_string()));
        }
        Ok(())
    }

    fn poison_on_error<T>(&mut self, result: KmsResult<T>) -> KmsResult<T> {
        if result.is_err() {
            self.poisoned = true;
        }
        result
    }

    async fn write_frames(&mut self, payload: &[u8]) -> KmsResult<()> {
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(KmsError::FrameTooLarge {
                size: payload.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }

        let mut data =
            Vec::with_capacity(prost::length_delimiter_len(payload.len()) + payload.len());
        prost::encode_length_delimiter(payload.len(), &mut data)
            .map_err(|e| KmsError::Serialization(e.to_string()))?;
        data.extend_from_slice(payload);

        for chunk in data.chunks(DATA_MAX_SIZE) {
            let mut frame = Zeroizing::new([0u8; FRAME_SIZE]);
            #[allow(clippy::cast_possible_truncation)]
            frame[..LENGTH_PREFIX].copy_from_slice(&(chunk.len() as u32).to_le_bytes());
            frame[LENGTH_PREFIX..LENGTH_PREFIX + chunk.len()].copy_from_slice(chunk);

            let nonce = self.send.next_nonce()?;
            let sealed = self
                .send
                .cipher
                .encrypt(Nonce::from_slice(&nonce), &frame[..])
                .map_err(|_| KmsError::Transport("frame encryption failed".to_string()))?;
            self.stream.write_all(&sealed).await?;
        }

        self.stream.flush().await?;
        Ok(())
    }

    async fn read_frames(&mut self) -> KmsResult<Vec<u8>> {
        loop {
            if let Some((prefix, len)) = pending_length(&self.recv_buffer)? {
                if self.recv_buffer.len() >= prefix + len {
                    let message = self.recv_buffer[prefix..prefix + len].to_vec();
                    self.recv_buffer.drain(..prefix + len);
                    return Ok(message);
                }
            }
            self.read_frame().await?;
        }
    }

    async fn read_frame(&mut self) -> KmsResult<()> {
        let mut sealed = [0u8; SEALED_FRAME_SIZE];
        self.stream.read_exact(&mut sealed).await?;

        let nonce = self.recv.next_nonce()?;
        let frame = Zeroizing::new(
            self.recv
                .cipher
                .decrypt(Nonce::from_slice(&nonce), &sealed[..])
                .map_err(|_| KmsError::Transport("frame decryption failed".to_string()))?,
        );

        let mut len_bytes = [0u8; LENGTH_PREFIX];
        len_bytes.copy_from_slice(&frame[..LENGTH_PREFIX]);
        let chunk_len = u32::from_le_bytes(len_bytes) as usize;
        if chunk_len > DATA_MAX_SIZE {
            return Err(KmsError::Transport(format!(
                "frame chunk length {chunk_len} exceeds {DATA_MAX_SIZE}"
            )));
        }

        self.recv_buffer
            .extend_from_slice(&frame[LENGTH_PREFIX..LENGTH_PREFIX + chunk_len]);
        Ok(())
    }
}

/// Length prefix at the head of `buffer`, as `(prefix bytes, message bytes)`.
///
/// `None` until the whole prefix has arrived.
fn pending_length(buffer: &[u8]) -> KmsResult<Option<(usize, usize)>> {
    let Some(end) = buffer
        .iter()
        .take(MAX_VARINT_LEN)
        .position(|byte| byte & 0x80 == 0)
    else {
        if buffer.len() >= MAX_VARINT_LEN {
            return Err(KmsError::Transport("malformed length prefix".to_string()));
        }
        return Ok(None);
    };

    let len = prost::decode_length_delimiter(&buffer[..=end])
        .map_err(|e| KmsError::Transport(format!("malformed length prefix: {e}")))?;
    if len > MAX_MESSAGE_SIZE {
        return Err(KmsError::FrameTooLarge {
            size: len,
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(Some((end + 1, len)))
}

fn handshake_err(step: &str, err: std::io::Error) -> KmsError {
    KmsError::Handshake(format!("{step}: {err}"))
}

/// Read the peer's plaintext ephemeral key message.
async fn read_ephemeral<S: AsyncRead + Unpin>(stream: &mut S) -> KmsResult<[u8; 32]> {
    let mut prefix = Vec::with_capacity(MAX_VARINT_LEN);
    loop {
        let byte = stream
            .read_u8()
            .await
            .map_err(|e| handshake_err("read ephemeral key", e))?;
        prefix.push(byte);
        if byte & 0x80 == 0 {
            break;
        }
        if prefix.len() >= MAX_VARINT_LEN {
            return Err(KmsError::Handshake("malformed ephemeral key length".to_string()));
        }
    }

    let len = prost::decode_length_delimiter(prefix.as_slice())
        .map_err(|e| KmsError::Handshake(format!("malformed ephemeral key length: {e}")))?;
    if len > MAX_EPHEMERAL_MESSAGE {
        return Err(KmsError::Handshake(format!(
            "ephemeral key message is {len} bytes"
        )));
    }

    let mut body = vec![0u8; len];
    stream
        .read_exact(&mut body)
        .await
        .map_err(|e| handshake_err("read ephemeral key", e))?;
    let message = BytesValue::decode(body.as_slice())
        .map_err(|e| KmsError::Handshake(format!("malformed ephemeral key: {e}")))?;

    message.value.as_slice().try_into().map_err(|_| {
        KmsError::Handshake(format!(
            "ephemeral key is {} bytes, expected 32",
            message.value.len()
        ))
    })
}

fn verify_auth(message: &[u8], challenge: &[u8]) -> KmsResult<VerifyingKey> {
    let auth = AuthSigMessage::decode(message)
        .map_err(|e| KmsError::Handshake(format!("malformed auth message: {e}")))?;

    let key_bytes = match auth.pub_key.and_then(|key| key.sum) {
        Some(public_key::Sum::Ed25519(bytes)) => bytes,
        Some(public_key::Sum::Secp256k1(_)) => {
            return Err(KmsError::Handshake(
                "peer authenticated with a non-ed25519 key".to_string(),
            ));
        }
        None => return Err(KmsError::Handshake("auth message without key".to_string())),
    };
    let key_bytes: [u8; 32] = key_bytes
        .as_slice()
        .try_into()
        .map_err(|_| KmsError::Handshake("malformed remote key".to_string()))?;
    let sig_bytes: [u8; 64] = auth
        .sig
        .as_slice()
        .try_into()
        .map_err(|_| KmsError::Handshake("malformed remote signature".to_string()))?;

    let remote_key = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|e| KmsError::Handshake(format!("invalid remote key: {e}")))?;
    let signature = Signature::from_bytes(&sig_bytes);
    remote_key
        .verify_strict(challenge, &signature)
        .map_err(|_| KmsError::Handshake("challenge signature did not verify".to_string()))?;

    Ok(remote_key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Role;
    use ed25519_dalek::SigningKey;
    use tokio::io::{DuplexStream, duplex};

    fn identity(seed: u8) -> Identity {
        Identity::new(Role::Primary, SigningKey::from_bytes(&[seed; 32]))
    }

    async fn connected_pair() -> (SecretConnection<DuplexStream>, SecretConnection<DuplexStream>) {
        let (a, b) = duplex(64 * 1024);
        let signer = identity(1);
        let node = identity(2);
        let (left, right) = tokio::join!(
            SecretConnection::handshake(a, &signer),
            SecretConnection::handshake(b, &node)
        );
        (left.unwrap(), right.unwrap())
    }

    #[tokio::test]
    async fn test_handshake_authenticates_both_sides() {
        let (left, right) = connected_pair().await;
        assert_eq!(
            left.remote_public_key().unwrap(),
            &identity(2).public_key()
        );
        assert_eq!(
            right.remote_public_key().unwrap(),
            &identity(1).public_key()
        );
    }

    #[tokio::test]
    async fn test_messages_cross_frame_boundaries() {
        let (mut left, mut right) = connected_pair().await;

        let small = b"ping".to_vec();
        let medium = vec![0x5a; 200];
        let large: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let empty: Vec<u8> = Vec::new();

        left.write_message(&small).await.unwrap();
        left.write_message(&medium).await.unwrap();
        left.write_message(&large).await.unwrap();
        left.write_message(&empty).await.unwrap();

        assert_eq!(right.read_message().await.unwrap(), small);
        assert_eq!(right.read_message().await.unwrap(), medium);
        assert_eq!(right.read_message().await.unwrap(), large);
        assert_eq!(right.read_message().await.unwrap(), empty);

        right.write_message(b"pong").await.unwrap();
        assert_eq!(left.read_message().await.unwrap(), b"pong");
    }

    #[tokio::test]
    async fn test_oversize_message_rejected_and_poisons() {
        let (mut left, _right) = connected_pair().await;
        let oversize = vec![0u8; MAX_MESSAGE_SIZE + 1];

        let err = left.write_message(&oversize).await.unwrap_err();
        assert!(matches!(err, KmsError::FrameTooLarge { .. }));
        assert!(left.is_poisoned());
        assert!(left.write_message(b"after").await.is_err());
    }

    #[tokio::test]
    async fn test_tampered_frame_poisons_channel() {
        let (a, mut raw) = duplex(64 * 1024);
        let node = identity(2);

        // Run the node side by hand so the raw stream stays accessible.
        let handshake = tokio::spawn(async move {
            SecretConnection::handshake(a, &identity(1)).await
        });
        let (node_stream, mut relay) = duplex(64 * 1024);
        let node_task = tokio::spawn(async move {
            SecretConnection::handshake(node_stream, &node).await
        });

        // Relay the handshake bytes both ways: the delimited ephemeral key
        // message plus one auth frame.
        let mut eph = [0u8; 35];
        raw.read_exact(&mut eph).await.unwrap();
        relay.write_all(&eph).await.unwrap();
        relay.read_exact(&mut eph).await.unwrap();
        raw.write_all(&eph).await.unwrap();

        let mut frame = [0u8; SEALED_FRAME_SIZE];
        raw.read_exact(&mut frame).await.unwrap();
        relay.write_all(&frame).await.unwrap();
        relay.read_exact(&mut frame).await.unwrap();
        raw.write_all(&frame).await.unwrap();

        let mut signer = handshake.await.unwrap().unwrap();
        let _node = node_task.await.unwrap().unwrap();

        // Forge a frame towards the signer.
        let mut garbage = [0u8; SEALED_FRAME_SIZE];
        garbage[0] = 1;
        raw.write_all(&garbage).await.unwrap();

        let err = signer.read_message().await.unwrap_err();
        assert!(matches!(err, KmsError::Transport(_)));
        assert!(signer.is_poisoned());
    }

    #[tokio::test]
    async fn test_ephemeral_key_sent_as_bytes_value() {
        let (a, mut b) = duplex(1024);
        let _task = tokio::spawn(async move { SecretConnection::handshake(a, &identity(1)).await });

        let mut hello = [0u8; 35];
        b.read_exact(&mut hello).await.unwrap();
        // length 34, field 1 length-delimited, 32 key bytes
        assert_eq!(&hello[..3], &[0x22, 0x0a, 0x20]);
    }

    #[tokio::test]
    async fn test_garbage_handshake_rejected() {
        let (a, mut b) = duplex(1024);
        let task = tokio::spawn(async move { SecretConnection::handshake(a, &identity(1)).await });

        // All-zero point is low order.
        let hello = BytesValue {
            value: vec![0u8; 32],
        }
        .encode_length_delimited_to_vec();
        b.write_all(&hello).await.unwrap();
        let result = task.await.unwrap();
        assert!(matches!(result, Err(KmsError::Handshake(_))));
    }

    #[tokio::test]
    async fn test_short_ephemeral_key_rejected() {
        let (a, mut b) = duplex(1024);
        let task = tokio::spawn(async move { SecretConnection::handshake(a, &identity(1)).await });

        b.write_all(&[0x04, 0x0a, 0x02, 0x01, 0x02]).await.unwrap();
        let result = task.await.unwrap();
        assert!(matches!(result, Err(KmsError::Handshake(_))));
    }

    #[test]
    fn test_auth_requires_ed25519_key() {
        let challenge = [7u8; 32];
        let signer = identity(3);
        let signature = signer.sign(&challenge).to_bytes().to_vec();

        let good = AuthSigMessage {
            pub_key: Some(PublicKey::ed25519(signer.public_key().as_bytes())),
            sig: signature.clone(),
        };
        assert_eq!(
            verify_auth(&good.encode_to_vec(), &challenge).unwrap(),
            signer.public_key()
        );
        assert!(verify_auth(&good.encode_to_vec(), &[8u8; 32]).is_err());

        let secp = AuthSigMessage {
            pub_key: Some(PublicKey {
                sum: Some(public_key::Sum::Secp256k1(vec![2; 33])),
            }),
            sig: signature,
        };
        assert!(matches!(
            verify_auth(&secp.encode_to_vec(), &challenge),
            Err(KmsError::Handshake(_))
        ));
    }

    #[test]
    fn test_pending_length_waits_for_full_prefix() {
        assert_eq!(pending_length(&[]).unwrap(), None);
        assert_eq!(pending_length(&[0x80]).unwrap(), None);
        assert_eq!(pending_length(&[0xac, 0x02, 0xff]).unwrap(), Some((2, 300)));
        assert!(matches!(
            pending_length(&[0x81, 0x80, 0x80, 0x01]),
            Err(KmsError::FrameTooLarge { .. })
        ));
        assert!(pending_length(&[0xff; MAX_VARINT_LEN]).is_err());
    }
}
