//! Integration tests for the remote signer.
//!
//! Each test runs a real `Signer` against in-process consensus-node stand-ins
//! that listen on localhost, accept the signer's connection and speak the
//! wire protocol over a secret connection.
//!
//! Run with: cargo test --test `kms_integration`

use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use ed25519_dalek::{Signature, SigningKey};
use prost::Message as _;
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use comet_kms::authority::ActiveSigner;
use comet_kms::keystore::{self, Identity, KeyRing};
use comet_kms::proto::{crypto::public_key, privval, types as pb};
use comet_kms::protocol::Message;
use comet_kms::signing::canonical;
use comet_kms::signing::types::{BlockId, Hrs, PartSetHeader, SignedMsgType, Vote};
use comet_kms::storage::SigningStateStore;
use comet_kms::transport::SecretConnection;
use comet_kms::{KmsResult, PubKeyPolicy, Role, Settings, ShutdownHandle, Signer};

const CHAIN_ID: &str = "test-chain";
const CONSENSUS_SEED: u8 = 42;
const WAIT: Duration = Duration::from_secs(5);

/// Write a `priv_validator_key.json` for a deterministic key.
fn write_key_file(dir: &Path, seed: u8, priv_type: &str) -> PathBuf {
    let signing_key = SigningKey::from_bytes(&[seed; 32]);
    let identity = Identity::new(Role::Primary, signing_key.clone());
    let json = serde_json::json!({
        "address": identity.address_hex(),
        "pub_key": {
            "type": keystore::PUB_KEY_TYPE,
            "value": BASE64.encode(identity.public_key().as_bytes()),
        },
        "priv_key": {
            "type": priv_type,
            "value": BASE64.encode(signing_key.to_keypair_bytes()),
        },
    });
    let path = dir.join("priv_validator_key.json");
    std::fs::write(&path, serde_json::to_vec_pretty(&json).unwrap()).unwrap();
    path
}

fn consensus_public_key() -> ed25519_dalek::VerifyingKey {
    SigningKey::from_bytes(&[CONSENSUS_SEED; 32]).verifying_key()
}

fn vote(height: i64, round: i32, msg_type: SignedMsgType) -> Vote {
    Vote {
        msg_type,
        height,
        round,
        block_id: BlockId {
            hash: vec![0xAB; 32],
            part_set_header: PartSetHeader {
                total: 1,
                hash: vec![0xCD; 32],
            },
        },
        timestamp: Utc::now(),
        validator_address: vec![0x01; 20],
        validator_index: 0,
        signature: Vec::new(),
        extension: Vec::new(),
        extension_signature: Vec::new(),
    }
}

/// Consensus-node side of one signer connection.
struct Node {
    channel: SecretConnection<TcpStream>,
}

impl Node {
    /// Accept the signer's dial and complete the handshake.
    async fn accept(listener: &TcpListener, seed: u8) -> Self {
        let (stream, _) = tokio::time::timeout(WAIT, listener.accept())
            .await
            .expect("signer did not dial")
            .unwrap();
        let identity = Identity::new(Role::Primary, SigningKey::from_bytes(&[seed; 32]));
        let channel = SecretConnection::handshake(stream, &identity).await.unwrap();
        Self { channel }
    }

    async fn request(&mut self, message: Message) -> Message {
        self.channel.write_message(&message.encode()).await.unwrap();
        let response = tokio::time::timeout(WAIT, self.channel.read_message())
            .await
            .expect("no response")
            .unwrap();
        Message::decode(&response).unwrap()
    }

    async fn sign_vote(&mut self, vote: Vote) -> Message {
        self.request(Message::SignVoteRequest {
            chain_id: CHAIN_ID.to_string(),
            vote,
        })
        .await
    }
}

struct Running {
    active: ActiveSigner,
    shutdown: ShutdownHandle,
    task: JoinHandle<KmsResult<()>>,
}

impl Running {
    async fn stop(self) {
        self.shutdown.trigger();
        tokio::time::timeout(WAIT, self.task)
            .await
            .expect("signer did not stop")
            .unwrap()
            .unwrap();
    }
}

fn start_signer(settings: &Settings) -> Running {
    let keys = KeyRing::load(
        settings.key_file(),
        settings.standby_key_file().map(PathBuf::as_path),
        settings.ha_enabled(),
    )
    .unwrap();
    let store = SigningStateStore::open(settings.state_file()).unwrap();
    let signer = Signer::from_settings(settings, keys, store).unwrap();
    let active = signer.active().clone();

    let shutdown = ShutdownHandle::new();
    let task = tokio::spawn(signer.run(shutdown.clone()));
    Running {
        active,
        shutdown,
        task,
    }
}

async fn listener() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = format!("tcp://{}", listener.local_addr().unwrap());
    (listener, addr)
}

fn assert_signed_by_consensus_key(response: &Message, request: &Vote) {
    let Message::SignedVoteResponse {
        vote: Some(signed),
        error: None,
    } = response
    else {
        panic!("expected signed vote, got {response:?}");
    };
    let signature = Signature::from_slice(&signed.signature).unwrap();
    consensus_public_key()
        .verify_strict(&canonical::vote_sign_bytes(CHAIN_ID, request), &signature)
        .unwrap();
}

fn error_code(response: &Message) -> Option<i32> {
    response.error().map(|e| e.code)
}

#[tokio::test]
async fn test_single_endpoint_signing_flow() {
    let dir = TempDir::new().unwrap();
    let key_file = write_key_file(dir.path(), CONSENSUS_SEED, keystore::PRIV_KEY_TYPE);
    let state_file = dir.path().join("data").join("kms_state.json");
    let (primary, primary_addr) = listener().await;

    let settings = Settings::for_tests(&primary_addr, None, key_file, state_file.clone());
    let running = start_signer(&settings);
    let mut node = Node::accept(&primary, 100).await;

    // Public key is the consensus key.
    let response = node
        .request(Message::PublicKeyRequest {
            chain_id: CHAIN_ID.to_string(),
        })
        .await;
    let Message::PublicKeyResponse { key_bytes, .. } = response else {
        panic!("expected public key response");
    };
    assert_eq!(key_bytes, consensus_public_key().as_bytes().to_vec());

    // Normal vote above the watermark.
    let request = vote(101, 0, SignedMsgType::Prevote);
    let response = node.sign_vote(request.clone()).await;
    assert_signed_by_consensus_key(&response, &request);

    // Replay of the same slot is refused.
    let response = node.sign_vote(vote(101, 0, SignedMsgType::Prevote)).await;
    assert_eq!(error_code(&response), Some(2));

    // The channel survives the refusal.
    assert_eq!(node.request(Message::PingRequest).await, Message::PingResponse);

    let watermark = running.active.watermark().unwrap();
    assert_eq!(watermark.hrs(), Hrs::new(101, 0, SignedMsgType::Prevote));
    running.stop().await;

    let reopened = SigningStateStore::open(&state_file).unwrap();
    assert_eq!(reopened.read(), watermark);
}

#[tokio::test]
async fn test_node_speaks_raw_privval_protobuf() {
    let dir = TempDir::new().unwrap();
    let key_file = write_key_file(dir.path(), CONSENSUS_SEED, keystore::PRIV_KEY_TYPE);
    let state_file = dir.path().join("data").join("kms_state.json");
    let (primary, primary_addr) = listener().await;

    let settings = Settings::for_tests(&primary_addr, None, key_file, state_file);
    let running = start_signer(&settings);
    let mut node = Node::accept(&primary, 100).await;

    let exchange = |request: privval::message::Sum| privval::Message { sum: Some(request) };

    // The way a node built from the protobuf definitions asks for the key.
    let request = exchange(privval::message::Sum::PubKeyRequest(privval::PubKeyRequest {
        chain_id: CHAIN_ID.to_string(),
    }));
    node.channel.write_message(&request.encode_to_vec()).await.unwrap();
    let raw = tokio::time::timeout(WAIT, node.channel.read_message())
        .await
        .expect("no response")
        .unwrap();
    let Some(privval::message::Sum::PubKeyResponse(response)) =
        privval::Message::decode(raw.as_slice()).unwrap().sum
    else {
        panic!("expected pub key response");
    };
    assert_eq!(
        response.pub_key.and_then(|key| key.sum),
        Some(public_key::Sum::Ed25519(
            consensus_public_key().as_bytes().to_vec()
        ))
    );

    // A prevote with no timestamp and no block id (nil) is signed over the
    // zero time.
    let request = exchange(privval::message::Sum::SignVoteRequest(privval::SignVoteRequest {
        vote: Some(pb::Vote {
            r#type: pb::SignedMsgType::Prevote as i32,
            height: 5,
            ..Default::default()
        }),
        chain_id: CHAIN_ID.to_string(),
    }));
    node.channel.write_message(&request.encode_to_vec()).await.unwrap();
    let raw = tokio::time::timeout(WAIT, node.channel.read_message())
        .await
        .expect("no response")
        .unwrap();
    let Some(privval::message::Sum::SignedVoteResponse(response)) =
        privval::Message::decode(raw.as_slice()).unwrap().sum
    else {
        panic!("expected signed vote response");
    };
    assert!(response.error.is_none());
    let signed = Vote::try_from(response.vote.unwrap()).unwrap();
    let expected = Vote {
        signature: Vec::new(),
        ..signed.clone()
    };
    let signature = Signature::from_slice(&signed.signature).unwrap();
    consensus_public_key()
        .verify_strict(&canonical::vote_sign_bytes(CHAIN_ID, &expected), &signature)
        .unwrap();
    assert!(expected.block_id.is_zero());

    running.stop().await;
}

#[tokio::test]
async fn test_watermark_survives_restart() {
    let dir = TempDir::new().unwrap();
    let key_file = write_key_file(dir.path(), CONSENSUS_SEED, keystore::PRIV_KEY_TYPE);
    let state_file = dir.path().join("kms_state.json");
    let (primary, primary_addr) = listener().await;
    let settings = Settings::for_tests(&primary_addr, None, key_file, state_file);

    let running = start_signer(&settings);
    let mut node = Node::accept(&primary, 100).await;
    let response = node.sign_vote(vote(5, 0, SignedMsgType::Precommit)).await;
    assert_eq!(error_code(&response), None);
    // Stop while still connected so no redial is left queued on the listener.
    running.stop().await;
    drop(node);

    // A fresh process must refuse what the previous one signed.
    let running = start_signer(&settings);
    let mut node = Node::accept(&primary, 100).await;
    let response = node.sign_vote(vote(5, 0, SignedMsgType::Precommit)).await;
    assert_eq!(error_code(&response), Some(2));

    let request = vote(6, 0, SignedMsgType::Prevote);
    let response = node.sign_vote(request.clone()).await;
    assert_signed_by_consensus_key(&response, &request);
    running.stop().await;
}

#[tokio::test]
async fn test_failover_to_standby() {
    let dir = TempDir::new().unwrap();
    let key_file = write_key_file(dir.path(), CONSENSUS_SEED, keystore::PRIV_KEY_TYPE);
    let (primary, primary_addr) = listener().await;
    let (standby, standby_addr) = listener().await;

    let settings = Settings::for_tests(
        &primary_addr,
        Some(&standby_addr),
        key_file,
        dir.path().join("kms_state.json"),
    );
    let running = start_signer(&settings);

    let mut primary_node = Node::accept(&primary, 100).await;
    let mut standby_node = Node::accept(&standby, 101).await;

    // Primary signs; standby gets an explicit refusal, never a signature.
    let response = primary_node.sign_vote(vote(10, 0, SignedMsgType::Prevote)).await;
    assert_eq!(error_code(&response), None);
    let response = standby_node.sign_vote(vote(11, 0, SignedMsgType::Prevote)).await;
    assert_eq!(error_code(&response), Some(3));

    // Standby is told its own identity, not the consensus key.
    let response = standby_node
        .request(Message::PublicKeyRequest {
            chain_id: CHAIN_ID.to_string(),
        })
        .await;
    let Message::PublicKeyResponse { key_bytes, .. } = response else {
        panic!("expected public key response");
    };
    assert_ne!(key_bytes, consensus_public_key().as_bytes().to_vec());

    // Lose the primary for good: no listener to redial.
    drop(primary);
    drop(primary_node);

    tokio::time::timeout(WAIT, async {
        while running.active.current_role().unwrap() != Role::Standby {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("authority did not move to standby");

    // Standby now signs with the consensus key, above the shared watermark.
    let request = vote(11, 0, SignedMsgType::Prevote);
    let response = standby_node.sign_vote(request.clone()).await;
    assert_signed_by_consensus_key(&response, &request);

    // Anything the primary already signed stays refused.
    let response = standby_node.sign_vote(vote(10, 0, SignedMsgType::Prevote)).await;
    assert_eq!(error_code(&response), Some(2));

    running.stop().await;
}

#[tokio::test]
async fn test_no_failover_when_standby_unreachable() {
    let dir = TempDir::new().unwrap();
    let key_file = write_key_file(dir.path(), CONSENSUS_SEED, keystore::PRIV_KEY_TYPE);
    let (primary, primary_addr) = listener().await;

    // Standby address with nothing listening.
    let (standby, standby_addr) = listener().await;
    drop(standby);

    let settings = Settings::for_tests(
        &primary_addr,
        Some(&standby_addr),
        key_file,
        dir.path().join("kms_state.json"),
    );
    let running = start_signer(&settings);

    let primary_node = Node::accept(&primary, 100).await;
    drop(primary_node);

    // Give the supervisors several retry rounds.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(running.active.current_role().unwrap(), Role::Primary);

    // Primary reconnects and still signs.
    let mut node = Node::accept(&primary, 100).await;
    let response = node.sign_vote(vote(1, 0, SignedMsgType::Prevote)).await;
    assert_eq!(error_code(&response), None);

    running.stop().await;
}

#[tokio::test]
async fn test_role_bound_policy_with_standby_key_file() {
    let dir = TempDir::new().unwrap();
    let key_file = write_key_file(dir.path(), CONSENSUS_SEED, keystore::PRIV_KEY_TYPE);
    let standby_dir = dir.path().join("standby");
    std::fs::create_dir_all(&standby_dir).unwrap();
    let standby_key_file = write_key_file(&standby_dir, 7, keystore::PRIV_KEY_TYPE);
    let (primary, primary_addr) = listener().await;
    let (standby, standby_addr) = listener().await;

    let settings = Settings::for_tests(
        &primary_addr,
        Some(&standby_addr),
        key_file,
        dir.path().join("kms_state.json"),
    )
    .with_pubkey_policy(PubKeyPolicy::RoleBound)
    .with_standby_key_file(standby_key_file);
    let running = start_signer(&settings);

    let mut primary_node = Node::accept(&primary, 100).await;
    let mut standby_node = Node::accept(&standby, 101).await;

    // The standby endpoint authenticated with the key from its own file.
    let standby_key = SigningKey::from_bytes(&[7; 32]).verifying_key();
    assert_eq!(standby_node.channel.remote_public_key(), Some(&standby_key));

    let request = Message::PublicKeyRequest {
        chain_id: CHAIN_ID.to_string(),
    };
    let Message::PublicKeyResponse { key_bytes, .. } = primary_node.request(request.clone()).await
    else {
        panic!("expected public key response");
    };
    assert_eq!(key_bytes, consensus_public_key().as_bytes().to_vec());

    let Message::PublicKeyResponse { key_bytes, .. } = standby_node.request(request).await else {
        panic!("expected public key response");
    };
    assert_eq!(key_bytes, standby_key.as_bytes().to_vec());

    running.stop().await;
}

#[tokio::test]
async fn test_unknown_key_algorithm_rejected_before_dialing() {
    let dir = TempDir::new().unwrap();
    let key_file = write_key_file(dir.path(), CONSENSUS_SEED, "unknown-algo");
    let (primary, primary_addr) = listener().await;
    let settings = Settings::for_tests(
        &primary_addr,
        None,
        key_file,
        dir.path().join("kms_state.json"),
    );

    let err = KeyRing::load(settings.key_file(), None, false).unwrap_err();
    assert!(err.is_fatal());
    assert!(err.to_string().contains("unknown-algo"));

    // Nothing dialed the node.
    let accepted = tokio::time::timeout(Duration::from_millis(100), primary.accept()).await;
    assert!(accepted.is_err());
}
