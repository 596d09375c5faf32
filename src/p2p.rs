//! P2P transport for consensus messages.
//!
//! The BFT engine is agnostic to which transport delivers it bytes; this
//! module provides a length-prefixed framed TCP stream with an X25519
//! key-agreement handshake deriving a per-peer AES-256-GCM session for
//! payload confidentiality. Consensus payloads travel as canonical codec
//! bytes inside a small bincode envelope.
//!
//! Framing: `[u32 BE frame length][12-byte nonce][ciphertext]`, capped at
//! `MAX_NETWORK_MESSAGE_BYTES` plus AEAD overhead.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use x25519_dalek::{EphemeralSecret, PublicKey};

use crate::constants::MAX_NETWORK_MESSAGE_BYTES;

/// Maximum frame size on the wire: payload cap plus AEAD/nonce overhead.
const MAX_FRAME_BYTES: usize = MAX_NETWORK_MESSAGE_BYTES + 128;

/// Wire messages. Consensus objects travel as canonical codec bytes and are
/// decoded at the engine boundary.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Message {
    NewTransaction(Vec<u8>),
    Proposal(Vec<u8>),
    Precommit(Vec<u8>),
    QuorumCertificate(Vec<u8>),
    ViewChange(Vec<u8>),
}

/// Errors from the transport.
#[derive(Debug, thiserror::Error)]
pub enum P2pError {
    #[error("p2p I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame too large: {0}")]
    FrameTooLarge(usize),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("encryption failed")]
    Encryption,
    #[error("message encoding failed: {0}")]
    Encode(String),
}

/// Handle for broadcasting to all connected peers.
#[derive(Clone)]
pub struct P2pHandle {
    broadcast_tx: mpsc::UnboundedSender<Message>,
    peer_count: Arc<AtomicUsize>,
    local_addr: SocketAddr,
}

impl P2pHandle {
    /// Queue a message for broadcast to every connected peer.
    pub fn broadcast(&self, msg: Message) {
        let _ = self.broadcast_tx.send(msg);
    }

    pub fn peer_count(&self) -> usize {
        self.peer_count.load(Ordering::Relaxed)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

type PeerMap = Arc<Mutex<HashMap<SocketAddr, mpsc::UnboundedSender<Message>>>>;

/// Start the transport: bind the listener, dial bootstrap peers, and return
/// a broadcast handle plus the inbound message stream.
pub async fn spawn(
    listen: SocketAddr,
    bootstrap: Vec<SocketAddr>,
    cancel: CancellationToken,
) -> Result<(P2pHandle, mpsc::UnboundedReceiver<Message>), P2pError> {
    let listener = TcpListener::bind(listen).await?;
    let local_addr = listener.local_addr()?;

    let peers: PeerMap = Arc::new(Mutex::new(HashMap::new()));
    let peer_count = Arc::new(AtomicUsize::new(0));
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (broadcast_tx, mut broadcast_rx) = mpsc::unbounded_channel::<Message>();

    // Broadcast fan-out.
    {
        let peers = peers.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    msg = broadcast_rx.recv() => {
                        let Some(msg) = msg else { break };
                        for sender in peers.lock().values() {
                            let _ = sender.send(msg.clone());
                        }
                    }
                }
            }
        });
    }

    // Accept loop (responder side of the handshake).
    {
        let peers = peers.clone();
        let peer_count = peer_count.clone();
        let inbound_tx = inbound_tx.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, addr)) => {
                                spawn_peer(
                                    stream,
                                    addr,
                                    false,
                                    peers.clone(),
                                    peer_count.clone(),
                                    inbound_tx.clone(),
                                    cancel.clone(),
                                );
                            }
                            Err(e) => {
                                tracing::warn!("accept failed: {}", e);
                            }
                        }
                    }
                }
            }
        });
    }

    // Dial bootstrap peers (initiator side).
    for addr in bootstrap {
        let peers = peers.clone();
        let peer_count = peer_count.clone();
        let inbound_tx = inbound_tx.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    spawn_peer(stream, addr, true, peers, peer_count, inbound_tx, cancel);
                }
                Err(e) => {
                    tracing::warn!(peer = %addr, "dial failed: {}", e);
                }
            }
        });
    }

    Ok((
        P2pHandle {
            broadcast_tx,
            peer_count,
            local_addr,
        },
        inbound_rx,
    ))
}

#[allow(clippy::too_many_arguments)]
fn spawn_peer(
    stream: TcpStream,
    addr: SocketAddr,
    initiator: bool,
    peers: PeerMap,
    peer_count: Arc<AtomicUsize>,
    inbound_tx: mpsc::UnboundedSender<Message>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let session = match handshake(stream, initiator).await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(peer = %addr, "handshake failed: {}", e);
                return;
            }
        };
        tracing::info!(peer = %addr, "peer connected");

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        peers.lock().insert(addr, outbound_tx);
        peer_count.fetch_add(1, Ordering::Relaxed);

        let Session {
            reader: mut read_half,
            writer: mut write_half,
            mut send_cipher,
            mut recv_cipher,
        } = session;

        // Writer: drain the per-peer queue.
        let writer_cancel = cancel.clone();
        let writer = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_cancel.cancelled() => break,
                    msg = outbound_rx.recv() => {
                        let Some(msg) = msg else { break };
                        let plaintext = match bincode::serialize(&msg) {
                            Ok(b) => b,
                            Err(e) => {
                                tracing::warn!("encode failed: {}", e);
                                continue;
                            }
                        };
                        if plaintext.len() > MAX_NETWORK_MESSAGE_BYTES {
                            tracing::warn!(len = plaintext.len(), "dropping oversized message");
                            continue;
                        }
                        let frame = match send_cipher.seal(&plaintext) {
                            Ok(f) => f,
                            Err(_) => break,
                        };
                        if write_frame(&mut write_half, &frame).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        // Reader: decrypt frames and forward inbound messages.
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                frame = read_frame(&mut read_half) => {
                    let frame = match frame {
                        Ok(f) => f,
                        Err(_) => break,
                    };
                    let plaintext = match recv_cipher.open(&frame) {
                        Ok(p) => p,
                        Err(_) => {
                            tracing::warn!(peer = %addr, "dropping undecryptable frame");
                            break;
                        }
                    };
                    match bincode::deserialize::<Message>(&plaintext) {
                        Ok(msg) => {
                            if inbound_tx.send(msg).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(peer = %addr, "dropping malformed message: {}", e);
                        }
                    }
                }
            }
        }

        peers.lock().remove(&addr);
        peer_count.fetch_sub(1, Ordering::Relaxed);
        writer.abort();
        tracing::info!(peer = %addr, "peer disconnected");
    });
}

struct Session {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    send_cipher: Cipher,
    recv_cipher: Cipher,
}

/// Exchange ephemeral X25519 public keys and derive the per-direction
/// AES-256-GCM session keys.
async fn handshake(stream: TcpStream, initiator: bool) -> Result<Session, P2pError> {
    let secret = EphemeralSecret::random_from_rng(rand::rngs::OsRng);
    let our_public = PublicKey::from(&secret);

    let (mut reader, mut writer) = stream.into_split();
    write_frame(&mut writer, our_public.as_bytes()).await?;
    let peer_bytes = read_frame(&mut reader).await?;
    let peer_public: [u8; 32] = peer_bytes
        .as_slice()
        .try_into()
        .map_err(|_| P2pError::Handshake("invalid public key length".into()))?;
    let shared = secret.diffie_hellman(&PublicKey::from(peer_public));

    let initiator_key = direction_key(b"ocean.p2p.initiator", shared.as_bytes());
    let responder_key = direction_key(b"ocean.p2p.responder", shared.as_bytes());
    let (send_key, recv_key) = if initiator {
        (initiator_key, responder_key)
    } else {
        (responder_key, initiator_key)
    };

    Ok(Session {
        reader,
        writer,
        send_cipher: Cipher::new(&send_key),
        recv_cipher: Cipher::new(&recv_key),
    })
}

fn direction_key(domain: &[u8], shared: &[u8; 32]) -> [u8; 32] {
    let mut data = Vec::with_capacity(domain.len() + 32);
    data.extend_from_slice(domain);
    data.extend_from_slice(shared);
    crate::sha256(&data)
}

/// Per-direction AEAD with counter nonces.
struct Cipher {
    aead: Aes256Gcm,
    counter: u64,
}

impl Cipher {
    fn new(key: &[u8; 32]) -> Self {
        Cipher {
            aead: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
            counter: 0,
        }
    }

    /// Encrypt; the frame is `nonce ‖ ciphertext`.
    fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, P2pError> {
        let mut nonce_bytes = [0u8; 12];
        nonce_bytes[4..].copy_from_slice(&self.counter.to_be_bytes());
        self.counter += 1;
        let ciphertext = self
            .aead
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|_| P2pError::Encryption)?;
        let mut frame = Vec::with_capacity(12 + ciphertext.len());
        frame.extend_from_slice(&nonce_bytes);
        frame.extend_from_slice(&ciphertext);
        Ok(frame)
    }

    fn open(&mut self, frame: &[u8]) -> Result<Vec<u8>, P2pError> {
        if frame.len() < 12 {
            return Err(P2pError::Encryption);
        }
        let (nonce_bytes, ciphertext) = frame.split_at(12);
        self.aead
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| P2pError::Encryption)
    }
}

async fn write_frame(writer: &mut OwnedWriteHalf, payload: &[u8]) -> Result<(), P2pError> {
    if payload.len() > MAX_FRAME_BYTES {
        return Err(P2pError::FrameTooLarge(payload.len()));
    }
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_frame(reader: &mut OwnedReadHalf) -> Result<Vec<u8>, P2pError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(P2pError::FrameTooLarge(len));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}
