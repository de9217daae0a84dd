//! Moves a transfer's chunks over a peer connection's data channel.
//!
//! The sender encrypts the metadata and every chunk for one peer and pushes
//! them as bincode [`WireMessage`] frames into an outbound channel; the
//! receiver's [`ReceiveBuffer`] decrypts, verifies and buffers them (in any
//! order) and answers each chunk with an ack naming its index. Sending again
//! only repeats chunks the receiver has not acknowledged.

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use portal_media::SignalingSession;
use portal_net::PresenceTracker;
use portal_shared::chunker::{self, Chunk, FileMetadata, ReassembledFile};
use portal_shared::error::CryptoError;
use portal_shared::protocol::{EncryptedMetadata, WireMessage};
use portal_shared::session::SessionStore;

use crate::error::TransferError;
use crate::transfer::{ProgressUpdate, Transfer, TransferManager, TransferState};

/// One message on a named data channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub channel: String,
    pub payload: Bytes,
}

/// Where a transfer goes: which session keys, connection and channel.
#[derive(Debug, Clone)]
pub struct PeerRoute {
    pub session_id: String,
    pub connection_id: String,
    pub peer_id: String,
    pub channel: String,
}

#[derive(Clone)]
pub struct TransferPipeline {
    sessions: SessionStore,
    signaling: SignalingSession,
    presence: PresenceTracker,
    transfers: TransferManager,
}

impl TransferPipeline {
    pub fn new(
        sessions: SessionStore,
        signaling: SignalingSession,
        presence: PresenceTracker,
        transfers: TransferManager,
    ) -> Self {
        Self {
            sessions,
            signaling,
            presence,
            transfers,
        }
    }

    pub fn transfers(&self) -> &TransferManager {
        &self.transfers
    }

    /// Send the offer and every chunk not yet acknowledged. Stops early, without error, when the
    /// transfer is cancelled; any other failure marks the transfer failed.
    pub async fn send(
        &self,
        transfer_id: &str,
        route: &PeerRoute,
        outbound: &mpsc::Sender<Frame>,
    ) -> Result<Transfer, TransferError> {
        let transfer = self
            .transfers
            .get(transfer_id)
            .await
            .ok_or_else(|| TransferError::TransferNotFound(transfer_id.to_string()))?;
        if !transfer.state.is_active() {
            return Err(TransferError::InvalidTransition {
                from: transfer.state,
                to: TransferState::Transferring,
            });
        }

        let conn = self.signaling.get_connection(&route.connection_id).await?;
        if !conn.is_channel_open(&route.channel) {
            return Err(TransferError::ChannelNotOpen {
                connection_id: route.connection_id.clone(),
                channel: route.channel.clone(),
            });
        }

        match self.send_chunks(&transfer, route, outbound).await {
            Ok(t) => Ok(t),
            Err(e) => {
                if let Err(fail_err) = self.transfers.fail(transfer_id, &e.to_string()).await {
                    debug!(transfer = %transfer_id, error = %fail_err, "Could not mark transfer failed");
                }
                Err(e)
            }
        }
    }

    async fn send_chunks(
        &self,
        transfer: &Transfer,
        route: &PeerRoute,
        outbound: &mpsc::Sender<Frame>,
    ) -> Result<Transfer, TransferError> {
        let outstanding = self.transfers.outstanding_chunks(&transfer.id).await?;

        let offer = self
            .sessions
            .encrypt_metadata(&route.session_id, &transfer.metadata, &route.peer_id)
            .await?;
        self.emit(
            route,
            outbound,
            &WireMessage::FileOffer {
                transfer_id: transfer.id.clone(),
                metadata: offer,
            },
        )
        .await?;

        let mut current = self
            .transfers
            .update_progress(
                &transfer.id,
                ProgressUpdate {
                    sent_chunks: Some(transfer.progress.sent_chunks),
                    ..Default::default()
                },
            )
            .await?;

        info!(
            transfer = %transfer.id,
            peer = %route.peer_id,
            outstanding = outstanding.len(),
            total = transfer.metadata.total_chunks,
            "Sending transfer"
        );

        if transfer.metadata.total_chunks == 0 {
            return self.transfers.complete(&transfer.id, true).await;
        }

        for chunk in outstanding {
            let state = self
                .transfers
                .get(&transfer.id)
                .await
                .map(|t| t.state)
                .unwrap_or(TransferState::Cancelled);
            if state == TransferState::Cancelled {
                self.emit(
                    route,
                    outbound,
                    &WireMessage::Cancel {
                        transfer_id: transfer.id.clone(),
                    },
                )
                .await?;
                info!(transfer = %transfer.id, at_chunk = chunk.index, "Stopped cancelled transfer");
                return self
                    .transfers
                    .get(&transfer.id)
                    .await
                    .ok_or_else(|| TransferError::TransferNotFound(transfer.id.clone()));
            }

            let index = chunk.index;
            let encrypted = self
                .sessions
                .encrypt_chunk(&route.session_id, chunk, &route.peer_id)
                .await?;
            self.emit(
                route,
                outbound,
                &WireMessage::FileChunk {
                    transfer_id: transfer.id.clone(),
                    chunk: encrypted,
                },
            )
            .await?;

            current = self
                .transfers
                .update_progress(
                    &transfer.id,
                    ProgressUpdate {
                        sent_chunks: Some(index + 1),
                        ..Default::default()
                    },
                )
                .await?;
        }

        self.touch_peer(&transfer.portal_id, &route.peer_id).await;
        Ok(current)
    }

    /// Apply a receiver's ack. Completes the transfer once every chunk is
    /// acknowledged.
    pub async fn handle_ack(&self, route: &PeerRoute, payload: &[u8]) -> Result<Transfer, TransferError> {
        let (transfer_id, index, received, failed) = match WireMessage::from_bytes(payload)? {
            WireMessage::Ack {
                transfer_id,
                index,
                received_chunks,
                failed_chunks,
            } => (transfer_id, index, received_chunks, failed_chunks),
            other => {
                return Err(TransferError::UnexpectedFrame(format!(
                    "expected ack for {}",
                    other.transfer_id()
                )))
            }
        };

        self.signaling
            .record_traffic(&route.connection_id, 0, payload.len() as u64)
            .await?;
        if let Some(index) = index {
            self.transfers.acknowledge(&transfer_id, index).await?;
        }

        let transfer = self
            .transfers
            .update_progress(
                &transfer_id,
                ProgressUpdate {
                    received_chunks: Some(received),
                    failed_chunks: Some(failed),
                    ..Default::default()
                },
            )
            .await?;
        self.touch_peer(&transfer.portal_id, &route.peer_id).await;

        if transfer.state == TransferState::Transferring
            && transfer.progress.received_chunks >= transfer.metadata.total_chunks
        {
            return self.transfers.complete(&transfer_id, true).await;
        }
        Ok(transfer)
    }

    async fn emit(
        &self,
        route: &PeerRoute,
        outbound: &mpsc::Sender<Frame>,
        message: &WireMessage,
    ) -> Result<(), TransferError> {
        let bytes = message.to_bytes()?;
        let len = bytes.len() as u64;
        outbound
            .send(Frame {
                channel: route.channel.clone(),
                payload: Bytes::from(bytes),
            })
            .await
            .map_err(|_| TransferError::ChannelClosed)?;
        self.signaling
            .record_traffic(&route.connection_id, len, 0)
            .await?;
        Ok(())
    }

    async fn touch_peer(&self, portal_id: &str, peer_id: &str) {
        if let Err(e) = self.presence.touch(portal_id, peer_id).await {
            debug!(error = %e, "Transfer peer is not tracked");
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveEvent {
    Offered {
        transfer_id: String,
        metadata: FileMetadata,
    },
    Progress {
        transfer_id: String,
        received_chunks: u32,
        total_chunks: u32,
    },
    /// The chunk failed authentication or its checksum; the sender will
    /// repeat it on its next send.
    ChunkRejected {
        transfer_id: String,
        index: u32,
        error: TransferError,
    },
    Completed {
        transfer_id: String,
        file: ReassembledFile,
    },
    Cancelled {
        transfer_id: String,
    },
    /// A frame arrived for a transfer this side already finished.
    AlreadyFinished {
        transfer_id: String,
        state: TransferState,
    },
}

/// Result of handling one frame: what happened plus the ack to send back.
#[derive(Debug, Clone)]
pub struct Received {
    pub event: ReceiveEvent,
    pub ack: Option<Bytes>,
}

struct Incoming {
    metadata: FileMetadata,
    chunks: BTreeMap<u32, Chunk>,
    failed: u32,
}

/// Receiving side for frames arriving from one remote peer.
pub struct ReceiveBuffer {
    sessions: SessionStore,
    transfers: TransferManager,
    session_id: String,
    portal_id: String,
    peer_id: String,
    incoming: HashMap<String, Incoming>,
}

impl ReceiveBuffer {
    pub fn new(
        sessions: SessionStore,
        transfers: TransferManager,
        session_id: &str,
        portal_id: &str,
        peer_id: &str,
    ) -> Self {
        Self {
            sessions,
            transfers,
            session_id: session_id.to_string(),
            portal_id: portal_id.to_string(),
            peer_id: peer_id.to_string(),
            incoming: HashMap::new(),
        }
    }

    pub async fn handle(&mut self, payload: &[u8]) -> Result<Received, TransferError> {
        match WireMessage::from_bytes(payload)? {
            WireMessage::FileOffer {
                transfer_id,
                metadata,
            } => self.on_offer(transfer_id, &metadata).await,
            WireMessage::FileChunk { transfer_id, chunk } => {
                let Some(entry) = self.incoming.get(&transfer_id) else {
                    return self.finished_chunk(transfer_id, chunk.index).await;
                };
                let total = entry.metadata.total_chunks;
                let index = chunk.index;
                if index >= total || chunk.file_id != entry.metadata.id {
                    return Err(TransferError::UnexpectedFrame(format!(
                        "chunk {index} of file {} does not belong to transfer {transfer_id}",
                        chunk.file_id
                    )));
                }

                let chunk = match self
                    .sessions
                    .decrypt_chunk(&self.session_id, chunk, &self.peer_id)
                    .await
                {
                    Ok(c) => c,
                    Err(CryptoError::DecryptionFailed) => {
                        warn!(transfer = %transfer_id, index, "Rejected chunk that failed authentication");
                        return self
                            .reject(transfer_id, index, CryptoError::DecryptionFailed.into())
                            .await;
                    }
                    Err(e) => return Err(e.into()),
                };
                if let Err(e) = chunker::validate_chunk(&chunk) {
                    warn!(transfer = %transfer_id, index, "Rejected chunk with a bad checksum");
                    return self.reject(transfer_id, index, e.into()).await;
                }

                let (received, failed) = match self.incoming.get_mut(&transfer_id) {
                    Some(entry) => {
                        entry.chunks.insert(chunk.index, chunk);
                        (entry.chunks.len() as u32, entry.failed)
                    }
                    None => return Err(TransferError::TransferNotFound(transfer_id)),
                };
                self.transfers
                    .update_progress(
                        &transfer_id,
                        ProgressUpdate {
                            received_chunks: Some(received),
                            ..Default::default()
                        },
                    )
                    .await?;

                let ack = ack(&transfer_id, Some(index), received, failed)?;
                if received >= total {
                    return self.finish(transfer_id, ack).await;
                }
                Ok(Received {
                    event: ReceiveEvent::Progress {
                        transfer_id,
                        received_chunks: received,
                        total_chunks: total,
                    },
                    ack: Some(ack),
                })
            }
            WireMessage::Cancel { transfer_id } => {
                self.incoming.remove(&transfer_id);
                if let Err(e) = self.transfers.cancel(&transfer_id).await {
                    debug!(transfer = %transfer_id, error = %e, "Cancel for inactive transfer");
                }
                Ok(Received {
                    event: ReceiveEvent::Cancelled { transfer_id },
                    ack: None,
                })
            }
            WireMessage::Ack { transfer_id, .. } => Err(TransferError::UnexpectedFrame(format!(
                "ack for {transfer_id} on receiving side"
            ))),
        }
    }

    async fn on_offer(
        &mut self,
        transfer_id: String,
        encrypted: &EncryptedMetadata,
    ) -> Result<Received, TransferError> {
        let metadata = self
            .sessions
            .decrypt_metadata(&self.session_id, encrypted, &self.peer_id)
            .await?;

        // A resumed sender repeats its offer; keep what already arrived.
        if !self.incoming.contains_key(&transfer_id) {
            match self.transfers.get(&transfer_id).await {
                Some(known) if known.state.is_terminal() => {
                    debug!(transfer = %transfer_id, state = ?known.state, "Offer for finished transfer");
                    return self.already_finished(&known, None);
                }
                Some(_) => {}
                None => {
                    self.transfers
                        .register_incoming(&transfer_id, &self.portal_id, metadata.clone())
                        .await;
                }
            }
            info!(
                transfer = %transfer_id,
                file = %metadata.filename,
                size = metadata.size,
                "Incoming transfer offered"
            );
            self.incoming.insert(
                transfer_id.clone(),
                Incoming {
                    metadata: metadata.clone(),
                    chunks: BTreeMap::new(),
                    failed: 0,
                },
            );
        }

        if metadata.total_chunks == 0 {
            let ack = ack(&transfer_id, None, 0, 0)?;
            return self.finish(transfer_id, ack).await;
        }

        Ok(Received {
            event: ReceiveEvent::Offered {
                transfer_id,
                metadata,
            },
            ack: None,
        })
    }

    async fn finish(&mut self, transfer_id: String, ack: Bytes) -> Result<Received, TransferError> {
        let entry = self
            .incoming
            .remove(&transfer_id)
            .ok_or_else(|| TransferError::TransferNotFound(transfer_id.clone()))?;
        let chunks: Vec<Chunk> = entry.chunks.into_values().collect();

        match chunker::reassemble(&chunks, &entry.metadata) {
            Ok(file) => {
                self.transfers.complete(&transfer_id, true).await?;
                info!(transfer = %transfer_id, size = file.size, "Transfer received and verified");
                Ok(Received {
                    event: ReceiveEvent::Completed { transfer_id, file },
                    ack: Some(ack),
                })
            }
            Err(e) => {
                self.transfers.fail(&transfer_id, &e.to_string()).await?;
                Err(e.into())
            }
        }
    }

    /// Completed transfers are re-acknowledged in full so a sender that
    /// missed the final ack can finish. Other finished states get no reply.
    fn already_finished(&self, transfer: &Transfer, index: Option<u32>) -> Result<Received, TransferError> {
        let ack = match transfer.state {
            TransferState::Completed => Some(ack(
                &transfer.id,
                index,
                transfer.metadata.total_chunks,
                transfer.progress.failed_chunks,
            )?),
            _ => None,
        };
        Ok(Received {
            event: ReceiveEvent::AlreadyFinished {
                transfer_id: transfer.id.clone(),
                state: transfer.state,
            },
            ack,
        })
    }

    async fn finished_chunk(&self, transfer_id: String, index: u32) -> Result<Received, TransferError> {
        match self.transfers.get(&transfer_id).await {
            Some(known) if known.state == TransferState::Completed => {
                self.already_finished(&known, Some(index))
            }
            _ => Err(TransferError::UnexpectedFrame(format!(
                "chunk for unknown transfer {transfer_id}"
            ))),
        }
    }

    async fn reject(
        &mut self,
        transfer_id: String,
        index: u32,
        error: TransferError,
    ) -> Result<Received, TransferError> {
        let failed = self.record_failure(&transfer_id).await?;
        let received = self.received_count(&transfer_id);
        let ack = ack(&transfer_id, None, received, failed)?;
        Ok(Received {
            event: ReceiveEvent::ChunkRejected {
                transfer_id,
                index,
                error,
            },
            ack: Some(ack),
        })
    }

    async fn record_failure(&mut self, transfer_id: &str) -> Result<u32, TransferError> {
        let failed = match self.incoming.get_mut(transfer_id) {
            Some(entry) => {
                entry.failed += 1;
                entry.failed
            }
            None => return Err(TransferError::TransferNotFound(transfer_id.to_string())),
        };
        self.transfers
            .update_progress(
                transfer_id,
                ProgressUpdate {
                    failed_chunks: Some(failed),
                    ..Default::default()
                },
            )
            .await?;
        Ok(failed)
    }

    fn received_count(&self, transfer_id: &str) -> u32 {
        self.incoming
            .get(transfer_id)
            .map(|e| e.chunks.len() as u32)
            .unwrap_or(0)
    }

    /// Transfers announced but not yet complete.
    pub fn pending(&self) -> Vec<String> {
        self.incoming.keys().cloned().collect()
    }
}

fn ack(
    transfer_id: &str,
    index: Option<u32>,
    received_chunks: u32,
    failed_chunks: u32,
) -> Result<Bytes, TransferError> {
    let bytes = WireMessage::Ack {
        transfer_id: transfer_id.to_string(),
        index,
        received_chunks,
        failed_chunks,
    }
    .to_bytes()?;
    Ok(Bytes::from(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use portal_media::signaling::ConnectionOptions;
    use portal_media::SessionDescription;
    use portal_net::TrackOptions;
    use portal_shared::constants::FILE_TRANSFER_CHANNEL;
    use portal_shared::error::ChunkError;

    use crate::transfer::StartOptions;

    const PORTAL: &str = "portal-1";
    const ANSWER: &str = "v=0\r\no=- 9 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\nm=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n";

    struct Harness {
        alice: TransferPipeline,
        route: PeerRoute,
        bob: ReceiveBuffer,
        bob_transfers: TransferManager,
    }

    async fn harness(answered: bool) -> Harness {
        let alice_sessions = SessionStore::new();
        let bob_sessions = SessionStore::new();
        let a = alice_sessions.init_session(PORTAL, "0xalice", None).await;
        let b = bob_sessions.init_session(PORTAL, "0xbob", None).await;
        alice_sessions
            .exchange_keys(&a.session_id, "bob", b.public_key().to_vec(), "0xbob")
            .await
            .unwrap();
        bob_sessions
            .exchange_keys(&b.session_id, "alice", a.public_key().to_vec(), "0xalice")
            .await
            .unwrap();

        let signaling = SignalingSession::new();
        let conn = signaling
            .create_connection(
                "bob",
                ConnectionOptions {
                    portal_id: Some(PORTAL.into()),
                    wallet_address: Some("0xalice".into()),
                },
            )
            .await
            .unwrap();
        signaling
            .create_offer(&conn.id, &[FILE_TRANSFER_CHANNEL.to_string()])
            .await
            .unwrap();
        if answered {
            signaling
                .process_answer(&conn.id, SessionDescription::answer(ANSWER))
                .await
                .unwrap();
        }

        let presence = PresenceTracker::new();
        presence
            .track(
                PORTAL,
                "bob",
                TrackOptions {
                    wallet_address: Some("0xbob".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let bob_transfers = TransferManager::new();
        Harness {
            alice: TransferPipeline::new(alice_sessions, signaling, presence, TransferManager::new()),
            route: PeerRoute {
                session_id: a.session_id,
                connection_id: conn.id,
                peer_id: "bob".into(),
                channel: FILE_TRANSFER_CHANNEL.into(),
            },
            bob: ReceiveBuffer::new(bob_sessions, bob_transfers.clone(), &b.session_id, PORTAL, "alice"),
            bob_transfers,
        }
    }

    fn payload() -> Vec<u8> {
        (0..1000u32).map(|i| (i % 251) as u8).collect()
    }

    async fn start(h: &Harness, data: Vec<u8>) -> Transfer {
        h.alice
            .transfers()
            .start(
                PORTAL,
                data,
                "payload.bin",
                StartOptions {
                    sender: Some("0xalice".into()),
                    recipients: vec!["0xbob".into()],
                    chunk_size: Some(64),
                },
            )
            .await
            .unwrap()
    }

    fn drain(rx: &mut mpsc::Receiver<Frame>) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(f) = rx.try_recv() {
            frames.push(f);
        }
        frames
    }

    /// Feed frames to the receiver and its acks back to the sender.
    async fn deliver(h: &mut Harness, frames: &[Frame]) -> Vec<ReceiveEvent> {
        let mut events = Vec::new();
        for frame in frames {
            let received = h.bob.handle(&frame.payload).await.unwrap();
            if let Some(ack) = received.ack {
                h.alice.handle_ack(&h.route, &ack).await.unwrap();
            }
            events.push(received.event);
        }
        events
    }

    fn chunk_index(frame: &Frame) -> u32 {
        match WireMessage::from_bytes(&frame.payload).unwrap() {
            WireMessage::FileChunk { chunk, .. } => chunk.index,
            other => panic!("unexpected frame {other:?}"),
        }
    }

    fn is_completed(events: &[ReceiveEvent]) -> bool {
        events
            .iter()
            .any(|e| matches!(e, ReceiveEvent::Completed { .. }))
    }

    #[tokio::test]
    async fn test_end_to_end_transfer() {
        let mut h = harness(true).await;
        let t = start(&h, payload()).await;
        let (tx, mut rx) = mpsc::channel(64);

        let sent = h.alice.send(&t.id, &h.route, &tx).await.unwrap();
        assert_eq!(sent.state, TransferState::Transferring);
        assert_eq!(sent.progress.sent_chunks, 16);

        let mut completed = None;
        for frame in drain(&mut rx) {
            assert_eq!(frame.channel, FILE_TRANSFER_CHANNEL);
            let received = h.bob.handle(&frame.payload).await.unwrap();
            if let Some(ack) = received.ack {
                h.alice.handle_ack(&h.route, &ack).await.unwrap();
            }
            if let ReceiveEvent::Completed { file, .. } = received.event {
                completed = Some(file);
            }
        }

        let file = completed.expect("transfer should complete");
        assert_eq!(file.data, payload());
        assert!(file.verified);

        let alice_view = h.alice.transfers().get(&t.id).await.unwrap();
        assert_eq!(alice_view.state, TransferState::Completed);
        assert_eq!(alice_view.progress.received_chunks, 16);
        assert_eq!(
            h.bob_transfers.get(&t.id).await.unwrap().state,
            TransferState::Completed
        );

        let stats = h.alice.signaling.get_stats(&h.route.connection_id).await.unwrap();
        assert!(stats.bytes_sent > 1000);
        assert!(stats.bytes_received > 0);
    }

    #[tokio::test]
    async fn test_out_of_order_delivery() {
        let mut h = harness(true).await;
        let t = start(&h, payload()).await;
        let (tx, mut rx) = mpsc::channel(64);
        h.alice.send(&t.id, &h.route, &tx).await.unwrap();

        let mut frames = drain(&mut rx);
        let offer = frames.remove(0);
        frames.reverse();

        h.bob.handle(&offer.payload).await.unwrap();
        let mut last = None;
        for frame in frames {
            last = Some(h.bob.handle(&frame.payload).await.unwrap().event);
        }
        assert!(matches!(last, Some(ReceiveEvent::Completed { .. })));
    }

    #[tokio::test]
    async fn test_channel_must_be_open() {
        let h = harness(false).await;
        let t = start(&h, payload()).await;
        let (tx, _rx) = mpsc::channel(64);

        let err = h.alice.send(&t.id, &h.route, &tx).await.unwrap_err();
        assert!(matches!(err, TransferError::ChannelNotOpen { .. }));
        assert_eq!(
            h.alice.transfers().get(&t.id).await.unwrap().state,
            TransferState::Pending
        );
    }

    #[tokio::test]
    async fn test_closed_channel_then_resume() {
        let mut h = harness(true).await;
        let t = start(&h, payload()).await;

        let (tx, rx) = mpsc::channel(64);
        drop(rx);
        let err = h.alice.send(&t.id, &h.route, &tx).await.unwrap_err();
        assert_eq!(err, TransferError::ChannelClosed);

        let failed = h.alice.transfers().get(&t.id).await.unwrap();
        assert_eq!(failed.state, TransferState::Failed);
        assert!(failed.error.is_some());
        assert!(err.class().is_resumable());

        h.alice.transfers().resume(&t.id).await.unwrap();
        let (tx, mut rx) = mpsc::channel(64);
        h.alice.send(&t.id, &h.route, &tx).await.unwrap();

        let mut done = false;
        for frame in drain(&mut rx) {
            let r = h.bob.handle(&frame.payload).await.unwrap();
            done |= matches!(r.event, ReceiveEvent::Completed { .. });
        }
        assert!(done);
    }

    #[tokio::test]
    async fn test_cancelled_transfer_not_sent() {
        let h = harness(true).await;
        let t = start(&h, payload()).await;
        h.alice.transfers().cancel(&t.id).await.unwrap();

        let (tx, mut rx) = mpsc::channel(64);
        assert!(matches!(
            h.alice.send(&t.id, &h.route, &tx).await,
            Err(TransferError::InvalidTransition { .. })
        ));
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_receiver_cancel_and_tamper() {
        let mut h = harness(true).await;
        let t = start(&h, payload()).await;
        let (tx, mut rx) = mpsc::channel(64);
        h.alice.send(&t.id, &h.route, &tx).await.unwrap();
        let frames = drain(&mut rx);

        h.bob.handle(&frames[0].payload).await.unwrap();

        let mut tampered = match WireMessage::from_bytes(&frames[1].payload).unwrap() {
            WireMessage::FileChunk { transfer_id, mut chunk } => {
                chunk.encrypted_data[0] ^= 0xFF;
                WireMessage::FileChunk { transfer_id, chunk }
            }
            other => panic!("unexpected frame {other:?}"),
        }
        .to_bytes()
        .unwrap();
        let r = h.bob.handle(&tampered).await.unwrap();
        assert!(matches!(r.event, ReceiveEvent::ChunkRejected { index: 0, .. }));
        let view = h.alice.handle_ack(&h.route, r.ack.as_ref().unwrap()).await.unwrap();
        assert_eq!(view.progress.failed_chunks, 1);

        tampered = WireMessage::Cancel {
            transfer_id: t.id.clone(),
        }
        .to_bytes()
        .unwrap();
        let r = h.bob.handle(&tampered).await.unwrap();
        assert!(matches!(r.event, ReceiveEvent::Cancelled { .. }));
        assert!(h.bob.pending().is_empty());
        assert_eq!(
            h.bob_transfers.get(&t.id).await.unwrap().state,
            TransferState::Cancelled
        );

        let r = h.bob.handle(&frames[0].payload).await.unwrap();
        assert_eq!(
            r.event,
            ReceiveEvent::AlreadyFinished {
                transfer_id: t.id.clone(),
                state: TransferState::Cancelled,
            }
        );
        assert!(r.ack.is_none());

        assert!(matches!(
            h.bob.handle(&frames[2].payload).await,
            Err(TransferError::UnexpectedFrame(_))
        ));
    }

    #[tokio::test]
    async fn test_empty_file() {
        let mut h = harness(true).await;
        let t = start(&h, Vec::new()).await;
        let (tx, mut rx) = mpsc::channel(4);

        let sent = h.alice.send(&t.id, &h.route, &tx).await.unwrap();
        assert_eq!(sent.state, TransferState::Completed);

        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 1);
        let r = h.bob.handle(&frames[0].payload).await.unwrap();
        match r.event {
            ReceiveEvent::Completed { file, .. } => assert!(file.data.is_empty()),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_lost_chunk_resent_after_resume() {
        let mut h = harness(true).await;
        let t = start(&h, payload()).await;
        let (tx, mut rx) = mpsc::channel(64);
        h.alice.send(&t.id, &h.route, &tx).await.unwrap();

        let mut frames = drain(&mut rx);
        assert_eq!(frames.len(), 17);
        let lost = frames.remove(6);
        assert_eq!(chunk_index(&lost), 5);
        assert!(!is_completed(&deliver(&mut h, &frames).await));

        let stalled = h.alice.transfers().get(&t.id).await.unwrap();
        assert_eq!(stalled.state, TransferState::Transferring);
        assert_eq!(stalled.progress.received_chunks, 15);

        h.alice.transfers().fail(&t.id, "ack timeout").await.unwrap();
        h.alice.transfers().resume(&t.id).await.unwrap();
        h.alice.send(&t.id, &h.route, &tx).await.unwrap();

        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 2);
        assert_eq!(chunk_index(&frames[1]), 5);
        let events = deliver(&mut h, &frames).await;
        assert!(matches!(events[0], ReceiveEvent::Offered { .. }));
        assert!(is_completed(&events));

        assert_eq!(
            h.alice.transfers().get(&t.id).await.unwrap().state,
            TransferState::Completed
        );
        assert!(h.alice.transfers().chunk_plan(&t.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_chunk_resent() {
        let mut h = harness(true).await;
        let t = start(&h, payload()).await;
        let (tx, mut rx) = mpsc::channel(64);
        h.alice.send(&t.id, &h.route, &tx).await.unwrap();

        let mut frames = drain(&mut rx);
        let tampered = match WireMessage::from_bytes(&frames[3].payload).unwrap() {
            WireMessage::FileChunk { transfer_id, mut chunk } => {
                chunk.tag[0] ^= 0x01;
                WireMessage::FileChunk { transfer_id, chunk }
            }
            other => panic!("unexpected frame {other:?}"),
        };
        frames[3].payload = Bytes::from(tampered.to_bytes().unwrap());

        let events = deliver(&mut h, &frames).await;
        assert!(!is_completed(&events));
        assert!(events.contains(&ReceiveEvent::ChunkRejected {
            transfer_id: t.id.clone(),
            index: 2,
            error: TransferError::Crypto(CryptoError::DecryptionFailed),
        }));

        let view = h.alice.transfers().get(&t.id).await.unwrap();
        assert_eq!(view.state, TransferState::Transferring);
        assert_eq!(view.progress.failed_chunks, 1);

        h.alice.send(&t.id, &h.route, &tx).await.unwrap();
        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 2);
        assert_eq!(chunk_index(&frames[1]), 2);
        assert!(is_completed(&deliver(&mut h, &frames).await));
        assert_eq!(
            h.alice.transfers().get(&t.id).await.unwrap().state,
            TransferState::Completed
        );
    }

    #[tokio::test]
    async fn test_bad_checksum_rejected() {
        let mut h = harness(true).await;
        let t = start(&h, payload()).await;
        let (tx, mut rx) = mpsc::channel(64);
        h.alice.send(&t.id, &h.route, &tx).await.unwrap();
        let frames = drain(&mut rx);
        h.bob.handle(&frames[0].payload).await.unwrap();

        let mut corrupt = h.alice.transfers().chunk_plan(&t.id).await.unwrap()[0].clone();
        corrupt.checksum = "00".repeat(32);
        let encrypted = h
            .alice
            .sessions
            .encrypt_chunk(&h.route.session_id, corrupt, "bob")
            .await
            .unwrap();
        let payload = WireMessage::FileChunk {
            transfer_id: t.id.clone(),
            chunk: encrypted,
        }
        .to_bytes()
        .unwrap();

        let r = h.bob.handle(&payload).await.unwrap();
        match r.event {
            ReceiveEvent::ChunkRejected { index, error, .. } => {
                assert_eq!(index, 0);
                assert!(matches!(
                    error,
                    TransferError::Chunk(ChunkError::InvalidChecksum { .. })
                ));
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(h.bob_transfers.get(&t.id).await.unwrap().progress.failed_chunks, 1);

        // The genuine chunk is still accepted afterwards.
        let r = h.bob.handle(&frames[1].payload).await.unwrap();
        assert!(matches!(r.event, ReceiveEvent::Progress { received_chunks: 1, .. }));
    }

    #[tokio::test]
    async fn test_chunk_outside_transfer_refused() {
        let mut h = harness(true).await;
        let t = start(&h, payload()).await;
        let (tx, mut rx) = mpsc::channel(64);
        h.alice.send(&t.id, &h.route, &tx).await.unwrap();
        let frames = drain(&mut rx);
        h.bob.handle(&frames[0].payload).await.unwrap();

        let altered = |f: fn(&mut portal_shared::protocol::EncryptedChunk)| {
            match WireMessage::from_bytes(&frames[1].payload).unwrap() {
                WireMessage::FileChunk { transfer_id, mut chunk } => {
                    f(&mut chunk);
                    WireMessage::FileChunk { transfer_id, chunk }.to_bytes().unwrap()
                }
                other => panic!("unexpected frame {other:?}"),
            }
        };

        for payload in [
            altered(|c| c.index = 16),
            altered(|c| c.index = u32::MAX),
            altered(|c| c.file_id = "another-file".into()),
        ] {
            assert!(matches!(
                h.bob.handle(&payload).await,
                Err(TransferError::UnexpectedFrame(_))
            ));
        }

        let view = h.bob_transfers.get(&t.id).await.unwrap();
        assert_eq!(view.progress.failed_chunks, 0);
        assert_eq!(view.progress.received_chunks, 0);
        assert_eq!(h.bob.pending(), vec![t.id.clone()]);
    }

    #[tokio::test]
    async fn test_repeat_after_completion_is_reacknowledged() {
        let mut h = harness(true).await;
        let t = start(&h, payload()).await;
        let (tx, mut rx) = mpsc::channel(64);
        h.alice.send(&t.id, &h.route, &tx).await.unwrap();

        // The final ack never reaches the sender.
        let frames = drain(&mut rx);
        let (last, rest) = frames.split_last().unwrap();
        deliver(&mut h, rest).await;
        let r = h.bob.handle(&last.payload).await.unwrap();
        assert!(matches!(r.event, ReceiveEvent::Completed { .. }));
        assert_eq!(
            h.alice.transfers().get(&t.id).await.unwrap().state,
            TransferState::Transferring
        );

        h.alice.send(&t.id, &h.route, &tx).await.unwrap();
        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 2);

        let r = h.bob.handle(&frames[0].payload).await.unwrap();
        assert_eq!(
            r.event,
            ReceiveEvent::AlreadyFinished {
                transfer_id: t.id.clone(),
                state: TransferState::Completed,
            }
        );
        let done = h.alice.handle_ack(&h.route, &r.ack.unwrap()).await.unwrap();
        assert_eq!(done.state, TransferState::Completed);

        let r = h.bob.handle(&frames[1].payload).await.unwrap();
        assert!(matches!(r.event, ReceiveEvent::AlreadyFinished { .. }));
        let again = h.alice.handle_ack(&h.route, &r.ack.unwrap()).await.unwrap();
        assert_eq!(again.state, TransferState::Completed);
        assert!(h.bob.pending().is_empty());
    }
}
