//! Transfer state machine and registry.
//!
//! `pending -> transferring -> {completed | failed | cancelled}`, with
//! `failed -> transferring` through an explicit [`TransferManager::resume`].

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use portal_shared::chunker::{self, Chunk, ChunkOptions, FileMetadata};
use portal_shared::error::ChunkError;

use crate::error::TransferError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferState {
    Pending,
    Transferring,
    Completed,
    Failed,
    Cancelled,
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Transferring)
    }
}

/// Cumulative chunk counters. Each only ever grows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransferCounters {
    pub sent_chunks: u32,
    pub received_chunks: u32,
    pub failed_chunks: u32,
}

impl TransferCounters {
    fn merge(&mut self, other: &ProgressUpdate) {
        if let Some(n) = other.sent_chunks {
            self.sent_chunks = self.sent_chunks.max(n);
        }
        if let Some(n) = other.received_chunks {
            self.received_chunks = self.received_chunks.max(n);
        }
        if let Some(n) = other.failed_chunks {
            self.failed_chunks = self.failed_chunks.max(n);
        }
    }

    /// `received / (sent + received + failed) * 100`, two decimals.
    pub fn percentage(&self) -> f64 {
        let total = self.sent_chunks as u64 + self.received_chunks as u64 + self.failed_chunks as u64;
        if total == 0 {
            return 0.0;
        }
        let pct = self.received_chunks as f64 / total as f64 * 100.0;
        (pct * 100.0).round() / 100.0
    }
}

/// Cumulative totals supplied by the caller; `None` leaves a counter alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProgressUpdate {
    pub sent_chunks: Option<u32>,
    pub received_chunks: Option<u32>,
    pub failed_chunks: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transfer {
    pub id: String,
    pub file_id: String,
    pub portal_id: String,
    pub sender: String,
    pub recipients: BTreeSet<String>,
    pub filename: String,
    pub size: u64,
    pub state: TransferState,
    pub progress: TransferCounters,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub metadata: FileMetadata,
}

impl Transfer {
    fn finish(&mut self, state: TransferState) -> Result<(), TransferError> {
        if !self.state.is_active() {
            return Err(TransferError::InvalidTransition {
                from: self.state,
                to: state,
            });
        }
        self.state = state;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Reporting snapshot at `now`. Speed is bytes per second, ETA seconds.
    pub fn progress_at(&self, now: DateTime<Utc>) -> TransferProgress {
        let done_chunks = self.progress.sent_chunks.max(self.progress.received_chunks) as u64;
        let bytes_transferred = (done_chunks * self.metadata.chunk_size as u64).min(self.size);

        let elapsed = self
            .started_at
            .map(|start| {
                let end = self.completed_at.unwrap_or(now);
                end.signed_duration_since(start).num_milliseconds().max(0) as f64 / 1000.0
            })
            .unwrap_or(0.0);

        let (speed, eta) = if elapsed > 0.0 {
            let speed = bytes_transferred as f64 / elapsed;
            let eta = if speed > 0.0 {
                (self.size - bytes_transferred) as f64 / speed
            } else {
                0.0
            };
            (speed, eta)
        } else {
            (0.0, 0.0)
        };

        TransferProgress {
            transfer_id: self.id.clone(),
            state: self.state,
            percentage: self.progress.percentage(),
            counters: self.progress,
            total_chunks: self.metadata.total_chunks,
            bytes_transferred,
            elapsed_seconds: elapsed,
            transfer_speed: speed,
            estimated_time_remaining: eta,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferProgress {
    pub transfer_id: String,
    pub state: TransferState,
    pub percentage: f64,
    pub counters: TransferCounters,
    pub total_chunks: u32,
    pub bytes_transferred: u64,
    pub elapsed_seconds: f64,
    /// Bytes per second
    pub transfer_speed: f64,
    /// Seconds
    pub estimated_time_remaining: f64,
}

#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub sender: Option<String>,
    pub recipients: Vec<String>,
    pub chunk_size: Option<usize>,
}

struct TransferEntry {
    transfer: Transfer,
    /// Released once the transfer completes or is cancelled.
    chunks: Arc<Vec<Chunk>>,
    /// Indices the receiver confirmed holding.
    acknowledged: BTreeSet<u32>,
}

impl TransferEntry {
    fn new(transfer: Transfer, chunks: Vec<Chunk>) -> Self {
        Self {
            transfer,
            chunks: Arc::new(chunks),
            acknowledged: BTreeSet::new(),
        }
    }

    fn release_if_done(&mut self) {
        if matches!(
            self.transfer.state,
            TransferState::Completed | TransferState::Cancelled
        ) && !self.chunks.is_empty()
        {
            self.chunks = Arc::new(Vec::new());
            self.acknowledged.clear();
            debug!(transfer = %self.transfer.id, "Released chunk plan");
        }
    }
}

/// Registry of transfers started or received by this endpoint.
#[derive(Clone, Default)]
pub struct TransferManager {
    transfers: Arc<RwLock<HashMap<String, TransferEntry>>>,
    default_chunk_size: Option<usize>,
}

impl TransferManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Chunk size used by `start` when the caller does not pick one.
    pub fn with_chunk_size(chunk_size: usize) -> Self {
        Self {
            default_chunk_size: Some(chunk_size),
            ..Self::default()
        }
    }

    /// Compute the chunk plan for `file_data` and register a pending
    /// transfer. Nothing is transmitted here.
    pub async fn start(
        &self,
        portal_id: &str,
        file_data: Vec<u8>,
        filename: &str,
        opts: StartOptions,
    ) -> Result<Transfer, TransferError> {
        let sender = opts
            .sender
            .filter(|s| !s.trim().is_empty())
            .ok_or(TransferError::SenderRequired)?;

        let name = filename.to_string();
        let chunk_sender = sender.clone();
        let chunk_opts = ChunkOptions {
            chunk_size: opts.chunk_size.or(self.default_chunk_size),
            recipients: opts.recipients,
        };
        let file = tokio::task::spawn_blocking(move || {
            chunker::chunk(&file_data, &name, &chunk_sender, chunk_opts)
        })
        .await
        .map_err(|e| TransferError::Wire(e.to_string()))?
        .map_err(|e| match e {
            ChunkError::SenderRequired => TransferError::SenderRequired,
            other => TransferError::Chunk(other),
        })?;

        let transfer = Transfer {
            id: Uuid::new_v4().to_string(),
            file_id: file.file_id.clone(),
            portal_id: portal_id.to_string(),
            sender,
            recipients: file.metadata.recipients.clone(),
            filename: filename.to_string(),
            size: file.metadata.size,
            state: TransferState::Pending,
            progress: TransferCounters::default(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
            metadata: file.metadata,
        };

        info!(
            transfer = %transfer.id,
            portal = %portal_id,
            file = %transfer.file_id,
            size = transfer.size,
            chunks = transfer.metadata.total_chunks,
            "Transfer created"
        );

        self.transfers.write().await.insert(
            transfer.id.clone(),
            TransferEntry::new(transfer.clone(), file.chunks),
        );
        Ok(transfer)
    }

    /// Track a transfer announced by a remote sender.
    pub async fn register_incoming(
        &self,
        transfer_id: &str,
        portal_id: &str,
        metadata: FileMetadata,
    ) -> Transfer {
        let now = Utc::now();
        let transfer = Transfer {
            id: transfer_id.to_string(),
            file_id: metadata.id.clone(),
            portal_id: portal_id.to_string(),
            sender: metadata.sender.clone(),
            recipients: metadata.recipients.clone(),
            filename: metadata.filename.clone(),
            size: metadata.size,
            state: TransferState::Transferring,
            progress: TransferCounters::default(),
            created_at: now,
            started_at: Some(now),
            completed_at: None,
            error: None,
            metadata,
        };
        self.transfers.write().await.insert(
            transfer.id.clone(),
            TransferEntry::new(transfer.clone(), Vec::new()),
        );
        transfer
    }

    /// Merge cumulative counters. A pending transfer starts transferring.
    pub async fn update_progress(
        &self,
        transfer_id: &str,
        update: ProgressUpdate,
    ) -> Result<Transfer, TransferError> {
        self.with_transfer(transfer_id, |t| {
            t.progress.merge(&update);
            if t.state == TransferState::Pending {
                t.state = TransferState::Transferring;
                t.started_at = Some(Utc::now());
            }
            Ok(())
        })
        .await
    }

    pub async fn complete(&self, transfer_id: &str, success: bool) -> Result<Transfer, TransferError> {
        let state = if success {
            TransferState::Completed
        } else {
            TransferState::Failed
        };
        let transfer = self.with_transfer(transfer_id, |t| t.finish(state)).await?;
        info!(transfer = %transfer_id, state = ?state, "Transfer finished");
        Ok(transfer)
    }

    /// Mark failed and record why.
    pub async fn fail(&self, transfer_id: &str, reason: &str) -> Result<Transfer, TransferError> {
        let transfer = self
            .with_transfer(transfer_id, |t| {
                t.finish(TransferState::Failed)?;
                t.error = Some(reason.to_string());
                Ok(())
            })
            .await?;
        warn!(transfer = %transfer_id, reason, "Transfer failed");
        Ok(transfer)
    }

    /// Stops further chunk transmission. Sent chunks are not rolled back.
    pub async fn cancel(&self, transfer_id: &str) -> Result<Transfer, TransferError> {
        let transfer = self
            .with_transfer(transfer_id, |t| t.finish(TransferState::Cancelled))
            .await?;
        info!(transfer = %transfer_id, "Transfer cancelled");
        Ok(transfer)
    }

    pub async fn resume(&self, transfer_id: &str) -> Result<Transfer, TransferError> {
        let transfer = self
            .with_transfer(transfer_id, |t| {
                if t.state != TransferState::Failed {
                    return Err(TransferError::NotResumable(t.state));
                }
                t.state = TransferState::Transferring;
                t.error = None;
                t.started_at = Some(Utc::now());
                t.completed_at = None;
                Ok(())
            })
            .await?;
        info!(transfer = %transfer_id, "Transfer resumed");
        Ok(transfer)
    }

    pub async fn get(&self, transfer_id: &str) -> Option<Transfer> {
        self.transfers
            .read()
            .await
            .get(transfer_id)
            .map(|e| e.transfer.clone())
    }

    pub async fn progress(&self, transfer_id: &str) -> Result<TransferProgress, TransferError> {
        self.get(transfer_id)
            .await
            .map(|t| t.progress_at(Utc::now()))
            .ok_or_else(|| TransferError::TransferNotFound(transfer_id.to_string()))
    }

    /// Empty for received transfers and once the transfer is completed or
    /// cancelled.
    pub async fn chunk_plan(&self, transfer_id: &str) -> Result<Arc<Vec<Chunk>>, TransferError> {
        self.transfers
            .read()
            .await
            .get(transfer_id)
            .map(|e| e.chunks.clone())
            .ok_or_else(|| TransferError::TransferNotFound(transfer_id.to_string()))
    }

    /// Record that the receiver holds chunk `index`. Ignored once the plan
    /// has been released.
    pub async fn acknowledge(&self, transfer_id: &str, index: u32) -> Result<(), TransferError> {
        let mut transfers = self.transfers.write().await;
        let entry = transfers
            .get_mut(transfer_id)
            .ok_or_else(|| TransferError::TransferNotFound(transfer_id.to_string()))?;
        if (index as usize) < entry.chunks.len() {
            entry.acknowledged.insert(index);
        }
        Ok(())
    }

    /// Chunks of the plan the receiver has not acknowledged yet, in index
    /// order.
    pub async fn outstanding_chunks(&self, transfer_id: &str) -> Result<Vec<Chunk>, TransferError> {
        let transfers = self.transfers.read().await;
        let entry = transfers
            .get(transfer_id)
            .ok_or_else(|| TransferError::TransferNotFound(transfer_id.to_string()))?;
        Ok(entry
            .chunks
            .iter()
            .filter(|c| !entry.acknowledged.contains(&c.index))
            .cloned()
            .collect())
    }

    /// Forget transfers that finished at least `max_age_secs` ago. Returns
    /// how many were removed.
    pub async fn purge_finished(&self, max_age_secs: u64) -> usize {
        let now = Utc::now();
        let max_age = i64::try_from(max_age_secs).unwrap_or(i64::MAX);
        let mut transfers = self.transfers.write().await;
        let before = transfers.len();
        transfers.retain(|_, e| match (e.transfer.state.is_terminal(), e.transfer.completed_at) {
            (true, Some(done)) => now.signed_duration_since(done).num_seconds() < max_age,
            _ => true,
        });
        let removed = before - transfers.len();
        if removed > 0 {
            info!(removed, remaining = transfers.len(), "Purged finished transfers");
        }
        removed
    }

    pub async fn list_for_portal(&self, portal_id: &str) -> Vec<Transfer> {
        self.filtered(|t| t.portal_id == portal_id).await
    }

    pub async fn list_active(&self, portal_id: &str) -> Vec<Transfer> {
        self.filtered(|t| t.portal_id == portal_id && t.state.is_active())
            .await
    }

    async fn filtered(&self, keep: impl Fn(&Transfer) -> bool) -> Vec<Transfer> {
        let transfers = self.transfers.read().await;
        let mut out: Vec<Transfer> = transfers
            .values()
            .map(|e| &e.transfer)
            .filter(|t| keep(t))
            .cloned()
            .collect();
        out.sort_by_key(|t| t.created_at);
        out
    }

    async fn with_transfer(
        &self,
        transfer_id: &str,
        f: impl FnOnce(&mut Transfer) -> Result<(), TransferError>,
    ) -> Result<Transfer, TransferError> {
        let mut transfers = self.transfers.write().await;
        let entry = transfers
            .get_mut(transfer_id)
            .ok_or_else(|| TransferError::TransferNotFound(transfer_id.to_string()))?;
        f(&mut entry.transfer)?;
        entry.release_if_done();
        debug!(transfer = %transfer_id, state = ?entry.transfer.state, "Transfer updated");
        Ok(entry.transfer.clone())
    }

    #[cfg(test)]
    async fn backdate_completion(&self, transfer_id: &str, secs: i64) {
        if let Some(e) = self.transfers.write().await.get_mut(transfer_id) {
            e.transfer.completed_at = e
                .transfer
                .completed_at
                .map(|t| t - chrono::Duration::seconds(secs));
        }
    }
}
