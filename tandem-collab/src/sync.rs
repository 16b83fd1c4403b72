//! Catching up with peers after a partition or on join.
//!
//! Pulls fetch operations from the first reachable participant; pushes
//! flush the outbox of operations that could not be sent live. Neither
//! holds the replica lock while waiting on the network.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use tandem_core::{ChangeOperation, OperationId, UserId};

use crate::error::CollabError;
use crate::protocol::{Envelope, OperationBatch, Payload};
use crate::replica::FileReplica;
use crate::session::EditingSession;
use crate::transport::Transport;

/// Operations fetched from one peer, in that peer's log order.
#[derive(Debug, Clone)]
pub struct PulledBatch {
    pub responder: UserId,
    pub operations: Vec<ChangeOperation>,
}

pub struct SyncCoordinator {
    local: UserId,
    transport: Arc<dyn Transport>,
}

impl SyncCoordinator {
    pub fn new(local: UserId, transport: Arc<dyn Transport>) -> Self {
        Self { local, transport }
    }

    /// Ask participants, lowest id first, for what they have after our
    /// last pull from them. The first one that answers wins.
    pub async fn fetch(
        &self,
        session: &EditingSession,
        replica: &Mutex<FileReplica>,
    ) -> Result<PulledBatch, CollabError> {
        let file_path = session.file_path.clone();
        for peer in session.others(self.local) {
            let (after, seen) = {
                let replica = replica.lock().await;
                (replica.pulled_from(peer), replica.seen_clock())
            };
            let request = Envelope::to(
                self.local,
                peer,
                Payload::PullRequest {
                    file_path: file_path.clone(),
                    after,
                    seen,
                },
            );
            let response = match self.transport.request(peer, request).await {
                Ok(response) => response,
                Err(e) => {
                    log::debug!("Pull of {file_path} from {peer} failed: {e}");
                    continue;
                }
            };
            let batch = match response.payload {
                Payload::PullResponse(batch) => batch,
                _ => return Err(response.unexpected("pull_response").into()),
            };
            let operations = batch.decompress()?;
            log::debug!(
                "Pulled {} operations of {file_path} from {peer} ({:.1}x compressed)",
                operations.len(),
                batch.compression_ratio()
            );
            return Ok(PulledBatch {
                responder: peer,
                operations,
            });
        }
        Err(CollabError::NoReachablePeer(file_path))
    }

    /// Operations a peer has that we do not, without applying them.
    pub async fn pull_changes(
        &self,
        session: &EditingSession,
        replica: &Mutex<FileReplica>,
    ) -> Result<Vec<ChangeOperation>, CollabError> {
        let batch = self.fetch(session, replica).await?;
        let replica = replica.lock().await;
        Ok(batch
            .operations
            .into_iter()
            .filter(|op| !replica.knows(op.id()))
            .collect())
    }

    /// Deliver the outbox to every other participant. Operations leave the
    /// outbox only once all of them accepted the batch.
    pub async fn push_changes(
        &self,
        session: &EditingSession,
        replica: &Mutex<FileReplica>,
    ) -> Result<usize, CollabError> {
        let pending = replica.lock().await.outbox_snapshot();
        if pending.is_empty() {
            return Ok(0);
        }
        let batch = OperationBatch::compress(session.file_path.clone(), &pending)?;

        let mut delivered_to_all = true;
        for peer in session.others(self.local) {
            let request = Envelope::to(self.local, peer, Payload::Push(batch.clone()));
            match self.transport.request(peer, request).await {
                Ok(Envelope {
                    payload: Payload::PushAck { accepted, .. },
                    ..
                }) => {
                    log::debug!("{peer} accepted {accepted} of {} pushed operations", batch.count);
                }
                Ok(other) => {
                    log::warn!("Push to {peer}: {}", other.unexpected("push_ack"));
                    delivered_to_all = false;
                }
                Err(e) => {
                    log::debug!("Push to {peer} failed: {e}");
                    delivered_to_all = false;
                }
            }
        }
        if !delivered_to_all {
            return Ok(0);
        }

        let ids: Vec<_> = pending.iter().map(ChangeOperation::id).collect();
        let removed = replica.lock().await.remove_delivered(&ids);
        log::info!("Flushed {removed} buffered operations of {}", session.file_path);
        Ok(removed)
    }

    /// Rebuild the document from base + log; the replayed text wins.
    pub async fn sync_file(&self, replica: &Mutex<FileReplica>) -> Result<String, CollabError> {
        replica.lock().await.sync()
    }

    /// Answer a pull request with a compressed batch.
    pub fn serve_pull(
        replica: &FileReplica,
        requester: UserId,
        after: Option<OperationId>,
        seen: &HashMap<UserId, u64>,
    ) -> Result<OperationBatch, CollabError> {
        let ops = replica.serve_pull(requester, after, seen);
        Ok(OperationBatch::compress(replica.file_path(), &ops)?)
    }
}
