// ordered apply pipeline
// connection tasks only ever enqueue. a single worker owns the aggregate,
// applies pending updates in ascending `(lamport, source_id, arrival_seq)`
// order, persists, and then raises the watermark of the synchronizer
use std::{
    cmp::{Ordering, Reverse},
    collections::BinaryHeap,
    fmt::Debug,
    sync::{
        atomic::{AtomicU64, Ordering::SeqCst},
        Arc, PoisonError, RwLock,
    },
};

use tokio::sync::{
    mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    oneshot,
};
use tracing::{debug, warn};

use crate::{
    clock::LogicalTime,
    expiry::unix_millis,
    register::{Aggregate, Reading, Resolution, StoredRecord},
    snapshot::FileSnapshotStore,
    sync::Synchronizer,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingUpdate {
    pub entity_id: String,
    pub payload: Reading,
    pub source_id: String,
    pub lamport: LogicalTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Applied {
    pub resolution: Resolution,
    // the store was empty and this update created its first record
    pub first_write: bool,
    pub lamport: LogicalTime,
}

struct Queued {
    update: PendingUpdate,
    arrival_seq: u64,
    reply: oneshot::Sender<Applied>,
}

impl Debug for Queued {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queued")
            .field("update", &self.update)
            .field("arrival_seq", &self.arrival_seq)
            .finish_non_exhaustive()
    }
}

impl Queued {
    fn key(&self) -> (LogicalTime, &[u8], u64) {
        (
            self.update.lamport,
            self.update.source_id.as_bytes(),
            self.arrival_seq,
        )
    }
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

#[derive(Debug, Clone)]
pub struct Enqueue {
    sender: UnboundedSender<Queued>,
    arrival_seq: Arc<AtomicU64>,
    last_enqueued: Arc<AtomicU64>,
}

impl Enqueue {
    /// Hands `update` to the worker without blocking. The returned receiver
    /// resolves once the update is applied.
    pub fn enqueue(&self, update: PendingUpdate) -> anyhow::Result<oneshot::Receiver<Applied>> {
        let (reply, applied) = oneshot::channel();
        let lamport = update.lamport;
        let queued = Queued {
            update,
            arrival_seq: self.arrival_seq.fetch_add(1, SeqCst),
            reply,
        };
        self.sender
            .send(queued)
            .map_err(|err| anyhow::anyhow!("apply pipeline stopped: {err}"))?;
        self.last_enqueued.fetch_max(lamport, SeqCst);
        Ok(applied)
    }

    // highest lamport ever handed to the worker, the watermark can never pass it
    pub fn last_enqueued(&self) -> LogicalTime {
        self.last_enqueued.load(SeqCst)
    }
}

/// Read side of the aggregate. Published states are immutable and replaced as
/// a whole, so holding one never blocks the worker.
#[derive(Debug, Clone, Default)]
pub struct View(Arc<RwLock<Arc<Aggregate>>>);

impl View {
    pub fn current(&self) -> Arc<Aggregate> {
        self.0.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn publish(&self, state: Aggregate) {
        *self.0.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(state)
    }
}

#[derive(Debug)]
pub struct Pipeline {
    receiver: UnboundedReceiver<Queued>,
    queue: BinaryHeap<Reverse<Queued>>,
    state: Aggregate,
    view: View,
    snapshots: Option<FileSnapshotStore>,
    synchronizer: Arc<Synchronizer>,
}

pub fn pipeline(
    initial: Aggregate,
    snapshots: Option<FileSnapshotStore>,
    synchronizer: Arc<Synchronizer>,
) -> (Pipeline, Enqueue, View) {
    let (sender, receiver) = unbounded_channel();
    let enqueue = Enqueue {
        sender,
        arrival_seq: Default::default(),
        last_enqueued: Arc::new(AtomicU64::new(initial.max_lamport())),
    };
    let view = View(Arc::new(RwLock::new(Arc::new(initial.clone()))));
    let pipeline = Pipeline {
        receiver,
        queue: Default::default(),
        state: initial,
        view: view.clone(),
        snapshots,
        synchronizer,
    };
    (pipeline, enqueue, view)
}

impl Pipeline {
    /// Runs until every `Enqueue` handle is dropped and the queue is drained.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        loop {
            // only suspend when nothing is pending
            if self.queue.is_empty() {
                match self.receiver.recv().await {
                    Some(queued) => self.queue.push(Reverse(queued)),
                    None => break Ok(()),
                }
            }
            // take in everything that already arrived so the minimum is picked
            // among all of it
            while let Ok(queued) = self.receiver.try_recv() {
                self.queue.push(Reverse(queued))
            }
            if let Some(Reverse(queued)) = self.queue.pop() {
                self.apply(queued).await
            }
        }
    }

    async fn apply(&mut self, queued: Queued) {
        let Queued {
            update,
            arrival_seq,
            reply,
        } = queued;
        let PendingUpdate {
            entity_id,
            payload,
            source_id,
            lamport,
        } = update;
        let was_empty = self.state.is_empty();
        let resolution = self.state.apply(
            entity_id.clone(),
            StoredRecord {
                payload,
                source_id: source_id.clone(),
                lamport,
                applied_at: unix_millis(),
            },
        );
        debug!(%entity_id, %source_id, lamport, arrival_seq, ?resolution, "apply");
        if resolution != Resolution::Discarded {
            self.view.publish(self.state.clone());
            if let Some(snapshots) = &mut self.snapshots {
                // the in-memory state is already changed, a failed save costs
                // durability only
                if let Err(err) = snapshots.save(&self.state).await {
                    warn!("save snapshot into {}: {err:#}", snapshots.dir().display())
                }
            }
        }
        self.synchronizer.on_applied(lamport);
        // the requester may have given up waiting
        let _ = reply.send(Applied {
            resolution,
            first_write: was_empty && resolution == Resolution::Created,
            lamport,
        });
    }
}
