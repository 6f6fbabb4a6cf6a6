//! Destination FIFOs between the acquisition thread and a channel consumer.
//!
//! Exactly one writer (the acquisition thread) and one reader (the consumer)
//! share a bounded channel of pooled [`SampleBlock`]s. The writer never
//! blocks: a block that does not fit is discarded and counted.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender, TrySendError, bounded};
use lockfree_object_pool::{LinearObjectPool, LinearOwnedReusable};

use crate::sample::{Sample, SampleBlock};

pub type PooledBlock = LinearOwnedReusable<SampleBlock>;

#[derive(Default)]
struct FifoStats {
    delivered_blocks: AtomicU64,
    delivered_samples: AtomicU64,
    dropped_blocks: AtomicU64,
}

/// Writer half, handed to the acquisition thread as a channel destination.
///
/// Clones refer to the same FIFO; equality is identity.
#[derive(Clone)]
pub struct SampleFifo {
    tx: Sender<PooledBlock>,
    pool: Arc<LinearObjectPool<SampleBlock>>,
    stats: Arc<FifoStats>,
}

/// Reader half, kept by the consumer.
pub struct FifoReader {
    rx: Receiver<PooledBlock>,
    stats: Arc<FifoStats>,
}

/// Create a FIFO holding at most `depth` blocks.
pub fn sample_fifo(depth: usize) -> (SampleFifo, FifoReader) {
    let (tx, rx) = bounded(depth.max(1));
    let pool = Arc::new(LinearObjectPool::new(SampleBlock::default, |b: &mut SampleBlock| {
        b.reset()
    }));
    let stats = Arc::new(FifoStats::default());

    (
        SampleFifo {
            tx,
            pool,
            stats: stats.clone(),
        },
        FifoReader { rx, stats },
    )
}

impl SampleFifo {
    /// Queue a copy of `samples` as one block.
    ///
    /// Returns `false` only when the reader is gone. A full FIFO drops the
    /// block and still returns `true`.
    pub fn write(&self, seq: u64, discontinuity: bool, samples: &[Sample]) -> bool {
        let mut block = self.pool.pull_owned();
        block.seq = seq;
        block.discontinuity = discontinuity;
        block.samples.extend_from_slice(samples);

        match self.tx.try_send(block) {
            Ok(()) => {
                self.stats.delivered_blocks.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .delivered_samples
                    .fetch_add(samples.len() as u64, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(_)) => {
                let n = self.stats.dropped_blocks.fetch_add(1, Ordering::Relaxed);
                if n % 100 == 0 {
                    log::warn!("destination FIFO full, discarding ({} blocks so far)", n + 1);
                }
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    pub fn dropped_blocks(&self) -> u64 {
        self.stats.dropped_blocks.load(Ordering::Relaxed)
    }
}

impl PartialEq for SampleFifo {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.stats, &other.stats)
    }
}

impl Eq for SampleFifo {}

impl std::fmt::Debug for SampleFifo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleFifo")
            .field("id", &Arc::as_ptr(&self.stats))
            .field("queued", &self.tx.len())
            .finish()
    }
}

impl FifoReader {
    pub fn try_recv(&self) -> Option<PooledBlock> {
        self.rx.try_recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<PooledBlock> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Number of blocks waiting.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Take every queued block.
    pub fn drain(&self) -> Vec<PooledBlock> {
        self.rx.try_iter().collect()
    }

    pub fn delivered_blocks(&self) -> u64 {
        self.stats.delivered_blocks.load(Ordering::Relaxed)
    }

    pub fn delivered_samples(&self) -> u64 {
        self.stats.delivered_samples.load(Ordering::Relaxed)
    }

    pub fn dropped_blocks(&self) -> u64 {
        self.stats.dropped_blocks.load(Ordering::Relaxed)
    }
}
