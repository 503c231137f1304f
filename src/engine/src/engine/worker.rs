//! Worker pool internals
//!
//! Fixed set of long-lived workers, each consuming one bounded channel.
//! A worker retires after a bounded, slightly randomized number of items and
//! respawns on the same channel. The retirement threshold mirrors the
//! original system's stack-reclamation policy; here it simply bounds task
//! lifetime and is invisible to callers.

use rand::Rng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::EngineCore;
use crate::audit::AuditTrail;
use crate::error::{EngineError, Result};
use crate::evaluator::EvalParams;
use crate::request::{CheckInput, CheckOutput};
use crate::tracer::TraceContext;
use std::sync::Arc;

pub(super) const PARALLELISM_THRESHOLD: usize = 5;
pub(super) const WORKER_QUEUE_SIZE: usize = 4;
const WORKER_RESET_JITTER: u64 = 1 << 4;
const WORKER_RESET_THRESHOLD: u64 = 1 << 16;

/// A single check queued for a worker, tagged with its position in the
/// originating batch.
pub(super) struct WorkItem {
    pub index: usize,
    pub input: CheckInput,
    pub params: EvalParams,
    pub tctx: TraceContext,
    pub cancellation: CancellationToken,
    pub out: mpsc::Sender<WorkOut>,
}

/// Result of one work item, carrying its batch index for re-assembly.
pub(super) struct WorkOut {
    pub index: usize,
    pub result: Result<(CheckOutput, AuditTrail)>,
}

/// Spawns a worker task on `rx`. The task processes up to
/// `threshold + jitter` items and then replaces itself on the same channel.
pub(super) fn spawn_worker(
    core: Arc<EngineCore>,
    rx: mpsc::Receiver<WorkItem>,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        let mut rx = rx;
        let threshold =
            WORKER_RESET_THRESHOLD + rand::thread_rng().gen_range(0..WORKER_RESET_JITTER);

        for _ in 0..threshold {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                item = rx.recv() => {
                    let Some(item) = item else { return };

                    let result = if item.cancellation.is_cancelled() {
                        Err(EngineError::Cancelled)
                    } else {
                        core.evaluate_input(&item.input, &item.params, &item.tctx).await
                    };

                    let _ = item
                        .out
                        .send(WorkOut { index: item.index, result })
                        .await;
                }
            }
        }

        // retire and replace on the same channel
        spawn_worker(core, rx, shutdown);
    });
}
