//! Background disk queue: one task per open file serializes every write
//! and chunk verification.

use std::sync::Arc;

use bytes::BytesMut;
use tokio::sync::mpsc;

use super::Inner;
use crate::range::Range;
use crate::storage::DiskError;

pub(super) enum DiskJob {
    /// Persist `buffer` (which starts at file offset `position`) for each piece.
    Write {
        position: u64,
        buffer: BytesMut,
        pieces: Vec<Range>,
    },
    /// Re-check partial chunks against the current tree.
    Verify,
}

pub(super) async fn run_disk_queue(inner: Arc<Inner>, mut receiver: mpsc::UnboundedReceiver<DiskJob>) {
    tracing::debug!("disk queue started");

    while let Some(job) = receiver.recv().await {
        match job {
            DiskJob::Write {
                position,
                buffer,
                pieces,
            } => {
                let result = write_pieces(&inner, position, &buffer, &pieces).await;
                inner.pool.release(buffer);
                inner.drain_delayed();

                let verify = {
                    let mut state = inner.state.lock();
                    let mut verify = false;
                    for piece in &pieces {
                        verify |= state.finish_write(*piece, result.clone());
                    }
                    verify
                };
                if verify {
                    verify_chunks(&inner).await;
                }
            }
            DiskJob::Verify => verify_chunks(&inner).await,
        }

        {
            let mut state = inner.state.lock();
            state.jobs_in_flight = state.jobs_in_flight.saturating_sub(1);
        }
        inner.changed.notify_waiters();
    }

    tracing::debug!("disk queue stopped");
}

async fn write_pieces(
    inner: &Inner,
    position: u64,
    buffer: &[u8],
    pieces: &[Range],
) -> Result<(), DiskError> {
    for piece in pieces {
        let start = (piece.low() - position) as usize;
        let end = start + piece.len() as usize;
        inner.disk.write_at(piece.low(), &buffer[start..end]).await?;
    }
    Ok(())
}

/// Verifies every complete chunk currently in `partial`.
async fn verify_chunks(inner: &Inner) {
    let (chunks, tree) = {
        let state = inner.state.lock();
        (state.verifiable_chunks(), state.hash_tree.clone())
    };
    let Some(tree) = tree else {
        return;
    };

    for chunk in chunks {
        match inner.disk.read_at(chunk.low(), chunk.len() as usize).await {
            Ok(data) => {
                let good = tree.verify(chunk, &data);
                inner
                    .state
                    .lock()
                    .apply_verification(chunk, good, tree.root());
            }
            Err(error) => {
                tracing::error!("verify_chunks: reading {chunk} failed: {error}");
                inner.state.lock().stored_error = Some(error);
                return;
            }
        }
    }
}
