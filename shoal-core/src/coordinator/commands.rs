//! Command definitions for the download actor.

use std::sync::Arc;

use tokio::sync::oneshot;

use super::DownloadError;
use super::state::DownloadStatus;
use crate::hash_tree::HashTree;
use crate::source::SourceDescriptor;

/// Commands sent to a download's actor task.
///
/// Each command carries a oneshot responder for the reply.
pub enum DownloadCommand {
    /// Offer new sources; replies with how many were pooled.
    AddSources {
        sources: Vec<SourceDescriptor>,
        responder: oneshot::Sender<Result<usize, DownloadError>>,
    },
    GetStatus {
        responder: oneshot::Sender<DownloadStatus>,
    },
    /// Stop every worker but keep progress.
    Pause { responder: oneshot::Sender<()> },
    Resume { responder: oneshot::Sender<()> },
    /// Abort the download.
    Stop { responder: oneshot::Sender<()> },
    /// A hash tree arrived out of band; replies whether it was installed.
    HashTreeRead {
        tree: Arc<dyn HashTree>,
        responder: oneshot::Sender<bool>,
    },
}
