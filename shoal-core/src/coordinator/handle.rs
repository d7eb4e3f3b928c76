//! Handle for communicating with a download actor.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};

use super::DownloadError;
use super::commands::DownloadCommand;
use super::state::{DownloadState, DownloadStatus};
use crate::hash_tree::HashTree;
use crate::source::SourceDescriptor;

/// Cloneable handle to one running download.
#[derive(Clone)]
pub struct DownloadHandle {
    sender: mpsc::Sender<DownloadCommand>,
    state: watch::Receiver<DownloadState>,
}

impl DownloadHandle {
    pub fn new(sender: mpsc::Sender<DownloadCommand>, state: watch::Receiver<DownloadState>) -> Self {
        Self { sender, state }
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> DownloadCommand,
    ) -> Result<T, DownloadError> {
        let (responder, rx) = oneshot::channel();
        self.sender
            .send(command(responder))
            .await
            .map_err(|_| DownloadError::ActorShutdown)?;
        rx.await.map_err(|_| DownloadError::ActorShutdown)
    }

    /// Offers sources to the download.
    ///
    /// Sources serving a different file are dropped. Returns how many were
    /// added to the pool.
    ///
    /// # Errors
    ///
    /// - `DownloadError::InvalidSource` - If no offered source matches the download
    /// - `DownloadError::ActorShutdown` - If the download actor is gone
    pub async fn add_sources(&self, sources: Vec<SourceDescriptor>) -> Result<usize, DownloadError> {
        self.request(|responder| DownloadCommand::AddSources { sources, responder })
            .await?
    }

    /// Current progress and state.
    ///
    /// # Errors
    ///
    /// - `DownloadError::ActorShutdown` - If the download actor is gone
    pub async fn status(&self) -> Result<DownloadStatus, DownloadError> {
        self.request(|responder| DownloadCommand::GetStatus { responder })
            .await
    }

    /// Interrupts every worker; verified and written ranges survive.
    ///
    /// # Errors
    ///
    /// - `DownloadError::ActorShutdown` - If the download actor is gone
    pub async fn pause(&self) -> Result<(), DownloadError> {
        self.request(|responder| DownloadCommand::Pause { responder })
            .await
    }

    /// # Errors
    ///
    /// - `DownloadError::ActorShutdown` - If the download actor is gone
    pub async fn resume(&self) -> Result<(), DownloadError> {
        self.request(|responder| DownloadCommand::Resume { responder })
            .await
    }

    /// Aborts the download. Idempotent.
    ///
    /// # Errors
    ///
    /// - `DownloadError::ActorShutdown` - If the download actor is gone
    pub async fn stop(&self) -> Result<(), DownloadError> {
        self.request(|responder| DownloadCommand::Stop { responder })
            .await
    }

    /// Hands over a hash tree fetched outside the workers.
    ///
    /// # Errors
    ///
    /// - `DownloadError::ActorShutdown` - If the download actor is gone
    pub async fn hash_tree_read(&self, tree: Arc<dyn HashTree>) -> Result<bool, DownloadError> {
        self.request(|responder| DownloadCommand::HashTreeRead { tree, responder })
            .await
    }

    /// Latest state without a round trip to the actor.
    pub fn state(&self) -> DownloadState {
        *self.state.borrow()
    }

    /// Receiver notified on every state change.
    pub fn subscribe(&self) -> watch::Receiver<DownloadState> {
        self.state.clone()
    }

    /// Waits until the download reaches a terminal state.
    pub async fn wait_for_terminal(&self) -> DownloadState {
        let mut receiver = self.state.clone();
        let reached = receiver
            .wait_for(|state| state.is_terminal())
            .await
            .map(|state| *state);
        reached.unwrap_or_else(|_| *receiver.borrow())
    }
}
