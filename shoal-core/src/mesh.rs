//! Source-exchange notifications.
//!
//! The mesh is the discovery side of the application. The engine only tells
//! it which sources turned out good or bad and hands over alternate locations
//! learned from remote hosts; nothing flows back synchronously.

use crate::source::SourceDescriptor;

/// Fire-and-forget sink for source quality signals.
///
/// Implementations must not block: calls are made while the download's
/// coordinator lock is held.
pub trait Mesh: Send + Sync {
    /// Reports whether `source` served the file correctly.
    fn inform_mesh(&self, source: &SourceDescriptor, good: bool);

    /// Offers alternate locations learned from a remote host.
    fn add_possible_sources(&self, sources: Vec<SourceDescriptor>);
}

/// Mesh that drops every signal.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullMesh;

impl Mesh for NullMesh {
    fn inform_mesh(&self, source: &SourceDescriptor, good: bool) {
        tracing::trace!("inform_mesh: {} good={good}", source.address);
    }

    fn add_possible_sources(&self, sources: Vec<SourceDescriptor>) {
        tracing::trace!("add_possible_sources: dropping {} sources", sources.len());
    }
}
