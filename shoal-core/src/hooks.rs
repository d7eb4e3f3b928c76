//! Post-completion hooks and external source lookup.
//!
//! Scanning, policy checks and moving the finished file into the library
//! belong to the application. The coordinator calls them in order once every
//! byte is on disk and maps their answers to terminal download states.

use async_trait::async_trait;

use crate::source::DownloadIdentity;
use crate::verifying_file::VerifyingFile;

/// Answer of a malware scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanVerdict {
    Clean,
    ThreatFound,
    /// The scanner could not run; the download may still be saved
    ScanFailed,
}

/// Application callbacks run after the last byte is written.
#[async_trait]
pub trait CompletionHooks: Send + Sync {
    /// Scans the closed incomplete file.
    async fn scan(&self, _identity: &DownloadIdentity, _file: &VerifyingFile) -> ScanVerdict {
        ScanVerdict::Clean
    }

    /// Returns true if policy forbids keeping this file.
    fn is_dangerous(&self, _identity: &DownloadIdentity) -> bool {
        false
    }

    /// Moves the verified file to its final location.
    ///
    /// # Errors
    ///
    /// Returns a human-readable reason when the file could not be saved.
    async fn save(&self, _identity: &DownloadIdentity, _file: &VerifyingFile) -> Result<(), String> {
        Ok(())
    }
}

/// Hooks that accept everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAllHooks;

#[async_trait]
impl CompletionHooks for AcceptAllHooks {}

/// Discovery-side lookup for more sources.
pub trait SourceLookup: Send + Sync {
    /// True while an out-of-band lookup for this download is running.
    fn is_lookup_in_flight(&self) -> bool {
        false
    }

    /// True if rate limiting allows a new lookup now.
    fn can_requery(&self) -> bool {
        false
    }

    /// Starts a new lookup; results arrive through `DownloadHandle::add_sources`.
    fn requery(&self, _identity: &DownloadIdentity) {}
}

/// Lookup that never finds anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLookup;

impl SourceLookup for NoLookup {}
