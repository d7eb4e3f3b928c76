//! Download lifecycle states and status reports.

use std::fmt;

use serde::Serialize;

/// What the user sees for one download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DownloadState {
    Initializing,
    /// Resumed from a snapshot, not yet started
    Queued,
    Connecting,
    Downloading,
    /// Every live worker is waiting in a remote upload queue
    RemoteQueued,
    /// Every known source is backed off
    Busy,
    WaitingForConnections,
    /// Waiting for the application to find more sources
    WaitingForSources,
    Paused,
    Hashing,
    Saving,
    Complete,
    Aborted,
    /// No sources left and no lookup possible
    GaveUp,
    DiskProblem,
    CorruptFile,
    Invalid,
    Dangerous,
    ThreatFound,
    /// Saved, but the malware scanner could not run
    ScanFailed,
}

impl DownloadState {
    /// True once the download can no longer make progress.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DownloadState::Complete
                | DownloadState::Aborted
                | DownloadState::DiskProblem
                | DownloadState::CorruptFile
                | DownloadState::Invalid
                | DownloadState::Dangerous
                | DownloadState::ThreatFound
                | DownloadState::ScanFailed
        )
    }

    /// Waiting for sources or the user, with no worker running.
    pub fn is_inactive(self) -> bool {
        matches!(
            self,
            DownloadState::Queued
                | DownloadState::Busy
                | DownloadState::GaveUp
                | DownloadState::WaitingForSources
                | DownloadState::Paused
        )
    }

    /// True for terminal states that kept the file.
    pub fn is_success(self) -> bool {
        matches!(self, DownloadState::Complete | DownloadState::ScanFailed)
    }
}

impl fmt::Display for DownloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DownloadState::Initializing => "INITIALIZING",
            DownloadState::Queued => "QUEUED",
            DownloadState::Connecting => "CONNECTING",
            DownloadState::Downloading => "DOWNLOADING",
            DownloadState::RemoteQueued => "REMOTE_QUEUED",
            DownloadState::Busy => "BUSY",
            DownloadState::WaitingForConnections => "WAITING_FOR_CONNECTIONS",
            DownloadState::WaitingForSources => "WAITING_FOR_SOURCES",
            DownloadState::Paused => "PAUSED",
            DownloadState::Hashing => "HASHING",
            DownloadState::Saving => "SAVING",
            DownloadState::Complete => "COMPLETE",
            DownloadState::Aborted => "ABORTED",
            DownloadState::GaveUp => "GAVE_UP",
            DownloadState::DiskProblem => "DISK_PROBLEM",
            DownloadState::CorruptFile => "CORRUPT_FILE",
            DownloadState::Invalid => "INVALID",
            DownloadState::Dangerous => "DANGEROUS",
            DownloadState::ThreatFound => "THREAT_FOUND",
            DownloadState::ScanFailed => "SCAN_FAILED",
        };
        f.write_str(name)
    }
}

/// Point-in-time report of one download.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownloadStatus {
    pub state: DownloadState,
    pub file_size: u64,
    pub verified_bytes: u64,
    /// Written or queued for the disk, not yet verified
    pub pending_bytes: u64,
    pub lost_bytes: u64,
    pub free_bytes: u64,
    pub workers: usize,
    pub active_workers: usize,
    pub queued_workers: usize,
    pub pooled_sources: usize,
    /// Backoff before the next attempt while BUSY
    pub retry_wait_ms: Option<u64>,
    /// Contiguous verified prefix that can be previewed
    pub preview_offset: u64,
    /// Human-readable cause of an error state
    pub reason: Option<String>,
}

impl DownloadStatus {
    /// Fraction of the file verified, in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        if self.file_size == 0 {
            return 0.0;
        }
        self.verified_bytes as f64 / self.file_size as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        for state in [
            DownloadState::Complete,
            DownloadState::Aborted,
            DownloadState::DiskProblem,
            DownloadState::CorruptFile,
            DownloadState::Invalid,
            DownloadState::Dangerous,
            DownloadState::ThreatFound,
            DownloadState::ScanFailed,
        ] {
            assert!(state.is_terminal(), "{state} should be terminal");
        }
        assert!(!DownloadState::GaveUp.is_terminal());
        assert!(!DownloadState::Busy.is_terminal());
        assert!(DownloadState::GaveUp.is_inactive());
        assert!(DownloadState::ScanFailed.is_success());
        assert!(!DownloadState::CorruptFile.is_success());
    }

    #[test]
    fn test_state_names() {
        assert_eq!(DownloadState::RemoteQueued.to_string(), "REMOTE_QUEUED");
        assert_eq!(
            serde_json::to_string(&DownloadState::WaitingForSources).unwrap(),
            "\"WAITING_FOR_SOURCES\""
        );
    }
}
