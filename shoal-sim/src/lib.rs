//! Shoal Simulation - deterministic stand-ins for everything around the
//! download engine.
//!
//! The engine talks to the outside world only through traits: a source
//! transport, a disk, a hash tree, a mesh and a prober. This crate provides
//! in-memory implementations of each, driven by a seed and by `tokio::time`,
//! so whole swarm downloads can be replayed under a paused clock.
//!
//! # Example
//!
//! ```rust,no_run
//! use shoal_sim::{SourceBehavior, SwarmScenario};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let report = SwarmScenario::new(7, 1_000_000)
//!     .sources(2, SourceBehavior::serving())
//!     .source(SourceBehavior::slow(4 * 1024))
//!     .with_hash_tree(128 * 1024)
//!     .run()
//!     .await?;
//! assert!(report.is_success());
//! # Ok(())
//! # }
//! ```

pub mod deterministic;
pub mod disk;
pub mod hash_tree;
pub mod invariants;
pub mod mesh;
pub mod scenarios;
pub mod transport;

pub use deterministic::DeterministicRng;
pub use disk::MemoryDisk;
pub use hash_tree::Sha1ChunkTree;
pub use invariants::{InvariantViolation, check_file_invariants, check_range_sets};
pub use mesh::{RecordingMesh, SimulatedProber};
pub use scenarios::{ScenarioReport, SourceReport, SwarmScenario, source_address};
pub use transport::{SimulatedTransport, SourceBehavior, SourceKind, SourceStats};
