pub mod conflict;
pub mod engine;
pub mod file_state;
pub mod job;
pub mod path_resolver;
pub mod retry;
pub mod snapshot;
pub mod status;
pub mod watcher;

pub use conflict::{resolve_last_write_wins, ConflictSide, ConflictWinner};
pub use engine::{SyncConfig, SyncEngine};
pub use file_state::{calculate_hash, FileFingerprint, FileState, FileStateManager, FileSyncState};
pub use job::{JobDirection, JobReport, JobState, SyncJob};
pub use path_resolver::{PathResolver, Resolved, TrackedPaths};
pub use retry::RetryPolicy;
pub use snapshot::{FileRecord, SnapshotStore};
pub use status::{SessionOrigin, SessionState, SessionSummary, StatusReporter, StatusSnapshot};
pub use watcher::{ChangeEvent, ChangeKind, ChangeScanner, ChangeSource, WatchMode};
