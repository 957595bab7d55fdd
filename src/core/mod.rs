pub mod comparator;
pub mod engine;
pub mod executor;
pub mod lister;
pub mod loader;
pub mod naming;
pub mod scanner;

pub use comparator::{diff, summarize, ActionSummary, Direction, SyncAction};
pub use engine::{ListingKey, RemoteMap, SyncEngine, SyncReport, SyncStatus};
pub use executor::{ActionOutcome, ExecutionReport, Executor, ExecutorConfig};
pub use lister::{ListingInterrupted, ObjectEntry, ObjectLister};
pub use loader::{CacheLookup, CachedLoader, Fetch, LoadState};
pub use naming::{name_for, name_for_path, HashCopier, HashCopyReport};
pub use scanner::{LocalScanner, ScanConfig};
