// lib.rs - Quote store core: selection, persistence and server reconciliation

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]

pub mod capabilities;
pub mod event;
pub mod model;
pub mod persistence;
pub mod reconcile;
pub mod store;

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use capabilities::{
    FileKvStore, HttpRemote, KeyNamespace, KeyValueStore, KvError, KvKey, MemoryKvStore,
    RemoteEndpoint, RemoteError, ValidatedUrl,
};
#[cfg(not(target_arch = "wasm32"))]
pub use capabilities::SqliteKvStore;
pub use event::StoreEvent;
pub use model::{
    default_seed, CasePolicy, Filter, FilterState, LastViewed, LocalId, OutgoingQuote, Quote,
    RemoteCandidate, RemoteQuote, SelectionMode, ServerId, ValidationError,
};
pub use persistence::{Persistence, PersistenceError, QuoteStoreSnapshot, SCHEMA_VERSION};
pub use reconcile::{
    PullReport, PushReport, ReconciliationEngine, SyncConfig, SyncError, SyncHandle,
    SyncMetricsSnapshot, SyncReport,
};
pub use store::{
    AttachOutcome, CategoryOption, ImportOutcome, InitSource, MergeOutcome, QuoteStore,
    StoreConfig, StoreError,
};

/// Sentinel filter value meaning "every category".
pub const ALL_CATEGORIES: &str = "all";
pub const MAX_TEXT_LENGTH: usize = 4096;
pub const MAX_CATEGORY_LENGTH: usize = 128;
pub const DEFAULT_ENDPOINT: &str = "https://jsonplaceholder.typicode.com/posts";
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_REMOTE_TIMEOUT: Duration = Duration::from_secs(10);
pub const MIN_SYNC_INTERVAL: Duration = Duration::from_secs(1);
pub const MAX_REMOTE_TIMEOUT: Duration = Duration::from_secs(300);
pub const MAX_PUSH_PER_CYCLE: usize = 50;
pub const DEFAULT_REMOTE_CATEGORY: &str = "remote";
/// `userId` sent with every pushed quote; the test endpoint requires one.
pub const PUSH_USER_ID: u64 = 1;
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Validation,
    Parse,
    RemoteUnavailable,
    EmptyResult,
    Timeout,
    Storage,
    Busy,
    Config,
}

impl ErrorKind {
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Validation => "VALIDATION_ERROR",
            Self::Parse => "PARSE_ERROR",
            Self::RemoteUnavailable => "REMOTE_UNAVAILABLE",
            Self::EmptyResult => "EMPTY_RESULT",
            Self::Timeout => "TIMEOUT",
            Self::Storage => "STORAGE_ERROR",
            Self::Busy => "BUSY",
            Self::Config => "CONFIG_ERROR",
        }
    }

    /// Whether the next scheduled sync cycle may succeed where this one failed.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::RemoteUnavailable | Self::Timeout | Self::Storage | Self::Busy
        )
    }

    /// Expected outcomes a front end shows inline rather than as a failure.
    #[must_use]
    pub const fn is_expected(self) -> bool {
        matches!(self, Self::EmptyResult | Self::Validation)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

pub(crate) fn get_current_time_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}
