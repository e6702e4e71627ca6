use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::capabilities::{KeyNamespace, KeyValueStore, KvError, KvKey};
use crate::model::{FilterState, LastViewed, Quote, ValidationError};
use crate::ErrorKind;

pub const SCHEMA_VERSION: u32 = 1;
const SNAPSHOT_MAGIC: &str = "QSNP";
const MAX_SNAPSHOT_BYTES: usize = crate::capabilities::MAX_VALUE_SIZE;

const QUOTES_KEY: &str = "quotes.v1";
const FILTER_KEY: &str = "filter.v1";
const LAST_VIEWED_KEY: &str = "last-viewed.v1";

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("storage error: {0}")]
    Kv(#[from] KvError),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("corrupted snapshot: {reason}")]
    Corrupted { reason: &'static str },

    #[error("integrity check failed: expected {expected}, got {actual}")]
    IntegrityCheckFailed { expected: String, actual: String },

    #[error("schema version {found} is newer than supported {max}")]
    FutureSchema { found: u32, max: u32 },

    #[error("unknown schema version: {0}")]
    UnknownSchema(u32),

    #[error("stored quote is invalid: {0}")]
    Invalid(#[from] ValidationError),
}

impl PersistenceError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            PersistenceError::Kv(e) => e.kind(),
            _ => ErrorKind::Parse,
        }
    }
}

impl From<serde_json::Error> for PersistenceError {
    fn from(e: serde_json::Error) -> Self {
        PersistenceError::Serialization(e.to_string())
    }
}

/// Everything that survives a restart.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuoteStoreSnapshot {
    pub quotes: Vec<Quote>,
    pub filter: FilterState,
}

#[derive(Serialize, Deserialize, Debug)]
struct SnapshotEnvelope {
    magic: String,
    schema_version: u32,
    checksum: String,
    payload: String,
}

/// The bare array the browser build kept under its storage key.
#[derive(Deserialize)]
struct LegacyQuote {
    text: String,
    category: String,
}

pub(crate) fn encode_snapshot(quotes: &[Quote]) -> Result<Vec<u8>, PersistenceError> {
    let payload = serde_json::to_string(quotes)?;
    let checksum = blake3::hash(payload.as_bytes());

    let envelope = SnapshotEnvelope {
        magic: SNAPSHOT_MAGIC.to_string(),
        schema_version: SCHEMA_VERSION,
        checksum: checksum.to_hex().to_string(),
        payload,
    };
    Ok(serde_json::to_vec(&envelope)?)
}

pub(crate) fn decode_snapshot(bytes: &[u8]) -> Result<Vec<Quote>, PersistenceError> {
    if bytes.is_empty() {
        return Err(PersistenceError::Corrupted {
            reason: "empty value",
        });
    }
    if bytes.len() > MAX_SNAPSHOT_BYTES {
        return Err(PersistenceError::Corrupted {
            reason: "snapshot too large",
        });
    }

    let Ok(envelope) = serde_json::from_slice::<SnapshotEnvelope>(bytes) else {
        // Un-enveloped array written before snapshots were versioned.
        let text = std::str::from_utf8(bytes).map_err(|_| PersistenceError::Corrupted {
            reason: "snapshot is not UTF-8",
        })?;
        return migrate(0, text);
    };

    if envelope.magic != SNAPSHOT_MAGIC {
        return Err(PersistenceError::Corrupted {
            reason: "invalid magic",
        });
    }

    if envelope.schema_version > SCHEMA_VERSION {
        return Err(PersistenceError::FutureSchema {
            found: envelope.schema_version,
            max: SCHEMA_VERSION,
        });
    }

    let actual = blake3::hash(envelope.payload.as_bytes()).to_hex().to_string();
    if !actual.eq_ignore_ascii_case(&envelope.checksum) {
        return Err(PersistenceError::IntegrityCheckFailed {
            expected: envelope.checksum,
            actual,
        });
    }

    if envelope.schema_version < SCHEMA_VERSION {
        return migrate(envelope.schema_version, &envelope.payload);
    }

    let quotes: Vec<Quote> = serde_json::from_str(&envelope.payload)?;
    for quote in &quotes {
        quote.validate()?;
    }
    Ok(quotes)
}

fn migrate(from_version: u32, payload: &str) -> Result<Vec<Quote>, PersistenceError> {
    match from_version {
        0 => migrate_v0_to_v1(payload),
        _ => Err(PersistenceError::UnknownSchema(from_version)),
    }
}

fn migrate_v0_to_v1(payload: &str) -> Result<Vec<Quote>, PersistenceError> {
    let legacy: Vec<LegacyQuote> = serde_json::from_str(payload)?;
    let quotes = legacy
        .iter()
        .map(|q| Quote::new(&q.text, &q.category))
        .collect::<Result<Vec<_>, _>>()?;
    debug!(count = quotes.len(), "migrated legacy snapshot");
    Ok(quotes)
}

#[derive(Debug, Default)]
struct WriteMarks {
    quotes: u64,
    filter: u64,
}

/// Reads and writes the store's documents through the host's key/value
/// capabilities.
///
/// Writes are stamped with a generation taken when the mutation happened.
/// A write whose generation is not newer than the last one written for the
/// same key is dropped, so a slow save can never overwrite a later one.
pub struct Persistence {
    durable: Arc<dyn KeyValueStore>,
    session: Arc<dyn KeyValueStore>,
    generation: AtomicU64,
    marks: Mutex<WriteMarks>,
}

impl std::fmt::Debug for Persistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Persistence")
            .field("generation", &self.generation.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Persistence {
    pub fn new(durable: Arc<dyn KeyValueStore>, session: Arc<dyn KeyValueStore>) -> Self {
        Self {
            durable,
            session,
            generation: AtomicU64::new(0),
            marks: Mutex::new(WriteMarks::default()),
        }
    }

    pub fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn quotes_key() -> Result<KvKey, KvError> {
        KvKey::new(KeyNamespace::UserData, QUOTES_KEY)
    }

    fn filter_key() -> Result<KvKey, KvError> {
        KvKey::new(KeyNamespace::Settings, FILTER_KEY)
    }

    fn last_viewed_key() -> Result<KvKey, KvError> {
        KvKey::new(KeyNamespace::Session, LAST_VIEWED_KEY)
    }

    /// Returns `false` when the write was superseded by a newer generation.
    #[instrument(skip(self, quotes), fields(count = quotes.len()))]
    pub async fn save_quotes(
        &self,
        quotes: &[Quote],
        generation: u64,
    ) -> Result<bool, PersistenceError> {
        let bytes = encode_snapshot(quotes)?;
        let key = Self::quotes_key()?;

        let mut marks = self.marks.lock().await;
        if generation <= marks.quotes {
            debug!(last = marks.quotes, "skipping stale quote snapshot");
            return Ok(false);
        }
        self.durable.set(&key, bytes).await?;
        marks.quotes = generation;
        Ok(true)
    }

    #[instrument(skip(self))]
    pub async fn save_filter(
        &self,
        filter: &FilterState,
        generation: u64,
    ) -> Result<bool, PersistenceError> {
        let bytes = serde_json::to_vec(filter)?;
        let key = Self::filter_key()?;

        let mut marks = self.marks.lock().await;
        if generation <= marks.filter {
            debug!(last = marks.filter, "skipping stale filter state");
            return Ok(false);
        }
        self.durable.set(&key, bytes).await?;
        marks.filter = generation;
        Ok(true)
    }

    pub async fn save(
        &self,
        snapshot: &QuoteStoreSnapshot,
        generation: u64,
    ) -> Result<(), PersistenceError> {
        self.save_quotes(&snapshot.quotes, generation).await?;
        self.save_filter(&snapshot.filter, generation).await?;
        Ok(())
    }

    /// `None` when nothing usable is stored. Every reason is logged.
    pub async fn load_quotes(&self) -> Option<Vec<Quote>> {
        let key = Self::quotes_key().ok()?;
        let bytes = match self.durable.get(&key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                debug!("no saved quote snapshot");
                return None;
            }
            Err(e) => {
                warn!(error = %e, "failed to read quote snapshot");
                return None;
            }
        };

        match decode_snapshot(&bytes) {
            Ok(quotes) => Some(quotes),
            Err(e) => {
                warn!(error = %e, "discarding unreadable quote snapshot");
                None
            }
        }
    }

    pub async fn load_filter(&self) -> Option<FilterState> {
        let key = Self::filter_key().ok()?;
        match self.durable.get(&key).await {
            Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
                Ok(state) => Some(state),
                Err(e) => {
                    warn!(error = %e, "discarding unreadable filter state");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "failed to read filter state");
                None
            }
        }
    }

    pub async fn load(&self) -> Option<QuoteStoreSnapshot> {
        let quotes = self.load_quotes().await?;
        let filter = self.load_filter().await.unwrap_or_default();
        Some(QuoteStoreSnapshot { quotes, filter })
    }

    /// Echoes the displayed quote to the session scope as a [`LastViewed`].
    pub async fn save_session_quote(&self, quote: &Quote) -> Result<(), PersistenceError> {
        let bytes = serde_json::to_vec(&LastViewed {
            quote: quote.clone(),
        })?;
        self.session.set(&Self::last_viewed_key()?, bytes).await?;
        Ok(())
    }

    pub async fn load_session_quote(&self) -> Option<Quote> {
        let key = Self::last_viewed_key().ok()?;
        let bytes = match self.session.get(&key).await {
            Ok(bytes) => bytes?,
            Err(e) => {
                warn!(error = %e, "failed to read last viewed quote");
                return None;
            }
        };
        let last: LastViewed = match serde_json::from_slice(&bytes) {
            Ok(last) => last,
            Err(e) => {
                warn!(error = %e, "discarding unreadable last viewed quote");
                return None;
            }
        };
        last.quote.validate().ok()?;
        Some(last.quote)
    }

    pub async fn clear_session_quote(&self) -> Result<bool, PersistenceError> {
        Ok(self.session.delete(&Self::last_viewed_key()?).await?)
    }
}
