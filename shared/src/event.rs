use serde::{Deserialize, Serialize};

use crate::model::{Filter, LocalId, Quote, ServerId};
use crate::store::InitSource;

// --- Event enum: large variants boxed ---

/// Notifications broadcast by the store and the reconciliation engine.
/// Front ends subscribe and redraw; nothing in the core waits on them.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum StoreEvent {
    Initialized {
        source: InitSource,
        count: usize,
    },
    QuoteAdded(Box<Quote>),
    FilterChanged {
        filter: Filter,
    },
    Imported {
        accepted: usize,
        rejected: usize,
    },
    Reconciled {
        added: usize,
        updated: usize,
        summary: String,
    },
    QuotePushed {
        id: LocalId,
        server_id: ServerId,
    },
    PushFailed {
        id: LocalId,
        error: String,
    },
    SyncSkipped,
}

impl StoreEvent {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            StoreEvent::Initialized { .. } => "initialized",
            StoreEvent::QuoteAdded(_) => "quote_added",
            StoreEvent::FilterChanged { .. } => "filter_changed",
            StoreEvent::Imported { .. } => "imported",
            StoreEvent::Reconciled { .. } => "reconciled",
            StoreEvent::QuotePushed { .. } => "quote_pushed",
            StoreEvent::PushFailed { .. } => "push_failed",
            StoreEvent::SyncSkipped => "sync_skipped",
        }
    }

    /// Short message suitable for a status line or toast.
    #[must_use]
    pub fn summary(&self) -> String {
        match self {
            StoreEvent::Initialized { source, count } => match source {
                InitSource::Restored => format!("Restored {count} saved quotes"),
                InitSource::Seeded => format!("Started with {count} default quotes"),
            },
            StoreEvent::QuoteAdded(quote) => format!("Added a quote to {}", quote.category()),
            StoreEvent::FilterChanged { filter } => format!("Showing {filter}"),
            StoreEvent::Imported { accepted, rejected } => {
                if *rejected == 0 {
                    format!("Imported {accepted} quotes")
                } else {
                    format!("Imported {accepted} quotes, skipped {rejected} invalid entries")
                }
            }
            StoreEvent::Reconciled { summary, .. } => summary.clone(),
            StoreEvent::QuotePushed { .. } => "Quote synced to server".to_string(),
            StoreEvent::PushFailed { error, .. } => format!("Sync failed: {error}"),
            StoreEvent::SyncSkipped => "Sync already in progress".to_string(),
        }
    }
}
