use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info, instrument, warn};

use crate::event::StoreEvent;
use crate::model::{
    display_label, server_id_from_json, validate_fields, CasePolicy, Filter, FilterState, LastViewed,
    LocalId, Quote, RemoteCandidate, SelectionMode, ServerId, ValidationError,
};
use crate::persistence::Persistence;
use crate::{ErrorKind, ALL_CATEGORIES, EVENT_CHANNEL_CAPACITY};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("invalid quote: {0}")]
    Validation(#[from] ValidationError),

    #[error("no quotes available for '{filter}'")]
    EmptyResult { filter: Filter },

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Validation(_) => ErrorKind::Validation,
            StoreError::EmptyResult { .. } => ErrorKind::EmptyResult,
            StoreError::Serialization(_) => ErrorKind::Parse,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct StoreConfig {
    pub case_policy: CasePolicy,
    pub selection_mode: SelectionMode,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InitSource {
    Restored,
    Seeded,
}

/// One entry of the category picker.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct CategoryOption {
    pub value: String,
    pub label: String,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub added: usize,
    pub updated: usize,
    /// Local-only quotes that picked up a server id from a text match.
    pub adopted: usize,
    pub rejected: usize,
    /// Snapshot entries folded into a later entry with the same identity.
    pub duplicates: usize,
}

impl MergeOutcome {
    #[must_use]
    pub fn changed(&self) -> bool {
        self.added + self.updated + self.adopted > 0
    }

    #[must_use]
    pub fn summary(&self) -> String {
        if self.added == 0 && self.updated == 0 {
            "Already up to date with the server".to_string()
        } else {
            format!(
                "Synced with server: {} new, {} updated",
                self.added, self.updated
            )
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ImportOutcome {
    pub accepted: usize,
    pub rejected: usize,
    pub added: usize,
    pub updated: usize,
}

/// Result of recording a server id on a local quote.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AttachOutcome {
    Attached,
    /// The quote already has a server id.
    AlreadySynced,
    Missing,
    /// Another quote holds this id; the quote stays local-only.
    IdInUse,
}

/// Export shape: what the browser build wrote to its JSON download.
#[derive(Serialize)]
struct ExportedQuote<'a> {
    text: &'a str,
    category: &'a str,
    #[serde(rename = "serverId", skip_serializing_if = "Option::is_none")]
    server_id: Option<&'a str>,
}

struct ImportedQuote {
    text: String,
    category: String,
    server_id: Option<ServerId>,
}

impl ImportedQuote {
    fn parse(item: &serde_json::Value) -> Option<Self> {
        let object = item.as_object()?;
        let text = object.get("text")?.as_str()?;
        let category = object.get("category")?.as_str()?;
        let (text, category) = validate_fields(text, category).ok()?;
        let server_id = object
            .get("serverId")
            .and_then(server_id_from_json);
        Some(Self {
            text,
            category,
            server_id,
        })
    }
}

struct StoreState {
    quotes: Vec<Quote>,
    filter: Filter,
    last_viewed: Option<LastViewed>,
    rng: StdRng,
}

impl StoreState {
    /// Identity rule: same server id, else same text.
    ///
    /// An id held by more than one quote identifies none of them, and a text
    /// match never joins two different server ids.
    fn find_match(
        quotes: &[Quote],
        text: &str,
        server_id: Option<&ServerId>,
    ) -> Option<usize> {
        if let Some(sid) = server_id {
            let mut holders = quotes
                .iter()
                .enumerate()
                .filter(|(_, q)| q.server_id() == Some(sid))
                .map(|(index, _)| index);
            if let (Some(index), None) = (holders.next(), holders.next()) {
                return Some(index);
            }
        }
        quotes.iter().position(|q| {
            q.text() == text
                && match (server_id, q.server_id()) {
                    (Some(wanted), Some(held)) => wanted == held,
                    _ => true,
                }
        })
    }

    fn holds_server_id(quotes: &[Quote], server_id: &ServerId) -> bool {
        quotes.iter().any(|q| q.server_id() == Some(server_id))
    }

    fn has_category(&self, policy: CasePolicy, category: &str) -> bool {
        self.quotes
            .iter()
            .any(|q| policy.same_category(q.category(), category))
    }
}

/// Folds entries of one snapshot that share an identity. The last occurrence
/// wins and keeps the slot of the first.
fn collapse_snapshot(candidates: Vec<RemoteCandidate>) -> (Vec<RemoteCandidate>, usize) {
    let mut kept: Vec<RemoteCandidate> = Vec::with_capacity(candidates.len());
    let mut folded = 0;
    for candidate in candidates {
        let same = kept.iter().position(|k| {
            k.text == candidate.text
                || (candidate.server_id.is_some() && k.server_id == candidate.server_id)
        });
        match same {
            Some(index) => {
                kept[index] = candidate;
                folded += 1;
            }
            None => kept.push(candidate),
        }
    }
    (kept, folded)
}

/// Owns the quote list, the category filter and the last viewed quote.
///
/// Reads never wait on storage. Mutations update memory under the state lock,
/// take a persistence generation while still holding it, then release the
/// lock before writing.
pub struct QuoteStore {
    config: StoreConfig,
    persistence: Arc<Persistence>,
    state: RwLock<StoreState>,
    events: broadcast::Sender<StoreEvent>,
    persist_failures: AtomicU64,
}

impl std::fmt::Debug for QuoteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuoteStore")
            .field("config", &self.config)
            .field("persistence", &self.persistence)
            .finish_non_exhaustive()
    }
}

impl QuoteStore {
    pub fn new(config: StoreConfig, persistence: Arc<Persistence>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            persistence,
            state: RwLock::new(StoreState {
                quotes: Vec::new(),
                filter: Filter::All,
                last_viewed: None,
                rng: StdRng::from_entropy(),
            }),
            events,
            persist_failures: AtomicU64::new(0),
        }
    }

    /// Deterministic selection for tests and replays.
    #[must_use]
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.state.get_mut().rng = StdRng::seed_from_u64(seed);
        self
    }

    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    #[must_use]
    pub fn persistence(&self) -> &Arc<Persistence> {
        &self.persistence
    }

    /// Restores saved state, or adopts `seed` and saves it right away.
    /// An unreadable or empty snapshot counts as no snapshot.
    #[instrument(skip(self, seed), fields(seed_len = seed.len()))]
    pub async fn initialize(&self, seed: Vec<Quote>) -> InitSource {
        let restored = self
            .persistence
            .load_quotes()
            .await
            .filter(|quotes| !quotes.is_empty());
        let saved_filter = self.persistence.load_filter().await.unwrap_or_default();
        let last_viewed = self.persistence.load_session_quote().await;

        let (source, quotes) = match restored {
            Some(quotes) => (InitSource::Restored, quotes),
            None => {
                let valid: Vec<Quote> = seed
                    .into_iter()
                    .filter(|q| match q.validate() {
                        Ok(()) => true,
                        Err(e) => {
                            warn!(error = %e, "dropping invalid seed quote");
                            false
                        }
                    })
                    .collect();
                (InitSource::Seeded, valid)
            }
        };

        let (count, to_save) = {
            let mut state = self.state.write().await;
            state.quotes = quotes;
            state.filter = match saved_filter.selected_category {
                Filter::Category(c) if !state.has_category(self.config.case_policy, &c) => {
                    debug!(category = %c, "saved filter names a missing category");
                    Filter::All
                }
                other => other,
            };
            state.last_viewed = last_viewed.map(|quote| LastViewed { quote });

            let to_save = (source == InitSource::Seeded)
                .then(|| (state.quotes.clone(), self.persistence.next_generation()));
            (state.quotes.len(), to_save)
        };

        if let Some((quotes, generation)) = to_save {
            self.persist_quotes(&quotes, generation).await;
        }

        info!(?source, count, "Quote store initialized");
        self.emit(StoreEvent::Initialized { source, count });
        source
    }

    /// Distinct normalized categories, ascending.
    pub async fn categories(&self) -> Vec<String> {
        let state = self.state.read().await;
        state
            .quotes
            .iter()
            .map(|q| self.config.case_policy.normalize(q.category()))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// The "all" sentinel followed by every category, with display labels.
    pub async fn filter_options(&self) -> Vec<CategoryOption> {
        let mut options = vec![CategoryOption {
            value: ALL_CATEGORIES.to_string(),
            label: display_label(ALL_CATEGORIES),
        }];
        options.extend(
            self.categories()
                .await
                .into_iter()
                // A category literally named "all" is reachable through the sentinel.
                .filter(|c| !c.eq_ignore_ascii_case(ALL_CATEGORIES))
                .map(|c| CategoryOption {
                    label: display_label(&c),
                    value: c,
                }),
        );
        options
    }

    #[instrument(skip(self, filter), fields(filter = %filter))]
    pub async fn select(&self, filter: &Filter) -> Result<Quote, StoreError> {
        let policy = self.config.case_policy;
        let chosen = {
            let mut guard = self.state.write().await;
            let StoreState {
                quotes,
                last_viewed,
                rng,
                ..
            } = &mut *guard;

            let mut candidates: Vec<&Quote> = quotes
                .iter()
                .filter(|q| filter.matches(policy, q.category()))
                .collect();
            if candidates.is_empty() {
                return Err(StoreError::EmptyResult {
                    filter: filter.clone(),
                });
            }

            if self.config.selection_mode == SelectionMode::NoImmediateRepeat {
                if let Some(last) = last_viewed.as_ref() {
                    let fresh: Vec<&Quote> = candidates
                        .iter()
                        .copied()
                        .filter(|q| q.text() != last.quote.text())
                        .collect();
                    if !fresh.is_empty() {
                        candidates = fresh;
                    }
                }
            }

            let chosen = candidates[rng.gen_range(0..candidates.len())].clone();
            *last_viewed = Some(LastViewed {
                quote: chosen.clone(),
            });
            chosen
        };

        if let Err(e) = self.persistence.save_session_quote(&chosen).await {
            warn!(error = %e, "Failed to save last viewed quote");
        }
        Ok(chosen)
    }

    /// Selects with the current filter.
    pub async fn select_current(&self) -> Result<Quote, StoreError> {
        let filter = self.filter().await;
        self.select(&filter).await
    }

    #[instrument(skip(self, text))]
    pub async fn add(&self, text: &str, category: &str) -> Result<Quote, StoreError> {
        let quote = Quote::new(text, category)?;

        let (quotes, generation) = {
            let mut state = self.state.write().await;
            state.quotes.push(quote.clone());
            (state.quotes.clone(), self.persistence.next_generation())
        };
        self.persist_quotes(&quotes, generation).await;

        info!(id = %quote.id(), "Quote added");
        self.emit(StoreEvent::QuoteAdded(Box::new(quote.clone())));
        Ok(quote)
    }

    pub async fn set_filter(&self, filter: Filter) {
        let generation = {
            let mut state = self.state.write().await;
            state.filter = filter.clone();
            self.persistence.next_generation()
        };

        let saved = FilterState {
            selected_category: filter.clone(),
        };
        if let Err(e) = self.persistence.save_filter(&saved, generation).await {
            self.persist_failures.fetch_add(1, Ordering::Relaxed);
            error!(error = %e, "Failed to persist filter");
        }
        self.emit(StoreEvent::FilterChanged { filter });
    }

    pub async fn filter(&self) -> Filter {
        self.state.read().await.filter.clone()
    }

    /// Quotes matching `filter`, in insertion order.
    pub async fn list_by_category(&self, filter: &Filter) -> Vec<Quote> {
        let policy = self.config.case_policy;
        self.state
            .read()
            .await
            .quotes
            .iter()
            .filter(|q| filter.matches(policy, q.category()))
            .cloned()
            .collect()
    }

    /// Quotes the server has not acknowledged yet.
    pub async fn local_only(&self) -> Vec<Quote> {
        self.state
            .read()
            .await
            .quotes
            .iter()
            .filter(|q| q.is_local_only())
            .cloned()
            .collect()
    }

    pub async fn quotes(&self) -> Vec<Quote> {
        self.state.read().await.quotes.clone()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.quotes.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.quotes.is_empty()
    }

    /// The quote shown before the last reload, if this session saw one.
    pub async fn restore_last_viewed(&self) -> Option<Quote> {
        self.state
            .read()
            .await
            .last_viewed
            .as_ref()
            .map(|last| last.quote.clone())
    }

    /// Merges server items: new ones are appended, matches take the remote
    /// category. Remote wins on conflict.
    #[instrument(skip(self, remote), fields(count = remote.len()))]
    pub async fn apply_remote_snapshot(&self, remote: Vec<RemoteCandidate>) -> MergeOutcome {
        let policy = self.config.case_policy;
        let (remote, duplicates) = collapse_snapshot(remote);
        let mut outcome = MergeOutcome {
            duplicates,
            ..MergeOutcome::default()
        };
        if duplicates > 0 {
            debug!(duplicates, "Folded repeated remote identities");
        }

        let to_save = {
            let mut state = self.state.write().await;
            for candidate in remote {
                let found = StoreState::find_match(
                    &state.quotes,
                    &candidate.text,
                    candidate.server_id.as_ref(),
                );
                match found {
                    Some(index) => {
                        let adopt = candidate.server_id.filter(|sid| {
                            state.quotes[index].is_local_only()
                                && !StoreState::holds_server_id(&state.quotes, sid)
                        });
                        let quote = &mut state.quotes[index];
                        if !policy.same_category(quote.category(), &candidate.category) {
                            quote.set_category(candidate.category);
                            outcome.updated += 1;
                        }
                        if let Some(server_id) = adopt {
                            quote.attach_server_id(server_id);
                            outcome.adopted += 1;
                        }
                    }
                    None => match Quote::new(&candidate.text, &candidate.category) {
                        Ok(quote) => {
                            let quote = match candidate.server_id {
                                Some(server_id) => quote.with_server_id(server_id),
                                None => quote,
                            };
                            state.quotes.push(quote);
                            outcome.added += 1;
                        }
                        Err(e) => {
                            warn!(error = %e, "Skipping invalid remote quote");
                            outcome.rejected += 1;
                        }
                    },
                }
            }

            outcome
                .changed()
                .then(|| (state.quotes.clone(), self.persistence.next_generation()))
        };

        if let Some((quotes, generation)) = to_save {
            self.persist_quotes(&quotes, generation).await;
        }

        if outcome.added + outcome.updated > 0 {
            info!(
                added = outcome.added,
                updated = outcome.updated,
                "Applied remote snapshot"
            );
            self.emit(StoreEvent::Reconciled {
                added: outcome.added,
                updated: outcome.updated,
                summary: outcome.summary(),
            });
        }
        outcome
    }

    /// Records the server's id for a pushed quote. An id already held by
    /// another quote is refused so that it keeps identifying one quote.
    pub async fn attach_server_id(&self, id: &LocalId, server_id: ServerId) -> AttachOutcome {
        let (outcome, to_save) = {
            let mut state = self.state.write().await;
            let in_use = StoreState::holds_server_id(&state.quotes, &server_id);
            match state.quotes.iter_mut().find(|q| q.id() == id) {
                None => (AttachOutcome::Missing, None),
                Some(quote) if !quote.is_local_only() => (AttachOutcome::AlreadySynced, None),
                Some(_) if in_use => (AttachOutcome::IdInUse, None),
                Some(quote) => {
                    quote.attach_server_id(server_id.clone());
                    (
                        AttachOutcome::Attached,
                        Some((state.quotes.clone(), self.persistence.next_generation())),
                    )
                }
            }
        };

        if outcome == AttachOutcome::IdInUse {
            warn!(id = %id, server_id = %server_id, "Server id already held by another quote");
        }
        if let Some((quotes, generation)) = to_save {
            self.persist_quotes(&quotes, generation).await;
        }
        outcome
    }

    /// Pretty JSON array of `{ text, category, serverId? }`.
    pub async fn serialize_all(&self) -> Result<String, StoreError> {
        let state = self.state.read().await;
        let exported: Vec<ExportedQuote<'_>> = state
            .quotes
            .iter()
            .map(|q| ExportedQuote {
                text: q.text(),
                category: q.category(),
                server_id: q.server_id().map(ServerId::as_str),
            })
            .collect();
        serde_json::to_string_pretty(&exported).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    /// Merges items from an imported file. Items are matched only against
    /// quotes that existed before the import, so an import never collapses
    /// its own entries.
    #[instrument(skip(self, items), fields(count = items.len()))]
    pub async fn merge_imported(&self, items: Vec<serde_json::Value>) -> ImportOutcome {
        let policy = self.config.case_policy;
        let mut outcome = ImportOutcome::default();
        let mut changed = false;

        let to_save = {
            let mut state = self.state.write().await;
            let existing = state.quotes.len();

            for item in &items {
                let Some(imported) = ImportedQuote::parse(item) else {
                    outcome.rejected += 1;
                    continue;
                };
                outcome.accepted += 1;

                let found = StoreState::find_match(
                    &state.quotes[..existing],
                    &imported.text,
                    imported.server_id.as_ref(),
                );
                match found {
                    Some(index) => {
                        let adopt = imported.server_id.filter(|sid| {
                            state.quotes[index].is_local_only()
                                && !StoreState::holds_server_id(&state.quotes, sid)
                        });
                        let quote = &mut state.quotes[index];
                        if !policy.same_category(quote.category(), &imported.category) {
                            quote.set_category(imported.category);
                            outcome.updated += 1;
                            changed = true;
                        }
                        if let Some(server_id) = adopt {
                            quote.attach_server_id(server_id);
                            changed = true;
                        }
                    }
                    None => {
                        // Fields were validated by `ImportedQuote::parse`.
                        if let Ok(quote) = Quote::new(&imported.text, &imported.category) {
                            let quote = match imported.server_id {
                                Some(server_id) => quote.with_server_id(server_id),
                                None => quote,
                            };
                            state.quotes.push(quote);
                            outcome.added += 1;
                            changed = true;
                        }
                    }
                }
            }

            changed.then(|| (state.quotes.clone(), self.persistence.next_generation()))
        };

        if let Some((quotes, generation)) = to_save {
            self.persist_quotes(&quotes, generation).await;
        }

        info!(
            accepted = outcome.accepted,
            rejected = outcome.rejected,
            "Import merged"
        );
        self.emit(StoreEvent::Imported {
            accepted: outcome.accepted,
            rejected: outcome.rejected,
        });
        outcome
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    /// Saves that failed since startup. The in-memory state is kept either way.
    pub fn persist_failures(&self) -> u64 {
        self.persist_failures.load(Ordering::Relaxed)
    }

    pub(crate) fn emit(&self, event: StoreEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    async fn persist_quotes(&self, quotes: &[Quote], generation: u64) {
        if let Err(e) = self.persistence.save_quotes(quotes, generation).await {
            self.persist_failures.fetch_add(1, Ordering::Relaxed);
            error!(error = %e, generation, "Failed to persist quotes");
        }
    }
}
