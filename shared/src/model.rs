use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::{ALL_CATEGORIES, MAX_CATEGORY_LENGTH, MAX_TEXT_LENGTH, PUSH_USER_ID};

// --- Typed IDs ---

macro_rules! typed_id {
    ($name:ident) => {
        #[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
        pub struct $name(String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

typed_id!(LocalId);
typed_id!(ServerId);

impl LocalId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("quote text cannot be empty")]
    EmptyText,
    #[error("quote category cannot be empty")]
    EmptyCategory,
    #[error("{field} too long ({len} > {max})")]
    TooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },
    #[error("{field} is not trimmed")]
    NotTrimmed { field: &'static str },
}

/// Trims both fields and enforces the non-empty and length bounds.
pub(crate) fn validate_fields(
    text: &str,
    category: &str,
) -> Result<(String, String), ValidationError> {
    let text = text.trim();
    let category = category.trim();

    if text.is_empty() {
        return Err(ValidationError::EmptyText);
    }
    if category.is_empty() {
        return Err(ValidationError::EmptyCategory);
    }
    if text.len() > MAX_TEXT_LENGTH {
        return Err(ValidationError::TooLong {
            field: "text",
            len: text.len(),
            max: MAX_TEXT_LENGTH,
        });
    }
    if category.len() > MAX_CATEGORY_LENGTH {
        return Err(ValidationError::TooLong {
            field: "category",
            len: category.len(),
            max: MAX_CATEGORY_LENGTH,
        });
    }

    Ok((text.to_string(), category.to_string()))
}

// --- Quote ---

/// A stored quote. `category` keeps the casing it was entered with;
/// comparisons go through the owning store's [`CasePolicy`].
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Quote {
    id: LocalId,
    text: String,
    category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    server_id: Option<ServerId>,
}

impl Quote {
    pub fn new(text: &str, category: &str) -> Result<Self, ValidationError> {
        let (text, category) = validate_fields(text, category)?;
        Ok(Self {
            id: LocalId::generate(),
            text,
            category,
            server_id: None,
        })
    }

    #[must_use]
    pub fn with_server_id(mut self, server_id: ServerId) -> Self {
        self.server_id = Some(server_id);
        self
    }

    #[must_use]
    pub fn id(&self) -> &LocalId {
        &self.id
    }

    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    #[must_use]
    pub fn category(&self) -> &str {
        &self.category
    }

    #[must_use]
    pub fn server_id(&self) -> Option<&ServerId> {
        self.server_id.as_ref()
    }

    #[must_use]
    pub fn is_local_only(&self) -> bool {
        self.server_id.is_none()
    }

    /// Re-checks invariants on a value that bypassed [`Quote::new`],
    /// e.g. one read back from storage.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let (text, category) = validate_fields(&self.text, &self.category)?;
        if text != self.text {
            return Err(ValidationError::NotTrimmed { field: "text" });
        }
        if category != self.category {
            return Err(ValidationError::NotTrimmed { field: "category" });
        }
        Ok(())
    }

    pub(crate) fn set_category(&mut self, category: String) {
        self.category = category;
    }

    pub(crate) fn attach_server_id(&mut self, server_id: ServerId) {
        self.server_id = Some(server_id);
    }
}

/// The quotes a fresh store starts with.
#[must_use]
pub fn default_seed() -> Vec<Quote> {
    const SEED: &[(&str, &str)] = &[
        ("The only way to do great work is to love what you do.", "motivational"),
        ("Life is what happens when you're busy making other plans.", "life"),
        ("You miss 100% of the shots you don't take.", "motivational"),
        ("I think, therefore I am.", "philosophy"),
        ("Code is like humor. When you have to explain it, it's bad.", "programming"),
        ("Simplicity is the soul of efficiency.", "design"),
    ];

    SEED.iter()
        .filter_map(|(text, category)| Quote::new(text, category).ok())
        .collect()
}

// --- Category policy ---

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CasePolicy {
    Sensitive,
    #[default]
    Lowercase,
}

impl CasePolicy {
    /// Folds whitespace runs to a single space, then applies the case rule.
    #[must_use]
    pub fn normalize(self, raw: &str) -> String {
        let folded = raw.split_whitespace().collect::<Vec<_>>().join(" ");
        match self {
            CasePolicy::Sensitive => folded,
            CasePolicy::Lowercase => folded.to_lowercase(),
        }
    }

    #[must_use]
    pub fn same_category(self, a: &str, b: &str) -> bool {
        self.normalize(a) == self.normalize(b)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMode {
    /// Every candidate has probability 1/N on every call.
    #[default]
    Independent,
    /// Never shows the last viewed quote twice in a row unless it is the only candidate.
    NoImmediateRepeat,
}

/// Upper-cases the first character for display, leaving the rest alone.
#[must_use]
pub fn display_label(category: &str) -> String {
    let mut chars = category.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

// --- Filter ---

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(from = "String", into = "String")]
pub enum Filter {
    #[default]
    All,
    Category(String),
}

impl Filter {
    /// Parses a filter value; the sentinel is matched case-insensitively.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case(ALL_CATEGORIES) {
            Filter::All
        } else {
            Filter::Category(trimmed.to_string())
        }
    }

    #[must_use]
    pub fn matches(&self, policy: CasePolicy, category: &str) -> bool {
        match self {
            Filter::All => true,
            Filter::Category(wanted) => policy.same_category(wanted, category),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Filter::All => ALL_CATEGORIES,
            Filter::Category(c) => c,
        }
    }
}

impl From<String> for Filter {
    fn from(raw: String) -> Self {
        Filter::parse(&raw)
    }
}

impl From<Filter> for String {
    fn from(filter: Filter) -> Self {
        filter.as_str().to_string()
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FilterState {
    pub selected_category: Filter,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct LastViewed {
    pub quote: Quote,
}

// --- Remote wire shapes ---

/// An item as returned by `GET <endpoint>`. Unknown fields are ignored.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteQuote {
    #[serde(default)]
    pub id: Option<serde_json::Value>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub user_id: Option<u64>,
}

/// A remote item after the declared transform, ready to merge.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteCandidate {
    pub text: String,
    pub category: String,
    pub server_id: Option<ServerId>,
}

impl RemoteQuote {
    #[must_use]
    pub fn server_id(&self) -> Option<ServerId> {
        server_id_from_json(self.id.as_ref()?)
    }

    /// `title → text`, `userId → "user-{id}"`, `id → serverId`.
    /// Returns `None` when the mapped fields fail quote validation.
    #[must_use]
    pub fn to_candidate(&self, default_category: &str) -> Option<RemoteCandidate> {
        let category = match self.user_id {
            Some(user) => format!("user-{user}"),
            None => default_category.to_string(),
        };
        let (text, category) = validate_fields(self.title.as_deref()?, &category).ok()?;
        Some(RemoteCandidate {
            text,
            category,
            server_id: self.server_id(),
        })
    }
}

pub(crate) fn server_id_from_json(value: &serde_json::Value) -> Option<ServerId> {
    match value {
        serde_json::Value::Number(n) => Some(ServerId::new(n.to_string())),
        serde_json::Value::String(s) if !s.trim().is_empty() => Some(ServerId::new(s.trim())),
        _ => None,
    }
}

/// Body of `POST <endpoint>`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingQuote {
    pub title: String,
    pub body: String,
    pub user_id: u64,
}

impl From<&Quote> for OutgoingQuote {
    fn from(quote: &Quote) -> Self {
        Self {
            title: quote.text.clone(),
            body: quote.category.clone(),
            user_id: PUSH_USER_ID,
        }
    }
}
