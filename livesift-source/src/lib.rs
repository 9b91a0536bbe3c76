use std::ops::Range;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod matcher;
pub mod parser;
pub mod pipeline;

pub use matcher::{MatchWeights, Matcher};
pub use parser::{ActiveWhen, FieldFilter, LineFormat, StateRule};
pub use pipeline::{
    Catalog, EngineError, Hit, Pipeline, QueryState, QueryToken, Registration, SearchOutcome,
    Submission, Surfaced,
};

/// Lifecycle state of a discoverable item as reported by its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntityState {
    Connected,
    Disconnected,
    Focused,
    Unfocused,
    #[default]
    Unknown,
}

impl EntityState {
    /// Whether activating this entity would toggle it off rather than on.
    pub fn is_active(self) -> bool {
        matches!(self, EntityState::Connected | EntityState::Focused)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EntityState::Connected => "connected",
            EntityState::Disconnected => "disconnected",
            EntityState::Focused => "focused",
            EntityState::Unfocused => "unfocused",
            EntityState::Unknown => "unknown",
        }
    }
}

/// One normalized item from a single listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    /// Unique within the snapshot that produced it.
    pub id: String,
    pub display_name: String,
    pub state: EntityState,
    /// The original line (or JSON object) this entity was parsed from.
    pub raw: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueryMode {
    /// Enumerate what the system already knows about.
    #[default]
    Known,
    /// Trigger an active scan, then enumerate.
    Discover,
}

/// The user's typed text for one keystroke.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    text: String,
    mode: QueryMode,
}

impl Query {
    pub fn new(text: impl Into<String>, mode: QueryMode) -> Self {
        Self {
            text: text.into(),
            mode,
        }
    }

    pub fn known(text: impl Into<String>) -> Self {
        Self::new(text, QueryMode::Known)
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn mode(&self) -> QueryMode {
        self.mode
    }
}

/// A matched entity with its relevance and display highlights.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultItem {
    pub entity: Entity,
    /// Higher is more relevant.
    pub score: f64,
    /// Character (not byte) ranges into `entity.display_name`.
    pub highlights: Vec<Range<usize>>,
}

/// Why an enumeration command produced no usable listing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnavailableCause {
    #[error("command not found")]
    NotFound,

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("exited with {}: {stderr}", exit_label(.code))]
    ExitStatus { code: Option<i32>, stderr: String },

    #[error("{0}")]
    Io(String),
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {code}"),
        None => "signal".to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("source '{adapter}' unavailable: {cause}")]
    AdapterUnavailable {
        adapter: String,
        cause: UnavailableCause,
    },

    #[error("activation of '{id}' failed: {reason}")]
    ActivationFailed { id: String, reason: String },
}

/// The boundary to an external enumeration and activation mechanism.
///
/// Implementations only produce raw lines; parsing and matching happen in
/// the [`Pipeline`].
#[async_trait]
pub trait Source: Send + Sync {
    /// Returns the name of the source. Must not contain `::`.
    fn name(&self) -> &str;

    /// Icon name hint for hosts that render one.
    fn icon(&self) -> Option<&str> {
        None
    }

    /// Human-readable label for what activating `entity` would do.
    fn describe(&self, _entity: &Entity) -> Option<String> {
        None
    }

    /// Called by the pipeline to get the raw listing for `mode`.
    async fn fetch(&self, mode: QueryMode) -> Result<Vec<String>, SourceError>;

    /// Connects, focuses or otherwise acts on `entity`.
    async fn activate(&self, entity: &Entity) -> Result<(), SourceError>;
}
