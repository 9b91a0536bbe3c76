use std::sync::Arc;

use livesift_source::{EngineError, Hit, Pipeline, Query, QueryMode, SearchOutcome};
use serde::{Deserialize, Serialize};
use tracing::warn;
use zbus::{interface, zvariant::Type};

pub const BUS_NAME: &str = "org.livesift.Engine";
pub const OBJECT_PATH: &str = "/org/livesift/Engine1";

/// Separates the source name from the entity id in a result id.
const ID_SEPARATOR: &str = "::";

pub struct Engine {
    pipeline: Arc<Pipeline>,
}

impl Engine {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self { pipeline }
    }
}

#[derive(Debug, Clone, PartialEq, Type, Serialize, Deserialize)]
pub struct DbusResultItem {
    id: String,
    title: String,
    description: String,
    icon: String,
    state: String,
    score: f64,
    highlights: Vec<(u32, u32)>,
}

impl From<Hit> for DbusResultItem {
    fn from(hit: Hit) -> Self {
        let entity = hit.item.entity;
        Self {
            id: format!("{}{ID_SEPARATOR}{}", hit.source, entity.id),
            title: entity.display_name,
            description: hit.description.unwrap_or_default(),
            icon: hit.icon.unwrap_or_default(),
            state: entity.state.as_str().to_string(),
            score: hit.item.score,
            highlights: hit
                .item
                .highlights
                .into_iter()
                .map(|span| (span.start as u32, span.end as u32))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Type, Serialize, Deserialize)]
pub struct DbusSearchReply {
    /// `completed`, `cancelled` or `unavailable`.
    status: String,
    notices: Vec<String>,
    items: Vec<DbusResultItem>,
}

impl From<Result<SearchOutcome, EngineError>> for DbusSearchReply {
    fn from(result: Result<SearchOutcome, EngineError>) -> Self {
        match result {
            Ok(outcome) => Self {
                status: "completed".into(),
                notices: outcome.notices.iter().map(ToString::to_string).collect(),
                items: outcome.hits.into_iter().map(DbusResultItem::from).collect(),
            },
            Err(EngineError::Cancelled) => Self {
                status: "cancelled".into(),
                notices: Vec::new(),
                items: Vec::new(),
            },
            Err(err) => Self {
                status: "unavailable".into(),
                notices: vec![err.to_string()],
                items: Vec::new(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Type, Serialize, Deserialize)]
pub struct DbusActivateReply {
    ok: bool,
    message: String,
}

fn split_id(id: &str) -> Option<(&str, &str)> {
    id.split_once(ID_SEPARATOR)
        .filter(|(source, entity)| !source.is_empty() && !entity.is_empty())
}

#[interface(name = "org.livesift.Engine1")]
impl Engine {
    async fn search(&self, query: &str, discover: bool) -> DbusSearchReply {
        let mode = if discover {
            QueryMode::Discover
        } else {
            QueryMode::Known
        };
        self.pipeline.search(Query::new(query, mode)).await.into()
    }

    async fn activate(&self, id: &str) -> DbusActivateReply {
        let Some((source, entity_id)) = split_id(id) else {
            return DbusActivateReply {
                ok: false,
                message: format!("malformed result id '{id}'"),
            };
        };
        match self.pipeline.activate(source, entity_id).await {
            Ok(entity) => DbusActivateReply {
                ok: true,
                message: entity.display_name,
            },
            Err(err) => {
                warn!("{err}");
                DbusActivateReply {
                    ok: false,
                    message: err.to_string(),
                }
            }
        }
    }

    fn sources(&self) -> Vec<String> {
        self.pipeline.source_names()
    }
}
