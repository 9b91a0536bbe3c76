//! The per-keystroke fetch → parse → match pipeline.
//!
//! Every query is stamped with a [`QueryToken`]. Only the most recently
//! issued token may install snapshots or surface results; anything a stale
//! query produces is dropped when it arrives.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::{
    Entity, EntityState, LineFormat, Matcher, Query, ResultItem, Source, SourceError,
    UnavailableCause,
};

/// A source plus everything the pipeline needs to turn its output into results.
pub struct Registration {
    pub source: Arc<dyn Source>,
    pub format: LineFormat,
    /// Text prefix that routes a query to this source alone.
    pub trigger: Option<String>,
}

impl Registration {
    pub fn new(source: Arc<dyn Source>, format: LineFormat) -> Self {
        Self {
            source,
            format,
            trigger: None,
        }
    }

    pub fn with_trigger(mut self, trigger: impl Into<String>) -> Self {
        self.trigger = Some(trigger.into());
        self
    }
}

#[derive(Default)]
pub struct Catalog {
    pub sources: Vec<Registration>,
    pub matcher: Matcher,
}

impl Catalog {
    fn find(&self, name: &str) -> Option<&Registration> {
        self.sources.iter().find(|r| r.source.name() == name)
    }

    /// Picks the sources a query goes to and the text they match against.
    fn route<'q>(&self, text: &'q str) -> (Vec<usize>, &'q str) {
        for (index, registration) in self.sources.iter().enumerate() {
            if let Some(rest) = registration
                .trigger
                .as_deref()
                .and_then(|trigger| text.strip_prefix(trigger))
            {
                return (vec![index], rest);
            }
        }
        ((0..self.sources.len()).collect(), text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueryToken(u64);

impl QueryToken {
    pub fn value(self) -> u64 {
        self.0
    }
}

/// Where a single query is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    Pending,
    AdapterRunning,
    Parsing,
    Matching,
    Completed,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Hit {
    pub source: String,
    pub item: ResultItem,
    pub description: Option<String>,
    pub icon: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchOutcome {
    pub token: QueryToken,
    pub hits: Vec<Hit>,
    /// Sources that failed while others answered.
    pub notices: Vec<SourceError>,
}

/// The latest result handed to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct Surfaced {
    pub token: QueryToken,
    pub result: Result<SearchOutcome, SourceError>,
}

pub struct Submission {
    pub token: QueryToken,
    /// Resolves to whether the result was surfaced.
    pub task: JoinHandle<bool>,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("query was superseded by a newer one")]
    Cancelled,

    #[error("unknown source '{0}'")]
    UnknownSource(String),

    #[error(transparent)]
    Source(#[from] SourceError),
}

pub struct Pipeline {
    catalog: RwLock<Arc<Catalog>>,
    current: AtomicU64,
    snapshots: Mutex<HashMap<String, Arc<[Entity]>>>,
    surfaced: watch::Sender<Option<Surfaced>>,
}

impl Pipeline {
    pub fn new(catalog: Catalog) -> Self {
        let (surfaced, _) = watch::channel(None);
        Self {
            catalog: RwLock::new(Arc::new(catalog)),
            current: AtomicU64::new(0),
            snapshots: Mutex::new(HashMap::new()),
            surfaced,
        }
    }

    /// Replaces the catalog wholesale. Snapshots are dropped and any query
    /// still in flight becomes stale.
    pub fn install(&self, catalog: Catalog) {
        let names: Vec<_> = catalog
            .sources
            .iter()
            .map(|r| r.source.name().to_owned())
            .collect();
        *self.catalog.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(catalog);
        {
            // Runs check the token under this lock before writing snapshots.
            let mut snapshots = self.snapshots.lock().unwrap_or_else(PoisonError::into_inner);
            self.current.fetch_add(1, Ordering::SeqCst);
            snapshots.clear();
        }
        info!(sources = ?names, "installed source catalog");
    }

    pub fn source_names(&self) -> Vec<String> {
        self.catalog()
            .sources
            .iter()
            .map(|r| r.source.name().to_owned())
            .collect()
    }

    /// The entities from `source`'s most recent current listing.
    pub fn snapshot(&self, source: &str) -> Option<Arc<[Entity]>> {
        self.snapshots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(source)
            .cloned()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Surfaced>> {
        self.surfaced.subscribe()
    }

    /// Makes a new query current, superseding all earlier ones.
    pub fn issue(&self) -> QueryToken {
        QueryToken(self.current.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub fn is_current(&self, token: QueryToken) -> bool {
        self.current.load(Ordering::SeqCst) == token.0
    }

    /// Runs one query to completion.
    ///
    /// Returns [`EngineError::Cancelled`] if a newer query was issued before
    /// this one finished, and [`EngineError::Source`] if every source it was
    /// routed to failed.
    pub async fn search(&self, query: Query) -> Result<SearchOutcome, EngineError> {
        let token = self.issue();
        self.run(token, query).await
    }

    /// Runs a query in the background and publishes its result to
    /// subscribers if it is still the newest one when it finishes.
    pub fn submit(self: &Arc<Self>, query: Query) -> Submission {
        let token = self.issue();
        let pipeline = Arc::clone(self);
        let task = tokio::spawn(async move {
            let result = match pipeline.run(token, query).await {
                Ok(outcome) => Ok(outcome),
                Err(EngineError::Source(err)) => Err(err),
                Err(_) => return false,
            };
            pipeline.publish(Surfaced { token, result })
        });
        Submission { token, task }
    }

    fn publish(&self, surfaced: Surfaced) -> bool {
        let token = surfaced.token;
        let published = self.surfaced.send_if_modified(|slot| {
            let newer_shown = slot.as_ref().is_some_and(|shown| shown.token > token);
            if newer_shown || !self.is_current(token) {
                return false;
            }
            *slot = Some(surfaced);
            true
        });
        if !published {
            debug!(token = token.0, state = ?QueryState::Cancelled, "discarded stale result");
        }
        published
    }

    /// Activates `entity_id` from `source`, using the entity as last listed
    /// when it is in the current snapshot.
    pub async fn activate(&self, source: &str, entity_id: &str) -> Result<Entity, EngineError> {
        let catalog = self.catalog();
        let registration = catalog
            .find(source)
            .ok_or_else(|| EngineError::UnknownSource(source.to_owned()))?;

        let entity = self
            .snapshot(source)
            .and_then(|entities| entities.iter().find(|e| e.id == entity_id).cloned())
            .unwrap_or_else(|| Entity {
                id: entity_id.to_owned(),
                display_name: entity_id.to_owned(),
                state: EntityState::Unknown,
                raw: String::new(),
            });

        registration.source.activate(&entity).await?;
        info!(source, id = entity_id, "activated entity");
        Ok(entity)
    }

    fn catalog(&self) -> Arc<Catalog> {
        Arc::clone(&self.catalog.read().unwrap_or_else(PoisonError::into_inner))
    }

    async fn run(&self, token: QueryToken, query: Query) -> Result<SearchOutcome, EngineError> {
        let catalog = self.catalog();
        let (targets, text) = catalog.route(query.text());
        debug!(
            token = token.0,
            state = ?QueryState::Pending,
            query = query.text(),
            sources = targets.len()
        );

        debug!(token = token.0, state = ?QueryState::AdapterRunning);
        let mut fetched: Vec<Option<Result<Vec<String>, SourceError>>> = vec![None; targets.len()];
        let mut tasks = JoinSet::new();
        for (slot, &index) in targets.iter().enumerate() {
            let source = Arc::clone(&catalog.sources[index].source);
            let mode = query.mode();
            tasks.spawn(async move { (slot, source.fetch(mode).await) });
        }
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((slot, result)) => fetched[slot] = Some(result),
                Err(err) => warn!(token = token.0, "fetch task failed: {err}"),
            }
        }

        if !self.is_current(token) {
            debug!(token = token.0, state = ?QueryState::Cancelled);
            return Err(EngineError::Cancelled);
        }

        debug!(token = token.0, state = ?QueryState::Parsing);
        let mut listings: Vec<(&Registration, Arc<[Entity]>)> = Vec::new();
        let mut notices = Vec::new();
        for (&index, result) in targets.iter().zip(fetched) {
            let registration = &catalog.sources[index];
            let result = result.unwrap_or_else(|| {
                Err(SourceError::AdapterUnavailable {
                    adapter: registration.source.name().to_owned(),
                    cause: UnavailableCause::Io("fetch task aborted".into()),
                })
            });
            match result {
                Ok(lines) => {
                    let entities: Arc<[Entity]> = registration.format.parse(&lines).into();
                    listings.push((registration, entities));
                }
                Err(err) => {
                    warn!(token = token.0, "{err}");
                    notices.push(err);
                }
            }
        }

        {
            let mut snapshots = self.snapshots.lock().unwrap_or_else(PoisonError::into_inner);
            if !self.is_current(token) {
                debug!(token = token.0, state = ?QueryState::Cancelled);
                return Err(EngineError::Cancelled);
            }
            for (registration, entities) in &listings {
                snapshots.insert(registration.source.name().to_owned(), Arc::clone(entities));
            }
        }

        if listings.is_empty() && !notices.is_empty() {
            debug!(token = token.0, state = ?QueryState::Failed);
            return Err(EngineError::Source(notices.swap_remove(0)));
        }

        debug!(token = token.0, state = ?QueryState::Matching);
        let mut hits: Vec<Hit> = listings
            .iter()
            .flat_map(|(registration, entities)| {
                let source = &registration.source;
                catalog
                    .matcher
                    .rank(entities, text)
                    .into_iter()
                    .map(move |item| Hit {
                        source: source.name().to_owned(),
                        description: source.describe(&item.entity),
                        icon: source.icon().map(str::to_owned),
                        item,
                    })
            })
            .collect();
        hits.sort_by(|a, b| b.item.score.total_cmp(&a.item.score));

        if !self.is_current(token) {
            debug!(token = token.0, state = ?QueryState::Cancelled);
            return Err(EngineError::Cancelled);
        }
        debug!(token = token.0, state = ?QueryState::Completed, hits = hits.len());
        Ok(SearchOutcome {
            token,
            hits,
            notices,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::oneshot;

    use super::*;
    use crate::{QueryMode, StateRule};

    type Reply = Result<Vec<String>, SourceError>;

    /// Answers each fetch with the next queued reply, waiting until the test
    /// releases it.
    struct Scripted {
        name: &'static str,
        replies: Mutex<VecDeque<oneshot::Receiver<Reply>>>,
        calls: AtomicU64,
        modes: Mutex<Vec<QueryMode>>,
        activated: Mutex<Vec<Entity>>,
    }

    impl Scripted {
        fn new(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                replies: Mutex::new(VecDeque::new()),
                calls: AtomicU64::new(0),
                modes: Mutex::new(Vec::new()),
                activated: Mutex::new(Vec::new()),
            })
        }

        fn gate(&self) -> oneshot::Sender<Reply> {
            let (tx, rx) = oneshot::channel();
            self.replies.lock().unwrap().push_back(rx);
            tx
        }

        fn ready(&self, reply: Reply) {
            let _ = self.gate().send(reply);
        }

        async fn wait_for_calls(&self, calls: u64) {
            while self.calls.load(Ordering::SeqCst) < calls {
                tokio::task::yield_now().await;
            }
        }
    }

    #[async_trait]
    impl Source for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        fn describe(&self, entity: &Entity) -> Option<String> {
            Some(format!("Connect to {}", entity.display_name))
        }

        async fn fetch(&self, mode: QueryMode) -> Result<Vec<String>, SourceError> {
            let reply = {
                self.modes.lock().unwrap().push(mode);
                self.replies.lock().unwrap().pop_front()
            };
            self.calls.fetch_add(1, Ordering::SeqCst);
            match reply {
                Some(rx) => rx.await.unwrap_or_else(|_| Ok(Vec::new())),
                None => Ok(Vec::new()),
            }
        }

        async fn activate(&self, entity: &Entity) -> Result<(), SourceError> {
            self.activated.lock().unwrap().push(entity.clone());
            Ok(())
        }
    }

    fn lines(rows: &[&str]) -> Reply {
        Ok(rows.iter().map(|r| r.to_string()).collect())
    }

    fn pipe_format() -> LineFormat {
        LineFormat::Delimited {
            separator: '|',
            id: 0,
            name: 1,
            state: Some(2),
            require: Vec::new(),
            state_rule: StateRule::default(),
        }
    }

    fn pipeline_with(sources: Vec<Registration>) -> Arc<Pipeline> {
        Arc::new(Pipeline::new(Catalog {
            sources,
            matcher: Matcher::default(),
        }))
    }

    fn timeout_error(name: &str) -> SourceError {
        SourceError::AdapterUnavailable {
            adapter: name.into(),
            cause: UnavailableCause::Timeout(Duration::from_secs(3)),
        }
    }

    fn titles(outcome: &SearchOutcome) -> Vec<&str> {
        outcome
            .hits
            .iter()
            .map(|h| h.item.entity.display_name.as_str())
            .collect()
    }

    #[tokio::test]
    async fn search_dedups_and_ranks_listing() {
        let wifi = Scripted::new("wifi");
        wifi.ready(lines(&["1|Home WiFi|", "2|Office WiFi|", "2|Office-WiFi-5G|wlan0"]));
        let pipeline = pipeline_with(vec![Registration::new(wifi.clone(), pipe_format())]);

        let outcome = pipeline.search(Query::known("wifi")).await.unwrap();

        assert_eq!(titles(&outcome), ["Home WiFi", "Office-WiFi-5G"]);
        assert_eq!(outcome.hits[0].item.score, outcome.hits[1].item.score);
        assert_eq!(outcome.hits[1].source, "wifi");
        assert_eq!(outcome.hits[1].description.as_deref(), Some("Connect to Office-WiFi-5G"));
        assert_eq!(pipeline.snapshot("wifi").unwrap().len(), 2);
    }

    #[tokio::test]
    async fn superseded_search_is_cancelled_even_if_it_resolves_last() {
        let wifi = Scripted::new("wifi");
        let first = wifi.gate();
        let second = wifi.gate();
        let pipeline = pipeline_with(vec![Registration::new(wifi.clone(), pipe_format())]);

        let p = Arc::clone(&pipeline);
        let a = tokio::spawn(async move { p.search(Query::known("home")).await });
        wifi.wait_for_calls(1).await;
        let p = Arc::clone(&pipeline);
        let b = tokio::spawn(async move { p.search(Query::known("office")).await });
        wifi.wait_for_calls(2).await;

        second.send(lines(&["2|Office WiFi|"])).unwrap();
        let b = b.await.unwrap().unwrap();
        first.send(lines(&["1|Home WiFi|"])).unwrap();
        let a = a.await.unwrap();

        assert_eq!(a, Err(EngineError::Cancelled));
        assert_eq!(titles(&b), ["Office WiFi"]);
        let snapshot = pipeline.snapshot("wifi").unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, "2");
    }

    #[tokio::test]
    async fn only_latest_submission_is_surfaced() {
        let wifi = Scripted::new("wifi");
        let first = wifi.gate();
        let second = wifi.gate();
        let pipeline = pipeline_with(vec![Registration::new(wifi.clone(), pipe_format())]);
        let updates = pipeline.subscribe();

        let a = pipeline.submit(Query::known("home"));
        wifi.wait_for_calls(1).await;
        let b = pipeline.submit(Query::known("office"));
        wifi.wait_for_calls(2).await;
        assert!(a.token < b.token);

        second.send(lines(&["2|Office WiFi|"])).unwrap();
        assert!(b.task.await.unwrap());
        first.send(lines(&["1|Home WiFi|"])).unwrap();
        assert!(!a.task.await.unwrap());

        let shown = updates.borrow().clone().unwrap();
        assert_eq!(shown.token, b.token);
        assert_eq!(titles(shown.result.as_ref().unwrap()), ["Office WiFi"]);
    }

    #[tokio::test]
    async fn adapter_timeout_fails_and_pipeline_keeps_serving() {
        let wifi = Scripted::new("wifi");
        wifi.ready(Err(timeout_error("wifi")));
        wifi.ready(lines(&["1|Home WiFi|"]));
        let pipeline = pipeline_with(vec![Registration::new(wifi.clone(), pipe_format())]);

        let failed = pipeline.search(Query::known("home")).await;
        assert_eq!(failed, Err(EngineError::Source(timeout_error("wifi"))));
        assert!(pipeline.snapshot("wifi").is_none());

        let outcome = pipeline.search(Query::known("home")).await.unwrap();
        assert_eq!(titles(&outcome), ["Home WiFi"]);
    }

    #[tokio::test]
    async fn partial_failure_reports_notice() {
        let wifi = Scripted::new("wifi");
        let windows = Scripted::new("windows");
        wifi.ready(Err(timeout_error("wifi")));
        windows.ready(lines(&["0x1|Terminal|", "0x2|Browser|"]));
        let pipeline = pipeline_with(vec![
            Registration::new(wifi.clone(), pipe_format()),
            Registration::new(windows.clone(), pipe_format()),
        ]);

        let outcome = pipeline.search(Query::known("")).await.unwrap();

        assert_eq!(titles(&outcome), ["Terminal", "Browser"]);
        assert_eq!(outcome.notices, [timeout_error("wifi")]);
    }

    #[tokio::test]
    async fn trigger_routes_to_one_source_and_strips_prefix() {
        let wifi = Scripted::new("wifi");
        let windows = Scripted::new("windows");
        wifi.ready(lines(&["1|Home WiFi|", "2|Office|"]));
        let pipeline = pipeline_with(vec![
            Registration::new(windows.clone(), pipe_format()),
            Registration::new(wifi.clone(), pipe_format()).with_trigger("wifi "),
        ]);

        let outcome = pipeline
            .search(Query::new("wifi home", QueryMode::Discover))
            .await
            .unwrap();

        assert_eq!(titles(&outcome), ["Home WiFi"]);
        assert_eq!(*wifi.modes.lock().unwrap(), [QueryMode::Discover]);
        assert_eq!(windows.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn merged_results_order_by_score_then_catalog() {
        let wifi = Scripted::new("wifi");
        let windows = Scripted::new("windows");
        wifi.ready(lines(&["1|My Home|", "2|Home Net|"]));
        windows.ready(lines(&["0x1|Home - Browser|"]));
        let pipeline = pipeline_with(vec![
            Registration::new(wifi.clone(), pipe_format()),
            Registration::new(windows.clone(), pipe_format()),
        ]);

        let outcome = pipeline.search(Query::known("home")).await.unwrap();

        assert_eq!(titles(&outcome), ["Home Net", "Home - Browser", "My Home"]);
    }

    #[tokio::test]
    async fn activate_uses_snapshot_entity() {
        let wifi = Scripted::new("wifi");
        wifi.ready(lines(&["1|Home WiFi|wlan0"]));
        let pipeline = pipeline_with(vec![Registration::new(wifi.clone(), pipe_format())]);
        pipeline.search(Query::known("")).await.unwrap();

        let entity = pipeline.activate("wifi", "1").await.unwrap();
        assert_eq!(entity.state, EntityState::Connected);
        assert_eq!(entity.display_name, "Home WiFi");

        let stub = pipeline.activate("wifi", "9").await.unwrap();
        assert_eq!(stub.state, EntityState::Unknown);
        assert_eq!(wifi.activated.lock().unwrap().len(), 2);

        assert_eq!(
            pipeline.activate("bluetooth", "1").await,
            Err(EngineError::UnknownSource("bluetooth".into()))
        );
    }

    #[tokio::test]
    async fn install_replaces_catalog_and_snapshots() {
        let wifi = Scripted::new("wifi");
        wifi.ready(lines(&["1|Home WiFi|"]));
        let pipeline = pipeline_with(vec![Registration::new(wifi.clone(), pipe_format())]);
        pipeline.search(Query::known("")).await.unwrap();
        assert!(pipeline.snapshot("wifi").is_some());

        let windows = Scripted::new("windows");
        pipeline.install(Catalog {
            sources: vec![Registration::new(windows.clone(), pipe_format())],
            matcher: Matcher::default(),
        });

        assert!(pipeline.snapshot("wifi").is_none());
        assert_eq!(pipeline.source_names(), ["windows"]);
    }

    #[tokio::test]
    async fn install_during_fetch_leaves_no_stale_snapshot() {
        let wifi = Scripted::new("wifi");
        let gate = wifi.gate();
        let pipeline = pipeline_with(vec![Registration::new(wifi.clone(), pipe_format())]);

        let p = Arc::clone(&pipeline);
        let search = tokio::spawn(async move { p.search(Query::known("home")).await });
        wifi.wait_for_calls(1).await;
        pipeline.install(Catalog {
            sources: vec![Registration::new(Scripted::new("windows"), pipe_format())],
            matcher: Matcher::default(),
        });
        gate.send(lines(&["1|Home WiFi|"])).unwrap();

        assert_eq!(search.await.unwrap(), Err(EngineError::Cancelled));
        assert!(pipeline.snapshot("wifi").is_none());
    }

    #[tokio::test]
    async fn no_sources_completes_empty() {
        let pipeline = pipeline_with(Vec::new());
        let outcome = pipeline.search(Query::known("anything")).await.unwrap();
        assert!(outcome.hits.is_empty());
        assert!(outcome.notices.is_empty());
    }
}
