//! The live source set and everything that mutates it
//!
//! `TickerEngine` owns the sources, their URL grouping and their timers. Any
//! change to the set (add, edit, delete, move) runs the same pipeline:
//! normalise positions and persist, regroup by URL, cancel timers on
//! secondaries and start timers on newly promoted primaries.
//!
//! Lock order is source set, then settings store, then scheduler. Observer
//! callbacks and value log writes happen after the source set is unlocked.

use crate::alerts::{Alarm, AlarmEvaluator, Comparison};
use crate::config::{GlobalOptions, SettingsStore};
use crate::engine::SourceObserver;
use crate::error::{FetchError, SourceError, StoreError};
use crate::events::{FetchErrorKind, SourceId, SourceView};
use crate::scheduler::{PollTarget, RefreshScheduler, ScheduleStart};
use crate::sources::{
    parse_body, DeduplicationGrouper, Fetcher, Grouping, SequenceManager, Source, SourceDraft,
};
use crate::value_log::{LogEntry, ValueLog};
use chrono::Local;
use log::{debug, info, warn};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinSet;

struct SourceSet {
    /// Kept in display order
    sources: Vec<Source>,
    grouping: Grouping,
    next_id: u64,
}

impl SourceSet {
    fn index_of(&self, id: SourceId) -> Option<usize> {
        self.sources.iter().position(|source| source.id() == id)
    }

    fn get_mut(&mut self, id: SourceId) -> Result<&mut Source, SourceError> {
        self.sources
            .iter_mut()
            .find(|source| source.id() == id)
            .ok_or(SourceError::UnknownSource(id.0))
    }
}

/// Something an observer needs to hear about once the lock is released
enum Notice {
    Value(SourceView),
    Alarm(SourceView, String),
    Failed(SourceView, FetchErrorKind),
}

struct EngineInner {
    state: Mutex<SourceSet>,
    store: Arc<SettingsStore>,
    fetcher: Arc<dyn Fetcher>,
    observer: Arc<dyn SourceObserver>,
    value_log: Option<ValueLog>,
    runtime: Handle,
    scheduler: RefreshScheduler,
    grouper: DeduplicationGrouper,
    sequencer: SequenceManager,
    evaluator: AlarmEvaluator,
    running: AtomicBool,
}

/// Polls a set of JSON sources and keeps their settings on disk in sync
///
/// Cloning is cheap; clones share the same sources and timers.
#[derive(Clone)]
pub struct TickerEngine {
    inner: Arc<EngineInner>,
}

impl TickerEngine {
    /// Build the source set from the settings store
    ///
    /// Sources are ordered by their stored position, positions are made dense
    /// and written back, and URL groups are assigned. Nothing is polled until
    /// `start` is called.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn load(
        store: Arc<SettingsStore>,
        fetcher: Arc<dyn Fetcher>,
        observer: Arc<dyn SourceObserver>,
        value_log: Option<ValueLog>,
    ) -> Self {
        let runtime = Handle::current();
        let mut sources: Vec<Source> = store
            .records()
            .iter()
            .enumerate()
            .map(|(index, record)| Source::from_record(SourceId(index as u64), record))
            .collect();
        // Stable, so equal positions keep file order
        sources.sort_by_key(|source| source.sequence);
        for (index, source) in sources.iter_mut().enumerate() {
            source.sequence = index;
        }

        let inner = Arc::new(EngineInner {
            state: Mutex::new(SourceSet {
                next_id: sources.len() as u64,
                sources,
                grouping: Grouping::default(),
            }),
            store,
            fetcher,
            observer,
            value_log,
            scheduler: RefreshScheduler::new(runtime.clone()),
            runtime,
            grouper: DeduplicationGrouper::new(),
            sequencer: SequenceManager::new(),
            evaluator: AlarmEvaluator::new(),
            running: AtomicBool::new(false),
        });

        {
            let mut set = inner.lock();
            if let Err(e) = inner.sequencer.reorder(&mut set.sources, &inner.store) {
                warn!("Could not save normalised settings: {}", e);
            }
            inner.regroup(&mut set);
            info!(
                "Loaded {} source(s) across {} URL(s)",
                set.sources.len(),
                set.grouping.len()
            );
        }

        Self { inner }
    }

    /// Start polling
    ///
    /// Every primary or standalone source with an interval is scheduled with
    /// an immediate first poll; manual sources are polled once.
    pub fn start(&self) {
        self.inner.running.store(true, Ordering::SeqCst);
        let set = self.inner.lock();
        for source in set.sources.iter().filter(|s| s.role.polls()) {
            match source.refresh {
                Some(seconds) => self.inner.schedule(source.id(), seconds, ScheduleStart::Immediate),
                None => self.inner.spawn_poll(source.id()),
            }
        }
        info!("Started {} schedule(s)", self.inner.scheduler.scheduled_ids().len());
    }

    /// Stop every timer; sources stay loaded and can still be refreshed manually
    pub fn shutdown(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.scheduler.cancel_all();
        info!("Engine stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Whether `id` currently has a refresh timer
    pub fn is_scheduled(&self, id: SourceId) -> bool {
        self.inner.scheduler.is_scheduled(id)
    }

    /// Poll one source now
    ///
    /// A scheduled source has its timer restarted from now. A secondary
    /// fetches its URL for itself only.
    ///
    /// # Errors
    ///
    /// Returns `SourceError::UnknownSource` if no source has this id.
    pub async fn refresh(&self, id: SourceId) -> Result<(), SourceError> {
        self.inner.refresh(id).await
    }

    /// Poll every primary and standalone source, concurrently
    pub async fn refresh_all(&self) {
        let ids: Vec<SourceId> = {
            let set = self.inner.lock();
            set.sources
                .iter()
                .filter(|source| source.role.polls())
                .map(Source::id)
                .collect()
        };

        let mut polls = JoinSet::new();
        for id in ids {
            let inner = Arc::clone(&self.inner);
            polls.spawn_on(async move { inner.refresh(id).await }, &self.inner.runtime);
        }
        while let Some(result) = polls.join_next().await {
            match result {
                Ok(Err(e)) => debug!("Refresh skipped: {}", e),
                Err(e) => warn!("Refresh task failed: {}", e),
                Ok(Ok(())) => {}
            }
        }
    }

    /// Add a source and return its id
    ///
    /// # Errors
    ///
    /// Returns `SourceError::Store` if the settings cannot be saved.
    pub fn add_source(&self, draft: &SourceDraft) -> Result<SourceId, SourceError> {
        let inner = &self.inner;
        let mut set = inner.lock();
        let id = SourceId(set.next_id);
        set.next_id += 1;

        let source = Source::from_draft(id, draft, set.sources.len());
        info!("{}: Added ({})", source.name, source.url);
        set.sources.push(source);

        let saved = inner.sequencer.reorder(&mut set.sources, &inner.store);
        inner.regroup(&mut set);
        inner.poll_if_manual(&set, id);
        saved?;
        Ok(id)
    }

    /// Change a source's properties
    ///
    /// A new URL or interval regroups and restarts the source's timer. Any
    /// other change re-runs extraction against the last fetched response
    /// without a new request.
    ///
    /// # Errors
    ///
    /// Returns `SourceError::UnknownSource` for an unknown id and
    /// `SourceError::Store` if the settings cannot be saved.
    pub fn edit_source(&self, id: SourceId, draft: &SourceDraft) -> Result<(), SourceError> {
        let inner = &self.inner;
        let mut notices = Vec::new();
        let saved = {
            let mut set = inner.lock();
            let source = set.get_mut(id)?;
            let changes = source.apply_draft(draft);
            info!("{}: Edited", source.name);

            let rescheduled = changes.url || changes.refresh;
            if !rescheduled && source.reapply_last_tree() {
                notices.push(Notice::Value(source.view()));
            }
            if rescheduled {
                inner.scheduler.cancel(id);
            }

            let saved = inner.sequencer.reorder(&mut set.sources, &inner.store);
            inner.regroup(&mut set);
            if changes.url {
                inner.poll_if_manual(&set, id);
            }
            saved
        };
        inner.dispatch(notices);
        saved.map_err(SourceError::from)
    }

    /// Delete a source; a secondary in its URL group may be promoted
    ///
    /// # Errors
    ///
    /// Returns `SourceError::UnknownSource` for an unknown id and
    /// `SourceError::Store` if the settings cannot be saved.
    pub fn delete_source(&self, id: SourceId) -> Result<(), SourceError> {
        let inner = &self.inner;
        let mut set = inner.lock();
        let source = set.get_mut(id)?;
        source.removed = true;
        info!("{}: Deleted", source.name);
        inner.scheduler.cancel(id);

        let saved = inner.sequencer.reorder(&mut set.sources, &inner.store);
        inner.regroup(&mut set);
        saved.map_err(SourceError::from)
    }

    /// Move a source to a zero-based position, clamped to the end of the list
    ///
    /// # Errors
    ///
    /// Returns `SourceError::UnknownSource` for an unknown id and
    /// `SourceError::Store` if the settings cannot be saved.
    pub fn move_source(&self, id: SourceId, position: usize) -> Result<(), SourceError> {
        let inner = &self.inner;
        let mut set = inner.lock();
        set.get_mut(id)?.sequence = position;
        inner
            .sequencer
            .reorder(&mut set.sources, &inner.store)
            .map_err(SourceError::from)
    }

    /// Add an enabled alarm to a source
    ///
    /// # Returns
    ///
    /// Index of the new alarm in the source's list
    ///
    /// # Errors
    ///
    /// Returns `SourceError::InvalidThreshold` for a negative threshold,
    /// `SourceError::DuplicateAlarm` if the same condition already exists and
    /// `SourceError::Store` if the settings cannot be saved.
    pub fn add_alarm(
        &self,
        id: SourceId,
        comparison: Comparison,
        threshold: f64,
    ) -> Result<usize, SourceError> {
        let mut set = self.inner.lock();
        let source = set.get_mut(id)?;
        let index = source.add_alarm(comparison, threshold)?;
        info!("{}: Alarm added ({})", source.name, source.alarms[index]);
        self.inner.persist(&set)?;
        Ok(index)
    }

    /// Turn an alarm on or off; a fired alarm stays off until re-enabled here
    pub fn set_alarm_enabled(
        &self,
        id: SourceId,
        index: usize,
        enabled: bool,
    ) -> Result<(), SourceError> {
        let mut set = self.inner.lock();
        set.get_mut(id)?.set_alarm_enabled(index, enabled)?;
        self.inner.persist(&set)?;
        Ok(())
    }

    /// Delete an alarm; later alarms move down one index
    pub fn delete_alarm(&self, id: SourceId, index: usize) -> Result<(), SourceError> {
        let mut set = self.inner.lock();
        let source = set.get_mut(id)?;
        let removed = source.remove_alarm(index)?;
        info!("{}: Alarm deleted ({})", source.name, removed);
        self.inner.persist(&set)?;
        Ok(())
    }

    /// Replace the global display options
    pub fn set_global_options(&self, options: GlobalOptions) -> Result<(), SourceError> {
        let options = options.sanitized();
        self.inner
            .store
            .update(|document| document.global = options)?;
        Ok(())
    }

    pub fn global_options(&self) -> GlobalOptions {
        self.inner.store.global()
    }

    /// Every source in display order
    pub fn snapshot(&self) -> Vec<SourceView> {
        self.inner.lock().sources.iter().map(Source::view).collect()
    }

    /// One source by id
    pub fn source(&self, id: SourceId) -> Option<SourceView> {
        let set = self.inner.lock();
        set.index_of(id).map(|index| set.sources[index].view())
    }

    /// Alarms currently configured on a source
    pub fn alarms(&self, id: SourceId) -> Result<Vec<Alarm>, SourceError> {
        let mut set = self.inner.lock();
        Ok(set.get_mut(id)?.alarms.clone())
    }
}

impl EngineInner {
    fn lock(&self) -> MutexGuard<'_, SourceSet> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn persist(&self, set: &SourceSet) -> Result<(), StoreError> {
        let records = set.sources.iter().map(Source::to_record).collect();
        self.store.update(|document| document.apis = records)
    }

    /// Reassign URL groups, then bring timers in line with the new roles
    fn regroup(self: &Arc<Self>, set: &mut SourceSet) {
        set.grouping = self.grouper.regroup(&mut set.sources);
        for id in set.grouping.secondaries() {
            self.scheduler.cancel(id);
        }

        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        for source in set.sources.iter().filter(|s| s.role.polls()) {
            if let Some(seconds) = source.refresh {
                if !self.scheduler.is_scheduled(source.id()) {
                    self.schedule(source.id(), seconds, ScheduleStart::Immediate);
                }
            }
        }
    }

    fn schedule(self: &Arc<Self>, id: SourceId, seconds: u64, start: ScheduleStart) {
        let weak: Weak<EngineInner> = Arc::downgrade(self);
        let target: Weak<dyn PollTarget> = weak;
        self.scheduler
            .schedule(id, Duration::from_secs(seconds), start, target);
    }

    /// Poll once in the background
    fn spawn_poll(self: &Arc<Self>, id: SourceId) {
        let inner = Arc::clone(self);
        self.runtime.spawn(async move { inner.poll_cycle(id).await });
    }

    /// Poll a polling source that has no timer, if the engine is running
    fn poll_if_manual(self: &Arc<Self>, set: &SourceSet, id: SourceId) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        let manual = set
            .index_of(id)
            .map(|index| &set.sources[index])
            .is_some_and(|source| source.role.polls() && source.refresh.is_none());
        if manual {
            self.spawn_poll(id);
        }
    }

    async fn refresh(self: &Arc<Self>, id: SourceId) -> Result<(), SourceError> {
        {
            let set = self.lock();
            if set.index_of(id).is_none() {
                return Err(SourceError::UnknownSource(id.0));
            }
        }

        let was_scheduled = self.scheduler.cancel(id);
        self.poll_cycle(id).await;

        if was_scheduled && self.running.load(Ordering::SeqCst) {
            let set = self.lock();
            if let Some(index) = set.index_of(id) {
                let source = &set.sources[index];
                if let (true, Some(seconds)) = (source.role.polls(), source.refresh) {
                    if !self.scheduler.is_scheduled(id) {
                        self.schedule(id, seconds, ScheduleStart::AfterInterval);
                    }
                }
            }
        }
        Ok(())
    }

    /// Fetch one source's URL and feed the result to it and its secondaries
    async fn poll_cycle(&self, id: SourceId) {
        let url = {
            let mut set = self.lock();
            let Some(index) = set.index_of(id) else {
                return;
            };
            let source = &mut set.sources[index];
            source.begin_fetch(Local::now());
            debug!(
                "{}: Requesting at {}",
                source.name,
                source.time().unwrap_or_default()
            );
            source.url.clone()
        };

        let outcome: Result<Arc<Value>, FetchError> = match self.fetcher.fetch(&url).await {
            Ok(body) => parse_body(&body).map(Arc::new),
            Err(e) => Err(e),
        };

        let mut notices = Vec::new();
        let mut entries: Vec<LogEntry> = Vec::new();
        {
            let mut set = self.lock();
            let Some(index) = set.index_of(id) else {
                debug!("{}: Deleted while fetching, dropping response", id);
                return;
            };
            if set.sources[index].url != url {
                debug!("{}: URL changed while fetching, dropping response", id);
                return;
            }

            let time = set.sources[index].time().map(str::to_string);
            let date_time = set.sources[index].date_time().map(str::to_string);
            let mut targets = vec![index];
            for secondary in set.grouping.secondaries_of(id).to_vec() {
                if let Some(i) = set.index_of(secondary) {
                    if set.sources[i].url == url {
                        set.sources[i].set_timestamps(time.clone(), date_time.clone());
                        targets.push(i);
                    }
                }
            }

            let mut alarms_fired = false;
            for target in targets {
                let source = &mut set.sources[target];
                match &outcome {
                    Ok(tree) => {
                        source.apply_tree(Arc::clone(tree));
                        entries.extend(source.log_entry());
                        let value = source.numeric_value();
                        let triggered =
                            self.evaluator
                                .evaluate(&source.name, value, &mut source.alarms);
                        alarms_fired |= !triggered.is_empty();

                        let view = source.view();
                        for alarm in triggered {
                            notices.push(Notice::Alarm(view.clone(), alarm.message));
                        }
                        notices.push(Notice::Value(view));
                    }
                    Err(e) => {
                        debug!("{}: {}", source.name, e);
                        let kind = FetchErrorKind::from(e);
                        source.fail(kind);
                        notices.push(Notice::Failed(source.view(), kind));
                    }
                }
            }

            if alarms_fired {
                if let Err(e) = self.persist(&set) {
                    warn!("Could not save alarm state: {}", e);
                }
            }
        }

        if let Some(log) = &self.value_log {
            for entry in &entries {
                log.append_or_warn(entry);
            }
        }
        self.dispatch(notices);
    }

    fn dispatch(&self, notices: Vec<Notice>) {
        for notice in notices {
            match notice {
                Notice::Value(view) => self.observer.on_value_updated(&view),
                Notice::Alarm(view, message) => self.observer.on_alarm_triggered(&view, &message),
                Notice::Failed(view, kind) => self.observer.on_fetch_error(&view, kind),
            }
        }
    }
}

impl PollTarget for EngineInner {
    fn poll<'a>(&'a self, id: SourceId) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(self.poll_cycle(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SettingsDocument, TextSize};
    use crate::engine::observer::MockSourceObserver;
    use crate::engine::{ChannelObserver, NullObserver};
    use crate::events::{Role, SourceEvent, SourceValue, Trend};
    use crate::sources::MockFetcher;
    use tempfile::TempDir;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    const URL: &str = "https://api.example.com/ticker";

    struct Harness {
        engine: TickerEngine,
        fetcher: Arc<MockFetcher>,
        store: Arc<SettingsStore>,
        events: UnboundedReceiver<SourceEvent>,
        dir: TempDir,
    }

    impl Harness {
        fn drain(&mut self) -> Vec<SourceEvent> {
            let mut events = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                events.push(event);
            }
            events
        }

        fn role(&self, id: SourceId) -> Role {
            self.engine.source(id).unwrap().role
        }
    }

    fn harness_with(document: Option<&str>) -> Harness {
        harness_with_fetcher(document, MockFetcher::new())
    }

    fn harness_with_fetcher(document: Option<&str>, fetcher: MockFetcher) -> Harness {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        if let Some(document) = document {
            std::fs::write(&path, document).unwrap();
        }
        let store = Arc::new(SettingsStore::open(&path).unwrap());
        let fetcher = Arc::new(fetcher);
        let (tx, events) = mpsc::unbounded_channel();
        let engine = TickerEngine::load(
            Arc::clone(&store),
            fetcher.clone(),
            Arc::new(ChannelObserver::new(tx)),
            Some(ValueLog::new(dir.path().join("logs"))),
        );
        Harness {
            engine,
            fetcher,
            store,
            events,
            dir,
        }
    }

    fn harness() -> Harness {
        harness_with(None)
    }

    fn draft(name: &str, term: &str, refresh: u64) -> SourceDraft {
        SourceDraft::new(name, URL).with_term(term).with_refresh(refresh)
    }

    #[tokio::test]
    async fn test_shared_url_elects_shortest_interval() {
        let h = harness();
        let slow = h.engine.add_source(&draft("slow", "price", 60)).unwrap();
        let fast = h.engine.add_source(&draft("fast", "price", 30)).unwrap();

        assert_eq!(h.role(fast), Role::Primary);
        assert_eq!(h.role(slow), Role::Secondary);

        h.engine.start();
        assert!(h.engine.is_scheduled(fast));
        assert!(!h.engine.is_scheduled(slow));
        h.engine.shutdown();
    }

    #[tokio::test]
    async fn test_deleting_primary_promotes_secondary() {
        let h = harness();
        let slow = h.engine.add_source(&draft("slow", "price", 60)).unwrap();
        let fast = h.engine.add_source(&draft("fast", "price", 30)).unwrap();
        h.engine.start();

        h.engine.delete_source(fast).unwrap();

        assert_eq!(h.role(slow), Role::Standalone);
        assert!(h.engine.is_scheduled(slow));
        assert!(!h.engine.is_scheduled(fast));
        assert_eq!(h.engine.snapshot().len(), 1);
        assert_eq!(h.store.records().len(), 1);
        h.engine.shutdown();
    }

    #[tokio::test]
    async fn test_primary_fans_out_to_secondaries() {
        let mut h = harness();
        h.fetcher.respond(URL, r#"{"price": 101.5, "volume": "12"}"#);
        let price = h.engine.add_source(&draft("price", "price", 30)).unwrap();
        let volume = h.engine.add_source(&draft("volume", "volume", 60)).unwrap();

        h.engine.refresh(price).await.unwrap();

        assert_eq!(h.fetcher.calls_for(URL), 1);
        let price_view = h.engine.source(price).unwrap();
        let volume_view = h.engine.source(volume).unwrap();
        assert_eq!(price_view.value, Some(SourceValue::Number(101.5)));
        assert_eq!(volume_view.value, Some(SourceValue::Number(12.0)));
        assert_eq!(volume_view.time, price_view.time);

        let updated: Vec<SourceId> = h
            .drain()
            .into_iter()
            .filter_map(|event| match event {
                SourceEvent::ValueUpdated(view) => Some(view.id),
                _ => None,
            })
            .collect();
        assert_eq!(updated, vec![price, volume]);
    }

    #[tokio::test]
    async fn test_secondary_refresh_updates_only_itself() {
        let h = harness();
        h.fetcher.respond(URL, r#"{"price": 1.0, "volume": 2.0}"#);
        let price = h.engine.add_source(&draft("price", "price", 30)).unwrap();
        let volume = h.engine.add_source(&draft("volume", "volume", 60)).unwrap();

        h.engine.refresh(volume).await.unwrap();

        assert_eq!(h.engine.source(price).unwrap().value, None);
        assert_eq!(
            h.engine.source(volume).unwrap().value,
            Some(SourceValue::Number(2.0))
        );
    }

    #[tokio::test]
    async fn test_trend_across_refreshes() {
        let h = harness();
        let id = h.engine.add_source(&draft("btc", "price", 30)).unwrap();

        h.fetcher.respond(URL, r#"{"price": 10.0}"#);
        h.engine.refresh(id).await.unwrap();
        assert_eq!(h.engine.source(id).unwrap().trend, None);

        h.fetcher.respond(URL, r#"{"price": 12.0}"#);
        h.engine.refresh(id).await.unwrap();
        assert_eq!(h.engine.source(id).unwrap().trend, Some(Trend::Up));
    }

    #[tokio::test]
    async fn test_alarm_fires_once_and_is_persisted_disabled() {
        let mut h = harness();
        h.fetcher.respond(URL, r#"{"price": 101.5}"#);
        let id = h.engine.add_source(&draft("BTC", "price", 30)).unwrap();
        h.engine.add_alarm(id, Comparison::GreaterOrEqual, 100.0).unwrap();

        h.engine.refresh(id).await.unwrap();
        h.engine.refresh(id).await.unwrap();

        let alarms: Vec<String> = h
            .drain()
            .into_iter()
            .filter_map(|event| match event {
                SourceEvent::AlarmTriggered { message, .. } => Some(message),
                _ => None,
            })
            .collect();
        assert_eq!(alarms, vec!["BTC: 101.5 >= 100.0".to_string()]);
        assert!(!h.engine.alarms(id).unwrap()[0].enabled);
        assert!(!h.store.records()[0].alarms[0].enabled);

        h.engine.set_alarm_enabled(id, 0, true).unwrap();
        assert!(h.store.records()[0].alarms[0].enabled);
    }

    #[tokio::test]
    async fn test_secondary_alarm_fires_from_primary_fetch() {
        let mut h = harness();
        h.fetcher.respond(URL, r#"{"price": 101.5}"#);
        let primary = h.engine.add_source(&draft("a", "price", 30)).unwrap();
        let secondary = h.engine.add_source(&draft("b", "price", 60)).unwrap();
        h.engine
            .add_alarm(secondary, Comparison::GreaterOrEqual, 100.0)
            .unwrap();

        h.engine.refresh(primary).await.unwrap();
        h.engine.refresh(primary).await.unwrap();

        let alarms: Vec<(SourceId, String)> = h
            .drain()
            .into_iter()
            .filter_map(|event| match event {
                SourceEvent::AlarmTriggered { source, message } => Some((source.id, message)),
                _ => None,
            })
            .collect();
        assert_eq!(alarms, vec![(secondary, "b: 101.5 >= 100.0".to_string())]);
        assert_eq!(h.fetcher.calls_for(URL), 2);
        assert!(!h.engine.alarms(secondary).unwrap()[0].enabled);
        assert!(!h.store.records()[1].alarms[0].enabled);
    }

    #[tokio::test]
    async fn test_alarm_validation_and_deletion() {
        let h = harness();
        let id = h.engine.add_source(&draft("x", "v", 30)).unwrap();

        assert!(matches!(
            h.engine.add_alarm(id, Comparison::LessOrEqual, -1.0),
            Err(SourceError::InvalidThreshold(_))
        ));
        h.engine.add_alarm(id, Comparison::LessOrEqual, 5.0).unwrap();
        h.engine.add_alarm(id, Comparison::GreaterOrEqual, 9.0).unwrap();
        assert!(matches!(
            h.engine.add_alarm(id, Comparison::LessOrEqual, 5.0),
            Err(SourceError::DuplicateAlarm(_))
        ));

        h.engine.delete_alarm(id, 0).unwrap();
        let stored = &h.store.records()[0].alarms;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].threshold, 9.0);
        assert!(matches!(
            h.engine.delete_alarm(id, 3),
            Err(SourceError::AlarmIndexOutOfRange(3))
        ));
    }

    #[tokio::test]
    async fn test_fetch_failure_reports_invalid_url_to_group() {
        let mut h = harness();
        h.fetcher
            .fail(URL, FetchError::Transport("connection refused".to_string()));
        let primary = h.engine.add_source(&draft("a", "price", 30)).unwrap();
        let secondary = h.engine.add_source(&draft("b", "price", 60)).unwrap();

        h.engine.refresh(primary).await.unwrap();

        assert_eq!(
            h.engine.source(secondary).unwrap().display.as_deref(),
            Some("Invalid URL")
        );
        let failed: Vec<(SourceId, FetchErrorKind)> = h
            .drain()
            .into_iter()
            .filter_map(|event| match event {
                SourceEvent::FetchFailed { source, kind } => Some((source.id, kind)),
                _ => None,
            })
            .collect();
        assert_eq!(
            failed,
            vec![
                (primary, FetchErrorKind::InvalidUrl),
                (secondary, FetchErrorKind::InvalidUrl)
            ]
        );
    }

    #[tokio::test]
    async fn test_non_json_body_is_invalid_api() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SettingsStore::open(dir.path().join("settings.json")).unwrap());
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.respond(URL, "<html>Bad Gateway</html>");

        let mut observer = MockSourceObserver::new();
        observer
            .expect_on_fetch_error()
            .withf(|view, kind| view.name == "api" && *kind == FetchErrorKind::InvalidApi)
            .times(1)
            .return_const(());
        observer.expect_on_value_updated().never();

        let engine = TickerEngine::load(store, fetcher, Arc::new(observer), None);
        let id = engine.add_source(&draft("api", "price", 30)).unwrap();
        engine.refresh(id).await.unwrap();

        assert_eq!(
            engine.source(id).unwrap().display.as_deref(),
            Some("Invalid API")
        );
    }

    #[tokio::test]
    async fn test_edit_term_reextracts_without_fetching() {
        let h = harness();
        h.fetcher.respond(URL, r#"{"bid": 1.5, "ask": 1.75}"#);
        let id = h.engine.add_source(&draft("fx", "bid", 30)).unwrap();
        h.engine.refresh(id).await.unwrap();

        h.engine
            .edit_source(id, &draft("fx", "ask", 30).with_decimals(1))
            .unwrap();

        assert_eq!(h.fetcher.calls_for(URL), 1);
        let view = h.engine.source(id).unwrap();
        assert_eq!(view.value, Some(SourceValue::Number(1.75)));
        assert_eq!(view.display.as_deref(), Some("1.8"));
        assert_eq!(h.store.records()[0].term.as_deref(), Some("ask"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_dropped_after_url_edit_mid_fetch() {
        let mut h = harness_with_fetcher(
            None,
            MockFetcher::new().with_delay(Duration::from_secs(5)),
        );
        h.fetcher.respond(URL, r#"{"price": 7.0}"#);
        let id = h.engine.add_source(&draft("btc", "price", 30)).unwrap();

        let edit = async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            h.engine
                .edit_source(
                    id,
                    &SourceDraft::new("btc", "https://api.example.com/other")
                        .with_term("price")
                        .with_refresh(30),
                )
                .unwrap();
        };
        let (refreshed, ()) = tokio::join!(h.engine.refresh(id), edit);
        refreshed.unwrap();

        assert_eq!(h.fetcher.calls_for(URL), 1);
        assert_eq!(h.engine.source(id).unwrap().value, None);
        assert!(!h
            .drain()
            .iter()
            .any(|event| matches!(event, SourceEvent::ValueUpdated(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_dropped_after_delete_mid_fetch() {
        let h = harness_with_fetcher(
            None,
            MockFetcher::new().with_delay(Duration::from_secs(5)),
        );
        h.fetcher.respond(URL, r#"{"price": 7.0}"#);
        let id = h.engine.add_source(&draft("btc", "price", 30)).unwrap();

        let delete = async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            h.engine.delete_source(id).unwrap();
        };
        let (refreshed, ()) = tokio::join!(h.engine.refresh(id), delete);
        refreshed.unwrap();

        assert!(h.engine.snapshot().is_empty());
        assert!(h.store.records().is_empty());
    }

    #[tokio::test]
    async fn test_edit_refresh_regroups() {
        let h = harness();
        let a = h.engine.add_source(&draft("a", "price", 30)).unwrap();
        let b = h.engine.add_source(&draft("b", "price", 60)).unwrap();
        h.engine.start();
        assert!(h.engine.is_scheduled(a));

        h.engine.edit_source(b, &draft("b", "price", 10)).unwrap();

        assert_eq!(h.role(b), Role::Primary);
        assert_eq!(h.role(a), Role::Secondary);
        assert!(h.engine.is_scheduled(b));
        assert!(!h.engine.is_scheduled(a));
        h.engine.shutdown();
    }

    #[tokio::test]
    async fn test_positions_and_moves() {
        let h = harness();
        let a = h.engine.add_source(&SourceDraft::new("a", "https://a")).unwrap();
        let b = h.engine.add_source(&SourceDraft::new("b", "https://b")).unwrap();
        let c = h
            .engine
            .add_source(&SourceDraft::new("c", "https://c").at_position(1))
            .unwrap();

        let order = |h: &Harness| -> Vec<SourceId> {
            h.engine.snapshot().iter().map(|view| view.id).collect()
        };
        assert_eq!(order(&h), vec![c, a, b]);

        h.engine.move_source(c, 2).unwrap();
        assert_eq!(order(&h), vec![a, b, c]);

        h.engine.move_source(b, 99).unwrap();
        assert_eq!(order(&h), vec![a, c, b]);

        h.engine.delete_source(a).unwrap();
        assert_eq!(order(&h), vec![c, b]);
        let sequences: Vec<usize> = h.store.records().iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, vec![0, 1]);

        assert!(matches!(
            h.engine.move_source(a, 0),
            Err(SourceError::UnknownSource(_))
        ));
    }

    #[tokio::test]
    async fn test_value_log_written_for_logging_sources() {
        let h = harness();
        h.fetcher.respond(URL, r#"{"price": 3.25}"#);
        let id = h
            .engine
            .add_source(&draft("My Coin", "price", 30).with_log(true))
            .unwrap();

        h.engine.refresh(id).await.unwrap();

        let contents =
            std::fs::read_to_string(h.dir.path().join("logs").join("My_Coin.txt")).unwrap();
        assert!(contents.starts_with('['));
        assert!(contents.ends_with("]\n3.25\n\n"));
    }

    #[tokio::test]
    async fn test_load_restores_sources_and_groups() {
        let h = harness_with(Some(
            r#"{
                "global": {"text": "Large", "foreground": true, "geometry": "300x400"},
                "apis": [
                    {"url": "https://u", "name": "second", "term": "b", "decimals": null,
                     "refresh": 60, "log": false, "sequence": 5, "alarms": []},
                    {"url": "https://u", "name": "first", "term": "a", "decimals": 2,
                     "refresh": 30, "log": false, "sequence": 0,
                     "alarms": [{"enabled": true, "inequality": ">", "value": 3.0}]},
                    {"url": "https://v", "name": "broken", "decimals": "many"}
                ]
            }"#,
        ));

        let snapshot = h.engine.snapshot();
        let names: Vec<&str> = snapshot.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["first", "second"]);
        assert_eq!(snapshot[0].role, Role::Primary);
        assert_eq!(snapshot[1].role, Role::Secondary);
        assert_eq!(snapshot[0].alarm_count, 1);
        assert_eq!(h.engine.global_options().text, TextSize::Large);

        let sequences: Vec<usize> = h.store.records().iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, vec![0, 1]);

        // The unreadable record is written back untouched
        let contents = std::fs::read_to_string(h.store.path()).unwrap();
        assert!(contents.contains("https://v"));
        assert!(contents.contains("\"many\""));
    }

    #[tokio::test]
    async fn test_refresh_all_includes_manual_sources() {
        let h = harness();
        h.fetcher.respond("https://a", r#"{"v": 1}"#);
        h.fetcher.respond("https://b", r#"{"v": 2}"#);
        h.fetcher.respond(URL, r#"{"v": 3}"#);
        h.engine
            .add_source(&SourceDraft::new("a", "https://a").with_term("v"))
            .unwrap();
        h.engine
            .add_source(&SourceDraft::new("b", "https://b").with_term("v").with_refresh(30))
            .unwrap();
        h.engine.add_source(&draft("c", "v", 30)).unwrap();
        h.engine.add_source(&draft("d", "v", 90)).unwrap();

        h.engine.refresh_all().await;

        assert_eq!(h.fetcher.call_count(), 3);
        assert!(h
            .engine
            .snapshot()
            .iter()
            .all(|view| view.value.is_some()));
    }

    #[tokio::test]
    async fn test_unknown_source_errors() {
        let h = harness();
        assert!(matches!(
            h.engine.refresh(SourceId(42)).await,
            Err(SourceError::UnknownSource(42))
        ));
        assert!(h.engine.delete_source(SourceId(42)).is_err());
        assert!(h
            .engine
            .edit_source(SourceId(42), &SourceDraft::new("x", "y"))
            .is_err());
        assert!(h.engine.alarms(SourceId(42)).is_err());
    }

    #[tokio::test]
    async fn test_global_options_persisted() {
        let h = harness();
        h.engine
            .set_global_options(GlobalOptions {
                text: TextSize::Small,
                foreground: true,
                geometry: "garbage".to_string(),
            })
            .unwrap();

        let reloaded = SettingsStore::open(h.store.path()).unwrap();
        let global = reloaded.global();
        assert_eq!(global.text, TextSize::Small);
        assert!(global.foreground);
        assert_eq!(global.geometry, "285x310");
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_polling_runs_until_shutdown() {
        let h = harness();
        h.fetcher.respond(URL, r#"{"price": 1}"#);
        h.engine.add_source(&draft("a", "price", 30)).unwrap();
        h.engine.add_source(&draft("b", "price", 45)).unwrap();

        h.engine.start();
        tokio::time::sleep(Duration::from_secs(65)).await;
        // t = 0, 30, 60 for the shared URL only
        assert_eq!(h.fetcher.calls_for(URL), 3);

        h.engine.shutdown();
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(h.fetcher.calls_for(URL), 3);
        assert!(!h.engine.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_refresh_restarts_timer() {
        let h = harness();
        h.fetcher.respond(URL, r#"{"price": 1}"#);
        let id = h.engine.add_source(&draft("a", "price", 30)).unwrap();
        h.engine.start();

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(h.fetcher.calls_for(URL), 1);

        h.engine.refresh(id).await.unwrap();
        assert_eq!(h.fetcher.calls_for(URL), 2);

        // Next tick is 30s after the manual refresh, not at t = 30
        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(h.fetcher.calls_for(URL), 2);
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(h.fetcher.calls_for(URL), 3);
        h.engine.shutdown();
    }

    #[tokio::test]
    async fn test_null_observer_engine_polls() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SettingsStore::with_document(
            dir.path().join("s.json"),
            SettingsDocument::default(),
        ));
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.respond(URL, "[1, 2, 3]");
        let engine = TickerEngine::load(store, fetcher, Arc::new(NullObserver), None);
        let id = engine.add_source(&SourceDraft::new("list", URL)).unwrap();

        engine.refresh(id).await.unwrap();
        assert_eq!(
            engine.source(id).unwrap().display.as_deref(),
            Some("[1,2,3]")
        );
    }
}
