//! # Directory watcher
//!
//! [ContactWatcher] turns raw filesystem notifications under a contacts root into
//! [ContactEvent]s. `notify` delivers raw events on its own thread; they are only forwarded
//! through a channel. All state lives with the owner, which calls [ContactWatcher::pump] to
//! process them.
//!
//! The watcher keeps a map from record path to `{id, last write time}`, seeded by a scan when it
//! is created. Each raw event is classified against that map:
//!
//! - an unknown path that loads is `Added`; a known path that loads with a new write time is
//!   `Updated`, and an equal write time is swallowed as a duplicate;
//! - a known path that vanished mid-update is parked in a single pending slot and retried on a
//!   timer;
//! - a known path that no longer parses is `Removed`;
//! - a rename of a known path is `Moved`, or `Removed` when the target cannot be loaded.
//!
//! Teardown ([ContactWatcher::dispose]) raises the stop flag first, so the notify thread stops
//! forwarding, then drains what was already queued before the OS watch is released.

use notify::{
    event::{CreateKind, ModifyKind, RenameMode},
    Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{channel, Receiver, RecvTimeoutError, Sender, TryRecvError},
        Arc,
    },
    time::{Duration, Instant, SystemTime},
};

use crate::{
    cache::ContactCache,
    config::WatchSettings,
    error::ContactError,
    event::ContactEvent,
    paths::normalize_key,
    properties::{ContactId, ContactType},
    store::ContactProperties,
};

/// Receives every [ContactEvent] on the owner thread. An error aborts the current drain and is
/// returned from [ContactWatcher::pump] as [ContactError::Subscriber].
pub type Subscriber = Box<dyn FnMut(&ContactEvent) -> Result<(), ContactError>>;

/// Reads the id and write time of one record.
pub(crate) type Loader =
    Box<dyn FnMut(&mut ContactCache, &Path) -> Result<KnownContact, ContactError>>;

type RawSender = Sender<notify::Result<Event>>;

/// How long a drain waits for the second half of a split rename.
const RENAME_GRACE: Duration = Duration::from_millis(50);

/// A filesystem change after rename pairing, before classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawEvent {
    Changed(PathBuf),
    Deleted(PathBuf),
    Renamed(PathBuf, PathBuf),
}

/// Pairs `Name(From)`/`Name(To)` notifications into [RawEvent::Renamed].
///
/// Some backends follow a paired `To` with a `Name(Both)` for the same move; that duplicate is
/// dropped. A `From` left unpaired when the queue runs dry means the file left the watched tree.
#[derive(Debug, Default)]
pub(crate) struct RenameCoalescer {
    from: Option<(Option<usize>, PathBuf)>,
    last_pair: Option<(PathBuf, PathBuf)>,
}

impl RenameCoalescer {
    pub(crate) fn push(&mut self, event: Event, out: &mut Vec<RawEvent>) {
        let tracker = event.tracker();
        match event.kind {
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                self.flush(out);
                self.last_pair = None;
                if let Some(path) = event.paths.into_iter().next() {
                    self.from = Some((tracker, path));
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                self.last_pair = None;
                let Some(to) = event.paths.into_iter().next() else {
                    return;
                };
                match self.from.take() {
                    Some((from_tracker, from))
                        if from_tracker.is_none() || tracker.is_none() || from_tracker == tracker =>
                    {
                        self.last_pair = Some((from.clone(), to.clone()));
                        out.push(RawEvent::Renamed(from, to));
                    }
                    stale => {
                        if let Some((_, from)) = stale {
                            out.push(RawEvent::Deleted(from));
                        }
                        out.push(RawEvent::Changed(to));
                    }
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
                self.flush(out);
                let mut paths = event.paths.into_iter();
                let (Some(from), Some(to)) = (paths.next(), paths.next()) else {
                    tracing::warn!("[ContactWatcher] rename event without both paths");
                    return;
                };
                let pair = (from, to);
                if self.last_pair.take().as_ref() == Some(&pair) {
                    return;
                }
                out.push(RawEvent::Renamed(pair.0, pair.1));
            }
            kind => {
                self.flush(out);
                self.last_pair = None;
                match kind {
                    EventKind::Access(_) | EventKind::Create(CreateKind::Folder) => {}
                    EventKind::Remove(_) => {
                        out.extend(event.paths.into_iter().map(RawEvent::Deleted));
                    }
                    EventKind::Create(_) | EventKind::Modify(ModifyKind::Data(_))
                    | EventKind::Modify(ModifyKind::Metadata(_)) => {
                        out.extend(event.paths.into_iter().map(RawEvent::Changed));
                    }
                    // Name(Any) and the catch-alls don't say which side of a move a path is on.
                    _ => out.extend(event.paths.into_iter().map(|path| {
                        if path.exists() {
                            RawEvent::Changed(path)
                        } else {
                            RawEvent::Deleted(path)
                        }
                    })),
                }
            }
        }
    }

    /// A `From` is waiting for its `To`.
    pub(crate) fn is_waiting(&self) -> bool {
        self.from.is_some()
    }

    pub(crate) fn flush(&mut self, out: &mut Vec<RawEvent>) {
        if let Some((_, from)) = self.from.take() {
            out.push(RawEvent::Deleted(from));
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct KnownContact {
    id: ContactId,
    /// `None` forces the next reload to report an update.
    modified: Option<SystemTime>,
}

enum LoadOutcome {
    Loaded(KnownContact),
    Missing,
    BadData,
}

pub struct ContactWatcher {
    types: enumset::EnumSet<ContactType>,
    settings: WatchSettings,
    known: HashMap<String, KnownContact>,
    pending: Option<PathBuf>,
    retry_count: u32,
    retry_at: Option<Instant>,
    stop: Arc<AtomicBool>,
    raw_rx: Receiver<notify::Result<Event>>,
    renames: RenameCoalescer,
    watcher: Option<RecommendedWatcher>,
    subscriber: Subscriber,
    loader: Loader,
    delivered: usize,
    disposed: bool,
}

impl std::fmt::Debug for ContactWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContactWatcher")
            .field("types", &self.types)
            .field("known", &self.known.len())
            .field("pending", &self.pending)
            .field("retry_count", &self.retry_count)
            .field("disposed", &self.disposed)
            .finish()
    }
}

impl ContactWatcher {
    /// Scan the cache root and start watching it.
    pub fn new(
        cache: &mut ContactCache,
        settings: WatchSettings,
        subscriber: Subscriber,
    ) -> Result<ContactWatcher, ContactError> {
        let (mut watcher, raw_tx) = ContactWatcher::seeded(cache, settings, subscriber);
        let stop = watcher.stop.clone();
        let mut os_watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            if stop.load(Ordering::Relaxed) {
                return;
            }
            // A closed channel means the owner is gone.
            let _ = raw_tx.send(res);
        })?;
        let mode = if cache.use_subfolders() {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        os_watcher.watch(cache.root(), mode)?;
        watcher.watcher = Some(os_watcher);
        tracing::info!(
            "[ContactWatcher] watching {:?} ({} known records)",
            cache.root(),
            watcher.known.len()
        );
        Ok(watcher)
    }

    /// Build the watcher state without an OS watch. The returned sender feeds the raw queue.
    fn seeded(
        cache: &mut ContactCache,
        settings: WatchSettings,
        subscriber: Subscriber,
    ) -> (ContactWatcher, RawSender) {
        let types = cache.types();
        let mut known = HashMap::new();
        for (path, store) in cache.get_all(types) {
            let id = match store.contact_id() {
                Ok(id) => id,
                Err(err) => {
                    tracing::warn!("[ContactWatcher] {path:?} has no usable id: {err}");
                    continue;
                }
            };
            let modified = modified_time(&path).ok();
            known.insert(normalize_key(&path), KnownContact { id, modified });
        }
        let (raw_tx, raw_rx) = channel();
        let watcher = ContactWatcher {
            types,
            settings,
            known,
            pending: None,
            retry_count: 0,
            retry_at: None,
            stop: Arc::new(AtomicBool::new(false)),
            raw_rx,
            renames: RenameCoalescer::default(),
            watcher: None,
            subscriber,
            loader: Box::new(load_known),
            delivered: 0,
            disposed: false,
        };
        (watcher, raw_tx)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    pub fn known_len(&self) -> usize {
        self.known.len()
    }

    /// When the pending-update retry is due, if one is scheduled.
    pub fn retry_deadline(&self) -> Option<Instant> {
        self.retry_at
    }

    /// Wait up to `timeout` for raw events, process everything queued and fire the retry timer
    /// when it is due. Returns the number of events delivered to the subscriber.
    ///
    /// A record that still fails to load after the local retries is reported once the rest of
    /// the queue has been processed; the watcher stays usable.
    pub fn pump(
        &mut self,
        cache: &mut ContactCache,
        timeout: Duration,
    ) -> Result<usize, ContactError> {
        if self.disposed {
            return Ok(0);
        }
        let before = self.delivered;
        let deadline = Instant::now() + timeout;
        loop {
            self.fire_retry_timer(cache, Instant::now())?;
            let wake = self.retry_at.map_or(deadline, |at| at.min(deadline));
            match self
                .raw_rx
                .recv_timeout(wake.saturating_duration_since(Instant::now()))
            {
                Ok(first) => {
                    self.drain(cache, Some(first), usize::MAX)?;
                    self.fire_retry_timer(cache, Instant::now())?;
                    break;
                }
                Err(RecvTimeoutError::Timeout) => {
                    if Instant::now() >= deadline {
                        self.fire_retry_timer(cache, Instant::now())?;
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(ContactError::Watch("raw event channel closed".to_string()));
                }
            }
        }
        Ok(self.delivered - before)
    }

    /// Stop accepting events, process what is already queued and release the OS watch.
    ///
    /// The watch is released even when the subscriber fails; that error is returned.
    pub fn dispose(&mut self, cache: &mut ContactCache) -> Result<usize, ContactError> {
        if self.disposed {
            return Ok(0);
        }
        tracing::info!("[ContactWatcher] disposing");
        self.stop.store(true, Ordering::Relaxed);
        self.retry_at = None;
        let before = self.delivered;
        let result = self.drain(cache, None, self.settings.drain_limit);
        self.release();
        result.map(|_| self.delivered - before)
    }

    fn release(&mut self) {
        self.disposed = true;
        self.pending = None;
        if self.watcher.take().is_some() {
            tracing::info!("[ContactWatcher] released OS watch");
        }
    }

    fn drain(
        &mut self,
        cache: &mut ContactCache,
        first: Option<notify::Result<Event>>,
        limit: usize,
    ) -> Result<(), ContactError> {
        let mut next = first;
        let mut taken = 0;
        let mut waited = false;
        let mut failed = None;
        loop {
            let res = match next.take() {
                Some(res) => res,
                None if taken >= limit => {
                    tracing::warn!("[ContactWatcher] drain limit of {limit} reached");
                    break;
                }
                None => match self.raw_rx.try_recv() {
                    Ok(res) => res,
                    Err(TryRecvError::Empty) if self.renames.is_waiting() && !waited => {
                        // The other half of a move is usually a moment behind.
                        waited = true;
                        match self.raw_rx.recv_timeout(RENAME_GRACE) {
                            Ok(res) => res,
                            Err(_) => break,
                        }
                    }
                    Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
                },
            };
            taken += 1;
            match res {
                Ok(event) => {
                    let mut raw = Vec::new();
                    self.renames.push(event, &mut raw);
                    self.process_batch(cache, raw, &mut failed)?;
                }
                Err(err) => tracing::warn!("[ContactWatcher] notify error: {err}"),
            }
        }
        let mut unpaired = Vec::new();
        self.renames.flush(&mut unpaired);
        self.process_batch(cache, unpaired, &mut failed)?;
        failed.map_or(Ok(()), Err)
    }

    /// Process every event in `raw`. Subscriber failures stop at once; the first load failure
    /// is kept in `failed` and the rest of the batch still runs.
    fn process_batch(
        &mut self,
        cache: &mut ContactCache,
        raw: Vec<RawEvent>,
        failed: &mut Option<ContactError>,
    ) -> Result<(), ContactError> {
        for event in raw {
            match self.process(cache, event) {
                Ok(()) => {}
                Err(err @ ContactError::Subscriber(_)) => return Err(err),
                Err(err) => {
                    failed.get_or_insert(err);
                }
            }
        }
        Ok(())
    }

    /// Classify one raw event and deliver what it amounts to.
    pub fn process(
        &mut self,
        cache: &mut ContactCache,
        event: RawEvent,
    ) -> Result<(), ContactError> {
        tracing::debug!("[ContactWatcher] raw {event:?}");
        match event {
            RawEvent::Changed(path) => match self.track(cache, &path) {
                Some(path) => self.on_changed(cache, &path),
                None => Ok(()),
            },
            RawEvent::Deleted(path) => match self.track(cache, &path) {
                Some(path) => self.on_deleted(cache, &path),
                None => Ok(()),
            },
            RawEvent::Renamed(from, to) => {
                match (self.track(cache, &from), self.track(cache, &to)) {
                    (Some(from), Some(to)) => self.on_renamed(cache, &from, &to),
                    (Some(from), None) => self.on_deleted(cache, &from),
                    (None, Some(to)) => self.on_changed(cache, &to),
                    (None, None) => Ok(()),
                }
            }
        }
    }

    /// The cache-relative form of `path` if it is a record this watcher follows.
    fn track(&self, cache: &ContactCache, path: &Path) -> Option<PathBuf> {
        let path = cache.resolve(path).ok()?;
        let hidden = path
            .file_name()
            .and_then(|name| name.to_str())
            .map_or(true, |name| name.starts_with('.'));
        if hidden || path.is_dir() || !ContactType::matches(self.types, &path) {
            return None;
        }
        if !cache.use_subfolders() && path.parent() != Some(cache.root()) {
            return None;
        }
        Some(path)
    }

    fn on_changed(&mut self, cache: &mut ContactCache, path: &Path) -> Result<(), ContactError> {
        if self.pending.as_deref() != Some(path) {
            self.reprocess_pending(cache)?;
        }
        let key = normalize_key(path);
        let old = self.known.get(&key).copied();
        let mut requeued = false;
        let event = match self.load(cache, path)? {
            LoadOutcome::Loaded(new) => {
                self.known.insert(key, new);
                match old {
                    None => Some(ContactEvent::Added(new.id)),
                    Some(old) if old.modified == new.modified && new.modified.is_some() => {
                        tracing::debug!("[ContactWatcher] {path:?} unchanged, skipping");
                        None
                    }
                    Some(old) => Some(ContactEvent::Updated(old.id, new.id)),
                }
            }
            LoadOutcome::Missing => {
                if old.is_some() {
                    self.set_pending(path);
                    self.retry_at = Some(Instant::now() + self.settings.retry_delay());
                    requeued = true;
                    tracing::debug!(
                        "[ContactWatcher] {path:?} vanished mid-update, retry {} of {}",
                        self.retry_count + 1,
                        self.settings.max_retries
                    );
                }
                None
            }
            LoadOutcome::BadData => {
                self.known.remove(&key);
                old.map(|old| ContactEvent::Removed(old.id))
            }
        };
        if !requeued && self.pending.as_deref() == Some(path) {
            self.clear_pending();
        }
        match event {
            Some(event) => self.deliver(event),
            None => Ok(()),
        }
    }

    fn on_deleted(&mut self, cache: &mut ContactCache, path: &Path) -> Result<(), ContactError> {
        if self.pending.as_deref() == Some(path) {
            self.clear_pending();
        }
        self.reprocess_pending(cache)?;
        cache.invalidate(path);
        match self.known.remove(&normalize_key(path)) {
            Some(old) => self.deliver(ContactEvent::Removed(old.id)),
            None => Ok(()),
        }
    }

    fn on_renamed(
        &mut self,
        cache: &mut ContactCache,
        from: &Path,
        to: &Path,
    ) -> Result<(), ContactError> {
        cache.invalidate(from);
        let Some(old) = self.known.remove(&normalize_key(from)) else {
            // Never seen under the old name; judge the new one on its own.
            return self.on_changed(cache, to);
        };
        let new = match self.load(cache, to)? {
            LoadOutcome::Loaded(new) => new,
            LoadOutcome::Missing | LoadOutcome::BadData => {
                if self.pending.as_deref() == Some(from) {
                    self.clear_pending();
                }
                return self.deliver(ContactEvent::Removed(old.id));
            }
        };
        let to_key = normalize_key(to);
        self.known.insert(to_key.clone(), new);
        self.deliver(ContactEvent::Moved(old.id, new.id))?;

        if self.pending.as_deref() == Some(from) {
            // Replay the update that was waiting on the old name.
            if let Some(entry) = self.known.get_mut(&to_key) {
                entry.modified = None;
            }
            self.set_pending(to);
            self.reprocess_pending(cache)?;
        }
        Ok(())
    }

    /// Load `path` through the cache, retrying transient failures a few times in place.
    fn load(
        &mut self,
        cache: &mut ContactCache,
        path: &Path,
    ) -> Result<LoadOutcome, ContactError> {
        let mut attempt = 0;
        loop {
            match (self.loader)(cache, path) {
                Ok(known) => return Ok(LoadOutcome::Loaded(known)),
                Err(ContactError::NotFound(_)) => return Ok(LoadOutcome::Missing),
                Err(err) if err.is_transient() || matches!(err, ContactError::PermissionDenied) => {
                    attempt += 1;
                    if attempt > self.settings.io_retries {
                        tracing::error!("[ContactWatcher] giving up on {path:?}: {err}");
                        return Err(err);
                    }
                    tracing::debug!("[ContactWatcher] retrying {path:?} after {err}");
                    std::thread::yield_now();
                }
                Err(err) => {
                    tracing::warn!("[ContactWatcher] {path:?} is not a usable record: {err}");
                    return Ok(LoadOutcome::BadData);
                }
            }
        }
    }

    fn fire_retry_timer(
        &mut self,
        cache: &mut ContactCache,
        now: Instant,
    ) -> Result<(), ContactError> {
        match self.retry_at {
            Some(at) if at <= now => {
                self.retry_at = None;
                self.reprocess_pending(cache)
            }
            _ => Ok(()),
        }
    }

    fn reprocess_pending(&mut self, cache: &mut ContactCache) -> Result<(), ContactError> {
        let Some(path) = self.pending.clone() else {
            return Ok(());
        };
        self.retry_at = None;
        if self.retry_count >= self.settings.max_retries {
            tracing::debug!("[ContactWatcher] dropping pending update for {path:?}");
            self.clear_pending();
            return Ok(());
        }
        self.retry_count += 1;
        self.on_changed(cache, &path)
    }

    fn set_pending(&mut self, path: &Path) {
        if self.pending.as_deref() != Some(path) {
            self.retry_count = 0;
            self.pending = Some(path.to_path_buf());
        }
    }

    fn clear_pending(&mut self) {
        self.pending = None;
        self.retry_count = 0;
        self.retry_at = None;
    }

    fn deliver(&mut self, event: ContactEvent) -> Result<(), ContactError> {
        tracing::debug!("[ContactWatcher] {event}");
        self.delivered += 1;
        (self.subscriber)(&event).map_err(|err| match err {
            ContactError::Subscriber(_) => err,
            other => ContactError::Subscriber(other.to_string()),
        })
    }

    #[cfg(test)]
    pub(crate) fn set_loader(&mut self, loader: Loader) {
        self.loader = loader;
    }
}

impl Drop for ContactWatcher {
    fn drop(&mut self) {
        if !self.disposed {
            // Without the cache queued events can't be classified; they are dropped.
            self.stop.store(true, Ordering::Relaxed);
            self.release();
        }
    }
}

fn load_known(cache: &mut ContactCache, path: &Path) -> Result<KnownContact, ContactError> {
    let store = cache.get(path)?;
    Ok(KnownContact {
        id: store.contact_id()?,
        modified: Some(modified_time(path)?),
    })
}

fn modified_time(path: &Path) -> Result<SystemTime, ContactError> {
    Ok(std::fs::metadata(path)?.modified()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::CacheSettings,
        tests::helpers::{contact_with_id, init_logging, sample_contact, schema, SAMPLE_ID},
    };
    use filetime::{set_file_mtime, FileTime};
    use notify::event::{DataChange, EventAttributes, RemoveKind};
    use std::{
        cell::{Cell, RefCell},
        fs,
        rc::Rc,
    };
    use tempfile::TempDir;
    use test_log::test;

    const OTHER_ID: &str = "0c7e9a4e-5d3f-4a6b-8f2e-1b9d7c6a5e4f";

    struct Harness {
        dir: TempDir,
        cache: ContactCache,
        watcher: ContactWatcher,
        raw_tx: RawSender,
        events: Rc<RefCell<Vec<ContactEvent>>>,
    }

    impl Harness {
        fn new(seed: &[(&str, String)]) -> Harness {
            init_logging();
            let dir = TempDir::new().unwrap();
            for (name, body) in seed {
                fs::write(dir.path().join(name), body).unwrap();
            }
            let mut cache = ContactCache::new(dir.path(), schema(), CacheSettings::default());
            let events = Rc::new(RefCell::new(Vec::new()));
            let sink = events.clone();
            let settings = WatchSettings {
                retry_delay_ms: 0,
                ..WatchSettings::default()
            };
            let (watcher, raw_tx) = ContactWatcher::seeded(
                &mut cache,
                settings,
                Box::new(move |event| {
                    sink.borrow_mut().push(*event);
                    Ok(())
                }),
            );
            Harness {
                dir,
                cache,
                watcher,
                raw_tx,
                events,
            }
        }

        fn path(&self, name: &str) -> PathBuf {
            self.dir.path().join(name)
        }

        fn process(&mut self, event: RawEvent) {
            self.watcher.process(&mut self.cache, event).unwrap();
        }

        fn take(&self) -> Vec<ContactEvent> {
            std::mem::take(&mut *self.events.borrow_mut())
        }

        fn bump_mtime(&self, name: &str, secs: i64) {
            set_file_mtime(self.path(name), FileTime::from_unix_time(1_700_000_000 + secs, 0))
                .unwrap();
        }
    }

    fn id(s: &str) -> ContactId {
        s.parse().unwrap()
    }

    fn notify_event(kind: EventKind, paths: &[PathBuf], tracker: Option<usize>) -> Event {
        let mut attrs = EventAttributes::new();
        if let Some(tracker) = tracker {
            attrs.set_tracker(tracker);
        }
        Event {
            kind,
            paths: paths.to_vec(),
            attrs,
        }
    }

    #[test]
    fn test_coalescer_pairs_renames() {
        let a = PathBuf::from("/c/a.contact");
        let b = PathBuf::from("/c/b.contact");
        let from = EventKind::Modify(ModifyKind::Name(RenameMode::From));
        let to = EventKind::Modify(ModifyKind::Name(RenameMode::To));
        let mut coalescer = RenameCoalescer::default();
        let mut out = Vec::new();
        coalescer.push(notify_event(from, &[a.clone()], Some(7)), &mut out);
        assert!(out.is_empty());
        coalescer.push(notify_event(to, &[b.clone()], Some(7)), &mut out);
        coalescer.push(
            notify_event(
                EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
                &[a.clone(), b.clone()],
                Some(7),
            ),
            &mut out,
        );
        assert_eq!(out, vec![RawEvent::Renamed(a.clone(), b.clone())]);

        // Mismatched trackers do not pair.
        out.clear();
        coalescer.push(notify_event(from, &[a.clone()], Some(1)), &mut out);
        coalescer.push(notify_event(to, &[b.clone()], Some(2)), &mut out);
        assert_eq!(
            out,
            vec![RawEvent::Deleted(a.clone()), RawEvent::Changed(b.clone())]
        );
    }

    #[test]
    fn test_coalescer_maps_plain_events() {
        let a = PathBuf::from("/c/a.contact");
        let mut coalescer = RenameCoalescer::default();
        let mut out = Vec::new();
        coalescer.push(
            notify_event(EventKind::Create(CreateKind::File), &[a.clone()], None),
            &mut out,
        );
        coalescer.push(
            notify_event(EventKind::Create(CreateKind::Folder), &[a.clone()], None),
            &mut out,
        );
        coalescer.push(
            notify_event(EventKind::Modify(ModifyKind::Data(DataChange::Any)), &[a.clone()], None),
            &mut out,
        );
        coalescer.push(
            notify_event(EventKind::Access(notify::event::AccessKind::Any), &[a.clone()], None),
            &mut out,
        );
        coalescer.push(
            notify_event(EventKind::Modify(ModifyKind::Name(RenameMode::From)), &[a.clone()], None),
            &mut out,
        );
        coalescer.push(
            notify_event(EventKind::Remove(RemoveKind::File), &[a.clone()], None),
            &mut out,
        );
        assert_eq!(
            out,
            vec![
                RawEvent::Changed(a.clone()),
                RawEvent::Changed(a.clone()),
                RawEvent::Deleted(a.clone()),
                RawEvent::Deleted(a.clone()),
            ]
        );
        out.clear();
        coalescer.flush(&mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn test_seed_scan_knows_existing_records() {
        let h = Harness::new(&[
            ("a.contact", sample_contact()),
            ("broken.contact", "<contact/>".to_string()),
            ("notes.txt", "x".to_string()),
        ]);
        assert_eq!(h.watcher.known_len(), 1);
    }

    #[test]
    fn test_add_update_and_duplicate_suppression() {
        let mut h = Harness::new(&[]);
        fs::write(h.path("a.contact"), sample_contact()).unwrap();
        h.bump_mtime("a.contact", 0);
        h.process(RawEvent::Changed(h.path("a.contact")));
        assert_eq!(h.take(), vec![ContactEvent::Added(id(SAMPLE_ID))]);

        h.process(RawEvent::Changed(h.path("a.contact")));
        assert!(h.take().is_empty(), "same write time is a duplicate");

        fs::write(h.path("a.contact"), contact_with_id(OTHER_ID)).unwrap();
        h.bump_mtime("a.contact", 10);
        h.process(RawEvent::Changed(h.path("sub/../a.contact")));
        assert_eq!(
            h.take(),
            vec![ContactEvent::Updated(id(SAMPLE_ID), id(OTHER_ID))]
        );
    }

    #[test]
    fn test_bad_data_triage() {
        let mut h = Harness::new(&[("a.contact", sample_contact())]);
        fs::write(h.path("new.contact"), "<half").unwrap();
        h.process(RawEvent::Changed(h.path("new.contact")));
        assert!(h.take().is_empty(), "unparsable new file is ignored");

        fs::write(h.path("a.contact"), "<half").unwrap();
        h.bump_mtime("a.contact", 5);
        h.process(RawEvent::Changed(h.path("a.contact")));
        assert_eq!(h.take(), vec![ContactEvent::Removed(id(SAMPLE_ID))]);
        assert_eq!(h.watcher.known_len(), 0);
    }

    #[test]
    fn test_untracked_paths_are_ignored() {
        let mut h = Harness::new(&[]);
        fs::write(h.path("a.txt"), sample_contact()).unwrap();
        fs::write(h.path(".hidden.contact"), sample_contact()).unwrap();
        h.process(RawEvent::Changed(h.path("a.txt")));
        h.process(RawEvent::Changed(h.path(".hidden.contact")));
        h.process(RawEvent::Changed(PathBuf::from("/elsewhere/a.contact")));
        assert!(h.take().is_empty());
    }

    #[test]
    fn test_missing_update_is_retried_until_it_reappears() {
        let mut h = Harness::new(&[("a.contact", sample_contact())]);
        fs::remove_file(h.path("a.contact")).unwrap();
        h.process(RawEvent::Changed(h.path("a.contact")));
        assert!(h.take().is_empty());
        assert!(h.watcher.retry_deadline().is_some());

        fs::write(h.path("a.contact"), sample_contact()).unwrap();
        h.bump_mtime("a.contact", 30);
        let delivered = h.watcher.pump(&mut h.cache, Duration::from_millis(10)).unwrap();
        assert_eq!(delivered, 1);
        assert_eq!(
            h.take(),
            vec![ContactEvent::Updated(id(SAMPLE_ID), id(SAMPLE_ID))]
        );
        assert!(h.watcher.retry_deadline().is_none());
    }

    #[test]
    fn test_pending_update_gives_up_after_max_retries() {
        let mut h = Harness::new(&[("a.contact", sample_contact())]);
        fs::remove_file(h.path("a.contact")).unwrap();
        h.process(RawEvent::Changed(h.path("a.contact")));
        for _ in 0..WatchSettings::default().max_retries + 1 {
            h.watcher.pump(&mut h.cache, Duration::from_millis(1)).unwrap();
        }
        assert!(h.watcher.retry_deadline().is_none());
        assert!(h.take().is_empty());
    }

    #[test]
    fn test_rename_moves_and_replays_pending_update() {
        let mut h = Harness::new(&[("a.contact", sample_contact())]);
        // An update to a.contact is parked because the file is mid-save.
        fs::rename(h.path("a.contact"), h.path("b.contact")).unwrap();
        h.process(RawEvent::Changed(h.path("a.contact")));
        assert!(h.take().is_empty());

        h.process(RawEvent::Renamed(h.path("a.contact"), h.path("b.contact")));
        assert_eq!(
            h.take(),
            vec![
                ContactEvent::Moved(id(SAMPLE_ID), id(SAMPLE_ID)),
                ContactEvent::Updated(id(SAMPLE_ID), id(SAMPLE_ID)),
            ]
        );
        assert!(h.watcher.retry_deadline().is_none());
    }

    #[test]
    fn test_rename_edge_cases() {
        let mut h = Harness::new(&[
            ("a.contact", sample_contact()),
            ("b.contact", contact_with_id(OTHER_ID)),
        ]);
        // Target vanished before it could be read.
        h.process(RawEvent::Renamed(h.path("a.contact"), h.path("gone.contact")));
        assert_eq!(h.take(), vec![ContactEvent::Removed(id(SAMPLE_ID))]);

        // Renamed out of the tracked extensions.
        fs::rename(h.path("b.contact"), h.path("b.bak")).unwrap();
        h.process(RawEvent::Renamed(h.path("b.contact"), h.path("b.bak")));
        assert_eq!(h.take(), vec![ContactEvent::Removed(id(OTHER_ID))]);

        // Renamed into them.
        fs::rename(h.path("b.bak"), h.path("b.contact")).unwrap();
        h.process(RawEvent::Renamed(h.path("b.bak"), h.path("b.contact")));
        assert_eq!(h.take(), vec![ContactEvent::Added(id(OTHER_ID))]);
    }

    #[test]
    fn test_delete_removes_known_records_once() {
        let mut h = Harness::new(&[("a.contact", sample_contact())]);
        fs::remove_file(h.path("a.contact")).unwrap();
        h.process(RawEvent::Deleted(h.path("a.contact")));
        h.process(RawEvent::Deleted(h.path("a.contact")));
        assert_eq!(h.take(), vec![ContactEvent::Removed(id(SAMPLE_ID))]);
    }

    #[test]
    fn test_dispose_drains_queue_and_stops() {
        let mut h = Harness::new(&[]);
        fs::write(h.path("a.contact"), sample_contact()).unwrap();
        h.raw_tx
            .send(Ok(notify_event(
                EventKind::Create(CreateKind::File),
                &[h.path("a.contact")],
                None,
            )))
            .unwrap();
        assert_eq!(h.watcher.dispose(&mut h.cache).unwrap(), 1);
        assert!(h.watcher.is_disposed());
        assert_eq!(h.take(), vec![ContactEvent::Added(id(SAMPLE_ID))]);
        assert_eq!(h.watcher.pump(&mut h.cache, Duration::ZERO).unwrap(), 0);
    }

    #[test]
    fn test_subscriber_error_aborts_drain() {
        init_logging();
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.contact"), sample_contact()).unwrap();
        fs::write(dir.path().join("b.contact"), contact_with_id(OTHER_ID)).unwrap();
        let mut cache = ContactCache::new(dir.path(), schema(), CacheSettings::default());
        let (mut watcher, raw_tx) = ContactWatcher::seeded(
            &mut cache,
            WatchSettings::default(),
            Box::new(|_| Err(ContactError::Custom("receiver closed".to_string()))),
        );
        for name in ["a.contact", "b.contact"] {
            raw_tx
                .send(Ok(notify_event(
                    EventKind::Remove(RemoveKind::File),
                    &[dir.path().join(name)],
                    None,
                )))
                .unwrap();
        }
        assert!(matches!(
            watcher.dispose(&mut cache),
            Err(ContactError::Subscriber(_))
        ));
        assert!(watcher.is_disposed());
    }

    #[test]
    fn test_transient_load_errors_retry_then_surface() {
        let mut h = Harness::new(&[("a.contact", sample_contact())]);
        let calls = Rc::new(Cell::new(0));
        let counter = calls.clone();
        h.watcher.set_loader(Box::new(move |_, _| {
            counter.set(counter.get() + 1);
            Err(ContactError::Io("IOError: ResourceBusy".to_string()))
        }));
        let path = h.path("a.contact");
        let err = h
            .watcher
            .process(&mut h.cache, RawEvent::Changed(path))
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(calls.get(), WatchSettings::default().io_retries + 1);
        assert!(h.take().is_empty());
        assert_eq!(h.watcher.known_len(), 1);
    }

    #[test]
    fn test_permission_denied_recovers_within_retries() {
        let mut h = Harness::new(&[("a.contact", sample_contact())]);
        fs::write(h.path("a.contact"), contact_with_id(OTHER_ID)).unwrap();
        h.bump_mtime("a.contact", 20);
        let calls = Rc::new(Cell::new(0));
        let counter = calls.clone();
        h.watcher.set_loader(Box::new(move |cache, path| {
            counter.set(counter.get() + 1);
            if counter.get() <= 2 {
                Err(ContactError::PermissionDenied)
            } else {
                load_known(cache, path)
            }
        }));
        h.process(RawEvent::Changed(h.path("a.contact")));
        assert_eq!(calls.get(), 3);
        assert_eq!(
            h.take(),
            vec![ContactEvent::Updated(id(SAMPLE_ID), id(OTHER_ID))]
        );
    }

    #[test]
    fn test_load_failure_does_not_drop_rest_of_batch() {
        let mut h = Harness::new(&[
            ("a.contact", sample_contact()),
            ("b.contact", contact_with_id(OTHER_ID)),
        ]);
        h.watcher.set_loader(Box::new(|cache, path| {
            if path.ends_with("a.contact") {
                Err(ContactError::Io("IOError: ResourceBusy".to_string()))
            } else {
                load_known(cache, path)
            }
        }));
        fs::remove_file(h.path("b.contact")).unwrap();
        let changed = EventKind::Modify(ModifyKind::Data(DataChange::Content));
        for (kind, name) in [
            (changed, "a.contact"),
            (EventKind::Remove(RemoveKind::File), "b.contact"),
        ] {
            h.raw_tx
                .send(Ok(notify_event(kind, &[h.path(name)], None)))
                .unwrap();
        }
        assert!(matches!(
            h.watcher.pump(&mut h.cache, Duration::from_millis(10)),
            Err(ContactError::Io(_))
        ));
        assert_eq!(h.take(), vec![ContactEvent::Removed(id(OTHER_ID))]);

        // The watcher is still live once the file can be read again.
        h.watcher.set_loader(Box::new(load_known));
        h.bump_mtime("a.contact", 40);
        h.raw_tx
            .send(Ok(notify_event(changed, &[h.path("a.contact")], None)))
            .unwrap();
        assert_eq!(h.watcher.pump(&mut h.cache, Duration::from_millis(10)).unwrap(), 1);
        assert_eq!(
            h.take(),
            vec![ContactEvent::Updated(id(SAMPLE_ID), id(SAMPLE_ID))]
        );
    }

    #[cfg(not(any(windows, target_os = "macos")))]
    #[test]
    fn test_names_differing_only_in_case_are_tracked_apart() {
        let mut h = Harness::new(&[
            ("bob.contact", sample_contact()),
            ("BOB.contact", contact_with_id(OTHER_ID)),
        ]);
        assert_eq!(h.watcher.known_len(), 2);
        fs::remove_file(h.path("BOB.contact")).unwrap();
        h.process(RawEvent::Deleted(h.path("BOB.contact")));
        assert_eq!(h.take(), vec![ContactEvent::Removed(id(OTHER_ID))]);
        assert_eq!(h.watcher.known_len(), 1);
    }
}
