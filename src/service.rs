//! # Contact service
//!
//! [ContactService] bundles the pieces that must share one owner: the [ContactCache], the
//! [ContactWatcher] (created when the first subscriber arrives) and that subscriber. It is
//! usable directly from a single thread by calling [ContactService::pump] in the owner's loop.
//!
//! [ContactService::spawn] moves the whole bundle onto a dedicated thread instead and hands back
//! a [ServiceHandle]. Lookups are sent to that thread as [Request]s and change events come back
//! on a channel.
//!
//! ```rust,no_run
//! use contact_core::{config::ContactsConfig, service::ContactService};
//!
//! let handle = ContactService::spawn(ContactsConfig::new("/srv/contacts"))?;
//! handle.subscribe()?;
//! for event in handle.events().iter() {
//!     println!("{event}");
//! }
//! # Ok::<(), contact_core::ContactError>(())
//! ```

use enumset::EnumSet;
use std::{
    path::{Path, PathBuf},
    sync::{
        mpsc::{channel, Receiver, RecvTimeoutError, Sender},
        Arc,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use crate::{
    cache::ContactCache,
    codec::schema::Schema,
    config::{ContactsConfig, WatchSettings},
    error::ContactError,
    event::ContactEvent,
    properties::ContactType,
    store::ReadonlyStore,
    watch::{ContactWatcher, Subscriber},
};

/// How long the actor waits for a request before checking the watcher again.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct ContactService {
    cache: ContactCache,
    settings: WatchSettings,
    watcher: Option<ContactWatcher>,
}

impl std::fmt::Debug for ContactService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContactService")
            .field("cache", &self.cache)
            .field("watcher", &self.watcher)
            .finish()
    }
}

impl ContactService {
    pub fn new(config: &ContactsConfig) -> Result<ContactService, ContactError> {
        Ok(ContactService::with_schema(config, Schema::contact()?))
    }

    pub fn with_schema(config: &ContactsConfig, schema: Arc<Schema>) -> ContactService {
        ContactService {
            cache: ContactCache::from_config(config, schema),
            settings: config.watch.clone(),
            watcher: None,
        }
    }

    pub fn cache(&mut self) -> &mut ContactCache {
        &mut self.cache
    }

    pub fn get<P: AsRef<Path>>(&mut self, path: P) -> Result<Arc<ReadonlyStore>, ContactError> {
        self.cache.get(path)
    }

    pub fn get_all(
        &mut self,
        types: EnumSet<ContactType>,
    ) -> impl Iterator<Item = (PathBuf, Arc<ReadonlyStore>)> + '_ {
        self.cache.get_all(types)
    }

    pub fn is_subscribed(&self) -> bool {
        self.watcher.is_some()
    }

    /// Register the one subscriber. The directory is scanned and watched from this point on.
    pub fn subscribe(&mut self, subscriber: Subscriber) -> Result<(), ContactError> {
        if self.watcher.is_some() {
            return Err(ContactError::InvalidArgument(
                "a subscriber is already registered".to_string(),
            ));
        }
        let watcher = ContactWatcher::new(&mut self.cache, self.settings.clone(), subscriber)?;
        self.watcher = Some(watcher);
        Ok(())
    }

    /// Drop the subscriber and tear the watcher down, delivering what was already queued.
    pub fn unsubscribe(&mut self) -> Result<usize, ContactError> {
        match self.watcher.take() {
            Some(mut watcher) => watcher.dispose(&mut self.cache),
            None => Ok(0),
        }
    }

    /// Process watcher events for up to `timeout` and run the cache tick when it is due.
    pub fn pump(&mut self, timeout: Duration) -> Result<usize, ContactError> {
        let delivered = match self.watcher.as_mut() {
            Some(watcher) => watcher.pump(&mut self.cache, timeout),
            None => Ok(0),
        };
        self.cache.maybe_tick(Instant::now());
        delivered
    }

    /// [ContactService::pump] for a loop that has to keep going. A record that can't be read is
    /// logged and the watch continues; a failed subscriber ends the subscription.
    pub fn pump_logged(&mut self, timeout: Duration) -> usize {
        match self.pump(timeout) {
            Ok(delivered) => delivered,
            Err(ContactError::Subscriber(err)) => {
                tracing::warn!("[ContactService] subscriber failed, unsubscribing: {err}");
                if let Err(err) = self.unsubscribe() {
                    tracing::warn!("[ContactService] teardown failed: {err}");
                }
                0
            }
            Err(err) => {
                tracing::warn!("[ContactService] watcher error: {err}");
                0
            }
        }
    }

    /// Confine a new service to its own thread.
    pub fn spawn(config: ContactsConfig) -> Result<ServiceHandle, ContactError> {
        let schema = Schema::contact()?;
        let (request_tx, request_rx) = channel::<Request>();
        let (event_tx, event_rx) = channel::<ContactEvent>();
        let thread = std::thread::Builder::new()
            .name("contact-service".to_string())
            .spawn(move || {
                let service = ContactService::with_schema(&config, schema);
                run_actor(service, request_rx, event_tx)
            })?;
        Ok(ServiceHandle {
            requests: request_tx,
            events: event_rx,
            thread: Some(thread),
        })
    }
}

impl Drop for ContactService {
    fn drop(&mut self) {
        if let Err(err) = self.unsubscribe() {
            tracing::warn!("[ContactService] subscriber failed during teardown: {err}");
        }
    }
}

/// Messages understood by the service thread.
pub enum Request {
    Get {
        path: PathBuf,
        reply: Sender<Result<Arc<ReadonlyStore>, ContactError>>,
    },
    GetAll {
        types: EnumSet<ContactType>,
        reply: Sender<Vec<(PathBuf, Arc<ReadonlyStore>)>>,
    },
    /// Start forwarding change events to the handle's event channel.
    Subscribe {
        reply: Sender<Result<(), ContactError>>,
    },
    Shutdown,
}

fn run_actor(
    mut service: ContactService,
    requests: Receiver<Request>,
    events: Sender<ContactEvent>,
) -> Result<(), ContactError> {
    tracing::info!("[ContactService] started on {:?}", service.cache.root());
    loop {
        let wait = if service.is_subscribed() {
            POLL_INTERVAL
        } else {
            service.cache.tick_interval()
        };
        match requests.recv_timeout(wait) {
            Ok(Request::Get { path, reply }) => {
                let _ = reply.send(service.get(path));
            }
            Ok(Request::GetAll { types, reply }) => {
                let _ = reply.send(service.get_all(types).collect());
            }
            Ok(Request::Subscribe { reply }) => {
                let tx = events.clone();
                let result = service.subscribe(Box::new(move |event| {
                    tx.send(*event)?;
                    Ok(())
                }));
                let _ = reply.send(result);
            }
            Ok(Request::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
        service.pump_logged(Duration::ZERO);
    }
    tracing::info!("[ContactService] shutting down");
    service.unsubscribe().map(|_| ())
}

/// Client side of a service thread started by [ContactService::spawn].
#[derive(Debug)]
pub struct ServiceHandle {
    requests: Sender<Request>,
    events: Receiver<ContactEvent>,
    thread: Option<JoinHandle<Result<(), ContactError>>>,
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Request::Get { path, .. } => write!(f, "Get({path:?})"),
            Request::GetAll { types, .. } => write!(f, "GetAll({types:?})"),
            Request::Subscribe { .. } => write!(f, "Subscribe"),
            Request::Shutdown => write!(f, "Shutdown"),
        }
    }
}

impl ServiceHandle {
    fn call<T>(&self, make: impl FnOnce(Sender<T>) -> Request) -> Result<T, ContactError> {
        let (reply_tx, reply_rx) = channel();
        self.requests
            .send(make(reply_tx))
            .map_err(|_| ContactError::Custom("contact service has stopped".to_string()))?;
        reply_rx
            .recv()
            .map_err(|_| ContactError::Custom("contact service dropped the request".to_string()))
    }

    pub fn get<P: Into<PathBuf>>(&self, path: P) -> Result<Arc<ReadonlyStore>, ContactError> {
        let path = path.into();
        self.call(|reply| Request::Get { path, reply })?
    }

    pub fn get_all(
        &self,
        types: EnumSet<ContactType>,
    ) -> Result<Vec<(PathBuf, Arc<ReadonlyStore>)>, ContactError> {
        self.call(|reply| Request::GetAll { types, reply })
    }

    pub fn subscribe(&self) -> Result<(), ContactError> {
        self.call(|reply| Request::Subscribe { reply })?
    }

    pub fn events(&self) -> &Receiver<ContactEvent> {
        &self.events
    }

    /// Stop the service thread and wait for it, returning its teardown result.
    pub fn shutdown(mut self) -> Result<(), ContactError> {
        self.stop()
    }

    fn stop(&mut self) -> Result<(), ContactError> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        let _ = self.requests.send(Request::Shutdown);
        thread
            .join()
            .map_err(|_| ContactError::Custom("contact service thread panicked".to_string()))?
    }
}

impl Drop for ServiceHandle {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            tracing::warn!("[ContactService] {err}");
        }
    }
}
