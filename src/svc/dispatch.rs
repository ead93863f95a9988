//! # Dispatch module
//!
//! This module provides the event intake loop shared by every controller: it
//! scans the dispatcher directory for request files, parses them as event
//! bundles, hands them to the controller and writes the response files

use std::{
    collections::HashSet,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::{
    signal::unix::{signal, SignalKind},
    time::{sleep, Instant},
};
use tracing::{debug, error, info, warn};

// -----------------------------------------------------------------------------
// Constants

pub const REQUEST_PREFIX: &str = "request-";
pub const REQUEST_SUFFIX: &str = ".json";
pub const RESPONSE_PREFIX: &str = "response-";
pub const RESPONSE_SUFFIX: &str = ".txt";

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to parse event bundle, {0}")]
    Json(serde_json::Error),
    #[error("failed to parse event bundle, expected an array or an object")]
    Shape,
    #[error("failed to install signal handler, {0}")]
    Signal(std::io::Error),
}

// -----------------------------------------------------------------------------
// EventType enumeration

#[derive(Deserialize, PartialEq, Eq, Clone, Copy, Debug)]
pub enum EventType {
    Added,
    Modified,
    Deleted,
    Synchronization,
}

// -----------------------------------------------------------------------------
// Binding structures

#[derive(Deserialize, Clone, Debug)]
pub struct ObjectWrapper {
    #[serde(rename = "object")]
    pub object: Option<Value>,
}

#[derive(Deserialize, Clone, Debug)]
pub struct WatchEvent {
    #[serde(rename = "type")]
    pub kind: Option<EventType>,
    #[serde(rename = "object")]
    pub object: Option<Value>,
}

/// one binding of a dispatcher request, accepting the three wire shapes of
/// the event object (`object`, `objects[].object` and `watchEvent.object`)
#[derive(Deserialize, Clone, Debug)]
pub struct Binding {
    #[serde(rename = "type")]
    pub kind: Option<EventType>,
    #[serde(rename = "object")]
    pub object: Option<Value>,
    #[serde(rename = "objects")]
    pub objects: Option<Vec<ObjectWrapper>>,
    #[serde(rename = "watchEvent")]
    pub watch_event: Option<WatchEvent>,
}

impl Binding {
    /// the effective event type: explicit when given, `Synchronization` for
    /// the multi-object shape, `Modified` otherwise
    pub fn event_type(&self) -> EventType {
        self.kind
            .or_else(|| self.watch_event.as_ref().and_then(|we| we.kind))
            .unwrap_or(if self.objects.is_some() {
                EventType::Synchronization
            } else {
                EventType::Modified
            })
    }
}

// -----------------------------------------------------------------------------
// Event structure

/// one resource event, uniform across the wire shapes
#[derive(Clone, Copy, Debug)]
pub struct Event<'a> {
    pub kind: EventType,
    pub object: &'a Value,
}

// -----------------------------------------------------------------------------
// Bundle structure

#[derive(Clone, Debug)]
pub struct Bundle {
    pub bindings: Vec<Binding>,
}

impl Bundle {
    /// parse a request payload. The dispatcher writes a JSON array of
    /// bindings; the grafana variant writes a single object, possibly nested
    /// under a `binding` key.
    pub fn parse(payload: &str) -> Result<Self, Error> {
        let value: Value = serde_json::from_str(payload).map_err(Error::Json)?;

        let bindings = match value {
            Value::Array(items) => items
                .into_iter()
                .map(|item| serde_json::from_value(item).map_err(Error::Json))
                .collect::<Result<Vec<_>, _>>()?,
            Value::Object(mut map) => {
                let binding = map.remove("binding").unwrap_or(Value::Object(map));
                vec![serde_json::from_value(binding).map_err(Error::Json)?]
            }
            _ => return Err(Error::Shape),
        };

        Ok(Self { bindings })
    }

    /// enumerate the events of every binding in order
    pub fn events(&self) -> Vec<Event<'_>> {
        let mut events = Vec::new();

        for binding in &self.bindings {
            let kind = binding.event_type();

            if let Some(object) = &binding.object {
                events.push(Event { kind, object });
            } else if let Some(object) = binding
                .watch_event
                .as_ref()
                .and_then(|we| we.object.as_ref())
            {
                events.push(Event { kind, object });
            } else if let Some(objects) = &binding.objects {
                for wrapper in objects {
                    if let Some(object) = &wrapper.object {
                        events.push(Event { kind, object });
                    }
                }
            }
        }

        events
    }

    /// the `kind` field of the first event object, used for dispatch
    pub fn first_kind(&self) -> Option<&str> {
        self.events()
            .first()
            .and_then(|event| event.object.get("kind"))
            .and_then(|kind| kind.as_str())
    }
}

// -----------------------------------------------------------------------------
// Handler trait

/// controller-side of the dispatch loop, one implementation per operator
#[async_trait]
pub trait Handler {
    type Error: std::error::Error + Send + Sync;

    /// reconcile the resources carried by the given bundle
    async fn handle(&mut self, bundle: &Bundle) -> Result<(), Self::Error>;

    /// period of the full reconciliation pass, when the controller has one
    fn resync_interval(&self) -> Option<Duration> {
        None
    }

    /// full reconciliation pass, invoked every [`Handler::resync_interval`]
    async fn resync(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// Dispatcher structure

/// the shared event loop: serial, one request at a time, in directory scan
/// order
pub struct Dispatcher<H> {
    directory: PathBuf,
    poll_interval: Duration,
    handler: H,
    processed: HashSet<String>,
    shutdown: Arc<AtomicBool>,
}

impl<H> Dispatcher<H>
where
    H: Handler + Send,
{
    pub fn new(directory: impl Into<PathBuf>, poll_interval: Duration, handler: H) -> Self {
        Self {
            directory: directory.into(),
            poll_interval,
            handler,
            processed: HashSet::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// run until SIGTERM or SIGINT; the request in flight completes before
    /// the loop exits
    pub async fn run(mut self) -> Result<(), Error> {
        let mut sigterm = signal(SignalKind::terminate()).map_err(Error::Signal)?;
        let mut sigint = signal(SignalKind::interrupt()).map_err(Error::Signal)?;

        let shutdown = self.shutdown.to_owned();
        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM, initiating graceful shutdown"),
                _ = sigint.recv() => info!("Received SIGINT, initiating graceful shutdown"),
            }

            shutdown.store(true, Ordering::SeqCst);
        });

        info!(
            directory = self.directory.display().to_string(),
            "Start to watch for dispatcher requests",
        );

        let mut last_resync: Option<Instant> = None;
        while !self.shutdown.load(Ordering::SeqCst) {
            if let Some(interval) = self.handler.resync_interval() {
                if last_resync.map_or(true, |at| at.elapsed() >= interval) {
                    if let Err(err) = self.handler.resync().await {
                        error!(
                            error = err.to_string(),
                            "Failed to execute periodic reconciliation",
                        );
                    }

                    last_resync = Some(Instant::now());
                }
            }

            self.process_pending().await;
            sleep(self.poll_interval).await;
        }

        info!("Dispatch loop halted");
        Ok(())
    }

    /// process every pending request file observed in one directory scan
    async fn process_pending(&mut self) {
        let mut entries = match tokio::fs::read_dir(&self.directory).await {
            Ok(entries) => entries,
            Err(err) => {
                warn!(
                    directory = self.directory.display().to_string(),
                    error = err.to_string(),
                    "Failed to read dispatcher directory, waiting",
                );
                return;
            }
        };

        let mut seen = HashSet::new();
        let mut pending = Vec::new();

        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(REQUEST_PREFIX) && name.ends_with(REQUEST_SUFFIX) {
                seen.insert(name.to_owned());
                if !self.processed.contains(&name) {
                    pending.push(name);
                }
            }
        }

        for name in pending {
            if self.shutdown.load(Ordering::SeqCst) {
                info!("Shutdown requested, stopping request processing");
                break;
            }

            self.process_request(&name).await;
        }

        // the dispatcher not reusing identifiers, a processed name can be
        // forgotten once its file disappears
        self.processed.retain(|name| seen.contains(name));
    }

    /// process a single request file and write its response
    async fn process_request(&mut self, name: &str) {
        let id = &name[REQUEST_PREFIX.len()..name.len() - REQUEST_SUFFIX.len()];
        let request = self.directory.join(name);
        let response = self
            .directory
            .join(format!("{}{}{}", RESPONSE_PREFIX, id, RESPONSE_SUFFIX));

        debug!(request = name, "Processing dispatcher request");

        let result = match tokio::fs::read_to_string(&request).await {
            Ok(payload) => match Bundle::parse(&payload) {
                Ok(bundle) => self
                    .handler
                    .handle(&bundle)
                    .await
                    .map_err(|err| err.to_string()),
                Err(err) => Err(err.to_string()),
            },
            Err(err) => Err(err.to_string()),
        };

        let content = match &result {
            Ok(()) => "OK\n".to_string(),
            Err(message) => {
                error!(
                    request = name,
                    error = message,
                    "Failed to process dispatcher request",
                );

                format!("ERROR: {}\n", message.replace('\n', " "))
            }
        };

        if let Err(err) = tokio::fs::write(&response, content).await {
            error!(
                response = response.display().to_string(),
                error = err.to_string(),
                "Failed to write response file",
            );
        }

        self.processed.insert(name.to_string());

        if let Err(err) = tokio::fs::remove_file(&request).await {
            warn!(
                request = name,
                error = err.to_string(),
                "Failed to remove request file, it will be skipped on the next scan",
            );
        }
    }
}

// -----------------------------------------------------------------------------
// Tests
