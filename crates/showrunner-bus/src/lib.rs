pub mod causation;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use showrunner_store::{EventArchive, EventLog, StoreError};
use showrunner_types::{validate_payload, Event, EventType, PayloadError};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub use causation::CausationIndex;

const CONSUME_BATCH: usize = 10;
const CONSUME_BLOCK: Duration = Duration::from_secs(1);

pub type BusResult<T> = Result<T, BusError>;

#[derive(Debug, Error)]
pub enum BusError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Payload(#[from] PayloadError),
}

/// An in-process event consumer. Handlers must be idempotent on
/// `event.event_id`: the log delivers at least once, and a locally
/// published event can additionally arrive through the consumer loop
/// after the causation index has evicted it.
#[async_trait]
pub trait Subscriber: Send + Sync {
    fn name(&self) -> &str;
    fn subscribed_events(&self) -> Vec<EventType>;
    async fn handle_event(&self, event: &Event) -> anyhow::Result<()>;
}

/// Publishes events to the durable log and dispatches them to in-process
/// subscribers; one consumer loop per subscribed topic picks up events
/// published by other processes.
#[derive(Clone)]
pub struct EventBus {
    log: EventLog,
    archive: EventArchive,
    subscribers: Arc<RwLock<HashMap<EventType, Vec<Arc<dyn Subscriber>>>>>,
    causation: Arc<Mutex<CausationIndex>>,
    loops: Arc<Mutex<Vec<JoinHandle<()>>>>,
    stream_prefix: String,
    consumer_group: String,
    consumer_name: String,
}

impl EventBus {
    pub fn new(
        log: EventLog,
        archive: EventArchive,
        stream_prefix: impl Into<String>,
        consumer_group: impl Into<String>,
        causation_capacity: usize,
    ) -> Self {
        Self {
            log,
            archive,
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            causation: Arc::new(Mutex::new(CausationIndex::new(causation_capacity))),
            loops: Arc::new(Mutex::new(Vec::new())),
            stream_prefix: stream_prefix.into(),
            consumer_group: consumer_group.into(),
            consumer_name: format!("consumer-{}", Uuid::new_v4().simple()),
        }
    }

    fn topic(&self, event_type: EventType) -> String {
        format!("{}:{}", self.stream_prefix, event_type.as_str())
    }

    pub async fn subscribe(&self, subscriber: Arc<dyn Subscriber>) {
        let types = subscriber.subscribed_events();
        let mut subscribers = self.subscribers.write().await;
        for event_type in &types {
            subscribers
                .entry(*event_type)
                .or_default()
                .push(subscriber.clone());
        }
        info!(
            subscriber = subscriber.name(),
            types = ?types.iter().map(|t| t.as_str()).collect::<Vec<_>>(),
            "subscribed"
        );
    }

    /// Append to the log, archive, then notify local subscribers. Local
    /// notification is best-effort: a failing subscriber is logged and the
    /// publish stands.
    pub async fn publish(&self, event: Event) -> BusResult<Uuid> {
        validate_payload(event.event_type, &event.payload)?;

        let topic = self.topic(event.event_type);
        self.archive.persist(&event).await?;
        // Indexed before the append so the consumer loop can never observe
        // the message ahead of the local-publish marker.
        self.causation.lock().await.insert(event.clone());
        self.log.append(&topic, &event).await?;
        debug!(
            event_id = %event.event_id,
            event_type = event.event_type.as_str(),
            project_id = %event.project_id,
            actor = %event.actor,
            "published"
        );

        self.dispatch_local(&event).await;
        Ok(event.event_id)
    }

    async fn dispatch_local(&self, event: &Event) {
        let targets: Vec<Arc<dyn Subscriber>> = {
            let subscribers = self.subscribers.read().await;
            subscribers
                .get(&event.event_type)
                .cloned()
                .unwrap_or_default()
        };
        for subscriber in targets {
            if let Err(err) = subscriber.handle_event(event).await {
                warn!(
                    subscriber = subscriber.name(),
                    event_id = %event.event_id,
                    event_type = event.event_type.as_str(),
                    %err,
                    "subscriber failed handling event"
                );
            }
        }
    }

    /// Start one consumer loop per subscribed event type. Loops exit on
    /// cancellation; [`EventBus::drain`] awaits them.
    pub async fn start_consuming(&self, cancel: CancellationToken) -> BusResult<()> {
        let types: Vec<EventType> = {
            let subscribers = self.subscribers.read().await;
            subscribers.keys().copied().collect()
        };
        let mut loops = self.loops.lock().await;
        for event_type in types {
            let topic = self.topic(event_type);
            self.log.ensure_group(&topic, &self.consumer_group).await?;
            let bus = self.clone();
            let cancel = cancel.clone();
            loops.push(tokio::spawn(async move {
                bus.consume_topic(event_type, cancel).await;
            }));
        }
        info!(count = loops.len(), "started event consumer loops");
        Ok(())
    }

    async fn consume_topic(&self, event_type: EventType, cancel: CancellationToken) {
        let topic = self.topic(event_type);
        loop {
            let read = tokio::select! {
                _ = cancel.cancelled() => break,
                read = self.log.read_group(
                    &topic,
                    &self.consumer_group,
                    &self.consumer_name,
                    CONSUME_BATCH,
                    CONSUME_BLOCK,
                ) => read,
            };
            let messages = match read {
                Ok(messages) => messages,
                Err(err) => {
                    error!(topic, %err, "consumer read failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };
            for (message_id, event) in messages {
                // Locally published events were already dispatched inline;
                // the index recognizes them. Evicted ids fall through to a
                // second dispatch, which idempotent handlers absorb.
                let already_seen = self.causation.lock().await.contains(&event.event_id);
                if !already_seen {
                    self.causation.lock().await.insert(event.clone());
                    self.dispatch_local(&event).await;
                }
                if let Err(err) = self.log.ack(&topic, &self.consumer_group, message_id).await {
                    error!(topic, message_id, %err, "ack failed");
                }
            }
        }
        debug!(topic, "consumer loop stopped");
    }

    /// Await consumer loops after their token has been cancelled.
    pub async fn drain(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut loops = self.loops.lock().await;
            loops.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Causal chain for an event, oldest first. Served from the in-memory
    /// ring; hops the ring has evicted are filled from the archive.
    pub async fn causation_chain(&self, event_id: &Uuid) -> BusResult<Vec<Event>> {
        let from_index = self.causation.lock().await.chain(event_id);
        let complete = from_index
            .first()
            .map(|head| head.causation_id.is_none())
            .unwrap_or(false);
        if complete {
            return Ok(from_index);
        }
        Ok(self.archive.causation_chain(&event_id.to_string()).await?)
    }

    /// Scan the relevant topics and return matching events sorted by
    /// timestamp. Replay never notifies subscribers.
    pub async fn replay(
        &self,
        project_id: &str,
        event_types: Option<&[EventType]>,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> BusResult<Vec<Event>> {
        let types: Vec<EventType> = match event_types {
            Some(types) => types.to_vec(),
            None => EventType::ALL.to_vec(),
        };
        let mut events = Vec::new();
        for event_type in types {
            let topic = self.topic(event_type);
            for (_, event) in self.log.range(&topic, None, None).await? {
                if event.project_id != project_id {
                    continue;
                }
                if let Some(since) = since {
                    if event.timestamp < since {
                        continue;
                    }
                }
                if let Some(until) = until {
                    if event.timestamp > until {
                        continue;
                    }
                }
                events.push(event);
            }
        }
        events.sort_by_key(|e| e.timestamp);
        Ok(events)
    }

    pub fn archive(&self) -> &EventArchive {
        &self.archive
    }
}
