use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::events::Event;

/// A published event with its id and timestamp.
#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub id: u64,
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub event: Event,
}

struct LogState {
    ring: VecDeque<EventRecord>,
    next_id: u64,
    counts: HashMap<&'static str, u64>,
}

/// Observer invoked on every published record (durability mirrors, etc.).
pub type EventSink = Box<dyn Fn(&EventRecord) + Send + Sync>;

/// Bounded in-memory log with broadcast fan-out.
pub struct EventLog {
    max_events: usize,
    state: Mutex<LogState>,
    tx: broadcast::Sender<EventRecord>,
    sink: Option<EventSink>,
}

impl EventLog {
    pub fn new(max_events: usize) -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            max_events,
            state: Mutex::new(LogState {
                ring: VecDeque::new(),
                next_id: 1,
                counts: HashMap::new(),
            }),
            tx,
            sink: None,
        }
    }

    pub fn with_sink(mut self, sink: EventSink) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Append and fan out. Returns the record id.
    pub fn publish(&self, event: Event) -> u64 {
        let record = {
            let mut st = self.state.lock().unwrap();
            let record = EventRecord {
                id: st.next_id,
                ts: Utc::now(),
                event,
            };
            st.next_id += 1;
            *st.counts.entry(record.event.event_name()).or_insert(0) += 1;
            st.ring.push_back(record.clone());
            while st.ring.len() > self.max_events {
                st.ring.pop_front();
            }
            record
        };
        tracing::debug!(id = record.id, event = record.event.event_name(), "event published");
        // No receivers is fine; dashboards come and go.
        let _ = self.tx.send(record.clone());
        if let Some(sink) = &self.sink {
            sink(&record);
        }
        record.id
    }

    /// Events after `since_id`, optionally filtered by type, newest last.
    pub fn tail(&self, since_id: u64, limit: usize, event_type: Option<&str>) -> Vec<EventRecord> {
        let st = self.state.lock().unwrap();
        st.ring
            .iter()
            .filter(|r| r.id > since_id)
            .filter(|r| event_type.map_or(true, |t| r.event.event_name() == t))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventRecord> {
        self.tx.subscribe()
    }

    pub fn counts(&self) -> HashMap<String, u64> {
        let st = self.state.lock().unwrap();
        st.counts
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect()
    }
}
