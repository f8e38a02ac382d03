use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    RequestForwarded,
    UpstreamFailed,
    TunnelRejected,
    TlsHandshakeStarted,
    TlsHandshakeSucceeded,
    TlsHandshakeFailed,
    StreamClosed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowContext {
    pub connection_id: u64,
    pub scheme: String,
    pub remote: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub kind: EventType,
    pub context: FlowContext,
    pub occurred_at_unix_ms: u128,
    pub attributes: BTreeMap<String, String>,
}

impl Event {
    pub fn new(kind: EventType, context: FlowContext) -> Self {
        Self {
            kind,
            context,
            occurred_at_unix_ms: now_unix_ms(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: &str, value: impl Into<String>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

#[derive(Debug, Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: Event) {}
}

/// Collects every emitted event; intended for tests.
#[derive(Debug, Default, Clone)]
pub struct VecEventSink {
    events: Arc<Mutex<Vec<Event>>>,
}

impl VecEventSink {
    pub fn snapshot(&self) -> Vec<Event> {
        self.events.lock().expect("lock poisoned").clone()
    }
}

impl EventSink for VecEventSink {
    fn emit(&self, event: Event) {
        self.events.lock().expect("lock poisoned").push(event);
    }
}

fn now_unix_ms() -> u128 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_millis(),
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::{Event, EventSink, EventType, FlowContext, VecEventSink};

    fn context() -> FlowContext {
        FlowContext {
            connection_id: 7,
            scheme: "http".to_string(),
            remote: "example.com:80".to_string(),
        }
    }

    #[test]
    fn vec_sink_records_events_in_order() {
        let sink = VecEventSink::default();
        sink.emit(Event::new(EventType::RequestForwarded, context()));
        sink.emit(
            Event::new(EventType::StreamClosed, context()).with_attribute("reason_code", "clean_eof"),
        );

        let events = sink.snapshot();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventType::RequestForwarded);
        assert_eq!(events[1].kind, EventType::StreamClosed);
        assert_eq!(
            events[1].attributes.get("reason_code").map(String::as_str),
            Some("clean_eof")
        );
    }

    #[test]
    fn events_carry_a_timestamp() {
        let event = Event::new(EventType::TlsHandshakeStarted, context());
        assert!(event.occurred_at_unix_ms > 0);
    }
}
