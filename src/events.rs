// src/events.rs

//! One-way notifications from the engine to the host application.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::trace;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::controller::MitmStatus;
use crate::store::{SessionEntry, SessionRecord, SessionSink};

#[derive(Debug, Clone)]
pub enum MitmEvent {
    Session(SessionRecord),
    Status(MitmStatus),
}

pub fn channel() -> (UnboundedSender<MitmEvent>, UnboundedReceiver<MitmEvent>) {
    mpsc::unbounded_channel()
}

/// Writes session entries to the sink and announces them on the event channel.
///
/// Clones share the pause flag, so pausing the recorder held by the
/// controller silences the proxy and monitor copies too.
#[derive(Clone)]
pub struct SessionRecorder {
    sink: Arc<dyn SessionSink>,
    events: Option<UnboundedSender<MitmEvent>>,
    paused: Arc<AtomicBool>,
}

impl SessionRecorder {
    pub fn new(sink: Arc<dyn SessionSink>) -> Self {
        SessionRecorder {
            sink,
            events: None,
            paused: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_events(mut self, events: UnboundedSender<MitmEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Stores `entry` unless recording is paused.
    pub fn record(&self, entry: SessionEntry) -> Option<SessionRecord> {
        if self.is_paused() {
            trace!("Recording paused, dropping session for {}", entry.url);
            return None;
        }
        let record = self.sink.add(entry);
        self.emit(MitmEvent::Session(record.clone()));
        Some(record)
    }

    pub fn emit(&self, event: MitmEvent) {
        if let Some(tx) = &self.events {
            // a closed receiver only means nobody is listening anymore
            let _ = tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn test_record_and_emit() {
        let store = Arc::new(MemoryStore::new());
        let (tx, mut rx) = channel();
        let recorder = SessionRecorder::new(store.clone()).with_events(tx);

        let record = recorder
            .record(SessionEntry {
                url: "http://a/".into(),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(record.id, 1);
        assert_eq!(store.sessions().len(), 1);
        match rx.try_recv().unwrap() {
            MitmEvent::Session(r) => assert_eq!(r.entry.url, "http://a/"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_pause_is_shared() {
        let store = Arc::new(MemoryStore::new());
        let recorder = SessionRecorder::new(store.clone());
        let copy = recorder.clone();

        recorder.set_paused(true);
        assert!(copy.record(SessionEntry::default()).is_none());
        assert!(store.sessions().is_empty());

        recorder.set_paused(false);
        assert!(copy.record(SessionEntry::default()).is_some());
    }

    #[test]
    fn test_closed_receiver_is_ignored() {
        let store = Arc::new(MemoryStore::new());
        let (tx, rx) = channel();
        drop(rx);
        let recorder = SessionRecorder::new(store).with_events(tx);
        assert!(recorder.record(SessionEntry::default()).is_some());
    }
}
