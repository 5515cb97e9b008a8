//! Status channel
//!
//! One ordered stream of [`Event`]s from every running operation to a single
//! consumer. Senders are cheap to clone and never block; each event is also
//! mirrored into the `log` facade at the level matching its severity.

use tokio::sync::mpsc;

use espforge_core::{Event, OperationState};

/// Create a connected sender/receiver pair
pub fn status_channel() -> (StatusSender, StatusReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (StatusSender { tx }, StatusReceiver { rx })
}

/// Producer side of the status channel
#[derive(Debug, Clone)]
pub struct StatusSender {
    tx: mpsc::UnboundedSender<Event>,
}

impl StatusSender {
    /// Emit an event
    ///
    /// A dropped receiver is not an error: the operation keeps running and
    /// the event still reaches the log.
    pub fn send(&self, event: Event) {
        log::log!(event.severity().log_level(), "{}", event.message());
        let _ = self.tx.send(event);
    }

    pub fn info(&self, text: impl Into<String>) {
        self.send(Event::info(text));
    }

    pub fn warning(&self, text: impl Into<String>) {
        self.send(Event::warning(text));
    }

    pub fn error(&self, text: impl Into<String>) {
        self.send(Event::error(text));
    }

    pub fn success(&self, text: impl Into<String>) {
        self.send(Event::success(text));
    }

    pub fn state(&self, state: OperationState) {
        self.send(Event::State(state));
    }
}

/// Consumer side of the status channel
#[derive(Debug)]
pub struct StatusReceiver {
    rx: mpsc::UnboundedReceiver<Event>,
}

impl StatusReceiver {
    /// Wait for the next event; `None` once every sender is gone
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Next event if one is already queued
    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }

    /// Take every queued event
    pub fn drain(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Some(ev) = self.try_recv() {
            events.push(ev);
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use espforge_core::Severity;

    #[test]
    fn test_order_preserved_across_clones() {
        let (tx, mut rx) = status_channel();
        let tx2 = tx.clone();
        tx.info("one");
        tx2.warning("two");
        tx.state(OperationState::Success);

        let events = rx.drain();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].message(), "one");
        assert_eq!(events[1].severity(), Severity::Warning);
        assert_eq!(events[2], Event::State(OperationState::Success));
        assert!(rx.try_recv().is_none());
    }

    #[test]
    fn test_send_after_receiver_dropped() {
        let (tx, rx) = status_channel();
        drop(rx);
        tx.error("nobody listening");
    }
}
