use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Formatter},
    path::PathBuf,
};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::{catalog::RelationKind, properties::RecordId};

/// Database level notifications, forwarded to every subscriber of a
/// [crate::database::Database].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GraphEvent {
    /// A record was purged at the end of a deletion cascade
    RecordDeleted(RecordId),
    /// kind, subject, object, affirm (true for connect, false for disconnect)
    RelationChanged(RelationKind, RecordId, RecordId, bool),
    /// A load finished and the loaded content replaced the live database
    DatabaseLoaded(PathBuf),
    DatabaseClosed,
}

impl Display for GraphEvent {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            GraphEvent::RecordDeleted(id) => write!(f, "RecordDeleted({id})"),
            GraphEvent::RelationChanged(kind, s, o, affirm) => {
                let op = if *affirm { "+" } else { "-" };
                write!(f, "RelationChanged({s} {op}{kind} {o})")
            }
            GraphEvent::DatabaseLoaded(path) => write!(f, "DatabaseLoaded({path:?})"),
            GraphEvent::DatabaseClosed => write!(f, "DatabaseClosed"),
        }
    }
}

/// Fan-out of [GraphEvent]s to any number of unbounded tokio receivers. Subscribers that dropped
/// their receiver are pruned on the next publish.
#[derive(Debug, Default)]
pub struct EventBus {
    senders: Vec<UnboundedSender<GraphEvent>>,
}

impl EventBus {
    pub fn subscribe(&mut self) -> UnboundedReceiver<GraphEvent> {
        let (tx, rx) = unbounded_channel();
        self.senders.push(tx);
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.senders.len()
    }

    pub fn publish(&mut self, event: GraphEvent) {
        tracing::trace!("[EventBus::publish] {event}");
        self.senders.retain(|tx| match tx.send(event.clone()) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("Dropping closed event subscriber: {}", crate::GraphError::from(e));
                false
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::properties::RecordType;
    use test_log::test;

    #[test]
    fn test_publish_reaches_live_subscribers_only() {
        let mut bus = EventBus::default();
        let mut rx1 = bus.subscribe();
        let rx2 = bus.subscribe();
        drop(rx2);

        let id = RecordId::new(RecordType::Note, 4);
        bus.publish(GraphEvent::RecordDeleted(id));
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(rx1.try_recv().unwrap(), GraphEvent::RecordDeleted(id));
        assert!(rx1.try_recv().is_err());
    }
}
