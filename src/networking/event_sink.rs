use std::io::Write;
use std::sync::{Mutex, PoisonError};

use crossbeam::channel::{self, Receiver, Sender};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::core::types::{ChunkCoord, EntityId, ObserverId, Tick, Vec3};

/// A single notification for one observer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorldEvent {
    ChunkShow {
        coord: ChunkCoord,
    },
    Spawn {
        entity: EntityId,
        uuid: Uuid,
        position: Vec3,
        velocity: Vec3,
    },
    Update {
        entity: EntityId,
        position: Vec3,
        velocity: Vec3,
    },
    ChunkUpdate {
        coord: ChunkCoord,
    },
    Despawn {
        entity: EntityId,
    },
    ChunkHide {
        coord: ChunkCoord,
    },
}

impl WorldEvent {
    pub fn entity(&self) -> Option<EntityId> {
        match self {
            WorldEvent::Spawn { entity, .. }
            | WorldEvent::Update { entity, .. }
            | WorldEvent::Despawn { entity } => Some(*entity),
            _ => None,
        }
    }

    pub fn chunk(&self) -> Option<ChunkCoord> {
        match self {
            WorldEvent::ChunkShow { coord }
            | WorldEvent::ChunkUpdate { coord }
            | WorldEvent::ChunkHide { coord } => Some(*coord),
            _ => None,
        }
    }
}

/// Everything one observer needs to hear about one tick, in delivery order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventBatch {
    pub observer: ObserverId,
    pub tick: Tick,
    pub events: Vec<WorldEvent>,
}

impl EventBatch {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("observer {0} is no longer connected")]
    Disconnected(ObserverId),

    #[error("failed to write event batch: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode event batch: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Network-facing consumer of event batches.
///
/// `dispatch` is called once per observer per tick and must keep the batch's
/// internal order. Different observers may be dispatched concurrently.
pub trait EventSink: Send + Sync {
    fn dispatch(&self, observer: ObserverId, batch: &EventBatch) -> Result<(), SinkError>;

    // Called once after an observer detaches
    fn close(&self, _observer: ObserverId) {}
}

/// Forwards batches into a crossbeam channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: Sender<EventBatch>,
}

impl ChannelSink {
    pub fn new() -> (Self, Receiver<EventBatch>) {
        let (sender, receiver) = channel::unbounded();
        (ChannelSink { sender }, receiver)
    }
}

impl EventSink for ChannelSink {
    fn dispatch(&self, observer: ObserverId, batch: &EventBatch) -> Result<(), SinkError> {
        self.sender
            .send(batch.clone())
            .map_err(|_| SinkError::Disconnected(observer))
    }
}

/// Writes one JSON document per batch. Handy for replay logs.
pub struct JsonLinesSink<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        JsonLinesSink { writer: Mutex::new(writer) }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<W: Write + Send> EventSink for JsonLinesSink<W> {
    fn dispatch(&self, _observer: ObserverId, batch: &EventBatch) -> Result<(), SinkError> {
        if batch.is_empty() {
            return Ok(());
        }
        let line = serde_json::to_string(batch)?;
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(writer, "{}", line)?;
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn dispatch(&self, _observer: ObserverId, _batch: &EventBatch) -> Result<(), SinkError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(observer: ObserverId) -> EventBatch {
        EventBatch {
            observer,
            tick: 4,
            events: vec![
                WorldEvent::ChunkShow { coord: ChunkCoord::new(0, 1) },
                WorldEvent::Despawn { entity: EntityId(3) },
            ],
        }
    }

    #[test]
    fn json_lines_are_tagged() {
        let sink = JsonLinesSink::new(Vec::new());
        let observer = ObserverId::new();
        sink.dispatch(observer, &batch(observer)).unwrap();
        sink.dispatch(observer, &EventBatch { observer, tick: 5, events: Vec::new() }).unwrap();

        let output = String::from_utf8(sink.into_inner()).unwrap();
        assert_eq!(output.lines().count(), 1);
        let parsed: EventBatch = serde_json::from_str(output.trim()).unwrap();
        assert_eq!(parsed, batch(observer));
        assert!(output.contains(r#""type":"chunk_show""#));
    }

    #[test]
    fn channel_sink_reports_disconnect() {
        let (sink, receiver) = ChannelSink::new();
        let observer = ObserverId::new();
        sink.dispatch(observer, &batch(observer)).unwrap();
        assert_eq!(receiver.recv().unwrap().tick, 4);

        drop(receiver);
        assert!(matches!(
            sink.dispatch(observer, &batch(observer)),
            Err(SinkError::Disconnected(id)) if id == observer
        ));
    }

    #[test]
    fn event_accessors() {
        assert_eq!(WorldEvent::Despawn { entity: EntityId(2) }.entity(), Some(EntityId(2)));
        assert_eq!(WorldEvent::ChunkHide { coord: ChunkCoord::new(1, 1) }.entity(), None);
        assert_eq!(
            WorldEvent::ChunkUpdate { coord: ChunkCoord::new(1, 1) }.chunk(),
            Some(ChunkCoord::new(1, 1))
        );
    }
}
