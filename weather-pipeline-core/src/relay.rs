//! Turns store mutation notifications into archived change events.
//!
//! Delivery is at-least-once: a redelivered notification becomes a second event
//! with a later `emitted_at`. Ranking keys on the observation timestamp inside
//! the payload, so the duplicate collapses downstream.

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{Instrument, error, info};

use crate::{
    archive::{ArchiveKey, ArchiveWriter},
    clock::Clock,
    context::RunContext,
    model::ChangeEvent,
    stream::StreamRecord,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayReport {
    pub processed: usize,
    pub archived: usize,
    pub dropped: usize,
}

impl RelayReport {
    fn record(&mut self, archived: Option<&ArchiveKey>) {
        self.processed += 1;
        match archived {
            Some(_) => self.archived += 1,
            None => self.dropped += 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChangeRelay {
    writer: ArchiveWriter,
    clock: Arc<dyn Clock>,
}

impl ChangeRelay {
    pub fn new(writer: ArchiveWriter, clock: Arc<dyn Clock>) -> Self {
        Self { writer, clock }
    }

    /// Build the change event for one notification, stamped with the current time.
    pub fn capture(&self, record: StreamRecord) -> ChangeEvent {
        ChangeEvent::from_images(
            record.event_name,
            self.clock.now(),
            record.change.new_image,
            record.change.old_image,
        )
    }

    /// Capture and archive one notification. A failed write is logged and the event dropped.
    pub async fn relay(&self, record: StreamRecord) -> Option<ArchiveKey> {
        let event = self.capture(record);

        match self.writer.store(&event).await {
            Ok(key) => {
                info!(event_type = %event.event_type, city = %event.city, %key, "archived change event");
                Some(key)
            }
            Err(err) => {
                error!(
                    event_type = %event.event_type,
                    city = %event.city,
                    emitted_at = %event.emitted_at,
                    error = %err,
                    "failed to archive change event; dropping it"
                );
                None
            }
        }
    }

    /// Process a delivered batch in order.
    pub async fn process_batch(&self, ctx: &RunContext, records: Vec<StreamRecord>) -> RelayReport {
        async {
            let mut report = RelayReport::default();
            for record in records {
                let key = self.relay(record).await;
                report.record(key.as_ref());
            }
            info!(?report, "relayed stream batch");
            report
        }
        .instrument(ctx.span().clone())
        .await
    }

    /// Process every notification already buffered on the stream, then return.
    pub async fn drain(&self, ctx: &RunContext, changes: &mut mpsc::UnboundedReceiver<StreamRecord>) -> RelayReport {
        let mut records = Vec::new();
        while let Ok(record) = changes.try_recv() {
            records.push(record);
        }
        self.process_batch(ctx, records).await
    }

    /// Consume the stream until every sender is gone.
    pub async fn run(&self, ctx: &RunContext, mut changes: mpsc::UnboundedReceiver<StreamRecord>) -> RelayReport {
        async {
            let mut report = RelayReport::default();
            while let Some(record) = changes.recv().await {
                let key = self.relay(record).await;
                report.record(key.as_ref());
            }
            info!(?report, "change stream closed");
            report
        }
        .instrument(ctx.span().clone())
        .await
    }
}
