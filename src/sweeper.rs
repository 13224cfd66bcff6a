use crate::publisher::{DeleteOutcome, MessagePlatform};
use crate::types::PublishedMessage;
use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

/// Counters for one sweep pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub deleted: usize,
    pub errored: usize,
}

/// Result of a sweep: the rebuilt queue plus the handles that left it.
#[derive(Debug)]
pub struct SweepOutcome {
    pub kept: Vec<PublishedMessage>,
    pub removed: Vec<(String, i64)>,
    pub report: SweepReport,
}

/// Delete every expired message in the queue.
///
/// Terminal outcomes (deleted, already gone, past the platform's own age
/// limit) drop the row; anything retryable keeps it for the next sweep. The
/// queue is rebuilt rather than mutated in place, so re-running over an
/// already-clean queue is a no-op.
pub async fn sweep(
    platform: &dyn MessagePlatform,
    queue: &[PublishedMessage],
    now: DateTime<Utc>,
) -> SweepOutcome {
    let mut kept = Vec::new();
    let mut removed = Vec::new();
    let mut report = SweepReport::default();

    for message in queue {
        if !message.is_expired(now) {
            kept.push(message.clone());
            continue;
        }

        match platform.delete(&message.channel_id, message.message_id).await {
            Ok(DeleteOutcome::Deleted) => {
                info!("Deleted expired message {}", message.message_id);
                removed.push((message.channel_id.clone(), message.message_id));
                report.deleted += 1;
            }
            Ok(DeleteOutcome::NotFound) => {
                info!(
                    "Message {} was already gone, dropping from queue",
                    message.message_id
                );
                removed.push((message.channel_id.clone(), message.message_id));
                report.deleted += 1;
            }
            Ok(DeleteOutcome::TooOld) => {
                warn!(
                    "Message {} is past the platform's delete limit, dropping from queue",
                    message.message_id
                );
                removed.push((message.channel_id.clone(), message.message_id));
                report.deleted += 1;
            }
            Ok(DeleteOutcome::Retryable(reason)) => {
                error!(
                    "Delete of message {} failed, keeping for next sweep: {}",
                    message.message_id, reason
                );
                kept.push(message.clone());
                report.errored += 1;
            }
            Err(e) => {
                error!(
                    "Delete of message {} errored, keeping for next sweep: {}",
                    message.message_id, e
                );
                kept.push(message.clone());
                report.errored += 1;
            }
        }
    }

    if report.deleted > 0 || report.errored > 0 {
        info!(
            "Sweep processed {} expired message(s): {} removed, {} kept for retry",
            report.deleted + report.errored,
            report.deleted,
            report.errored
        );
    }

    SweepOutcome {
        kept,
        removed,
        report,
    }
}
