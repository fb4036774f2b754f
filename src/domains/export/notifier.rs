use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Terminal outcome of a background job, pushed to whoever listens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum JobEvent {
    #[serde(rename_all = "camelCase")]
    Ready {
        job_id: Uuid,
        result_ref: String,
        requested_by: Uuid,
    },
    #[serde(rename_all = "camelCase")]
    Failed {
        job_id: Uuid,
        error: String,
        requested_by: Uuid,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> Uuid {
        match self {
            JobEvent::Ready { job_id, .. } | JobEvent::Failed { job_id, .. } => *job_id,
        }
    }
}

/// Fire-and-forget delivery of job outcomes. Must never block the worker.
pub trait JobEventNotifier: Send + Sync {
    fn notify(&self, event: JobEvent);
}

/// Writes outcomes to the log only.
pub struct LogNotifier;

impl JobEventNotifier for LogNotifier {
    fn notify(&self, event: JobEvent) {
        match event {
            JobEvent::Ready { job_id, result_ref, .. } => {
                log::info!("Export job {} ready at {}", job_id, result_ref)
            }
            JobEvent::Failed { job_id, error, .. } => log::warn!("Export job {} failed: {}", job_id, error),
        }
    }
}

/// Fans outcomes out to in-process subscribers.
pub struct BroadcastNotifier {
    sender: broadcast::Sender<JobEvent>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }
}

impl JobEventNotifier for BroadcastNotifier {
    fn notify(&self, event: JobEvent) {
        // No subscribers is fine
        if self.sender.send(event).is_err() {
            log::trace!("No listeners for export job event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_events() {
        let notifier = BroadcastNotifier::new(4);
        let mut rx = notifier.subscribe();
        let job_id = Uuid::new_v4();
        notifier.notify(JobEvent::Failed {
            job_id,
            error: "boom".into(),
            requested_by: Uuid::new_v4(),
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.job_id(), job_id);

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "failed");
        assert_eq!(json["error"], "boom");
    }

    #[test]
    fn sending_without_subscribers_is_harmless() {
        BroadcastNotifier::new(1).notify(JobEvent::Ready {
            job_id: Uuid::new_v4(),
            result_ref: "a/b.csv".into(),
            requested_by: Uuid::new_v4(),
        });
    }
}
