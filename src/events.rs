use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;

/// Backend -> UI events for download sessions.
///
/// Every session opens with `DownloadInfo` and ends with exactly one of
/// `DownloadComplete` or `DownloadError`.
#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorEvent {
    DownloadInfo {
        title: String,
        order: u64,
    },
    DownloadUpdate {
        progress: f64,
        order: u64,
    },
    /// Service-shaped track metadata, sent on `channel` (e.g. `qobuz-details`).
    Details {
        channel: String,
        order: u64,
        payload: Value,
    },
    DownloadComplete {
        order: u64,
    },
    /// Terminal failure of the session.
    DownloadError {
        /// Session the error belongs to. Not part of the wire payload.
        order: u64,
        message: String,
    },
    /// An error reported while the downloader keeps running. Delivered on the same
    /// `download-error` channel but does not end the session.
    RuntimeError {
        order: u64,
        message: String,
    },
}

impl SupervisorEvent {
    /// Name of the UI channel this event is delivered on.
    pub fn channel(&self) -> &str {
        match self {
            SupervisorEvent::DownloadInfo { .. } => "download-info",
            SupervisorEvent::DownloadUpdate { .. } => "download-update",
            SupervisorEvent::Details { channel, .. } => channel,
            SupervisorEvent::DownloadComplete { .. } => "download-complete",
            SupervisorEvent::DownloadError { .. } | SupervisorEvent::RuntimeError { .. } => {
                "download-error"
            }
        }
    }

    /// Body delivered on [`SupervisorEvent::channel`].
    pub fn payload(&self) -> Value {
        match self {
            SupervisorEvent::DownloadInfo { title, order } => {
                json!({ "title": title, "order": order })
            }
            SupervisorEvent::DownloadUpdate { progress, order } => {
                json!({ "progress": progress, "order": order })
            }
            SupervisorEvent::Details { payload, .. } => payload.clone(),
            SupervisorEvent::DownloadComplete { order } => json!({ "order": order }),
            SupervisorEvent::DownloadError { message, .. }
            | SupervisorEvent::RuntimeError { message, .. } => json!({ "message": message }),
        }
    }

    pub fn order(&self) -> u64 {
        match self {
            SupervisorEvent::DownloadInfo { order, .. }
            | SupervisorEvent::DownloadUpdate { order, .. }
            | SupervisorEvent::Details { order, .. }
            | SupervisorEvent::DownloadComplete { order }
            | SupervisorEvent::DownloadError { order, .. }
            | SupervisorEvent::RuntimeError { order, .. } => *order,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SupervisorEvent::DownloadComplete { .. } | SupervisorEvent::DownloadError { .. }
        )
    }

    pub fn to_envelope(&self) -> EventEnvelope {
        EventEnvelope {
            channel: self.channel().to_string(),
            data: self.payload(),
        }
    }
}

/// One event as written to the UI bridge: `{"channel": ..., "data": ...}`.
#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    pub channel: String,
    pub data: Value,
}

/// Send an event to the caller. A closed channel means nobody is listening any more,
/// which is logged and otherwise ignored.
pub async fn emit_event(tx: &mpsc::Sender<SupervisorEvent>, event: SupervisorEvent) {
    log::debug!("Emitting {} for download {}", event.channel(), event.order());
    if let Err(e) = tx.send(event).await {
        log::warn!("Event receiver dropped, discarding {}", e.0.channel());
    }
}
