//! Broadcast - best-effort observer fan-out for dashboard clients
//!
//! Every state transition in a pipeline is announced as an envelope. Sends
//! are non-blocking and unreplayed; observers that have gone away are pruned
//! on the next emit.

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

/// The wire shape delivered to every observer.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "projectId")]
    pub project_id: String,
    pub payload: Value,
}

struct Observer {
    id: Uuid,
    tx: mpsc::UnboundedSender<String>,
}

#[derive(Default)]
pub struct Broadcaster {
    observers: Mutex<Vec<Observer>>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer; the returned id unsubscribes it.
    pub fn subscribe(&self) -> (Uuid, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        self.observers.lock().push(Observer { id, tx });
        (id, rx)
    }

    pub fn unsubscribe(&self, id: Uuid) {
        self.observers.lock().retain(|o| o.id != id);
    }

    /// Deliver an envelope to every connected observer, stamping the payload
    /// with the emit time. Closed observers are dropped.
    pub fn emit(&self, kind: &str, project_id: &str, mut payload: Value) {
        if let Some(obj) = payload.as_object_mut() {
            obj.insert(
                "timestamp".to_string(),
                Value::String(Utc::now().to_rfc3339()),
            );
        }

        let envelope = Envelope {
            kind: kind.to_string(),
            project_id: project_id.to_string(),
            payload,
        };
        let Ok(serialized) = serde_json::to_string(&envelope) else {
            return;
        };

        self.observers
            .lock()
            .retain(|o| o.tx.send(serialized.clone()).is_ok());
    }

    pub fn observer_count(&self) -> usize {
        self.observers.lock().len()
    }
}
