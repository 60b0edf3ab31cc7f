use crate::automation::FlowStart;
use crate::config::env_u64;
use crate::http::build_client;
use crate::models::TriggerOutcome;
use crate::notify::Notification;
use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum OutboxError {
    #[error("request failed: {0}")]
    Request(String),
}

#[async_trait]
pub trait NotificationQueue: Send + Sync {
    async fn enqueue(&self, notification: &Notification) -> Result<(), OutboxError>;
}

#[async_trait]
pub trait AutomationEngine: Send + Sync {
    async fn start_session(&self, start: &FlowStart) -> Result<(), OutboxError>;
}

#[derive(Debug, Clone)]
pub enum OutboxMessage {
    Notify(Notification),
    StartFlow(FlowStart),
}

impl OutboxMessage {
    fn kind(&self) -> &'static str {
        match self {
            OutboxMessage::Notify(_) => "notification",
            OutboxMessage::StartFlow(_) => "flow_start",
        }
    }
}

struct Envelope {
    run_id: Uuid,
    message: OutboxMessage,
}

/// One-way channel to the notification queue and automation engine. Sends never
/// wait; a full or closed channel is reported as a failed trigger.
#[derive(Clone)]
pub struct Outbox {
    tx: mpsc::Sender<Envelope>,
}

impl Outbox {
    pub fn spawn(
        queue: Arc<dyn NotificationQueue>,
        engine: Arc<dyn AutomationEngine>,
        capacity: usize,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Envelope>(capacity.max(1));
        let handle = tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                let kind = envelope.message.kind();
                let result = match &envelope.message {
                    OutboxMessage::Notify(notification) => queue.enqueue(notification).await,
                    OutboxMessage::StartFlow(start) => engine.start_session(start).await,
                };
                match result {
                    Ok(()) => {
                        debug!(target = "salesignal.outbox", run_id = %envelope.run_id, kind, "outbox_delivered")
                    }
                    Err(err) => {
                        warn!(target = "salesignal.outbox", run_id = %envelope.run_id, kind, error = %err, "outbox_delivery_failed")
                    }
                }
            }
        });
        (Self { tx }, handle)
    }

    pub fn from_env() -> (Self, JoinHandle<()>) {
        let capacity = env_u64("OUTBOX_CAPACITY", 256) as usize;
        let queue: Arc<dyn NotificationQueue> = match HttpSink::from_env("NOTIFICATION_QUEUE_URL") {
            Some(sink) => Arc::new(sink),
            None => Arc::new(LogSink),
        };
        let engine: Arc<dyn AutomationEngine> = match HttpSink::from_env("AUTOMATION_ENGINE_URL") {
            Some(sink) => Arc::new(sink),
            None => Arc::new(LogSink),
        };
        Self::spawn(queue, engine, capacity)
    }

    pub fn send(&self, run_id: Uuid, message: OutboxMessage) -> TriggerOutcome {
        let kind = message.kind();
        match self.tx.try_send(Envelope { run_id, message }) {
            Ok(()) => TriggerOutcome::Queued,
            Err(err) => {
                warn!(target = "salesignal.outbox", run_id = %run_id, kind, error = %err, "outbox_enqueue_failed");
                TriggerOutcome::Failed {
                    error: err.to_string(),
                }
            }
        }
    }
}

/// JSON POST sink with an idempotency key per run and message kind.
#[derive(Debug, Clone)]
pub struct HttpSink {
    url: String,
    http: Client,
}

impl HttpSink {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into().trim_end_matches('/').to_string(),
            http: build_client(),
        }
    }

    pub fn from_env(key: &str) -> Option<Self> {
        std::env::var(key)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(Self::new)
    }

    async fn post<T: serde::Serialize + Sync>(
        &self,
        path: &str,
        idempotency_key: String,
        body: &T,
    ) -> Result<(), OutboxError> {
        let response = self
            .http
            .post(format!("{}{path}", self.url))
            .header("Idempotency-Key", idempotency_key)
            .json(body)
            .send()
            .await
            .map_err(|err| OutboxError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(OutboxError::Request(format!("HTTP {}", response.status())));
        }
        Ok(())
    }
}

#[async_trait]
impl NotificationQueue for HttpSink {
    async fn enqueue(&self, notification: &Notification) -> Result<(), OutboxError> {
        let key = format!(
            "notify:{}:{}:{}",
            notification.tenant_id, notification.instance_id, notification.phone
        );
        self.post("/notifications", key, notification).await
    }
}

#[async_trait]
impl AutomationEngine for HttpSink {
    async fn start_session(&self, start: &FlowStart) -> Result<(), OutboxError> {
        let key = format!("flow:{}:{}:{}", start.tenant_id, start.flow_id, start.phone);
        self.post("/sessions", key, start).await
    }
}

/// Used when no queue is configured; deliveries are only logged.
pub struct LogSink;

#[async_trait]
impl NotificationQueue for LogSink {
    async fn enqueue(&self, notification: &Notification) -> Result<(), OutboxError> {
        info!(target = "salesignal.outbox", tenant = %notification.tenant_id, title = %notification.title, "notification_logged");
        Ok(())
    }
}

#[async_trait]
impl AutomationEngine for LogSink {
    async fn start_session(&self, start: &FlowStart) -> Result<(), OutboxError> {
        info!(target = "salesignal.outbox", tenant = %start.tenant_id, flow = %start.flow_id, "flow_start_logged");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingSink;
    use httpmock::prelude::*;
    use std::time::Duration;

    fn notification() -> Notification {
        Notification {
            tenant_id: "t-1".into(),
            instance_id: "inst-1".into(),
            phone: "5511999990000".into(),
            title: "Venda".into(),
            body: "R$ 10,00".into(),
        }
    }

    #[tokio::test]
    async fn worker_delivers_queued_messages() {
        let sink = Arc::new(RecordingSink::default());
        let (outbox, _handle) = Outbox::spawn(sink.clone(), sink.clone(), 8);
        let outcome = outbox.send(Uuid::new_v4(), OutboxMessage::Notify(notification()));
        assert_eq!(outcome, TriggerOutcome::Queued);
        for _ in 0..50 {
            if !sink.notifications().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(sink.notifications(), vec![notification()]);
    }

    #[tokio::test]
    async fn closed_channel_reports_failure_without_panicking() {
        let sink = Arc::new(RecordingSink::default());
        let (outbox, handle) = Outbox::spawn(sink.clone(), sink, 1);
        handle.abort();
        let _ = handle.await;
        let outcome = outbox.send(Uuid::new_v4(), OutboxMessage::Notify(notification()));
        assert!(matches!(outcome, TriggerOutcome::Failed { .. }));
    }

    #[tokio::test]
    async fn http_sink_sends_idempotency_key() {
        let server = MockServer::start_async().await;
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/notifications")
                .header("Idempotency-Key", "notify:t-1:inst-1:5511999990000");
            then.status(202);
        });
        let sink = HttpSink::new(server.base_url());
        sink.enqueue(&notification()).await.unwrap();
        mock.assert_calls(1);
    }
}
