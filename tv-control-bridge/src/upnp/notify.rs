use super::{NotifyServer, NotifySink, UpnpError};
use async_trait::async_trait;
use axum::{
    extract::State,
    http::{Method, StatusCode},
    response::IntoResponse,
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

const STOP_GRACE: Duration = Duration::from_secs(5);

/// Receives GENA `NOTIFY` requests on an ephemeral local port.
pub struct AxumNotifyServer {
    source: SocketAddr,
    path: String,
    sink: Arc<NotifySink>,
    bound: Option<SocketAddr>,
    shutdown_tx: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

impl AxumNotifyServer {
    pub fn new(source: SocketAddr) -> Self {
        Self {
            source,
            // Unique per server so late callbacks for a previous
            // subscription land on a 404 instead of a fresh session.
            path: format!("/notify/{}", Uuid::new_v4().simple()),
            sink: Arc::new(NotifySink::default()),
            bound: None,
            shutdown_tx: None,
            task: None,
        }
    }
}

#[async_trait]
impl NotifyServer for AxumNotifyServer {
    async fn start_server(&mut self) -> Result<(), UpnpError> {
        if self.task.is_some() {
            return Ok(());
        }
        let listener = TcpListener::bind(self.source).await?;
        let bound = listener.local_addr()?;

        let app = Router::new()
            .route(&self.path, axum::routing::any(notify_handler))
            .with_state(self.sink.clone());

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.changed().await;
                })
                .await;
            if let Err(err) = served {
                tracing::warn!(error = %err, "notify server stopped");
            }
        });

        tracing::debug!(addr = %bound, "notify server listening");
        self.bound = Some(bound);
        self.shutdown_tx = Some(shutdown_tx);
        self.task = Some(task);
        Ok(())
    }

    async fn stop_server(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(STOP_GRACE, &mut task).await.is_err() {
                tracing::debug!("notify server did not drain in time, aborting");
                task.abort();
            }
        }
        self.sink.set_consumer(None);
        self.bound = None;
    }

    fn callback_url(&self) -> Option<String> {
        self.bound.map(|addr| format!("http://{}{}", addr, self.path))
    }

    fn sink(&self) -> Arc<NotifySink> {
        self.sink.clone()
    }
}

async fn notify_handler(
    State(sink): State<Arc<NotifySink>>,
    method: Method,
    body: String,
) -> impl IntoResponse {
    if method.as_str() != "NOTIFY" {
        return StatusCode::METHOD_NOT_ALLOWED;
    }
    sink.deliver(&body);
    StatusCode::OK
}
