//! Rendering-control eventing: the seam the telemetry session talks to, and
//! the HTTP implementation behind it.

pub mod client;
pub mod notify;
pub mod xml;

use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use thiserror::Error;

pub use client::HttpUpnpFactory;

pub type EventHandler = Arc<dyn Fn() + Send + Sync>;
pub type BodyConsumer = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Error)]
pub enum UpnpError {
    #[error("cannot reach {url}: {message}")]
    Connection { url: String, message: String },
    /// The device answered a subscription or description request with a
    /// non-success status.
    #[error("device responded {status} to {url}")]
    Response { url: String, status: u16 },
    /// The device refused to perform a SOAP action.
    #[error("action {action} rejected with status {status}")]
    ActionResponse { action: &'static str, status: u16 },
    #[error("invalid device description: {0}")]
    InvalidDescription(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl UpnpError {
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }

    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Response { .. })
    }
}

/// The parts of a device description the rendering-control handle needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpnpDevice {
    pub location: String,
    pub friendly_name: Option<String>,
    pub service_type: String,
    pub control_url: String,
    pub event_sub_url: String,
}

/// Slot through which a notify server hands raw event bodies to whichever
/// device handle was built on top of it.
#[derive(Default)]
pub struct NotifySink {
    consumer: Mutex<Option<BodyConsumer>>,
}

impl NotifySink {
    pub fn set_consumer(&self, consumer: Option<BodyConsumer>) {
        *self.consumer.lock().unwrap_or_else(|e| e.into_inner()) = consumer;
    }

    pub fn deliver(&self, body: &str) {
        let consumer = self
            .consumer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(consumer) = consumer {
            consumer(body);
        }
    }
}

#[async_trait]
pub trait UpnpFactory: Send + Sync {
    async fn create_device(&self, location: &str) -> Result<UpnpDevice, UpnpError>;

    /// Local address of the interface that routes towards `location`.
    async fn local_ip(&self, location: &str) -> Option<IpAddr>;

    fn notify_server(&self, source: SocketAddr) -> Box<dyn NotifyServer>;

    fn rendering_control(
        &self,
        device: UpnpDevice,
        server: &dyn NotifyServer,
    ) -> Arc<dyn RenderingControl>;
}

/// Local HTTP receiver for pushed events.
#[async_trait]
pub trait NotifyServer: Send + Sync {
    async fn start_server(&mut self) -> Result<(), UpnpError>;

    async fn stop_server(&mut self);

    /// URL the device should call back on; `None` until started.
    fn callback_url(&self) -> Option<String>;

    fn sink(&self) -> Arc<NotifySink>;
}

#[async_trait]
pub trait RenderingControl: Send + Sync {
    fn set_on_event(&self, handler: Option<EventHandler>);

    async fn subscribe_services(&self, auto_resubscribe: bool) -> Result<(), UpnpError>;

    async fn unsubscribe_services(&self) -> Result<(), UpnpError>;

    async fn set_volume_level(&self, volume: f32) -> Result<(), UpnpError>;

    fn volume_level(&self) -> Option<f32>;

    fn is_volume_muted(&self) -> Option<bool>;
}
