use crate::upnp::{EventHandler, NotifyServer, RenderingControl, UpnpError, UpnpFactory};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, Weak};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SubscriptionStatus {
    #[default]
    Unsubscribed,
    Subscribed,
    Rejected,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TelemetrySnapshot {
    pub volume_level: Option<f32>,
    pub is_volume_muted: Option<bool>,
}

#[derive(Debug, Default)]
struct Shared {
    status: SubscriptionStatus,
    snapshot: TelemetrySnapshot,
}

/// Push-based volume/mute feed from the TV's rendering-control service.
///
/// A session only exists fully built: `start` either returns one with a
/// running receiver and an attempted subscription, or unwinds everything it
/// created.
pub struct TelemetrySession {
    device: Option<Arc<dyn RenderingControl>>,
    server: Option<Box<dyn NotifyServer>>,
    shared: Arc<Mutex<Shared>>,
}

impl TelemetrySession {
    /// `Ok(None)` when the description cannot be fetched because the
    /// service is unreachable right now. Any subscription failure other than
    /// a rejection tears the session down and is returned.
    pub async fn start(
        factory: &dyn UpnpFactory,
        location: &str,
        on_change: EventHandler,
    ) -> Result<Option<Self>, UpnpError> {
        let device = match factory.create_device(location).await {
            Ok(device) => device,
            Err(err) if err.is_connection() => {
                tracing::debug!(location, error = %err, "rendering control unreachable");
                return Ok(None);
            }
            Err(err) => return Err(err),
        };

        let event_ip = factory.local_ip(location).await;
        let source = SocketAddr::new(event_ip.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)), 0);
        let mut server = factory.notify_server(source);
        server.start_server().await?;

        let handle = factory.rendering_control(device, server.as_ref());
        let shared = Arc::new(Mutex::new(Shared::default()));
        handle.set_on_event(Some(event_handler(
            Arc::downgrade(&handle),
            shared.clone(),
            on_change,
        )));

        let status = match handle.subscribe_services(true).await {
            Ok(()) => SubscriptionStatus::Subscribed,
            Err(err) if err.is_rejection() => {
                tracing::debug!(error = %err, "device rejected subscription");
                SubscriptionStatus::Rejected
            }
            Err(err) => {
                handle.set_on_event(None);
                drop(handle);
                server.stop_server().await;
                tracing::debug!(error = %err, "error while subscribing during device connect");
                return Err(err);
            }
        };
        lock(&shared).status = status;

        Ok(Some(Self {
            device: Some(handle),
            server: Some(server),
            shared,
        }))
    }

    pub fn is_alive(&self) -> bool {
        self.device.is_some()
    }

    #[cfg(test)]
    pub fn status(&self) -> SubscriptionStatus {
        lock(&self.shared).status
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        lock(&self.shared).snapshot
    }

    pub async fn set_volume_level(&self, volume: f32) -> Result<(), UpnpError> {
        match &self.device {
            Some(device) => device.set_volume_level(volume).await,
            None => Ok(()),
        }
    }

    /// Detaches the event handler, unsubscribes if subscribed, then stops
    /// the receiver. Calling it again is a no-op.
    pub async fn stop(&mut self) {
        if let Some(device) = self.device.take() {
            device.set_on_event(None);
            let was_subscribed = {
                let mut shared = lock(&self.shared);
                let subscribed = shared.status == SubscriptionStatus::Subscribed;
                shared.status = SubscriptionStatus::Unsubscribed;
                subscribed
            };
            if was_subscribed {
                if let Err(err) = device.unsubscribe_services().await {
                    tracing::debug!(error = %err, "unsubscribe failed");
                }
            }
        }
        if let Some(mut server) = self.server.take() {
            server.stop_server().await;
        }
    }
}

fn event_handler(
    device: Weak<dyn RenderingControl>,
    shared: Arc<Mutex<Shared>>,
    on_change: EventHandler,
) -> EventHandler {
    Arc::new(move || {
        let Some(device) = device.upgrade() else {
            return;
        };
        {
            let mut shared = lock(&shared);
            if shared.status == SubscriptionStatus::Rejected {
                return;
            }
            if let Some(volume) = device.volume_level() {
                shared.snapshot.volume_level = Some(volume);
            }
            if let Some(muted) = device.is_volume_muted() {
                shared.snapshot.is_volume_muted = Some(muted);
            }
        }
        on_change();
    })
}

fn lock(shared: &Mutex<Shared>) -> std::sync::MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|e| e.into_inner())
}
