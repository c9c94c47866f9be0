pub mod legacy;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// The one key still delivered while a power-off is in progress.
pub const KEY_POWEROFF: &str = "KEY_POWEROFF";

/// Application name to application id, as reported by the TV.
pub type AppList = HashMap<String, String>;

pub type ReauthCallback = Arc<dyn Fn() + Send + Sync>;
pub type AppListCallback = Arc<dyn Fn(AppList) + Send + Sync>;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("connection to {host} failed: {source}")]
    Connection {
        host: String,
        #[source]
        source: std::io::Error,
    },
    #[error("timed out talking to {0}")]
    Timeout(String),
    #[error("access denied by the TV")]
    AccessDenied,
    #[error("unexpected response from the TV: {0}")]
    Protocol(String),
}

/// Command transport towards the TV. The controller treats every transport
/// through this trait and never checks which one it holds.
#[async_trait]
pub trait Bridge: Send + Sync {
    async fn is_on(&self) -> Result<bool, BridgeError>;

    /// Fire-and-forget: success means the command was accepted, not that
    /// the TV finished powering down.
    async fn power_off(&self) -> Result<(), BridgeError>;

    /// Keys are delivered in order; delivery stops at the first failure.
    async fn send_keys(&self, keys: &[String]) -> Result<(), BridgeError>;

    /// Ask the TV for its application list. The answer, if any, arrives
    /// later through the registered app-list callback.
    async fn request_app_list(&self) -> Result<(), BridgeError>;

    /// Optional capability; `None` when the transport cannot launch apps.
    fn app_launcher(&self) -> Option<&dyn AppLauncher> {
        None
    }

    fn register_reauth_callback(&self, callback: ReauthCallback);

    fn register_app_list_callback(&self, callback: AppListCallback);
}

#[async_trait]
pub trait AppLauncher: Send + Sync {
    async fn launch_app(&self, app_id: &str) -> Result<(), BridgeError>;
}
