#[cfg(test)]
pub mod testing;

use crate::bridge::{AppList, Bridge, BridgeError, KEY_POWEROFF};
use crate::discovery::AppDiscoveryGate;
use crate::model::{
    builtin_sources, source_key, DeviceLifecycle, MediaState, PowerState, SupportedFeatures,
};
use crate::power::{self, PowerOffDebounce, ReconcileGuards};
use crate::telemetry::TelemetrySession;
use crate::upnp::{EventHandler, UpnpError, UpnpFactory};
use crate::wake::{self, MacAddress, WakeError};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("{0} is not supported by this TV")]
    Unsupported(&'static str),
    #[error(transparent)]
    Bridge(#[from] BridgeError),
    #[error(transparent)]
    Upnp(#[from] UpnpError),
    #[error(transparent)]
    Wake(#[from] WakeError),
}

/// Out-of-band notifications raised from bridge and telemetry callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    /// The TV refused this client; nothing recovers until reconfigured.
    ReauthRequired,
    TelemetryChanged,
    AppsChanged,
}

impl CommandError {
    /// Whether the caller, rather than the TV or the network, is at fault.
    pub fn is_caller_error(&self) -> bool {
        matches!(self, Self::InvalidInput(_) | Self::Unsupported(_))
    }
}

/// Every command the controller accepts from outside the poll loop.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ControlCommand {
    TurnOn,
    TurnOff,
    SendKeys { keys: Vec<String> },
    LaunchApp { app_id: String },
    SetVolume { level: f32 },
    VolumeUp,
    VolumeDown,
    MuteVolume,
    MediaPlay,
    MediaPause,
    MediaPlayPause,
    MediaNextTrack,
    MediaPreviousTrack,
    PlayMedia { kind: String, media_id: String },
    SelectSource { source: String },
}

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub name: String,
    pub host: String,
    pub mac: Option<MacAddress>,
    pub on_action: Option<Vec<String>>,
    pub rendering_control_location: Option<String>,
    pub poll_interval: Duration,
    pub app_list_timeout: Duration,
}

pub struct DeviceController {
    options: ControllerOptions,
    bridge: Arc<dyn Bridge>,
    upnp: Arc<dyn UpnpFactory>,
    gate: Arc<AppDiscoveryGate>,
    auth_failed: Arc<AtomicBool>,
    shutting_down: bool,
    debounce: PowerOffDebounce,
    state: PowerState,
    playing: bool,
    volume_level: Option<f32>,
    is_volume_muted: Option<bool>,
    telemetry: Option<TelemetrySession>,
    published: watch::Sender<MediaState>,
    events: mpsc::UnboundedSender<DeviceEvent>,
}

impl DeviceController {
    /// Builds the controller and hands its callbacks to the bridge. The
    /// returned receiver carries events raised from those callbacks.
    pub fn new(
        options: ControllerOptions,
        bridge: Arc<dyn Bridge>,
        upnp: Arc<dyn UpnpFactory>,
    ) -> (Self, mpsc::UnboundedReceiver<DeviceEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let gate = Arc::new(AppDiscoveryGate::new(options.app_list_timeout));
        let auth_failed = Arc::new(AtomicBool::new(false));

        {
            let auth_failed = auth_failed.clone();
            let events = events.clone();
            bridge.register_reauth_callback(Arc::new(move || {
                auth_failed.store(true, Ordering::SeqCst);
                let _ = events.send(DeviceEvent::ReauthRequired);
            }));
        }
        {
            let gate = gate.clone();
            let events = events.clone();
            bridge.register_app_list_callback(Arc::new(move |apps: AppList| {
                gate.deliver(apps);
                let _ = events.send(DeviceEvent::AppsChanged);
            }));
        }

        let (published, _) = watch::channel(MediaState {
            name: options.name.clone(),
            ..MediaState::default()
        });
        let mut controller = Self {
            options,
            bridge,
            upnp,
            gate,
            auth_failed,
            shutting_down: false,
            debounce: PowerOffDebounce::default(),
            state: PowerState::Off,
            playing: true,
            volume_level: None,
            is_volume_muted: None,
            telemetry: None,
            published,
            events,
        };
        controller.publish();
        (controller, events_rx)
    }

    pub fn subscribe(&self) -> watch::Receiver<MediaState> {
        self.published.subscribe()
    }

    #[cfg(test)]
    pub fn snapshot(&self) -> MediaState {
        self.published.borrow().clone()
    }

    #[cfg(test)]
    pub fn state(&self) -> PowerState {
        self.state
    }

    pub fn lifecycle(&self) -> DeviceLifecycle {
        power::lifecycle(self.state, &self.debounce, Instant::now())
    }

    pub fn auth_failed(&self) -> bool {
        self.auth_failed.load(Ordering::SeqCst)
    }

    pub fn power_off_in_progress(&self) -> bool {
        self.debounce.in_progress(Instant::now())
    }

    #[cfg(test)]
    pub fn has_telemetry(&self) -> bool {
        self.telemetry.as_ref().is_some_and(TelemetrySession::is_alive)
    }

    pub fn is_available(&self) -> bool {
        if self.auth_failed() {
            return false;
        }
        self.state == PowerState::On
            || self.options.on_action.is_some()
            || self.options.mac.is_some()
            || self.power_off_in_progress()
    }

    pub fn supported_features(&self) -> SupportedFeatures {
        SupportedFeatures::for_device(
            self.options.on_action.is_some() || self.options.mac.is_some(),
            self.options.rendering_control_location.is_some(),
        )
    }

    /// Built-in sources first, then discovered apps by name.
    pub fn source_list(&self) -> Vec<String> {
        let mut sources = builtin_sources();
        if let Some(apps) = self.gate.apps() {
            let mut names: Vec<String> = apps.keys().cloned().collect();
            names.sort();
            sources.extend(names);
        }
        sources
    }

    /// One poll: reconcile power, and while on, wait for app discovery and
    /// telemetry startup side by side before refreshing volume and mute.
    pub async fn tick(&mut self) {
        let guards = ReconcileGuards {
            auth_failed: self.auth_failed(),
            shutting_down: self.shutting_down,
        };
        self.state =
            power::reconcile(self.state, guards, &mut self.debounce, self.bridge.as_ref()).await;
        if guards.auth_failed || guards.shutting_down {
            self.publish();
            return;
        }

        if self.state == PowerState::On {
            let location = self
                .options
                .rendering_control_location
                .as_deref()
                .filter(|_| self.telemetry.is_none());
            let upnp = self.upnp.as_ref();
            let notifier = self.telemetry_notifier();
            let discover = self.gate.ensure_discovered(self.bridge.as_ref());
            let start = async move {
                match location {
                    Some(location) => Some(TelemetrySession::start(upnp, location, notifier).await),
                    None => None,
                }
            };
            let ((), started) = tokio::join!(discover, start);

            match started {
                Some(Ok(Some(session))) => self.telemetry = Some(session),
                Some(Ok(None)) | None => {}
                Some(Err(err)) => {
                    tracing::debug!(error = %err, "telemetry unavailable this tick");
                }
            }
            self.refresh_telemetry();
        }
        self.publish();
    }

    fn telemetry_notifier(&self) -> EventHandler {
        let events = self.events.clone();
        Arc::new(move || {
            let _ = events.send(DeviceEvent::TelemetryChanged);
        })
    }

    /// Copies the latest pushed volume and mute values from a live session.
    pub fn refresh_telemetry(&mut self) {
        if let Some(session) = self.telemetry.as_ref().filter(|s| s.is_alive()) {
            let snapshot = session.snapshot();
            self.volume_level = snapshot.volume_level;
            self.is_volume_muted = snapshot.is_volume_muted;
        }
    }

    /// Recomputes the observable state and notifies subscribers if it
    /// changed.
    pub fn publish(&mut self) {
        let on = self.state == PowerState::On;
        let next = MediaState {
            name: self.options.name.clone(),
            state: self.state,
            lifecycle: self.lifecycle(),
            available: self.is_available(),
            volume_level: self.volume_level.filter(|_| on),
            is_volume_muted: self.is_volume_muted.filter(|_| on),
            source_list: self.source_list(),
            supported_features: self.supported_features(),
        };
        self.published.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    /// Marks the controller as stopping and tears telemetry down. Later
    /// calls and later ticks do nothing.
    pub async fn shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;
        if let Some(mut session) = self.telemetry.take() {
            session.stop().await;
        }
    }

    pub async fn execute(&mut self, command: ControlCommand) -> Result<(), CommandError> {
        match command {
            ControlCommand::TurnOn => self.turn_on().await,
            ControlCommand::TurnOff => self.turn_off().await,
            ControlCommand::SendKeys { keys } => self.send_keys(&keys).await,
            ControlCommand::LaunchApp { app_id } => self.launch_app(&app_id).await,
            ControlCommand::SetVolume { level } => self.set_volume(level).await,
            ControlCommand::VolumeUp => self.volume_up().await,
            ControlCommand::VolumeDown => self.volume_down().await,
            ControlCommand::MuteVolume => self.mute_volume().await,
            ControlCommand::MediaPlay => self.media_play().await,
            ControlCommand::MediaPause => self.media_pause().await,
            ControlCommand::MediaPlayPause => self.media_play_pause().await,
            ControlCommand::MediaNextTrack => self.media_next_track().await,
            ControlCommand::MediaPreviousTrack => self.media_previous_track().await,
            ControlCommand::PlayMedia { kind, media_id } => self.play_media(&kind, &media_id).await,
            ControlCommand::SelectSource { source } => self.select_source(&source).await,
        }
    }

    pub async fn turn_off(&mut self) -> Result<(), CommandError> {
        self.debounce.arm(Instant::now(), self.options.poll_interval);
        self.publish();
        self.bridge.power_off().await?;
        Ok(())
    }

    pub async fn turn_on(&mut self) -> Result<(), CommandError> {
        if let Some(argv) = &self.options.on_action {
            wake::run_on_action(argv).await?;
        } else if let Some(mac) = self.options.mac {
            wake::wake_on_lan(mac, &self.options.host).await?;
        } else {
            return Err(CommandError::Unsupported("turn_on"));
        }
        Ok(())
    }

    pub async fn send_keys(&self, keys: &[String]) -> Result<(), CommandError> {
        let Some(first) = keys.first() else {
            return Err(CommandError::InvalidInput("no keys given".to_string()));
        };
        if self.power_off_in_progress() && first != KEY_POWEROFF {
            tracing::info!(?keys, "TV is powering off, not sending keys");
            return Ok(());
        }
        self.bridge.send_keys(keys).await?;
        Ok(())
    }

    async fn send_key(&self, key: &str) -> Result<(), CommandError> {
        self.send_keys(&[key.to_string()]).await
    }

    pub async fn launch_app(&self, app_id: &str) -> Result<(), CommandError> {
        if self.power_off_in_progress() {
            tracing::info!(app_id, "TV is powering off, not launching app");
            return Ok(());
        }
        let launcher = self
            .bridge
            .app_launcher()
            .ok_or(CommandError::Unsupported("launch_app"))?;
        launcher.launch_app(app_id).await?;
        Ok(())
    }

    pub async fn set_volume(&self, level: f32) -> Result<(), CommandError> {
        if !(0.0..=1.0).contains(&level) {
            return Err(CommandError::InvalidInput(format!(
                "volume {level} outside 0.0..=1.0"
            )));
        }
        let Some(session) = self.telemetry.as_ref().filter(|s| s.is_alive()) else {
            tracing::info!(host = %self.options.host, "upnp services are not available");
            return Ok(());
        };
        match session.set_volume_level(level).await {
            Ok(()) => Ok(()),
            Err(err @ UpnpError::ActionResponse { .. }) => {
                tracing::warn!(host = %self.options.host, error = %err, "unable to set volume level");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn volume_up(&self) -> Result<(), CommandError> {
        self.send_key("KEY_VOLUP").await
    }

    pub async fn volume_down(&self) -> Result<(), CommandError> {
        self.send_key("KEY_VOLDOWN").await
    }

    /// The legacy remote only has a mute toggle.
    pub async fn mute_volume(&self) -> Result<(), CommandError> {
        self.send_key("KEY_MUTE").await
    }

    pub async fn media_play(&mut self) -> Result<(), CommandError> {
        self.playing = true;
        self.send_key("KEY_PLAY").await
    }

    pub async fn media_pause(&mut self) -> Result<(), CommandError> {
        self.playing = false;
        self.send_key("KEY_PAUSE").await
    }

    /// The TV never reports playback state, so this toggles on what was
    /// last sent.
    pub async fn media_play_pause(&mut self) -> Result<(), CommandError> {
        if self.playing {
            self.media_pause().await
        } else {
            self.media_play().await
        }
    }

    pub async fn media_next_track(&self) -> Result<(), CommandError> {
        self.send_key("KEY_CHUP").await
    }

    pub async fn media_previous_track(&self) -> Result<(), CommandError> {
        self.send_key("KEY_CHDOWN").await
    }

    /// `app` launches by id; `channel` types the number and confirms.
    pub async fn play_media(&self, kind: &str, media_id: &str) -> Result<(), CommandError> {
        match kind {
            "app" => self.launch_app(media_id).await,
            "channel" => {
                let keys = channel_keys(media_id).ok_or_else(|| {
                    tracing::error!(media_id, "media id must be a non-negative integer");
                    CommandError::InvalidInput(format!("channel {media_id:?}"))
                })?;
                self.send_keys(&keys).await
            }
            other => {
                tracing::error!(kind = other, "unsupported media type");
                Err(CommandError::InvalidInput(format!("media type {other:?}")))
            }
        }
    }

    pub async fn select_source(&self, source: &str) -> Result<(), CommandError> {
        if let Some(app_id) = self.gate.apps().and_then(|apps| apps.get(source).cloned()) {
            return self.launch_app(&app_id).await;
        }
        if let Some(key) = source_key(source) {
            return self.send_key(key).await;
        }
        tracing::error!(source, "unsupported source");
        Err(CommandError::InvalidInput(format!("source {source:?}")))
    }
}

fn channel_keys(media_id: &str) -> Option<Vec<String>> {
    let digits = media_id.trim();
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let mut keys: Vec<String> = digits.chars().map(|d| format!("KEY_{d}")).collect();
    keys.push("KEY_ENTER".to_string());
    Some(keys)
}
