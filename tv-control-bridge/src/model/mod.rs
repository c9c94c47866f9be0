use bitflags::bitflags;
use serde::Serialize;

/// Built-in sources and the key that selects each one.
pub const SOURCES: [(&str, &str); 2] = [("TV", "KEY_TV"), ("HDMI", "KEY_HDMI")];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    On,
    #[default]
    Off,
}

/// Lifecycle label derived from the power state and the debounce window.
/// `PoweringOff` is never stored; it only exists while a power-off deadline
/// is still in the future.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceLifecycle {
    Off,
    On,
    PoweringOff,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
    pub struct SupportedFeatures: u32 {
        const PAUSE = 1 << 0;
        const VOLUME_SET = 1 << 2;
        const VOLUME_MUTE = 1 << 3;
        const PREVIOUS_TRACK = 1 << 4;
        const NEXT_TRACK = 1 << 5;
        const TURN_ON = 1 << 7;
        const TURN_OFF = 1 << 8;
        const PLAY_MEDIA = 1 << 9;
        const VOLUME_STEP = 1 << 10;
        const SELECT_SOURCE = 1 << 11;
        const PLAY = 1 << 14;
    }
}

impl SupportedFeatures {
    pub fn base() -> Self {
        Self::PAUSE
            | Self::VOLUME_STEP
            | Self::VOLUME_MUTE
            | Self::PREVIOUS_TRACK
            | Self::SELECT_SOURCE
            | Self::NEXT_TRACK
            | Self::TURN_OFF
            | Self::PLAY
            | Self::PLAY_MEDIA
    }

    pub fn for_device(can_turn_on: bool, has_rendering_control: bool) -> Self {
        let mut features = Self::base();
        if can_turn_on {
            features |= Self::TURN_ON;
        }
        if has_rendering_control {
            features |= Self::VOLUME_SET;
        }
        features
    }
}

/// Observable state published by the controller after every tick and on
/// every telemetry event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MediaState {
    pub name: String,
    pub state: PowerState,
    pub lifecycle: DeviceLifecycle,
    pub available: bool,
    pub volume_level: Option<f32>,
    pub is_volume_muted: Option<bool>,
    pub source_list: Vec<String>,
    pub supported_features: SupportedFeatures,
}

impl Default for MediaState {
    fn default() -> Self {
        Self {
            name: String::new(),
            state: PowerState::Off,
            lifecycle: DeviceLifecycle::Off,
            available: false,
            volume_level: None,
            is_volume_muted: None,
            source_list: builtin_sources(),
            supported_features: SupportedFeatures::base(),
        }
    }
}

pub fn builtin_sources() -> Vec<String> {
    SOURCES.iter().map(|(name, _)| name.to_string()).collect()
}

pub fn source_key(source: &str) -> Option<&'static str> {
    SOURCES
        .iter()
        .find(|(name, _)| *name == source)
        .map(|(_, key)| *key)
}
