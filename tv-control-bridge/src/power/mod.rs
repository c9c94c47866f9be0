use crate::bridge::Bridge;
use crate::model::{DeviceLifecycle, PowerState};
use std::time::Duration;
use tokio::time::Instant;

/// Extra time on top of one poll interval for the TV to finish shutting
/// down before its on/off answer can be trusted again.
pub const POWER_OFF_SLACK: Duration = Duration::from_secs(5);

/// Deadline after a power-off command during which the TV is reported off
/// and commands that could wake it are held back. Only ever compared
/// against the clock when asked; there is no timer behind it.
#[derive(Debug, Default, Clone, Copy)]
pub struct PowerOffDebounce {
    deadline: Option<Instant>,
}

impl PowerOffDebounce {
    pub fn arm(&mut self, now: Instant, poll_interval: Duration) {
        self.deadline = Some(now + poll_interval + POWER_OFF_SLACK);
    }

    pub fn in_progress(&self, now: Instant) -> bool {
        self.deadline.map_or(false, |deadline| deadline > now)
    }

    pub fn clear_if_expired(&mut self, now: Instant) {
        if !self.in_progress(now) {
            self.deadline = None;
        }
    }

    #[cfg(test)]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

/// Inputs that short-circuit reconciliation before the bridge is queried.
#[derive(Debug, Clone, Copy)]
pub struct ReconcileGuards {
    pub auth_failed: bool,
    pub shutting_down: bool,
}

/// Produces the authoritative power state for one tick. Never fails: a
/// bridge error reads as off.
pub async fn reconcile(
    previous: PowerState,
    guards: ReconcileGuards,
    debounce: &mut PowerOffDebounce,
    bridge: &dyn Bridge,
) -> PowerState {
    if guards.auth_failed || guards.shutting_down {
        return previous;
    }
    if debounce.in_progress(Instant::now()) {
        return PowerState::Off;
    }

    let state = match bridge.is_on().await {
        Ok(true) => PowerState::On,
        Ok(false) => PowerState::Off,
        Err(err) => {
            tracing::debug!(error = %err, "power state query failed");
            PowerState::Off
        }
    };
    debounce.clear_if_expired(Instant::now());
    state
}

pub fn lifecycle(state: PowerState, debounce: &PowerOffDebounce, now: Instant) -> DeviceLifecycle {
    if debounce.in_progress(now) {
        DeviceLifecycle::PoweringOff
    } else {
        match state {
            PowerState::On => DeviceLifecycle::On,
            PowerState::Off => DeviceLifecycle::Off,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::testing::FakeBridge;

    const INTERVAL: Duration = Duration::from_secs(10);

    fn guards() -> ReconcileGuards {
        ReconcileGuards {
            auth_failed: false,
            shutting_down: false,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn queries_bridge_without_debounce() {
        let bridge = FakeBridge::new();
        bridge.set_on(true);
        let mut debounce = PowerOffDebounce::default();

        let state = reconcile(PowerState::Off, guards(), &mut debounce, &bridge).await;
        assert_eq!(state, PowerState::On);
        assert_eq!(bridge.is_on_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reports_off_inside_window_without_querying() {
        let bridge = FakeBridge::new();
        bridge.set_on(true);
        let mut debounce = PowerOffDebounce::default();
        debounce.arm(Instant::now(), INTERVAL);

        for _ in 0..14 {
            tokio::time::advance(Duration::from_secs(1)).await;
            let state = reconcile(PowerState::On, guards(), &mut debounce, &bridge).await;
            assert_eq!(state, PowerState::Off);
        }
        assert_eq!(bridge.is_on_calls(), 0);

        tokio::time::advance(Duration::from_secs(1)).await;
        let state = reconcile(PowerState::Off, guards(), &mut debounce, &bridge).await;
        assert_eq!(state, PowerState::On);
        assert_eq!(bridge.is_on_calls(), 1);
        assert!(debounce.deadline().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn sticky_guards_keep_previous_state() {
        let bridge = FakeBridge::new();
        let mut debounce = PowerOffDebounce::default();
        let auth = ReconcileGuards {
            auth_failed: true,
            shutting_down: false,
        };
        assert_eq!(
            reconcile(PowerState::On, auth, &mut debounce, &bridge).await,
            PowerState::On
        );
        let stopping = ReconcileGuards {
            auth_failed: false,
            shutting_down: true,
        };
        assert_eq!(
            reconcile(PowerState::Off, stopping, &mut debounce, &bridge).await,
            PowerState::Off
        );
        assert_eq!(bridge.is_on_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn bridge_failure_reads_as_off() {
        let bridge = FakeBridge::new();
        bridge.fail_is_on();
        let mut debounce = PowerOffDebounce::default();
        assert_eq!(
            reconcile(PowerState::On, guards(), &mut debounce, &bridge).await,
            PowerState::Off
        );
    }

    #[tokio::test(start_paused = true)]
    async fn lifecycle_labels_powering_off() {
        let mut debounce = PowerOffDebounce::default();
        let now = Instant::now();
        assert_eq!(lifecycle(PowerState::On, &debounce, now), DeviceLifecycle::On);
        debounce.arm(now, INTERVAL);
        assert_eq!(
            lifecycle(PowerState::Off, &debounce, now),
            DeviceLifecycle::PoweringOff
        );
        assert_eq!(
            lifecycle(PowerState::Off, &debounce, now + INTERVAL + POWER_OFF_SLACK),
            DeviceLifecycle::Off
        );
    }
}
