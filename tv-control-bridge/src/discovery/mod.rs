use crate::bridge::{AppList, Bridge};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;

/// Some TVs never answer the app-list request.
pub const DEFAULT_APP_LIST_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Default)]
pub enum GateState {
    #[default]
    Unresolved,
    ResolvedWithData(Arc<AppList>),
    /// The deadline passed without an answer.
    ResolvedEmpty,
}

impl GateState {
    pub fn is_resolved(&self) -> bool {
        !matches!(self, Self::Unresolved)
    }

    pub fn apps(&self) -> Option<Arc<AppList>> {
        match self {
            Self::ResolvedWithData(apps) => Some(apps.clone()),
            _ => None,
        }
    }
}

/// One-shot wait for the asynchronously delivered application list. Once
/// resolved, by data or by deadline, it never waits again; a list that
/// arrives later still replaces the stored one.
pub struct AppDiscoveryGate {
    state: watch::Sender<GateState>,
    deadline: Duration,
}

impl AppDiscoveryGate {
    pub fn new(deadline: Duration) -> Self {
        let (state, _) = watch::channel(GateState::Unresolved);
        Self { state, deadline }
    }

    pub fn is_resolved(&self) -> bool {
        self.state.borrow().is_resolved()
    }

    pub fn apps(&self) -> Option<Arc<AppList>> {
        self.state.borrow().apps()
    }

    #[cfg(test)]
    pub fn state(&self) -> GateState {
        self.state.borrow().clone()
    }

    /// Entry point for the bridge's app-list callback. The whole map is
    /// swapped at once so readers never see a partial list.
    pub fn deliver(&self, apps: AppList) {
        tracing::debug!(count = apps.len(), "application list received");
        self.state
            .send_replace(GateState::ResolvedWithData(Arc::new(apps)));
    }

    pub async fn ensure_discovered(&self, bridge: &dyn Bridge) {
        if self.is_resolved() {
            return;
        }
        let mut rx = self.state.subscribe();

        if let Err(err) = bridge.request_app_list().await {
            tracing::debug!(error = %err, "app list request failed");
        }
        if self.is_resolved() {
            return;
        }

        let timed_out = timeout(self.deadline, rx.wait_for(GateState::is_resolved))
            .await
            .is_err();
        if timed_out {
            self.state.send_if_modified(|state| {
                if state.is_resolved() {
                    return false;
                }
                *state = GateState::ResolvedEmpty;
                true
            });
            tracing::debug!(
                timeout_ms = self.deadline.as_millis() as u64,
                "no application list received, not asking again"
            );
        }
    }
}
