use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::RuntimeSettings;
use crate::protocol::client::HttpClientProvider;
use crate::protocol::response::StatusResponse;
use crate::providers::TimingProvider;

use super::registry::SessionRegistry;
use super::states::SendingState;

/// Default pause between two state-machine ticks.
pub const DEFAULT_SLEEP_MS: i64 = 1000;

/// Mutable state shared by the sending states.
///
/// Owned exclusively by the sending worker task; the host-facing pieces
/// (shutdown request, init latch, session registry, runtime settings) are
/// shared through sync primitives.
pub struct BeaconSendingContext<P: HttpClientProvider> {
    provider: P,
    timing: Arc<dyn TimingProvider>,
    settings: Arc<RuntimeSettings>,
    registry: Arc<SessionRegistry>,

    current_state: SendingState,
    next_state: Option<SendingState>,

    shutdown: Arc<AtomicBool>,
    cancel: CancellationToken,
    init_latch: watch::Sender<Option<bool>>,

    time_sync_supported: bool,
    last_time_sync_time: i64,
    last_status_check_time: i64,
    last_open_session_send_time: i64,
}

impl<P: HttpClientProvider> BeaconSendingContext<P> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        provider: P,
        timing: Arc<dyn TimingProvider>,
        settings: Arc<RuntimeSettings>,
        registry: Arc<SessionRegistry>,
        time_sync_supported: bool,
        shutdown: Arc<AtomicBool>,
        cancel: CancellationToken,
        init_latch: watch::Sender<Option<bool>>,
    ) -> Self {
        Self {
            provider,
            timing,
            settings,
            registry,
            current_state: SendingState::Initial,
            next_state: None,
            shutdown,
            cancel,
            init_latch,
            time_sync_supported,
            last_time_sync_time: -1,
            last_status_check_time: 0,
            last_open_session_send_time: 0,
        }
    }

    /// Run one tick: execute the current state, then apply the transition it
    /// requested. A pending shutdown request overrides the transition with
    /// the state's designated shutdown state.
    pub async fn execute_current_state(&mut self) {
        self.next_state = None;

        let state = self.current_state.clone();
        state.execute(self).await;

        if self.is_shutdown_requested() {
            self.next_state = Some(state.shutdown_state());
        }

        if let Some(next) = self.next_state.take() {
            if next != self.current_state {
                info!(
                    from = self.current_state.name(),
                    to = next.name(),
                    "state change",
                );
                self.current_state = next;
            }
        }
    }

    pub fn current_state(&self) -> &SendingState {
        &self.current_state
    }

    /// Test hook: place the machine directly into a state.
    #[cfg(test)]
    pub(crate) fn force_state(&mut self, state: SendingState) {
        self.current_state = state;
    }

    pub fn set_next_state(&mut self, state: SendingState) {
        self.next_state = Some(state);
    }

    pub fn is_in_terminal_state(&self) -> bool {
        self.current_state.is_terminal()
    }

    // --- Shutdown ---

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    // --- Init latch ---

    /// Release the init latch exactly once.
    pub fn set_init_completed(&self, success: bool) {
        self.init_latch.send_if_modified(|value| {
            if value.is_none() {
                *value = Some(success);
                true
            } else {
                false
            }
        });
    }

    /// Whether the latch has been released (successfully or not).
    pub fn is_init_latch_released(&self) -> bool {
        self.init_latch.borrow().is_some()
    }

    pub fn is_initialized(&self) -> bool {
        *self.init_latch.borrow() == Some(true)
    }

    // --- Timing ---

    pub fn now_ms(&self) -> i64 {
        self.timing.now_ms()
    }

    /// Cancellable sleep; returns early when shutdown is requested.
    pub async fn sleep_ms(&self, ms: i64) {
        let duration = Duration::from_millis(ms.max(0) as u64);
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(duration) => {}
        }
    }

    pub async fn sleep_default(&self) {
        self.sleep_ms(DEFAULT_SLEEP_MS).await;
    }

    pub fn initialize_time_sync(&self, cluster_offset_ms: i64, sync_supported: bool) {
        self.timing.initialize(cluster_offset_ms, sync_supported);
    }

    pub fn is_time_sync_supported(&self) -> bool {
        self.time_sync_supported
    }

    pub fn disable_time_sync_support(&mut self) {
        self.time_sync_supported = false;
    }

    pub fn last_time_sync_time(&self) -> i64 {
        self.last_time_sync_time
    }

    pub fn set_last_time_sync_time(&mut self, timestamp: i64) {
        self.last_time_sync_time = timestamp;
    }

    pub fn last_status_check_time(&self) -> i64 {
        self.last_status_check_time
    }

    pub fn set_last_status_check_time(&mut self, timestamp: i64) {
        self.last_status_check_time = timestamp;
    }

    pub fn last_open_session_send_time(&self) -> i64 {
        self.last_open_session_send_time
    }

    pub fn set_last_open_session_send_time(&mut self, timestamp: i64) {
        self.last_open_session_send_time = timestamp;
    }

    // --- Collaborators ---

    /// Build a client bound to the currently configured server id.
    pub fn http_client(&self) -> P::Client {
        self.provider.create_client(self.settings.server_id())
    }

    pub fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn is_capture_on(&self) -> bool {
        self.settings.is_capture()
    }

    /// Merge a status response; a capture-off directive wipes all pending
    /// session data.
    pub fn handle_status_response(&self, response: &StatusResponse) {
        self.settings.merge_status_response(response);

        if !self.is_capture_on() {
            self.clear_all_session_data();
        }
    }

    /// Clear every queued session's cached data and empty the registry.
    pub fn clear_all_session_data(&self) {
        for wrapper in self.registry.take_all() {
            wrapper.session().clear_captured_data();
        }
    }
}
