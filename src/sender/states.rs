use tracing::{debug, warn};

use crate::config::DEFAULT_MULTIPLICITY;
use crate::protocol::client::{ApiClient, HttpClientProvider};
use crate::protocol::response::StatusResponse;
use crate::protocol::response::TimeSyncResponse;

use super::context::BeaconSendingContext;

/// Re-sync against the cluster clock after this long.
pub const TIME_SYNC_INTERVAL_MS: i64 = 60_000;

/// Number of clock samples one sync round needs.
pub const REQUIRED_TIME_SYNC_REQUESTS: usize = 5;

/// Per-sample retry budget for transient time-sync failures.
const TIME_SYNC_RETRY_COUNT: u32 = 5;

/// Starting backoff for transient failures, doubled per retry.
const INITIAL_RETRY_SLEEP_MS: i64 = 1000;

/// Status-request retries within one initialization round.
const MAX_INITIAL_STATUS_RETRIES: u32 = 5;

/// Delays between initialization rounds once the retry budget is spent.
const REINIT_DELAYS_MS: [i64; 5] = [
    60_000,
    5 * 60_000,
    15 * 60_000,
    60 * 60_000,
    2 * 60 * 60_000,
];

/// While capture is off, ask the server again after this long.
pub const STATUS_CHECK_INTERVAL_MS: i64 = 2 * 60 * 60 * 1000;

/// The sending worker's states. The set is closed; transitions are driven
/// by [`SendingState::execute`] via the context's next-state slot, and every
/// state designates the state a shutdown request diverts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendingState {
    /// Acquire the first server status.
    Initial,
    /// Sample the cluster clock; `initial` marks the round that releases the
    /// init latch.
    TimeSync { initial: bool },
    /// Capture is enabled: configure, transmit, watch the server directives.
    CaptureOn,
    /// Capture is disabled: idle until the next status check (or the given
    /// one-shot cooldown) and poll.
    CaptureOff { sleep_time_ms: Option<i64> },
    /// Drain all remaining session data on the way out.
    Flush,
    /// Final state; the worker exits once it is reached.
    Terminal,
}

impl SendingState {
    pub fn name(&self) -> &'static str {
        match self {
            SendingState::Initial => "Initial",
            SendingState::TimeSync { .. } => "TimeSync",
            SendingState::CaptureOn => "CaptureOn",
            SendingState::CaptureOff { .. } => "CaptureOff",
            SendingState::Flush => "Flush",
            SendingState::Terminal => "Terminal",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SendingState::Terminal)
    }

    /// State to divert to when shutdown is requested while this state runs.
    pub fn shutdown_state(&self) -> SendingState {
        match self {
            SendingState::Initial => SendingState::Terminal,
            SendingState::TimeSync { initial: true } => SendingState::Terminal,
            SendingState::TimeSync { initial: false } => SendingState::Flush,
            SendingState::CaptureOn => SendingState::Flush,
            SendingState::CaptureOff { .. } => SendingState::Flush,
            SendingState::Flush => SendingState::Terminal,
            SendingState::Terminal => SendingState::Terminal,
        }
    }

    pub async fn execute<P: HttpClientProvider>(&self, ctx: &mut BeaconSendingContext<P>) {
        match self {
            SendingState::Initial => execute_initial(ctx).await,
            SendingState::TimeSync { initial } => execute_time_sync(ctx, *initial).await,
            SendingState::CaptureOn => execute_capture_on(ctx).await,
            SendingState::CaptureOff { sleep_time_ms } => {
                execute_capture_off(ctx, *sleep_time_ms).await
            }
            SendingState::Flush => execute_flush(ctx).await,
            SendingState::Terminal => execute_terminal(ctx),
        }
    }
}

// --- Initial ---

async fn execute_initial<P: HttpClientProvider>(ctx: &mut BeaconSendingContext<P>) {
    let mut reinit_round = 0usize;

    loop {
        if ctx.is_shutdown_requested() {
            ctx.set_init_completed(false);
            return;
        }

        let client = ctx.http_client();
        let response = status_request_with_backoff(ctx, &client).await;

        match response {
            Some(resp) if resp.is_ok() => {
                ctx.handle_status_response(&resp);

                let now = ctx.now_ms();
                ctx.set_last_open_session_send_time(now);
                ctx.set_last_status_check_time(now);

                ctx.set_next_state(SendingState::TimeSync { initial: true });
                return;
            }
            Some(resp) if resp.is_too_many_requests() => {
                ctx.set_next_state(SendingState::CaptureOff {
                    sleep_time_ms: resp.retry_after_ms,
                });
                return;
            }
            _ => {
                if ctx.is_shutdown_requested() {
                    ctx.set_init_completed(false);
                    return;
                }

                let delay = REINIT_DELAYS_MS[reinit_round.min(REINIT_DELAYS_MS.len() - 1)];
                warn!(delay_ms = delay, "initial status request failed, backing off");
                ctx.sleep_ms(delay).await;
                reinit_round += 1;
            }
        }
    }
}

/// One round of status requests with doubling backoff; gives up after
/// [`MAX_INITIAL_STATUS_RETRIES`] transient failures or on a definitive
/// response (success or rate limit).
async fn status_request_with_backoff<P: HttpClientProvider>(
    ctx: &BeaconSendingContext<P>,
    client: &P::Client,
) -> Option<StatusResponse> {
    let mut retry = 0;
    let mut sleep_ms = INITIAL_RETRY_SLEEP_MS;

    loop {
        if ctx.is_shutdown_requested() {
            return None;
        }

        let response = client.send_status_request().await;
        match &response {
            Some(resp) if resp.is_ok() || resp.is_too_many_requests() => return response,
            _ => {}
        }

        if retry >= MAX_INITIAL_STATUS_RETRIES {
            return response;
        }

        ctx.sleep_ms(sleep_ms).await;
        sleep_ms *= 2;
        retry += 1;
    }
}

// --- Time sync ---

fn is_time_sync_required<P: HttpClientProvider>(ctx: &BeaconSendingContext<P>) -> bool {
    if !ctx.is_time_sync_supported() {
        return false;
    }

    ctx.last_time_sync_time() < 0
        || ctx.now_ms() - ctx.last_time_sync_time() > TIME_SYNC_INTERVAL_MS
}

/// Pick the follow-up state from the current capture flag.
fn set_next_state_by_capture<P: HttpClientProvider>(ctx: &mut BeaconSendingContext<P>) {
    if ctx.is_capture_on() {
        ctx.set_next_state(SendingState::CaptureOn);
    } else {
        ctx.set_next_state(SendingState::CaptureOff {
            sleep_time_ms: None,
        });
    }
}

struct TimeSyncSamples {
    offsets: Vec<i64>,
    rate_limited: Option<TimeSyncResponse>,
}

async fn execute_time_sync<P: HttpClientProvider>(
    ctx: &mut BeaconSendingContext<P>,
    initial: bool,
) {
    if !is_time_sync_required(ctx) {
        if initial {
            ctx.initialize_time_sync(0, ctx.is_time_sync_supported());
        }
        set_next_state_by_capture(ctx);
        release_latch_if_initial(ctx, initial);
        return;
    }

    let samples = collect_time_sync_samples(ctx).await;
    handle_time_sync_samples(ctx, samples, initial);

    release_latch_if_initial(ctx, initial);
}

fn release_latch_if_initial<P: HttpClientProvider>(ctx: &BeaconSendingContext<P>, initial: bool) {
    if initial {
        ctx.set_init_completed(true);
    }
}

async fn collect_time_sync_samples<P: HttpClientProvider>(
    ctx: &mut BeaconSendingContext<P>,
) -> TimeSyncSamples {
    let client = ctx.http_client();

    let mut samples = TimeSyncSamples {
        offsets: Vec::with_capacity(REQUIRED_TIME_SYNC_REQUESTS),
        rate_limited: None,
    };

    let mut retry = 0;
    let mut sleep_ms = INITIAL_RETRY_SLEEP_MS;

    while samples.offsets.len() < REQUIRED_TIME_SYNC_REQUESTS && !ctx.is_shutdown_requested() {
        let request_send_time = ctx.now_ms();
        let response = client.send_time_sync_request().await;
        let response_receive_time = ctx.now_ms();

        match response {
            Some(resp) if resp.is_ok() => {
                if resp.is_valid() {
                    let offset = ((resp.request_receive_time - request_send_time)
                        + (resp.response_send_time - response_receive_time))
                        / 2;
                    samples.offsets.push(offset);

                    retry = 0;
                    sleep_ms = INITIAL_RETRY_SLEEP_MS;
                } else {
                    // Non-positive server timestamps: the cluster does not
                    // support time sync.
                    ctx.disable_time_sync_support();
                    break;
                }
            }
            other => {
                if retry >= TIME_SYNC_RETRY_COUNT {
                    break;
                }

                if let Some(resp) = other {
                    if resp.is_too_many_requests() {
                        samples.offsets.clear();
                        samples.rate_limited = Some(resp);
                        break;
                    }
                }

                ctx.sleep_ms(sleep_ms).await;
                sleep_ms *= 2;
                retry += 1;
            }
        }
    }

    samples
}

fn handle_time_sync_samples<P: HttpClientProvider>(
    ctx: &mut BeaconSendingContext<P>,
    samples: TimeSyncSamples,
    initial: bool,
) {
    if samples.offsets.len() < REQUIRED_TIME_SYNC_REQUESTS {
        // Sync did not complete, either due to networking trouble or a
        // cluster without sync support.
        if initial {
            ctx.initialize_time_sync(0, ctx.is_time_sync_supported());
        }

        if let Some(resp) = samples.rate_limited {
            ctx.set_next_state(SendingState::CaptureOff {
                sleep_time_ms: resp.retry_after_ms,
            });
        } else {
            set_next_state_by_capture(ctx);
        }
        return;
    }

    let offset = compute_cluster_offset(samples.offsets);
    ctx.initialize_time_sync(offset, true);
    ctx.set_last_time_sync_time(ctx.now_ms());

    set_next_state_by_capture(ctx);
}

/// Aggregate the collected offsets: median, variance from the median, then
/// the rounded mean of every offset within one standard deviation.
fn compute_cluster_offset(mut offsets: Vec<i64>) -> i64 {
    offsets.sort_unstable();

    let median = offsets[offsets.len() / 2];

    let variance = offsets
        .iter()
        .map(|offset| {
            let diff = offset - median;
            diff * diff
        })
        .sum::<i64>()
        / offsets.len() as i64;

    let mut sum = 0i64;
    let mut count = 0i64;
    for offset in &offsets {
        let diff = offset - median;
        if diff * diff <= variance {
            sum += offset;
            count += 1;
        }
    }

    if count == 0 {
        return 0;
    }

    (sum as f64 / count as f64).round() as i64
}

// --- Capture on ---

async fn execute_capture_on<P: HttpClientProvider>(ctx: &mut BeaconSendingContext<P>) {
    ctx.sleep_default().await;
    if ctx.is_shutdown_requested() {
        return;
    }

    if is_time_sync_required(ctx) {
        ctx.set_next_state(SendingState::TimeSync {
            initial: !ctx.is_init_latch_released(),
        });
        return;
    }

    let client = ctx.http_client();

    configure_new_sessions(ctx, &client).await;

    let finished_response = send_finished_sessions(ctx, &client).await;
    if let Some(resp) = &finished_response {
        if resp.is_too_many_requests() {
            ctx.set_next_state(SendingState::CaptureOff {
                sleep_time_ms: resp.retry_after_ms,
            });
            return;
        }
    }

    let open_response = send_open_sessions(ctx, &client).await;
    if let Some(resp) = &open_response {
        if resp.is_too_many_requests() {
            ctx.set_next_state(SendingState::CaptureOff {
                sleep_time_ms: resp.retry_after_ms,
            });
            return;
        }
    }

    let last_response = open_response.or(finished_response).filter(StatusResponse::is_ok);
    if let Some(resp) = last_response {
        ctx.handle_status_response(&resp);
        if !ctx.is_capture_on() {
            ctx.set_next_state(SendingState::CaptureOff {
                sleep_time_ms: None,
            });
        }
    }
}

/// Ask the server for the per-session multiplicity of every new session;
/// a session whose request budget runs out is muted.
async fn configure_new_sessions<P: HttpClientProvider>(
    ctx: &BeaconSendingContext<P>,
    client: &P::Client,
) {
    for wrapper in ctx.registry().all_new_sessions() {
        if !wrapper.can_send_new_session_request() {
            debug!(
                session = wrapper.session_id(),
                "configuration request budget exhausted, muting session",
            );
            wrapper.update_configuration(0);
            continue;
        }

        match client.send_status_request().await {
            Some(resp) if resp.is_ok() => wrapper.update_configuration(resp.multiplicity),
            _ => wrapper.decrease_new_session_requests(),
        }
    }
}

/// Transmit finished sessions; a transmitted session leaves the registry.
/// Stops for this tick on the first failure.
async fn send_finished_sessions<P: HttpClientProvider>(
    ctx: &BeaconSendingContext<P>,
    client: &P::Client,
) -> Option<StatusResponse> {
    let mut last_response = None;

    for wrapper in ctx.registry().all_finished_and_configured_sessions() {
        let session = wrapper.session().clone();

        if session.is_empty() {
            ctx.registry().remove(&wrapper);
            session.clear_captured_data();
            continue;
        }

        match session.send_beacon(client).await {
            Some(resp) if resp.is_ok() => {
                ctx.registry().remove(&wrapper);
                session.clear_captured_data();
                last_response = Some(resp);
            }
            response => return response.or(last_response),
        }
    }

    last_response
}

/// Transmit snapshots of open sessions once the send interval elapsed.
async fn send_open_sessions<P: HttpClientProvider>(
    ctx: &mut BeaconSendingContext<P>,
    client: &P::Client,
) -> Option<StatusResponse> {
    let now = ctx.now_ms();
    if now <= ctx.last_open_session_send_time() + ctx.settings().send_interval_ms() {
        return None;
    }
    ctx.set_last_open_session_send_time(now);

    let mut last_response = None;

    for wrapper in ctx.registry().all_open_and_configured_sessions() {
        let session = wrapper.session().clone();

        match session.send_beacon(client).await {
            Some(resp) if resp.is_ok() => last_response = Some(resp),
            response => return response.or(last_response),
        }
    }

    last_response
}

// --- Capture off ---

async fn execute_capture_off<P: HttpClientProvider>(
    ctx: &mut BeaconSendingContext<P>,
    sleep_time_ms: Option<i64>,
) {
    let now = ctx.now_ms();
    let delta = sleep_time_ms
        .unwrap_or_else(|| STATUS_CHECK_INTERVAL_MS - (now - ctx.last_status_check_time()));

    if delta > 0 && !ctx.is_shutdown_requested() {
        ctx.sleep_ms(delta).await;
    }
    if ctx.is_shutdown_requested() {
        return;
    }

    let client = ctx.http_client();
    let response = client.send_status_request().await;
    ctx.set_last_status_check_time(ctx.now_ms());

    match response {
        Some(resp) if resp.is_too_many_requests() => {
            ctx.set_next_state(SendingState::CaptureOff {
                sleep_time_ms: resp.retry_after_ms,
            });
        }
        Some(resp) if resp.is_ok() => {
            ctx.handle_status_response(&resp);

            if ctx.is_capture_on() {
                if is_time_sync_required(ctx) {
                    ctx.set_next_state(SendingState::TimeSync {
                        initial: !ctx.is_init_latch_released(),
                    });
                } else {
                    ctx.set_next_state(SendingState::CaptureOn);
                }
            } else {
                ctx.set_next_state(SendingState::CaptureOff {
                    sleep_time_ms: None,
                });
            }
        }
        _ => {
            // Transient failure: wait a full interval and try again.
            ctx.set_next_state(SendingState::CaptureOff {
                sleep_time_ms: None,
            });
        }
    }
}

// --- Flush ---

async fn execute_flush<P: HttpClientProvider>(ctx: &mut BeaconSendingContext<P>) {
    debug!("flushing remaining sessions");

    let client = ctx.http_client();

    for wrapper in ctx.registry().all_new_sessions() {
        wrapper.update_configuration(DEFAULT_MULTIPLICITY);
    }

    for wrapper in ctx.registry().all_open_and_configured_sessions() {
        wrapper.session().end();
    }

    for wrapper in ctx.registry().all_finished_and_configured_sessions() {
        let session = wrapper.session().clone();

        if !session.is_empty() {
            match session.send_beacon(&client).await {
                Some(resp) if resp.is_ok() => {}
                _ => break,
            }
        }

        ctx.registry().remove(&wrapper);
        session.clear_captured_data();
    }

    ctx.set_next_state(SendingState::Terminal);
}

// --- Terminal ---

fn execute_terminal<P: HttpClientProvider>(ctx: &BeaconSendingContext<P>) {
    // If initialization never completed, release every waiter with failure.
    ctx.set_init_completed(false);
    ctx.request_shutdown();
}
