//! Token renewal scheduler (C3).
//!
//! A single shared timer covers every audience currently being auto-renewed.
//! `Authenticate` obtains a token from the provider, hands it to C4's
//! `SetToken`, and on success records (or updates) a renewal entry; the
//! timer walks the table and re-enters `Authenticate` for whichever
//! audiences are due.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration as StdDuration;

use time::OffsetDateTime;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::CbsError;
use crate::protocol::CbsDispatcher;
use crate::provider::TokenProvider;

/// Shared batch-cancellation bound for one `Renew` pass (§4.3 step 2).
const RENEWAL_BATCH_TIMEOUT: StdDuration = StdDuration::from_secs(60);

/// Floor applied when an expiry is already due at arm time, to avoid an
/// immediate re-entry storm (§4.3 "Timer arming rules").
const MIN_REARM_DELAY: StdDuration = StdDuration::from_secs(1);

/// Mutable renewal configuration (§4.3 `TokenDuration`).
#[derive(Debug, Clone)]
pub struct RenewalConfig {
    /// Requested token validity passed to the provider. Default 20 minutes.
    pub token_duration: StdDuration,
}

impl Default for RenewalConfig {
    fn default() -> Self {
        RenewalConfig {
            token_duration: StdDuration::from_secs(20 * 60),
        }
    }
}

#[derive(Debug, Clone)]
struct RenewEntry {
    claims: Vec<String>,
    due_time: OffsetDateTime,
}

/// Callback invoked on renewal failure while the connection remains open
/// (§6.6 `OnError`).
pub type OnError = Arc<dyn Fn(&str, &[String], &CbsError) + Send + Sync>;

struct SchedulerState {
    entries: HashMap<String, RenewEntry>,
    /// Sentinel disabling `Authenticate`'s opportunistic re-arm while a
    /// `Renew` pass is in progress (§4.3 step 1, the `MIN_INSTANT` trick).
    suppress_rearm: bool,
    timer_expiry: Option<OffsetDateTime>,
    timer_handle: Option<JoinHandle<()>>,
}

/// Token renewal scheduler for one CBS-capable connection.
pub struct RenewalScheduler {
    config: Mutex<RenewalConfig>,
    provider: Arc<dyn TokenProvider>,
    dispatcher: Arc<dyn CbsDispatcher>,
    on_error: Mutex<Option<OnError>>,
    state: Arc<AsyncMutex<SchedulerState>>,
    closed: AtomicBool,
    /// Weak so the timer's spawned task never keeps the scheduler alive by
    /// itself — a strong self-reference here would be the cyclic-ownership
    /// trap §9 warns about (engine holds links, links' callbacks reference
    /// back into the engine). `close()` dropping the last external `Arc`
    /// must still let this scheduler deallocate.
    self_ref: Weak<RenewalScheduler>,
}

impl RenewalScheduler {
    pub fn new(provider: Arc<dyn TokenProvider>, dispatcher: Arc<dyn CbsDispatcher>) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| RenewalScheduler {
            config: Mutex::new(RenewalConfig::default()),
            provider,
            dispatcher,
            on_error: Mutex::new(None),
            state: Arc::new(AsyncMutex::new(SchedulerState {
                entries: HashMap::new(),
                suppress_rearm: false,
                timer_expiry: None,
                timer_handle: None,
            })),
            closed: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        })
    }

    pub fn set_token_duration(&self, duration: StdDuration) {
        self.config.lock().expect("state lock poisoned").token_duration = duration;
    }

    pub fn token_duration(&self) -> StdDuration {
        self.config.lock().expect("state lock poisoned").token_duration
    }

    pub fn set_on_error(&self, handler: OnError) {
        *self.on_error.lock().expect("state lock poisoned") = Some(handler);
    }

    fn report_error(&self, audience: &str, claims: &[String], err: &CbsError) {
        error!(audience, error = %err, "CBS token renewal failed");
        if let Some(handler) = self.on_error.lock().expect("state lock poisoned").as_ref() {
            handler(audience, claims, err);
        }
    }

    /// Obtains a token and pushes it, recording (or refreshing) an auto-renew
    /// entry on success. Fails with [`CbsError::Disposed`] if closed, or
    /// [`CbsError::InvalidOperation`] if the connection has not completed
    /// remote-open yet (no CBS variant selected, §4.3).
    pub async fn authenticate(
        &self,
        audience: &str,
        claims: Vec<String>,
        auto_renew: bool,
        cancellation: CancellationToken,
    ) -> Result<(), CbsError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CbsError::Disposed);
        }
        if !self.dispatcher.is_ready() {
            return Err(CbsError::invalid_operation(
                "CBS variant not yet selected: connection has not completed remote-open",
            ));
        }

        let duration = self.token_duration();
        let token = self
            .provider
            .get_token(audience, &claims, duration)
            .await
            .map_err(CbsError::provider)?;

        self.dispatcher
            .set_token(audience, &token, cancellation)
            .await?;

        if auto_renew {
            let expiry = token.expiry;
            let mut state = self.state.lock().await;
            state.entries.insert(
                audience.to_ascii_lowercase(),
                RenewEntry {
                    claims,
                    due_time: expiry,
                },
            );
            if !state.suppress_rearm {
                let should_rearm = state
                    .timer_expiry
                    .map(|current| expiry < current)
                    .unwrap_or(true);
                if should_rearm {
                    self.arm_locked(&mut state, expiry);
                }
            }
        }

        Ok(())
    }

    /// Removes an audience from the renew table; stops the timer if the
    /// table becomes empty.
    pub async fn remove(&self, audience: &str) {
        let mut state = self.state.lock().await;
        state.entries.remove(&audience.to_ascii_lowercase());
        if state.entries.is_empty() {
            self.stop_timer_locked(&mut state);
        }
    }

    /// Stops the timer. Entries are left in place; the scheduler is
    /// considered disposed.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let mut state = self.state.lock().await;
        self.stop_timer_locked(&mut state);
    }

    fn stop_timer_locked(&self, state: &mut SchedulerState) {
        if let Some(handle) = state.timer_handle.take() {
            handle.abort();
        }
        state.timer_expiry = None;
    }

    /// Re-arms the one-shot timer at `expiry`, clamping past-due expiries to
    /// [`MIN_REARM_DELAY`] (§4.3 "Timer arming rules").
    fn arm_locked(&self, state: &mut SchedulerState, expiry: OffsetDateTime) {
        if let Some(handle) = state.timer_handle.take() {
            handle.abort();
        }
        state.timer_expiry = Some(expiry);

        let now = OffsetDateTime::now_utc();
        let delay = if expiry <= now {
            MIN_REARM_DELAY
        } else {
            (expiry - now).unsigned_abs()
        };
        debug!(delay_ms = delay.as_millis() as u64, "re-arming renewal timer");

        let self_ref = self.self_ref.clone();
        state.timer_handle = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(scheduler) = self_ref.upgrade() {
                scheduler.renew().await;
            }
        }));
    }

    /// The `Renew` timer body (§4.3 steps 1-4).
    async fn renew(&self) {
        let due: Vec<(String, RenewEntry)> = {
            let mut state = self.state.lock().await;
            state.suppress_rearm = true;
            let now = OffsetDateTime::now_utc();
            state
                .entries
                .iter()
                .filter(|(_, entry)| entry.due_time <= now)
                .map(|(audience, entry)| (audience.clone(), entry.clone()))
                .collect()
        };

        let batch_cancel = CancellationToken::new();
        let batch_guard = {
            let batch_cancel = batch_cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(RENEWAL_BATCH_TIMEOUT).await;
                batch_cancel.cancel();
            })
        };

        // Track which audiences have already been reported this pass so a
        // synchronous failure and a fault observed later in the batch never
        // double-report the same audience.
        let reported = Arc::new(Mutex::new(std::collections::HashSet::new()));

        let mut tasks = Vec::with_capacity(due.len());
        for (audience, entry) in due {
            let this_reported = reported.clone();
            let this_cancel = batch_cancel.clone();
            let audience_for_task = audience.clone();
            let claims = entry.claims.clone();
            // Safe to expect: this method is executing on `&self`, so at
            // least one strong reference is alive right now.
            let scheduler = self.self_ref.upgrade().expect("scheduler alive during renew");
            tasks.push(tokio::spawn(async move {
                info!(audience = %audience_for_task, "attempting CBS token renewal");
                let result = scheduler
                    .authenticate(&audience_for_task, claims.clone(), true, this_cancel)
                    .await;
                if let Err(err) = &result {
                    let mut reported = this_reported.lock().expect("state lock poisoned");
                    if reported.insert(audience_for_task.clone()) {
                        drop(reported);
                        scheduler.report_error(&audience_for_task, &claims, err);
                        scheduler.remove(&audience_for_task).await;
                    }
                }
                (audience_for_task, result)
            }));
        }

        for task in tasks {
            // A panicking renewal task is treated the same as a faulted one:
            // report once (if not already reported) and drop the entry.
            match task.await {
                Ok((audience, Ok(()))) => {
                    debug!(audience = %audience, "CBS token renewed");
                }
                Ok((_, Err(_))) => {
                    // Already reported and removed above.
                }
                Err(join_err) => {
                    error!(error = %join_err, "renewal task panicked");
                }
            }
        }
        batch_guard.abort();

        if self.dispatcher.is_connection_closed() {
            // Teardown in progress: neither re-arm nor emit further errors,
            // per §4.3's "Concurrency with the underlying connection".
            return;
        }

        let mut state = self.state.lock().await;
        state.suppress_rearm = false;
        let next_due = state
            .entries
            .values()
            .map(|entry| entry.due_time)
            .min();
        match next_due {
            Some(expiry) => self.arm_locked(&mut state, expiry),
            None => self.stop_timer_locked(&mut state),
        }
    }
}
