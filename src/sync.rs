//! Background publication of queued posts.
//!
//! [`drain_queue`] is one pass over the queue, oldest first, stopping at the
//! first retryable failure. Passes are exclusive across processes through the
//! [`lease::DRAIN`] lease. [`SyncDriver`] owns the long-running state machine
//! (`Idle -> Draining -> Idle | WaitingForRetry`) that decides when a pass runs:
//! on request, when connectivity returns, or when the backoff timer fires.

use crate::client::{LogTrace, PostSubmitter, TraceSink};
use crate::config::SyncPolicy;
use crate::credentials::CredentialStore;
use crate::db;
use crate::lease::{self, Lease};
use crate::credentials::Credential;
use crate::model::{RetrySchedule, SubmissionOutcome};
use crate::queue::QueueStore;
use anyhow::Result;
use chrono::Utc;
use reqwest::Url;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, instrument, warn};

/// Exponential retry delay: `initial * 2^(attempt - 1)`, capped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    initial: Duration,
    cap: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, cap: Duration) -> Self {
        Self {
            initial,
            cap: cap.max(initial),
        }
    }

    pub fn from_policy(policy: &SyncPolicy) -> Self {
        Self::new(policy.initial_backoff(), policy.max_backoff())
    }

    /// Delay after the `attempt`-th consecutive failure (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        self.initial.saturating_mul(1_u32 << shift).min(self.cap)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(60), Duration::from_secs(3600))
    }
}

/// Result of one drain pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Queue emptied.
    Drained { published: usize, parked: usize },
    /// Stopped at `post_id`, which is still queued along with everything behind it.
    Halted {
        published: usize,
        parked: usize,
        post_id: i64,
        reason: String,
    },
    /// No stored credential; nothing was attempted.
    MissingCredential,
    /// Another drain holds the lease; nothing was attempted.
    Busy,
    /// The pass itself failed (storage error) before reaching a verdict.
    Failed { reason: String },
}

impl DrainOutcome {
    pub fn is_complete(&self) -> bool {
        matches!(self, DrainOutcome::Drained { .. })
    }
}

/// Publish queued posts oldest-first until the queue is empty or a send fails.
///
/// The head of the queue is re-read on every iteration, so posts appended
/// concurrently are picked up by the same pass.
#[instrument(skip_all)]
pub async fn drain_queue(
    store: &QueueStore,
    credentials: &CredentialStore,
    submitter: &dyn PostSubmitter,
    trace: &dyn TraceSink,
) -> Result<DrainOutcome> {
    let Some(credential) = credentials.load().await? else {
        warn!("no credential configured; drain skipped");
        return Ok(DrainOutcome::MissingCredential);
    };
    let Some(lease) = Lease::acquire(store.pool(), lease::DRAIN, lease::DRAIN_TTL).await? else {
        info!("another drain is running; skipped");
        return Ok(DrainOutcome::Busy);
    };

    let outcome = drain_leased(store, &credential, submitter, trace, &lease).await;
    if let Err(err) = lease.release().await {
        warn!(?err, "failed to release drain lease");
    }
    outcome
}

async fn drain_leased(
    store: &QueueStore,
    credential: &Credential,
    submitter: &dyn PostSubmitter,
    trace: &dyn TraceSink,
    lease: &Lease,
) -> Result<DrainOutcome> {
    let mut published = 0;
    let mut parked = 0;
    while let Some(next) = store.peek_oldest().await? {
        if !lease.renew().await? {
            warn!(published, parked, "drain lease lost; stopping");
            return Ok(DrainOutcome::Busy);
        }
        if let Some(reason) = next.unreadable {
            store.park(next.id, &reason).await?;
            parked += 1;
            continue;
        }
        match submitter.submit(&next.post, credential, trace).await {
            SubmissionOutcome::Success { published_path, .. } => {
                store.remove(next.id).await?;
                published += 1;
                info!(id = next.id, path = ?published_path, "queued post published");
            }
            SubmissionOutcome::PermanentFailure { reason } => {
                store.park(next.id, &reason).await?;
                parked += 1;
            }
            SubmissionOutcome::RetryableFailure { reason } => {
                warn!(id = next.id, reason = %reason, published, "queued post failed; drain halted");
                return Ok(DrainOutcome::Halted {
                    published,
                    parked,
                    post_id: next.id,
                    reason,
                });
            }
        }
    }
    info!(published, parked, "queue drained");
    Ok(DrainOutcome::Drained { published, parked })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Idle,
    Draining,
    WaitingForRetry { attempt: u32 },
}

/// Snapshot published by a running driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverStatus {
    pub state: DriverState,
    pub completed_drains: u64,
    pub last_outcome: Option<DrainOutcome>,
}

impl Default for DriverStatus {
    fn default() -> Self {
        Self {
            state: DriverState::Idle,
            completed_drains: 0,
            last_outcome: None,
        }
    }
}

/// Something that can request a background drain.
pub trait SyncTrigger: Send + Sync {
    fn arm(&self);
}

#[derive(Debug)]
enum Command {
    SyncNow,
    Shutdown,
}

#[derive(Debug, Clone, Copy)]
enum Trigger {
    Armed,
    Reconnected,
    RetryTimer,
}

/// Handle to a spawned [`SyncDriver`].
#[derive(Debug, Clone)]
pub struct SyncHandle {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<DriverStatus>,
}

impl SyncHandle {
    pub fn status(&self) -> DriverStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<DriverStatus> {
        self.status.clone()
    }

    /// Stop the driver after any requests already queued have been handled.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }
}

impl SyncTrigger for SyncHandle {
    fn arm(&self) {
        match self.commands.try_send(Command::SyncNow) {
            Ok(()) => debug!("sync armed"),
            // A full channel already holds a pending request.
            Err(mpsc::error::TrySendError::Full(_)) => debug!("sync already armed"),
            Err(mpsc::error::TrySendError::Closed(_)) => warn!("sync driver stopped; arm ignored"),
        }
    }
}

pub struct SyncDriver {
    store: QueueStore,
    credentials: CredentialStore,
    submitter: Arc<dyn PostSubmitter>,
    trace: Arc<dyn TraceSink>,
    backoff: Backoff,
    connectivity: watch::Receiver<bool>,
}

impl SyncDriver {
    pub fn new(
        store: QueueStore,
        credentials: CredentialStore,
        submitter: Arc<dyn PostSubmitter>,
        backoff: Backoff,
        connectivity: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            credentials,
            submitter,
            trace: Arc::new(LogTrace),
            backoff,
            connectivity,
        }
    }

    pub fn with_trace(mut self, trace: Arc<dyn TraceSink>) -> Self {
        self.trace = trace;
        self
    }

    /// Run the driver on the current runtime. At most one drain is in flight at a time.
    pub fn spawn(self) -> (SyncHandle, JoinHandle<Result<()>>) {
        let (commands_tx, commands_rx) = mpsc::channel(1);
        let (status_tx, status_rx) = watch::channel(DriverStatus::default());
        let task = tokio::spawn(self.run(commands_rx, status_tx));
        (
            SyncHandle {
                commands: commands_tx,
                status: status_rx,
            },
            task,
        )
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        status: watch::Sender<DriverStatus>,
    ) -> Result<()> {
        let mut schedule = db::load_retry_schedule(self.store.pool()).await?;
        let mut retry_at: Option<Instant> = None;
        if !self.store.is_empty().await? {
            // Resume after a restart: honour a persisted retry time, or drain now.
            retry_at = Some(match schedule.next_retry_at {
                Some(at) => Instant::now() + (at - Utc::now()).to_std().unwrap_or(Duration::ZERO),
                None => Instant::now(),
            });
            info!(attempt = schedule.attempt, "pending posts found; sync scheduled");
            if schedule.attempt > 0 {
                set_state(&status, DriverState::WaitingForRetry { attempt: schedule.attempt });
            }
        }

        let mut connectivity_open = true;
        loop {
            let trigger = tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(Command::SyncNow) => Trigger::Armed,
                    Some(Command::Shutdown) | None => break,
                },
                changed = self.connectivity.changed(), if connectivity_open => {
                    if changed.is_err() {
                        connectivity_open = false;
                        continue;
                    }
                    if !*self.connectivity.borrow_and_update() {
                        debug!("connectivity lost");
                        continue;
                    }
                    Trigger::Reconnected
                }
                _ = sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    Trigger::RetryTimer
                }
            };

            // Any trigger supersedes the pending timer.
            retry_at = None;
            if !*self.connectivity.borrow() {
                debug!(?trigger, "offline; sync deferred until connectivity returns");
                continue;
            }

            debug!(?trigger, "sync starting");
            set_state(&status, DriverState::Draining);
            let outcome = drain_queue(
                &self.store,
                &self.credentials,
                self.submitter.as_ref(),
                self.trace.as_ref(),
            )
            .await;

            let (state, last) = match outcome {
                Ok(outcome @ DrainOutcome::Drained { .. }) => {
                    schedule = RetrySchedule::default();
                    self.persist(&schedule).await;
                    (DriverState::Idle, outcome)
                }
                Ok(DrainOutcome::MissingCredential) => {
                    // Wait for an explicit arm once a credential exists.
                    schedule.next_retry_at = None;
                    self.persist(&schedule).await;
                    (DriverState::Idle, DrainOutcome::MissingCredential)
                }
                Ok(DrainOutcome::Busy) => {
                    // Another process is draining; the attempt count is left alone.
                    retry_at = Some(Instant::now() + self.backoff.delay(1));
                    (self.waiting_state(&schedule), DrainOutcome::Busy)
                }
                Ok(outcome @ (DrainOutcome::Halted { .. } | DrainOutcome::Failed { .. })) => {
                    retry_at = Some(self.schedule_retry(&mut schedule).await);
                    (self.waiting_state(&schedule), outcome)
                }
                Err(err) => {
                    error!(?err, "sync pass failed");
                    retry_at = Some(self.schedule_retry(&mut schedule).await);
                    (
                        self.waiting_state(&schedule),
                        DrainOutcome::Failed {
                            reason: format!("{:#}", err),
                        },
                    )
                }
            };
            status.send_modify(|s| {
                s.state = state;
                s.completed_drains += 1;
                s.last_outcome = Some(last);
            });
        }

        set_state(&status, DriverState::Idle);
        info!("sync driver stopped");
        Ok(())
    }

    fn waiting_state(&self, schedule: &RetrySchedule) -> DriverState {
        DriverState::WaitingForRetry {
            attempt: schedule.attempt,
        }
    }

    async fn schedule_retry(&self, schedule: &mut RetrySchedule) -> Instant {
        schedule.attempt = schedule.attempt.saturating_add(1);
        let delay = self.backoff.delay(schedule.attempt);
        schedule.next_retry_at =
            Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero()));
        self.persist(schedule).await;
        info!(attempt = schedule.attempt, delay_secs = delay.as_secs_f64(), "sync retry scheduled");
        Instant::now() + delay
    }

    async fn persist(&self, schedule: &RetrySchedule) {
        if let Err(err) = db::save_retry_schedule(self.store.pool(), schedule).await {
            warn!(?err, "failed to persist retry schedule");
        }
    }
}

fn set_state(status: &watch::Sender<DriverStatus>, state: DriverState) {
    status.send_modify(|s| s.state = state);
}

/// Reachability of the publishing endpoint, `true` when online.
pub fn connectivity_channel(initial: bool) -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(initial)
}

/// Whether a TCP connection to the URL's host can be opened within `timeout`.
pub async fn probe_once(url: &Url, timeout: Duration) -> bool {
    let Some(host) = url.host_str() else {
        return false;
    };
    let port = url.port_or_known_default().unwrap_or(443);
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect((host, port))).await,
        Ok(Ok(_))
    )
}

/// Probe `url` every `interval` and publish changes until all receivers are gone.
pub async fn probe_connectivity(url: Url, interval: Duration, tx: watch::Sender<bool>) {
    let timeout = interval.min(Duration::from_secs(10));
    loop {
        let online = probe_once(&url, timeout).await;
        let changed = tx.send_if_modified(|current| {
            if *current != online {
                *current = online;
                true
            } else {
                false
            }
        });
        if changed {
            info!(online, host = url.host_str().unwrap_or(""), "connectivity changed");
        }
        if tx.is_closed() {
            break;
        }
        tokio::time::sleep(interval).await;
    }
}
