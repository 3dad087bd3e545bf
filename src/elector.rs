//! Stateful leader elector.
//!
//! The elector consumes candidacy events from a backend, keeps the local
//! role consistent with the lifecycle actions that have actually succeeded,
//! and supervises the backend, reconciler and signal-handling tasks. It can
//! be queried for nothing; the role is visible only through the actions it
//! triggers. An elector is started once; a second start fails.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::actions::{Action, ActionError};
use crate::backends::{Backend, BackendError};
use crate::channel::{self, Receiver, Sender};

/// Bounded retry budget for releasing leadership while in the error path.
const DEMOTION_RETRIES: u32 = 12;
/// Delay between demotion retries.
const DEMOTION_RETRY_DELAY: Duration = Duration::from_secs(5);
/// Grace window granted for a final step-down after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Local view of this process's leadership status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Initial and safe state; no leader-side resources are held.
    NotLeader,
    /// `on_become_leader` has succeeded and `on_lose_leader` has not yet
    /// been required.
    Leader,
    /// An action just failed; the error action is running or queued.
    Error,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Role::NotLeader => "NOTLEADER",
            Role::Leader => "LEADER",
            Role::Error => "ERROR",
        })
    }
}

/// A candidacy event flowing from a backend (or the error-injection path)
/// to the reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Leader,
    NotLeader,
    Error,
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Event::Leader => "LEADER",
            Event::NotLeader => "NOTLEADER",
            Event::Error => "ERROR",
        })
    }
}

/// Error type for elector construction and supervision.
#[derive(thiserror::Error, Debug)]
pub enum ElectorError {
    #[error("elector has already been initialized; electors can be started once")]
    AlreadyInitialized,
    #[error("{0} is required")]
    MissingComponent(&'static str),
    #[error("failed to release leadership after {attempts} attempts; the state of this system may be inconsistent")]
    DemotionRetriesExhausted { attempts: u32 },
    #[error("unrecoverable action failure: {0}")]
    Action(ActionError),
    #[error("election backend failed: {0}")]
    Backend(BackendError),
    #[error("elector task failed")]
    Join(#[from] tokio::task::JoinError),
}

// ============================================================================
// RECONCILER
// ============================================================================

/// Outcome of a single action invocation, with unrecoverable failures
/// already peeled off into `ElectorError`.
enum Outcome {
    Success,
    Failed,
}

/// Single-consumer state machine: receives events one at a time and keeps
/// `role` consistent with the actions that have succeeded so far.
struct Reconciler {
    role: Role,
    on_become_leader: Arc<dyn Action>,
    on_lose_leader: Arc<dyn Action>,
    on_error: Arc<dyn Action>,
    updates_tx: Sender<Event>,
    updates_rx: Receiver<Event>,
}

impl Reconciler {
    fn new(
        on_become_leader: Arc<dyn Action>,
        on_lose_leader: Arc<dyn Action>,
        on_error: Arc<dyn Action>,
        updates_tx: Sender<Event>,
        updates_rx: Receiver<Event>,
    ) -> Self {
        Self {
            role: Role::NotLeader,
            on_become_leader,
            on_lose_leader,
            on_error,
            updates_tx,
            updates_rx,
        }
    }

    async fn run(mut self) -> Result<(), ElectorError> {
        tracing::info!("Starting state reconciliation loop");
        while let Some(event) = self.updates_rx.recv().await {
            self.reconcile(event).await?;
        }
        tracing::info!("Event channel closed; reconciliation loop ending");
        Ok(())
    }

    async fn reconcile(&mut self, event: Event) -> Result<(), ElectorError> {
        match event {
            Event::Leader => {
                if self.role == Role::Leader {
                    tracing::info!("Received LEADER (was already LEADER)");
                    return Ok(());
                }
                let outcome = self.invoke("on_become_leader", &self.on_become_leader).await?;
                match outcome {
                    // Role is assigned only after the start action succeeds,
                    // so a failed session never reports LEADER.
                    Outcome::Success => self.role = Role::Leader,
                    Outcome::Failed => self.inject_error(),
                }
            }

            Event::NotLeader => {
                if self.role == Role::Leader {
                    tracing::info!("Received NOTLEADER (was LEADER)");
                    let outcome = self.invoke("on_lose_leader", &self.on_lose_leader).await?;
                    match outcome {
                        Outcome::Success => self.role = Role::NotLeader,
                        Outcome::Failed => {
                            // Demotion requires a successful release; stay
                            // LEADER and let the error path retry it.
                            tracing::warn!("Not transitioning to NOTLEADER until the release succeeds");
                            self.inject_error();
                        }
                    }
                } else {
                    tracing::info!(role = %self.role, "Received NOTLEADER");
                    self.role = Role::NotLeader;
                }
            }

            Event::Error => {
                tracing::info!(role = %self.role, "Received ERROR");
                if self.role == Role::Leader {
                    self.release_with_retry().await?;
                }
                if self.role != Role::Leader {
                    self.run_error_phase().await?;
                }
            }
        }

        Ok(())
    }

    /// Leaves `Leader` on the error path: `on_lose_leader` must eventually
    /// succeed or the process terminates, since a half-released leader
    /// risks split-brain downstream.
    async fn release_with_retry(&mut self) -> Result<(), ElectorError> {
        let mut failed = 0;

        while failed < DEMOTION_RETRIES {
            let outcome = self.invoke("on_lose_leader", &self.on_lose_leader).await?;
            match outcome {
                Outcome::Success => {
                    self.role = Role::NotLeader;
                    return Ok(());
                }
                Outcome::Failed => {
                    failed += 1;
                    tracing::warn!(
                        attempt = failed,
                        retries = DEMOTION_RETRIES,
                        "Release failed; retrying in {}s",
                        DEMOTION_RETRY_DELAY.as_secs()
                    );
                    tokio::time::sleep(DEMOTION_RETRY_DELAY).await;
                }
            }
        }

        tracing::error!(attempts = failed, "Failed to release leadership; giving up");
        Err(ElectorError::DemotionRetriesExhausted { attempts: failed })
    }

    /// Runs `on_error`; on success discards every event that queued up while
    /// the reconciler was unresponsive and waits for a fresh one.
    async fn run_error_phase(&mut self) -> Result<(), ElectorError> {
        self.role = Role::Error;
        let outcome = self.invoke("on_error", &self.on_error).await?;
        match outcome {
            Outcome::Success => {
                let lost = self.updates_rx.drain();
                tracing::info!(lost = lost.len(), "Error action succeeded; draining stale events");
                for event in lost {
                    tracing::info!(event = %event, "Discarded stale event");
                }
                self.role = Role::NotLeader;
            }
            Outcome::Failed => self.inject_error(),
        }
        Ok(())
    }

    async fn invoke(
        &self,
        name: &'static str,
        action: &Arc<dyn Action>,
    ) -> Result<Outcome, ElectorError> {
        match action.run().await {
            Ok(()) => Ok(Outcome::Success),
            Err(err) if err.is_unrecoverable() => {
                tracing::error!(action = name, error = %err, "Unrecoverable action failure");
                Err(ElectorError::Action(err))
            }
            Err(err) => {
                tracing::warn!(action = name, error = %err, "Action failed; sending error state");
                Ok(Outcome::Failed)
            }
        }
    }

    /// Schedules an ERROR event without blocking the reconciler on its own
    /// channel: the send happens on a detached task and rendezvouses with
    /// the next receive.
    fn inject_error(&self) {
        let updates = self.updates_tx.clone();
        tokio::spawn(async move {
            let _ = updates.send(Event::Error).await;
        });
    }
}

// ============================================================================
// ELECTOR
// ============================================================================

/// The embedder-visible aggregate: three lifecycle actions, a backend, and
/// the event channel binding them together once started.
pub struct Elector {
    on_become_leader: Arc<dyn Action>,
    on_lose_leader: Arc<dyn Action>,
    on_error: Arc<dyn Action>,
    backend: Mutex<Option<Box<dyn Backend>>>,
}

impl Elector {
    pub(crate) fn new(
        on_become_leader: Arc<dyn Action>,
        on_lose_leader: Arc<dyn Action>,
        on_error: Arc<dyn Action>,
        backend: Box<dyn Backend>,
    ) -> Self {
        Self {
            on_become_leader,
            on_lose_leader,
            on_error,
            backend: Mutex::new(Some(backend)),
        }
    }

    /// Starts an elector loop and supervises it until shutdown.
    ///
    /// Spawns the reconciler, the backend election loop and a signal
    /// handler. Returns `Ok` on clean (signal-driven) shutdown or when the
    /// backend ends without error; any fatal condition is returned as an
    /// error. Calling `run` a second time fails before spawning anything.
    pub async fn run(&self) -> Result<(), ElectorError> {
        tracing::info!("Starting elector");
        let backend = self
            .backend
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(ElectorError::AlreadyInitialized)?;

        let (updates_tx, updates_rx) = channel::channel();

        let reconciler = Reconciler::new(
            Arc::clone(&self.on_become_leader),
            Arc::clone(&self.on_lose_leader),
            Arc::clone(&self.on_error),
            updates_tx.clone(),
            updates_rx,
        );
        let mut reconcile_task = tokio::spawn(reconciler.run());
        let mut backend_task = tokio::spawn(backend.election_loop(updates_tx.clone()));

        let signal_updates = updates_tx.clone();
        let mut signal_task = tokio::spawn(async move {
            shutdown_signal().await;
            tracing::info!("Shutdown signal received; stepping down");
            let _ = signal_updates.send(Event::NotLeader).await;
            tracing::info!(
                grace_secs = SHUTDOWN_GRACE.as_secs(),
                "Allowing the step-down to process before exiting"
            );
            tokio::time::sleep(SHUTDOWN_GRACE).await;
        });
        drop(updates_tx);

        tokio::select! {
            res = &mut reconcile_task => {
                backend_task.abort();
                signal_task.abort();
                res?
            }
            res = &mut backend_task => {
                reconcile_task.abort();
                signal_task.abort();
                match res? {
                    Ok(()) => {
                        tracing::warn!("Election backend returned; no further events will arrive");
                        Ok(())
                    }
                    Err(err) => Err(ElectorError::Backend(err)),
                }
            }
            res = &mut signal_task => {
                reconcile_task.abort();
                backend_task.abort();
                res?;
                tracing::info!("Shutdown grace elapsed; exiting");
                Ok(())
            }
        }
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let ctrl_c = tokio::signal::ctrl_c();
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = ctrl_c => {}
                _ = term.recv() => {}
            }
        }
        Err(err) => {
            tracing::warn!(error = %err, "Failed to install SIGTERM handler; handling SIGINT only");
            let _ = ctrl_c.await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

// ============================================================================
// TESTS
// ============================================================================
