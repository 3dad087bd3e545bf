//! Integration tests for the elector supervisor.
//!
//! Drives a full `Elector` (reconciler + backend tasks) with a scripted
//! backend and observes the lifecycle actions it triggers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use elector::channel::Sender;
use elector::{Action, ActionError, Backend, BackendError, ElectorBuilder, ElectorError, Event};

/// Backend that plays a fixed sequence of events, then idles forever the
/// way a healthy backend would.
struct ScriptedBackend {
    events: Vec<Event>,
}

#[async_trait]
impl Backend for ScriptedBackend {
    async fn election_loop(self: Box<Self>, updates: Sender<Event>) -> Result<(), BackendError> {
        for event in self.events {
            if updates.send(event).await.is_err() {
                return Ok(());
            }
        }
        futures::future::pending().await
    }
}

/// Action that counts invocations and fails the first `failures` of them.
struct CountingAction {
    calls: AtomicUsize,
    failures: usize,
}

impl CountingAction {
    fn ok() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            failures: 0,
        })
    }

    fn failing(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            failures,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Action for CountingAction {
    async fn run(&self) -> Result<(), ActionError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            Err(ActionError::Failed("scripted failure".to_string()))
        } else {
            Ok(())
        }
    }
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_clean_leadership_cycle() {
    let become_leader = CountingAction::ok();
    let lose_leader = CountingAction::ok();
    let error = CountingAction::ok();

    let elector = ElectorBuilder::new()
        .on_become_leader(become_leader.clone())
        .on_lose_leader(lose_leader.clone())
        .on_error(error.clone())
        .backend(ScriptedBackend {
            events: vec![Event::NotLeader, Event::Leader, Event::NotLeader],
        })
        .build()
        .unwrap();

    let run = tokio::spawn(async move { elector.run().await });

    wait_until(|| lose_leader.calls() == 1).await;
    assert_eq!(become_leader.calls(), 1);
    assert_eq!(error.calls(), 0);

    run.abort();
}

#[tokio::test]
async fn test_failed_start_action_recovers_through_error_action() {
    let become_leader = CountingAction::failing(1);
    let lose_leader = CountingAction::ok();
    let error = CountingAction::ok();

    let elector = ElectorBuilder::new()
        .on_become_leader(become_leader.clone())
        .on_lose_leader(lose_leader.clone())
        .on_error(error.clone())
        .backend(ScriptedBackend {
            events: vec![Event::NotLeader, Event::Leader],
        })
        .build()
        .unwrap();

    let run = tokio::spawn(async move { elector.run().await });

    // The failed start action injects ERROR, which runs the error action;
    // leadership is never reported and no release is required.
    wait_until(|| error.calls() == 1).await;
    assert_eq!(become_leader.calls(), 1);
    assert_eq!(lose_leader.calls(), 0);

    run.abort();
}

#[tokio::test]
async fn test_error_while_leader_releases_leadership() {
    let become_leader = CountingAction::ok();
    let lose_leader = CountingAction::ok();
    let error = CountingAction::ok();

    let elector = ElectorBuilder::new()
        .on_become_leader(become_leader.clone())
        .on_lose_leader(lose_leader.clone())
        .on_error(error.clone())
        .backend(ScriptedBackend {
            events: vec![Event::NotLeader, Event::Leader, Event::Error],
        })
        .build()
        .unwrap();

    let run = tokio::spawn(async move { elector.run().await });

    wait_until(|| error.calls() == 1).await;
    assert_eq!(become_leader.calls(), 1);
    assert_eq!(lose_leader.calls(), 1);

    run.abort();
}

#[tokio::test]
async fn test_unrecoverable_action_terminates_run() {
    struct Broken;

    #[async_trait]
    impl Action for Broken {
        async fn run(&self) -> Result<(), ActionError> {
            Err(ActionError::Unrecoverable("missing program".to_string()))
        }
    }

    let elector = ElectorBuilder::new()
        .on_become_leader(Broken)
        .on_lose_leader(CountingAction::ok())
        .on_error(CountingAction::ok())
        .backend(ScriptedBackend {
            events: vec![Event::NotLeader, Event::Leader],
        })
        .build()
        .unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), elector.run()).await;
    assert!(matches!(result, Ok(Err(ElectorError::Action(_)))));
}

#[tokio::test]
async fn test_backend_failure_terminates_run() {
    struct FailingBackend;

    #[async_trait]
    impl Backend for FailingBackend {
        async fn election_loop(
            self: Box<Self>,
            updates: Sender<Event>,
        ) -> Result<(), BackendError> {
            let _ = updates.send(Event::NotLeader).await;
            Err(BackendError::UnexpectedInput("FOLLOWER".to_string()))
        }
    }

    let elector = ElectorBuilder::new()
        .on_become_leader(CountingAction::ok())
        .on_lose_leader(CountingAction::ok())
        .on_error(CountingAction::ok())
        .backend(FailingBackend)
        .build()
        .unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), elector.run()).await;
    assert!(matches!(result, Ok(Err(ElectorError::Backend(_)))));
}

#[tokio::test]
async fn test_double_start_fails_without_side_effects() {
    let become_leader = CountingAction::ok();

    let elector = Arc::new(
        ElectorBuilder::new()
            .on_become_leader(become_leader.clone())
            .on_lose_leader(CountingAction::ok())
            .on_error(CountingAction::ok())
            .backend(ScriptedBackend { events: vec![] })
            .build()
            .unwrap(),
    );

    let first = {
        let elector = elector.clone();
        tokio::spawn(async move { elector.run().await })
    };

    // Give the first run a moment to bind the channel.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let second = elector.run().await;
    assert!(matches!(second, Err(ElectorError::AlreadyInitialized)));
    assert_eq!(become_leader.calls(), 0);

    first.abort();
}
