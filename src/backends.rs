//! Election backends.
//!
//! A backend owns all interaction with the external coordination service and
//! converts it into candidacy events. Backends emit a baseline `NOTLEADER`
//! before claiming or rejecting leadership, emit `ERROR` only for faults
//! they will themselves retry, and return an error only for unrecoverable
//! conditions. Normal return is not expected.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Certificate, Client, ConnectOptions, EventType, Identity, LeaseKeepAliveResponse, TlsOptions,
};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::MissedTickBehavior;

use crate::channel::Sender;
use crate::elector::Event;

/// Default lease TTL when not configured.
const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(60);

/// Initial backoff after a failed etcd session.
const INITIAL_SESSION_BACKOFF: Duration = Duration::from_secs(1);

/// Maximum backoff between etcd session attempts.
const MAX_SESSION_BACKOFF: Duration = Duration::from_secs(30);

/// Error type for backend operations. Backends surface these only for
/// unrecoverable conditions; transient faults stay internal and are reported
/// as `ERROR` events instead.
#[derive(thiserror::Error, Debug)]
pub enum BackendError {
    #[error("unexpected console input: {0:?}")]
    UnexpectedInput(String),
    #[error("console input closed")]
    InputClosed,
    #[error("invalid backend configuration: {0}")]
    Config(String),
    #[error("etcd protocol violation: {0}")]
    Protocol(&'static str),
    #[error("lease lost: {0}")]
    LeaseLost(&'static str),
    #[error("etcd error: {0}")]
    Etcd(#[from] etcd_client::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Produces candidacy events for a single elector.
#[async_trait]
pub trait Backend: Send + 'static {
    /// Retrieves state changes from the backend and emits them on `updates`.
    ///
    /// An error should only be returned for non-recoverable conditions; for
    /// recoverable faults the backend emits [`Event::Error`] and retries.
    async fn election_loop(self: Box<Self>, updates: Sender<Event>) -> Result<(), BackendError>;
}

// ============================================================================
// CONSOLE BACKEND
// ============================================================================

/// Election backend driven by commands typed on standard input. Testing only.
pub struct ConsoleBackend;

impl ConsoleBackend {
    /// Maps a console token to its candidacy event. Anything else is misuse.
    fn parse_token(token: &str) -> Option<Event> {
        match token {
            "LEADER" => Some(Event::Leader),
            "NOTLEADER" => Some(Event::NotLeader),
            "ERROR" => Some(Event::Error),
            _ => None,
        }
    }
}

#[async_trait]
impl Backend for ConsoleBackend {
    async fn election_loop(self: Box<Self>, updates: Sender<Event>) -> Result<(), BackendError> {
        tracing::info!("Starting console election loop");
        if updates.send(Event::NotLeader).await.is_err() {
            return Ok(());
        }

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            println!("Enter next state: ");
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return Err(BackendError::InputClosed),
                Err(err) => {
                    tracing::warn!(error = %err, "Error while reading console input");
                    continue;
                }
            };

            let token = line.trim();
            if token.is_empty() {
                continue;
            }
            let event = Self::parse_token(token)
                .ok_or_else(|| BackendError::UnexpectedInput(token.to_string()))?;
            if updates.send(event).await.is_err() {
                return Ok(());
            }
        }
    }
}

// ============================================================================
// ETCD BACKEND
// ============================================================================

/// Configuration for the etcd election backend. Optional settings are
/// finalized before the first event is emitted.
#[derive(Debug, Clone, Default)]
pub struct EtcdConfig {
    pub members: Vec<String>,
    pub keyspace: String,
    /// Unique id for this participant; falls back to the host name.
    pub instance_id: Option<String>,
    /// Lease TTL; falls back to 60s.
    pub lease_ttl: Option<Duration>,
    /// Lease refresh interval; falls back to TTL / 2.
    pub refresh_interval: Option<Duration>,
    pub ca_file: Option<PathBuf>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
}

/// Tuning overrides loaded from an optional `elector` config file and
/// `ELECTOR_ETCD_*` environment variables.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
struct EtcdTuning {
    lease_ttl_secs: Option<u64>,
    refresh_interval_secs: Option<u64>,
}

impl EtcdTuning {
    fn load() -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::with_name("elector").required(false))
            .add_source(config::Environment::with_prefix("ELECTOR_ETCD").try_parsing(true))
            .build()?
            .try_deserialize()
    }
}

#[derive(Debug, Clone)]
struct ResolvedEtcdConfig {
    members: Vec<String>,
    keyspace: String,
    instance_id: String,
    lease_ttl: Duration,
    refresh_interval: Duration,
    ca_file: Option<PathBuf>,
    cert_file: Option<PathBuf>,
    key_file: Option<PathBuf>,
}

impl EtcdConfig {
    /// Validates required settings and applies the fallbacks.
    fn resolve(self, tuning: EtcdTuning) -> Result<ResolvedEtcdConfig, BackendError> {
        if self.members.is_empty() {
            return Err(BackendError::Config(
                "at least one etcd member is required".to_string(),
            ));
        }
        if self.keyspace.is_empty() {
            return Err(BackendError::Config("keyspace is required".to_string()));
        }

        let lease_ttl = self
            .lease_ttl
            .or(tuning.lease_ttl_secs.map(Duration::from_secs))
            .unwrap_or_else(|| {
                tracing::info!(
                    ttl_secs = DEFAULT_LEASE_TTL.as_secs(),
                    "Lease TTL not set; falling back to default"
                );
                DEFAULT_LEASE_TTL
            });

        let refresh_interval = self
            .refresh_interval
            .or(tuning.refresh_interval_secs.map(Duration::from_secs))
            .unwrap_or_else(|| {
                tracing::info!("Refresh interval not set; falling back to TTL / 2");
                lease_ttl / 2
            });

        if lease_ttl.is_zero() || refresh_interval.is_zero() {
            return Err(BackendError::Config(
                "lease TTL and refresh interval must be nonzero".to_string(),
            ));
        }

        let instance_id = match self.instance_id.filter(|id| !id.is_empty()) {
            Some(id) => id,
            None => {
                let host = gethostname::gethostname().to_string_lossy().into_owned();
                tracing::info!(instance_id = %host, "Instance id not set; falling back to hostname");
                host
            }
        };

        Ok(ResolvedEtcdConfig {
            members: self.members,
            keyspace: self.keyspace,
            instance_id,
            lease_ttl,
            refresh_interval,
            ca_file: self.ca_file,
            cert_file: self.cert_file,
            key_file: self.key_file,
        })
    }
}

impl ResolvedEtcdConfig {
    /// Builds TLS options when a CA, certificate and key are all configured,
    /// matching how the credentials are expected to be deployed together.
    async fn tls_options(&self) -> Result<Option<TlsOptions>, BackendError> {
        match (&self.ca_file, &self.cert_file, &self.key_file) {
            (Some(ca), Some(cert), Some(key)) => {
                let ca = tokio::fs::read(ca).await?;
                let cert = tokio::fs::read(cert).await?;
                let key = tokio::fs::read(key).await?;
                Ok(Some(
                    TlsOptions::new()
                        .ca_certificate(Certificate::from_pem(ca))
                        .identity(Identity::from_pem(cert, key)),
                ))
            }
            (None, None, None) => Ok(None),
            _ => {
                tracing::warn!("Partial TLS configuration ignored; ca, cert and key must all be set");
                Ok(None)
            }
        }
    }
}

/// Election backend powered by an etcd v3 cluster: holds a leased key under
/// the configured keyspace and reports grant/loss of the lock.
pub struct EtcdBackend {
    config: EtcdConfig,
}

impl EtcdBackend {
    pub fn new(config: EtcdConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Backend for EtcdBackend {
    async fn election_loop(self: Box<Self>, updates: Sender<Event>) -> Result<(), BackendError> {
        let tuning = EtcdTuning::load().map_err(|err| BackendError::Config(err.to_string()))?;
        let cfg = self.config.resolve(tuning)?;

        // Known baseline before the first election attempt.
        if updates.send(Event::NotLeader).await.is_err() {
            return Ok(());
        }

        let tls = cfg.tls_options().await?;
        let options = tls.map(|tls| ConnectOptions::new().with_tls(tls));
        let mut client = Client::connect(cfg.members.clone(), options).await?;

        tracing::info!(
            keyspace = %cfg.keyspace,
            instance_id = %cfg.instance_id,
            ttl_secs = cfg.lease_ttl.as_secs(),
            "Starting etcd election loop"
        );

        let mut backoff = INITIAL_SESSION_BACKOFF;
        loop {
            match campaign_session(&cfg, &mut client, &updates).await {
                Ok(Session::Closed) => return Ok(()),
                Ok(Session::Lost) => {
                    backoff = INITIAL_SESSION_BACKOFF;
                }
                Err(err) => {
                    tracing::warn!(error = %err, "etcd session failed; resuming candidacy after backoff");
                    if updates.send(Event::Error).await.is_err() {
                        return Ok(());
                    }
                    tokio::time::sleep(jittered(backoff)).await;
                    backoff = (backoff * 2).min(MAX_SESSION_BACKOFF);
                }
            }
        }
    }
}

/// How a single leadership session ended.
enum Session {
    /// Leadership was held and then lost; NOTLEADER has been emitted and
    /// candidacy resumes.
    Lost,
    /// The reconciler went away; the loop has nothing left to drive.
    Closed,
}

/// Runs one leadership session: grant a lease, campaign on the keyspace,
/// and hold leadership until the leader key is deleted or the lease dies.
///
/// Errors are returned only from the candidacy side (lease setup, the
/// campaign itself). Once leadership has been reported, any way of losing
/// the grant ends the session with a NOTLEADER event, never an error.
async fn campaign_session(
    cfg: &ResolvedEtcdConfig,
    client: &mut Client,
    updates: &Sender<Event>,
) -> Result<Session, BackendError> {
    let lease = client.lease_grant(cfg.lease_ttl.as_secs() as i64, None).await?;
    let lease_id = lease.id();
    let (mut keeper, mut keepalive_rx) = client.lease_keep_alive(lease_id).await?;

    let mut refresh = tokio::time::interval(cfg.refresh_interval);
    refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::info!(keyspace = %cfg.keyspace, lease = lease_id, "Campaigning for leadership");

    // The campaign blocks while another participant holds the lock; the
    // lease must stay refreshed the whole time or the candidacy is dropped.
    let leader_key = {
        let mut campaign = std::pin::pin!(client.campaign(
            cfg.keyspace.as_str(),
            cfg.instance_id.as_str(),
            lease_id,
        ));
        loop {
            tokio::select! {
                res = &mut campaign => {
                    let resp = res?;
                    break resp
                        .leader()
                        .map(|leader| leader.key().to_vec())
                        .ok_or(BackendError::Protocol("campaign response missing leader key"))?;
                }
                _ = refresh.tick() => keeper.keep_alive().await?,
                msg = keepalive_rx.message() => {
                    if let LeaseStatus::Lost(reason) = check_keep_alive(msg) {
                        return Err(BackendError::LeaseLost(reason));
                    }
                }
            }
        }
    };

    tracing::info!(instance_id = %cfg.instance_id, "Received leadership grant");
    if updates.send(Event::Leader).await.is_err() {
        return Ok(Session::Closed);
    }

    // Hold phase: watch our own leader key; a delete means the lock was
    // released, taken over or expired. A dead lease or watch means the
    // grant can no longer be trusted and counts as loss too.
    let (mut watcher, mut watch_rx) = client.watch(leader_key, None).await?;
    let reason = loop {
        tokio::select! {
            _ = refresh.tick() => {
                if let Err(err) = keeper.keep_alive().await {
                    tracing::warn!(error = %err, "Lease keep-alive request failed");
                    break "keep-alive request failed";
                }
            }
            msg = keepalive_rx.message() => {
                if let LeaseStatus::Lost(reason) = check_keep_alive(msg) {
                    break reason;
                }
            }
            msg = watch_rx.message() => {
                match msg {
                    Ok(Some(resp)) => {
                        if resp.events().iter().any(|ev| ev.event_type() == EventType::Delete) {
                            break "leader key deleted";
                        }
                        tracing::debug!("Leadership key changed; still leader");
                    }
                    Ok(None) => break "watch stream closed",
                    Err(err) => {
                        tracing::warn!(error = %err, "Watch stream failed");
                        break "watch stream failed";
                    }
                }
            }
        }
    };
    let _ = watcher.cancel().await;

    tracing::info!(reason, "Leadership lost");
    if updates.send(Event::NotLeader).await.is_err() {
        return Ok(Session::Closed);
    }
    Ok(Session::Lost)
}

/// Lease health as reported by one keep-alive exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeaseStatus {
    Held,
    /// The grant is gone; while leader this must surface as NOTLEADER.
    Lost(&'static str),
}

fn check_keep_alive(
    msg: Result<Option<LeaseKeepAliveResponse>, etcd_client::Error>,
) -> LeaseStatus {
    classify_keep_alive(msg.map(|resp| resp.map(|resp| resp.ttl())))
}

/// A lease is alive only while keep-alive responses report a positive TTL;
/// a zero TTL, a closed stream or a failed exchange all mean the grant is
/// gone.
fn classify_keep_alive(ttl: Result<Option<i64>, etcd_client::Error>) -> LeaseStatus {
    match ttl {
        Ok(Some(ttl)) if ttl > 0 => LeaseStatus::Held,
        Ok(Some(_)) => LeaseStatus::Lost("lease expired"),
        Ok(None) => LeaseStatus::Lost("keep-alive stream closed"),
        Err(_) => LeaseStatus::Lost("keep-alive exchange failed"),
    }
}

fn jittered(backoff: Duration) -> Duration {
    use rand::Rng;

    let spread = (backoff.as_millis() as u64 / 2).max(1);
    backoff + Duration::from_millis(rand::rng().random_range(0..spread))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn etcd_config() -> EtcdConfig {
        EtcdConfig {
            members: vec!["http://127.0.0.1:2379".to_string()],
            keyspace: "/elector/test".to_string(),
            ..EtcdConfig::default()
        }
    }

    #[test]
    fn test_console_tokens_map_to_events() {
        assert_eq!(ConsoleBackend::parse_token("LEADER"), Some(Event::Leader));
        assert_eq!(ConsoleBackend::parse_token("NOTLEADER"), Some(Event::NotLeader));
        assert_eq!(ConsoleBackend::parse_token("ERROR"), Some(Event::Error));
    }

    #[test]
    fn test_console_rejects_unexpected_tokens() {
        assert_eq!(ConsoleBackend::parse_token("leader"), None);
        assert_eq!(ConsoleBackend::parse_token("FOLLOWER"), None);
        assert_eq!(ConsoleBackend::parse_token(""), None);
    }

    #[test]
    fn test_keep_alive_with_positive_ttl_holds_lease() {
        assert_eq!(classify_keep_alive(Ok(Some(30))), LeaseStatus::Held);
    }

    #[test]
    fn test_keep_alive_with_zero_ttl_means_lease_lost() {
        // A dead lease ends the session with NOTLEADER, never ERROR.
        assert!(matches!(classify_keep_alive(Ok(Some(0))), LeaseStatus::Lost(_)));
        assert!(matches!(classify_keep_alive(Ok(Some(-1))), LeaseStatus::Lost(_)));
    }

    #[test]
    fn test_closed_keep_alive_stream_means_lease_lost() {
        assert!(matches!(classify_keep_alive(Ok(None)), LeaseStatus::Lost(_)));
    }

    #[test]
    fn test_resolve_applies_defaults() {
        let cfg = etcd_config().resolve(EtcdTuning::default()).unwrap();

        assert_eq!(cfg.lease_ttl, Duration::from_secs(60));
        assert_eq!(cfg.refresh_interval, Duration::from_secs(30));
        assert!(!cfg.instance_id.is_empty());
    }

    #[test]
    fn test_resolve_applies_tuning_overrides() {
        let tuning = EtcdTuning {
            lease_ttl_secs: Some(10),
            refresh_interval_secs: None,
        };
        let cfg = etcd_config().resolve(tuning).unwrap();

        assert_eq!(cfg.lease_ttl, Duration::from_secs(10));
        assert_eq!(cfg.refresh_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_resolve_keeps_explicit_settings() {
        let mut config = etcd_config();
        config.instance_id = Some("node-7".to_string());
        config.lease_ttl = Some(Duration::from_secs(20));
        config.refresh_interval = Some(Duration::from_secs(3));

        let cfg = config.resolve(EtcdTuning::default()).unwrap();

        assert_eq!(cfg.instance_id, "node-7");
        assert_eq!(cfg.lease_ttl, Duration::from_secs(20));
        assert_eq!(cfg.refresh_interval, Duration::from_secs(3));
    }

    #[test]
    fn test_resolve_requires_members_and_keyspace() {
        let mut config = etcd_config();
        config.members.clear();
        assert!(matches!(
            config.resolve(EtcdTuning::default()),
            Err(BackendError::Config(_))
        ));

        let mut config = etcd_config();
        config.keyspace.clear();
        assert!(matches!(
            config.resolve(EtcdTuning::default()),
            Err(BackendError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_tls_requires_all_three_files() {
        let mut config = etcd_config();
        config.ca_file = Some(PathBuf::from("/nonexistent/ca.pem"));
        let cfg = config.resolve(EtcdTuning::default()).unwrap();

        // Partial credentials fall back to plaintext rather than erroring.
        assert!(cfg.tls_options().await.unwrap().is_none());
    }
}
