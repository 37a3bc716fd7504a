//! Runtime configuration.
//!
//! Plain data: loading it from files, flags, or the environment is the
//! embedding application's concern. Defaults match what the cockpit and
//! vehicle clients ship with.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use url::Url;

use crate::signal::PeerId;

pub const DEFAULT_BACKLOG_CAPACITY: usize = 256;
pub const DEFAULT_CHANNEL_BUFFER_BYTES: usize = 4 * 1024 * 1024;

/// STUN/TURN server entry handed to the transport layer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IceServer {
    pub uri: String,
    pub username: Option<String>,
    pub credential: Option<String>,
}

/// Data channel labels; overridable, but both sides must agree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelLabels {
    pub control: String,
    pub telemetry: String,
    pub heartbeat: String,
}

impl Default for ChannelLabels {
    fn default() -> Self {
        ChannelLabels {
            control: "control".into(),
            telemetry: "telemetry".into(),
            heartbeat: "heartbeat".into(),
        }
    }
}

impl ChannelLabels {
    pub fn all(&self) -> [&str; 3] {
        [&self.control, &self.telemetry, &self.heartbeat]
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Zero disables liveness monitoring.
    pub interval: Duration,
    /// A peer silent for `interval * loss_multiplier` is declared lost.
    pub loss_multiplier: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        HeartbeatConfig {
            interval: Duration::from_millis(5000),
            loss_multiplier: 3,
        }
    }
}

/// Signaling link reconnection policy.
#[derive(Clone, Debug, PartialEq)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
    /// Fractional jitter applied to each delay, e.g. 0.2 for ±20%.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig {
            initial: Duration::from_millis(250),
            max: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

/// Optional hook rerouting application callbacks off the dispatcher worker,
/// e.g. onto a UI loop. Callbacks run on the worker when unset.
pub type Executor = Arc<dyn Fn(Box<dyn FnOnce() + Send>) + Send + Sync>;

#[derive(Clone)]
pub struct CoreConfig {
    /// Signaling endpoint; `wss` enables TLS with peer verification.
    pub signaling_uri: String,
    /// Bearer token appended URL-encoded as the `token` query parameter.
    pub signaling_token: Option<String>,
    pub local_id: PeerId,
    pub ice_servers: Vec<IceServer>,
    pub channels: ChannelLabels,
    pub heartbeat: HeartbeatConfig,
    pub backoff: BackoffConfig,
    /// Per-channel send backpressure cap in buffered bytes.
    pub channel_buffer_bytes: usize,
    pub shutdown_deadline: Duration,
    /// PEM bundle for TLS verification; native roots when unset.
    pub ca_bundle_path: Option<PathBuf>,
    pub executor: Option<Executor>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        CoreConfig {
            signaling_uri: "ws://127.0.0.1:8090/signal".into(),
            signaling_token: None,
            local_id: PeerId::new(uuid::Uuid::new_v4().to_string()),
            ice_servers: Vec::new(),
            channels: ChannelLabels::default(),
            heartbeat: HeartbeatConfig::default(),
            backoff: BackoffConfig::default(),
            channel_buffer_bytes: DEFAULT_CHANNEL_BUFFER_BYTES,
            shutdown_deadline: Duration::from_millis(10_000),
            ca_bundle_path: None,
            executor: None,
        }
    }
}

impl fmt::Debug for CoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoreConfig")
            .field("signaling_uri", &self.signaling_uri)
            .field("signaling_token", &self.signaling_token.as_ref().map(|_| "<redacted>"))
            .field("local_id", &self.local_id)
            .field("ice_servers", &self.ice_servers)
            .field("channels", &self.channels)
            .field("heartbeat", &self.heartbeat)
            .field("backoff", &self.backoff)
            .field("channel_buffer_bytes", &self.channel_buffer_bytes)
            .field("shutdown_deadline", &self.shutdown_deadline)
            .field("ca_bundle_path", &self.ca_bundle_path)
            .field("executor", &self.executor.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("local id must not be empty")]
    EmptyLocalId,
    #[error("signaling uri {uri:?} is invalid: {detail}")]
    BadSignalingUri { uri: String, detail: String },
    #[error("signaling uri scheme {0:?} is not ws or wss")]
    BadScheme(String),
    #[error("heartbeat loss multiplier must be at least 1")]
    ZeroLossMultiplier,
    #[error("backoff jitter {0} is outside [0, 1)")]
    BadJitter(f64),
    #[error("channel labels must be non-empty and distinct")]
    BadChannelLabels,
    #[error("channel buffer must hold at least one frame")]
    ZeroChannelBuffer,
}

impl CoreConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.local_id.is_empty() {
            return Err(ConfigError::EmptyLocalId);
        }
        let url = Url::parse(&self.signaling_uri).map_err(|err| ConfigError::BadSignalingUri {
            uri: self.signaling_uri.clone(),
            detail: err.to_string(),
        })?;
        match url.scheme() {
            "ws" | "wss" => {}
            other => return Err(ConfigError::BadScheme(other.to_string())),
        }
        if !self.heartbeat.interval.is_zero() && self.heartbeat.loss_multiplier == 0 {
            return Err(ConfigError::ZeroLossMultiplier);
        }
        if !(0.0..1.0).contains(&self.backoff.jitter) {
            return Err(ConfigError::BadJitter(self.backoff.jitter));
        }
        let labels = self.channels.all();
        let distinct = labels[0] != labels[1] && labels[0] != labels[2] && labels[1] != labels[2];
        if !distinct || labels.iter().any(|label| label.is_empty()) {
            return Err(ConfigError::BadChannelLabels);
        }
        if self.channel_buffer_bytes == 0 {
            return Err(ConfigError::ZeroChannelBuffer);
        }
        Ok(())
    }

    pub fn secure(&self) -> bool {
        self.signaling_uri.starts_with("wss:")
    }
}
