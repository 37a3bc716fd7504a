//! Peer-session runtime for remote driving.
//!
//! A cockpit process streams operator commands to a vehicle process while the
//! vehicle returns chassis telemetry. Peers meet through a signaling service
//! and then exchange binary frames over labeled WebRTC data channels. This
//! crate is the runtime between those two worlds: it drives the
//! offer/answer/candidate handshake, keeps the labeled channels alive,
//! watches peer liveness, and serializes every state transition through a
//! single dispatcher worker.
//!
//! The embedding application talks to [`Core`]: register handlers with
//! [`Core::on`], call [`Core::start`], then push frames with [`Core::send`]
//! or [`Core::broadcast`] from any thread.

pub mod config;
pub mod core;
pub mod dispatch;
pub mod link;
pub mod monitor;
pub mod registry;
pub mod rtc;
pub mod session;
pub mod signal;
pub mod telemetry;

pub use crate::config::{ChannelLabels, ConfigError, CoreConfig, IceServer};
pub use crate::core::{Core, CoreError};
pub use crate::dispatch::{CoreEvent, EventKind};
pub use crate::session::SendError;
pub use crate::signal::{Candidate, Envelope, EnvelopeKind, PeerId};
