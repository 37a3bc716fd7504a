//! Signaling envelope types and the wire codec.
//!
//! Envelopes travel as JSON text frames over the signaling link. `encode` is
//! deterministic (fixed field order), so two encodes of the same envelope are
//! byte-identical; `decode` is permissive about unknown JSON fields and
//! unknown `type` strings but strict about which fields a known kind may
//! carry.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Opaque peer identifier, unique within one signaling realm.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        PeerId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        PeerId(id.to_string())
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        PeerId(id)
    }
}

/// ICE candidate as carried in a `candidate` envelope.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Candidate {
    pub mid: String,
    pub mline_index: i32,
    pub sdp: String,
}

impl Candidate {
    /// A candidate whose mid/index pair cannot be applied is dropped by the
    /// registry rather than closing the session.
    pub fn is_well_formed(&self) -> bool {
        !self.mid.is_empty() && self.mline_index >= 0 && !self.sdp.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EnvelopeKind {
    Join,
    Leave,
    Offer,
    Answer,
    Candidate,
    Heartbeat,
    Error,
    /// A `type` string this build does not know. Decoded, logged, dropped.
    Unknown(String),
}

impl EnvelopeKind {
    fn from_wire(kind: &str) -> Self {
        match kind {
            "join" => EnvelopeKind::Join,
            "leave" => EnvelopeKind::Leave,
            "offer" => EnvelopeKind::Offer,
            "answer" => EnvelopeKind::Answer,
            "candidate" => EnvelopeKind::Candidate,
            "heartbeat" => EnvelopeKind::Heartbeat,
            "error" => EnvelopeKind::Error,
            other => EnvelopeKind::Unknown(other.to_string()),
        }
    }

    pub fn as_wire(&self) -> &str {
        match self {
            EnvelopeKind::Join => "join",
            EnvelopeKind::Leave => "leave",
            EnvelopeKind::Offer => "offer",
            EnvelopeKind::Answer => "answer",
            EnvelopeKind::Candidate => "candidate",
            EnvelopeKind::Heartbeat => "heartbeat",
            EnvelopeKind::Error => "error",
            EnvelopeKind::Unknown(other) => other,
        }
    }
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire())
    }
}

/// One decoded signaling message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub kind: EnvelopeKind,
    pub from: PeerId,
    /// Absent only for a broadcast `join`.
    pub to: Option<PeerId>,
    pub sdp: Option<String>,
    pub candidate: Option<Candidate>,
    pub reason: Option<String>,
    /// Monotonic per sender; heartbeat only.
    pub nonce: Option<u64>,
}

impl Envelope {
    fn base(kind: EnvelopeKind, from: PeerId, to: Option<PeerId>) -> Self {
        Envelope {
            kind,
            from,
            to,
            sdp: None,
            candidate: None,
            reason: None,
            nonce: None,
        }
    }

    pub fn join(from: PeerId) -> Self {
        Envelope::base(EnvelopeKind::Join, from, None)
    }

    pub fn leave(from: PeerId, to: PeerId, reason: impl Into<String>) -> Self {
        let mut env = Envelope::base(EnvelopeKind::Leave, from, Some(to));
        env.reason = Some(reason.into());
        env
    }

    pub fn offer(from: PeerId, to: PeerId, sdp: impl Into<String>) -> Self {
        let mut env = Envelope::base(EnvelopeKind::Offer, from, Some(to));
        env.sdp = Some(sdp.into());
        env
    }

    pub fn answer(from: PeerId, to: PeerId, sdp: impl Into<String>) -> Self {
        let mut env = Envelope::base(EnvelopeKind::Answer, from, Some(to));
        env.sdp = Some(sdp.into());
        env
    }

    pub fn candidate(from: PeerId, to: PeerId, candidate: Candidate) -> Self {
        let mut env = Envelope::base(EnvelopeKind::Candidate, from, Some(to));
        env.candidate = Some(candidate);
        env
    }

    pub fn heartbeat(from: PeerId, to: PeerId, nonce: u64) -> Self {
        let mut env = Envelope::base(EnvelopeKind::Heartbeat, from, Some(to));
        env.nonce = Some(nonce);
        env
    }

    pub fn error(from: PeerId, to: PeerId, reason: impl Into<String>) -> Self {
        let mut env = Envelope::base(EnvelopeKind::Error, from, Some(to));
        env.reason = Some(reason.into());
        env
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("envelope is not valid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("envelope has no type")]
    MissingKind,
    #[error("envelope has no sender id")]
    MissingFrom,
    #[error("{kind} envelope has no recipient id")]
    MissingTo { kind: String },
    #[error("{kind} envelope is missing {field}")]
    MissingField { kind: String, field: &'static str },
    #[error("{kind} envelope carries unexpected {field}")]
    ConflictingField { kind: String, field: &'static str },
    #[error("candidate mline index {0:?} is not an integer")]
    BadMlineIndex(String),
}

/// `sdpMlineIndex` arrives as an integer from current producers and as a
/// decimal string from legacy ones.
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum WireMlineIndex {
    Int(i32),
    Text(String),
}

#[derive(Serialize, Deserialize)]
struct WireCandidate {
    candidate: String,
    #[serde(rename = "sdpMid", skip_serializing_if = "Option::is_none")]
    sdp_mid: Option<String>,
    #[serde(rename = "sdpMlineIndex", skip_serializing_if = "Option::is_none")]
    sdp_mline_index: Option<WireMlineIndex>,
}

/// Field order here is the canonical order on the wire; serde_json emits
/// struct fields in declaration order, which keeps `encode` byte-stable.
#[derive(Serialize, Deserialize)]
struct WireEnvelope {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sdp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    candidate: Option<WireCandidate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    nonce: Option<u64>,
}

pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(&to_wire(envelope))
}

pub fn encode_text(envelope: &Envelope) -> Result<String, serde_json::Error> {
    serde_json::to_string(&to_wire(envelope))
}

fn to_wire(envelope: &Envelope) -> WireEnvelope {
    WireEnvelope {
        kind: Some(envelope.kind.as_wire().to_string()),
        from: Some(envelope.from.as_str().to_string()),
        to: envelope.to.as_ref().map(|to| to.as_str().to_string()),
        sdp: envelope.sdp.clone(),
        candidate: envelope.candidate.as_ref().map(|c| WireCandidate {
            candidate: c.sdp.clone(),
            sdp_mid: Some(c.mid.clone()),
            sdp_mline_index: Some(WireMlineIndex::Int(c.mline_index)),
        }),
        reason: envelope.reason.clone(),
        nonce: envelope.nonce,
    }
}

pub fn decode(bytes: &[u8]) -> Result<Envelope, DecodeError> {
    let wire: WireEnvelope = serde_json::from_slice(bytes)?;

    let kind = match wire.kind.as_deref() {
        Some(kind) if !kind.is_empty() => EnvelopeKind::from_wire(kind),
        _ => return Err(DecodeError::MissingKind),
    };
    let from = match wire.from {
        Some(from) if !from.is_empty() => PeerId::new(from),
        _ => return Err(DecodeError::MissingFrom),
    };
    let to = wire.to.filter(|to| !to.is_empty()).map(PeerId::new);

    let candidate = match wire.candidate {
        Some(c) => Some(decode_candidate(c)?),
        None => None,
    };

    let envelope = Envelope {
        kind,
        from,
        to,
        sdp: wire.sdp,
        candidate,
        reason: wire.reason,
        nonce: wire.nonce,
    };
    validate(&envelope)?;
    Ok(envelope)
}

fn decode_candidate(wire: WireCandidate) -> Result<Candidate, DecodeError> {
    let mline_index = match wire.sdp_mline_index {
        Some(WireMlineIndex::Int(index)) => index,
        Some(WireMlineIndex::Text(text)) => text
            .trim()
            .parse::<i32>()
            .map_err(|_| DecodeError::BadMlineIndex(text))?,
        None => 0,
    };
    Ok(Candidate {
        mid: wire.sdp_mid.unwrap_or_default(),
        mline_index,
        sdp: wire.candidate,
    })
}

/// The kind determines which optional fields may appear; anything else is a
/// decode failure, not a crash.
fn validate(envelope: &Envelope) -> Result<(), DecodeError> {
    use EnvelopeKind::*;

    let kind = envelope.kind.as_wire().to_string();
    let requires_to = !matches!(envelope.kind, Join | Unknown(_));
    if requires_to && envelope.to.is_none() {
        return Err(DecodeError::MissingTo { kind });
    }

    let (sdp, candidate, reason, nonce) = match &envelope.kind {
        Offer | Answer => (true, false, false, false),
        Candidate => (false, true, false, false),
        Leave | Error => (false, false, true, false),
        Heartbeat => (false, false, false, true),
        Join => (false, false, false, false),
        Unknown(_) => return Ok(()),
    };

    let checks: [(&'static str, bool, bool); 4] = [
        ("sdp", sdp, envelope.sdp.is_some()),
        ("candidate", candidate, envelope.candidate.is_some()),
        ("reason", reason, envelope.reason.is_some()),
        ("nonce", nonce, envelope.nonce.is_some()),
    ];
    for (field, allowed, present) in checks {
        if present && !allowed {
            return Err(DecodeError::ConflictingField {
                kind: kind.clone(),
                field,
            });
        }
    }

    // Reason and nonce are optional even where allowed; sdp and candidate
    // are the payload of their kinds and must be present.
    if sdp && envelope.sdp.is_none() {
        return Err(DecodeError::MissingField {
            kind: kind.clone(),
            field: "sdp",
        });
    }
    if candidate && envelope.candidate.is_none() {
        return Err(DecodeError::MissingField {
            kind,
            field: "candidate",
        });
    }
    Ok(())
}
