//! Persistent duplex text stream to the signaling service.
//!
//! One task owns the websocket. It reconnects with jittered exponential
//! backoff until `close` is called, drains the bounded outbound backlog
//! whenever the stream is open, and posts decoded envelopes (and link state
//! changes) to the dispatcher queue. An authentication rejection on the
//! upgrade is terminal: no reconnect, `closed("auth")`.

pub mod backlog;
pub mod backoff;
pub mod mock;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::{Sink, SinkExt, StreamExt};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::config::{BackoffConfig, CoreConfig, DEFAULT_BACKLOG_CAPACITY};
use crate::dispatch::{Event, EventQueue, LinkEvent};
use crate::signal::{self, Envelope};

use backlog::{Backlog, PushOutcome};
use backoff::Backoff;

/// Reason reported when the peer drops the stream without a close frame.
const REASON_STREAM_LOST: &str = "stream_lost";
const REASON_AUTH: &str = "auth";

/// What the worker needs from a signaling link. The websocket implementation
/// lives in [`WsLink`]; tests capture outbound envelopes with
/// [`mock::CapturedLink`].
pub trait Link: Send + Sync {
    /// Non-blocking; queues while the stream is down.
    fn send(&self, envelope: Envelope);
    /// Graceful shutdown; the terminal `closed` event follows.
    fn close(&self, reason: &str);
}

#[derive(Clone, Debug)]
pub struct LinkConfig {
    pub uri: String,
    pub token: Option<String>,
    pub backoff: BackoffConfig,
    pub ca_bundle_path: Option<PathBuf>,
    pub backlog_capacity: usize,
}

impl LinkConfig {
    pub fn from_core(config: &CoreConfig) -> Self {
        LinkConfig {
            uri: config.signaling_uri.clone(),
            token: config.signaling_token.clone(),
            backoff: config.backoff.clone(),
            ca_bundle_path: config.ca_bundle_path.clone(),
            backlog_capacity: DEFAULT_BACKLOG_CAPACITY,
        }
    }
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("invalid signaling uri: {0}")]
    BadUri(String),
    #[error("trust store unavailable: {0}")]
    Trust(String),
}

struct ShutdownGate {
    requested: AtomicBool,
    reason: Mutex<Option<String>>,
    notify: Notify,
}

impl ShutdownGate {
    fn new() -> Self {
        ShutdownGate {
            requested: AtomicBool::new(false),
            reason: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    fn request(&self, reason: &str) {
        {
            let mut guard = self.reason.lock();
            if guard.is_none() {
                *guard = Some(reason.to_string());
            }
        }
        self.requested.store(true, Ordering::Release);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    fn reason(&self) -> String {
        self.reason.lock().clone().unwrap_or_else(|| "closed".into())
    }
}

pub struct WsLink {
    backlog: Arc<Backlog>,
    events: EventQueue,
    shutdown: Arc<ShutdownGate>,
}

impl WsLink {
    pub fn spawn(
        config: LinkConfig,
        events: EventQueue,
        handle: &tokio::runtime::Handle,
    ) -> Arc<WsLink> {
        let backlog = Arc::new(Backlog::new(config.backlog_capacity));
        let shutdown = Arc::new(ShutdownGate::new());
        let link = Arc::new(WsLink {
            backlog: backlog.clone(),
            events: events.clone(),
            shutdown: shutdown.clone(),
        });
        handle.spawn(run_link(config, backlog, events, shutdown));
        link
    }
}

impl Link for WsLink {
    fn send(&self, envelope: Envelope) {
        if self.shutdown.is_requested() {
            return;
        }
        if self.backlog.push(envelope) == PushOutcome::DroppedOldest {
            tracing::warn!(
                target: "link",
                queued = self.backlog.len(),
                "outbound backlog overflow; dropped oldest envelope"
            );
            self.events.post(Event::Link(LinkEvent::Error {
                message: "signaling backlog overflow".into(),
            }));
        }
    }

    fn close(&self, reason: &str) {
        self.shutdown.request(reason);
    }
}

async fn run_link(
    config: LinkConfig,
    backlog: Arc<Backlog>,
    events: EventQueue,
    shutdown: Arc<ShutdownGate>,
) {
    let url = match connect_url(&config) {
        Ok(url) => url,
        Err(err) => {
            events.post(Event::Link(LinkEvent::Error {
                message: err.to_string(),
            }));
            events.post(Event::Link(LinkEvent::Closed {
                reason: "config".into(),
            }));
            return;
        }
    };
    let tls = match tls_config(&config, &url) {
        Ok(tls) => tls,
        Err(err) => {
            events.post(Event::Link(LinkEvent::Error {
                message: err.to_string(),
            }));
            events.post(Event::Link(LinkEvent::Closed {
                reason: "config".into(),
            }));
            return;
        }
    };

    let mut backoff = Backoff::new(config.backoff.clone());
    loop {
        if shutdown.is_requested() {
            events.post(Event::Link(LinkEvent::Closed {
                reason: shutdown.reason(),
            }));
            return;
        }

        tracing::debug!(target: "link", url = %redacted(&url), "connecting to signaling");
        let connector = tls.clone().map(Connector::Rustls);
        match connect_async_tls_with_config(url.as_str(), None, false, connector).await {
            Ok((stream, _response)) => {
                backoff.reset();
                tracing::info!(target: "link", "signaling stream open");
                events.post(Event::Link(LinkEvent::Opened));
                let reason = drive(stream, &backlog, &events, &shutdown).await;
                tracing::info!(target: "link", reason = %reason, "signaling stream closed");
                events.post(Event::Link(LinkEvent::Closed { reason }));
                if shutdown.is_requested() {
                    return;
                }
            }
            Err(err) => {
                if is_auth_rejection(&err) {
                    tracing::error!(target: "link", error = %err, "signaling authentication rejected");
                    events.post(Event::Link(LinkEvent::Error {
                        message: format!("authentication rejected: {err}"),
                    }));
                    events.post(Event::Link(LinkEvent::Closed {
                        reason: REASON_AUTH.into(),
                    }));
                    return;
                }
                tracing::warn!(target: "link", error = %err, "signaling connect failed");
                events.post(Event::Link(LinkEvent::Error {
                    message: format!("connect failed: {err}"),
                }));
            }
        }

        let delay = backoff.next_delay();
        tracing::debug!(target: "link", delay_ms = delay.as_millis() as u64, "backing off");
        tokio::select! {
            _ = sleep(delay) => {}
            _ = shutdown.notify.notified() => {}
        }
    }
}

/// Pumps one open websocket until it drops or shutdown is requested.
/// Returns the close reason.
async fn drive(
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    backlog: &Backlog,
    events: &EventQueue,
    shutdown: &ShutdownGate,
) -> String {
    let (mut write, mut read) = stream.split();

    // Anything queued while we were down goes out first.
    if let Some(reason) = flush_backlog(&mut write, backlog).await {
        return reason;
    }

    loop {
        if shutdown.is_requested() {
            let _ = write.send(Message::Close(None)).await;
            return shutdown.reason();
        }
        tokio::select! {
            _ = shutdown.notify.notified() => {
                let _ = write.send(Message::Close(None)).await;
                return shutdown.reason();
            }
            _ = backlog.wait() => {
                if let Some(reason) = flush_backlog(&mut write, backlog).await {
                    return reason;
                }
            }
            message = read.next() => match message {
                Some(Ok(Message::Text(text))) => handle_incoming(text.as_bytes(), events),
                Some(Ok(Message::Binary(data))) => handle_incoming(&data, events),
                Some(Ok(Message::Close(frame))) => {
                    return frame
                        .map(|frame| frame.reason.to_string())
                        .filter(|reason| !reason.is_empty())
                        .unwrap_or_else(|| REASON_STREAM_LOST.to_string());
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => return format!("stream error: {err}"),
                None => return REASON_STREAM_LOST.to_string(),
            }
        }
    }
}

async fn flush_backlog<S>(write: &mut S, backlog: &Backlog) -> Option<String>
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    while let Some(envelope) = backlog.pop() {
        let text = match signal::encode_text(&envelope) {
            Ok(text) => text,
            Err(err) => {
                tracing::warn!(target: "link", error = %err, "failed to encode outbound envelope");
                continue;
            }
        };
        tracing::trace!(
            target: "link",
            kind = %envelope.kind,
            to = envelope.to.as_ref().map(|to| to.as_str()).unwrap_or("*"),
            "sending envelope"
        );
        if let Err(err) = write.send(Message::Text(text)).await {
            return Some(format!("write failed: {err}"));
        }
    }
    if let Err(err) = write.flush().await {
        return Some(format!("flush failed: {err}"));
    }
    None
}

fn handle_incoming(bytes: &[u8], events: &EventQueue) {
    match signal::decode(bytes) {
        Ok(envelope) => {
            tracing::trace!(
                target: "link",
                kind = %envelope.kind,
                from = %envelope.from,
                "received envelope"
            );
            events.post(Event::Link(LinkEvent::Envelope(envelope)));
        }
        Err(err) => {
            // Malformed input never takes the link down.
            tracing::warn!(target: "link", error = %err, "dropping undecodable envelope");
        }
    }
}

fn connect_url(config: &LinkConfig) -> Result<Url, LinkError> {
    let mut url = Url::parse(&config.uri).map_err(|err| LinkError::BadUri(err.to_string()))?;
    if let Some(token) = &config.token {
        url.query_pairs_mut().append_pair("token", token);
    }
    Ok(url)
}

fn redacted(url: &Url) -> String {
    let mut shown = url.clone();
    if shown.query().is_some() {
        shown.set_query(Some("token=<redacted>"));
    }
    shown.to_string()
}

/// Builds the TLS client config for `wss` endpoints. Verification against
/// the configured trust store (or the platform store) with hostname checking
/// is always on; there is deliberately no way to turn it off.
fn tls_config(config: &LinkConfig, url: &Url) -> Result<Option<Arc<rustls::ClientConfig>>, LinkError> {
    if url.scheme() != "wss" {
        return Ok(None);
    }
    let mut roots = rustls::RootCertStore::empty();
    match &config.ca_bundle_path {
        Some(path) => {
            let pem = std::fs::read(path)
                .map_err(|err| LinkError::Trust(format!("read {}: {err}", path.display())))?;
            let mut reader = std::io::Cursor::new(pem);
            for cert in rustls_pemfile::certs(&mut reader) {
                let cert =
                    cert.map_err(|err| LinkError::Trust(format!("parse ca bundle: {err}")))?;
                roots
                    .add(cert)
                    .map_err(|err| LinkError::Trust(err.to_string()))?;
            }
        }
        None => {
            let certs = rustls_native_certs::load_native_certs()
                .map_err(|err| LinkError::Trust(err.to_string()))?;
            for cert in certs {
                roots
                    .add(cert)
                    .map_err(|err| LinkError::Trust(err.to_string()))?;
            }
        }
    }
    if roots.is_empty() {
        return Err(LinkError::Trust("trust store is empty".into()));
    }
    let tls = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Some(Arc::new(tls)))
}

fn is_auth_rejection(err: &WsError) -> bool {
    match err {
        WsError::Http(response) => {
            let status = response.status();
            status.as_u16() == 401 || status.as_u16() == 403
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(uri: &str, token: Option<&str>) -> LinkConfig {
        LinkConfig {
            uri: uri.into(),
            token: token.map(|t| t.to_string()),
            backoff: BackoffConfig::default(),
            ca_bundle_path: None,
            backlog_capacity: 4,
        }
    }

    #[test]
    fn token_is_url_encoded_into_query() {
        let url = connect_url(&config("ws://signal.example.com/realm", Some("a b+c/d="))).unwrap();
        assert_eq!(
            url.as_str(),
            "ws://signal.example.com/realm?token=a+b%2Bc%2Fd%3D"
        );
    }

    #[test]
    fn bad_uri_is_rejected() {
        assert!(matches!(
            connect_url(&config("not a uri", None)),
            Err(LinkError::BadUri(_))
        ));
    }

    #[test]
    fn plain_ws_needs_no_tls_config() {
        let cfg = config("ws://signal.example.com/realm", None);
        let url = connect_url(&cfg).unwrap();
        assert!(tls_config(&cfg, &url).unwrap().is_none());
    }

    #[test]
    fn auth_rejection_is_detected_for_401_and_403() {
        for status in [401_u16, 403] {
            let response = tokio_tungstenite::tungstenite::http::Response::builder()
                .status(status)
                .body(None)
                .unwrap();
            assert!(is_auth_rejection(&WsError::Http(response)));
        }
        assert!(!is_auth_rejection(&WsError::ConnectionClosed));
    }

    #[test]
    fn redaction_hides_the_token() {
        let url = connect_url(&config("ws://signal.example.com/realm", Some("secret"))).unwrap();
        assert!(!redacted(&url).contains("secret"));
    }
}
