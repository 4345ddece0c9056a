//! Roaming-tolerant relay bridging a browser SSH frontend to a TCP backend
//! it cannot reach directly. The frontend obtains a session over HTTP
//! (`/proxy`), then streams over a WebSocket (`/connect`) carrying a 4-byte
//! cumulative-ack header on every binary frame. When the WebSocket drops the
//! frontend reconnects with its last `(ack, pos)` and resumes the same byte
//! stream without loss or duplication; the backend TCP socket stays up.
//!
//! Usage: relay-ws-bridge <bind-port> [external-redirect]

use std::collections::HashMap;
use std::env;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Notify};
use tokio::time;
use tracing::{debug, info, warn};
use uuid::Uuid;

// ── Wire constants ──────────────────────────────────────────────────

/// Every binary frame starts with a signed 32-bit big-endian cumulative ack.
const ACK_HEADER_LEN: usize = 4;

/// Ack sentinel meaning "session closed by sender"; only the relay emits it.
const CLOSE_SENTINEL: i64 = -1;

/// When the relay's view of the forwarded stream runs this far past the
/// frontend's `pos`, an empty fragment is pushed so the frontend learns of
/// the relay's progress without waiting for backend data.
const FRIENDLY_RELEASE_THRESHOLD: i64 = 1024 * 1024;

// ── Constants ───────────────────────────────────────────────────────

const BACKEND_READ_BUF: usize = 65536;
// Defaults; overridable via RELAY_ORPHAN_TIMEOUT_MS / RELAY_SWEEP_INTERVAL_MS.
const ORPHAN_TIMEOUT_MS: u64 = 60_000;
const SWEEP_INTERVAL_MS: u64 = 5_000;

// ── Frame codec ─────────────────────────────────────────────────────

/// Internal counters are 64-bit; the wire ack is truncated to i32.
fn encode_frame(ack: i64, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(ACK_HEADER_LEN + payload.len());
    frame.extend_from_slice(&(ack as i32).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Split a frame into (ack, payload). None for frames shorter than the header.
fn decode_frame(frame: &[u8]) -> Option<(i32, &[u8])> {
    if frame.len() < ACK_HEADER_LEN {
        return None;
    }
    let ack = i32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
    Some((ack, &frame[ACK_HEADER_LEN..]))
}

// ── Retransmission buffer ───────────────────────────────────────────

/// Sliding window over one direction of the relayed stream: the contiguous
/// suffix `[end_offset - len, end_offset)` that the peer has not yet
/// acknowledged. `end_offset` counts every byte ever appended, so for the
/// backend-to-frontend buffer it doubles as `backend_bytes_read`.
struct ReplayBuffer {
    data: Vec<u8>,
    end_offset: u64,
}

impl ReplayBuffer {
    fn new() -> Self {
        Self {
            data: Vec::new(),
            end_offset: 0,
        }
    }

    fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
        self.end_offset += bytes.len() as u64;
    }

    fn len(&self) -> usize {
        self.data.len()
    }

    /// Absolute offset of the first byte still held.
    fn start_offset(&self) -> u64 {
        self.end_offset - self.len() as u64
    }

    fn end_offset(&self) -> u64 {
        self.end_offset
    }

    /// Retain only `[ack, end_offset)`. False when the ack falls outside the
    /// window: above what was ever appended, or below the trimmed left edge.
    /// `ack == end_offset` leaves the buffer empty.
    fn trim_to(&mut self, ack: i64) -> bool {
        if ack > self.end_offset as i64 || ack < self.start_offset() as i64 {
            return false;
        }
        let keep = (self.end_offset as i64 - ack) as usize;
        let drop = self.data.len() - keep;
        self.data.drain(..drop);
        true
    }

    /// Suffix starting at absolute `offset`. `offset == end_offset` yields an
    /// empty slice, never the whole buffer.
    fn tail_from(&self, offset: u64) -> &[u8] {
        debug_assert!(offset >= self.start_offset() && offset <= self.end_offset);
        let keep = (self.end_offset - offset) as usize;
        &self.data[self.data.len() - keep..]
    }
}

// ── Inbound payload dedup ───────────────────────────────────────────

/// Suffix of `payload` past what was already forwarded to the backend.
/// `pos` is the frontend's stream offset *after* this payload; an overlap at
/// or below zero means every byte was seen before (a resume replaying old
/// data) and nothing is forwarded.
fn unseen_suffix<'a>(payload: &'a [u8], pos: u64, backend_bytes_written: u64) -> &'a [u8] {
    let overlap = pos as i64 - backend_bytes_written as i64;
    if overlap <= 0 {
        return &[];
    }
    let take = (overlap as usize).min(payload.len());
    &payload[payload.len() - take..]
}

// ── Frontend connection adapter ─────────────────────────────────────

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

/// Write side of an adopted WebSocket. The id distinguishes a stale
/// connection's late events from the current attachment's.
struct FrontendLink {
    id: u64,
    sink: Mutex<SplitSink<WebSocket, Message>>,
}

impl FrontendLink {
    fn new(sink: SplitSink<WebSocket, Message>) -> Self {
        Self {
            id: NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed),
            sink: Mutex::new(sink),
        }
    }

    /// Ship one ack-framed fragment. False once the socket is gone.
    async fn send_fragment(&self, ack: i64, payload: &[u8]) -> bool {
        let mut sink = self.sink.lock().await;
        sink.send(Message::Binary(encode_frame(ack, payload)))
            .await
            .is_ok()
    }

    /// Eviction signal: sentinel ack, then WebSocket close. Idempotent in
    /// effect; a second call fails silently on the closed socket.
    async fn protocol_close(&self) {
        let mut sink = self.sink.lock().await;
        let _ = sink
            .send(Message::Binary(encode_frame(CLOSE_SENTINEL, &[])))
            .await;
        let _ = sink.send(Message::Close(None)).await;
    }
}

/// Sentinel-then-close for a socket that was never adopted (unknown session,
/// malformed parameters, or a WS upgrade aimed at the wrong path).
async fn close_unattached(mut socket: WebSocket) {
    let _ = socket
        .send(Message::Binary(encode_frame(CLOSE_SENTINEL, &[])))
        .await;
    let _ = socket.send(Message::Close(None)).await;
}

// ── Session ─────────────────────────────────────────────────────────

/// The frontend currently attached to a session, with the session-layer
/// `pos`: the absolute offset of the next byte it will send.
struct Frontend {
    link: Arc<FrontendLink>,
    pos: u64,
}

struct SessionInner {
    backend: OwnedWriteHalf,
    /// Bytes forwarded into the backend socket so far; the absolute offset
    /// of the next frontend byte the backend has not seen.
    backend_bytes_written: u64,
    /// Unacked suffix of the backend-to-frontend stream. Its `end_offset`
    /// is the count of bytes read from the backend.
    b2f_unacked: ReplayBuffer,
    frontend: Option<Frontend>,
    /// Set on the first `/connect` naming this session, successful or not.
    /// Sessions that never see one are reclaimed by the orphan sweeper.
    adopt_attempted: bool,
}

impl SessionInner {
    fn is_attached(&self, link_id: u64) -> bool {
        self.frontend.as_ref().map(|fe| fe.link.id) == Some(link_id)
    }
}

/// One backend TCP socket plus a sequence of frontend WebSocket attachments
/// sharing a session id. Every event that touches the counters, the buffer,
/// or the attachment is serialized behind `inner`.
struct Session {
    id: String,
    created: Instant,
    /// Fired by the orphan sweeper; the backend read task shuts down on it.
    shutdown: Notify,
    inner: Mutex<SessionInner>,
}

impl Session {
    fn new(id: String, backend: OwnedWriteHalf) -> Self {
        Self {
            id,
            created: Instant::now(),
            shutdown: Notify::new(),
            inner: Mutex::new(SessionInner {
                backend,
                backend_bytes_written: 0,
                b2f_unacked: ReplayBuffer::new(),
                frontend: None,
                adopt_attempted: false,
            }),
        }
    }

    /// Install `link` as the attached frontend, evicting any prior one.
    /// Returns false when the attachment was refused; the link has already
    /// received its protocol close in that case.
    async fn adopt(&self, link: Arc<FrontendLink>, ack: u64, pos: u64) -> bool {
        let mut inner = self.inner.lock().await;
        inner.adopt_attempted = true;

        if let Some(prev) = inner.frontend.take() {
            debug!(sid = %self.id, old = prev.link.id, new = link.id, "evicting frontend");
            prev.link.protocol_close().await;
        }

        if pos > inner.backend_bytes_written {
            warn!(
                sid = %self.id,
                pos,
                written = inner.backend_bytes_written,
                "frontend claims to have sent bytes the relay never received"
            );
            link.protocol_close().await;
            return false;
        }

        if !inner.b2f_unacked.trim_to(ack as i64) {
            warn!(
                sid = %self.id,
                ack,
                end = inner.b2f_unacked.end_offset(),
                "resume ack outside the retransmission window"
            );
            link.protocol_close().await;
            return false;
        }

        // Resume transmission: after the trim the buffer holds exactly the
        // bytes the frontend is missing. Sent as one fragment, possibly empty.
        let resume = inner.b2f_unacked.tail_from(ack).to_vec();
        let ack_out = inner.backend_bytes_written.min(pos) as i64;
        inner.frontend = Some(Frontend {
            link: Arc::clone(&link),
            pos,
        });
        link.send_fragment(ack_out, &resume).await;
        true
    }

    /// One binary frame from the attached frontend: advance `pos`, forward
    /// the unseen payload suffix, apply the ack, maybe emit a friendly
    /// release. Frames from a stale connection are ignored.
    async fn on_frontend_frame(&self, link_id: u64, frame: &[u8]) {
        let mut inner = self.inner.lock().await;
        if !inner.is_attached(link_id) {
            return;
        }

        let Some((ack, payload)) = decode_frame(frame) else {
            warn!(sid = %self.id, "binary frame shorter than the ack header");
            self.evict(&mut inner).await;
            return;
        };

        let (pos, link) = match inner.frontend.as_mut() {
            Some(fe) => {
                fe.pos += payload.len() as u64;
                (fe.pos, Arc::clone(&fe.link))
            }
            None => return,
        };

        let unseen = unseen_suffix(payload, pos, inner.backend_bytes_written);
        if !unseen.is_empty() {
            if let Err(err) = inner.backend.write_all(unseen).await {
                // Backend teardown converges on the read task's close path.
                warn!(sid = %self.id, %err, "backend write failed");
            }
            inner.backend_bytes_written += unseen.len() as u64;
        }

        if !inner.b2f_unacked.trim_to(i64::from(ack)) {
            warn!(
                sid = %self.id,
                ack,
                end = inner.b2f_unacked.end_offset(),
                "frame ack outside the retransmission window"
            );
            self.evict(&mut inner).await;
            return;
        }

        if inner.backend_bytes_written as i64 - pos as i64 > FRIENDLY_RELEASE_THRESHOLD {
            let ack_out = inner.backend_bytes_written.min(pos) as i64;
            link.send_fragment(ack_out, &[]).await;
        }
    }

    /// The protocol is binary-only; a text frame evicts the sender.
    async fn on_frontend_text(&self, link_id: u64) {
        let mut inner = self.inner.lock().await;
        if !inner.is_attached(link_id) {
            return;
        }
        warn!(sid = %self.id, "text frame on a binary-only protocol");
        self.evict(&mut inner).await;
    }

    /// A close event for an evicted connection must not detach its
    /// replacement, so the link identity is checked before clearing.
    async fn on_frontend_close(&self, link_id: u64) {
        let mut inner = self.inner.lock().await;
        if inner.is_attached(link_id) {
            debug!(sid = %self.id, link = link_id, "frontend detached");
            inner.frontend = None;
        }
    }

    /// Bytes read from the backend: buffer them for retransmission and push
    /// one fragment to the attached frontend, if any. The emitted ack never
    /// exceeds the frontend's self-declared `pos`.
    async fn on_backend_data(&self, data: &[u8]) {
        let mut inner = self.inner.lock().await;
        inner.b2f_unacked.append(data);
        if let Some(fe) = &inner.frontend {
            let ack_out = inner.backend_bytes_written.min(fe.pos) as i64;
            fe.link.send_fragment(ack_out, data).await;
        }
    }

    /// Backend close, clean or errored, is terminal for the session.
    async fn on_backend_close(&self, state: &AppState) {
        state.registry.remove(&self.id).await;
        let mut inner = self.inner.lock().await;
        self.evict(&mut inner).await;
    }

    async fn evict(&self, inner: &mut SessionInner) {
        if let Some(fe) = inner.frontend.take() {
            fe.link.protocol_close().await;
        }
    }
}

/// Pump backend bytes into the session until the socket closes, errors, or
/// the orphan sweeper fires the shutdown notifier. This task is the only
/// teardown path, so registry removal happens exactly once.
async fn run_backend(session: Arc<Session>, mut backend: OwnedReadHalf, state: Arc<AppState>) {
    let mut buf = vec![0u8; BACKEND_READ_BUF];
    loop {
        tokio::select! {
            result = backend.read(&mut buf) => match result {
                Ok(0) => break,
                Ok(n) => session.on_backend_data(&buf[..n]).await,
                Err(err) => {
                    debug!(sid = %session.id, %err, "backend read failed");
                    break;
                }
            },
            _ = session.shutdown.notified() => break,
        }
    }
    info!(sid = %session.id, "backend closed; session removed");
    session.on_backend_close(&state).await;
}

// ── Session registry ────────────────────────────────────────────────

/// Process-wide map from session id to session. One mutex, held only for
/// insert, delete, and lookup.
struct Registry {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl Registry {
    fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    async fn insert(&self, session: Arc<Session>) {
        self.sessions
            .lock()
            .await
            .insert(session.id.clone(), session);
    }

    async fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.lock().await.get(id).cloned()
    }

    async fn remove(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.lock().await.remove(id)
    }

    async fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.lock().await.values().cloned().collect()
    }
}

/// A session is reclaimable only when no `/connect` ever named it, nothing
/// is attached, and it has sat past the timeout since creation.
fn orphaned(adopt_attempted: bool, has_frontend: bool, age: Duration, timeout: Duration) -> bool {
    !adopt_attempted && !has_frontend && age >= timeout
}

/// Reclaim sessions whose `/proxy` succeeded but that no `/connect` ever
/// named. Without this, a frontend that gives up after session creation
/// would leak the backend socket until the backend times out on its own.
async fn sweep_orphans(state: Arc<AppState>, sweep_interval: Duration) {
    let mut interval = time::interval(sweep_interval);
    loop {
        interval.tick().await;
        for session in state.registry.snapshot().await {
            let inner = session.inner.lock().await;
            let reclaim = orphaned(
                inner.adopt_attempted,
                inner.frontend.is_some(),
                session.created.elapsed(),
                state.orphan_timeout,
            );
            drop(inner);
            if reclaim {
                info!(sid = %session.id, "reclaiming never-attached session");
                session.shutdown.notify_one();
            }
        }
    }
}

// ── HTTP endpoints ──────────────────────────────────────────────────

struct AppState {
    registry: Registry,
    external_redirect: Option<String>,
    orphan_timeout: Duration,
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/cookie", get(cookie))
        .route("/proxy", get(proxy))
        .route("/connect", get(connect))
        .fallback(fallback)
        .with_state(state)
}

#[derive(Deserialize, Default)]
struct CookieQuery {
    ext: Option<String>,
    path: Option<String>,
}

fn cookie_location(ext: &str, path: &str, host: &str) -> String {
    format!("chrome-extension://{ext}/{path}#ignored@{host}")
}

/// Relay selection: redirect the extension back into itself with the host
/// it should open its WebSocket to.
async fn cookie(
    ws: Option<WebSocketUpgrade>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    query: Option<Query<CookieQuery>>,
) -> Response {
    if let Some(ws) = ws {
        return ws.on_upgrade(close_unattached);
    }
    let query = query.map(|q| q.0).unwrap_or_default();
    let (ext, path) = match (query.ext, query.path) {
        (Some(ext), Some(path)) if !ext.is_empty() && !path.is_empty() => (ext, path),
        _ => return (StatusCode::BAD_REQUEST, "missing ext or path parameter").into_response(),
    };
    let host = match &state.external_redirect {
        Some(host) => host.clone(),
        None => match headers.get(header::HOST).and_then(|h| h.to_str().ok()) {
            Some(host) => host.to_string(),
            None => return (StatusCode::BAD_REQUEST, "missing Host header").into_response(),
        },
    };
    Response::builder()
        .status(StatusCode::FOUND)
        .header(header::LOCATION, cookie_location(&ext, &path, &host))
        .body(Body::empty())
        .unwrap_or_default()
}

#[derive(Deserialize, Default)]
struct ProxyQuery {
    host: Option<String>,
    port: Option<String>,
}

/// Open a backend TCP connection and mint a session for it. The body of the
/// 200 is the session id the frontend passes to `/connect`.
async fn proxy(
    ws: Option<WebSocketUpgrade>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    query: Option<Query<ProxyQuery>>,
) -> Response {
    if let Some(ws) = ws {
        return ws.on_upgrade(close_unattached);
    }
    let query = query.map(|q| q.0).unwrap_or_default();
    let Some(host) = query.host.filter(|h| !h.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "missing host parameter").into_response();
    };
    let Some(port) = query.port.as_deref().and_then(|p| p.parse::<u16>().ok()) else {
        return (StatusCode::BAD_REQUEST, "missing or non-numeric port parameter").into_response();
    };

    let stream = match TcpStream::connect((host.as_str(), port)).await {
        Ok(stream) => stream,
        Err(err) => {
            warn!(%host, port, %err, "backend connect failed");
            return (StatusCode::BAD_GATEWAY, "backend connect failed").into_response();
        }
    };

    let id = Uuid::new_v4().to_string();
    let (read_half, write_half) = stream.into_split();
    let session = Arc::new(Session::new(id.clone(), write_half));
    state.registry.insert(Arc::clone(&session)).await;
    tokio::spawn(run_backend(session, read_half, Arc::clone(&state)));
    info!(sid = %id, %host, port, "session opened");

    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain");
    if let Some(origin) = headers.get(header::ORIGIN) {
        response = response
            .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin.clone())
            .header(header::ACCESS_CONTROL_ALLOW_CREDENTIALS, "true");
    }
    response.body(Body::from(id)).unwrap_or_default()
}

#[derive(Deserialize, Default)]
struct ConnectQuery {
    sid: Option<String>,
    ack: Option<String>,
    pos: Option<String>,
}

/// Strict parse of the resume parameters. Absent or non-numeric values are
/// refused rather than treated as zero; lenience here corrupts the stream
/// silently.
fn parse_connect_params(query: Option<ConnectQuery>) -> Option<(String, u64, u64)> {
    let query = query?;
    let sid = query.sid.filter(|s| !s.is_empty())?;
    let ack = query.ack.as_deref()?.parse::<u64>().ok()?;
    let pos = query.pos.as_deref()?.parse::<u64>().ok()?;
    Some((sid, ack, pos))
}

/// The frontend retries forever on a refused upgrade, so the upgrade is
/// always accepted; refusal is expressed in-protocol after the handshake.
async fn connect(
    State(state): State<Arc<AppState>>,
    query: Option<Query<ConnectQuery>>,
    ws: WebSocketUpgrade,
) -> Response {
    let query = query.map(|q| q.0);
    ws.on_upgrade(move |socket| drive_frontend(socket, state, query))
}

async fn drive_frontend(socket: WebSocket, state: Arc<AppState>, query: Option<ConnectQuery>) {
    let Some((sid, ack, pos)) = parse_connect_params(query) else {
        warn!("connect with missing or malformed parameters");
        return close_unattached(socket).await;
    };
    let Some(session) = state.registry.get(&sid).await else {
        debug!(%sid, "connect for unknown session");
        return close_unattached(socket).await;
    };

    let (sink, mut stream) = socket.split();
    let link = Arc::new(FrontendLink::new(sink));
    if !session.adopt(Arc::clone(&link), ack, pos).await {
        return;
    }
    debug!(%sid, link = link.id, ack, pos, "frontend attached");

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Binary(frame)) => session.on_frontend_frame(link.id, &frame).await,
            Ok(Message::Text(_)) => {
                session.on_frontend_text(link.id).await;
                break;
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {} // ping/pong handled by the transport
        }
    }
    session.on_frontend_close(link.id).await;
}

async fn fallback(ws: Option<WebSocketUpgrade>) -> Response {
    match ws {
        Some(ws) => ws.on_upgrade(close_unattached),
        None => (StatusCode::NOT_FOUND, "Unknown endpoint").into_response(),
    }
}

// ── Main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();
    // relay-ws-bridge <bind-port> [external-redirect]
    if args.len() < 2 {
        eprintln!("Usage: relay-ws-bridge <bind-port> [external-redirect]");
        process::exit(1);
    }
    let port: u16 = args[1].parse().unwrap_or_else(|_| {
        eprintln!("relay-ws-bridge: invalid bind port {:?}", args[1]);
        process::exit(1);
    });
    let external_redirect = args.get(2).cloned();

    init_tracing();

    let orphan_timeout = Duration::from_millis(env_ms("RELAY_ORPHAN_TIMEOUT_MS", ORPHAN_TIMEOUT_MS));
    let sweep_interval = Duration::from_millis(env_ms("RELAY_SWEEP_INTERVAL_MS", SWEEP_INTERVAL_MS));

    let state = Arc::new(AppState {
        registry: Registry::new(),
        external_redirect,
        orphan_timeout,
    });
    tokio::spawn(sweep_orphans(Arc::clone(&state), sweep_interval));

    let listener = match TcpListener::bind(("0.0.0.0", port)).await {
        Ok(listener) => listener,
        Err(err) => {
            eprintln!("relay-ws-bridge: failed to bind 0.0.0.0:{port}: {err}");
            process::exit(1);
        }
    };
    info!(port, "relay listening");

    if let Err(err) = axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        eprintln!("relay-ws-bridge: server error: {err}");
        process::exit(1);
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Millisecond duration from the environment, falling back on the default.
fn env_ms(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
}

// ── Unit tests ──────────────────────────────────────────────────────
