//! Sync channel between the interactive surface and the execution backend.
//!
//! The server owns the shared state (pending transfers, backend cache,
//! matting gate) and serves length-prefixed protocol frames over TCP, one
//! thread per connection. The client is a small reconnecting state machine
//! the editor uses to push composites and issue queries.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use image::{GrayImage, RgbaImage};

use crate::backend::{self, CanvasBackend};
use crate::encode::{self, EncodeError};
use crate::gate::ExecutionGate;
use crate::matting::{self, MattingError, MattingFailure, Segmenter};
use crate::protocol::{self, ErrorCode, FrameError, Request, Response};
use crate::{log_err, log_info, log_warn};

/// Transfers untouched for this long are reaped.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

// ============================================================================
// PENDING TRANSFERS
// ============================================================================

/// The most recent canvas push for one node, awaiting consumption by exactly
/// one backend execution.
pub struct PendingTransfer {
    pub image: Option<RgbaImage>,
    pub mask: Option<GrayImage>,
    pub received_at: Instant,
}

/// Keyed staging area between pushes and executions. Last write wins: a
/// second push for the same node replaces the first. A take removes the
/// entry, so each transfer feeds at most one execution.
pub struct TransferStore {
    entries: Mutex<HashMap<String, PendingTransfer>>,
}

impl Default for TransferStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferStore {
    pub fn new() -> Self {
        Self { entries: Mutex::new(HashMap::new()) }
    }

    pub fn push(&self, node_id: &str, image: Option<RgbaImage>, mask: Option<GrayImage>) {
        let transfer = PendingTransfer { image, mask, received_at: Instant::now() };
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        if entries.insert(node_id.to_string(), transfer).is_some() {
            log_info!("Replaced unconsumed transfer for node {}", node_id);
        }
    }

    /// Atomically remove and return the transfer for a node. `None` is the
    /// normal "no data" state, never an error.
    pub fn take(&self, node_id: &str) -> Option<PendingTransfer> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).remove(node_id)
    }

    /// Explicit invalidation on document reset or epoch change.
    pub fn discard(&self, node_id: &str) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(node_id)
            .is_some()
    }

    /// Remove entries idle longer than the timeout. Returns how many were
    /// dropped.
    pub fn reap(&self, idle_timeout: Duration) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        let before = entries.len();
        entries.retain(|_, t| t.received_at.elapsed() < idle_timeout);
        let dropped = before - entries.len();
        if dropped > 0 {
            log_info!("Reaped {} stale transfer(s)", dropped);
        }
        dropped
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug)]
pub enum SyncError {
    Io(io::Error),
    Frame(FrameError),
    Encode(EncodeError),
    /// The server answered with an error status or unexpected message.
    Rejected(String),
    /// Reconnection failed too many times in a row.
    GaveUp,
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::Io(e) => write!(f, "Sync I/O error: {}", e),
            SyncError::Frame(e) => write!(f, "Sync framing error: {}", e),
            SyncError::Encode(e) => write!(f, "Sync encoding error: {}", e),
            SyncError::Rejected(m) => write!(f, "Server rejected request: {}", m),
            SyncError::GaveUp => write!(f, "Gave up reconnecting to the sync server"),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<io::Error> for SyncError {
    fn from(e: io::Error) -> Self {
        SyncError::Io(e)
    }
}

impl From<FrameError> for SyncError {
    fn from(e: FrameError) -> Self {
        SyncError::Frame(e)
    }
}

impl From<EncodeError> for SyncError {
    fn from(e: EncodeError) -> Self {
        SyncError::Encode(e)
    }
}

// ============================================================================
// SERVER
// ============================================================================

/// Everything a connection handler needs, shared across threads.
pub struct ServerState {
    pub transfers: TransferStore,
    pub backend: CanvasBackend,
    pub matting_gate: ExecutionGate,
    pub segmenter: Box<dyn Segmenter + Send + Sync>,
    pub output_dir: PathBuf,
}

impl ServerState {
    pub fn new(segmenter: Box<dyn Segmenter + Send + Sync>, output_dir: PathBuf) -> Self {
        Self {
            transfers: TransferStore::new(),
            backend: CanvasBackend::new(),
            matting_gate: ExecutionGate::new(),
            segmenter,
            output_dir,
        }
    }
}

pub struct SyncServer {
    listener: TcpListener,
    state: Arc<ServerState>,
}

impl SyncServer {
    pub fn bind(addr: impl ToSocketAddrs, state: Arc<ServerState>) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        log_info!("Sync server listening on {}", listener.local_addr()?);
        Ok(Self { listener, state })
    }

    /// The bound address; useful when binding to port 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections forever, one handler thread each.
    pub fn run(self) {
        for conn in self.listener.incoming() {
            match conn {
                Ok(stream) => {
                    let state = Arc::clone(&self.state);
                    thread::spawn(move || handle_connection(stream, state));
                }
                Err(e) => log_warn!("Failed to accept connection: {}", e),
            }
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        thread::spawn(move || self.run())
    }
}

fn handle_connection(mut stream: TcpStream, state: Arc<ServerState>) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "<unknown>".to_string());
    log_info!("Connection opened from {}", peer);

    loop {
        let request: Request = match protocol::read_frame(&mut stream) {
            Ok(req) => req,
            Err(FrameError::TooLarge { declared }) => {
                // The payload was drained; the connection stays usable.
                let resp = Response::error(
                    ErrorCode::Validation,
                    format!("frame of {} bytes exceeds the limit", declared),
                );
                if protocol::write_frame(&mut stream, &resp).is_err() {
                    break;
                }
                continue;
            }
            Err(FrameError::Json(e)) => {
                let resp =
                    Response::error(ErrorCode::Validation, format!("malformed request: {}", e));
                if protocol::write_frame(&mut stream, &resp).is_err() {
                    break;
                }
                continue;
            }
            Err(FrameError::Io(_)) => break,
        };

        let response = dispatch(request, &state);
        if let Err(e) = protocol::write_frame(&mut stream, &response) {
            log_warn!("Failed to write response to {}: {}", peer, e);
            break;
        }
    }

    log_info!("Connection from {} closed", peer);
}

fn dispatch(request: Request, state: &ServerState) -> Response {
    match request {
        Request::Push { node_id, image, mask } => handle_push(state, node_id, image, mask),
        Request::GetCanvasData { node_id } => Response::CanvasData {
            success: true,
            data: state.backend.canvas_data(&node_id),
        },
        Request::GetLatestImages { since_ms } => Response::LatestImages {
            success: true,
            images: backend::latest_output_images(&state.output_dir, since_ms),
        },
        Request::LoadImage { path } => handle_load_image(&path),
        Request::Matting { image, threshold } => {
            handle_matting(state, &image, threshold)
        }
    }
}

fn handle_push(
    state: &ServerState,
    node_id: String,
    image: Option<String>,
    mask: Option<String>,
) -> Response {
    if node_id.is_empty() {
        return Response::ack_error("", "missing node_id");
    }

    let image = match image.map(|uri| encode::decode_image_data_uri(&uri)).transpose() {
        Ok(img) => img,
        Err(e) => return Response::ack_error(node_id, format!("bad image payload: {}", e)),
    };
    let mask = match mask.map(|uri| encode::decode_mask_data_uri(&uri)).transpose() {
        Ok(m) => m,
        Err(e) => return Response::ack_error(node_id, format!("bad mask payload: {}", e)),
    };

    state.transfers.push(&node_id, image, mask);
    Response::ack_ok(node_id)
}

fn handle_load_image(path: &str) -> Response {
    match backend::load_image_from_path(std::path::Path::new(path)) {
        Ok(loaded) => Response::LoadedImage {
            success: true,
            image: Some(loaded.uri),
            width: loaded.width,
            height: loaded.height,
            error: None,
        },
        Err(e) => Response::LoadedImage {
            success: false,
            image: None,
            width: 0,
            height: 0,
            error: Some(e.to_string()),
        },
    }
}

fn handle_matting(state: &ServerState, image: &str, threshold: f32) -> Response {
    match matting::run_matting(&state.matting_gate, state.segmenter.as_ref(), image, threshold) {
        Ok(out) => Response::MattingResult {
            matted_image: out.matted_image,
            alpha_mask: out.alpha_mask,
        },
        Err(MattingFailure::Busy) => {
            Response::error(ErrorCode::Busy, "matting already running, try again later")
        }
        Err(MattingFailure::Validation(m)) => Response::error(ErrorCode::Validation, m),
        Err(MattingFailure::Engine(e)) => {
            log_err!("Matting engine failure: {}", e);
            let code = match e {
                MattingError::Unavailable(_) => ErrorCode::Dependency,
                MattingError::Network(_) => ErrorCode::Network,
                MattingError::Runtime(_) => ErrorCode::Internal,
            };
            Response::error(code, e.to_string())
        }
    }
}

// ============================================================================
// CLIENT
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
    /// Too many consecutive failures; the UI should surface this and stop
    /// retrying automatically.
    GaveUp,
}

const BACKOFF_BASE: Duration = Duration::from_millis(100);
const BACKOFF_CAP: Duration = Duration::from_secs(5);

/// Reconnecting protocol client used by the interactive surface. All calls
/// are synchronous; each request rides one frame and waits for one response.
pub struct SyncClient {
    addr: String,
    stream: Option<TcpStream>,
    state: ConnectionState,
    consecutive_failures: u32,
    max_failures: u32,
}

impl SyncClient {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            stream: None,
            state: ConnectionState::Connecting,
            consecutive_failures: 0,
            max_failures: 5,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Exponential backoff delay for the n-th consecutive failure, capped.
    pub fn backoff_delay(failures: u32) -> Duration {
        let exp = failures.min(16);
        BACKOFF_CAP.min(BACKOFF_BASE * 2u32.saturating_pow(exp))
    }

    fn ensure_connected(&mut self) -> Result<(), SyncError> {
        if self.stream.is_some() {
            return Ok(());
        }
        if self.state == ConnectionState::GaveUp {
            return Err(SyncError::GaveUp);
        }

        self.state = ConnectionState::Connecting;
        match TcpStream::connect(&self.addr) {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                self.stream = Some(stream);
                self.state = ConnectionState::Open;
                self.consecutive_failures = 0;
                log_info!("Connected to sync server at {}", self.addr);
                Ok(())
            }
            Err(e) => {
                self.note_failure();
                Err(SyncError::Io(e))
            }
        }
    }

    fn note_failure(&mut self) {
        self.stream = None;
        self.consecutive_failures += 1;
        self.state = if self.consecutive_failures >= self.max_failures {
            log_err!(
                "Sync connection to {} failed {} times; giving up",
                self.addr,
                self.consecutive_failures
            );
            ConnectionState::GaveUp
        } else {
            ConnectionState::Closed
        };
    }

    /// Send one request and wait for its response. Retries the connection
    /// with capped backoff until it opens or the failure budget runs out.
    pub fn request(&mut self, request: &Request) -> Result<Response, SyncError> {
        loop {
            match self.ensure_connected() {
                Ok(()) => break,
                Err(SyncError::GaveUp) => return Err(SyncError::GaveUp),
                Err(_) => {
                    if self.state == ConnectionState::GaveUp {
                        return Err(SyncError::GaveUp);
                    }
                    thread::sleep(Self::backoff_delay(self.consecutive_failures));
                }
            }
        }

        let Some(stream) = self.stream.as_mut() else {
            return Err(SyncError::GaveUp);
        };
        let result: Result<Response, SyncError> = (|| {
            protocol::write_frame(stream, request)?;
            Ok(protocol::read_frame(stream)?)
        })();

        match result {
            Ok(resp) => {
                self.consecutive_failures = 0;
                Ok(resp)
            }
            Err(e) => {
                self.note_failure();
                Err(e)
            }
        }
    }

    /// Push a flattened composite and mask, waiting for the receipt.
    pub fn push_canvas(
        &mut self,
        node_id: &str,
        image: &RgbaImage,
        mask: Option<&GrayImage>,
    ) -> Result<(), SyncError> {
        let request = Request::Push {
            node_id: node_id.to_string(),
            image: Some(encode::encode_rgba_data_uri(image)?),
            mask: mask.map(encode::encode_gray_data_uri).transpose()?,
        };

        match self.request(&request)? {
            Response::Ack { status, .. } if status == "success" => Ok(()),
            Response::Ack { message, .. } => Err(SyncError::Rejected(
                message.unwrap_or_else(|| "push rejected".to_string()),
            )),
            other => Err(SyncError::Rejected(format!("unexpected response: {:?}", other))),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn img(v: u8) -> RgbaImage {
        RgbaImage::from_pixel(2, 2, Rgba([v, v, v, 255]))
    }

    #[test]
    fn second_push_replaces_the_first() {
        let store = TransferStore::new();
        store.push("a", Some(img(1)), None);
        store.push("a", Some(img(9)), None);
        assert_eq!(store.len(), 1);

        let t = store.take("a").unwrap();
        assert_eq!(t.image.unwrap().get_pixel(0, 0)[0], 9);
        assert!(store.take("a").is_none());
    }

    #[test]
    fn discard_removes_only_the_named_node() {
        let store = TransferStore::new();
        store.push("a", Some(img(1)), None);
        store.push("b", Some(img(2)), None);

        assert!(store.discard("a"));
        assert!(!store.discard("a"));
        assert_eq!(store.len(), 1);
        assert!(store.take("b").is_some());
    }

    #[test]
    fn reap_drops_only_stale_entries() {
        let store = TransferStore::new();
        store.push("old", Some(img(1)), None);
        {
            let mut entries = store.entries.lock().unwrap();
            entries.get_mut("old").unwrap().received_at =
                Instant::now() - Duration::from_secs(600);
        }
        store.push("fresh", Some(img(2)), None);

        assert_eq!(store.reap(DEFAULT_IDLE_TIMEOUT), 1);
        assert!(store.take("old").is_none());
        assert!(store.take("fresh").is_some());
    }

    #[test]
    fn backoff_grows_and_caps() {
        assert_eq!(SyncClient::backoff_delay(0), Duration::from_millis(100));
        assert_eq!(SyncClient::backoff_delay(1), Duration::from_millis(200));
        assert_eq!(SyncClient::backoff_delay(3), Duration::from_millis(800));
        assert_eq!(SyncClient::backoff_delay(10), Duration::from_secs(5));
        assert_eq!(SyncClient::backoff_delay(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn push_with_empty_node_id_changes_nothing() {
        let state = ServerState::new(
            Box::new(crate::matting::ThresholdSegmenter),
            std::env::temp_dir(),
        );
        let resp = dispatch(
            Request::Push { node_id: String::new(), image: None, mask: None },
            &state,
        );
        match resp {
            Response::Ack { status, .. } => assert_eq!(status, "error"),
            other => panic!("unexpected response: {:?}", other),
        }
        assert!(state.transfers.is_empty());
    }
}
