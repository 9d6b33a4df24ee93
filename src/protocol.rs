//! Wire protocol for the sync channel.
//!
//! Messages are tagged JSON objects carried in length-prefixed frames: a u32
//! big-endian byte count followed by the JSON payload. Frames above
//! [`MAX_FRAME_BYTES`] are rejected without allocation; the offending payload
//! is drained so the connection survives the error.

use std::fmt;
use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};

/// Hard ceiling on a single frame. Generous for PNG data URIs of any sane
/// canvas, small enough that a corrupt length prefix cannot OOM the process.
pub const MAX_FRAME_BYTES: u32 = 32 * 1024 * 1024;

// ============================================================================
// MESSAGES
// ============================================================================

/// Client-to-server requests.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Stage flattened canvas output for the node identified by `node_id`.
    /// A second push for the same node replaces the first.
    Push {
        node_id: String,
        image: Option<String>,
        mask: Option<String>,
    },
    /// Fetch the backend's cached output for a node as data URIs.
    GetCanvasData { node_id: String },
    /// List output images written since the given unix-millisecond timestamp.
    GetLatestImages { since_ms: u64 },
    /// Load an image file from the server's filesystem.
    LoadImage { path: String },
    /// Run foreground extraction on the supplied image.
    Matting {
        image: String,
        #[serde(default = "default_threshold")]
        threshold: f32,
    },
}

fn default_threshold() -> f32 {
    0.5
}

/// Server-to-client responses.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// Receipt for a push. `status` is `"success"` or `"error"`; `message`
    /// carries detail only for errors.
    Ack {
        node_id: String,
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    CanvasData {
        success: bool,
        data: CanvasPayload,
    },
    LatestImages {
        success: bool,
        images: Vec<String>,
    },
    LoadedImage {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        image: Option<String>,
        width: u32,
        height: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    MattingResult {
        matted_image: String,
        alpha_mask: String,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
}

/// Cached composite for one node. Both fields are PNG data URIs; nulls mean
/// nothing has been produced yet, which is a normal state.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct CanvasPayload {
    pub image: Option<String>,
    pub mask: Option<String>,
}

impl Response {
    pub fn ack_ok(node_id: impl Into<String>) -> Self {
        Response::Ack { node_id: node_id.into(), status: "success".to_string(), message: None }
    }

    pub fn ack_error(node_id: impl Into<String>, message: impl Into<String>) -> Self {
        Response::Ack {
            node_id: node_id.into(),
            status: "error".to_string(),
            message: Some(message.into()),
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Response::Error { code, message: message.into() }
    }
}

/// Machine-readable failure classes.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Malformed request: empty node id, out-of-range threshold, bad URI.
    Validation,
    /// The named node or file does not exist.
    NotFound,
    /// A single-flight gate refused admission.
    Busy,
    /// A required engine or external component is unavailable.
    Dependency,
    /// Transport-level failure.
    Network,
    /// Unclassified server-side failure.
    Internal,
}

// ============================================================================
// FRAMING
// ============================================================================

#[derive(Debug)]
pub enum FrameError {
    Io(io::Error),
    /// The peer announced a frame larger than [`MAX_FRAME_BYTES`]. The
    /// payload was drained; the stream is still usable.
    TooLarge { declared: u32 },
    Json(serde_json::Error),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::Io(e) => write!(f, "Frame I/O error: {}", e),
            FrameError::TooLarge { declared } => {
                write!(f, "Frame of {} bytes exceeds the {} byte limit", declared, MAX_FRAME_BYTES)
            }
            FrameError::Json(e) => write!(f, "Frame JSON error: {}", e),
        }
    }
}

impl std::error::Error for FrameError {}

impl From<io::Error> for FrameError {
    fn from(e: io::Error) -> Self {
        FrameError::Io(e)
    }
}

impl From<serde_json::Error> for FrameError {
    fn from(e: serde_json::Error) -> Self {
        FrameError::Json(e)
    }
}

/// Serialize a message and write it as one length-prefixed frame.
pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, msg: &T) -> Result<(), FrameError> {
    let payload = serde_json::to_vec(msg)?;
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

/// Read one length-prefixed frame and deserialize it. An oversized frame is
/// drained from the stream before the error returns, so the caller can send
/// an error response and keep reading.
pub fn read_frame<R: Read, T: for<'de> Deserialize<'de>>(reader: &mut R) -> Result<T, FrameError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf);

    if len > MAX_FRAME_BYTES {
        drain(reader, len as u64)?;
        return Err(FrameError::TooLarge { declared: len });
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload)?;
    Ok(serde_json::from_slice(&payload)?)
}

fn drain<R: Read>(reader: &mut R, mut remaining: u64) -> io::Result<()> {
    let mut scratch = [0u8; 8192];
    while remaining > 0 {
        let chunk = remaining.min(scratch.len() as u64) as usize;
        let read = reader.read(&mut scratch[..chunk])?;
        if read == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "stream closed mid-frame"));
        }
        remaining -= read as u64;
    }
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================
