//! Messages exchanged between a [`SubprocEnv`](super::SubprocEnv) and its worker.
//!
//! Every message travels as one frame: a 4-byte little-endian payload length
//! followed by the bincode encoding of a [`Request`] or [`Reply`]. Tensors
//! carry their dtype tag and shape, so the payload is self-describing.

use std::io::{Read, Write};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::core::{CallArgs, EnvError, ErrorKind, Info, InfoValue, Result, Timestep};
use crate::registry::EnvSpec;
use crate::spaces::{Space, Value};

/// Frames larger than this are rejected as corrupt.
pub const MAX_FRAME_LEN: u32 = 1 << 30;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Request {
    /// Build the env. Must be the first request.
    Init(EnvSpec),
    Observe,
    Act(Value),
    GetInfo,
    CallMethod { name: String, args: CallArgs },
    Close,
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::Init(_) => "INIT",
            Request::Observe => "OBSERVE",
            Request::Act(_) => "ACT",
            Request::GetInfo => "GET_INFO",
            Request::CallMethod { .. } => "CALLMETHOD",
            Request::Close => "CLOSE",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Reply {
    Ready { num: usize, ob_space: Space, ac_space: Space, methods: Vec<String> },
    Timestep(Timestep),
    Ack,
    Info(Vec<Info>),
    Results(Vec<InfoValue>),
    Error(RemoteError),
}

/// An error raised inside the worker, rebuilt on the parent side.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RemoteError {
    pub kind: ErrorKind,
    pub message: String,
}

// Structured variants pack their fields into `message` so the parent can
// rebuild the same variant.
impl From<&EnvError> for RemoteError {
    fn from(e: &EnvError) -> Self {
        let message = match e {
            EnvError::SpaceDefinition(m)
            | EnvError::SpaceMismatch(m)
            | EnvError::MethodNotFound(m)
            | EnvError::SubprocessCrash(m)
            | EnvError::Library(m)
            | EnvError::Other(m) => m.clone(),
            EnvError::IpcTimeout(d) => d.as_millis().to_string(),
            EnvError::AbiVersion { expected, found } => format!("{expected} {found}"),
            EnvError::Implementation { code, message } => format!("{code}: {message}"),
            EnvError::Closed => String::new(),
            EnvError::Io(e) => e.to_string(),
            EnvError::Codec(e) => e.to_string(),
            EnvError::Config(e) => e.to_string(),
        };
        Self { kind: e.kind(), message }
    }
}

impl From<RemoteError> for EnvError {
    fn from(e: RemoteError) -> Self {
        match e.kind {
            ErrorKind::SpaceDefinition => EnvError::SpaceDefinition(e.message),
            ErrorKind::SpaceMismatch => EnvError::SpaceMismatch(e.message),
            ErrorKind::MethodNotFound => EnvError::MethodNotFound(e.message),
            ErrorKind::SubprocessCrash => EnvError::SubprocessCrash(e.message),
            ErrorKind::IpcTimeout => EnvError::IpcTimeout(Duration::from_millis(e.message.parse().unwrap_or(0))),
            ErrorKind::AbiVersion => {
                let (expected, found) = e.message.split_once(' ').unwrap_or(("0", "0"));
                EnvError::AbiVersion { expected: expected.parse().unwrap_or(0), found: found.parse().unwrap_or(0) }
            }
            ErrorKind::Implementation => {
                let (code, message) = match e.message.split_once(": ") {
                    Some((c, m)) => (c.parse().unwrap_or(-1), m.to_string()),
                    None => (-1, e.message),
                };
                EnvError::Implementation { code, message }
            }
            ErrorKind::Closed => EnvError::Closed,
            ErrorKind::Io => EnvError::Io(std::io::Error::other(e.message)),
            ErrorKind::Codec => EnvError::Codec(Box::new(bincode::ErrorKind::Custom(e.message))),
            ErrorKind::Config => EnvError::Config(serde::de::Error::custom(e.message)),
            ErrorKind::Library => EnvError::Library(e.message),
            ErrorKind::Other => EnvError::Other(e.message),
        }
    }
}

/// Writes one length-prefixed frame and flushes.
pub fn write_frame<W: Write, T: Serialize>(w: &mut W, msg: &T) -> Result<()> {
    let payload = bincode::serialize(msg)?;
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|&n| n <= MAX_FRAME_LEN)
        .ok_or_else(|| EnvError::Other(format!("frame of {} bytes is too large", payload.len())))?;
    w.write_all(&len.to_le_bytes())?;
    w.write_all(&payload)?;
    w.flush()?;
    Ok(())
}

/// Reads one frame. Returns `Ok(None)` on a clean end of stream before the header.
pub fn read_frame<R: Read, T: DeserializeOwned>(r: &mut R) -> Result<Option<T>> {
    let mut header = [0u8; 4];
    match r.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(header);
    if len > MAX_FRAME_LEN {
        return Err(EnvError::Other(format!("frame header announces {len} bytes")));
    }
    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload)?;
    Ok(Some(bincode::deserialize(&payload)?))
}
