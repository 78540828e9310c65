//! Fixed binary layout shared with foreign env implementations.
//!
//! An implementation exports one function table ([`LibEnvVTable`]). Every
//! call that can fail returns an `i32` (zero on success) and may write a
//! NUL-terminated message into the caller-provided [`LibEnvError`].
//!
//! Buffers are owned by the bridge. For a space with leaves `l_0..l_k` (in
//! sorted-name, depth-first order) the bridge passes an array of `k + 1`
//! pointers; leaf `j` points at `num * prod(shape_j)` elements of its dtype,
//! batch-major. Booleans are one byte each.

use std::ffi::{CStr, c_char, c_void};

use crate::core::{EnvError, Result};
use crate::spaces::{DType, Space, TensorSpace};

/// Interface version. Bridge and implementation must match exactly.
pub const ABI_VERSION: u32 = 1;

/// Largest tensor rank a descriptor can carry.
pub const MAX_DIMS: usize = 16;

/// Capacity of [`LibEnvError::message`], including the terminating NUL.
pub const MESSAGE_LEN: usize = 256;

pub const SPACE_NONE: u32 = 0;
pub const SPACE_TENSOR: u32 = 1;
pub const SPACE_DICT: u32 = 2;

/// A space descriptor. `kind` selects which fields are meaningful.
///
/// - `SPACE_TENSOR`: `dtype` (see [`DType::tag`]), `ndim`, `shape[..ndim]`,
///   and when `has_bounds != 0`, `low`/`high` each point at `prod(shape)` f64.
/// - `SPACE_DICT`: `count` entries at `children`.
/// - `SPACE_NONE`: no value (only valid for `info_space`).
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct RawSpace {
    pub kind: u32,
    pub dtype: u32,
    pub ndim: u32,
    pub shape: [u64; MAX_DIMS],
    pub has_bounds: u8,
    pub low: *const f64,
    pub high: *const f64,
    pub count: u32,
    pub children: *const RawNamedSpace,
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct RawNamedSpace {
    pub name: *const c_char,
    pub space: RawSpace,
}

impl RawSpace {
    pub const fn none() -> Self {
        Self {
            kind: SPACE_NONE,
            dtype: 0,
            ndim: 0,
            shape: [0; MAX_DIMS],
            has_bounds: 0,
            low: std::ptr::null(),
            high: std::ptr::null(),
            count: 0,
            children: std::ptr::null(),
        }
    }
}

/// Filled by `create`. Every pointer inside must stay valid until `destroy`.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct LibEnvDesc {
    pub num: u64,
    pub ob_space: RawSpace,
    pub ac_space: RawSpace,
    pub info_space: RawSpace,
}

impl LibEnvDesc {
    pub const fn empty() -> Self {
        Self { num: 0, ob_space: RawSpace::none(), ac_space: RawSpace::none(), info_space: RawSpace::none() }
    }
}

/// One `name=value` construction option, both NUL-terminated.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct LibEnvOption {
    pub name: *const c_char,
    pub value: *const c_char,
}

#[repr(C)]
pub struct LibEnvError {
    pub message: [c_char; MESSAGE_LEN],
}

impl LibEnvError {
    pub fn new() -> Self {
        Self { message: [0; MESSAGE_LEN] }
    }

    /// The message up to the first NUL, lossily decoded.
    pub fn text(&self) -> String {
        let bytes: Vec<u8> = self.message.iter().take_while(|&&c| c != 0).map(|&c| c as u8).collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// Writes `msg` truncated to fit, always NUL-terminated.
    pub fn set(&mut self, msg: &str) {
        let n = msg.len().min(MESSAGE_LEN - 1);
        for (dst, &b) in self.message.iter_mut().zip(&msg.as_bytes()[..n]) {
            *dst = b as c_char;
        }
        self.message[n] = 0;
    }
}

impl Default for LibEnvError {
    fn default() -> Self { Self::new() }
}

pub type CreateFn = unsafe extern "C" fn(
    options: *const LibEnvOption,
    n_options: usize,
    handle: *mut *mut c_void,
    desc: *mut LibEnvDesc,
    err: *mut LibEnvError,
) -> i32;
pub type DestroyFn = unsafe extern "C" fn(handle: *mut c_void);
pub type ActFn = unsafe extern "C" fn(handle: *mut c_void, ac: *const *const c_void, err: *mut LibEnvError) -> i32;
pub type ObserveFn = unsafe extern "C" fn(
    handle: *mut c_void,
    reward: *mut f32,
    ob: *const *mut c_void,
    first: *mut u8,
    err: *mut LibEnvError,
) -> i32;
pub type GetInfoFn = unsafe extern "C" fn(handle: *mut c_void, info: *const *mut c_void, err: *mut LibEnvError) -> i32;

/// The function table an implementation exports.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct LibEnvVTable {
    pub version: u32,
    pub create: CreateFn,
    pub destroy: DestroyFn,
    pub act: ActFn,
    pub observe: ObserveFn,
    pub get_info: GetInfoFn,
}

/// Name of the exported symbol returning `*const LibEnvVTable`.
pub const VTABLE_SYMBOL: &[u8] = b"libenv_vtable\0";

pub type VTableFn = unsafe extern "C" fn() -> *const LibEnvVTable;

/// Converts a descriptor into a [`Space`]. Returns `None` for `SPACE_NONE`.
///
/// # Safety
/// All pointers reachable from `raw` must be valid for the lengths it declares.
pub unsafe fn space_from_raw(raw: &RawSpace) -> Result<Option<Space>> {
    match raw.kind {
        SPACE_NONE => Ok(None),
        SPACE_TENSOR => {
            let dtype = DType::from_tag(raw.dtype)
                .ok_or_else(|| EnvError::SpaceDefinition(format!("unknown dtype tag {}", raw.dtype)))?;
            let ndim = raw.ndim as usize;
            if ndim > MAX_DIMS {
                return Err(EnvError::SpaceDefinition(format!("rank {ndim} exceeds {MAX_DIMS}")));
            }
            let shape: Vec<usize> = raw.shape[..ndim].iter().map(|&d| d as usize).collect();
            let space = TensorSpace::new(shape, dtype)?;
            if raw.has_bounds == 0 {
                return Ok(Some(space.into()));
            }
            if raw.low.is_null() || raw.high.is_null() {
                return Err(EnvError::SpaceDefinition("bounds flagged but missing".into()));
            }
            let n = space.size();
            let low = unsafe { std::slice::from_raw_parts(raw.low, n) }.to_vec();
            let high = unsafe { std::slice::from_raw_parts(raw.high, n) }.to_vec();
            Ok(Some(space.with_bounds(low, high)?.into()))
        }
        SPACE_DICT => {
            if raw.count > 0 && raw.children.is_null() {
                return Err(EnvError::SpaceDefinition("aggregate entries missing".into()));
            }
            let children = if raw.count == 0 {
                &[][..]
            } else {
                unsafe { std::slice::from_raw_parts(raw.children, raw.count as usize) }
            };
            let mut entries = Vec::with_capacity(children.len());
            for child in children {
                if child.name.is_null() {
                    return Err(EnvError::SpaceDefinition("aggregate entry without a name".into()));
                }
                let name = unsafe { CStr::from_ptr(child.name) }
                    .to_str()
                    .map_err(|_| EnvError::SpaceDefinition("entry name is not UTF-8".into()))?
                    .to_string();
                let space = unsafe { space_from_raw(&child.space) }?
                    .ok_or_else(|| EnvError::SpaceDefinition(format!("entry {name:?} has no space")))?;
                entries.push((name, space));
            }
            Ok(Some(Space::dict(entries)?))
        }
        other => Err(EnvError::SpaceDefinition(format!("unknown space kind {other}"))),
    }
}
