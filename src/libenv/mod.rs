//! Driving an env implemented behind the C function table in [`abi`].
//!
//! The bridge checks the table's version before making any other call, turns
//! the descriptors returned by `create` into [`Space`]s, and pre-allocates
//! every buffer the implementation writes into or reads from.

pub mod abi;

use std::collections::BTreeMap;
use std::ffi::{CString, OsStr, c_void};

use log::{debug, info};

use self::abi::{
    ABI_VERSION, LibEnvDesc, LibEnvError, LibEnvOption, LibEnvVTable, VTABLE_SYMBOL, VTableFn, space_from_raw,
};
use crate::core::{Env, EnvError, Info, InfoValue, Result, Timestep, check_action};
use crate::spaces::{DType, Space, Tensor, TensorData, Value};

/// Construction options handed to the implementation's `create`.
pub type LibEnvOptions = BTreeMap<String, String>;

/// Bridge-owned storage for every leaf of one space, batched over `num`.
///
/// Backed by `u64` words so each leaf is aligned for any element type.
struct LeafBuffers {
    leaves: Vec<(DType, Vec<usize>, usize)>,
    words: Vec<Vec<u64>>,
}

impl LeafBuffers {
    fn new(space: &Space, num: usize) -> Result<Self> {
        let mut leaves = Vec::new();
        let mut words = Vec::new();
        for (name, leaf) in space.leaves() {
            let mut shape = vec![num];
            shape.extend_from_slice(leaf.shape());
            let bytes = num
                .checked_mul(leaf.size())
                .and_then(|n| n.checked_mul(leaf.dtype().size_of()))
                .ok_or_else(|| EnvError::SpaceDefinition(format!("leaf {name:?} batched {num} times is too large")))?;
            words.push(vec![0u64; bytes.div_ceil(8)]);
            leaves.push((leaf.dtype(), shape, bytes));
        }
        Ok(Self { leaves, words })
    }

    fn empty() -> Self {
        Self { leaves: Vec::new(), words: Vec::new() }
    }

    fn ptrs_mut(&mut self) -> Vec<*mut c_void> {
        self.words.iter_mut().map(|w| w.as_mut_ptr().cast::<c_void>()).collect()
    }

    fn ptrs(&self) -> Vec<*const c_void> {
        self.words.iter().map(|w| w.as_ptr().cast::<c_void>()).collect()
    }

    fn bytes(&self, j: usize) -> &[u8] {
        let len = self.leaves[j].2;
        // SAFETY: `words[j]` holds at least `len` initialized bytes.
        unsafe { std::slice::from_raw_parts(self.words[j].as_ptr().cast::<u8>(), len) }
    }

    fn bytes_mut(&mut self, j: usize) -> &mut [u8] {
        let len = self.leaves[j].2;
        // SAFETY: as above, and the borrow is unique.
        unsafe { std::slice::from_raw_parts_mut(self.words[j].as_mut_ptr().cast::<u8>(), len) }
    }

    fn write(&mut self, value: &Value) -> Result<()> {
        let tensors: Vec<Tensor> = value.leaves().into_iter().map(|(_, t)| t.clone()).collect();
        if tensors.len() != self.leaves.len() {
            return Err(EnvError::SpaceMismatch("value does not match the buffer layout".into()));
        }
        for (j, t) in tensors.iter().enumerate() {
            t.data().write_ne_bytes(self.bytes_mut(j))?;
        }
        Ok(())
    }

    fn tensors(&self) -> Result<Vec<Tensor>> {
        (0..self.leaves.len())
            .map(|j| {
                let (dtype, shape, _) = &self.leaves[j];
                Tensor::new(shape.clone(), TensorData::from_ne_bytes(*dtype, self.bytes(j)))
            })
            .collect()
    }

    fn read(&self, space: &Space) -> Result<Value> {
        let mut it = self.tensors()?.into_iter();
        assemble(space, &mut it)
    }
}

fn assemble(space: &Space, leaves: &mut impl Iterator<Item = Tensor>) -> Result<Value> {
    match space {
        Space::Tensor(_) => leaves
            .next()
            .map(Value::Tensor)
            .ok_or_else(|| EnvError::Other("ran out of leaf buffers".into())),
        Space::Dict(d) => d
            .iter()
            .map(|(k, s)| Ok((k.clone(), assemble(s, leaves)?)))
            .collect::<Result<_>>()
            .map(Value::Dict),
    }
}

fn info_value(t: Tensor) -> InfoValue {
    if !t.shape().is_empty() {
        return InfoValue::Tensor(t);
    }
    let x = t.data().get_f64(0);
    match t.dtype() {
        DType::F32 | DType::F64 => InfoValue::F64(x),
        DType::Bool => InfoValue::Bool(x != 0.0),
        DType::I32 | DType::U8 => InfoValue::I64(x as i64),
        DType::I64 => match t.as_slice::<i64>() {
            Some(v) => InfoValue::I64(v[0]),
            None => InfoValue::I64(x as i64),
        },
    }
}

fn check(code: i32, err: &LibEnvError) -> Result<()> {
    if code == 0 {
        Ok(())
    } else {
        Err(EnvError::Implementation { code, message: err.text() })
    }
}

/// An env implemented behind a [`LibEnvVTable`].
///
/// The handle returned by `create` is destroyed exactly once, on `close` or
/// drop, before the dynamic library (if any) is unloaded.
pub struct LibEnv {
    vtable: LibEnvVTable,
    handle: *mut c_void,
    num: usize,
    ob_space: Space,
    ac_space: Space,
    info_space: Option<Space>,
    info_keys: Vec<String>,
    reward: Vec<f32>,
    first: Vec<u8>,
    ob_bufs: LeafBuffers,
    ac_bufs: LeafBuffers,
    info_bufs: LeafBuffers,
    // Dropped after `Drop::drop` has destroyed the handle.
    _library: Option<libloading::Library>,
}

// SAFETY: the handle is only touched through `&mut self`, and implementations
// are required not to depend on the calling thread.
unsafe impl Send for LibEnv {}

impl LibEnv {
    /// Loads a shared library exporting `libenv_vtable` and creates an env.
    ///
    /// # Safety
    /// Loading runs the library's initializers, and every call goes through
    /// its function table, which must honour the layout in [`abi`].
    pub unsafe fn load(path: impl AsRef<OsStr>, options: &LibEnvOptions) -> Result<Self> {
        let path = path.as_ref();
        let library = unsafe { libloading::Library::new(path) }.map_err(|e| EnvError::Library(e.to_string()))?;
        let vtable = unsafe {
            let sym = library
                .get::<VTableFn>(VTABLE_SYMBOL)
                .map_err(|e| EnvError::Library(e.to_string()))?;
            let ptr = sym();
            if ptr.is_null() {
                return Err(EnvError::Library("libenv_vtable returned null".into()));
            }
            *ptr
        };
        info!("loaded env library {}", path.to_string_lossy());
        unsafe { Self::create(vtable, Some(library), options) }
    }

    /// Creates an env from a statically linked function table.
    ///
    /// # Safety
    /// The table's functions must honour the layout in [`abi`].
    pub unsafe fn from_vtable(vtable: &LibEnvVTable, options: &LibEnvOptions) -> Result<Self> {
        unsafe { Self::create(*vtable, None, options) }
    }

    unsafe fn create(
        vtable: LibEnvVTable,
        library: Option<libloading::Library>,
        options: &LibEnvOptions,
    ) -> Result<Self> {
        if vtable.version != ABI_VERSION {
            return Err(EnvError::AbiVersion { expected: ABI_VERSION, found: vtable.version });
        }
        debug!("ABI version {ABI_VERSION} accepted");

        let owned = options
            .iter()
            .map(|(k, v)| Ok((CString::new(k.as_str())?, CString::new(v.as_str())?)))
            .collect::<std::result::Result<Vec<_>, std::ffi::NulError>>()
            .map_err(|e| EnvError::Other(format!("option contains NUL: {e}")))?;
        let raw_options: Vec<LibEnvOption> =
            owned.iter().map(|(k, v)| LibEnvOption { name: k.as_ptr(), value: v.as_ptr() }).collect();

        let mut handle: *mut c_void = std::ptr::null_mut();
        let mut desc = LibEnvDesc::empty();
        let mut err = LibEnvError::new();
        let code = unsafe { (vtable.create)(raw_options.as_ptr(), raw_options.len(), &mut handle, &mut desc, &mut err) };
        check(code, &err)?;
        if handle.is_null() {
            return Err(EnvError::Implementation { code: 0, message: "create returned a null handle".into() });
        }

        let layout = unsafe { Self::spaces(&desc) }.and_then(|(num, ob_space, ac_space, info_space)| {
            let bufs = (
                LeafBuffers::new(&ob_space, num)?,
                LeafBuffers::new(&ac_space, num)?,
                match &info_space {
                    Some(s) => LeafBuffers::new(s, num)?,
                    None => LeafBuffers::empty(),
                },
            );
            Ok((num, ob_space, ac_space, info_space, bufs))
        });
        let (num, ob_space, ac_space, info_space, (ob_bufs, ac_bufs, info_bufs)) = match layout {
            Ok(l) => l,
            Err(e) => {
                unsafe { (vtable.destroy)(handle) };
                return Err(e);
            }
        };
        let info_keys = info_space
            .as_ref()
            .map(|s| s.leaves().into_iter().map(|(k, _)| k).collect())
            .unwrap_or_default();
        info!("created foreign env with num={num}");
        Ok(Self {
            vtable,
            handle,
            num,
            ob_bufs,
            ac_bufs,
            info_bufs,
            ob_space,
            ac_space,
            info_space,
            info_keys,
            reward: vec![0.0; num],
            first: vec![0; num],
            _library: library,
        })
    }

    unsafe fn spaces(desc: &LibEnvDesc) -> Result<(usize, Space, Space, Option<Space>)> {
        let num = usize::try_from(desc.num).unwrap_or(0);
        if num == 0 {
            return Err(EnvError::SpaceDefinition("num must be positive".into()));
        }
        let ob = unsafe { space_from_raw(&desc.ob_space) }?
            .ok_or_else(|| EnvError::SpaceDefinition("missing ob_space".into()))?;
        let ac = unsafe { space_from_raw(&desc.ac_space) }?
            .ok_or_else(|| EnvError::SpaceDefinition("missing ac_space".into()))?;
        let info = unsafe { space_from_raw(&desc.info_space) }?;
        Ok((num, ob, ac, info))
    }

    /// Describes the per-index records returned by `get_info`, if any.
    pub fn info_space(&self) -> Option<&Space> { self.info_space.as_ref() }

    fn live_handle(&self) -> Result<*mut c_void> {
        if self.handle.is_null() { Err(EnvError::Closed) } else { Ok(self.handle) }
    }
}

impl Env for LibEnv {
    fn num(&self) -> usize { self.num }
    fn ob_space(&self) -> &Space { &self.ob_space }
    fn ac_space(&self) -> &Space { &self.ac_space }

    fn observe(&mut self) -> Result<Timestep> {
        let handle = self.live_handle()?;
        let ob_ptrs = self.ob_bufs.ptrs_mut();
        let mut err = LibEnvError::new();
        let code = unsafe {
            (self.vtable.observe)(handle, self.reward.as_mut_ptr(), ob_ptrs.as_ptr(), self.first.as_mut_ptr(), &mut err)
        };
        check(code, &err)?;
        let ob = self.ob_bufs.read(&self.ob_space)?;
        Ok(Timestep::new(self.reward.clone(), ob, self.first.iter().map(|&f| f != 0).collect()))
    }

    fn act(&mut self, ac: &Value) -> Result<()> {
        let handle = self.live_handle()?;
        check_action(&self.ac_space, ac, self.num)?;
        self.ac_bufs.write(ac)?;
        let ac_ptrs = self.ac_bufs.ptrs();
        let mut err = LibEnvError::new();
        let code = unsafe { (self.vtable.act)(handle, ac_ptrs.as_ptr(), &mut err) };
        check(code, &err)
    }

    fn get_info(&mut self) -> Result<Vec<Info>> {
        let handle = self.live_handle()?;
        if self.info_space.is_none() {
            return Ok(vec![Info::new(); self.num]);
        }
        let info_ptrs = self.info_bufs.ptrs_mut();
        let mut err = LibEnvError::new();
        let code = unsafe { (self.vtable.get_info)(handle, info_ptrs.as_ptr(), &mut err) };
        check(code, &err)?;
        let leaves = self.info_bufs.tensors()?;
        let mut out = vec![Info::new(); self.num];
        for (key, t) in self.info_keys.iter().zip(&leaves) {
            for (i, info) in out.iter_mut().enumerate() {
                info.insert(key.clone(), info_value(t.row(i)?));
            }
        }
        Ok(out)
    }

    fn close(&mut self) -> Result<()> {
        if !self.handle.is_null() {
            unsafe { (self.vtable.destroy)(self.handle) };
            self.handle = std::ptr::null_mut();
            debug!("destroyed foreign env");
        }
        Ok(())
    }
}

impl Drop for LibEnv {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::abi::*;
    use super::*;
    use std::ffi::{CStr, c_char};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Counts up by the action; an index restarts after reaching 5.
    struct Counter {
        t: Vec<i64>,
        reward: Vec<f32>,
        first: Vec<bool>,
        bounds: [f64; 2],
        info_name: CString,
        info_children: Vec<RawNamedSpace>,
    }

    unsafe fn option(o: &LibEnvOption) -> (String, String) {
        let s = |p: *const c_char| unsafe { CStr::from_ptr(p) }.to_string_lossy().into_owned();
        (s(o.name), s(o.value))
    }

    unsafe extern "C" fn counter_create(
        options: *const LibEnvOption,
        n_options: usize,
        handle: *mut *mut c_void,
        desc: *mut LibEnvDesc,
        err: *mut LibEnvError,
    ) -> i32 {
        let opts = if n_options == 0 { &[][..] } else { unsafe { std::slice::from_raw_parts(options, n_options) } };
        let mut num = 2usize;
        for o in opts {
            let (k, v) = unsafe { option(o) };
            if k == "num" {
                match v.parse() {
                    Ok(n) => num = n,
                    Err(_) => {
                        unsafe { (*err).set("num must be an integer") };
                        return 2;
                    }
                }
            }
        }
        let mut c = Box::new(Counter {
            t: vec![0; num],
            reward: vec![0.0; num],
            first: vec![true; num],
            bounds: [0.0, 3.0],
            info_name: CString::new("count").unwrap(),
            info_children: Vec::new(),
        });

        let mut ob = RawSpace::none();
        ob.kind = SPACE_TENSOR;
        ob.dtype = DType::F32.tag();
        ob.ndim = 1;
        ob.shape[0] = 2;

        let mut ac = RawSpace::none();
        ac.kind = SPACE_TENSOR;
        ac.dtype = DType::I64.tag();
        ac.has_bounds = 1;
        ac.low = &c.bounds[0];
        ac.high = &c.bounds[1];

        let mut count = RawSpace::none();
        count.kind = SPACE_TENSOR;
        count.dtype = DType::I64.tag();
        let name = c.info_name.as_ptr();
        c.info_children.push(RawNamedSpace { name, space: count });

        let mut info = RawSpace::none();
        info.kind = SPACE_DICT;
        info.count = 1;
        info.children = c.info_children.as_ptr();

        unsafe {
            *desc = LibEnvDesc { num: num as u64, ob_space: ob, ac_space: ac, info_space: info };
            *handle = Box::into_raw(c).cast();
        }
        0
    }

    unsafe extern "C" fn counter_destroy(handle: *mut c_void) {
        drop(unsafe { Box::from_raw(handle.cast::<Counter>()) });
    }

    unsafe extern "C" fn counter_act(handle: *mut c_void, ac: *const *const c_void, err: *mut LibEnvError) -> i32 {
        let c = unsafe { &mut *handle.cast::<Counter>() };
        let ac = unsafe { std::slice::from_raw_parts((*ac).cast::<i64>(), c.t.len()) };
        if ac.contains(&3) {
            unsafe { (*err).set("action 3 is reserved") };
            return 7;
        }
        for i in 0..c.t.len() {
            c.t[i] += ac[i];
            c.reward[i] = ac[i] as f32;
            c.first[i] = c.t[i] >= 5;
            if c.first[i] {
                c.t[i] = 0;
            }
        }
        0
    }

    unsafe extern "C" fn counter_observe(
        handle: *mut c_void,
        reward: *mut f32,
        ob: *const *mut c_void,
        first: *mut u8,
        _err: *mut LibEnvError,
    ) -> i32 {
        let c = unsafe { &*handle.cast::<Counter>() };
        let n = c.t.len();
        let (reward, ob, first) = unsafe {
            (
                std::slice::from_raw_parts_mut(reward, n),
                std::slice::from_raw_parts_mut((*ob).cast::<f32>(), 2 * n),
                std::slice::from_raw_parts_mut(first, n),
            )
        };
        for i in 0..n {
            reward[i] = c.reward[i];
            ob[2 * i] = c.t[i] as f32;
            ob[2 * i + 1] = -(c.t[i] as f32);
            first[i] = c.first[i] as u8;
        }
        0
    }

    unsafe extern "C" fn counter_get_info(handle: *mut c_void, info: *const *mut c_void, _err: *mut LibEnvError) -> i32 {
        let c = unsafe { &*handle.cast::<Counter>() };
        let out = unsafe { std::slice::from_raw_parts_mut((*info).cast::<i64>(), c.t.len()) };
        out.copy_from_slice(&c.t);
        0
    }

    const COUNTER: LibEnvVTable = LibEnvVTable {
        version: ABI_VERSION,
        create: counter_create,
        destroy: counter_destroy,
        act: counter_act,
        observe: counter_observe,
        get_info: counter_get_info,
    };

    fn counter(num: usize) -> LibEnv {
        let options = LibEnvOptions::from([("num".to_string(), num.to_string())]);
        unsafe { LibEnv::from_vtable(&COUNTER, &options) }.unwrap()
    }

    fn ints(v: Vec<i64>) -> Value {
        let n = v.len();
        Value::Tensor(Tensor::from_vec(vec![n], v).unwrap())
    }

    #[test]
    fn descriptors_become_spaces() {
        let env = counter(3);
        assert_eq!(env.num(), 3);
        assert_eq!(env.ac_space(), &Space::discrete(4).unwrap());
        assert_eq!(env.ob_space().as_tensor().unwrap().shape(), &[2]);
        assert_eq!(env.info_space().unwrap().leaves()[0].0, "count");
    }

    #[test]
    fn steps_through_the_table() {
        let mut env = counter(2);
        let ts = env.observe().unwrap();
        assert_eq!(ts.first, vec![true, true]);
        ts.validate(2, env.ob_space()).unwrap();

        env.act(&ints(vec![1, 2])).unwrap();
        let ts = env.observe().unwrap();
        assert_eq!(ts.reward, vec![1.0, 2.0]);
        assert_eq!(ts.first, vec![false, false]);
        let ob = ts.ob.as_tensor().unwrap();
        assert_eq!(ob.shape(), &[2, 2]);
        assert_eq!(ob.as_slice::<f32>().unwrap(), &[1.0, -1.0, 2.0, -2.0]);
        assert_eq!(ts, env.observe().unwrap());

        let info = env.get_info().unwrap();
        assert_eq!(info[1].get("count"), Some(&InfoValue::I64(2)));

        env.act(&ints(vec![2, 2])).unwrap();
        env.act(&ints(vec![2, 2])).unwrap();
        assert_eq!(env.observe().unwrap().first, vec![true, true]);
    }

    #[test]
    fn nonzero_codes_carry_the_message() {
        let mut env = counter(1);
        match env.act(&ints(vec![3])) {
            Err(EnvError::Implementation { code, message }) => {
                assert_eq!(code, 7);
                assert_eq!(message, "action 3 is reserved");
            }
            other => panic!("unexpected {other:?}"),
        }
        env.act(&ints(vec![1])).unwrap();

        let options = LibEnvOptions::from([("num".to_string(), "lots".to_string())]);
        let res = unsafe { LibEnv::from_vtable(&COUNTER, &options) };
        assert!(matches!(res, Err(EnvError::Implementation { code: 2, .. })));
    }

    #[test]
    fn invalid_actions_never_reach_the_table() {
        let mut env = counter(2);
        assert!(matches!(env.act(&ints(vec![1])), Err(EnvError::SpaceMismatch(_))));
        assert!(matches!(env.act(&ints(vec![1, 9])), Err(EnvError::SpaceMismatch(_))));
        assert_eq!(env.get_info().unwrap()[0].get("count"), Some(&InfoValue::I64(0)));
    }

    static MISMATCH_CREATED: AtomicBool = AtomicBool::new(false);

    unsafe extern "C" fn tracked_create(
        options: *const LibEnvOption,
        n_options: usize,
        handle: *mut *mut c_void,
        desc: *mut LibEnvDesc,
        err: *mut LibEnvError,
    ) -> i32 {
        MISMATCH_CREATED.store(true, Ordering::SeqCst);
        unsafe { counter_create(options, n_options, handle, desc, err) }
    }

    #[test]
    fn version_mismatch_makes_no_calls() {
        let table = LibEnvVTable { version: ABI_VERSION + 1, create: tracked_create, ..COUNTER };
        let res = unsafe { LibEnv::from_vtable(&table, &LibEnvOptions::new()) };
        match res {
            Err(EnvError::AbiVersion { expected, found }) => {
                assert_eq!(expected, ABI_VERSION);
                assert_eq!(found, ABI_VERSION + 1);
            }
            _ => panic!("expected an ABI version error"),
        }
        assert!(!MISMATCH_CREATED.load(Ordering::SeqCst));
    }

    static DESTROYS: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "C" fn counted_destroy(handle: *mut c_void) {
        DESTROYS.fetch_add(1, Ordering::SeqCst);
        unsafe { counter_destroy(handle) }
    }

    #[test]
    fn handle_is_destroyed_exactly_once() {
        let table = LibEnvVTable { destroy: counted_destroy, ..COUNTER };
        let mut env = unsafe { LibEnv::from_vtable(&table, &LibEnvOptions::new()) }.unwrap();
        env.close().unwrap();
        env.close().unwrap();
        assert!(matches!(env.observe(), Err(EnvError::Closed)));
        drop(env);
        assert_eq!(DESTROYS.load(Ordering::SeqCst), 1);
    }

    static OVERSIZED_DESTROYS: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "C" fn oversized_create(
        options: *const LibEnvOption,
        n_options: usize,
        handle: *mut *mut c_void,
        desc: *mut LibEnvDesc,
        err: *mut LibEnvError,
    ) -> i32 {
        let code = unsafe { counter_create(options, n_options, handle, desc, err) };
        unsafe { (*desc).num = u64::MAX / 4 };
        code
    }

    unsafe extern "C" fn oversized_destroy(handle: *mut c_void) {
        OVERSIZED_DESTROYS.fetch_add(1, Ordering::SeqCst);
        unsafe { counter_destroy(handle) }
    }

    #[test]
    fn oversized_buffers_are_refused() {
        let table = LibEnvVTable { create: oversized_create, destroy: oversized_destroy, ..COUNTER };
        let res = unsafe { LibEnv::from_vtable(&table, &LibEnvOptions::new()) };
        assert!(matches!(res, Err(EnvError::SpaceDefinition(_))));
        assert_eq!(OVERSIZED_DESTROYS.load(Ordering::SeqCst), 1);

        let mut raw = RawSpace::none();
        raw.kind = SPACE_TENSOR;
        raw.dtype = DType::F32.tag();
        raw.ndim = 2;
        raw.shape[0] = usize::MAX as u64;
        raw.shape[1] = 2;
        assert!(matches!(unsafe { space_from_raw(&raw) }, Err(EnvError::SpaceDefinition(_))));
    }

    #[test]
    fn missing_library_is_reported() {
        let res = unsafe { LibEnv::load("/nonexistent/libnothing.so", &LibEnvOptions::new()) };
        assert!(matches!(res, Err(EnvError::Library(_))));
    }
}
