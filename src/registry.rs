//! Constructor descriptors and a global registry of env factories.
//! Workers build their env from an [`EnvSpec`] looked up here.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::str::FromStr;
use std::sync::{OnceLock, RwLock};
use std::time::Duration;

use log::info;
use serde::{Deserialize, Serialize};

use crate::core::{Env, EnvError, Result};
use crate::envs::{CartPole, IdentityEnv};
use crate::wrappers::Wrapper;

/// Key-value kwargs for `make`: stringly-typed, parsed by each factory.
pub type KwArgs = BTreeMap<String, String>;

/// Describes how to construct one env: a registered id plus its kwargs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EnvSpec {
    /// Registered identifier like "CartPole".
    pub id: String,
    #[serde(default)]
    pub kwargs: KwArgs,
}

impl EnvSpec {
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self { id: id.into(), kwargs: KwArgs::new() }
    }

    pub fn kwarg<K: Into<String>, V: ToString>(mut self, key: K, value: V) -> Self {
        self.kwargs.insert(key.into(), value.to_string());
        self
    }

    /// Constructs a [`EnvSpec`] from YAML file.
    pub fn load(src: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::File::open(src)?;
        let rdr = std::io::BufReader::new(file);
        Ok(serde_yaml::from_reader(rdr)?)
    }

    /// Saves [`EnvSpec`].
    pub fn save(&self, dst: impl AsRef<Path>) -> Result<()> {
        let mut file = std::fs::File::create(dst)?;
        std::io::Write::write_all(&mut file, serde_yaml::to_string(self)?.as_bytes())?;
        Ok(())
    }
}

/// Reads `key` from kwargs, falling back to `default` when absent.
pub fn kwarg_or<T: FromStr>(kwargs: &KwArgs, key: &str, default: T) -> Result<T> {
    match kwargs.get(key) {
        None => Ok(default),
        Some(s) => s
            .parse()
            .map_err(|_| EnvError::Other(format!("invalid value {s:?} for kwarg {key:?}"))),
    }
}

/// Factory closure type for constructing environments with kwargs.
pub type FactoryFn = Box<dyn Fn(&KwArgs) -> Result<Box<dyn Env>> + Send + Sync>;

struct Registry {
    factories: RwLock<HashMap<String, FactoryFn>>,
}

impl Registry {
    fn with_builtins() -> Self {
        let mut factories: HashMap<String, FactoryFn> = HashMap::new();
        factories.insert("CartPole".into(), Box::new(make_cart_pole));
        factories.insert("Identity".into(), Box::new(make_identity));
        factories.insert("Failing".into(), Box::new(make_failing));
        factories.insert("Crash".into(), Box::new(make_crash));
        Self { factories: RwLock::new(factories) }
    }

    fn register(&self, id: &str, factory: FactoryFn) -> Result<()> {
        let mut g = self.factories.write().map_err(|_| EnvError::Other("registry poisoned".into()))?;
        if g.contains_key(id) {
            return Err(EnvError::Other(format!("Env id already registered: {id}")));
        }
        g.insert(id.to_string(), factory);
        Ok(())
    }

    fn make(&self, spec: &EnvSpec) -> Result<Box<dyn Env>> {
        let g = self.factories.read().map_err(|_| EnvError::Other("registry poisoned".into()))?;
        match g.get(&spec.id) {
            Some(f) => {
                info!("constructing env {:?} with {:?}", spec.id, spec.kwargs);
                f(&spec.kwargs)
            }
            None => Err(EnvError::Other(format!("Unknown environment id: {}", spec.id))),
        }
    }

    fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = match self.factories.read() {
            Ok(g) => g.keys().cloned().collect(),
            Err(_) => Vec::new(),
        };
        ids.sort();
        ids
    }
}

static REGISTRY: OnceLock<Registry> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::with_builtins)
}

/// Register a factory globally. Ids are unique.
pub fn register(id: &str, factory: FactoryFn) -> Result<()> { registry().register(id, factory) }

/// Construct an environment from its descriptor.
pub fn make(spec: &EnvSpec) -> Result<Box<dyn Env>> { registry().make(spec) }

/// Registered ids, sorted.
pub fn ids() -> Vec<String> { registry().ids() }

fn make_cart_pole(kwargs: &KwArgs) -> Result<Box<dyn Env>> {
    let num = kwarg_or(kwargs, "num", 1usize)?;
    let seed = kwarg_or(kwargs, "seed", 0u64)?;
    Ok(Box::new(CartPole::new(num, seed)?))
}

fn make_identity(kwargs: &KwArgs) -> Result<Box<dyn Env>> {
    let num = kwarg_or(kwargs, "num", 1usize)?;
    let n = kwarg_or(kwargs, "n", 4u32)?;
    let episode_len = kwarg_or(kwargs, "episode_len", 10u32)?;
    let seed = kwarg_or(kwargs, "seed", 0u64)?;
    let delay = Duration::from_millis(kwarg_or(kwargs, "delay_ms", 0u64)?);
    let env = IdentityEnv::new(num, n, episode_len, seed)?;
    if delay.is_zero() {
        return Ok(Box::new(env));
    }
    Ok(Box::new(Wrapper::new(env).on_act(move |env: &mut IdentityEnv, ac| {
        std::thread::sleep(delay);
        env.act(ac)
    })))
}

fn make_failing(kwargs: &KwArgs) -> Result<Box<dyn Env>> {
    let message = kwargs.get("message").map_or("constructor failed", String::as_str);
    Err(EnvError::Other(message.to_string()))
}

/// An identity env whose hosting process dies on the first `act`.
fn make_crash(kwargs: &KwArgs) -> Result<Box<dyn Env>> {
    let num = kwarg_or(kwargs, "num", 1usize)?;
    let code = kwarg_or(kwargs, "exit_code", 3i32)?;
    let env = IdentityEnv::new(num, 2, 10, 0)?;
    Ok(Box::new(Wrapper::new(env).on_act(move |_env: &mut IdentityEnv, _ac| std::process::exit(code))))
}
