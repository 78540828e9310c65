//! Running one env in an isolated worker process.
//!
//! The parent spawns the worker with piped stdin/stdout, sends `INIT` with an
//! [`EnvSpec`], and then issues one request at a time. A reader thread decodes
//! reply frames from the worker's stdout into a single-slot channel, so every
//! wait for a reply is bounded by [`SubprocConfig::reply_timeout`].

pub mod protocol;
pub mod worker;

use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, bounded};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use self::protocol::{Reply, Request, read_frame, write_frame};
use crate::core::{CallArgs, Env, EnvError, Info, InfoValue, Result, Timestep, check_action};
use crate::registry::EnvSpec;
use crate::spaces::{Space, Value};

/// Configuration of [`SubprocEnv`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubprocConfig {
    /// Worker executable.
    pub program: PathBuf,

    /// Extra arguments passed to the worker.
    pub args: Vec<String>,

    /// Bound on the wait for any single reply, including `READY`.
    pub reply_timeout: Duration,

    /// Bound on graceful shutdown before the worker is killed.
    pub close_timeout: Duration,
}

impl Default for SubprocConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: Vec::new(),
            reply_timeout: Duration::from_secs(30),
            close_timeout: Duration::from_secs(5),
        }
    }
}

impl SubprocConfig {
    /// Sets the worker executable.
    pub fn program(mut self, v: impl Into<PathBuf>) -> Self {
        self.program = v.into();
        self
    }

    /// Appends an argument for the worker.
    pub fn arg(mut self, v: impl Into<String>) -> Self {
        self.args.push(v.into());
        self
    }

    /// Sets the reply timeout.
    pub fn reply_timeout(mut self, v: Duration) -> Self {
        self.reply_timeout = v;
        self
    }

    /// Sets the close timeout.
    pub fn close_timeout(mut self, v: Duration) -> Self {
        self.close_timeout = v;
        self
    }

    /// Constructs [`SubprocConfig`] from YAML file.
    pub fn load(src: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::File::open(src)?;
        let rdr = std::io::BufReader::new(file);
        Ok(serde_yaml::from_reader(rdr)?)
    }

    /// Saves [`SubprocConfig`].
    pub fn save(&self, dst: impl AsRef<Path>) -> Result<()> {
        let mut file = std::fs::File::create(dst)?;
        std::io::Write::write_all(&mut file, serde_yaml::to_string(self)?.as_bytes())?;
        Ok(())
    }
}

// `vecgym-worker` next to the current executable, or one directory up
// (test harnesses run from `target/<profile>/deps`).
fn default_program() -> PathBuf {
    let name = format!("vecgym-worker{}", std::env::consts::EXE_SUFFIX);
    if let Ok(exe) = std::env::current_exe() {
        for dir in exe.ancestors().skip(1).take(2) {
            let candidate = dir.join(&name);
            if candidate.is_file() {
                return candidate;
            }
        }
    }
    PathBuf::from(name)
}

/// Polls `child` until it exits or `bound` elapses.
fn wait_bounded(child: &mut Child, bound: Duration) -> std::io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + bound;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// Why a reply did not arrive.
enum Failure {
    Timeout,
    Exited,
    Broken(EnvError),
}

/// The worker process and both ends of its pipes.
struct Channel {
    child: Child,
    stdin: Option<BufWriter<ChildStdin>>,
    replies: Receiver<Result<Reply>>,
    reader: Option<JoinHandle<()>>,
}

impl Channel {
    fn spawn(config: &SubprocConfig) -> Result<Self> {
        let mut child = Command::new(&config.program)
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| EnvError::Other(format!("failed to spawn {}: {e}", config.program.display())))?;
        info!("spawned worker {} (pid {})", config.program.display(), child.id());

        let stdin = child.stdin.take().map(BufWriter::new);
        let stdout = child.stdout.take();
        let (stdin, stdout) = match (stdin, stdout) {
            (Some(i), Some(o)) => (i, o),
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(EnvError::Other("worker pipes are unavailable".into()));
            }
        };

        // Capacity 1: at most one request is in flight.
        let (tx, replies) = bounded::<Result<Reply>>(1);
        let reader = std::thread::Builder::new()
            .name("vecgym-subproc-reader".into())
            .spawn(move || {
                let mut stdout = BufReader::new(stdout);
                loop {
                    match read_frame::<_, Reply>(&mut stdout) {
                        Ok(Some(reply)) => {
                            if tx.send(Ok(reply)).is_err() {
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            let _ = tx.send(Err(e));
                            break;
                        }
                    }
                }
                debug!("worker stdout reached end of stream");
            });
        let reader = match reader {
            Ok(h) => h,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(e.into());
            }
        };
        Ok(Self { child, stdin: Some(stdin), replies, reader: Some(reader) })
    }

    fn round_trip(&mut self, req: &Request, timeout: Duration) -> std::result::Result<Reply, Failure> {
        let stdin = self.stdin.as_mut().ok_or(Failure::Exited)?;
        if let Err(e) = write_frame(stdin, req) {
            debug!("writing {} failed: {e}", req.name());
            return Err(Failure::Exited);
        }
        match self.replies.recv_timeout(timeout) {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(e)) => Err(Failure::Broken(e)),
            Err(RecvTimeoutError::Timeout) => Err(Failure::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(Failure::Exited),
        }
    }

    fn exit_status(&mut self) -> String {
        match wait_bounded(&mut self.child, Duration::from_millis(500)) {
            Ok(Some(status)) => format!("worker exited with {status}"),
            Ok(None) => "worker closed its output but is still running".into(),
            Err(e) => format!("worker state unknown: {e}"),
        }
    }

    /// Closes stdin, waits up to `grace` for the worker to exit, then kills it.
    /// Always reaps the process and joins the reader thread.
    fn terminate(&mut self, grace: Duration) {
        self.stdin.take();
        match wait_bounded(&mut self.child, grace) {
            Ok(Some(status)) => debug!("worker {} exited with {status}", self.child.id()),
            _ => {
                warn!("killing worker {}", self.child.id());
                let _ = self.child.kill();
                let _ = self.child.wait();
            }
        }
        if let Some(handle) = self.reader.take() {
            if handle.join().is_err() {
                warn!("subprocess reader thread panicked");
            }
        }
    }
}

enum Health {
    Alive,
    Failed(String),
    Closed,
}

/// An env hosted by a separate worker process.
///
/// A crash or an unanswered request marks the instance permanently failed:
/// the failing call returns `SubprocessCrash` or `IpcTimeout`, and every
/// later call returns `SubprocessCrash`. Nothing is retried or respawned.
pub struct SubprocEnv {
    channel: Channel,
    health: Health,
    config: SubprocConfig,
    num: usize,
    ob_space: Space,
    ac_space: Space,
    methods: Vec<String>,
}

impl SubprocEnv {
    /// Spawns a worker with the default configuration.
    pub fn new(spec: EnvSpec) -> Result<Self> {
        Self::with_config(spec, SubprocConfig::default())
    }

    /// Spawns a worker and waits, within `reply_timeout`, for its env to be built.
    pub fn with_config(spec: EnvSpec, config: SubprocConfig) -> Result<Self> {
        let mut channel = Channel::spawn(&config)?;
        let reply = channel.round_trip(&Request::Init(spec.clone()), config.reply_timeout);
        let (num, ob_space, ac_space, methods) = match reply {
            Ok(Reply::Ready { num, ob_space, ac_space, methods }) => (num, ob_space, ac_space, methods),
            Ok(Reply::Error(e)) => {
                channel.terminate(config.close_timeout);
                return Err(e.into());
            }
            Ok(other) => {
                channel.terminate(Duration::ZERO);
                return Err(EnvError::Other(format!("unexpected reply to INIT: {other:?}")));
            }
            Err(Failure::Timeout) => {
                channel.terminate(Duration::ZERO);
                return Err(EnvError::IpcTimeout(config.reply_timeout));
            }
            Err(Failure::Exited) => {
                let status = channel.exit_status();
                channel.terminate(Duration::ZERO);
                return Err(EnvError::SubprocessCrash(status));
            }
            Err(Failure::Broken(e)) => {
                channel.terminate(Duration::ZERO);
                return Err(e);
            }
        };
        info!("worker for {:?} ready with num={num}", spec.id);
        Ok(Self { channel, health: Health::Alive, config, num, ob_space, ac_space, methods })
    }

    /// Process id of the worker.
    pub fn pid(&self) -> u32 { self.channel.child.id() }

    pub fn config(&self) -> &SubprocConfig { &self.config }

    /// Whether the instance can still serve requests.
    pub fn is_alive(&self) -> bool { matches!(self.health, Health::Alive) }

    fn request(&mut self, req: Request) -> Result<Reply> {
        match &self.health {
            Health::Alive => {}
            Health::Failed(why) => return Err(EnvError::SubprocessCrash(why.clone())),
            Health::Closed => return Err(EnvError::Closed),
        }
        let err = match self.channel.round_trip(&req, self.config.reply_timeout) {
            Ok(Reply::Error(e)) => EnvError::from(e),
            Ok(reply) => return Ok(reply),
            Err(Failure::Timeout) => {
                warn!("no reply to {} within {:?}", req.name(), self.config.reply_timeout);
                EnvError::IpcTimeout(self.config.reply_timeout)
            }
            Err(Failure::Exited) => {
                let status = self.channel.exit_status();
                warn!("{status} while handling {}", req.name());
                EnvError::SubprocessCrash(status)
            }
            Err(Failure::Broken(e)) => {
                warn!("corrupt reply to {}: {e}", req.name());
                EnvError::SubprocessCrash(format!("corrupt reply: {e}"))
            }
        };
        // A fatal error reported by the worker's own env ends this instance too.
        if err.is_fatal() {
            self.channel.terminate(Duration::ZERO);
            self.health = Health::Failed(err.to_string());
        }
        Err(err)
    }
}

fn unexpected(req: &str, reply: Reply) -> EnvError {
    EnvError::Other(format!("unexpected reply to {req}: {reply:?}"))
}

impl Env for SubprocEnv {
    fn num(&self) -> usize { self.num }
    fn ob_space(&self) -> &Space { &self.ob_space }
    fn ac_space(&self) -> &Space { &self.ac_space }

    fn observe(&mut self) -> Result<Timestep> {
        match self.request(Request::Observe)? {
            Reply::Timestep(ts) => Ok(ts),
            other => Err(unexpected("OBSERVE", other)),
        }
    }

    fn act(&mut self, ac: &Value) -> Result<()> {
        check_action(&self.ac_space, ac, self.num)?;
        match self.request(Request::Act(ac.clone()))? {
            Reply::Ack => Ok(()),
            other => Err(unexpected("ACT", other)),
        }
    }

    fn get_info(&mut self) -> Result<Vec<Info>> {
        match self.request(Request::GetInfo)? {
            Reply::Info(info) => Ok(info),
            other => Err(unexpected("GET_INFO", other)),
        }
    }

    fn callmethod(&mut self, name: &str, args: &CallArgs) -> Result<Vec<InfoValue>> {
        let req = Request::CallMethod { name: name.to_string(), args: args.clone() };
        match self.request(req)? {
            Reply::Results(out) => Ok(out),
            other => Err(unexpected("CALLMETHOD", other)),
        }
    }

    fn method_names(&self) -> Vec<String> { self.methods.clone() }

    /// Requests a graceful shutdown, then force-terminates after `close_timeout`.
    /// Pipes and the reader thread are released in every case.
    fn close(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.health, Health::Closed) {
            Health::Closed => Ok(()),
            Health::Failed(_) => {
                self.channel.terminate(Duration::ZERO);
                Ok(())
            }
            Health::Alive => {
                let reply = self.channel.round_trip(&Request::Close, self.config.close_timeout);
                self.channel.terminate(self.config.close_timeout);
                match reply {
                    Ok(Reply::Ack) => Ok(()),
                    Ok(Reply::Error(e)) => Err(e.into()),
                    Ok(other) => Err(unexpected("CLOSE", other)),
                    Err(_) => {
                        warn!("worker did not acknowledge CLOSE");
                        Ok(())
                    }
                }
            }
        }
    }
}

impl Drop for SubprocEnv {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("closing worker on drop: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_builders_and_yaml() {
        let config = SubprocConfig::default()
            .program("/bin/worker")
            .arg("--quiet")
            .reply_timeout(Duration::from_millis(250))
            .close_timeout(Duration::from_secs(1));
        assert_eq!(config.args, vec!["--quiet".to_string()]);
        let path = std::env::temp_dir().join(format!("vecgym-subproc-{}.yaml", std::process::id()));
        config.save(&path).unwrap();
        assert_eq!(SubprocConfig::load(&path).unwrap(), config);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn missing_program_fails_to_spawn() {
        let config = SubprocConfig::default().program("/nonexistent/vecgym-worker");
        assert!(SubprocEnv::with_config(EnvSpec::new("Identity"), config).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn program_that_never_answers_times_out() {
        let config = SubprocConfig::default()
            .program("sleep")
            .arg("10")
            .reply_timeout(Duration::from_millis(200));
        let start = Instant::now();
        let res = SubprocEnv::with_config(EnvSpec::new("Identity"), config);
        assert!(matches!(res, Err(EnvError::IpcTimeout(_))));
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
