//! Overlapping `act` with caller-side work on one background thread.

use std::ops::Deref;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, bounded};
use log::{debug, warn};

use crate::core::{CallArgs, Env, EnvError, EnvRef, Info, InfoValue, Result, Timestep, check_action};
use crate::spaces::{Space, Value};

/// The last timestep published by the worker, plus counters that let readers
/// wait until every submitted action has been applied.
struct Published {
    submitted: u64,
    completed: u64,
    timestep: Timestep,
    error: Option<EnvError>,
    /// Set once the worker thread has exited, however it left.
    stopped: bool,
}

struct Shared {
    state: Mutex<Published>,
    cond: Condvar,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Marks the worker as stopped and wakes every waiter when dropped.
struct StopOnExit<'a>(&'a Shared);

impl Drop for StopOnExit<'_> {
    fn drop(&mut self) {
        lock(&self.0.state).stopped = true;
        self.0.cond.notify_all();
    }
}

/// Runs the inner env's `act` on a dedicated thread.
///
/// `act` validates the action, hands it to the worker through a one-slot queue
/// and returns. If the slot is still occupied (the worker has not yet picked up
/// the previous action) `act` blocks until it is free; no action is dropped.
/// `observe`, `get_info` and `callmethod` first wait until every submitted
/// action has been applied and published, so they always see a settled state.
pub struct AsynchronousWrapper<E: Env + 'static> {
    env: Arc<Mutex<E>>,
    num: usize,
    ob_space: Space,
    ac_space: Space,
    sender: Option<Sender<Value>>,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl<E: Env + 'static> AsynchronousWrapper<E> {
    pub fn new(mut env: E) -> Result<Self> {
        let num = env.num();
        let ob_space = env.ob_space().clone();
        let ac_space = env.ac_space().clone();
        let initial = env.observe()?;

        let env = Arc::new(Mutex::new(env));
        let shared = Arc::new(Shared {
            state: Mutex::new(Published {
                submitted: 0,
                completed: 0,
                timestep: initial,
                error: None,
                stopped: false,
            }),
            cond: Condvar::new(),
        });
        let (sender, receiver) = bounded::<Value>(1);

        let worker = {
            let env = Arc::clone(&env);
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("vecgym-async".into())
                .spawn(move || Self::run_worker(receiver, env, shared))?
        };
        debug!("started async worker for env with num={num}");

        Ok(Self { env, num, ob_space, ac_space, sender: Some(sender), shared, worker: Some(worker) })
    }

    fn run_worker(receiver: Receiver<Value>, env: Arc<Mutex<E>>, shared: Arc<Shared>) {
        let _stop = StopOnExit(&shared);
        for ac in receiver.iter() {
            let mut env = lock(&env);
            let result = panic::catch_unwind(AssertUnwindSafe(|| env.act(&ac).and_then(|_| env.observe())))
                .unwrap_or_else(|_| Err(EnvError::Other("async worker panicked".into())));
            // Publish while still holding the env so readers never pair the
            // new timestep with a state from a different step.
            let mut st = lock(&shared.state);
            match result {
                Ok(ts) => st.timestep = ts,
                Err(e) => {
                    warn!("async act failed: {e}");
                    st.error = Some(e);
                }
            }
            st.completed += 1;
            drop(st);
            drop(env);
            shared.cond.notify_all();
        }
        debug!("async worker exiting");
    }

    /// Blocks until every submitted action has been published or the worker
    /// has stopped. Fails with `Closed` after `close`.
    fn wait_settled(&self) -> Result<MutexGuard<'_, Published>> {
        if self.sender.is_none() {
            return Err(EnvError::Closed);
        }
        let mut st = lock(&self.shared.state);
        while st.completed < st.submitted && !st.stopped {
            st = self.shared.cond.wait(st).unwrap_or_else(PoisonError::into_inner);
        }
        if let Some(e) = st.error.take() {
            return Err(e);
        }
        if st.completed < st.submitted {
            return Err(EnvError::Other("async worker stopped".into()));
        }
        Ok(st)
    }

    /// Number of actions handed to the worker that it has not finished yet.
    pub fn pending(&self) -> u64 {
        let st = lock(&self.shared.state);
        st.submitted - st.completed
    }

    fn shutdown(&mut self) {
        self.sender.take();
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                warn!("async worker panicked");
            }
        }
    }
}

struct Locked<'a, E>(MutexGuard<'a, E>);

impl<'a, E: Env + 'a> Deref for Locked<'a, E> {
    type Target = dyn Env + 'a;

    fn deref(&self) -> &Self::Target {
        &*self.0
    }
}

impl<E: Env + 'static> Env for AsynchronousWrapper<E> {
    fn num(&self) -> usize { self.num }
    fn ob_space(&self) -> &Space { &self.ob_space }
    fn ac_space(&self) -> &Space { &self.ac_space }

    fn observe(&mut self) -> Result<Timestep> {
        Ok(self.wait_settled()?.timestep.clone())
    }

    fn act(&mut self, ac: &Value) -> Result<()> {
        check_action(&self.ac_space, ac, self.num)?;
        let sender = self.sender.as_ref().ok_or(EnvError::Closed)?;
        lock(&self.shared.state).submitted += 1;
        if sender.send(ac.clone()).is_err() {
            lock(&self.shared.state).submitted -= 1;
            return Err(EnvError::Other("async worker stopped".into()));
        }
        Ok(())
    }

    fn get_info(&mut self) -> Result<Vec<Info>> {
        drop(self.wait_settled()?);
        lock(&self.env).get_info()
    }

    fn callmethod(&mut self, name: &str, args: &CallArgs) -> Result<Vec<InfoValue>> {
        drop(self.wait_settled()?);
        lock(&self.env).callmethod(name, args)
    }

    fn method_names(&self) -> Vec<String> { lock(&self.env).method_names() }
    fn has_method(&self, name: &str) -> bool { lock(&self.env).has_method(name) }

    fn inner_env(&self) -> Option<EnvRef<'_>> {
        Some(EnvRef::Guarded(Box::new(Locked(lock(&self.env)))))
    }

    fn close(&mut self) -> Result<()> {
        if self.sender.is_none() {
            return Ok(());
        }
        self.shutdown();
        lock(&self.env).close()
    }
}

impl<E: Env + 'static> Drop for AsynchronousWrapper<E> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
