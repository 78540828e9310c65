// Serves one env over stdin/stdout for `SubprocEnv`. Logs go to stderr.

fn main() {
    if let Err(e) = vecgym::subproc::worker::worker_main() {
        log::error!("worker failed: {e}");
        eprintln!("vecgym-worker: {e}");
        std::process::exit(1);
    }
}
