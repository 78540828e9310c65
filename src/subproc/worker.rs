//! The worker side of the subprocess protocol.

use std::io::{BufReader, BufWriter, Read, Write};

use log::{debug, info, warn};

use super::protocol::{Reply, Request, read_frame, write_frame};
use crate::core::{Env, EnvError, Result};
use crate::registry;

/// Serves one env over `reader`/`writer` until `CLOSE` or end of input.
///
/// The first request must be `INIT`. A constructor failure is reported as an
/// `ERROR` reply, after which the loop returns.
pub fn serve<R: Read, W: Write>(reader: R, writer: W) -> Result<()> {
    let mut reader = BufReader::new(reader);
    let mut writer = BufWriter::new(writer);

    let spec = match read_frame::<_, Request>(&mut reader)? {
        Some(Request::Init(spec)) => spec,
        Some(other) => {
            let e = EnvError::Other(format!("expected INIT, got {}", other.name()));
            write_frame(&mut writer, &Reply::Error((&e).into()))?;
            return Err(e);
        }
        None => return Ok(()),
    };

    let mut env = match registry::make(&spec) {
        Ok(env) => env,
        Err(e) => {
            warn!("constructing {:?} failed: {e}", spec.id);
            write_frame(&mut writer, &Reply::Error((&e).into()))?;
            return Ok(());
        }
    };
    write_frame(
        &mut writer,
        &Reply::Ready {
            num: env.num(),
            ob_space: env.ob_space().clone(),
            ac_space: env.ac_space().clone(),
            methods: env.method_names(),
        },
    )?;
    info!("worker serving {:?} with num={}", spec.id, env.num());

    loop {
        let req = match read_frame::<_, Request>(&mut reader)? {
            Some(req) => req,
            None => {
                debug!("parent closed the channel");
                env.close()?;
                return Ok(());
            }
        };
        debug!("worker handling {}", req.name());
        if let Request::Close = req {
            let reply = match env.close() {
                Ok(()) => Reply::Ack,
                Err(e) => Reply::Error((&e).into()),
            };
            write_frame(&mut writer, &reply)?;
            return Ok(());
        }
        let reply = handle(env.as_mut(), req).unwrap_or_else(|e| Reply::Error((&e).into()));
        write_frame(&mut writer, &reply)?;
    }
}

fn handle(env: &mut dyn Env, req: Request) -> Result<Reply> {
    Ok(match req {
        Request::Observe => Reply::Timestep(env.observe()?),
        Request::Act(ac) => {
            env.act(&ac)?;
            Reply::Ack
        }
        Request::GetInfo => Reply::Info(env.get_info()?),
        Request::CallMethod { name, args } => Reply::Results(env.callmethod(&name, &args)?),
        Request::Init(_) => return Err(EnvError::Other("env is already initialized".into())),
        Request::Close => Reply::Ack,
    })
}

/// Entry point of the `vecgym-worker` binary: serves over stdin/stdout.
pub fn worker_main() -> Result<()> {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .target(env_logger::Target::Stderr)
        .try_init();
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    serve(stdin.lock(), stdout.lock())
}
