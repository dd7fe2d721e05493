//! Logging bootstrap. The YAML policy schema carries no log-file path (spec
//! §3), so unlike the teacher's `Logger` background service this writes to
//! stderr directly via `env_logger`; `RUST_LOG` controls verbosity exactly as
//! in the teacher.

use env_logger::Builder;
use log::LevelFilter;

pub fn init_env_logger() {
    Builder::from_env(env_logger::Env::default())
        .filter(None, LevelFilter::Info)
        .init();
}
