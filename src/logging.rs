//! Log output for the binaries.
//!
//! Lines carry a timestamp, the emitting thread and the level. `RUST_LOG` wins over the
//! configured level.
use std::{io::Write, thread};

use env_logger::{Builder, Env};
use log::SetLoggerError;

pub fn init(default_level: &str) -> Result<(), SetLoggerError> {
    let env = Env::default().default_filter_or(default_level);

    Builder::from_env(env)
        .format(|buf, record| {
            writeln!(
                buf,
                "{} {:?} {:<5} {}",
                buf.timestamp_millis(),
                thread::current().id(),
                record.level(),
                record.args()
            )
        })
        .try_init()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_rejected() {
        init("debug").unwrap();
        log::info!("logger ready");

        assert!(init("info").is_err());
    }
}
