use crate::{Error, Result};
use tracing_subscriber::EnvFilter;

/// Install the global fmt subscriber writing to stderr. `level` is an `EnvFilter` directive;
/// the environment is not consulted.
pub fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(level).map_err(|err| Error::Logging {
        message: format!("invalid log level {level:?}: {err}"),
    })?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_thread_names(true)
        .try_init()
        .map_err(|err| Error::Logging {
            message: err.to_string(),
        })
}
