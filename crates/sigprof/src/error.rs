use std::io;

/// Errors surfaced by the profiler's control paths.
///
/// Nothing here is ever produced from inside a signal handler; a tick that
/// cannot be recorded is dropped and only shows up in
/// [`Profile::dropped_samples`](crate::Profile::dropped_samples).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("failed to write report to {destination}")]
    SinkWrite {
        destination: String,
        #[source]
        source: io::Error,
    },

    #[error("{operation} failed")]
    Os {
        operation: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("{0} is already installed in this process")]
    AlreadyInstalled(&'static str),
}

impl Error {
    pub(crate) fn last_os_error(operation: &'static str) -> Self {
        Error::Os {
            operation,
            source: io::Error::last_os_error(),
        }
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, Error::Configuration(_))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
