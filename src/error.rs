use thiserror::Error;

/// Violations detected while un-framing a FrameCodec frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds {0} bytes without a closing sync byte")]
    TooLarge(usize),

    #[error("frame check sequence mismatch")]
    ChecksumMismatch,

    #[error("frame truncated")]
    Truncated,

    #[error("unexpected frame header")]
    UnexpectedHeader,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("framing error: {0}")]
    Frame(#[from] FrameError),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("link error: {0}")]
    Link(String),

    #[error("handshake did not complete in time")]
    HandshakeTimeout,

    #[error("device discovery failed: {0}")]
    DiscoveryFailed(Box<Error>),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
}

impl Error {
    /// Whether a failed exchange may be attempted again on the same link.
    ///
    /// Timeouts and single corrupted frames are expected on a noisy radio
    /// link; everything else either kills the session or indicates that
    /// repeating the request cannot help.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Timeout(_) | Error::Frame(_))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Creates an anyhow error with the current file and line number
#[macro_export]
macro_rules! file_error {
    ($($arg:tt)*) => {
        anyhow::anyhow!(
            "[{}:{}] {}",
            std::path::Path::new(file!())
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_default(),
            line!(),
            format!($($arg)*)
        )
    };
}
