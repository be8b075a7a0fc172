use thiserror::Error;

/// Message shown when the downloader sits silent past the stall timeout.
pub const CREDENTIAL_TIMEOUT_MESSAGE: &str =
    "Credentials required but not provided in settings. Process timed out.";

/// Every failure a download session can report.
///
/// The `Display` text is what the UI receives in `download-error`, so keep it short
/// and readable. Details belong in logs.
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Failed to start download: {0}")]
    SpawnFailed(String),

    #[error("Unsupported service: {0}")]
    UnsupportedService(String),

    #[error("Python script not found: {0}")]
    ScriptNotFound(String),

    #[error("{}", CREDENTIAL_TIMEOUT_MESSAGE)]
    CredentialTimeout,

    /// A line matched the error dictionary; the payload is the mapped message.
    #[error("{0}")]
    RecognizedRuntimeError(String),

    /// stderr output that matched nothing in the error dictionary.
    #[error("Error: {0}")]
    UnrecognizedRuntimeError(String),

    #[error("Failed to parse details: {reason}\nOutput: {raw_output}")]
    MetadataParseFailed { reason: String, raw_output: String },

    #[error("Python script failed with code {}\nError: {stderr}", display_code(.code))]
    MetadataFetchFailed { code: Option<i32>, stderr: String },

    #[error("Python script timed out after {} ms", .0.as_millis())]
    MetadataTimedOut(std::time::Duration),

    #[error("Process exited with code {}", display_code(.0))]
    ProcessExitedNonZero(Option<i32>),

    #[error("Failed to save download: {0}")]
    PersistenceFailed(String),

    #[error("Error finalizing download: {0}")]
    FinalizeFailed(String),

    #[error("Download cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SupervisorError {
    /// Wraps a metadata failure raised while the download is still streaming.
    pub fn details_message(&self) -> String {
        format!("Error fetching track details: {}", self)
    }
}

/// Signal-terminated processes have no exit code.
fn display_code(code: &Option<i32>) -> String {
    code.map(|c| c.to_string())
        .unwrap_or_else(|| "null".to_string())
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
