use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage i/o error: `{0}`")]
    Io(#[from] std::io::Error),

    #[error("error encoding record: `{0}`")]
    Encode(#[source] serde_json::Error),

    /// A persisted file exists but cannot be decoded. Fatal: the control
    /// plane shuts down rather than operate on half-readable state.
    #[error("registry corrupt at `{path}`: {reason}")]
    RegistryCorrupt { path: String, reason: String },

    /// The write-ahead journal could not be appended. Fatal.
    #[error("journal write failed: `{0}`")]
    JournalWriteFailed(String),
}
