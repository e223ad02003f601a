use thiserror::Error;

#[derive(Debug, Error)]
pub enum SvcsError {
   #[error("Git command failed: {0}")]
   GitError(String),

   #[error("Not a git repository: {0}")]
   NotARepository(String),

   #[error("Repository not initialized for SVCS: {0} (run `svcs init`)")]
   NotInitialized(String),

   #[error("LLM request failed (HTTP {status}): {body}")]
   ApiError { status: u16, body: String },

   #[error("LLM call failed after {retries} retries: {source}")]
   ApiRetryExhausted {
      retries: u32,
      #[source]
      source:  Box<Self>,
   },

   #[error("Validation failed: {0}")]
   ValidationError(String),

   #[error("Malformed note payload for {commit}: {reason}")]
   MalformedNote { commit: String, reason: String },

   #[error("Store error: {0}")]
   StoreError(#[from] rusqlite::Error),

   #[error("IO error: {0}")]
   IoError(#[from] std::io::Error),

   #[error("JSON error: {0}")]
   JsonError(#[from] serde_json::Error),

   #[error("HTTP error: {0}")]
   HttpError(#[from] reqwest::Error),

   #[error("{0}")]
   Other(String),
}

impl SvcsError {
   /// Process exit code per the CLI convention: 2 for misuse, 1 otherwise.
   pub const fn exit_code(&self) -> i32 {
      match self {
         Self::ValidationError(_) | Self::NotARepository(_) | Self::NotInitialized(_) => 2,
         _ => 1,
      }
   }
}

pub type Result<T> = std::result::Result<T, SvcsError>;
