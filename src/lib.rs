//! secure-media - password-protected media containers
//!
//! Containers hold one AES-256-CTR encrypted file (or packed directory)
//! keyed by PBKDF2-HMAC-SHA256. Decryption streams in chunks into private,
//! self-cleaning temporary artifacts, with progress reporting and
//! cooperative cancellation.

#![forbid(unsafe_code)]

pub mod artifact;
pub mod decrypt;
pub mod error;
pub mod file_ops;
pub mod header;
pub mod job;
pub mod kdf;
pub mod keystream;
pub mod password;
pub mod progress;
pub mod sniff;

pub use artifact::{ArtifactHandle, ArtifactManager, purge_outstanding, sweep_stale};
pub use decrypt::{
    DecryptOptions, DecryptedArtifact, decrypt, decrypt_file, decrypt_stream, decrypt_to_file,
    inspect_file,
};
pub use error::{ErrorCategory, ErrorKind, Result, SecureMediaError};
pub use file_ops::{EncryptOptions, encrypt_file};
pub use header::{FormatVersion, Header};
pub use job::{DecryptEvent, DecryptJob, JobOutcome};
pub use progress::{CancelToken, NoProgress, ProgressEvent, ProgressSink};
