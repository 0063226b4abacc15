//! Streaming container decryption
//!
//! [`decrypt_file`] turns a container on disk into a plaintext artifact
//! owned by an [`ArtifactManager`]. The header is validated and the
//! container length checked against it before any password work happens, so
//! malformed input never creates an artifact. Version 2 containers are
//! authenticated in a first pass over the ciphertext; plaintext is only
//! produced once the tag matches.
//!
//! The payload is processed in chunks of [`DecryptOptions::chunk_size`]
//! bytes. After each chunk a [`ProgressEvent`] is reported and the
//! [`CancelToken`] is checked before the next one. Any failure or
//! cancellation deletes the partial artifact.

use crate::artifact::{ArtifactHandle, ArtifactManager};
use crate::error::{ErrorCategory, ErrorKind, Result, SecureMediaError};
use crate::file_ops::{read_error, write_atomically, write_error};
use crate::header::{Header, TAG_LEN};
use crate::kdf::{DerivedKey, HmacSha256, PBKDF2_ITERATIONS, derive_key};
use crate::keystream::{CounterState, CtrStream};
use crate::progress::{CancelToken, NoProgress, ProgressEvent, ProgressSink};
use crate::sniff::matches_signature;
use hmac::Mac;
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, trace, warn};
use zeroize::Zeroizing;

/// Default number of ciphertext bytes processed per step
pub const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;

/// Smallest accepted chunk size
pub const MIN_CHUNK_SIZE: usize = 4 * 1024;

/// Largest accepted chunk size
pub const MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct DecryptOptions {
    /// Bytes per chunk, between [`MIN_CHUNK_SIZE`] and [`MAX_CHUNK_SIZE`].
    pub chunk_size: usize,
    /// PBKDF2 iterations the container was encrypted with.
    pub iterations: u32,
    /// For version 1 containers, fail with
    /// [`ErrorKind::WrongPasswordSuspected`] when the first decrypted chunk
    /// does not carry the signature of the recorded extension.
    pub check_signature: bool,
}

impl Default for DecryptOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            iterations: PBKDF2_ITERATIONS,
            check_signature: true,
        }
    }
}

impl DecryptOptions {
    pub fn validate(&self) -> Result<()> {
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&self.chunk_size) {
            return Err(SecureMediaError::invalid_input(format!(
                "chunk size must be between {} and {} bytes, got {}",
                MIN_CHUNK_SIZE, MAX_CHUNK_SIZE, self.chunk_size
            )));
        }
        Ok(())
    }
}

/// A fully decrypted payload living in a temporary artifact.
///
/// The artifact is deleted when this value is dropped or released.
#[derive(Debug)]
pub struct DecryptedArtifact {
    handle: ArtifactHandle,
    original_extension: String,
    is_directory: bool,
    len: u64,
}

impl DecryptedArtifact {
    pub fn path(&self) -> &Path {
        self.handle.path()
    }

    /// Extension recorded in the container, without a leading dot
    pub fn original_extension(&self) -> &str {
        &self.original_extension
    }

    pub fn is_directory(&self) -> bool {
        self.is_directory
    }

    /// Plaintext size in bytes
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Delete the artifact now instead of on drop.
    pub fn release(&mut self) -> Result<()> {
        self.handle.release()
    }
}

/// Decrypt with default options and no cancellation.
pub fn decrypt(
    input_path: &Path,
    password: &[u8],
    manager: &ArtifactManager,
    progress: Option<&mut dyn ProgressSink>,
) -> Result<DecryptedArtifact> {
    let options = DecryptOptions::default();
    let cancel = CancelToken::new();
    match progress {
        Some(sink) => decrypt_file(input_path, password, manager, &options, sink, &cancel),
        None => decrypt_file(input_path, password, manager, &options, &mut NoProgress, &cancel),
    }
}

/// Decrypt the container at `input_path` into a new artifact of `manager`.
///
/// Returns [`ErrorKind::Cancelled`] if `cancel` fires between chunks. No
/// artifact survives an error.
#[instrument(skip_all, fields(input = %input_path.display()))]
pub fn decrypt_file(
    input_path: &Path,
    password: &[u8],
    manager: &ArtifactManager,
    options: &DecryptOptions,
    progress: &mut dyn ProgressSink,
    cancel: &CancelToken,
) -> Result<DecryptedArtifact> {
    options.validate()?;
    let file = File::open(input_path).map_err(|e| read_error(input_path, e))?;
    let (header, mut reader) = open_container(BufReader::new(file))?;
    debug!(
        version = ?header.version,
        extension = %header.original_extension,
        is_directory = header.is_directory,
        payload_length = header.payload_length,
        "parsed container header"
    );

    let key = derive_key(password, &header.salt, options.iterations)?;
    if header.version.is_authenticated() {
        verify_tag(&mut reader, &header, &key, options.chunk_size, cancel)?;
    }

    let stem = artifact_stem(input_path, &header.original_extension);
    let mut handle = manager.acquire_named(&stem, &header.original_extension)?;
    match fill_artifact(&mut handle, &mut reader, &header, &key, options, progress, cancel) {
        Ok(len) => {
            info!(path = %handle.path().display(), bytes = len, "decrypted container");
            Ok(DecryptedArtifact {
                handle,
                original_extension: header.original_extension,
                is_directory: header.is_directory,
                len,
            })
        }
        Err(e) => {
            if e.is_cancelled() {
                info!("decryption cancelled");
            }
            if let Err(release_err) = handle.release() {
                warn!(error = %release_err, "failed to remove partial artifact");
            }
            Err(e)
        }
    }
}

/// Decrypt a container read from `reader` into `writer`.
///
/// Unlike [`decrypt_file`] no artifact is involved; on error `writer` may
/// already hold part of the plaintext, so callers must discard it.
pub fn decrypt_stream<R: Read + Seek, W: Write>(
    reader: R,
    writer: &mut W,
    password: &[u8],
    options: &DecryptOptions,
    progress: &mut dyn ProgressSink,
    cancel: &CancelToken,
) -> Result<Header> {
    options.validate()?;
    let (header, mut reader) = open_container(reader)?;
    let key = derive_key(password, &header.salt, options.iterations)?;
    if header.version.is_authenticated() {
        verify_tag(&mut reader, &header, &key, options.chunk_size, cancel)?;
    }
    pump(&mut reader, writer, &header, &key, options, progress, cancel)?;
    Ok(header)
}

/// Decrypt `input_path` to a caller-chosen `output_path`.
///
/// The output appears atomically with mode 0o600 and only once the whole
/// payload has been decrypted.
#[instrument(skip_all, fields(input = %input_path.display()))]
pub fn decrypt_to_file(
    input_path: &Path,
    output_path: &Path,
    password: &[u8],
    options: &DecryptOptions,
    progress: &mut dyn ProgressSink,
    cancel: &CancelToken,
) -> Result<Header> {
    let file = File::open(input_path).map_err(|e| read_error(input_path, e))?;
    let header = write_atomically(output_path, |out| {
        decrypt_stream(BufReader::new(file), out, password, options, progress, cancel)
    })?;
    info!(output = %output_path.display(), bytes = header.payload_length, "decrypted container");
    Ok(header)
}

/// Read and validate the header of the container at `path` without a
/// password.
pub fn inspect_file(path: &Path) -> Result<Header> {
    let file = File::open(path).map_err(|e| read_error(path, e))?;
    let (header, _) = open_container(BufReader::new(file))?;
    Ok(header)
}

/// Parse the header and check the container size it implies against the
/// real size. Leaves `reader` at the first ciphertext byte.
fn open_container<R: Read + Seek>(mut reader: R) -> Result<(Header, R)> {
    let header = Header::read_from(&mut reader)?;
    let actual = reader.seek(SeekFrom::End(0)).map_err(seek_error)?;
    let expected = header.container_len().ok_or_else(|| {
        SecureMediaError::format(
            ErrorKind::Format,
            format!(
                "declared payload length {} exceeds any possible container size",
                header.payload_length
            ),
        )
    })?;
    if actual < expected {
        return Err(SecureMediaError::format(
            ErrorKind::TruncatedInput,
            format!(
                "container truncated: header declares {} bytes, input has {}",
                expected, actual
            ),
        ));
    }
    if actual > expected {
        return Err(SecureMediaError::format(
            ErrorKind::TrailingData,
            format!(
                "{} unexpected bytes after the end of the container",
                actual - expected
            ),
        ));
    }
    reader
        .seek(SeekFrom::Start(header.encoded_len() as u64))
        .map_err(seek_error)?;
    Ok((header, reader))
}

/// Check the version 2 tag over header and ciphertext, then rewind to the
/// first ciphertext byte.
fn verify_tag<R: Read + Seek>(
    reader: &mut R,
    header: &Header,
    key: &DerivedKey,
    chunk_size: usize,
    cancel: &CancelToken,
) -> Result<()> {
    let mac_key = key.mac_key()?;
    let mut mac = HmacSha256::new_from_slice(mac_key.expose_secret()).map_err(|_| {
        SecureMediaError::with_kind(
            ErrorCategory::Internal,
            ErrorKind::InternalInvariant,
            "failed to initialize HMAC",
        )
    })?;
    mac.update(&header.to_bytes());

    let mut buf = vec![0u8; chunk_size];
    let mut remaining = header.payload_length;
    while remaining > 0 {
        if cancel.is_cancelled() {
            return Err(SecureMediaError::cancelled());
        }
        let want = remaining.min(chunk_size as u64) as usize;
        reader.read_exact(&mut buf[..want]).map_err(payload_read_error)?;
        mac.update(&buf[..want]);
        remaining -= want as u64;
    }

    let mut tag = [0u8; TAG_LEN];
    reader.read_exact(&mut tag).map_err(payload_read_error)?;
    mac.verify_slice(&tag).map_err(|_| {
        SecureMediaError::with_kind(
            ErrorCategory::User,
            ErrorKind::IntegrityFailed,
            "authentication failed: wrong password, or the container is corrupted",
        )
    })?;
    debug!("authentication tag verified");

    reader
        .seek(SeekFrom::Start(header.encoded_len() as u64))
        .map_err(seek_error)?;
    Ok(())
}

fn fill_artifact<R: Read>(
    handle: &mut ArtifactHandle,
    reader: &mut R,
    header: &Header,
    key: &DerivedKey,
    options: &DecryptOptions,
    progress: &mut dyn ProgressSink,
    cancel: &CancelToken,
) -> Result<u64> {
    let mut file = handle.take_file().ok_or_else(|| {
        SecureMediaError::with_kind(
            ErrorCategory::Internal,
            ErrorKind::InternalInvariant,
            "fresh artifact has no open file",
        )
    })?;
    let len = pump(reader, &mut file, header, key, options, progress, cancel)?;
    file.flush().map_err(write_error)?;
    Ok(len)
}

/// The chunk loop shared by every decryption entry point.
fn pump<R: Read, W: Write>(
    reader: &mut R,
    writer: &mut W,
    header: &Header,
    key: &DerivedKey,
    options: &DecryptOptions,
    progress: &mut dyn ProgressSink,
    cancel: &CancelToken,
) -> Result<u64> {
    let total = header.payload_length;
    if total == 0 {
        progress.report(ProgressEvent {
            bytes_processed: 0,
            bytes_total: 0,
        });
        return Ok(0);
    }

    let sniff =
        options.check_signature && !header.version.is_authenticated() && !header.is_directory;
    let mut stream = CtrStream::new(key, CounterState::new(header.nonce));
    let mut buf = Zeroizing::new(vec![0u8; options.chunk_size]);
    let mut processed = 0u64;
    while processed < total {
        if cancel.is_cancelled() {
            return Err(SecureMediaError::cancelled());
        }
        let want = (total - processed).min(options.chunk_size as u64) as usize;
        let chunk = &mut buf[..want];
        reader.read_exact(chunk).map_err(payload_read_error)?;
        stream.apply(chunk);

        if processed == 0
            && sniff
            && matches_signature(&header.original_extension, chunk) == Some(false)
        {
            return Err(SecureMediaError::with_kind(
                ErrorCategory::User,
                ErrorKind::WrongPasswordSuspected,
                format!(
                    "decrypted data does not look like a .{} file; the password is probably wrong",
                    header.original_extension
                ),
            ));
        }

        writer.write_all(chunk).map_err(write_error)?;
        processed += want as u64;
        trace!(processed, total, "decrypted chunk");
        progress.report(ProgressEvent {
            bytes_processed: processed,
            bytes_total: total,
        });
    }
    Ok(processed)
}

/// Human-recognizable part of the artifact name: the input's file name
/// without a trailing `.enc` and without the recorded extension, which the
/// artifact manager appends again.
fn artifact_stem(input_path: &Path, extension: &str) -> String {
    let name = input_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = strip_suffix_ignore_case(&name, ".enc");
    let name = if extension.is_empty() {
        name
    } else {
        strip_suffix_ignore_case(name, &format!(".{}", extension))
    };
    name.to_string()
}

fn strip_suffix_ignore_case<'a>(s: &'a str, suffix: &str) -> &'a str {
    let Some(split) = s.len().checked_sub(suffix.len()) else {
        return s;
    };
    if s.is_char_boundary(split) && s[split..].eq_ignore_ascii_case(suffix) {
        &s[..split]
    } else {
        s
    }
}

fn payload_read_error(err: io::Error) -> SecureMediaError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        SecureMediaError::with_kind_and_source(
            ErrorCategory::User,
            ErrorKind::TruncatedInput,
            "container ended early while reading ciphertext",
            err,
        )
    } else {
        SecureMediaError::with_kind_and_source(
            ErrorCategory::Internal,
            ErrorKind::Io,
            "failed to read ciphertext",
            err,
        )
    }
}

fn seek_error(err: io::Error) -> SecureMediaError {
    SecureMediaError::with_kind_and_source(
        ErrorCategory::Internal,
        ErrorKind::Io,
        "failed to seek in input",
        err,
    )
}

/// Where [`decrypt_to_file`] writes when the caller names no output: the
/// input path with `.enc` removed, or with the recorded extension appended
/// if there is no `.enc` to remove.
pub fn default_output_path(input_path: &Path, header: &Header) -> PathBuf {
    let name = input_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stripped = strip_suffix_ignore_case(&name, ".enc");
    let file_name = if stripped.len() < name.len() && !stripped.is_empty() {
        stripped.to_string()
    } else if header.original_extension.is_empty() {
        format!("{}.out", name)
    } else {
        format!("{}.{}", name, header.original_extension)
    };
    input_path.with_file_name(file_name)
}
