//! Container encryption and secure file output
//!
//! This module provides the encryption counterpart of [`crate::decrypt`] and
//! the helpers both directions use to write files safely.

use crate::decrypt::DEFAULT_CHUNK_SIZE;
use crate::error::{ErrorCategory, ErrorKind, Result, SecureMediaError};
use crate::header::{FormatVersion, Header, NONCE_LEN, SALT_LEN};
use crate::kdf::{HmacSha256, PBKDF2_ITERATIONS, derive_key};
use crate::keystream::{CounterState, CtrStream};
use hmac::Mac;
use rand::RngCore;
use rand::rngs::OsRng;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::Path;
use tracing::{debug, info, instrument};
use zeroize::Zeroizing;

#[derive(Debug, Clone)]
pub struct EncryptOptions {
    /// Container version to write. Version 2 adds an authentication tag.
    pub version: FormatVersion,
    /// PBKDF2 iterations; the same count must be used to decrypt.
    pub iterations: u32,
    /// Extension to record instead of the input file's own.
    pub extension: Option<String>,
    /// Mark the payload as a packed directory.
    pub is_directory: bool,
    pub chunk_size: usize,
}

impl Default for EncryptOptions {
    fn default() -> Self {
        Self {
            version: FormatVersion::V2,
            iterations: PBKDF2_ITERATIONS,
            extension: None,
            is_directory: false,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// Encrypt a file with a password
///
/// Reads plaintext from `input_path` and writes the container to
/// `output_path` with a fresh random salt and nonce. The output appears
/// atomically and is created with mode 0o600 (read/write for owner only) on
/// Unix systems.
#[instrument(skip_all, fields(input = %input_path.display()))]
pub fn encrypt_file(
    input_path: &Path,
    output_path: &Path,
    password: &[u8],
    options: &EncryptOptions,
) -> Result<Header> {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);

    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let file = File::open(input_path).map_err(|e| read_error(input_path, e))?;
    let payload_length = file
        .metadata()
        .map_err(|e| read_error(input_path, e))?
        .len();

    let extension = match &options.extension {
        Some(ext) => ext.clone(),
        None => input_path
            .extension()
            .map(|e| {
                e.to_str().map(str::to_string).ok_or_else(|| {
                    SecureMediaError::invalid_input(
                        "input extension is not valid UTF-8; pass one explicitly",
                    )
                })
            })
            .transpose()?
            .unwrap_or_default(),
    };

    let header = Header::new(
        options.version,
        &extension,
        options.is_directory,
        salt,
        nonce,
        payload_length,
    )?;

    let mut reader = io::BufReader::new(file);
    write_atomically(output_path, |out| {
        encrypt_stream(
            &mut reader,
            out,
            password,
            &header,
            options.iterations,
            options.chunk_size,
        )
    })
    .map_err(|e| e.with_context(format!("failed to write to {}", output_path.display())))?;

    info!(
        version = ?header.version,
        extension = %header.original_extension,
        payload_length,
        "encrypted container"
    );
    Ok(header)
}

/// Write a complete container for `header` to `writer`.
///
/// Exactly `header.payload_length` bytes are read from `reader`.
pub fn encrypt_stream<R: Read, W: Write>(
    reader: &mut R,
    writer: &mut W,
    password: &[u8],
    header: &Header,
    iterations: u32,
    chunk_size: usize,
) -> Result<()> {
    if chunk_size == 0 {
        return Err(SecureMediaError::invalid_input("chunk size must be positive"));
    }
    let key = derive_key(password, &header.salt, iterations)?;
    let header_bytes = header.to_bytes();

    let mut mac = if header.version.is_authenticated() {
        let mac_key = key.mac_key()?;
        let mut mac = HmacSha256::new_from_slice(mac_key.expose_secret()).map_err(|_| {
            SecureMediaError::with_kind(
                ErrorCategory::Internal,
                ErrorKind::InternalInvariant,
                "failed to initialize HMAC",
            )
        })?;
        mac.update(&header_bytes);
        Some(mac)
    } else {
        None
    };

    writer.write_all(&header_bytes).map_err(write_error)?;

    let mut stream = CtrStream::new(&key, CounterState::new(header.nonce));
    let mut buf = Zeroizing::new(vec![0u8; chunk_size]);
    let mut remaining = header.payload_length;
    while remaining > 0 {
        let want = remaining.min(chunk_size as u64) as usize;
        let chunk = &mut buf[..want];
        reader.read_exact(chunk).map_err(|e| {
            let kind = if e.kind() == io::ErrorKind::UnexpectedEof {
                ErrorKind::TruncatedInput
            } else {
                ErrorKind::Io
            };
            SecureMediaError::with_kind_and_source(
                ErrorCategory::Internal,
                kind,
                "plaintext ended early or could not be read",
                e,
            )
        })?;
        stream.apply(chunk);
        if let Some(mac) = mac.as_mut() {
            mac.update(chunk);
        }
        writer.write_all(chunk).map_err(write_error)?;
        remaining -= want as u64;
    }

    if let Some(mac) = mac {
        writer
            .write_all(&mac.finalize().into_bytes())
            .map_err(write_error)?;
    }
    debug!(payload_length = header.payload_length, "wrote container body");
    Ok(())
}

/// Encrypt an in-memory payload under a caller-supplied header.
///
/// This exists for tests and fixture generation, where salt and nonce must
/// be fixed. Production code should use [`encrypt_file`], which always draws
/// a fresh salt and nonce.
pub fn encrypt_with_header(
    password: &[u8],
    plaintext: &[u8],
    header: &Header,
    iterations: u32,
) -> Result<Vec<u8>> {
    if header.payload_length != plaintext.len() as u64 {
        return Err(SecureMediaError::invalid_input(format!(
            "header declares {} payload bytes but {} were given",
            header.payload_length,
            plaintext.len()
        )));
    }
    let mut out =
        Vec::with_capacity(header.encoded_len() + plaintext.len() + header.version.trailer_len());
    let mut reader = plaintext;
    encrypt_stream(
        &mut reader,
        &mut out,
        password,
        header,
        iterations,
        DEFAULT_CHUNK_SIZE,
    )?;
    Ok(out)
}

/// Produce `path` atomically: `fill` writes into a temporary file in the
/// same directory, which is then flushed, fsynced, restricted to 0o600 and
/// renamed into place.
///
/// If `fill` fails the temporary file is deleted and `path` is untouched.
pub(crate) fn write_atomically<T>(
    path: &Path,
    fill: impl FnOnce(&mut File) -> Result<T>,
) -> Result<T> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut temp_file = tempfile::NamedTempFile::new_in(dir).map_err(|e| {
        SecureMediaError::with_kind_and_source(
            ErrorCategory::User,
            ErrorKind::Io,
            format!("failed to create tempfile in {}", dir.display()),
            e,
        )
    })?;

    let value = fill(temp_file.as_file_mut())?;

    // Flush and fsync() such that the rename later, if it succeeds, will
    // always point to a valid file.
    temp_file.flush().map_err(|e| {
        SecureMediaError::with_kind_and_source(
            ErrorCategory::Internal,
            ErrorKind::Io,
            "failed to flush tempfile",
            e,
        )
    })?;
    temp_file.as_file().sync_all().map_err(|e| {
        SecureMediaError::with_kind_and_source(
            ErrorCategory::Internal,
            ErrorKind::Io,
            "failed to sync file prior to rename",
            e,
        )
    })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        temp_file
            .as_file()
            .set_permissions(fs::Permissions::from_mode(0o600))
            .map_err(|e| {
                SecureMediaError::with_kind_and_source(
                    ErrorCategory::Internal,
                    ErrorKind::Io,
                    "failed to set tempfile permissions",
                    e,
                )
            })?;
    }

    temp_file.persist(path).map_err(|e| {
        SecureMediaError::with_kind_and_source(
            ErrorCategory::Internal,
            ErrorKind::Io,
            format!("failed to rename to target file {}", path.display()),
            e,
        )
    })?;
    Ok(value)
}

pub(crate) fn read_error(path: &Path, err: io::Error) -> SecureMediaError {
    let category = if err.kind() == io::ErrorKind::NotFound {
        ErrorCategory::User
    } else {
        ErrorCategory::Internal
    };
    SecureMediaError::with_kind_and_source(
        category,
        ErrorKind::Io,
        format!("failed to read from {}", path.display()),
        err,
    )
}

pub(crate) fn write_error(err: io::Error) -> SecureMediaError {
    SecureMediaError::with_kind_and_source(
        ErrorCategory::Internal,
        ErrorKind::Io,
        "failed to write output",
        err,
    )
}
