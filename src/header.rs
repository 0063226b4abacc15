//! Container header codec
//!
//! Every encrypted file starts with a versioned, fixed-layout header. All
//! integers are big-endian:
//!
//! - magic: 4 bytes, `SMCF`
//! - version: 1 byte (1 = counter mode only, 2 = counter mode + HMAC tag)
//! - extension length: 1 byte, at most [`MAX_EXTENSION_LEN`]
//! - original extension: ASCII alphanumeric, no leading dot
//! - directory flag: 1 byte, 0 or 1
//! - salt: [`SALT_LEN`] bytes
//! - nonce: [`NONCE_LEN`] bytes, the initial counter block
//! - payload length: 8 bytes (u64)
//!
//! The ciphertext follows the header. Version 2 containers end with a
//! [`TAG_LEN`] byte authentication tag.

use crate::error::{ErrorCategory, ErrorKind, Result, SecureMediaError};
use std::io::{self, Read};

/// Magic marker at the start of every container
pub const MAGIC: [u8; 4] = *b"SMCF";

/// Length of salt in bytes
pub const SALT_LEN: usize = 16;

/// Length of nonce (initial counter block) in bytes
pub const NONCE_LEN: usize = 16;

/// Longest original extension we accept
pub const MAX_EXTENSION_LEN: usize = 32;

/// Length of the version 2 authentication tag (HMAC-SHA256)
pub const TAG_LEN: usize = 32;

/// Size of the leading fields up to and including the extension length byte
const PREFIX_LEN: usize = MAGIC.len() + 1 + 1;

/// Size of the fields following the extension
const SUFFIX_LEN: usize = 1 + SALT_LEN + NONCE_LEN + 8;

/// Size of a header with an empty extension, i.e. the smallest valid header
pub const FIXED_HEADER_LEN: usize = PREFIX_LEN + SUFFIX_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatVersion {
    /// Counter-mode ciphertext with no integrity protection
    V1,
    /// Counter-mode ciphertext followed by an HMAC-SHA256 tag
    V2,
}

impl FormatVersion {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::V1),
            2 => Some(Self::V2),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            Self::V1 => 1,
            Self::V2 => 2,
        }
    }

    pub fn is_authenticated(self) -> bool {
        self == Self::V2
    }

    /// Bytes that follow the ciphertext
    pub fn trailer_len(self) -> usize {
        if self.is_authenticated() { TAG_LEN } else { 0 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub version: FormatVersion,
    pub original_extension: String,
    pub is_directory: bool,
    pub salt: [u8; SALT_LEN],
    pub nonce: [u8; NONCE_LEN],
    pub payload_length: u64,
}

impl Header {
    /// Build a header for the encryption path.
    ///
    /// A single leading dot on `extension` is dropped, so both `mp4` and
    /// `.mp4` are accepted.
    pub fn new(
        version: FormatVersion,
        extension: &str,
        is_directory: bool,
        salt: [u8; SALT_LEN],
        nonce: [u8; NONCE_LEN],
        payload_length: u64,
    ) -> Result<Self> {
        let extension = extension.strip_prefix('.').unwrap_or(extension);
        if !is_valid_extension(extension.as_bytes()) {
            return Err(SecureMediaError::invalid_input(format!(
                "extension must be at most {} ASCII letters or digits, got {:?}",
                MAX_EXTENSION_LEN, extension
            )));
        }
        Ok(Self {
            version,
            original_extension: extension.to_string(),
            is_directory,
            salt,
            nonce,
            payload_length,
        })
    }

    /// Number of bytes `to_bytes` produces
    pub fn encoded_len(&self) -> usize {
        FIXED_HEADER_LEN + self.original_extension.len()
    }

    /// Total size of a well-formed container carrying this header, or `None`
    /// if the declared payload length does not fit in a `u64` file size.
    pub fn container_len(&self) -> Option<u64> {
        (self.encoded_len() as u64)
            .checked_add(self.payload_length)?
            .checked_add(self.version.trailer_len() as u64)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.extend_from_slice(&MAGIC);
        out.push(self.version.as_byte());
        // Extension length is bounded by MAX_EXTENSION_LEN at construction.
        out.push(self.original_extension.len() as u8);
        out.extend_from_slice(self.original_extension.as_bytes());
        out.push(u8::from(self.is_directory));
        out.extend_from_slice(&self.salt);
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.payload_length.to_be_bytes());
        out
    }

    /// Parse a header from the start of `raw`.
    ///
    /// Returns the header and the number of bytes it occupied. Bytes past the
    /// header are ignored.
    pub fn parse(raw: &[u8]) -> Result<(Self, usize)> {
        let (version, ext_len) = check_prefix(raw)?;
        let total = FIXED_HEADER_LEN + ext_len;
        if raw.len() < total {
            return Err(SecureMediaError::format(
                ErrorKind::TruncatedInput,
                "input likely truncated while reading header",
            ));
        }

        let mut pos = PREFIX_LEN;
        let extension = &raw[pos..pos + ext_len];
        if !is_valid_extension(extension) {
            return Err(SecureMediaError::format(
                ErrorKind::Format,
                "original extension contains unsupported characters",
            ));
        }
        pos += ext_len;

        let is_directory = match raw[pos] {
            0 => false,
            1 => true,
            other => {
                return Err(SecureMediaError::format(
                    ErrorKind::Format,
                    format!("invalid directory flag {}", other),
                ));
            }
        };
        pos += 1;

        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&raw[pos..pos + SALT_LEN]);
        pos += SALT_LEN;

        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&raw[pos..pos + NONCE_LEN]);
        pos += NONCE_LEN;

        let mut length_bytes = [0u8; 8];
        length_bytes.copy_from_slice(&raw[pos..pos + 8]);
        pos += 8;

        // Already checked by is_valid_extension to be ASCII.
        let original_extension = String::from_utf8_lossy(extension).into_owned();

        Ok((
            Self {
                version,
                original_extension,
                is_directory,
                salt,
                nonce,
                payload_length: u64::from_be_bytes(length_bytes),
            },
            pos,
        ))
    }

    /// Read exactly one header from `reader`, leaving it positioned at the
    /// first ciphertext byte.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut raw = vec![0u8; PREFIX_LEN];
        read_header_bytes(reader, &mut raw)?;
        let (_, ext_len) = check_prefix(&raw)?;

        raw.resize(PREFIX_LEN + ext_len + SUFFIX_LEN, 0);
        read_header_bytes(reader, &mut raw[PREFIX_LEN..])?;

        let (header, _) = Self::parse(&raw)?;
        Ok(header)
    }
}

/// Validate magic, version and extension length, the part of the header
/// that decides how many more bytes to read.
fn check_prefix(raw: &[u8]) -> Result<(FormatVersion, usize)> {
    if raw.len() < MAGIC.len() {
        return Err(SecureMediaError::format(
            ErrorKind::TruncatedInput,
            "input size smaller than magic marker; likely truncated",
        ));
    }
    if raw[..MAGIC.len()] != MAGIC {
        return Err(SecureMediaError::format(
            ErrorKind::Format,
            "input unrecognized as an encrypted media container",
        ));
    }
    if raw.len() < PREFIX_LEN {
        return Err(SecureMediaError::format(
            ErrorKind::TruncatedInput,
            "input likely truncated while reading header",
        ));
    }

    let version_byte = raw[MAGIC.len()];
    let version = FormatVersion::from_byte(version_byte).ok_or_else(|| {
        SecureMediaError::format(
            ErrorKind::UnsupportedVersion,
            format!("container version {} is not supported", version_byte),
        )
    })?;

    let ext_len = raw[PREFIX_LEN - 1] as usize;
    if ext_len > MAX_EXTENSION_LEN {
        return Err(SecureMediaError::format(
            ErrorKind::Format,
            format!(
                "original extension length {} exceeds maximum of {}",
                ext_len, MAX_EXTENSION_LEN
            ),
        ));
    }
    Ok((version, ext_len))
}

fn read_header_bytes<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    reader.read_exact(buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            SecureMediaError::format(
                ErrorKind::TruncatedInput,
                "input likely truncated while reading header",
            )
        } else {
            SecureMediaError::with_kind_and_source(
                ErrorCategory::Internal,
                ErrorKind::Io,
                "failed to read header",
                e,
            )
        }
    })
}

fn is_valid_extension(ext: &[u8]) -> bool {
    ext.len() <= MAX_EXTENSION_LEN && ext.iter().all(u8::is_ascii_alphanumeric)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Header {
        Header::new(
            FormatVersion::V1,
            "mp4",
            false,
            [0x11; SALT_LEN],
            [0x22; NONCE_LEN],
            1234,
        )
        .unwrap()
    }

    #[test]
    fn test_exact_layout() {
        let bytes = sample().to_bytes();

        #[rustfmt::skip]
        let mut expected: Vec<u8> = vec![
            b'S', b'M', b'C', b'F',
            0x01,
            0x03, b'm', b'p', b'4',
            0x00,
        ];
        expected.extend_from_slice(&[0x11; SALT_LEN]);
        expected.extend_from_slice(&[0x22; NONCE_LEN]);
        expected.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0x04, 0xd2]);

        assert_eq!(bytes, expected);
        assert_eq!(bytes.len(), sample().encoded_len());
    }

    #[test]
    fn test_parse_ignores_following_bytes() {
        let header = sample();
        let mut bytes = header.to_bytes();
        bytes.extend_from_slice(b"ciphertext");

        let (parsed, consumed) = Header::parse(&bytes).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(consumed, header.encoded_len());
    }

    #[test]
    fn test_read_from_stops_at_ciphertext() {
        let header = Header::new(
            FormatVersion::V2,
            ".mkv",
            true,
            [7; SALT_LEN],
            [9; NONCE_LEN],
            0,
        )
        .unwrap();
        let mut bytes = header.to_bytes();
        bytes.extend_from_slice(b"rest");

        let mut reader = &bytes[..];
        let parsed = Header::read_from(&mut reader).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.original_extension, "mkv");
        assert_eq!(reader, b"rest");
    }

    #[test]
    fn test_empty_extension() {
        let header = Header::new(FormatVersion::V1, "", false, [0; 16], [0; 16], 0).unwrap();
        assert_eq!(header.encoded_len(), FIXED_HEADER_LEN);
        let (parsed, _) = Header::parse(&header.to_bytes()).unwrap();
        assert_eq!(parsed.original_extension, "");
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = sample().to_bytes();
        bytes[0] = b'X';
        let err = Header::parse(&bytes).expect_err("expected bad magic error");
        assert_eq!(err.kind, Some(ErrorKind::Format));
    }

    #[test]
    fn test_missing_magic() {
        let err = Header::parse(b"").expect_err("expected truncated input error");
        assert_eq!(err.kind, Some(ErrorKind::TruncatedInput));
    }

    #[test]
    fn test_future_version() {
        let mut bytes = sample().to_bytes();
        bytes[4] = 99;
        let err = Header::parse(&bytes).expect_err("expected unsupported version error");
        assert_eq!(err.kind, Some(ErrorKind::UnsupportedVersion));

        let mut reader = &bytes[..];
        let err = Header::read_from(&mut reader).expect_err("expected unsupported version");
        assert_eq!(err.kind, Some(ErrorKind::UnsupportedVersion));
    }

    #[test]
    fn test_oversized_extension_length() {
        let mut bytes = sample().to_bytes();
        bytes[5] = 200;
        let err = Header::parse(&bytes).expect_err("expected bounded extension error");
        assert_eq!(err.kind, Some(ErrorKind::Format));
    }

    #[test]
    fn test_extension_with_path_separator() {
        let mut bytes = sample().to_bytes();
        bytes[7] = b'/';
        let err = Header::parse(&bytes).expect_err("expected extension error");
        assert_eq!(err.kind, Some(ErrorKind::Format));
    }

    #[test]
    fn test_invalid_directory_flag() {
        let mut bytes = sample().to_bytes();
        bytes[9] = 2;
        let err = Header::parse(&bytes).expect_err("expected directory flag error");
        assert_eq!(err.kind, Some(ErrorKind::Format));
    }

    #[test]
    fn test_truncated_header() {
        let bytes = sample().to_bytes();
        for len in [4, 5, 6, 20, bytes.len() - 1] {
            let err = Header::parse(&bytes[..len]).expect_err("expected truncation");
            assert_eq!(err.kind, Some(ErrorKind::TruncatedInput), "len {}", len);

            let mut reader = &bytes[..len];
            let err = Header::read_from(&mut reader).expect_err("expected truncation");
            assert_eq!(err.kind, Some(ErrorKind::TruncatedInput), "len {}", len);
        }
    }

    #[test]
    fn test_new_rejects_bad_extensions() {
        let long = "a".repeat(MAX_EXTENSION_LEN + 1);
        for ext in ["m/p4", "..", "mp 4", long.as_str()] {
            let err = Header::new(FormatVersion::V1, ext, false, [0; 16], [0; 16], 0)
                .expect_err("expected invalid extension");
            assert_eq!(err.kind, Some(ErrorKind::InvalidInput), "ext {:?}", ext);
        }
    }

    #[test]
    fn test_container_len_includes_tag() {
        let mut header = sample();
        assert_eq!(header.container_len(), Some(header.encoded_len() as u64 + 1234));
        header.version = FormatVersion::V2;
        assert_eq!(
            header.container_len(),
            Some(header.encoded_len() as u64 + 1234 + TAG_LEN as u64)
        );
    }

    #[test]
    fn test_container_len_overflow() {
        let mut header = sample();
        header.payload_length = u64::MAX;
        assert_eq!(header.container_len(), None);

        // Still parses: the length is only checked against the input size.
        let (parsed, _) = Header::parse(&header.to_bytes()).unwrap();
        assert_eq!(parsed.payload_length, u64::MAX);
        assert_eq!(parsed.container_len(), None);
    }
}
