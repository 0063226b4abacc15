//! Password acquisition

use crate::error::{ErrorCategory, ErrorKind, Result, SecureMediaError};
use std::io::{self, IsTerminal, Read, Write};
use zeroize::Zeroizing;

/// Source of container passwords
pub trait PasswordReader {
    /// Read a password as arbitrary bytes (not necessarily UTF-8)
    ///
    /// Returns the password wrapped in `Zeroizing` to ensure it is securely
    /// wiped from memory when dropped. An empty password is an error.
    fn read_password(&mut self) -> Result<Zeroizing<Vec<u8>>>;
}

/// Returns a fixed password
pub struct ConstantPasswordReader {
    password: Zeroizing<Vec<u8>>,
}

impl ConstantPasswordReader {
    pub fn new(password: Vec<u8>) -> Self {
        Self {
            password: Zeroizing::new(password),
        }
    }
}

impl PasswordReader for ConstantPasswordReader {
    fn read_password(&mut self) -> Result<Zeroizing<Vec<u8>>> {
        non_empty(Zeroizing::new((*self.password).clone()))
    }
}

/// Reads the password from any io::Read source, typically stdin.
///
/// Everything up to end of input is used, minus one trailing line ending, so
/// that `echo secret | secure-media ...` works as expected.
pub struct ReaderPasswordReader {
    reader: Box<dyn Read>,
}

impl ReaderPasswordReader {
    pub fn new(reader: Box<dyn Read>) -> Self {
        Self { reader }
    }
}

impl PasswordReader for ReaderPasswordReader {
    fn read_password(&mut self) -> Result<Zeroizing<Vec<u8>>> {
        let mut data = Zeroizing::new(Vec::new());
        self.reader.read_to_end(&mut data).map_err(|e| {
            SecureMediaError::with_kind_and_source(
                ErrorCategory::Internal,
                ErrorKind::Io,
                format!("error reading password: {}", e),
                e,
            )
        })?;
        if data.last() == Some(&b'\n') {
            data.pop();
            if data.last() == Some(&b'\r') {
                data.pop();
            }
        }
        non_empty(data)
    }
}

/// Reads the password from the terminal with no echo
pub struct TerminalPasswordReader {
    confirm: bool,
}

impl TerminalPasswordReader {
    pub fn new() -> Self {
        Self { confirm: false }
    }

    /// Ask twice and require both entries to match. Used when encrypting,
    /// where a typo would make the container unrecoverable.
    pub fn confirming() -> Self {
        Self { confirm: true }
    }
}

impl Default for TerminalPasswordReader {
    fn default() -> Self {
        Self::new()
    }
}

impl PasswordReader for TerminalPasswordReader {
    /// Read password from terminal.
    ///
    /// Note: Terminal input is limited to UTF-8 due to rpassword library constraints.
    /// For non-UTF-8 passwords, use --password-stdin instead.
    fn read_password(&mut self) -> Result<Zeroizing<Vec<u8>>> {
        if !io::stdin().is_terminal() {
            return Err(SecureMediaError::with_kind(
                ErrorCategory::User,
                ErrorKind::PasswordUnavailable,
                "cannot read password from terminal - stdin is not a terminal",
            ));
        }

        let password = non_empty(prompt("Password: ")?)?;
        if self.confirm {
            let again = prompt("Confirm password: ")?;
            if *again != *password {
                return Err(SecureMediaError::with_kind(
                    ErrorCategory::User,
                    ErrorKind::PasswordUnavailable,
                    "passwords do not match",
                ));
            }
        }
        Ok(password)
    }
}

fn prompt(text: &str) -> Result<Zeroizing<Vec<u8>>> {
    let mut stderr = io::stderr();
    stderr
        .write_all(text.as_bytes())
        .and_then(|_| stderr.flush())
        .map_err(|e| {
            SecureMediaError::with_kind_and_source(
                ErrorCategory::Internal,
                ErrorKind::Io,
                format!("failed to write prompt: {}", e),
                e,
            )
        })?;

    // Read password *without echo*
    // Note: rpassword returns String (UTF-8 only), not zeroized
    let password = rpassword::read_password().map_err(|e| {
        SecureMediaError::with_kind_and_source(
            ErrorCategory::Internal,
            ErrorKind::PasswordUnavailable,
            format!("failure reading password: {}", e),
            e,
        )
    })?;
    Ok(Zeroizing::new(password.into_bytes()))
}

fn non_empty(password: Zeroizing<Vec<u8>>) -> Result<Zeroizing<Vec<u8>>> {
    if password.is_empty() {
        return Err(SecureMediaError::with_kind(
            ErrorCategory::User,
            ErrorKind::PasswordUnavailable,
            "password must not be empty",
        ));
    }
    Ok(password)
}
