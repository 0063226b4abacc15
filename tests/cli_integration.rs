//! CLI integration tests
//!
//! Tests the command-line interface end-to-end.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use tempfile::TempDir;

/// Get path to the secure-media binary
fn secure_media_bin() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // Remove test binary name
    path.pop(); // Remove deps/
    path.push("secure-media");
    path
}

/// Run secure-media with the password on stdin. Temporary files go to
/// `temp_dir`.
fn run_with_password(
    args: &[&str],
    password: &str,
    temp_dir: &Path,
) -> Result<Output, std::io::Error> {
    let mut child = Command::new(secure_media_bin())
        .arg("--password-stdin")
        .args(args)
        .env("SECURE_MEDIA_TEMP_DIR", temp_dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    {
        let stdin = child.stdin.as_mut().expect("failed to open stdin");
        // Ignore BrokenPipe errors - the command may exit before reading stdin
        // if it encounters an error (e.g., file not found)
        let _ = stdin.write_all(password.as_bytes());
    }

    child.wait_with_output()
}

/// Get path to testdata directory
fn testdata_path(filename: &str) -> PathBuf {
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.push("testdata");
    path.push(filename);
    path
}

fn assert_success(output: &Output, what: &str) {
    assert!(
        output.status.success(),
        "{} failed: {}",
        what,
        String::from_utf8_lossy(&output.stderr)
    );
}

fn encrypt(temp: &TempDir, input: &Path, output: &Path, password: &str, extra: &[&str]) {
    let mut args = vec![
        "encrypt",
        "-i",
        input.to_str().unwrap(),
        "-o",
        output.to_str().unwrap(),
    ];
    args.extend_from_slice(extra);
    let result = run_with_password(&args, password, temp.path()).unwrap();
    assert_success(&result, "encrypt");
}

/// Decrypt known ciphertext.
#[test]
fn test_decrypt_known_ciphertext() {
    let temp_dir = TempDir::new().unwrap();
    let expected = fs::read_to_string(testdata_path("hello.txt")).unwrap();

    for container in ["hello.txt.enc", "hello-v1.txt.enc"] {
        let output = temp_dir.path().join(format!("{}.out", container));
        let result = run_with_password(
            &[
                "decrypt",
                "-i",
                testdata_path(container).to_str().unwrap(),
                "-o",
                output.to_str().unwrap(),
            ],
            "test",
            temp_dir.path(),
        )
        .unwrap();
        assert_success(&result, "decrypt");
        assert_eq!(fs::read_to_string(&output).unwrap(), expected);
    }
}

#[test]
fn test_encrypt_decrypt_roundtrip() {
    let temp_dir = TempDir::new().unwrap();
    let plaintext_path = testdata_path("hello.txt");
    let encrypted_path = temp_dir.path().join("hello.txt.enc");

    encrypt(&temp_dir, &plaintext_path, &encrypted_path, "test\n", &[]);

    // No -o: the output lands next to the input with .enc removed.
    let result = run_with_password(
        &["decrypt", "-i", encrypted_path.to_str().unwrap()],
        "test\n",
        temp_dir.path(),
    )
    .unwrap();
    assert_success(&result, "decrypt");

    let original = fs::read_to_string(&plaintext_path).unwrap();
    let decrypted = fs::read_to_string(temp_dir.path().join("hello.txt")).unwrap();
    assert_eq!(original, decrypted);
}

#[test]
fn test_decrypt_with_wrong_password_fails() {
    let temp_dir = TempDir::new().unwrap();
    let output = temp_dir.path().join("output.txt");

    let result = run_with_password(
        &[
            "decrypt",
            "-i",
            testdata_path("hello.txt.enc").to_str().unwrap(),
            "-o",
            output.to_str().unwrap(),
        ],
        "wrong_password",
        temp_dir.path(),
    )
    .unwrap();

    assert!(!result.status.success());
    let stderr = String::from_utf8_lossy(&result.stderr);
    assert!(
        stderr.contains("authentication failed"),
        "Expected error message about authentication, got: {}",
        stderr
    );
    assert!(!output.exists());
}

#[test]
fn test_decrypt_nonexistent_file_fails() {
    let temp_dir = TempDir::new().unwrap();
    let nonexistent = temp_dir.path().join("nonexistent.enc");
    let output = temp_dir.path().join("output.txt");

    let result = run_with_password(
        &[
            "decrypt",
            "-i",
            nonexistent.to_str().unwrap(),
            "-o",
            output.to_str().unwrap(),
        ],
        "test",
        temp_dir.path(),
    )
    .unwrap();

    assert!(!result.status.success());
    assert!(!output.exists());
}

#[test]
fn test_decrypt_rejects_non_container() {
    let temp_dir = TempDir::new().unwrap();
    let output = temp_dir.path().join("output.txt");

    let result = run_with_password(
        &[
            "decrypt",
            "-i",
            testdata_path("hello.txt").to_str().unwrap(),
            "-o",
            output.to_str().unwrap(),
        ],
        "test",
        temp_dir.path(),
    )
    .unwrap();

    assert!(!result.status.success());
    let stderr = String::from_utf8_lossy(&result.stderr);
    assert!(stderr.contains("unrecognized"), "got: {}", stderr);
    assert!(!output.exists());
}

#[test]
fn test_empty_file_roundtrip() {
    let temp_dir = TempDir::new().unwrap();
    let plaintext = temp_dir.path().join("empty.bin");
    let encrypted = temp_dir.path().join("empty.bin.enc");
    let decrypted = temp_dir.path().join("empty-decrypted.bin");

    fs::write(&plaintext, b"").unwrap();
    encrypt(&temp_dir, &plaintext, &encrypted, "test", &[]);

    let result = run_with_password(
        &[
            "decrypt",
            "-i",
            encrypted.to_str().unwrap(),
            "-o",
            decrypted.to_str().unwrap(),
        ],
        "test",
        temp_dir.path(),
    )
    .unwrap();

    assert_success(&result, "decrypt");
    assert_eq!(fs::read(&decrypted).unwrap(), b"");
}

#[test]
fn test_large_file_roundtrip_small_chunks() {
    let temp_dir = TempDir::new().unwrap();
    let plaintext = temp_dir.path().join("large.bin");
    let encrypted = temp_dir.path().join("large.bin.enc");
    let decrypted = temp_dir.path().join("large-decrypted.bin");

    let large_content: Vec<u8> = (0..1024 * 1024 + 5).map(|i| (i % 251) as u8).collect();
    fs::write(&plaintext, &large_content).unwrap();
    encrypt(&temp_dir, &plaintext, &encrypted, "test", &["--unauthenticated"]);

    let result = run_with_password(
        &[
            "--chunk-size",
            "4096",
            "decrypt",
            "-i",
            encrypted.to_str().unwrap(),
            "-o",
            decrypted.to_str().unwrap(),
        ],
        "test",
        temp_dir.path(),
    )
    .unwrap();

    assert_success(&result, "decrypt");
    assert_eq!(fs::read(&decrypted).unwrap(), large_content);
}

#[test]
fn test_inspect() {
    let temp_dir = TempDir::new().unwrap();
    let plaintext = temp_dir.path().join("clip");
    let encrypted = temp_dir.path().join("clip.enc");
    fs::write(&plaintext, b"0123456789").unwrap();
    encrypt(&temp_dir, &plaintext, &encrypted, "test", &["--extension", "webm"]);

    let result = run_with_password(
        &["inspect", "-i", encrypted.to_str().unwrap()],
        "",
        temp_dir.path(),
    )
    .unwrap();
    assert_success(&result, "inspect");
    let stdout = String::from_utf8_lossy(&result.stdout);
    assert!(stdout.contains("version:        2"), "{}", stdout);
    assert!(stdout.contains("extension:      webm"), "{}", stdout);
    assert!(stdout.contains("payload length: 10"), "{}", stdout);
}

/// `open --exec` hands the player a path inside a private session directory
/// that is gone once the player exits.
#[test]
#[cfg(unix)]
fn test_open_exec_cleans_up() {
    let temp_dir = TempDir::new().unwrap();
    let sessions = temp_dir.path().join("sessions");
    fs::create_dir(&sessions).unwrap();
    let copy = temp_dir.path().join("copy.txt");

    // The artifact path is appended as the last argument, i.e. $0 here.
    let script = format!("cp \"$0\" '{}'", copy.display());
    let result = run_with_password(
        &[
            "open",
            "-i",
            testdata_path("hello.txt.enc").to_str().unwrap(),
            "--exec",
            "sh",
            "-c",
            &script,
        ],
        "test",
        &sessions,
    )
    .unwrap();
    assert_success(&result, "open");

    let printed = String::from_utf8_lossy(&result.stdout);
    let artifact = PathBuf::from(printed.trim());
    assert!(artifact.starts_with(&sessions), "{}", printed);
    assert!(artifact.to_str().unwrap().ends_with(".txt"));
    assert!(!artifact.exists());
    assert_eq!(
        fs::read(&copy).unwrap(),
        fs::read(testdata_path("hello.txt")).unwrap()
    );
    assert_eq!(fs::read_dir(&sessions).unwrap().count(), 0);
}

#[test]
fn test_open_refuses_directory_payload() {
    let temp_dir = TempDir::new().unwrap();
    let plaintext = temp_dir.path().join("album.tar");
    let encrypted = temp_dir.path().join("album.tar.enc");
    fs::write(&plaintext, b"packed").unwrap();
    encrypt(&temp_dir, &plaintext, &encrypted, "test", &["--directory"]);

    let result = run_with_password(
        &["open", "-i", encrypted.to_str().unwrap(), "--exec", "true"],
        "test",
        temp_dir.path(),
    )
    .unwrap();
    assert!(!result.status.success());
    let stderr = String::from_utf8_lossy(&result.stderr);
    assert!(stderr.contains("packed directory"), "{}", stderr);
}

/// A pid no process can have
const DEAD_PID: u32 = 4_000_000_000;

#[test]
fn test_sweep_removes_stale_sessions() {
    let temp_dir = TempDir::new().unwrap();
    let stale = temp_dir.path().join(format!("secure-media-{}-leftover", DEAD_PID));
    fs::create_dir(&stale).unwrap();
    fs::write(stale.join("movie-abc123.mp4"), b"plaintext").unwrap();

    let result = run_with_password(&["sweep", "--max-age-secs", "0"], "", temp_dir.path()).unwrap();
    assert_success(&result, "sweep");
    assert!(!stale.exists());
    assert!(String::from_utf8_lossy(&result.stdout).contains("removed 1"));
}

/// `open` sweeps crashed sessions on startup but leaves those of running
/// players alone.
#[test]
#[cfg(unix)]
fn test_open_sweeps_only_dead_sessions() {
    let temp_dir = TempDir::new().unwrap();
    let sessions = temp_dir.path().join("sessions");
    fs::create_dir(&sessions).unwrap();
    let crashed = sessions.join(format!("secure-media-{}-crashed", DEAD_PID));
    fs::create_dir(&crashed).unwrap();
    fs::write(crashed.join("movie-abc123.mp4"), b"plaintext").unwrap();
    // Owned by this test process, which is alive and unknown to the CLI.
    let playing = sessions.join(format!("secure-media-{}-playing", std::process::id()));
    fs::create_dir(&playing).unwrap();
    fs::write(playing.join("movie-def456.mp4"), b"plaintext").unwrap();

    // Age the crashed session past the startup threshold.
    let old = std::time::SystemTime::now() - std::time::Duration::from_secs(3600);
    fs::File::open(&crashed).unwrap().set_modified(old).unwrap();

    let result = run_with_password(
        &[
            "open",
            "-i",
            testdata_path("hello.txt.enc").to_str().unwrap(),
            "--exec",
            "true",
        ],
        "test",
        &sessions,
    )
    .unwrap();
    assert_success(&result, "open");
    assert!(!crashed.exists());
    assert!(playing.join("movie-def456.mp4").exists());
}

#[test]
#[cfg(unix)]
fn test_open_refuses_empty_payload() {
    let temp_dir = TempDir::new().unwrap();
    let sessions = temp_dir.path().join("sessions");
    fs::create_dir(&sessions).unwrap();
    let plaintext = temp_dir.path().join("empty.mp4");
    let encrypted = temp_dir.path().join("empty.mp4.enc");
    fs::write(&plaintext, b"").unwrap();
    encrypt(&temp_dir, &plaintext, &encrypted, "test", &[]);

    let marker = temp_dir.path().join("player-ran");
    let script = format!("touch '{}'", marker.display());
    let result = run_with_password(
        &[
            "open",
            "-i",
            encrypted.to_str().unwrap(),
            "--exec",
            "sh",
            "-c",
            &script,
        ],
        "test",
        &sessions,
    )
    .unwrap();
    assert!(!result.status.success());
    let stderr = String::from_utf8_lossy(&result.stderr);
    assert!(stderr.contains("empty"), "{}", stderr);
    assert!(!marker.exists());
    assert_eq!(fs::read_dir(&sessions).unwrap().count(), 0);
}
