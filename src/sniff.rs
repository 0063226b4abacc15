//! Media signature checks used to flag a probably-wrong password
//!
//! Version 1 containers carry no authentication tag, so a wrong password
//! decrypts to noise instead of failing. For extensions with a well-known
//! leading signature we can notice that noise after the first chunk.

/// Whether `prefix`, the first decrypted bytes, matches the signature of
/// `extension`.
///
/// `None` means no judgement is possible: the extension is unknown or the
/// prefix is too short.
pub fn matches_signature(extension: &str, prefix: &[u8]) -> Option<bool> {
    let ext = extension.to_ascii_lowercase();
    match ext.as_str() {
        "mp4" | "m4v" | "m4a" | "mov" | "3gp" => iso_bmff_box(prefix),
        "mkv" | "webm" => Some(prefix.get(..4)? == [0x1a, 0x45, 0xdf, 0xa3]),
        "avi" => riff(prefix, b"AVI "),
        "wav" => riff(prefix, b"WAVE"),
        "mp3" => {
            let head = prefix.get(..3)?;
            Some(head == b"ID3" || (head[0] == 0xff && head[1] & 0xe0 == 0xe0))
        }
        "flac" => Some(prefix.get(..4)? == b"fLaC"),
        "ogg" | "oga" | "ogv" | "opus" => Some(prefix.get(..4)? == b"OggS"),
        _ => None,
    }
}

/// Any plausible first box header. Plain files open with `ftyp`, but
/// fragmented segments may start with `styp`, `sidx`, `moof`, `emsg` or
/// `uuid`, and QuickTime files with `wide`, `mdat` or `pnot`.
fn iso_bmff_box(prefix: &[u8]) -> Option<bool> {
    let head = prefix.get(..8)?;
    let size = u32::from_be_bytes([head[0], head[1], head[2], head[3]]);
    // 0 runs to the end of the file, 1 means a 64-bit size follows.
    let size_ok = size == 0 || size == 1 || size >= 8;
    let type_ok = head[4..8].iter().all(|&b| (0x20..=0x7e).contains(&b));
    Some(size_ok && type_ok)
}

fn riff(prefix: &[u8], form: &[u8; 4]) -> Option<bool> {
    let head = prefix.get(..12)?;
    Some(&head[..4] == b"RIFF" && &head[8..12] == form)
}
