//! Durable conversation state.
//!
//! Saved conversations are opaque versioned binary blobs, one file per
//! conversation, written atomically and validated fully before any load takes
//! effect. The blob embeds the model fingerprint so a state saved under one
//! model fails loudly under another instead of silently misbehaving.
//!
//! Wire format, little-endian: magic `RBTA`, format version (u32), model
//! fingerprint (u64), token count (u32), then the token ids (u32 each).
//! Trailing bytes past the declared count are treated as corruption.

use std::fs;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::TokenId;

const STATE_MAGIC: [u8; 4] = *b"RBTA";
const STATE_VERSION: u32 = 1;

/// File extension for saved conversation state blobs.
pub const STATE_EXTENSION: &str = "state";

/// Serializes a transcript to `path`, atomically: the blob lands in a
/// sibling tmp file, is fsynced, then renamed over the destination.
pub fn write_state(path: &Path, fingerprint: u64, tokens: &[TokenId]) -> Result<()> {
    let mut payload = Vec::with_capacity(20 + tokens.len() * 4);
    payload.extend_from_slice(&STATE_MAGIC);
    payload.write_u32::<LittleEndian>(STATE_VERSION)?;
    payload.write_u64::<LittleEndian>(fingerprint)?;
    payload.write_u32::<LittleEndian>(tokens.len() as u32)?;
    for token in tokens {
        payload.write_u32::<LittleEndian>(*token)?;
    }

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let tmp_path = path.with_extension("tmp");
    let mut tmp_file = fs::File::create(&tmp_path)?;
    if let Err(err) = tmp_file.write_all(&payload).and_then(|_| tmp_file.sync_all()) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err.into());
    }
    drop(tmp_file);

    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err.into());
    }
    debug!(path = %path.display(), tokens = tokens.len(), "conversation state written");
    Ok(())
}

/// Reads and fully validates a state blob, returning its transcript.
///
/// Fails with [`Error::FileNotFound`] if the file is absent and
/// [`Error::CorruptState`] on any structural mismatch: bad magic, unknown
/// version, foreign model fingerprint, truncation, or trailing bytes.
pub fn read_state(path: &Path, fingerprint: u64) -> Result<Vec<TokenId>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::FileNotFound(path.to_path_buf()));
        }
        Err(err) => return Err(err.into()),
    };

    let mut cursor = Cursor::new(&bytes);
    let mut magic = [0u8; 4];
    std::io::Read::read_exact(&mut cursor, &mut magic)
        .map_err(|_| Error::CorruptState("truncated header".into()))?;
    if magic != STATE_MAGIC {
        return Err(Error::CorruptState("bad magic".into()));
    }
    let version = cursor
        .read_u32::<LittleEndian>()
        .map_err(|_| Error::CorruptState("truncated header".into()))?;
    if version != STATE_VERSION {
        return Err(Error::CorruptState(format!(
            "unsupported state version {version}"
        )));
    }
    let saved_fingerprint = cursor
        .read_u64::<LittleEndian>()
        .map_err(|_| Error::CorruptState("truncated header".into()))?;
    if saved_fingerprint != fingerprint {
        return Err(Error::CorruptState(
            "state was saved under a different model".into(),
        ));
    }
    let count = cursor
        .read_u32::<LittleEndian>()
        .map_err(|_| Error::CorruptState("truncated header".into()))?
        as usize;

    let mut tokens = Vec::with_capacity(count);
    for _ in 0..count {
        tokens.push(
            cursor
                .read_u32::<LittleEndian>()
                .map_err(|_| Error::CorruptState("truncated token data".into()))?,
        );
    }
    if (cursor.position() as usize) != bytes.len() {
        return Err(Error::CorruptState("trailing bytes after token data".into()));
    }
    Ok(tokens)
}

/// Enumerates saved conversation names under `dir` without loading them.
///
/// A missing directory is simply an empty listing.
pub fn list_states(dir: &Path) -> Result<Vec<String>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };

    let mut names: Vec<String> = entries
        .filter_map(|entry| {
            let path = entry.ok()?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(STATE_EXTENSION) {
                return None;
            }
            path.file_stem()
                .and_then(|stem| stem.to_str())
                .map(String::from)
        })
        .collect();
    names.sort();
    Ok(names)
}

/// The on-disk path for a named conversation under a conversations directory.
pub fn state_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.{STATE_EXTENSION}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn scratch_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("robata-persist-{}", Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn round_trip_preserves_tokens_byte_identically() {
        let dir = scratch_dir();
        let path = state_path(&dir, "dialogue");
        let tokens: Vec<TokenId> = (0..200).map(|i| i * 3 + 1).collect();

        write_state(&path, 0xBEEF, &tokens).unwrap();
        let first_blob = fs::read(&path).unwrap();

        // Load-then-save produces byte-identical state.
        let restored = read_state(&path, 0xBEEF).unwrap();
        assert_eq!(restored, tokens);
        write_state(&path, 0xBEEF, &restored).unwrap();
        assert_eq!(fs::read(&path).unwrap(), first_blob);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = scratch_dir();
        let path = state_path(&dir, "absent");
        assert!(matches!(
            read_state(&path, 0x1),
            Err(Error::FileNotFound(_))
        ));
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn bad_magic_is_corrupt() {
        let dir = scratch_dir();
        let path = state_path(&dir, "garbage");
        fs::write(&path, b"not a state file").unwrap();
        assert!(matches!(read_state(&path, 0x1), Err(Error::CorruptState(_))));
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn foreign_fingerprint_is_corrupt() {
        let dir = scratch_dir();
        let path = state_path(&dir, "other-model");
        write_state(&path, 0xAAAA, &[1, 2, 3]).unwrap();
        assert!(matches!(
            read_state(&path, 0xBBBB),
            Err(Error::CorruptState(_))
        ));
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn truncated_blob_is_corrupt() {
        let dir = scratch_dir();
        let path = state_path(&dir, "cut-short");
        write_state(&path, 0x1, &[1, 2, 3, 4]).unwrap();
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();
        assert!(matches!(read_state(&path, 0x1), Err(Error::CorruptState(_))));
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn listing_enumerates_state_stems_only() {
        let dir = scratch_dir();
        write_state(&state_path(&dir, "beta"), 0x1, &[1]).unwrap();
        write_state(&state_path(&dir, "alpha"), 0x1, &[2]).unwrap();
        fs::write(dir.join("notes.txt"), b"ignored").unwrap();

        assert_eq!(list_states(&dir).unwrap(), vec!["alpha", "beta"]);
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn listing_missing_directory_is_empty() {
        let dir = scratch_dir().join("never-created");
        assert!(list_states(&dir).unwrap().is_empty());
    }
}
