//! Ownership sidecar files.
//!
//! Virtual ownership for a real path `P` lives next to it in `P.vufs`,
//! a one-line text file `uid:gid`. The sidecar is written on create,
//! renamed on rename and removed on remove; a missing sidecar means the
//! object belongs to `adm`.

use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::fcall::DEFAULT_USER;

/// Suffix of every sidecar file. No client-visible name may end in it.
pub const SIDECAR_SUFFIX: &str = ".vufs";

/// The sidecar path for a real path.
pub fn sidecar_path(path: impl AsRef<Path>) -> PathBuf {
    let mut os: OsString = path.as_ref().as_os_str().to_owned();
    os.push(SIDECAR_SUFFIX);
    PathBuf::from(os)
}

/// Whether a client-supplied name may be created or renamed to.
pub fn valid_filename(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.ends_with(SIDECAR_SUFFIX)
}

/// Record ownership for `path`, replacing any previous record.
pub async fn write_ownership(path: impl AsRef<Path>, uid: &str, gid: &str) -> std::io::Result<()> {
    let mut opts = fs::OpenOptions::new();
    opts.write(true).create(true).truncate(true);
    #[cfg(unix)]
    opts.mode(0o600);

    let mut fp = opts.open(sidecar_path(path)).await?;
    fp.write_all(format!("{}:{}\n", uid, gid).as_bytes()).await?;
    Ok(())
}

/// Read ownership for `path`. A missing or malformed sidecar yields the
/// defaults.
pub async fn read_ownership(path: impl AsRef<Path>) -> std::io::Result<(String, String)> {
    let data = match fs::read_to_string(sidecar_path(path)).await {
        Ok(data) => data,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Ok((DEFAULT_USER.to_owned(), DEFAULT_USER.to_owned()));
        }
        Err(e) => return Err(e),
    };

    let line = data.lines().next().unwrap_or("");
    match line.split_once(':') {
        Some((uid, gid)) if !uid.is_empty() && !gid.is_empty() => {
            Ok((uid.to_owned(), gid.to_owned()))
        }
        _ => Ok((DEFAULT_USER.to_owned(), DEFAULT_USER.to_owned())),
    }
}

/// Move a sidecar alongside its renamed object.
pub async fn rename_ownership(
    old: impl AsRef<Path>,
    new: impl AsRef<Path>,
) -> std::io::Result<()> {
    fs::rename(sidecar_path(old), sidecar_path(new)).await
}

/// Delete the sidecar for a removed object. Missing sidecars are fine:
/// the object may predate the server.
pub async fn remove_ownership(path: impl AsRef<Path>) -> std::io::Result<()> {
    match fs::remove_file(sidecar_path(path)).await {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
