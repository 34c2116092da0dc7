// Archive naming and rename step used when a log file is rotated.
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use time::OffsetDateTime;
use time::macros::format_description;

use crate::core::error::{Error, ErrorKind};

const MAX_COLLISIONS: u32 = 1000;

/// `YYYYMMDDhhmmss` in UTC.
pub fn timestamp_suffix(now: OffsetDateTime) -> Result<String, Error> {
    let format = format_description!("[year][month][day][hour][minute][second]");
    now.format(format).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to format archive suffix")
            .with_source(err)
    })
}

/// First free `<path>.<suffix>` name, adding `-N` when rotations share a second.
pub fn archive_path(path: &Path, now: OffsetDateTime) -> Result<PathBuf, Error> {
    let suffix = timestamp_suffix(now)?;
    let base = path.as_os_str().to_owned();
    for attempt in 0..MAX_COLLISIONS {
        let mut candidate = base.clone();
        if attempt == 0 {
            candidate.push(format!(".{suffix}"));
        } else {
            candidate.push(format!(".{suffix}-{attempt}"));
        }
        let candidate = PathBuf::from(candidate);
        if !candidate.exists() {
            return Ok(candidate);
        }
    }
    Err(Error::new(ErrorKind::Busy)
        .with_message("no free archive name for rotation")
        .with_path(path))
}

pub fn archive(path: &Path, now: OffsetDateTime) -> Result<PathBuf, Error> {
    let target = archive_path(path, now)?;
    fs::rename(path, &target).map_err(|err| rename_error(path, &target, err))?;
    Ok(target)
}

fn rename_error(from: &Path, to: &Path, err: io::Error) -> Error {
    let kind = match err.kind() {
        io::ErrorKind::PermissionDenied => ErrorKind::Permission,
        io::ErrorKind::NotFound => ErrorKind::NotFound,
        _ => ErrorKind::Io,
    };
    Error::new(kind)
        .with_message(format!("failed to archive log as {}", to.display()))
        .with_path(from)
        .with_source(err)
}
