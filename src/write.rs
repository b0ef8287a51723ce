//! Atomic rewrite of the account tables.
//!
//! Each table is rebuilt in a temp sibling, existing entries copied
//! verbatim and re-verified against the pending sets, pending entries
//! appended. Backups of the originals are taken only after every
//! replacement has been fully written, then the temps are renamed into
//! place. A failure anywhere before the renames leaves the originals
//! untouched; undone temp files are unlinked when their handles drop.

use std::fs::{self, File, FileTimes, Permissions};
use std::io::{self, Write};
use std::os::unix::fs::{fchown, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use tempfile::{Builder, NamedTempFile};
use tracing::debug;

use crate::error::ProvisionError;
use crate::rooted;
use crate::session::Session;

const NOLOGIN_SHELL: &str = "/sbin/nologin";
const ROOT_SHELL: &str = "/bin/sh";

enum Table {
    Passwd,
    Group,
}

/// Write every pending entry to disk. A table with no pending work is
/// not touched. Shadow and gshadow are never patched here, accounts are
/// created without passwords.
pub fn commit(session: &Session) -> Result<(), ProvisionError> {
    let group_path = rooted(session.root(), "/etc/group");
    let passwd_path = rooted(session.root(), "/etc/passwd");

    let group_tmp = if session.pending_gids.is_empty() {
        None
    } else {
        Some(write_group_table(session, &group_path)?)
    };

    let passwd_tmp = if session.pending_uids.is_empty() {
        None
    } else {
        Some(write_passwd_table(session, &passwd_path)?)
    };

    if group_tmp.is_none() && passwd_tmp.is_none() {
        debug!("No pending entries, nothing to write.");
        return Ok(());
    }

    // back up only once both replacements exist in full, so a crash from
    // here on leaves the old contents in the backup or the original
    if group_tmp.is_some() {
        make_backup(&group_path)?;
    }
    if passwd_tmp.is_some() {
        make_backup(&passwd_path)?;
    }

    if let Some(tmp) = group_tmp {
        persist(tmp, &group_path)?;
    }
    if let Some(tmp) = passwd_tmp {
        persist(tmp, &passwd_path)?;
    }
    Ok(())
}

fn write_group_table(session: &Session, path: &Path) -> Result<NamedTempFile, ProvisionError> {
    let mut tmp = open_temp(path)?;
    copy_existing(session, path, &mut tmp, Table::Group)?;
    for group in session.pending_gids.values() {
        writeln!(tmp, "{}:x:{}:", group.name, group.gid).map_err(|e| ProvisionError::io(path, e))?;
    }
    Ok(tmp)
}

fn write_passwd_table(session: &Session, path: &Path) -> Result<NamedTempFile, ProvisionError> {
    let mut tmp = open_temp(path)?;
    copy_existing(session, path, &mut tmp, Table::Passwd)?;
    for user in session.pending_uids.values() {
        // new accounts cannot log in, except root which gets a real shell
        let (home, shell) = if user.uid == 0 {
            ("/root", ROOT_SHELL)
        } else {
            ("/", NOLOGIN_SHELL)
        };
        writeln!(
            tmp,
            "{}:x:{}:{}:{}:{}:{}",
            user.name,
            user.uid,
            user.gid,
            user.description.as_deref().unwrap_or(""),
            home,
            shell
        )
        .map_err(|e| ProvisionError::io(path, e))?;
    }
    Ok(tmp)
}

/// Temp sibling of `path` in the same directory, so the final rename
/// never crosses a filesystem.
fn open_temp(path: &Path) -> Result<NamedTempFile, ProvisionError> {
    let dir = path.parent().unwrap_or(Path::new("/"));
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = Builder::new()
        .prefix(&format!("{name}."))
        .tempfile_in(dir)
        .map_err(|e| ProvisionError::io(path, e))?;
    tmp.as_file()
        .set_permissions(Permissions::from_mode(0o644))
        .map_err(|e| ProvisionError::io(path, e))?;
    Ok(tmp)
}

/// Copy the current table into the replacement, line by line. The
/// decisions were all made against a snapshot taken under the same lock,
/// so a collision here means the namespaces changed underneath us and
/// the commit must not go through.
fn copy_existing(
    session: &Session,
    path: &Path,
    out: &mut NamedTempFile,
    table: Table,
) -> Result<(), ProvisionError> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(ProvisionError::io(path, err)),
    };

    for line in text.lines() {
        if !line.is_empty() {
            let mut fields = line.splitn(4, ':');
            let name = fields.next().unwrap_or("");
            let _password = fields.next();
            let id: Option<u32> = fields.next().and_then(|s| s.parse().ok());

            let collides = match table {
                Table::Group => {
                    session.pending_gids.values().any(|g| g.name == name)
                        || id.is_some_and(|gid| session.pending_gids.contains_key(&gid))
                }
                Table::Passwd => {
                    session.pending_uids.values().any(|u| u.name == name)
                        || id.is_some_and(|uid| session.pending_uids.contains_key(&uid))
                }
            };
            if collides {
                return Err(ProvisionError::CommitConflict {
                    path: path.to_path_buf(),
                    name: name.to_string(),
                });
            }
        }
        writeln!(out, "{line}").map_err(|e| ProvisionError::io(path, e))?;
    }
    Ok(())
}

/// Preserve the current table as `<target>-`, matching mode, owner and
/// timestamps of the original.
fn make_backup(path: &Path) -> Result<(), ProvisionError> {
    let mut src = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(ProvisionError::io(path, err)),
    };
    let meta = src.metadata().map_err(|e| ProvisionError::io(path, e))?;

    let mut tmp = open_temp(path)?;
    io::copy(&mut src, tmp.as_file_mut()).map_err(|e| ProvisionError::io(path, e))?;

    tmp.as_file()
        .set_permissions(Permissions::from_mode(meta.mode() & 0o7777))
        .map_err(|e| ProvisionError::io(path, e))?;
    // ownership and timestamps are best effort, a backup owned by us is
    // still a usable backup
    let _ = fchown(tmp.as_file(), Some(meta.uid()), Some(meta.gid()));
    if let (Ok(accessed), Ok(modified)) = (meta.accessed(), meta.modified()) {
        let times = FileTimes::new().set_accessed(accessed).set_modified(modified);
        let _ = tmp.as_file().set_times(times);
    }

    persist(tmp, &sibling(path, "-"))
}

fn persist(tmp: NamedTempFile, target: &Path) -> Result<(), ProvisionError> {
    tmp.persist(target)
        .map_err(|e| ProvisionError::io(target, e.error))?;
    Ok(())
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}
