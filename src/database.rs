//! Loader for the on-disk account tables.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;

use crate::error::ProvisionError;
use crate::item::{Gid, Uid};
use crate::rooted;

/// Name and ID mappings read verbatim from `/etc/passwd` and `/etc/group`.
/// A missing file is an empty database. Duplicate entries within a file
/// are tolerated, the first one wins.
#[derive(Debug, Default)]
pub struct AccountDb {
    pub user_by_name: HashMap<String, Uid>,
    pub user_by_id: HashMap<Uid, String>,
    pub group_by_name: HashMap<String, Gid>,
    pub group_by_id: HashMap<Gid, String>,
}

impl AccountDb {
    pub fn load(root: Option<&Path>) -> Result<Self, ProvisionError> {
        let mut db = AccountDb::default();
        load_table(
            &rooted(root, "/etc/passwd"),
            &mut db.user_by_name,
            &mut db.user_by_id,
        )?;
        load_table(
            &rooted(root, "/etc/group"),
            &mut db.group_by_name,
            &mut db.group_by_id,
        )?;
        Ok(db)
    }
}

fn load_table(
    path: &Path,
    by_name: &mut HashMap<String, u32>,
    by_id: &mut HashMap<u32, String>,
) -> Result<(), ProvisionError> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(ProvisionError::io(path, err)),
    };

    for (index, line) in text.lines().enumerate() {
        if line.is_empty() {
            continue;
        }
        let Some((name, id)) = parse_entry(line) else {
            return Err(ProvisionError::BadEntry {
                path: path.to_path_buf(),
                line: index + 1,
            });
        };
        by_name.entry(name.to_string()).or_insert(id);
        by_id.entry(id).or_insert_with(|| name.to_string());
    }
    Ok(())
}

/// Name and numeric ID of a colon-separated table line. The remaining
/// fields differ between passwd and group and are not needed here.
fn parse_entry(line: &str) -> Option<(&str, u32)> {
    let mut fields = line.splitn(4, ':');
    let name = fields.next()?;
    let _password = fields.next()?;
    let id = fields.next()?.parse().ok()?;
    Some((name, id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_etc(root: &Path, name: &str, content: &str) {
        let etc = root.join("etc");
        fs::create_dir_all(&etc).unwrap();
        fs::write(etc.join(name), content).unwrap();
    }

    #[test]
    fn test_load_both_tables() {
        let root = TempDir::new().unwrap();
        write_etc(
            root.path(),
            "passwd",
            "root:x:0:0:root:/root:/bin/sh\ndaemon:x:1:1::/:/sbin/nologin\n",
        );
        write_etc(root.path(), "group", "root:x:0:\ntty:x:5:\n");

        let db = AccountDb::load(Some(root.path())).unwrap();
        assert_eq!(db.user_by_name["root"], 0);
        assert_eq!(db.user_by_id[&1], "daemon");
        assert_eq!(db.group_by_name["tty"], 5);
        assert_eq!(db.group_by_id[&0], "root");
    }

    #[test]
    fn test_missing_files_are_empty() {
        let root = TempDir::new().unwrap();
        let db = AccountDb::load(Some(root.path())).unwrap();
        assert!(db.user_by_name.is_empty());
        assert!(db.group_by_name.is_empty());
    }

    #[test]
    fn test_duplicate_entries_first_wins() {
        let root = TempDir::new().unwrap();
        write_etc(
            root.path(),
            "passwd",
            "svc:x:200:200::/:/sbin/nologin\nsvc:x:300:300::/:/sbin/nologin\nother:x:200:200::/:/sbin/nologin\n",
        );

        let db = AccountDb::load(Some(root.path())).unwrap();
        assert_eq!(db.user_by_name["svc"], 200);
        assert_eq!(db.user_by_id[&200], "svc");
        // the second claim on uid 200 keeps its name mapping only
        assert_eq!(db.user_by_name["other"], 200);
    }

    #[test]
    fn test_malformed_entry_aborts() {
        let root = TempDir::new().unwrap();
        write_etc(root.path(), "group", "tty:x:notanumber:\n");
        assert!(matches!(
            AccountDb::load(Some(root.path())),
            Err(ProvisionError::BadEntry { line: 1, .. })
        ));
    }
}
