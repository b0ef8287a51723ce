//! End-to-end runs of the provisioning pipeline against a temporary
//! filesystem root: config parsing, locking, database load,
//! reconciliation and the atomic commit.

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use tempfile::TempDir;

use sysusers::config::{self, DeclaredSets};
use sysusers::{lock, write, ProvisionError, Session, SYSTEM_UID_MAX};

fn write_etc(root: &Path, name: &str, content: &str) {
    let etc = root.join("etc");
    fs::create_dir_all(&etc).unwrap();
    fs::write(etc.join(name), content).unwrap();
}

fn read_etc(root: &Path, name: &str) -> String {
    fs::read_to_string(root.join("etc").join(name)).unwrap()
}

/// Run the whole pipeline the way the binary does, minus the CLI.
fn apply(root: &Path, config: &str) -> Result<(), ProvisionError> {
    fs::create_dir_all(root.join("etc")).unwrap();
    let conf_path = root.join("test.conf");
    fs::write(&conf_path, config).unwrap();

    let mut declared = DeclaredSets::new();
    config::read_config_file(&conf_path, false, &mut declared)?;

    let mut session = Session::new(Some(root.to_path_buf()), None, declared);
    let _lock = lock::take_lock(session.root())?;
    session.load_databases()?;
    session.reconcile()?;
    write::commit(&session)
}

#[test]
fn test_fresh_system_creates_matched_pair() {
    let root = TempDir::new().unwrap();
    apply(root.path(), "u httpd - \"HTTP server\"\n").unwrap();

    assert_eq!(
        read_etc(root.path(), "passwd"),
        "httpd:x:999:999:HTTP server:/:/sbin/nologin\n"
    );
    assert_eq!(read_etc(root.path(), "group"), "httpd:x:999:\n");
}

#[test]
fn test_root_override_gets_real_shell() {
    let root = TempDir::new().unwrap();
    apply(root.path(), "u root 0 \"root\"\n").unwrap();

    assert_eq!(
        read_etc(root.path(), "passwd"),
        "root:x:0:0:root:/root:/bin/sh\n"
    );
    assert_eq!(read_etc(root.path(), "group"), "root:x:0:\n");
}

#[test]
fn test_path_hint_inherits_or_falls_back() {
    let root = TempDir::new().unwrap();
    let spool = root.path().join("var/lib/foo");
    fs::create_dir_all(spool.parent().unwrap()).unwrap();
    fs::write(&spool, b"").unwrap();
    let meta = fs::metadata(&spool).unwrap();
    let (owner, group_owner) = (meta.uid(), meta.gid());
    let in_range = |id: u32| id > 0 && id <= SYSTEM_UID_MAX;

    apply(root.path(), "u foo /var/lib/foo\n").unwrap();

    let passwd = read_etc(root.path(), "passwd");
    if in_range(owner) && owner == group_owner {
        // the file ownership is usable and becomes the pair's ID
        assert!(passwd.starts_with(&format!("foo:x:{owner}:{owner}:")));
    } else if !in_range(owner) && !in_range(group_owner) {
        // unusable ownership, the allocator assigns from the range top
        assert!(passwd.starts_with("foo:x:999:999:"));
    } else {
        assert!(passwd.starts_with("foo:x:"));
    }
}

#[test]
fn test_existing_account_means_nothing_to_do() {
    let root = TempDir::new().unwrap();
    let passwd_before = "httpd:x:123:123::/:/sbin/nologin\n";
    let group_before = "httpd:x:123:\n";
    write_etc(root.path(), "passwd", passwd_before);
    write_etc(root.path(), "group", group_before);

    apply(root.path(), "u httpd -\n").unwrap();

    assert_eq!(read_etc(root.path(), "passwd"), passwd_before);
    assert_eq!(read_etc(root.path(), "group"), group_before);
    assert!(!root.path().join("etc/passwd-").exists());
    assert!(!root.path().join("etc/group-").exists());
}

#[test]
fn test_exhausted_range_fails_and_leaves_files_alone() {
    let root = TempDir::new().unwrap();
    let mut passwd = String::new();
    for uid in 1..=SYSTEM_UID_MAX {
        passwd.push_str(&format!("u{uid}:x:{uid}:{uid}::/:/sbin/nologin\n"));
    }
    write_etc(root.path(), "passwd", &passwd);

    let err = apply(root.path(), "u newsvc -\n").unwrap_err();
    assert!(matches!(err, ProvisionError::IdExhausted { .. }));
    assert_eq!(read_etc(root.path(), "passwd"), passwd);
    assert!(!root.path().join("etc/group").exists());
}

#[test]
fn test_second_run_changes_nothing() {
    let root = TempDir::new().unwrap();
    let config = "g render -\nu httpd 440 \"HTTP server\"\nu ftp -\n";

    apply(root.path(), config).unwrap();
    let passwd = read_etc(root.path(), "passwd");
    let group = read_etc(root.path(), "group");

    apply(root.path(), config).unwrap();
    assert_eq!(read_etc(root.path(), "passwd"), passwd);
    assert_eq!(read_etc(root.path(), "group"), group);
    // no pending work on the second run means no backups were taken
    assert!(!root.path().join("etc/passwd-").exists());
    assert!(!root.path().join("etc/group-").exists());
}

#[test]
fn test_backup_holds_pre_run_contents() {
    let root = TempDir::new().unwrap();
    let passwd_before = "daemon:x:1:1::/:/sbin/nologin\n";
    write_etc(root.path(), "passwd", passwd_before);
    write_etc(root.path(), "group", "daemon:x:1:\n");

    apply(root.path(), "u svc -\n").unwrap();

    assert_eq!(read_etc(root.path(), "passwd-"), passwd_before);
    assert_eq!(read_etc(root.path(), "group-"), "daemon:x:1:\n");
    assert!(read_etc(root.path(), "passwd").contains("svc:x:999:999:"));
}

#[test]
fn test_all_existing_entries_survive_commit() {
    let root = TempDir::new().unwrap();
    let passwd_before =
        "root:x:0:0:root:/root:/bin/sh\nbin:x:2:2::/:/sbin/nologin\n";
    let group_before = "root:x:0:\nbin:x:2:\nwheel:x:10:\n";
    write_etc(root.path(), "passwd", passwd_before);
    write_etc(root.path(), "group", group_before);

    apply(root.path(), "u svc - \"some service\"\n").unwrap();

    let passwd = read_etc(root.path(), "passwd");
    let group = read_etc(root.path(), "group");
    assert!(passwd.starts_with(passwd_before));
    assert!(group.starts_with(group_before));
    assert_eq!(passwd.lines().count(), 3);
    assert_eq!(group.lines().count(), 4);
}

#[test]
fn test_reparse_of_rendered_lines_is_stable() {
    let mut declared = DeclaredSets::new();
    for line in [
        "u httpd 440 \"HTTP server\"",
        "u ftp -",
        "g input /dev/input",
        "g render - -",
    ] {
        declared.insert(config::parse_line(line).unwrap());
    }

    let mut rendered = String::new();
    for item in declared.groups.values().chain(declared.users.values()) {
        let kind = match item.kind {
            sysusers::ItemKind::AddUser => 'u',
            sysusers::ItemKind::AddGroup => 'g',
        };
        let id = if let Some(id) = item.uid.or(item.gid) {
            id.to_string()
        } else if let Some(path) = item.uid_path.as_ref().or(item.gid_path.as_ref()) {
            path.display().to_string()
        } else {
            "-".to_string()
        };
        let description = item
            .description
            .as_ref()
            .map(|d| format!("\"{d}\""))
            .unwrap_or_else(|| "-".to_string());
        rendered.push_str(&format!("{kind} {} {id} {description}\n", item.name));
    }

    let mut reparsed = DeclaredSets::new();
    for line in rendered.lines() {
        reparsed.insert(config::parse_line(line).unwrap());
    }
    assert_eq!(declared.users, reparsed.users);
    assert_eq!(declared.groups, reparsed.groups);
}
