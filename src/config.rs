//! Declarative configuration: line parser, file reader and `.conf`
//! discovery under the sysusers directories.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use tracing::{error, warn};

use crate::error::ProvisionError;
use crate::item::{self, Item, ItemKind};
use crate::{rooted, specifier};

/// Directories searched for `*.conf` when no files are named on the
/// command line. Earlier directories shadow later ones on equal file names.
pub const CONF_DIRS: &[&str] = &[
    "/usr/local/lib/sysusers.d",
    "/usr/lib/sysusers.d",
    "/lib/sysusers.d",
];

/// Declared items, one map per kind, keyed by name.
#[derive(Debug, Default)]
pub struct DeclaredSets {
    pub users: BTreeMap<String, Item>,
    pub groups: BTreeMap<String, Item>,
}

impl DeclaredSets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty() && self.groups.is_empty()
    }

    /// First declaration wins. An identical re-declaration collapses
    /// silently, a conflicting one is dropped with a warning.
    pub fn insert(&mut self, item: Item) {
        let set = match item.kind {
            ItemKind::AddUser => &mut self.users,
            ItemKind::AddGroup => &mut self.groups,
        };
        if let Some(existing) = set.get(&item.name) {
            if !existing.same_declaration(&item) {
                warn!(
                    "Two or more conflicting lines for {} configured, ignoring.",
                    item.name
                );
            }
            return;
        }
        set.insert(item.name.clone(), item);
    }
}

/// Read one configuration file into `sets`. Bad lines are logged with
/// their location and skipped; the first error is returned after the whole
/// file has been processed.
pub fn read_config_file(
    path: &Path,
    ignore_enoent: bool,
    sets: &mut DeclaredSets,
) -> Result<(), ProvisionError> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == io::ErrorKind::NotFound && ignore_enoent => return Ok(()),
        Err(err) => {
            error!("Failed to open {}: {}", path.display(), err);
            return Err(ProvisionError::io(path, err));
        }
    };

    let mut first_error = Ok(());
    for (index, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match parse_line(line) {
            Ok(item) => sets.insert(item),
            Err(err) => {
                error!("[{}:{}] {}", path.display(), index + 1, err);
                if first_error.is_ok() {
                    first_error = Err(err);
                }
            }
        }
    }
    first_error
}

/// Enumerate `*.conf` files across the search directories under the
/// optional root, sorted by file name, first directory winning on
/// duplicates.
pub fn enumerate_config_files(root: Option<&Path>) -> io::Result<Vec<PathBuf>> {
    let mut by_name: BTreeMap<OsString, PathBuf> = BTreeMap::new();
    for dir in CONF_DIRS {
        let dir = rooted(root, dir);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => return Err(err),
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            if Path::new(&name).extension().is_none_or(|e| e != "conf") {
                continue;
            }
            by_name.entry(name).or_insert_with(|| entry.path());
        }
    }
    Ok(by_name.into_values().collect())
}

/// Parse one `<type> <name> <id> [<description>]` directive.
pub fn parse_line(line: &str) -> Result<Item, ProvisionError> {
    let (action, rest) = split_token(line);
    let (name, rest) = split_token(rest);
    if action.is_empty() || name.is_empty() {
        return Err(ProvisionError::Syntax);
    }
    let (id, description) = split_token(rest);

    let Some(kind) = ItemKind::from_directive(action) else {
        return Err(ProvisionError::UnknownDirective(action.to_string()));
    };

    let name = specifier::expand(name)?;
    if !item::valid_user_group_name(&name) {
        return Err(ProvisionError::BadName(name));
    }

    let mut item = Item::new(kind, name);

    if !description.is_empty() && description != "-" {
        let description = unquote(description);
        if !item::valid_gecos(description) {
            return Err(ProvisionError::BadGecos(description.to_string()));
        }
        item.description = Some(description.to_string());
    }

    if !id.is_empty() && id != "-" {
        if id.starts_with('/') {
            let path = clean_path(id);
            match kind {
                ItemKind::AddUser => item.uid_path = Some(path),
                ItemKind::AddGroup => item.gid_path = Some(path),
            }
        } else {
            let numeric = parse_id(id)?;
            match kind {
                ItemKind::AddUser => item.uid = Some(numeric),
                ItemKind::AddGroup => item.gid = Some(numeric),
            }
        }
    }

    Ok(item)
}

fn parse_id(id: &str) -> Result<u32, ProvisionError> {
    let numeric: u32 = id
        .parse()
        .map_err(|_| ProvisionError::BadId(id.to_string()))?;
    // (uid_t) -1 and -2 are reserved sentinels, never valid accounts
    if numeric >= u32::MAX - 1 {
        return Err(ProvisionError::BadId(id.to_string()));
    }
    Ok(numeric)
}

fn split_token(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    match s.find(char::is_whitespace) {
        Some(i) => (&s[..i], s[i..].trim_start()),
        None => (s, ""),
    }
}

fn unquote(s: &str) -> &str {
    if s.len() >= 2 && s.starts_with('"') && s.ends_with('"') {
        &s[1..s.len() - 1]
    } else {
        s
    }
}

fn clean_path(path: &str) -> PathBuf {
    // collapse duplicate separators and '.' components, keep the rest as-is
    Path::new(path)
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}
