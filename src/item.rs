use std::fmt;
use std::path::PathBuf;
use std::sync::OnceLock;

pub type Uid = u32;
pub type Gid = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    AddUser,
    AddGroup,
}

impl ItemKind {
    pub fn from_directive(directive: &str) -> Option<Self> {
        match directive {
            "u" => Some(ItemKind::AddUser),
            "g" => Some(ItemKind::AddGroup),
            _ => None,
        }
    }
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemKind::AddUser => f.write_str("user"),
            ItemKind::AddGroup => f.write_str("group"),
        }
    }
}

/// One declared intent, built by the config parser and resolved by the
/// reconciler. A user item carries both path slots because a matching
/// group declaration folds its hint into the user item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub kind: ItemKind,
    pub name: String,
    pub uid_path: Option<PathBuf>,
    pub gid_path: Option<PathBuf>,
    pub description: Option<String>,
    pub uid: Option<Uid>,
    pub gid: Option<Gid>,
    pub pending: bool,
}

impl Item {
    pub fn new(kind: ItemKind, name: impl Into<String>) -> Self {
        Item {
            kind,
            name: name.into(),
            uid_path: None,
            gid_path: None,
            description: None,
            uid: None,
            gid: None,
            pending: false,
        }
    }

    /// Two declarations for the same name collapse only when they agree on
    /// every field the parser can set.
    pub fn same_declaration(&self, other: &Item) -> bool {
        self.kind == other.kind
            && self.name == other.name
            && self.uid_path == other.uid_path
            && self.gid_path == other.gid_path
            && self.description == other.description
            && self.uid == other.uid
            && self.gid == other.gid
    }
}

fn login_name_max() -> usize {
    static MAX: OnceLock<usize> = OnceLock::new();
    *MAX.get_or_init(|| {
        let n = unsafe { libc::sysconf(libc::_SC_LOGIN_NAME_MAX) };
        if n > 0 {
            n as usize
        } else {
            256
        }
    })
}

pub fn valid_user_group_name(name: &str) -> bool {
    let mut bytes = name.bytes();
    let Some(first) = bytes.next() else {
        return false;
    };
    if !(first.is_ascii_alphabetic() || first == b'_') {
        return false;
    }
    if !bytes.all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-') {
        return false;
    }
    name.len() <= login_name_max()
}

/// GECOS must not break the colon-separated line format. The field is
/// already valid UTF-8 by the time it is a &str.
pub fn valid_gecos(description: &str) -> bool {
    !description.contains(':') && !description.contains('\n')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_names() {
        assert!(valid_user_group_name("httpd"));
        assert!(valid_user_group_name("_apt"));
        assert!(valid_user_group_name("systemd-network"));
        assert!(valid_user_group_name("u"));
        assert!(valid_user_group_name("User0"));
    }

    #[test]
    fn test_invalid_names() {
        assert!(!valid_user_group_name(""));
        assert!(!valid_user_group_name("0day"));
        assert!(!valid_user_group_name("-lead"));
        assert!(!valid_user_group_name("with space"));
        assert!(!valid_user_group_name("colon:name"));
        assert!(!valid_user_group_name("über"));
        let long = "a".repeat(4096);
        assert!(!valid_user_group_name(&long));
    }

    #[test]
    fn test_valid_gecos() {
        assert!(valid_gecos("HTTP server"));
        assert!(valid_gecos(""));
        assert!(!valid_gecos("a:b"));
        assert!(!valid_gecos("line\nbreak"));
    }

    #[test]
    fn test_same_declaration() {
        let a = Item::new(ItemKind::AddUser, "httpd");
        let mut b = a.clone();
        assert!(a.same_declaration(&b));

        // resolution state does not affect declaration identity
        b.pending = true;
        assert!(a.same_declaration(&b));

        b = a.clone();
        b.uid = Some(5);
        assert!(!a.same_declaration(&b));

        b = a.clone();
        b.description = Some("other".into());
        assert!(!a.same_declaration(&b));
    }
}
