use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::item::ItemKind;

#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{}:{line}: malformed database entry", .path.display())]
    BadEntry { path: PathBuf, line: usize },

    #[error("syntax error")]
    Syntax,

    #[error("unknown directive type '{0}'")]
    UnknownDirective(String),

    #[error("'{0}' is not a valid user or group name")]
    BadName(String),

    #[error("'{0}' is not a valid GECOS field")]
    BadGecos(String),

    #[error("'{0}' is not a valid numeric ID")]
    BadId(String),

    #[error("cannot expand specifier '%{0}'")]
    BadSpecifier(char),

    #[error("no free {kind} ID available for {name}")]
    IdExhausted { kind: ItemKind, name: String },

    #[error("user {0} exists in the shadow database but not in the user database")]
    ShadowOnlyUser(String),

    #[error("{}: existing entry {name} collides with a pending one", .path.display())]
    CommitConflict { path: PathBuf, name: String },

    #[error("name service lookup for {query} failed: {source}")]
    Nss {
        query: String,
        #[source]
        source: io::Error,
    },
}

impl ProvisionError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        ProvisionError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn nss(query: impl Into<String>, source: io::Error) -> Self {
        ProvisionError::Nss {
            query: query.into(),
            source,
        }
    }
}
