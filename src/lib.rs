pub mod config;
pub mod database;
pub mod error;
pub mod item;
pub mod lock;
pub mod nss;
pub mod session;
pub mod specifier;
pub mod write;

pub use error::ProvisionError;
pub use item::{Item, ItemKind};
pub use session::Session;

use std::path::{Path, PathBuf};

/// Upper bound of the numeric ID range reserved for system accounts.
pub const SYSTEM_UID_MAX: u32 = 999;
pub const SYSTEM_GID_MAX: u32 = 999;

/// Prepend the alternate root, if any, to an absolute host path.
pub fn rooted(root: Option<&Path>, path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    match root {
        Some(root) => root.join(path.strip_prefix("/").unwrap_or(path)),
        None => path.to_path_buf(),
    }
}
