//! Advisory queries against the host's account resolver.
//!
//! The resolver may consult sources beyond the on-disk files, so results
//! are used for uniqueness checks only. Absence means "not observed
//! here", not "absent globally". The probe is bypassed entirely when an
//! alternate root is in effect.

use std::ffi::{CStr, CString};
use std::io;

use crate::item::{Gid, Uid};

#[derive(Debug, Clone)]
pub struct NssUser {
    pub name: String,
    pub uid: Uid,
    pub gid: Gid,
    pub gecos: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NssGroup {
    pub name: String,
    pub gid: Gid,
}

pub trait NameService {
    fn user_by_name(&self, name: &str) -> io::Result<Option<NssUser>>;
    fn user_by_id(&self, uid: Uid) -> io::Result<Option<NssUser>>;
    fn group_by_name(&self, name: &str) -> io::Result<Option<NssGroup>>;
    fn group_by_id(&self, gid: Gid) -> io::Result<Option<NssGroup>>;
    fn shadow_entry_exists(&self, name: &str) -> io::Result<bool>;
}

/// Probe backed by the libc getpw/getgr/getsp family.
pub struct LibcNameService;

impl NameService for LibcNameService {
    fn user_by_name(&self, name: &str) -> io::Result<Option<NssUser>> {
        let Ok(name) = CString::new(name) else {
            return Ok(None);
        };
        clear_errno();
        let pw = unsafe { libc::getpwnam(name.as_ptr()) };
        if pw.is_null() {
            return absent();
        }
        Ok(Some(unsafe { user_from_raw(pw) }))
    }

    fn user_by_id(&self, uid: Uid) -> io::Result<Option<NssUser>> {
        clear_errno();
        let pw = unsafe { libc::getpwuid(uid) };
        if pw.is_null() {
            return absent();
        }
        Ok(Some(unsafe { user_from_raw(pw) }))
    }

    fn group_by_name(&self, name: &str) -> io::Result<Option<NssGroup>> {
        let Ok(name) = CString::new(name) else {
            return Ok(None);
        };
        clear_errno();
        let gr = unsafe { libc::getgrnam(name.as_ptr()) };
        if gr.is_null() {
            return absent();
        }
        Ok(Some(unsafe { group_from_raw(gr) }))
    }

    fn group_by_id(&self, gid: Gid) -> io::Result<Option<NssGroup>> {
        clear_errno();
        let gr = unsafe { libc::getgrgid(gid) };
        if gr.is_null() {
            return absent();
        }
        Ok(Some(unsafe { group_from_raw(gr) }))
    }

    fn shadow_entry_exists(&self, name: &str) -> io::Result<bool> {
        let Ok(name) = CString::new(name) else {
            return Ok(false);
        };
        clear_errno();
        let sp = unsafe { libc::getspnam(name.as_ptr()) };
        if sp.is_null() {
            absent::<()>()?;
            return Ok(false);
        }
        Ok(true)
    }
}

fn clear_errno() {
    unsafe {
        *libc::__errno_location() = 0;
    }
}

/// A null result is only "not found" when errno stayed clean; the
/// resolver reports lookup failures through errno alone.
fn absent<T>() -> io::Result<Option<T>> {
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        None | Some(0) | Some(libc::ENOENT) | Some(libc::ESRCH) => Ok(None),
        Some(_) => Err(err),
    }
}

unsafe fn user_from_raw(pw: *const libc::passwd) -> NssUser {
    let pw = &*pw;
    let gecos = if pw.pw_gecos.is_null() {
        None
    } else {
        let gecos = CStr::from_ptr(pw.pw_gecos).to_string_lossy().into_owned();
        if gecos.is_empty() {
            None
        } else {
            Some(gecos)
        }
    };
    NssUser {
        name: CStr::from_ptr(pw.pw_name).to_string_lossy().into_owned(),
        uid: pw.pw_uid,
        gid: pw.pw_gid,
        gecos,
    }
}

unsafe fn group_from_raw(gr: *const libc::group) -> NssGroup {
    let gr = &*gr;
    NssGroup {
        name: CStr::from_ptr(gr.gr_name).to_string_lossy().into_owned(),
        gid: gr.gr_gid,
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashSet;

    /// In-memory resolver for reconciler tests.
    #[derive(Default)]
    pub struct MockNameService {
        users: Vec<NssUser>,
        groups: Vec<NssGroup>,
        shadow: HashSet<String>,
    }

    impl MockNameService {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn add_user(&mut self, name: &str, uid: Uid, gid: Gid) -> &mut Self {
            self.users.push(NssUser {
                name: name.to_string(),
                uid,
                gid,
                gecos: None,
            });
            self
        }

        pub fn add_group(&mut self, name: &str, gid: Gid) -> &mut Self {
            self.groups.push(NssGroup {
                name: name.to_string(),
                gid,
            });
            self
        }

        pub fn add_shadow(&mut self, name: &str) -> &mut Self {
            self.shadow.insert(name.to_string());
            self
        }
    }

    impl NameService for MockNameService {
        fn user_by_name(&self, name: &str) -> io::Result<Option<NssUser>> {
            Ok(self.users.iter().find(|u| u.name == name).cloned())
        }

        fn user_by_id(&self, uid: Uid) -> io::Result<Option<NssUser>> {
            Ok(self.users.iter().find(|u| u.uid == uid).cloned())
        }

        fn group_by_name(&self, name: &str) -> io::Result<Option<NssGroup>> {
            Ok(self.groups.iter().find(|g| g.name == name).cloned())
        }

        fn group_by_id(&self, gid: Gid) -> io::Result<Option<NssGroup>> {
            Ok(self.groups.iter().find(|g| g.gid == gid).cloned())
        }

        fn shadow_entry_exists(&self, name: &str) -> io::Result<bool> {
            Ok(self.shadow.contains(name))
        }
    }
}
