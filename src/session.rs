//! Per-run state and the reconciliation engine.
//!
//! A `Session` owns everything one run mutates: the declared sets, the
//! loaded databases, the pending sets and the allocator cursors. It is
//! built after argument parsing, threaded through the reconciler and the
//! writer, and dropped on exit.

use std::collections::BTreeMap;
use std::fs;
use std::mem;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use tracing::{debug, error, info};

use crate::config::DeclaredSets;
use crate::database::AccountDb;
use crate::error::ProvisionError;
use crate::item::{Gid, Item, ItemKind, Uid};
use crate::nss::NameService;
use crate::{rooted, SYSTEM_GID_MAX, SYSTEM_UID_MAX};

/// A user creation decided on, frozen at its numeric ID until commit.
#[derive(Debug, Clone)]
pub struct PendingUser {
    pub name: String,
    pub uid: Uid,
    pub gid: Gid,
    pub description: Option<String>,
}

/// A group creation decided on.
#[derive(Debug, Clone)]
pub struct PendingGroup {
    pub name: String,
    pub gid: Gid,
}

pub struct Session {
    root: Option<PathBuf>,
    probe: Option<Box<dyn NameService>>,
    pub declared: DeclaredSets,
    pub db: AccountDb,
    pub pending_uids: BTreeMap<Uid, PendingUser>,
    pub pending_gids: BTreeMap<Gid, PendingGroup>,
    search_uid: Uid,
    search_gid: Gid,
}

/// The allocator treats users and groups the same way apart from the
/// freeness predicate, the acceptable range and which cursor moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IdSpace {
    User,
    Group,
}

impl IdSpace {
    fn max(self) -> u32 {
        match self {
            IdSpace::User => SYSTEM_UID_MAX,
            IdSpace::Group => SYSTEM_GID_MAX,
        }
    }

    fn kind(self) -> ItemKind {
        match self {
            IdSpace::User => ItemKind::AddUser,
            IdSpace::Group => ItemKind::AddGroup,
        }
    }
}

impl Session {
    /// `probe` should be absent whenever `root` is set; the host resolver
    /// only reflects the real root.
    pub fn new(
        root: Option<PathBuf>,
        probe: Option<Box<dyn NameService>>,
        declared: DeclaredSets,
    ) -> Self {
        Session {
            root,
            probe,
            declared,
            db: AccountDb::default(),
            pending_uids: BTreeMap::new(),
            pending_gids: BTreeMap::new(),
            search_uid: SYSTEM_UID_MAX,
            search_gid: SYSTEM_GID_MAX,
        }
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending_uids.is_empty() || !self.pending_gids.is_empty()
    }

    pub fn load_databases(&mut self) -> Result<(), ProvisionError> {
        self.db = AccountDb::load(self.root.as_deref())?;
        Ok(())
    }

    /// Resolve every declared item into either an adopted existing ID or
    /// an entry in the pending sets. Groups run first so that a group
    /// declaration matching a user declaration folds into it and the pair
    /// shares one numeric ID where possible.
    pub fn reconcile(&mut self) -> Result<(), ProvisionError> {
        let mut groups = mem::take(&mut self.declared.groups);
        let mut users = mem::take(&mut self.declared.users);
        let result = self.reconcile_taken(&mut groups, &mut users);
        self.declared.groups = groups;
        self.declared.users = users;
        result
    }

    fn reconcile_taken(
        &mut self,
        groups: &mut BTreeMap<String, Item>,
        users: &mut BTreeMap<String, Item>,
    ) -> Result<(), ProvisionError> {
        for item in groups.values_mut() {
            if let Some(user) = users.get_mut(&item.name) {
                // a user of the same name is declared, fold the group's
                // hints into it and create the pair in one step below
                if item.gid.is_some() {
                    user.gid = item.gid;
                }
                if let Some(path) = &item.gid_path {
                    user.gid_path = Some(path.clone());
                }
                continue;
            }
            self.add_group(item)?;
        }
        for item in users.values_mut() {
            self.add_group(item)?;
            self.add_user(item)?;
        }
        Ok(())
    }

    fn add_group(&mut self, item: &mut Item) -> Result<(), ProvisionError> {
        if let Some(&gid) = self.db.group_by_name.get(&item.name) {
            debug!("Group {} already exists.", item.name);
            item.gid = Some(gid);
            return Ok(());
        }

        if let Some(probe) = &self.probe {
            let found = probe
                .group_by_name(&item.name)
                .map_err(|err| ProvisionError::nss(format!("group {}", item.name), err))?;
            if let Some(group) = found {
                debug!("Group {} already exists.", item.name);
                item.gid = Some(group.gid);
                return Ok(());
            }
        }

        let root = self.root.clone();
        let uid_path = item.uid_path.clone();
        let gid_path = item.gid_path.clone();
        let gid = self.choose_id(IdSpace::Group, &item.name, item.gid, item.uid, move || {
            gid_candidate_from_paths(root.as_deref(), uid_path.as_deref(), gid_path.as_deref())
        })?;

        item.gid = Some(gid);
        item.pending = true;
        self.pending_gids.insert(
            gid,
            PendingGroup {
                name: item.name.clone(),
                gid,
            },
        );
        info!("Creating group {} with gid {}.", item.name, gid);
        Ok(())
    }

    fn add_user(&mut self, item: &mut Item) -> Result<(), ProvisionError> {
        if let Some(&uid) = self.db.user_by_name.get(&item.name) {
            debug!("User {} already exists.", item.name);
            item.uid = Some(uid);
            return Ok(());
        }

        if let Some(probe) = &self.probe {
            let found = probe
                .user_by_name(&item.name)
                .map_err(|err| ProvisionError::nss(format!("user {}", item.name), err))?;
            if let Some(user) = found {
                debug!("User {} already exists.", item.name);
                item.uid = Some(user.uid);
                item.description = user.gecos;
                return Ok(());
            }

            // a shadow entry without a passwd entry means the databases
            // are already inconsistent, refuse to make it worse
            let in_shadow = probe
                .shadow_entry_exists(&item.name)
                .map_err(|err| ProvisionError::nss(format!("shadow {}", item.name), err))?;
            if in_shadow {
                error!(
                    "User {} already exists in shadow database, but not in user database.",
                    item.name
                );
                return Err(ProvisionError::ShadowOnlyUser(item.name.clone()));
            }
        }

        let root = self.root.clone();
        let uid_path = item.uid_path.clone();
        let gid_path = item.gid_path.clone();
        let uid = self.choose_id(IdSpace::User, &item.name, item.uid, item.gid, move || {
            uid_candidate_from_paths(root.as_deref(), uid_path.as_deref(), gid_path.as_deref())
        })?;

        item.uid = Some(uid);
        item.pending = true;
        // group creation ran first for this name, so a gid is present here
        let gid = item.gid.unwrap_or(uid);
        self.pending_uids.insert(
            uid,
            PendingUser {
                name: item.name.clone(),
                uid,
                gid,
                description: item.description.clone(),
            },
        );
        info!(
            "Creating user {} ({}) with uid {} and gid {}.",
            item.name,
            item.description.as_deref().unwrap_or("-"),
            uid,
            gid
        );
        Ok(())
    }

    /// Candidate order for both kinds: literal hint, then the paired ID
    /// of the other kind, then an ID inherited from a hint path, then the
    /// downward scan.
    fn choose_id(
        &mut self,
        space: IdSpace,
        name: &str,
        literal: Option<u32>,
        paired: Option<u32>,
        from_path: impl FnOnce() -> Option<u32>,
    ) -> Result<u32, ProvisionError> {
        if let Some(id) = literal {
            if self.id_is_free(space, id, name)? {
                return Ok(id);
            }
            debug!("Suggested {} ID {} for {} already used.", space.kind(), id, name);
        }

        if let Some(id) = paired {
            if self.id_is_free(space, id, name)? {
                return Ok(id);
            }
        }

        if let Some(id) = from_path() {
            if id == 0 || id > space.max() {
                debug!("{} ID {} of file not suitable for {}.", space.kind(), id, name);
            } else if self.id_is_free(space, id, name)? {
                return Ok(id);
            } else {
                debug!("{} ID {} of file for {} already used.", space.kind(), id, name);
            }
        }

        self.scan_free_id(space, name)
    }

    fn id_is_free(&self, space: IdSpace, id: u32, name: &str) -> Result<bool, ProvisionError> {
        match space {
            IdSpace::User => self.uid_is_free(id, name),
            IdSpace::Group => self.gid_is_free(id),
        }
    }

    /// A UID is free when no pending or existing user holds it and any
    /// group holding the same numeric value carries the same name. The
    /// exception exists because users and groups are normally created as
    /// a matched pair sharing an ID.
    fn uid_is_free(&self, uid: Uid, name: &str) -> Result<bool, ProvisionError> {
        if self.pending_uids.contains_key(&uid) {
            return Ok(false);
        }
        if let Some(group) = self.pending_gids.get(&uid) {
            if group.name != name {
                return Ok(false);
            }
        }
        if self.db.user_by_id.contains_key(&uid) {
            return Ok(false);
        }
        if let Some(group_name) = self.db.group_by_id.get(&uid) {
            if group_name != name {
                return Ok(false);
            }
        }
        if let Some(probe) = &self.probe {
            let user = probe
                .user_by_id(uid)
                .map_err(|err| ProvisionError::nss(format!("uid {uid}"), err))?;
            if user.is_some() {
                return Ok(false);
            }
            let group = probe
                .group_by_id(uid)
                .map_err(|err| ProvisionError::nss(format!("gid {uid}"), err))?;
            if let Some(group) = group {
                if group.name != name {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// GIDs are checked strictly against all four namespaces in both
    /// roles, with no name exception.
    fn gid_is_free(&self, gid: Gid) -> Result<bool, ProvisionError> {
        if self.pending_gids.contains_key(&gid) || self.pending_uids.contains_key(&gid) {
            return Ok(false);
        }
        if self.db.group_by_id.contains_key(&gid) || self.db.user_by_id.contains_key(&gid) {
            return Ok(false);
        }
        if let Some(probe) = &self.probe {
            let group = probe
                .group_by_id(gid)
                .map_err(|err| ProvisionError::nss(format!("gid {gid}"), err))?;
            if group.is_some() {
                return Ok(false);
            }
            let user = probe
                .user_by_id(gid)
                .map_err(|err| ProvisionError::nss(format!("uid {gid}"), err))?;
            if user.is_some() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Walk the cursor downward until a free ID turns up. The cursor then
    /// moves past the chosen value so it is never retried within the run.
    fn scan_free_id(&mut self, space: IdSpace, name: &str) -> Result<u32, ProvisionError> {
        let mut cursor = match space {
            IdSpace::User => self.search_uid,
            IdSpace::Group => self.search_gid,
        };
        let found = loop {
            if cursor == 0 {
                break None;
            }
            if self.id_is_free(space, cursor, name)? {
                break Some(cursor);
            }
            cursor -= 1;
        };
        let next = found.map(|id| id - 1).unwrap_or(0);
        match space {
            IdSpace::User => self.search_uid = next,
            IdSpace::Group => self.search_gid = next,
        }
        found.ok_or_else(|| {
            error!("No free {} ID available for {}.", space.kind(), name);
            ProvisionError::IdExhausted {
                kind: space.kind(),
                name: name.to_string(),
            }
        })
    }
}

fn stat_ids(root: Option<&Path>, path: &Path) -> Option<(Uid, Gid)> {
    let meta = fs::metadata(rooted(root, path)).ok()?;
    Some((meta.uid(), meta.gid()))
}

/// Group candidate from the hint paths: the group owner of the gid path,
/// falling back to the group owner of the uid path.
fn gid_candidate_from_paths(
    root: Option<&Path>,
    uid_path: Option<&Path>,
    gid_path: Option<&Path>,
) -> Option<Gid> {
    if let Some(path) = gid_path {
        if let Some((_, gid)) = stat_ids(root, path) {
            return Some(gid);
        }
    }
    if let Some(path) = uid_path {
        if let Some((_, gid)) = stat_ids(root, path) {
            return Some(gid);
        }
    }
    None
}

/// User candidate from the hint paths: the file owner of the uid path.
/// When only a gid path exists, its group owner is reused as the UID.
fn uid_candidate_from_paths(
    root: Option<&Path>,
    uid_path: Option<&Path>,
    gid_path: Option<&Path>,
) -> Option<Uid> {
    if let Some(path) = uid_path {
        if let Some((uid, _)) = stat_ids(root, path) {
            return Some(uid);
        }
    }
    if let Some(path) = gid_path {
        if let Some((_, gid)) = stat_ids(root, path) {
            return Some(gid);
        }
    }
    None
}
