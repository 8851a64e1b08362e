//! Group description files
//!
//! One JSON document per group under the groups directory. Descriptions
//! are re-read lazily when the file's mtime changes, and the admin
//! surface edits them under ETag preconditions.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use tracing::debug;

use crate::models::group::{GroupDescription, UserDescription};
use crate::models::password::Password;
use crate::models::permission::Permissions;
use crate::{Error, Result};

pub struct DescriptionStore {
    dir: PathBuf,
    cache: Mutex<HashMap<String, Cached>>,
}

struct Cached {
    desc: Arc<GroupDescription>,
    mod_time: SystemTime,
}

impl DescriptionStore {
    #[must_use]
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self {
            dir: dir.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Cached>> {
        self.cache.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn path(&self, name: &str) -> Result<PathBuf> {
        validate_name(name)?;
        Ok(self.dir.join(format!("{name}.json")))
    }

    /// Fetch a group's description, re-reading the file only when its
    /// mtime moved since the last read.
    pub fn get(&self, name: &str) -> Result<Arc<GroupDescription>> {
        let path = self.path(name)?;
        let mut cache = self.lock();

        let metadata = match fs::metadata(&path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                cache.remove(name);
                return Err(Error::NotFound(format!("No such group: {name}")));
            }
            Err(e) => return Err(e.into()),
        };
        let mod_time = metadata.modified()?;

        if let Some(cached) = cache.get(name) {
            if cached.mod_time == mod_time {
                return Ok(cached.desc.clone());
            }
        }

        let desc = Arc::new(read_description(&path, name)?);
        debug!(group = %name, "Loaded group description");
        cache.insert(
            name.to_string(),
            Cached {
                desc: desc.clone(),
                mod_time,
            },
        );
        Ok(desc)
    }

    /// Current strong ETag of a group's description
    pub fn etag(&self, name: &str) -> Result<String> {
        self.get(name)?.etag()
    }

    /// Names of all groups whose description file exists
    pub fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        collect_names(&self.dir, "", &mut names)?;
        names.sort();
        Ok(names)
    }

    /// Replace a whole description under an ETag precondition.
    ///
    /// An empty `if_match` means "create, must not exist". Returns the
    /// new ETag.
    pub fn update(&self, name: &str, desc: &GroupDescription, if_match: &str) -> Result<String> {
        let path = self.path(name)?;
        let mut cache = self.lock();
        self.check_precondition(&path, name, if_match)?;
        write_description(&path, desc)?;

        let mod_time = fs::metadata(&path)?.modified()?;
        let mut stored = desc.clone();
        stored.name = name.to_string();
        let stored = Arc::new(stored);
        let etag = stored.etag()?;
        cache.insert(
            name.to_string(),
            Cached {
                desc: stored,
                mod_time,
            },
        );
        Ok(etag)
    }

    /// Delete a group's description under an ETag precondition.
    pub fn delete(&self, name: &str, if_match: &str) -> Result<()> {
        let path = self.path(name)?;
        let mut cache = self.lock();
        let current = read_description(&path, name).map_err(|e| match e {
            Error::Io(ref io) if io.kind() == ErrorKind::NotFound => {
                Error::NotFound(format!("No such group: {name}"))
            }
            other => other,
        })?;
        if !if_match.is_empty() && current.etag()? != if_match {
            return Err(Error::Conflict("Group description has changed".to_string()));
        }
        fs::remove_file(&path)?;
        cache.remove(name);
        Ok(())
    }

    /// Create or replace one user entry under a group-level ETag
    /// precondition. Returns the description's new ETag.
    pub fn update_user(
        &self,
        group: &str,
        username: &str,
        user: UserDescription,
        if_match: &str,
    ) -> Result<String> {
        self.modify(group, if_match, |desc| {
            desc.users.insert(username.to_string(), user);
            Ok(())
        })
    }

    /// Change one user's permissions, leaving the password untouched.
    pub fn update_user_permissions(
        &self,
        group: &str,
        username: &str,
        permissions: Permissions,
        if_match: &str,
    ) -> Result<String> {
        permissions.expand()?;
        self.modify(group, if_match, |desc| {
            let user = desc
                .users
                .get_mut(username)
                .ok_or_else(|| Error::NotFound(format!("No such user: {username}")))?;
            user.permissions = permissions;
            Ok(())
        })
    }

    /// Set one user's password record.
    pub fn set_user_password(
        &self,
        group: &str,
        username: &str,
        password: Password,
        if_match: &str,
    ) -> Result<String> {
        self.modify(group, if_match, |desc| {
            let user = desc
                .users
                .get_mut(username)
                .ok_or_else(|| Error::NotFound(format!("No such user: {username}")))?;
            user.password = Some(password);
            Ok(())
        })
    }

    pub fn delete_user(&self, group: &str, username: &str, if_match: &str) -> Result<String> {
        self.modify(group, if_match, |desc| {
            desc.users
                .remove(username)
                .ok_or_else(|| Error::NotFound(format!("No such user: {username}")))?;
            Ok(())
        })
    }

    /// Set or clear the wildcard user.
    pub fn set_wildcard_user(
        &self,
        group: &str,
        user: Option<UserDescription>,
        if_match: &str,
    ) -> Result<String> {
        self.modify(group, if_match, |desc| {
            desc.wildcard_user = user;
            Ok(())
        })
    }

    /// Read-modify-write of one description under the store lock.
    ///
    /// An empty `if_match` performs an unconditional edit, the way a
    /// request without If-Match does.
    fn modify<F>(&self, group: &str, if_match: &str, edit: F) -> Result<String>
    where
        F: FnOnce(&mut GroupDescription) -> Result<()>,
    {
        let path = self.path(group)?;
        let mut cache = self.lock();
        let current = read_description(&path, group).map_err(|e| match e {
            Error::Io(ref io) if io.kind() == ErrorKind::NotFound => {
                Error::NotFound(format!("No such group: {group}"))
            }
            other => other,
        })?;
        if !if_match.is_empty() && current.etag()? != if_match {
            return Err(Error::Conflict("Group description has changed".to_string()));
        }

        let mut desc = current;
        edit(&mut desc)?;
        write_description(&path, &desc)?;

        let mod_time = fs::metadata(&path)?.modified()?;
        let desc = Arc::new(desc);
        let etag = desc.etag()?;
        cache.insert(
            group.to_string(),
            Cached {
                desc,
                mod_time,
            },
        );
        Ok(etag)
    }

    fn check_precondition(&self, path: &Path, name: &str, if_match: &str) -> Result<()> {
        match read_description(path, name) {
            Ok(current) => {
                if if_match.is_empty() {
                    return Err(Error::Conflict(format!("Group already exists: {name}")));
                }
                if current.etag()? != if_match {
                    return Err(Error::Conflict("Group description has changed".to_string()));
                }
                Ok(())
            }
            Err(Error::Io(ref io)) if io.kind() == ErrorKind::NotFound => {
                if if_match.is_empty() {
                    Ok(())
                } else {
                    Err(Error::NotFound(format!("No such group: {name}")))
                }
            }
            Err(e) => Err(e),
        }
    }
}

/// Group names map onto file paths; refuse anything that would escape
/// the groups directory. A `/` is allowed and denotes a subgroup.
fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('\\') || name.starts_with('/') || name.ends_with('/') {
        return Err(Error::Invalid(format!("Bad group name: {name}")));
    }
    for segment in name.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." || segment.starts_with('.') {
            return Err(Error::Invalid(format!("Bad group name: {name}")));
        }
    }
    Ok(())
}

fn read_description(path: &Path, name: &str) -> Result<GroupDescription> {
    let data = fs::read(path)?;
    let mut desc: GroupDescription = serde_json::from_slice(&data)
        .map_err(|e| Error::Invalid(format!("Bad group description {name}: {e}")))?;
    desc.name = name.to_string();
    Ok(desc)
}

fn write_description(path: &Path, desc: &GroupDescription) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    let temp = path.with_file_name(name);

    let mut data = serde_json::to_vec_pretty(desc)?;
    data.push(b'\n');
    let result = fs::write(&temp, &data)
        .map_err(Error::from)
        .and_then(|()| fs::rename(&temp, path).map_err(Error::from));
    if result.is_err() {
        let _ = fs::remove_file(&temp);
    }
    result
}

fn collect_names(dir: &Path, prefix: &str, names: &mut Vec<String>) -> Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };
        if file_name.starts_with('.') {
            continue;
        }
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            let nested = format!("{prefix}{file_name}/");
            collect_names(&entry.path(), &nested, names)?;
        } else if let Some(stem) = file_name.strip_suffix(".json") {
            names.push(format!("{prefix}{stem}"));
        }
    }
    Ok(())
}
