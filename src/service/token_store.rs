//! Durable store for stateful tokens
//!
//! A single JSON-lines file, one token per line, rewritten atomically on
//! every mutation. Readers go through an mtime memo so out-of-process
//! edits are picked up lazily; writers are serialized by the store lock.

use std::collections::HashMap;
use std::fs;
use std::io::{BufRead, BufReader, BufWriter, ErrorKind, Write as _};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;

use chrono::Utc;
use tracing::{debug, warn};

use crate::models::StatefulToken;
use crate::{Error, Result};

pub struct TokenStore {
    state: Mutex<State>,
}

struct State {
    filename: PathBuf,
    tokens: HashMap<String, StatefulToken>,
    mod_time: Option<SystemTime>,
}

impl TokenStore {
    #[must_use]
    pub fn new<P: Into<PathBuf>>(filename: P) -> Self {
        Self {
            state: Mutex::new(State {
                filename: filename.into(),
                tokens: HashMap::new(),
                mod_time: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Fetch a copy of a token together with its current ETag.
    ///
    /// Callers modify the copy and pass the ETag back to [`update`](Self::update).
    pub fn get(&self, token: &str) -> Result<(StatefulToken, String)> {
        let mut state = self.lock();
        state.load()?;
        let record = state
            .tokens
            .get(token)
            .cloned()
            .ok_or_else(|| Error::NotFound("No such token".to_string()))?;
        let etag = record.etag()?;
        Ok((record, etag))
    }

    /// All tokens, optionally restricted to one group, sorted by value.
    pub fn list(&self, group: Option<&str>) -> Result<Vec<StatefulToken>> {
        let mut state = self.lock();
        state.load()?;
        let mut records: Vec<StatefulToken> = state
            .tokens
            .values()
            .filter(|t| group.map_or(true, |g| t.group == g))
            .cloned()
            .collect();
        records.sort_by(|a, b| a.token.cmp(&b.token));
        Ok(records)
    }

    /// Create or modify a token under an ETag precondition.
    ///
    /// An empty ETag means "create, must not exist"; otherwise the ETag
    /// must match the stored record. On mismatch the caller re-reads and
    /// retries.
    pub fn update(&self, token: &StatefulToken, etag: &str) -> Result<StatefulToken> {
        if token.token.is_empty() {
            return Err(Error::Invalid("Empty token value".to_string()));
        }
        if token.group.is_empty() {
            return Err(Error::Invalid("Token without a group".to_string()));
        }

        let mut state = self.lock();
        state.load()?;
        match state.apply(token, etag) {
            Ok(()) => Ok(token.clone()),
            Err(e @ (Error::Io(_) | Error::Serialization(_))) => {
                warn!(token = %token.token, "Token store write failed, retrying: {e}");
                state.mod_time = None;
                state.load()?;
                state
                    .apply(token, etag)
                    .map_err(|e| Error::Internal(format!("Token store update failed: {e}")))?;
                Ok(token.clone())
            }
            Err(e) => Err(e),
        }
    }

    /// Delete a token under an ETag precondition.
    pub fn delete(&self, token: &str, etag: &str) -> Result<()> {
        let mut state = self.lock();
        state.load()?;
        let existing = state
            .tokens
            .get(token)
            .ok_or_else(|| Error::NotFound("No such token".to_string()))?;
        if !etag.is_empty() && existing.etag()? != etag {
            return Err(Error::Conflict("Token has changed".to_string()));
        }
        let previous = state.tokens.remove(token).expect("checked above");
        if let Err(e) = state.rewrite() {
            state.tokens.insert(token.to_string(), previous);
            return Err(e);
        }
        Ok(())
    }

    /// Drop tokens that expired more than `grace` ago.
    ///
    /// The grace period keeps evidence of recent revocations around for
    /// administrators.
    pub fn expire(&self, grace: chrono::Duration) -> Result<()> {
        let mut state = self.lock();
        state.load()?;
        let cutoff = Utc::now() - grace;
        let expired: Vec<String> = state
            .tokens
            .values()
            .filter(|t| matches!(t.expires, Some(e) if e < cutoff))
            .map(|t| t.token.clone())
            .collect();
        if expired.is_empty() {
            return Ok(());
        }
        let mut removed = Vec::with_capacity(expired.len());
        for value in &expired {
            if let Some(record) = state.tokens.remove(value) {
                removed.push(record);
            }
        }
        if let Err(e) = state.rewrite() {
            for record in removed {
                state.tokens.insert(record.token.clone(), record);
            }
            return Err(e);
        }
        debug!(count = expired.len(), "Removed expired tokens");
        Ok(())
    }

    /// Path of the backing file
    #[must_use]
    pub fn filename(&self) -> PathBuf {
        self.lock().filename.clone()
    }
}

impl State {
    /// Re-read the file if its mtime moved since the last load.
    fn load(&mut self) -> Result<()> {
        let metadata = match fs::metadata(&self.filename) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.tokens.clear();
                self.mod_time = None;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let mod_time = metadata.modified()?;
        if self.mod_time == Some(mod_time) {
            return Ok(());
        }

        let file = fs::File::open(&self.filename)?;
        let mut tokens = HashMap::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: StatefulToken = serde_json::from_str(&line)?;
            tokens.insert(record.token.clone(), record);
        }
        self.tokens = tokens;
        self.mod_time = Some(mod_time);
        Ok(())
    }

    /// Check the ETag precondition, apply the mutation in memory, and
    /// rewrite the file. On write failure the in-memory map is rolled
    /// back so it keeps matching the file.
    fn apply(&mut self, token: &StatefulToken, etag: &str) -> Result<()> {
        match self.tokens.get(&token.token) {
            Some(existing) => {
                if etag.is_empty() {
                    return Err(Error::Conflict("Token already exists".to_string()));
                }
                if existing.etag()? != etag {
                    return Err(Error::Conflict("Token has changed".to_string()));
                }
            }
            None => {
                if !etag.is_empty() {
                    return Err(Error::NotFound("No such token".to_string()));
                }
            }
        }

        let previous = self.tokens.insert(token.token.clone(), token.clone());
        if let Err(e) = self.rewrite() {
            match previous {
                Some(record) => {
                    self.tokens.insert(token.token.clone(), record);
                }
                None => {
                    self.tokens.remove(&token.token);
                }
            }
            return Err(e);
        }
        Ok(())
    }

    /// Rewrite the whole file from the in-memory map: records sorted by
    /// token value, written to a sibling temp file, fsynced, then renamed
    /// over the old file. An empty store removes the file instead.
    fn rewrite(&mut self) -> Result<()> {
        if self.tokens.is_empty() {
            match fs::remove_file(&self.filename) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            self.mod_time = None;
            return Ok(());
        }

        let mut records: Vec<&StatefulToken> = self.tokens.values().collect();
        records.sort_by(|a, b| a.token.cmp(&b.token));

        let temp = temp_path(&self.filename);
        let result = write_records(&temp, &records);
        if let Err(e) = result {
            let _ = fs::remove_file(&temp);
            return Err(e);
        }
        if let Err(e) = fs::rename(&temp, &self.filename) {
            let _ = fs::remove_file(&temp);
            return Err(e.into());
        }
        self.mod_time = Some(fs::metadata(&self.filename)?.modified()?);
        Ok(())
    }
}

fn temp_path(filename: &Path) -> PathBuf {
    let mut name = filename.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    filename.with_file_name(name)
}

fn write_records(path: &Path, records: &[&StatefulToken]) -> Result<()> {
    let file = fs::File::create(path)?;
    let mut writer = BufWriter::new(&file);
    for record in records {
        serde_json::to_writer(&mut writer, record)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    drop(writer);
    file.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn token(value: &str, username: &str, expires: chrono::DateTime<Utc>) -> StatefulToken {
        StatefulToken {
            token: value.to_string(),
            group: "test".to_string(),
            include_subgroups: false,
            username: Some(username.to_string()),
            permissions: vec!["present".to_string(), "message".to_string()],
            expires: Some(expires.fixed_offset()),
            not_before: None,
            issued_by: None,
            issued_at: None,
        }
    }

    fn read_file(path: &Path) -> Vec<StatefulToken> {
        let data = fs::read_to_string(path).unwrap();
        data.lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn test_create_and_get() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(dir.path().join("tokens.jsonl"));
        let future = Utc::now() + Duration::hours(1);

        for value in ["tok1", "tok2", "tok3"] {
            let t = token(value, "user", future);
            let stored = store.update(&t, "").unwrap();
            assert_eq!(stored, t);
        }

        let (record, etag) = store.get("tok2").unwrap();
        assert_eq!(record.token, "tok2");
        assert!(!etag.is_empty());

        // records end up in the file sorted by token value
        let on_disk = read_file(&store.filename());
        let values: Vec<&str> = on_disk.iter().map(|t| t.token.as_str()).collect();
        assert_eq!(values, vec!["tok1", "tok2", "tok3"]);
    }

    #[test]
    fn test_token_field_matches_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(dir.path().join("tokens.jsonl"));
        let future = Utc::now() + Duration::hours(1);
        store.update(&token("tok1", "user", future), "").unwrap();
        store.update(&token("tok2", "user", future), "").unwrap();

        for record in store.list(None).unwrap() {
            let (fetched, _) = store.get(&record.token).unwrap();
            assert_eq!(fetched.token, record.token);
        }
    }

    #[test]
    fn test_etag_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(dir.path().join("tokens.jsonl"));
        let now = Utc::now();
        store.update(&token("tok2", "user", now + Duration::minutes(30)), "").unwrap();

        let (mut record, etag) = store.get("tok2").unwrap();
        record.expires = Some((now + Duration::hours(1)).fixed_offset());

        let err = store.update(&record, "").unwrap_err();
        assert!(err.is_conflict());
        let err = store.update(&record, "\"bad\"").unwrap_err();
        assert!(err.is_conflict());

        store.update(&record, &etag).unwrap();
        let (fetched, _) = store.get("tok2").unwrap();
        assert_eq!(fetched.expires, record.expires);

        // disk reflects the edit
        let fresh = TokenStore::new(store.filename());
        let (reloaded, _) = fresh.get("tok2").unwrap();
        assert_eq!(reloaded.expires, record.expires);
    }

    #[test]
    fn test_update_missing_with_etag() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(dir.path().join("tokens.jsonl"));
        let t = token("ghost", "user", Utc::now() + Duration::hours(1));
        let err = store.update(&t, "\"some-etag\"").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_duplicate_create() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(dir.path().join("tokens.jsonl"));
        let t = token("tok1", "user", Utc::now() + Duration::hours(1));
        store.update(&t, "").unwrap();
        let err = store.update(&t, "").unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn test_empty_store_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(dir.path().join("tokens.jsonl"));
        let t = token("tok1", "user", Utc::now() + Duration::hours(1));
        store.update(&t, "").unwrap();
        assert!(store.filename().exists());

        let (_, etag) = store.get("tok1").unwrap();
        store.delete("tok1", &etag).unwrap();
        assert!(!store.filename().exists());
    }

    #[test]
    fn test_expire_grace() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(dir.path().join("tokens.jsonl"));
        let now = Utc::now();
        let expiries = [
            ("tok1", now),
            ("tok2", now + Duration::hours(1)),
            ("tok3", now),
            ("tok4", now - Duration::days(6)),
            ("tok5", now - Duration::days(8)),
        ];
        for (value, expires) in expiries {
            store.update(&token(value, "user", expires), "").unwrap();
        }

        store.expire(Duration::days(7)).unwrap();

        let remaining: Vec<String> = store
            .list(None)
            .unwrap()
            .into_iter()
            .map(|t| t.token)
            .collect();
        assert_eq!(remaining, vec!["tok1", "tok2", "tok3", "tok4"]);

        let on_disk = read_file(&store.filename());
        assert_eq!(on_disk.len(), 4);
    }

    #[test]
    fn test_out_of_process_edit_picked_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.jsonl");
        let store = TokenStore::new(path.clone());
        let future = Utc::now() + Duration::hours(1);
        store.update(&token("tok1", "user", future), "").unwrap();

        // a second store handle simulating another process
        let other = TokenStore::new(path);
        other.update(&token("tok2", "other", future), "").unwrap();

        // ensure the mtime differs even on coarse filesystem clocks
        let now = std::time::SystemTime::now();
        let file = fs::File::options().append(true).open(store.filename()).unwrap();
        file.set_modified(now + std::time::Duration::from_secs(2)).unwrap();
        drop(file);

        assert!(store.get("tok2").is_ok());
    }
}
