// src/users.rs
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::Mutex;

/// External credential store. The engine only ever loads the full user
/// set at startup and inserts new users on registration.
pub trait CredentialStore: Send + Sync {
    fn load_users(&self) -> io::Result<Vec<(String, String)>>;
    fn insert_user(&self, name: &str, password: &str) -> io::Result<()>;
}

/// Append-only `name:password` file. Stands in for the reference
/// deployment's database server.
pub struct FileStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }
}

impl CredentialStore for FileStore {
    fn load_users(&self) -> io::Result<Vec<(String, String)>> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut users = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if let Some((name, pass)) = line.split_once(':') {
                users.push((name.to_string(), pass.to_string()));
            }
        }
        Ok(users)
    }

    fn insert_user(&self, name: &str, password: &str) -> io::Result<()> {
        let _guard = self.write_lock.lock().unwrap();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}:{}", name, password)
    }
}

/// In-memory store for tests and demos.
pub struct MemoryStore {
    users: Mutex<Vec<(String, String)>>,
}

impl MemoryStore {
    pub fn new(users: Vec<(String, String)>) -> Self {
        Self {
            users: Mutex::new(users),
        }
    }
}

impl CredentialStore for MemoryStore {
    fn load_users(&self) -> io::Result<Vec<(String, String)>> {
        Ok(self.users.lock().unwrap().clone())
    }

    fn insert_user(&self, name: &str, password: &str) -> io::Result<()> {
        self.users
            .lock()
            .unwrap()
            .push((name.to_string(), password.to_string()));
        Ok(())
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum RegisterOutcome {
    Created,
    Duplicate,
    StoreError,
}

/// In-memory username to password map, loaded once at startup and
/// mutated only by successful registration.
pub struct UserTable {
    inner: Mutex<HashMap<String, String>>,
}

impl UserTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn load_from(&self, store: &dyn CredentialStore) -> io::Result<usize> {
        let users = store.load_users()?;
        let mut table = self.inner.lock().unwrap();
        for (name, pass) in users {
            table.insert(name, pass);
        }
        Ok(table.len())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.lock().unwrap().contains_key(name)
    }

    pub fn verify(&self, name: &str, password: &str) -> bool {
        self.inner
            .lock()
            .unwrap()
            .get(name)
            .is_some_and(|p| p == password)
    }

    /// Insert into the table and the backing store. The table mutex is
    /// held across the store call so concurrent registrations serialize.
    pub fn register(
        &self,
        store: &dyn CredentialStore,
        name: &str,
        password: &str,
    ) -> RegisterOutcome {
        let mut table = self.inner.lock().unwrap();
        if table.contains_key(name) {
            return RegisterOutcome::Duplicate;
        }
        if store.insert_user(name, password).is_err() {
            return RegisterOutcome::StoreError;
        }
        table.insert(name.to_string(), password.to_string());
        RegisterOutcome::Created
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for UserTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_checks_password() {
        let table = UserTable::new();
        let store = MemoryStore::new(vec![("alice".into(), "secret".into())]);
        assert_eq!(table.load_from(&store).unwrap(), 1);
        assert!(table.verify("alice", "secret"));
        assert!(!table.verify("alice", "wrong"));
        assert!(!table.verify("bob", "secret"));
    }

    #[test]
    fn register_rejects_duplicates() {
        let table = UserTable::new();
        let store = MemoryStore::new(Vec::new());
        assert_eq!(table.register(&store, "bob", "pw"), RegisterOutcome::Created);
        assert_eq!(
            table.register(&store, "bob", "other"),
            RegisterOutcome::Duplicate
        );
        assert!(table.verify("bob", "pw"));
        assert_eq!(store.load_users().unwrap().len(), 1);
    }

    #[test]
    fn file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("users.db"));
        assert!(store.load_users().unwrap().is_empty());
        store.insert_user("carol", "pw:with:colons").unwrap();
        let users = store.load_users().unwrap();
        assert_eq!(users, vec![("carol".to_string(), "pw:with:colons".to_string())]);
    }
}
