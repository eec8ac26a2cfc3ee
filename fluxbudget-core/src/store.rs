//! Output stores
//!
//! An [`OutputStore`] holds the output containers of a run, keyed by variable, kind and
//! the averaging suffix. Stores are shared between tile workers, so every operation
//! takes `&self` and the implementations synchronise internally.
//!
//! - [`MemoryStore`] keeps everything in memory
//! - [`DirectoryStore`] buffers in memory and writes one JSON file per container on
//!   [`OutputStore::flush`], at `<root>/<VAR>/<kind><suffix>.json`

use crate::errors::{BudgetError, BudgetResult};
use crate::output::{OutputContainer, OutputKind};
use crate::variables::Variable;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Identifies one output container
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutputKey {
    pub variable: Variable,
    pub kind: OutputKind,
    /// Averaging suffix such as `_avg_xy`, empty without averaging
    pub suffix: String,
}

impl OutputKey {
    pub fn new(variable: Variable, kind: OutputKind, suffix: impl Into<String>) -> Self {
        Self {
            variable,
            kind,
            suffix: suffix.into(),
        }
    }

    /// Path of the container relative to the store root
    pub fn relative_path(&self) -> PathBuf {
        PathBuf::from(self.variable.upper()).join(format!("{}{}.json", self.kind, self.suffix))
    }
}

/// Storage of output containers
pub trait OutputStore: Send + Sync {
    fn exists(&self, key: &OutputKey) -> BudgetResult<bool>;

    fn put(&self, key: OutputKey, container: OutputContainer) -> BudgetResult<()>;

    fn get(&self, key: &OutputKey) -> BudgetResult<Option<OutputContainer>>;

    fn remove(&self, key: &OutputKey) -> BudgetResult<()>;

    /// Atomically replace a container by `f(current)`
    fn update(
        &self,
        key: OutputKey,
        f: &mut dyn FnMut(Option<OutputContainer>) -> BudgetResult<OutputContainer>,
    ) -> BudgetResult<()>;

    /// Persist everything written so far
    fn flush(&self) -> BudgetResult<()> {
        Ok(())
    }
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryStore {
    containers: Mutex<BTreeMap<OutputKey, OutputContainer>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> BudgetResult<MutexGuard<'_, BTreeMap<OutputKey, OutputContainer>>> {
        self.containers
            .lock()
            .map_err(|_| BudgetError::InvalidField("output store lock poisoned".into()))
    }

    /// Keys of all stored containers
    pub fn keys(&self) -> BudgetResult<Vec<OutputKey>> {
        Ok(self.lock()?.keys().cloned().collect())
    }

    /// Replace a container by `f(current)` under the lock. A missing container is
    /// looked up with `load` first. The stored container is left untouched if `f` fails.
    fn update_or_load(
        &self,
        key: OutputKey,
        load: impl FnOnce(&OutputKey) -> BudgetResult<Option<OutputContainer>>,
        f: &mut dyn FnMut(Option<OutputContainer>) -> BudgetResult<OutputContainer>,
    ) -> BudgetResult<()> {
        let mut containers = self.lock()?;
        let current = match containers.get(&key) {
            Some(c) => Some(c.clone()),
            None => load(&key)?,
        };
        let next = f(current)?;
        containers.insert(key, next);
        Ok(())
    }

    fn take_all(&self) -> BudgetResult<BTreeMap<OutputKey, OutputContainer>> {
        Ok(std::mem::take(&mut *self.lock()?))
    }
}

impl OutputStore for MemoryStore {
    fn exists(&self, key: &OutputKey) -> BudgetResult<bool> {
        Ok(self.lock()?.contains_key(key))
    }

    fn put(&self, key: OutputKey, container: OutputContainer) -> BudgetResult<()> {
        self.lock()?.insert(key, container);
        Ok(())
    }

    fn get(&self, key: &OutputKey) -> BudgetResult<Option<OutputContainer>> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn remove(&self, key: &OutputKey) -> BudgetResult<()> {
        self.lock()?.remove(key);
        Ok(())
    }

    fn update(
        &self,
        key: OutputKey,
        f: &mut dyn FnMut(Option<OutputContainer>) -> BudgetResult<OutputContainer>,
    ) -> BudgetResult<()> {
        self.update_or_load(key, |_| Ok(None), f)
    }
}

/// Store writing JSON files below a root directory
#[derive(Debug)]
pub struct DirectoryStore {
    root: PathBuf,
    pending: MemoryStore,
}

impl DirectoryStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            pending: MemoryStore::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, key: &OutputKey) -> PathBuf {
        self.root.join(key.relative_path())
    }

    fn read(&self, key: &OutputKey) -> BudgetResult<Option<OutputContainer>> {
        let path = self.path(key);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }
}

impl OutputStore for DirectoryStore {
    fn exists(&self, key: &OutputKey) -> BudgetResult<bool> {
        Ok(self.pending.exists(key)? || self.path(key).exists())
    }

    fn put(&self, key: OutputKey, container: OutputContainer) -> BudgetResult<()> {
        self.pending.put(key, container)
    }

    fn get(&self, key: &OutputKey) -> BudgetResult<Option<OutputContainer>> {
        match self.pending.get(key)? {
            Some(c) => Ok(Some(c)),
            None => self.read(key),
        }
    }

    fn remove(&self, key: &OutputKey) -> BudgetResult<()> {
        self.pending.remove(key)?;
        let path = self.path(key);
        if path.exists() {
            log::debug!("Remove {}", path.display());
            fs::remove_file(path)?;
        }
        Ok(())
    }

    fn update(
        &self,
        key: OutputKey,
        f: &mut dyn FnMut(Option<OutputContainer>) -> BudgetResult<OutputContainer>,
    ) -> BudgetResult<()> {
        self.pending.update_or_load(key, |k| self.read(k), f)
    }

    fn flush(&self) -> BudgetResult<()> {
        for (key, container) in self.pending.take_all()? {
            let path = self.path(&key);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, serde_json::to_string(&container)?)?;
            log::info!("Saved {}", path.display());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Dataset;
    use crate::field::{Dim, Field};
    use ndarray::Array;

    fn container(value: f64) -> OutputContainer {
        let field = Field::full(vec![(Dim::X, Array::range(0.0, 3.0, 1.0))], value).unwrap();
        OutputContainer::new("test", "K s-1", Dataset::new().with("A", field))
    }

    #[test]
    fn test_memory_store_update() {
        let store = MemoryStore::new();
        let key = OutputKey::new(Variable::T, OutputKind::Adv, "");
        assert!(!store.exists(&key).unwrap());
        store
            .update(key.clone(), &mut |current| {
                assert!(current.is_none());
                Ok(container(1.0))
            })
            .unwrap();
        store
            .update(key.clone(), &mut |current| {
                let mut c = current.unwrap();
                c.description = "updated".into();
                Ok(c)
            })
            .unwrap();
        assert_eq!(store.get(&key).unwrap().unwrap().description, "updated");
        store.remove(&key).unwrap();
        assert!(store.get(&key).unwrap().is_none());
    }

    #[test]
    fn test_failed_update_keeps_container() {
        let store = MemoryStore::new();
        let key = OutputKey::new(Variable::W, OutputKind::Tend, "");
        store.put(key.clone(), container(1.0)).unwrap();
        let err = store
            .update(key.clone(), &mut |_| Err(BudgetError::missing("FWX_CORR")))
            .unwrap_err();
        assert!(matches!(err, BudgetError::MissingInput { .. }));
        assert_eq!(store.get(&key).unwrap(), Some(container(1.0)));
    }

    #[test]
    fn test_concurrent_updates_of_flushed_container() {
        let root =
            std::env::temp_dir().join(format!("fluxbudget-update-{}", std::process::id()));
        let key = OutputKey::new(Variable::T, OutputKind::Adv, "");
        let store = DirectoryStore::new(&root);
        store.put(key.clone(), container(0.0)).unwrap();
        store.flush().unwrap();

        // every tile merges its part into the container read back from disk
        let store = DirectoryStore::new(&root);
        std::thread::scope(|s| {
            for i in 0..8 {
                let (store, key) = (&store, key.clone());
                s.spawn(move || {
                    store
                        .update(key, &mut |current| {
                            let mut c = current.unwrap();
                            let field = c.data.require("A")?.clone();
                            c.data.insert(format!("B{}", i), field);
                            Ok(c)
                        })
                        .unwrap();
                });
            }
        });
        let merged = store.get(&key).unwrap().unwrap();
        for i in 0..8 {
            assert!(merged.data.contains(&format!("B{}", i)), "B{}", i);
        }
        assert!(merged.data.contains("A"));
        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_directory_store_flush() {
        let root = std::env::temp_dir().join(format!("fluxbudget-store-{}", std::process::id()));
        let store = DirectoryStore::new(&root);
        let key = OutputKey::new(Variable::U, OutputKind::Sgsflux, "_avg_y");
        store.put(key.clone(), container(2.0)).unwrap();
        assert!(!root.join("U/sgsflux_avg_y.json").exists());
        store.flush().unwrap();
        assert!(root.join("U/sgsflux_avg_y.json").exists());

        // a fresh store sees the flushed container
        let reopened = DirectoryStore::new(&root);
        assert!(reopened.exists(&key).unwrap());
        let loaded = reopened.get(&key).unwrap().unwrap();
        assert_eq!(loaded, container(2.0));
        reopened.remove(&key).unwrap();
        assert!(!reopened.exists(&key).unwrap());
        fs::remove_dir_all(&root).unwrap();
    }
}
