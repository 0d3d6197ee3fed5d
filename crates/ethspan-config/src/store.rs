//! On-disk config store
//!
//! One YAML file per tunnel under the store root (`/etc/ethspan/tunnels` in
//! production). Definitions encode operational network topology, so files
//! are written owner-read/write only.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::definition::{validate_name, TunnelDefinition};
use crate::error::ConfigError;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

/// Durable mapping from tunnel name to definition
pub struct ConfigStore {
    root: PathBuf,
}

impl ConfigStore {
    /// Open a store rooted at the given directory (created on first write)
    pub fn open(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Open the system-wide store
    pub fn open_default() -> Self {
        Self::open(crate::DEFAULT_TUNNELS_DIR)
    }

    /// Directory this store reads and writes
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, name: &str) -> Result<PathBuf, ConfigError> {
        validate_name(name)?;
        Ok(self.root.join(format!("{name}.yaml")))
    }

    /// Names of all stored definitions, sorted
    pub fn list_names(&self) -> Result<Vec<String>, ConfigError> {
        let mut names = Vec::new();
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if validate_name(stem).is_ok() {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Load every stored definition, ordered by name
    pub fn list(&self) -> Result<Vec<TunnelDefinition>, ConfigError> {
        self.list_names()?
            .iter()
            .map(|name| self.get(name))
            .collect()
    }

    /// Load one definition by name
    pub fn get(&self, name: &str) -> Result<TunnelDefinition, ConfigError> {
        let path = self.path_for(name)?;
        let contents = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ConfigError::NotFound(name.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let mut def: TunnelDefinition =
            serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.clone(),
                source,
            })?;
        // The filename is authoritative for the name.
        def.name = name.to_string();
        Ok(def)
    }

    /// Persist a definition, creating the store directory if needed
    pub fn put(&self, def: &TunnelDefinition) -> Result<(), ConfigError> {
        def.validate()?;
        let path = self.path_for(&def.name)?;
        fs::create_dir_all(&self.root)?;
        let yaml = serde_yaml::to_string(def)?;
        fs::write(&path, yaml)?;
        #[cfg(unix)]
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;
        debug!(tunnel = %def.name, path = %path.display(), "definition saved");
        Ok(())
    }

    /// Remove a stored definition; true if it existed
    pub fn delete(&self, name: &str) -> Result<bool, ConfigError> {
        let path = self.path_for(name)?;
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(tunnel = %name, "definition deleted");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether a definition with this name is stored
    pub fn exists(&self, name: &str) -> bool {
        self.path_for(name).map(|p| p.exists()).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store() -> (tempfile::TempDir, ConfigStore) {
        let dir = tempdir().unwrap();
        let store = ConfigStore::open(dir.path().join("tunnels"));
        (dir, store)
    }

    #[test]
    fn test_put_get_roundtrip() {
        let (_dir, store) = store();
        let mut def = TunnelDefinition::new("site-a", 0).unwrap();
        def.local_ip = Some("192.0.2.1".parse().unwrap());
        def.remote_ip = Some("198.51.100.1".parse().unwrap());
        def.forwarded_ports.insert(443);

        store.put(&def).unwrap();
        let loaded = store.get("site-a").unwrap();
        assert_eq!(loaded, def);
    }

    #[test]
    fn test_get_missing_is_not_found() {
        let (_dir, store) = store();
        assert!(matches!(
            store.get("nope"),
            Err(ConfigError::NotFound(name)) if name == "nope"
        ));
    }

    #[test]
    fn test_list_is_name_ordered() {
        let (_dir, store) = store();
        for name in ["zeta", "alpha", "mid"] {
            store.put(&TunnelDefinition::new(name, 0).unwrap()).unwrap();
        }
        let names: Vec<_> = store.list().unwrap().into_iter().map(|d| d.name).collect();
        assert_eq!(names, ["alpha", "mid", "zeta"]);
    }

    #[test]
    fn test_delete_is_idempotent() {
        let (_dir, store) = store();
        store.put(&TunnelDefinition::new("t1", 0).unwrap()).unwrap();
        assert!(store.delete("t1").unwrap());
        assert!(!store.delete("t1").unwrap());
        assert!(!store.exists("t1"));
    }

    #[test]
    fn test_rejects_path_escaping_names() {
        let (_dir, store) = store();
        assert!(matches!(
            store.get("../../etc/passwd"),
            Err(ConfigError::InvalidName(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_files_are_owner_only() {
        let (_dir, store) = store();
        store.put(&TunnelDefinition::new("t1", 0).unwrap()).unwrap();
        let path = store.root().join("t1.yaml");
        let mode = fs::metadata(path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
