//! Object registry (C13): assigns stable string object-path identifiers to
//! modems, SIMs, and bearers, and resolves deletions back to the owning
//! modem (spec.md §4.13).

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Error;
use crate::modem::Modem;

pub const MODEM_PREFIX: &str = "/org/cellbroker/Modem/";
pub const SIM_PREFIX: &str = "/org/cellbroker/SIM/";
pub const BEARER_PREFIX: &str = "/org/cellbroker/Bearer/";

#[derive(Debug, Clone)]
struct BearerEntry {
    modem_id: u64,
    bearer_id: u64,
}

/// The broker's object table: one instance per running daemon. Modems are
/// kept by id; SIM and bearer paths are derived from their owning modem at
/// lookup time except for the bearer-delete index, which is maintained
/// explicitly since a bearer's lifetime is shorter than its modem's.
pub struct Registry {
    modems: HashMap<u64, Arc<Modem>>,
    bearers: HashMap<String, BearerEntry>,
}

impl Registry {
    pub fn new() -> Self {
        Self { modems: HashMap::new(), bearers: HashMap::new() }
    }

    pub fn modem_path(modem_id: u64) -> String {
        format!("{MODEM_PREFIX}{modem_id}")
    }

    pub fn sim_path(modem_id: u64) -> String {
        format!("{SIM_PREFIX}{modem_id}")
    }

    pub fn bearer_path(modem_id: u64, bearer_id: u64) -> String {
        format!("{BEARER_PREFIX}{modem_id}/{bearer_id}")
    }

    pub fn register_modem(&mut self, modem: Arc<Modem>) -> String {
        let path = Self::modem_path(modem.id);
        self.modems.insert(modem.id, modem);
        path
    }

    pub fn unregister_modem(&mut self, modem_id: u64) {
        self.modems.remove(&modem_id);
        self.bearers.retain(|_, entry| entry.modem_id != modem_id);
    }

    pub fn modem(&self, modem_id: u64) -> Option<Arc<Modem>> {
        self.modems.get(&modem_id).cloned()
    }

    pub fn modems(&self) -> impl Iterator<Item = &Arc<Modem>> {
        self.modems.values()
    }

    pub fn register_bearer(&mut self, modem_id: u64, bearer_id: u64) -> String {
        let path = Self::bearer_path(modem_id, bearer_id);
        self.bearers.insert(path.clone(), BearerEntry { modem_id, bearer_id });
        path
    }

    /// Resolve a bearer path to its owning modem, requiring the well-known
    /// bearer prefix (spec.md §4.13).
    fn resolve_bearer(&self, path: &str) -> Result<&BearerEntry, Error> {
        if !path.starts_with(BEARER_PREFIX) {
            return Err(Error::invalid_argument(format!("{path} is not a bearer path")));
        }
        self.bearers.get(path).ok_or_else(|| Error::not_found(path))
    }

    /// Delete a bearer by its object path: locate it by exact string match,
    /// remove it from its owning modem's bearer list, release the registry's
    /// own entry. An unknown path yields `NotFound`; a non-bearer-prefixed
    /// path yields `InvalidArgument` (spec.md §4.13).
    pub async fn delete_bearer(&mut self, path: &str) -> Result<(), Error> {
        let entry = self.resolve_bearer(path)?.clone();
        let modem = self.modems.get(&entry.modem_id).cloned().ok_or_else(|| Error::not_found(path))?;
        let mut state = modem.state.write().await;
        state.bearers.retain(|b| b.id != entry.bearer_id);
        drop(state);
        self.bearers.remove(path);
        Ok(())
    }

    pub fn lookup_bearer(&self, path: &str) -> Result<(u64, u64), Error> {
        let entry = self.resolve_bearer(path)?;
        Ok((entry.modem_id, entry.bearer_id))
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bearer::{self, BearerConfig, IpFamily};
    use crate::config::{BackendKind, Config};

    fn make_modem() -> Arc<Modem> {
        Arc::new(Modem::new(Config::new(BackendKind::At, "/dev/ttyUSB2")))
    }

    #[test]
    fn unknown_path_is_not_found() {
        let registry = Registry::new();
        let err = registry.lookup_bearer(&Registry::bearer_path(1, 1)).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn non_bearer_prefix_is_invalid_argument() {
        let registry = Registry::new();
        let err = registry.lookup_bearer("/org/cellbroker/Modem/1").unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn delete_bearer_removes_it_from_owning_modem() {
        let modem = make_modem();
        let cfg = BearerConfig { apn: "internet".into(), user: None, password: None, ip_family: IpFamily::Any };
        let bearer_id = bearer::create(&modem, cfg).await.unwrap();

        let mut registry = Registry::new();
        registry.register_modem(modem.clone());
        let path = registry.register_bearer(modem.id, bearer_id);

        registry.delete_bearer(&path).await.unwrap();
        assert_eq!(modem.bearers_len().await, 0);
        assert!(registry.lookup_bearer(&path).is_err());
    }
}
