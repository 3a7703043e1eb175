// src/io/registry.rs
//
// Name -> constructor registry for adapter backends. Backends are added by
// explicit `register` calls; `register_builtin` adds the ones this crate
// ships. The process-wide instance exists only after `init()`.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use once_cell::sync::OnceCell;

use crate::io::adapter::LinkAdapter;
use crate::io::combi::CombiDriver;
use crate::io::error::IoError;
use crate::io::slcan::SlcanDriver;
use crate::io::stn::StnDriver;
use crate::io::traits::Adapter;
use crate::settings::{AdapterConfig, AdapterFile};

/// Builds an unopened adapter from its configuration.
pub type Constructor = Arc<dyn Fn(AdapterConfig) -> Result<Arc<dyn Adapter>, IoError> + Send + Sync>;

struct Entry {
    /// Canonical name; differs from the key for aliases
    kind: String,
    constructor: Constructor,
}

#[derive(Default)]
pub struct AdapterRegistry {
    entries: RwLock<BTreeMap<String, Entry>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a backend under `kind`. Names are case-insensitive and may only be
    /// registered once.
    pub fn register<F>(&self, kind: &str, constructor: F) -> Result<(), IoError>
    where
        F: Fn(AdapterConfig) -> Result<Arc<dyn Adapter>, IoError> + Send + Sync + 'static,
    {
        let key = kind.to_ascii_lowercase();
        self.insert(key.clone(), key, Arc::new(constructor))
    }

    /// Make `alias` build the same adapter as the already registered `kind`.
    pub fn alias(&self, alias: &str, kind: &str) -> Result<(), IoError> {
        let target = {
            let entries = self.read()?;
            let entry = entries
                .get(&kind.to_ascii_lowercase())
                .ok_or_else(|| IoError::UnknownAdapter(kind.to_string()))?;
            (entry.kind.clone(), entry.constructor.clone())
        };
        self.insert(alias.to_ascii_lowercase(), target.0, target.1)
    }

    fn insert(&self, key: String, kind: String, constructor: Constructor) -> Result<(), IoError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| IoError::configuration("adapter registry poisoned"))?;
        if entries.contains_key(&key) {
            return Err(IoError::configuration(format!(
                "adapter '{}' is already registered",
                key
            )));
        }
        entries.insert(key, Entry { kind, constructor });
        Ok(())
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, BTreeMap<String, Entry>>, IoError> {
        self.entries
            .read()
            .map_err(|_| IoError::configuration("adapter registry poisoned"))
    }

    /// Canonical kind for a name or alias.
    pub fn lookup(&self, name: &str) -> Option<String> {
        let entries = self.read().ok()?;
        entries
            .get(&name.to_ascii_lowercase())
            .map(|entry| entry.kind.clone())
    }

    /// Every registered name, aliases included, sorted.
    pub fn list(&self) -> Vec<String> {
        self.read()
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Build an unopened adapter.
    pub fn create(&self, name: &str, config: AdapterConfig) -> Result<Arc<dyn Adapter>, IoError> {
        let constructor = {
            let entries = self.read()?;
            entries
                .get(&name.to_ascii_lowercase())
                .map(|entry| entry.constructor.clone())
                .ok_or_else(|| IoError::UnknownAdapter(name.to_string()))?
        };
        constructor(config)
    }

    /// Build the adapter an `AdapterFile` names.
    pub fn create_from_file(&self, file: AdapterFile) -> Result<Arc<dyn Adapter>, IoError> {
        self.create(&file.adapter, file.config)
    }

    /// Register the backends that ship with this crate: `combi`, `slcan`
    /// (alias `canusb`) and `obdlink` (alias `stn`).
    pub fn register_builtin(&self) -> Result<(), IoError> {
        self.register("combi", |config| {
            Ok(Arc::new(LinkAdapter::new(CombiDriver, config)?) as Arc<dyn Adapter>)
        })?;
        self.register("slcan", |config| {
            Ok(Arc::new(LinkAdapter::new(SlcanDriver, config)?) as Arc<dyn Adapter>)
        })?;
        self.alias("canusb", "slcan")?;
        self.register("obdlink", |config| {
            Ok(Arc::new(LinkAdapter::new(StnDriver, config)?) as Arc<dyn Adapter>)
        })?;
        self.alias("stn", "obdlink")?;
        Ok(())
    }
}

// ============================================================================
// Process-wide registry
// ============================================================================

static GLOBAL: OnceCell<AdapterRegistry> = OnceCell::new();

/// Create the process-wide registry with the built-in backends. Later calls
/// return the same instance.
pub fn init() -> Result<&'static AdapterRegistry, IoError> {
    GLOBAL.get_or_try_init(|| {
        let registry = AdapterRegistry::new();
        registry.register_builtin()?;
        tlog!("[registry] Adapters: {}", registry.list().join(", "));
        Ok(registry)
    })
}

/// The process-wide registry; fails until `init()` ran.
pub fn global() -> Result<&'static AdapterRegistry, IoError> {
    GLOBAL
        .get()
        .ok_or_else(|| IoError::configuration("adapter registry used before registry::init()"))
}
