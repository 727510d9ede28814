use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use super::entry::{HttpMethod, ServiceEntry};

// ---------------------------------------------------------------------------
// RouteTable
// ---------------------------------------------------------------------------

/// Errors rejecting a route-table update. The live table is left unchanged.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("duplicate service entry id: {id}")]
    DuplicateId { id: String },
    #[error("duplicate route {method} {route} (entries `{first}` and `{second}`)")]
    DuplicateRoute {
        method: HttpMethod,
        route: String,
        first: String,
        second: String,
    },
}

/// Immutable snapshot of all registered entries.
#[derive(Debug, Default)]
pub struct RouteTable {
    version: u64,
    by_id: HashMap<String, Arc<ServiceEntry>>,
    /// External entries, most specific route first.
    external: Vec<Arc<ServiceEntry>>,
}

impl RouteTable {
    fn build(entries: Vec<Arc<ServiceEntry>>, version: u64) -> Result<Self, RegistryError> {
        let mut by_id = HashMap::with_capacity(entries.len());
        let mut routes: HashMap<(HttpMethod, String), String> = HashMap::new();

        for entry in &entries {
            if by_id.insert(entry.id.clone(), entry.clone()).is_some() {
                return Err(RegistryError::DuplicateId { id: entry.id.clone() });
            }
            let key = (entry.method, entry.route.shape());
            if let Some(first) = routes.insert(key, entry.id.clone()) {
                return Err(RegistryError::DuplicateRoute {
                    method: entry.method,
                    route: entry.route.to_string(),
                    first,
                    second: entry.id.clone(),
                });
            }
        }

        let mut external: Vec<Arc<ServiceEntry>> = entries.into_iter().filter(|e| e.is_external()).collect();
        external.sort_by(|a, b| {
            b.route
                .specificity()
                .cmp(&a.route.specificity())
                .then_with(|| a.id.cmp(&b.id))
        });

        Ok(Self {
            version,
            by_id,
            external,
        })
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Arc<ServiceEntry>> {
        self.by_id.get(id)
    }

    /// Resolves an external request against this snapshot.
    #[must_use]
    pub fn resolve(&self, path: &str, method: HttpMethod) -> Option<ResolvedEntry> {
        self.external
            .iter()
            .filter(|e| e.method == method)
            .find_map(|e| {
                e.route.matches(path).map(|path_params| ResolvedEntry {
                    entry: e.clone(),
                    path_params,
                })
            })
    }

    pub fn entries(&self) -> impl Iterator<Item = &Arc<ServiceEntry>> {
        self.by_id.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

/// An entry matched by route, with its raw path captures.
#[derive(Debug, Clone)]
pub struct ResolvedEntry {
    pub entry: Arc<ServiceEntry>,
    pub path_params: Vec<(String, String)>,
}

// ---------------------------------------------------------------------------
// ServiceEntryRegistry
// ---------------------------------------------------------------------------

/// Holds the live route table.
///
/// Readers load the current snapshot without locking; every lookup sees one
/// complete table. Writers build a new table off to the side and swap it in
/// atomically, serialized by a mutex so concurrent updates never lose one
/// another.
pub struct ServiceEntryRegistry {
    table: ArcSwap<RouteTable>,
    write_lock: Mutex<()>,
}

impl ServiceEntryRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            table: ArcSwap::from_pointee(RouteTable::default()),
            write_lock: Mutex::new(()),
        }
    }

    /// Replaces the whole table, returning the new version.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] on duplicate ids or routes; the previous
    /// table stays live.
    pub fn replace_all(&self, entries: Vec<ServiceEntry>) -> Result<u64, RegistryError> {
        let entries = entries.into_iter().map(Arc::new).collect();
        let _guard = self.write_lock.lock();
        let version = self.table.load().version + 1;
        let table = RouteTable::build(entries, version)?;
        self.table.store(Arc::new(table));
        tracing::info!(version, "route table replaced");
        Ok(version)
    }

    /// Adds or replaces the entry with the same id.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateRoute`] if the entry's route clashes
    /// with a different entry.
    pub fn upsert(&self, entry: ServiceEntry) -> Result<u64, RegistryError> {
        let _guard = self.write_lock.lock();
        let current = self.table.load_full();
        let mut entries: Vec<Arc<ServiceEntry>> = current
            .entries()
            .filter(|e| e.id != entry.id)
            .cloned()
            .collect();
        entries.push(Arc::new(entry));
        let version = current.version + 1;
        self.table.store(Arc::new(RouteTable::build(entries, version)?));
        Ok(version)
    }

    /// Removes the entry with `id`. Returns `false` if it was not registered.
    pub fn remove(&self, id: &str) -> bool {
        let _guard = self.write_lock.lock();
        let current = self.table.load_full();
        if current.get(id).is_none() {
            return false;
        }
        let entries = current.entries().filter(|e| e.id != id).cloned().collect();
        match RouteTable::build(entries, current.version + 1) {
            Ok(table) => {
                self.table.store(Arc::new(table));
                true
            }
            // Removing from a valid table cannot introduce duplicates.
            Err(_) => false,
        }
    }

    /// Current snapshot. Hold it to perform several consistent lookups.
    #[must_use]
    pub fn snapshot(&self) -> Arc<RouteTable> {
        self.table.load_full()
    }

    /// Resolves an external request. Entries with `prohibit_extranet` never match.
    #[must_use]
    pub fn resolve(&self, path: &str, method: HttpMethod) -> Option<ResolvedEntry> {
        self.table.load().resolve(path, method)
    }

    /// Looks up any entry, internal or external, by id.
    #[must_use]
    pub fn resolve_by_id(&self, id: &str) -> Option<Arc<ServiceEntry>> {
        self.table.load().get(id).cloned()
    }

    /// Entries reachable through the gateway, most specific first.
    #[must_use]
    pub fn external_routes(&self) -> Vec<Arc<ServiceEntry>> {
        self.table.load().external.clone()
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.table.load().version
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.table.load().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.load().is_empty()
    }
}

impl Default for ServiceEntryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    use meridian_core::Value;

    use super::*;
    use crate::service::handler::handler_fn;

    fn entry(id: &str, method: HttpMethod, route: &str) -> ServiceEntry {
        ServiceEntry::builder(id, method, route)
            .handler(handler_fn(|_| async { Ok(Value::Null) }))
            .build()
            .unwrap()
    }

    fn internal(id: &str, route: &str) -> ServiceEntry {
        ServiceEntry::builder(id, HttpMethod::Post, route)
            .prohibit_extranet()
            .handler(handler_fn(|_| async { Ok(Value::Null) }))
            .build()
            .unwrap()
    }

    #[test]
    fn resolves_by_path_and_method() {
        let registry = ServiceEntryRegistry::new();
        registry
            .replace_all(vec![
                entry("order.get", HttpMethod::Get, "/api/order/{id}"),
                entry("order.delete", HttpMethod::Delete, "/api/order/{id}"),
            ])
            .unwrap();

        let resolved = registry.resolve("/api/order/3", HttpMethod::Delete).unwrap();
        assert_eq!(resolved.entry.id, "order.delete");
        assert_eq!(resolved.path_params, vec![("id".to_string(), "3".to_string())]);
        assert!(registry.resolve("/api/order/3", HttpMethod::Post).is_none());
    }

    #[test]
    fn literal_routes_win_over_parameters() {
        let registry = ServiceEntryRegistry::new();
        registry
            .replace_all(vec![
                entry("order.get", HttpMethod::Get, "/api/order/{id}"),
                entry("order.latest", HttpMethod::Get, "/api/order/latest"),
            ])
            .unwrap();
        let resolved = registry.resolve("/api/order/latest", HttpMethod::Get).unwrap();
        assert_eq!(resolved.entry.id, "order.latest");
    }

    #[test]
    fn prohibit_extranet_hides_entry_from_gateway() {
        let registry = ServiceEntryRegistry::new();
        registry
            .replace_all(vec![internal("stock.confirm", "/internal/stock/confirm")])
            .unwrap();
        assert!(registry.resolve("/internal/stock/confirm", HttpMethod::Post).is_none());
        assert!(registry.resolve_by_id("stock.confirm").is_some());
        assert!(registry.external_routes().is_empty());
    }

    #[test]
    fn invalid_replacement_keeps_previous_table() {
        let registry = ServiceEntryRegistry::new();
        let v1 = registry
            .replace_all(vec![entry("a", HttpMethod::Get, "/a")])
            .unwrap();

        let err = registry
            .replace_all(vec![
                entry("b", HttpMethod::Get, "/b/{x}"),
                entry("c", HttpMethod::Get, "/B/{y}"),
            ])
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateRoute { .. }));

        let err = registry
            .replace_all(vec![entry("a", HttpMethod::Get, "/a"), entry("a", HttpMethod::Put, "/a")])
            .unwrap_err();
        assert_eq!(err, RegistryError::DuplicateId { id: "a".into() });

        assert_eq!(registry.version(), v1);
        assert!(registry.resolve_by_id("a").is_some());
    }

    #[test]
    fn upsert_and_remove() {
        let registry = ServiceEntryRegistry::new();
        registry.upsert(entry("a", HttpMethod::Get, "/a")).unwrap();
        registry.upsert(entry("a", HttpMethod::Get, "/a2")).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.resolve("/a2", HttpMethod::Get).is_some());
        assert!(registry.remove("a"));
        assert!(!registry.remove("a"));
        assert!(registry.is_empty());
    }

    #[test]
    fn readers_never_observe_a_mixed_table() {
        // Two generations of the same ids; a snapshot must hold one generation only.
        let generation = |g: u64| -> Vec<ServiceEntry> {
            (0..8)
                .map(|i| {
                    ServiceEntry::builder(format!("e{i}"), HttpMethod::Get, format!("/e{i}"))
                        .timeout_ms(g)
                        .handler(handler_fn(|_| async { Ok(Value::Null) }))
                        .build()
                        .unwrap()
                })
                .collect()
        };

        let registry = Arc::new(ServiceEntryRegistry::new());
        registry.replace_all(generation(1)).unwrap();
        let stop = Arc::new(AtomicBool::new(false));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let registry = registry.clone();
                let stop = stop.clone();
                thread::spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        let table = registry.snapshot();
                        let gens: Vec<Option<u64>> = table.entries().map(|e| e.governance.timeout_ms).collect();
                        assert_eq!(gens.len(), 8);
                        assert!(gens.windows(2).all(|w| w[0] == w[1]));
                    }
                })
            })
            .collect();

        for i in 0..200u64 {
            registry.replace_all(generation(i % 2 + 1)).unwrap();
        }
        stop.store(true, Ordering::Relaxed);
        for reader in readers {
            reader.join().unwrap();
        }
    }
}
