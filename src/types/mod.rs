// ============================================================================
// Value Type Registry
// ============================================================================
//
// Binds a semantic value kind to the application type that carries it, the
// database type names that produce it, and the codec/scanner pair used to
// move it across the driver and endpoint boundaries.
//
// The registry is process-wide and write-once per key: a second registration
// for the same kind, application type or database type name fails.
//
// ============================================================================

pub mod builtin;
pub mod scanner;

use crate::core::{DacError, Result, Value, ValueKind};
use lazy_static::lazy_static;
use std::any::TypeId;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

pub use scanner::{KindScanner, Scanner};

pub type Encoder = fn(&Value) -> Result<Vec<u8>>;
pub type Decoder = fn(&[u8]) -> Result<Value>;
pub type ScannerFactory = fn() -> Box<dyn Scanner>;

#[derive(Clone)]
pub struct ValueType {
    kind: ValueKind,
    type_id: TypeId,
    type_name: &'static str,
    database_types: Vec<String>,
    encoder: Encoder,
    decoder: Decoder,
    scanner: ScannerFactory,
}

impl ValueType {
    pub fn new<T: 'static>(
        kind: ValueKind,
        database_types: &[&str],
        encoder: Encoder,
        decoder: Decoder,
        scanner: ScannerFactory,
    ) -> Self {
        Self {
            kind,
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            database_types: database_types
                .iter()
                .map(|name| name.to_ascii_lowercase())
                .collect(),
            encoder,
            decoder,
            scanner,
        }
    }

    pub fn kind(&self) -> ValueKind {
        self.kind
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn database_types(&self) -> &[String] {
        &self.database_types
    }

    pub fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        (self.encoder)(value)
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<Value> {
        (self.decoder)(bytes)
    }

    pub fn scanner(&self) -> Box<dyn Scanner> {
        (self.scanner)()
    }

    /// Case-insensitive substring match against the declared database types.
    pub fn matches_database_type(&self, name: &str) -> bool {
        let name = name.to_ascii_lowercase();
        self.database_types
            .iter()
            .any(|declared| name.contains(declared.as_str()))
    }
}

impl std::fmt::Debug for ValueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValueType")
            .field("kind", &self.kind)
            .field("type_name", &self.type_name)
            .field("database_types", &self.database_types)
            .finish()
    }
}

#[derive(Default, Clone)]
pub struct Registry {
    types: Vec<Arc<ValueType>>,
    by_kind: HashMap<ValueKind, usize>,
    by_type: HashMap<TypeId, usize>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for vt in builtin::value_types() {
            // Built-ins are disjoint by construction.
            let _ = registry.register(vt);
        }
        registry
    }

    pub fn register(&mut self, vt: ValueType) -> Result<()> {
        if self.by_kind.contains_key(&vt.kind) {
            return Err(DacError::ConfigInvalid(format!(
                "value type kind '{}' is already registered",
                vt.kind
            )));
        }
        if self.by_type.contains_key(&vt.type_id) {
            return Err(DacError::ConfigInvalid(format!(
                "value type '{}' is already registered",
                vt.type_name
            )));
        }
        if vt.database_types.is_empty() {
            return Err(DacError::ConfigInvalid(format!(
                "value type '{}' declares no database types",
                vt.type_name
            )));
        }
        for name in &vt.database_types {
            if self.types.iter().any(|existing| {
                existing
                    .database_types
                    .iter()
                    .any(|declared| declared == name)
            }) {
                return Err(DacError::ConfigInvalid(format!(
                    "database type '{}' is already registered",
                    name
                )));
            }
        }

        let idx = self.types.len();
        self.by_kind.insert(vt.kind, idx);
        self.by_type.insert(vt.type_id, idx);
        self.types.push(Arc::new(vt));
        Ok(())
    }

    pub fn lookup_by_type(&self, type_id: TypeId) -> Option<Arc<ValueType>> {
        self.by_type.get(&type_id).map(|idx| self.types[*idx].clone())
    }

    pub fn lookup_by_kind(&self, kind: ValueKind) -> Option<Arc<ValueType>> {
        self.by_kind.get(&kind).map(|idx| self.types[*idx].clone())
    }

    /// Finds the value type for a driver-reported column type. The longest
    /// matching declared name wins so `datetime` beats `date` and `bytea`
    /// beats `byte`.
    pub fn lookup_by_database_type(&self, name: &str) -> Option<Arc<ValueType>> {
        let lowered = name.to_ascii_lowercase();
        self.types
            .iter()
            .filter_map(|vt| {
                vt.database_types
                    .iter()
                    .filter(|declared| lowered.contains(declared.as_str()))
                    .map(|declared| declared.len())
                    .max()
                    .map(|len| (len, vt))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, vt)| vt.clone())
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

lazy_static! {
    static ref REGISTRY: RwLock<Registry> = RwLock::new(Registry::with_builtins());
}

/// Registers an additional value type process-wide. Must run before any query.
pub fn register(vt: ValueType) -> Result<()> {
    REGISTRY.write()?.register(vt)
}

pub fn lookup_by_type<T: 'static>() -> Option<Arc<ValueType>> {
    REGISTRY.read().ok()?.lookup_by_type(TypeId::of::<T>())
}

pub fn lookup_by_kind(kind: ValueKind) -> Option<Arc<ValueType>> {
    REGISTRY.read().ok()?.lookup_by_kind(kind)
}

pub fn lookup_by_database_type(name: &str) -> Option<Arc<ValueType>> {
    REGISTRY.read().ok()?.lookup_by_database_type(name)
}

lazy_static! {
    // Narrower integer and float types carried by the same kinds as their
    // registered 64-bit counterparts.
    static ref ALIASES: HashMap<TypeId, ValueKind> = {
        let mut aliases = HashMap::new();
        for id in [
            TypeId::of::<i8>(),
            TypeId::of::<i16>(),
            TypeId::of::<i32>(),
            TypeId::of::<u16>(),
            TypeId::of::<u32>(),
            TypeId::of::<u64>(),
        ] {
            aliases.insert(id, ValueKind::Int);
        }
        aliases.insert(TypeId::of::<f32>(), ValueKind::Float);
        aliases
    };
}

/// Kind of an application type: its registered value type, or the kind of
/// the 64-bit type it widens to.
pub fn kind_of(type_id: TypeId) -> Option<ValueKind> {
    REGISTRY
        .read()
        .ok()?
        .lookup_by_type(type_id)
        .map(|vt| vt.kind())
        .or_else(|| ALIASES.get(&type_id).copied())
}

/// Copies the process-wide registry, for tests that register extra types.
pub fn snapshot() -> Registry {
    REGISTRY
        .read()
        .map(|registry| registry.clone())
        .unwrap_or_default()
}

pub fn restore(registry: Registry) {
    if let Ok(mut current) = REGISTRY.write() {
        *current = registry;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, NaiveDate, Utc};

    #[test]
    fn test_builtins_cover_every_kind() {
        let registry = Registry::with_builtins();
        for kind in ValueKind::ALL {
            assert!(registry.lookup_by_kind(kind).is_some(), "missing {kind}");
        }
    }

    #[test]
    fn test_lookup_by_database_type_prefers_longest_match() {
        let registry = Registry::with_builtins();
        assert_eq!(
            registry.lookup_by_database_type("DATETIME").unwrap().kind(),
            ValueKind::Datetime
        );
        assert_eq!(
            registry.lookup_by_database_type("date").unwrap().kind(),
            ValueKind::Date
        );
        assert_eq!(
            registry.lookup_by_database_type("BYTEA").unwrap().kind(),
            ValueKind::Bytes
        );
        assert_eq!(
            registry.lookup_by_database_type("VARCHAR(64)").unwrap().kind(),
            ValueKind::String
        );
        assert_eq!(
            registry.lookup_by_database_type("timestamptz").unwrap().kind(),
            ValueKind::Datetime
        );
        assert!(registry.lookup_by_database_type("geometry").is_none());
    }

    #[test]
    fn test_lookup_by_type() {
        let registry = Registry::with_builtins();
        assert_eq!(
            registry
                .lookup_by_type(TypeId::of::<DateTime<Utc>>())
                .unwrap()
                .kind(),
            ValueKind::Datetime
        );
        assert_eq!(
            registry
                .lookup_by_type(TypeId::of::<NaiveDate>())
                .unwrap()
                .kind(),
            ValueKind::Date
        );
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = Registry::with_builtins();
        let duplicate_kind = ValueType::new::<u128>(
            ValueKind::Int,
            &["hugeint"],
            builtin::encode_json,
            builtin::decode_int,
            || Box::new(KindScanner::new(ValueKind::Int)),
        );
        assert!(registry.register(duplicate_kind).is_err());

        let mut empty = Registry::new();
        let first = ValueType::new::<u128>(
            ValueKind::Int,
            &["hugeint"],
            builtin::encode_json,
            builtin::decode_int,
            || Box::new(KindScanner::new(ValueKind::Int)),
        );
        empty.register(first).unwrap();
        let same_db_name = ValueType::new::<i128>(
            ValueKind::Float,
            &["HUGEINT"],
            builtin::encode_json,
            builtin::decode_float,
            || Box::new(KindScanner::new(ValueKind::Float)),
        );
        assert!(empty.register(same_db_name).is_err());
    }

    #[test]
    fn test_kind_of_widens_integers() {
        assert_eq!(kind_of(TypeId::of::<i32>()), Some(ValueKind::Int));
        assert_eq!(kind_of(TypeId::of::<String>()), Some(ValueKind::String));
        assert_eq!(kind_of(TypeId::of::<Vec<String>>()), None);
    }

    #[test]
    fn test_snapshot_restore() {
        let saved = snapshot();
        assert_eq!(saved.len(), ValueKind::ALL.len());
        restore(saved.clone());
        assert!(lookup_by_kind(ValueKind::String).is_some());
        assert_eq!(snapshot().len(), saved.len());
    }
}
