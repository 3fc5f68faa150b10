use super::table::{Depth, Table};
use super::{Entity, EntityDescriptor};
use crate::core::{OnceMap, Result};
use lazy_static::lazy_static;
use std::any::TypeId;
use std::sync::Arc;

lazy_static! {
    static ref TABLES: OnceMap<TypeId, Arc<Table>> = OnceMap::new();
    static ref TARGETS: OnceMap<TypeId, Arc<Table>> = OnceMap::new();
}

/// Metadata of `T`, built on first use and cached for the life of the
/// process. Concurrent first uses build once.
pub fn load<T: Entity>() -> Result<Arc<Table>> {
    if let Some(table) = TABLES.get(&TypeId::of::<T>()) {
        return Ok(table);
    }
    load_descriptor(T::descriptor)
}

pub fn load_descriptor(descriptor: fn() -> EntityDescriptor) -> Result<Arc<Table>> {
    let descriptor = descriptor();
    TABLES.get_or_try_insert(&descriptor.type_id, || {
        let table = Table::build(&descriptor, Depth::Full)?;
        tracing::debug!(
            entity = descriptor.name,
            table = descriptor.table,
            columns = table.columns().len(),
            "entity metadata loaded"
        );
        Ok(Arc::new(table))
    })
}

/// Stored-column view of a relation target.
pub(crate) fn load_target(descriptor: fn() -> EntityDescriptor) -> Result<Arc<Table>> {
    let descriptor = descriptor();
    TARGETS.get_or_try_insert(&descriptor.type_id, || {
        Ok(Arc::new(Table::build(&descriptor, Depth::Shallow)?))
    })
}

pub(crate) fn cached() -> usize {
    TABLES.len()
}
