//! Shared state store capability.
//!
//! The [`StateStore`] trait is the `{read, write, delete}` interface the
//! protocol needs from a key-value store with per-key field mappings
//! (Redis hashes being the reference shape). Every method is a single
//! atomic operation on the backend. The only multi-field operation is
//! [`StateStore::write_if`], which status transitions use so that a
//! terminal status is never overwritten.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::StoreError;

/// Precondition of a [`StateStore::write_if`] call.
///
/// Matches when `key`/`field` currently holds one of `expected`. An absent
/// field never matches.
#[derive(Debug, Clone, Copy)]
pub struct FieldGuard<'a> {
    pub key: &'a str,
    pub field: &'a str,
    pub expected: &'a [&'a [u8]],
}

impl FieldGuard<'_> {
    /// Whether `current` satisfies the guard.
    pub fn matches(&self, current: Option<&[u8]>) -> bool {
        current.is_some_and(|value| self.expected.iter().any(|e| *e == value))
    }
}

/// One field assignment of a [`StateStore::write_if`] call.
#[derive(Debug, Clone, Copy)]
pub struct FieldWrite<'a> {
    pub key: &'a str,
    pub field: &'a str,
    pub value: &'a [u8],
}

/// Hash-like key/field/value store.
///
/// Field values are opaque byte strings. A key with no fields is
/// indistinguishable from a missing key: [`read_all`](StateStore::read_all)
/// returns an empty map for both.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; a single store is shared by the
/// dispatcher, every future handle and every worker task of a process.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Reads every field of `key`. Missing keys yield an empty map.
    async fn read_all(&self, key: &str) -> Result<HashMap<String, Vec<u8>>, StoreError>;

    /// Reads a single field, `None` if the key or field is absent.
    async fn read_field(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Writes a field unconditionally (create or overwrite).
    async fn write_field(&self, key: &str, field: &str, value: &[u8]) -> Result<(), StoreError>;

    /// Writes a field only if it does not exist yet.
    ///
    /// Returns `true` if the value was written, `false` if the field was
    /// already present (and left untouched).
    async fn write_field_if_absent(
        &self,
        key: &str,
        field: &str,
        value: &[u8],
    ) -> Result<bool, StoreError>;

    /// Applies `writes` in order if `guard` matches, as one atomic step.
    ///
    /// Returns `true` if the writes were applied. No other write to the
    /// guarded field can land between the check and the writes.
    async fn write_if(
        &self,
        guard: FieldGuard<'_>,
        writes: &[FieldWrite<'_>],
    ) -> Result<bool, StoreError>;

    /// Removes a single field. Returns `true` if it existed.
    async fn delete_field(&self, key: &str, field: &str) -> Result<bool, StoreError>;

    /// Removes a key and all of its fields. Returns `true` if it existed.
    async fn delete_key(&self, key: &str) -> Result<bool, StoreError>;
}
