//! Copyright (c) 2023 University of New Hampshire
//! SPDX-License-Identifier: MIT
//!
//! Transactional in-memory row store.
//!
//! Rows are kept per table as JSON documents stamped with a revision taken
//! from one store-wide counter. There is a single writer at a time
//! ([`EasyTransaction`]), readers work off cheap copy-on-write
//! [`Snapshot`]s, and committed mutations are broadcast as [`Event`]s once
//! the store has been marked as being at parity with its upstream source.

mod store;

pub use store::{EasyTransaction, Event, EventAction, Readable, Row, Snapshot, Store};

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no row in {table} with id {id}")]
    NotFound { table: &'static str, id: String },

    #[error("a row in {table} with id {id} already exists")]
    AlreadyExists { table: &'static str, id: String },

    #[error("row id changed from {had} to {now} during update")]
    IdChanged { had: String, now: String },

    #[error("row could not be (de)serialized: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store snapshot io failed: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Implemented by every model kept in a [`Store`].
///
/// Only `table_name`, `id` and the revision accessors need implementing,
/// the row conversions have serde based defaults.
pub trait DBTable: Sized + Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// The name of the table this should be in
    fn table_name() -> &'static str;

    /// Primary key within the table
    fn id(&self) -> String;

    fn revision(&self) -> u64;

    /// Called by the store when the row is written, never by models themselves
    fn set_revision(&mut self, revision: u64);

    fn to_rowlike(&self) -> Result<serde_json::Value, StoreError> {
        Ok(serde_json::to_value(self)?)
    }

    fn from_row(row: &Row) -> Result<ExistingRow<Self>, StoreError> {
        let mut v: Self = serde_json::from_value(row.data.clone())?;
        v.set_revision(row.revision);

        Ok(ExistingRow::from_existing(v))
    }

    /// Get a T: DBTable given an id
    fn get(view: &impl Readable, id: &str) -> Result<ExistingRow<Self>, StoreError> {
        match view.row(Self::table_name(), id) {
            Some(row) => Self::from_row(row),
            None => Err(StoreError::NotFound {
                table: Self::table_name(),
                id: id.to_owned(),
            }),
        }
    }

    /// Like [`DBTable::get`], but absence is not an error
    fn try_get(view: &impl Readable, id: &str) -> Result<Option<ExistingRow<Self>>, StoreError> {
        match Self::get(view, id) {
            Ok(v) => Ok(Some(v)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Every row of the table in id order
    fn all(view: &impl Readable) -> Result<Vec<ExistingRow<Self>>, StoreError> {
        view.rows(Self::table_name())
            .map(Self::from_row)
            .collect()
    }
}

#[derive(Clone, Debug)]
pub struct ExistingRow<T: DBTable> {
    data: T,
    had_id: String,
}

impl<T: DBTable> std::ops::Deref for ExistingRow<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl<T: DBTable> std::ops::DerefMut for ExistingRow<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.data
    }
}

impl<T: DBTable> ExistingRow<T> {
    pub fn update(&self, transaction: &mut EasyTransaction<'_>) -> Result<u64, StoreError> {
        let now = self.data.id();
        if now != self.had_id {
            return Err(StoreError::IdChanged {
                had: self.had_id.clone(),
                now,
            });
        }

        transaction.update(&self.data)
    }

    pub fn delete(self, transaction: &mut EasyTransaction<'_>) -> Result<(), StoreError> {
        transaction.delete::<T>(&self.had_id)
    }

    pub fn get(view: &impl Readable, id: &str) -> Result<Self, StoreError> {
        T::get(view, id)
    }

    /// Only for values that were read out of a store
    pub fn from_existing(v: T) -> Self {
        let had_id = v.id();
        Self { data: v, had_id }
    }

    /// Unwraps an ExistingRow into its inner value
    pub fn into_inner(self) -> T {
        self.data
    }
}

pub struct NewRow<T>(T);

impl<T: DBTable> NewRow<T> {
    /// Inserts the row, returning the revision it was stamped with
    pub fn insert(&self, transaction: &mut EasyTransaction<'_>) -> Result<u64, StoreError> {
        transaction.insert(&self.0)
    }

    pub fn new(v: T) -> Self {
        Self(v)
    }
}

#[cfg(test)]
pub(crate) mod test_table {
    use super::DBTable;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
    pub struct Widget {
        pub id: String,
        pub name: String,
        #[serde(default)]
        pub revision: u64,
    }

    impl Widget {
        pub fn named(id: &str, name: &str) -> Self {
            Self {
                id: id.to_owned(),
                name: name.to_owned(),
                revision: 0,
            }
        }
    }

    impl DBTable for Widget {
        fn table_name() -> &'static str {
            "widgets"
        }

        fn id(&self) -> String {
            self.id.clone()
        }

        fn revision(&self) -> u64 {
            self.revision
        }

        fn set_revision(&mut self, revision: u64) {
            self.revision = revision;
        }
    }
}
