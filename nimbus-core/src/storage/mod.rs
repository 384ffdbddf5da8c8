//! Persistent state for wallets, ledger, catalog, orders, tasks and instances
//!
//! Everything lives in a single redb database. Records are bincode-encoded and
//! keyed by a `u64` id drawn from the `sequences` table. redb admits a single
//! write transaction at a time, so every mutation that goes through
//! [`Store::write`] is serialized with every other one.

pub mod database_transaction;

use std::path::Path;
use std::sync::Arc;

use redb::{Database, TableDefinition};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::info;

use crate::error::{NimbusError, NimbusResult};
use crate::types::{Instance, InstanceSnapshot, LedgerEntry, Order, Product, Task, Wallet};

pub use database_transaction::DatabaseTransaction;

pub const WALLET_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("wallets");
pub const LEDGER_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("ledger_entries");
pub const PRODUCT_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("products");
pub const ORDER_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("orders");
pub const TASK_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("tasks");
pub const INSTANCE_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("instances");
pub const SNAPSHOT_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("snapshots");
pub const SEQUENCE_TABLE: TableDefinition<&str, u64> = TableDefinition::new("sequences");

/// A bincode-encoded row in one of the id-keyed tables
pub trait Record: Serialize + DeserializeOwned {
    const TABLE: TableDefinition<'static, u64, &'static [u8]>;
    /// Sequence name, also used in log and error messages.
    const KIND: &'static str;

    fn id(&self) -> u64;
    fn set_id(&mut self, id: u64);
}

macro_rules! impl_record {
    ($ty:ty, $table:expr, $kind:literal, $field:ident) => {
        impl Record for $ty {
            const TABLE: TableDefinition<'static, u64, &'static [u8]> = $table;
            const KIND: &'static str = $kind;

            fn id(&self) -> u64 {
                self.$field
            }

            fn set_id(&mut self, id: u64) {
                self.$field = id;
            }
        }
    };
}

impl_record!(Wallet, WALLET_TABLE, "wallet", user_id);
impl_record!(LedgerEntry, LEDGER_TABLE, "ledger_entry", id);
impl_record!(Product, PRODUCT_TABLE, "product", id);
impl_record!(Order, ORDER_TABLE, "order", id);
impl_record!(Task, TASK_TABLE, "task", id);
impl_record!(Instance, INSTANCE_TABLE, "instance", id);
impl_record!(InstanceSnapshot, SNAPSHOT_TABLE, "snapshot", id);

/// Create every table so read transactions never hit a missing table.
pub fn init_database_tables(database: &Database) -> NimbusResult<()> {
    let txn = database.begin_write()?;
    {
        txn.open_table(WALLET_TABLE)?;
        txn.open_table(LEDGER_TABLE)?;
        txn.open_table(PRODUCT_TABLE)?;
        txn.open_table(ORDER_TABLE)?;
        txn.open_table(TASK_TABLE)?;
        txn.open_table(INSTANCE_TABLE)?;
        txn.open_table(SNAPSHOT_TABLE)?;
        txn.open_table(SEQUENCE_TABLE)?;
    }
    txn.commit()?;
    Ok(())
}

/// Shared handle to the database with closure-scoped transactions
#[derive(Clone)]
pub struct Store {
    database: Arc<Database>,
}

impl Store {
    /// Open (or create) `nimbus.redb` under `data_dir`.
    pub fn open(data_dir: impl AsRef<Path>) -> NimbusResult<Self> {
        let data_dir = data_dir.as_ref();
        std::fs::create_dir_all(data_dir).map_err(|e| NimbusError::storage("create data dir", e))?;

        let path = data_dir.join("nimbus.redb");
        let database = Database::create(&path).map_err(|e| NimbusError::DatabaseError {
            operation: format!("open {}", path.display()),
            source: Box::new(e),
        })?;
        init_database_tables(&database)?;

        info!("Opened store at {}", path.display());
        Ok(Self {
            database: Arc::new(database),
        })
    }

    pub fn from_database(database: Arc<Database>) -> NimbusResult<Self> {
        init_database_tables(&database)?;
        Ok(Self { database })
    }

    /// Run `f` in a read transaction.
    pub async fn read<F, R>(&self, operation: &str, f: F) -> NimbusResult<R>
    where
        F: FnOnce(&DatabaseTransaction) -> NimbusResult<R>,
    {
        let txn = DatabaseTransaction::begin_read(&self.database, operation)?;
        f(&txn)
    }

    /// Run `f` in a write transaction, committing only when it returns `Ok`.
    /// On error the transaction is dropped and nothing it wrote is visible.
    pub async fn write<F, R>(&self, operation: &str, f: F) -> NimbusResult<R>
    where
        F: FnOnce(&DatabaseTransaction) -> NimbusResult<R>,
    {
        let txn = DatabaseTransaction::begin_write(&self.database, operation)?;
        let result = f(&txn)?;
        txn.commit()?;
        Ok(result)
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}
