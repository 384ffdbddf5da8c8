//! Transaction wrapper with typed record helpers
//!
//! Callers never touch redb tables directly: they get, put, insert and scan
//! [`Record`]s through a [`DatabaseTransaction`], which handles encoding and
//! attaches the operation name to every failure.

use redb::{Database, ReadTransaction, ReadableTable, WriteTransaction};
use tracing::debug;

use super::{Record, SEQUENCE_TABLE};
use crate::error::{NimbusError, NimbusResult};

enum TransactionInner {
    Read(ReadTransaction),
    Write(WriteTransaction),
}

pub struct DatabaseTransaction {
    txn: TransactionInner,
    operation: String,
}

impl DatabaseTransaction {
    pub fn begin_read(database: &Database, operation: impl Into<String>) -> NimbusResult<Self> {
        let operation = operation.into();
        let txn = database.begin_read()?;
        debug!("Started read transaction for: {}", operation);
        Ok(Self {
            txn: TransactionInner::Read(txn),
            operation,
        })
    }

    pub fn begin_write(database: &Database, operation: impl Into<String>) -> NimbusResult<Self> {
        let operation = operation.into();
        let txn = database.begin_write()?;
        debug!("Started write transaction for: {}", operation);
        Ok(Self {
            txn: TransactionInner::Write(txn),
            operation,
        })
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn is_write(&self) -> bool {
        matches!(self.txn, TransactionInner::Write(_))
    }

    fn write_txn(&self) -> NimbusResult<&WriteTransaction> {
        match &self.txn {
            TransactionInner::Write(txn) => Ok(txn),
            TransactionInner::Read(_) => Err(NimbusError::StorageTransactionError(format!(
                "{} attempted a write inside a read transaction",
                self.operation
            ))),
        }
    }

    /// Load a record by id.
    pub fn get<R: Record>(&self, id: u64) -> NimbusResult<Option<R>> {
        match &self.txn {
            TransactionInner::Read(txn) => load(&txn.open_table(R::TABLE)?, id),
            TransactionInner::Write(txn) => load(&txn.open_table(R::TABLE)?, id),
        }
    }

    /// Load a record by id, failing with `NotFound` when it is absent.
    pub fn require<R: Record>(&self, id: u64) -> NimbusResult<R> {
        self.get::<R>(id)?
            .ok_or_else(|| NimbusError::not_found(format!("{} {}", R::KIND, id)))
    }

    /// All records of a kind matching `filter`, in id order.
    pub fn scan<R, F>(&self, filter: F) -> NimbusResult<Vec<R>>
    where
        R: Record,
        F: Fn(&R) -> bool,
    {
        let records = match &self.txn {
            TransactionInner::Read(txn) => load_all(&txn.open_table(R::TABLE)?)?,
            TransactionInner::Write(txn) => load_all(&txn.open_table(R::TABLE)?)?,
        };
        Ok(records.into_iter().filter(|r| filter(r)).collect())
    }

    /// Insert or overwrite a record under its current id.
    pub fn put<R: Record>(&self, record: &R) -> NimbusResult<()> {
        let txn = self.write_txn()?;
        let data = bincode::serialize(record)?;
        let mut table = txn.open_table(R::TABLE)?;
        table.insert(record.id(), data.as_slice())?;
        Ok(())
    }

    /// Assign the next id for `R`, store the record and return the id.
    pub fn insert_new<R: Record>(&self, record: &mut R) -> NimbusResult<u64> {
        let id = self.next_id(R::KIND)?;
        record.set_id(id);
        self.put(record)?;
        Ok(id)
    }

    pub fn remove<R: Record>(&self, id: u64) -> NimbusResult<bool> {
        let txn = self.write_txn()?;
        let mut table = txn.open_table(R::TABLE)?;
        let removed = table.remove(id)?.is_some();
        Ok(removed)
    }

    fn next_id(&self, sequence: &str) -> NimbusResult<u64> {
        let txn = self.write_txn()?;
        let mut table = txn.open_table(SEQUENCE_TABLE)?;
        let current = table.get(sequence)?.map(|guard| guard.value()).unwrap_or(0);
        let next = current + 1;
        table.insert(sequence, next)?;
        Ok(next)
    }

    pub fn commit(self) -> NimbusResult<()> {
        match self.txn {
            TransactionInner::Write(txn) => {
                txn.commit()?;
                debug!("Committed transaction for: {}", self.operation);
                Ok(())
            }
            TransactionInner::Read(_) => Ok(()),
        }
    }
}

fn load<R, T>(table: &T, id: u64) -> NimbusResult<Option<R>>
where
    R: Record,
    T: ReadableTable<u64, &'static [u8]>,
{
    match table.get(id)? {
        Some(guard) => Ok(Some(bincode::deserialize(guard.value())?)),
        None => Ok(None),
    }
}

fn load_all<R, T>(table: &T) -> NimbusResult<Vec<R>>
where
    R: Record,
    T: ReadableTable<u64, &'static [u8]>,
{
    let mut records = Vec::new();
    for entry in table.iter()? {
        let (_, value) = entry?;
        records.push(bincode::deserialize(value.value())?);
    }
    Ok(records)
}
