//! Storage layer using RocksDB
//!
//! # Column Families
//!
//! - `accounts` - Account state (key: account_id)
//! - `entries` - Append-only ledger history (key: entry_id)
//! - `indices` - Secondary indices for per-account scans
//! - `operations` - Commit receipts (key: operation_id)
//! - `commission` - Commission balances (key: beneficiary)
//! - `commission_log` - Commission credits (key: operation_id)
//!
//! Every mutation is a single `WriteBatch`, so a balance never changes
//! without its history record and idempotency marker.

use crate::{
    error::{Error, Result},
    registry::{AccountRegistry, BalanceWrite, CommissionWrite},
    types::{Account, AccountId, CommissionRecord, CommitReceipt, LedgerEntry},
    Config,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, DB};
use rust_decimal::Decimal;
use std::sync::Arc;
use uuid::Uuid;

/// Column family names
const CF_ACCOUNTS: &str = "accounts";
const CF_ENTRIES: &str = "entries";
const CF_INDICES: &str = "indices";
const CF_OPERATIONS: &str = "operations";
const CF_COMMISSION: &str = "commission";
const CF_COMMISSION_LOG: &str = "commission_log";

/// Index key tags
const IDX_ACCOUNT_ENTRY: u8 = b'e';
const IDX_BENEFICIARY_CREDIT: u8 = b'c';

/// Storage wrapper for RocksDB
pub struct Storage {
    db: Arc<DB>,
    // Read-check-write sequences (CAS) are serialized here
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage").field("path", &self.db.path()).finish()
    }
}

impl Storage {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;

        // Create directory if not exists
        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);

        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_ACCOUNTS, Self::cf_options_hot()),
            ColumnFamilyDescriptor::new(CF_ENTRIES, Self::cf_options_cold()),
            ColumnFamilyDescriptor::new(CF_INDICES, Self::cf_options_indices()),
            ColumnFamilyDescriptor::new(CF_OPERATIONS, Self::cf_options_indices()),
            ColumnFamilyDescriptor::new(CF_COMMISSION, Self::cf_options_hot()),
            ColumnFamilyDescriptor::new(CF_COMMISSION_LOG, Self::cf_options_cold()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        tracing::info!(path = ?path, "Opened RocksDB loyalty store");

        Ok(Self {
            db: Arc::new(db),
            write_lock: Mutex::new(()),
        })
    }

    // Column family options

    fn cf_options_hot() -> Options {
        let mut opts = Options::default();
        // Balances are read on every commit, use LZ4 for speed
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }

    fn cf_options_cold() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
        opts.set_bottommost_compression_type(rocksdb::DBCompressionType::Zstd);
        opts
    }

    fn cf_options_indices() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false); // 10 bits per key
        opts.set_block_based_table_factory(&block_opts);
        opts
    }

    // Helper: get column family handle

    fn cf_handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    // Index keys: tag || owner || 0x00 || uuid

    fn index_prefix(tag: u8, owner: &AccountId) -> Vec<u8> {
        let mut key = Vec::with_capacity(owner.as_str().len() + 2 + 16);
        key.push(tag);
        key.extend_from_slice(owner.as_str().as_bytes());
        key.push(0);
        key
    }

    fn index_key(tag: u8, owner: &AccountId, id: Uuid) -> Vec<u8> {
        let mut key = Self::index_prefix(tag, owner);
        key.extend_from_slice(id.as_bytes());
        key
    }

    /// Scan an index prefix and return the trailing UUIDs in key order
    fn scan_index(&self, prefix: &[u8]) -> Result<Vec<Uuid>> {
        let cf = self.cf_handle(CF_INDICES)?;
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward));

        let mut ids = Vec::new();
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            let tail = &key[prefix.len()..];
            let bytes: [u8; 16] = tail
                .try_into()
                .map_err(|_| Error::Storage("Malformed index key".to_string()))?;
            ids.push(Uuid::from_bytes(bytes));
        }
        Ok(ids)
    }

    fn get_entry(&self, entry_id: Uuid) -> Result<LedgerEntry> {
        let cf = self.cf_handle(CF_ENTRIES)?;
        let value = self
            .db
            .get_cf(cf, entry_id.as_bytes())?
            .ok_or_else(|| Error::Storage(format!("Indexed entry {} missing", entry_id)))?;
        Ok(bincode::deserialize(&value)?)
    }
}

impl AccountRegistry for Storage {
    fn open_account(&self, account: &Account) -> Result<()> {
        let _guard = self.write_lock.lock();
        let cf = self.cf_handle(CF_ACCOUNTS)?;
        let key = account.id.as_str().as_bytes();

        if self.db.get_cf(cf, key)?.is_some() {
            return Err(Error::InvalidInput(format!(
                "Account {} already exists",
                account.id
            )));
        }

        self.db.put_cf(cf, key, bincode::serialize(account)?)?;

        tracing::info!(account_id = %account.id, "Account opened");
        Ok(())
    }

    fn get_account(&self, id: &AccountId) -> Result<Option<Account>> {
        let cf = self.cf_handle(CF_ACCOUNTS)?;
        match self.db.get_cf(cf, id.as_str().as_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    fn applied_receipt(&self, operation_id: Uuid) -> Result<Option<CommitReceipt>> {
        let cf = self.cf_handle(CF_OPERATIONS)?;
        match self.db.get_cf(cf, operation_id.as_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    fn commit(&self, write: &BalanceWrite) -> Result<()> {
        let _guard = self.write_lock.lock();

        let current = self
            .get_account(&write.account.id)?
            .ok_or_else(|| Error::AccountNotFound(write.account.id.to_string()))?;
        if current.version != write.expected_version {
            return Err(Error::VersionConflict {
                account: write.account.id.to_string(),
                expected: write.expected_version,
                found: current.version,
            });
        }
        if self.applied_receipt(write.receipt.operation_id)?.is_some() {
            return Err(Error::InvalidInput(format!(
                "Operation {} already applied",
                write.receipt.operation_id
            )));
        }

        let mut batch = WriteBatch::default();

        // 1. Account state
        let cf_accounts = self.cf_handle(CF_ACCOUNTS)?;
        batch.put_cf(
            cf_accounts,
            write.account.id.as_str().as_bytes(),
            bincode::serialize(&write.account)?,
        );

        // 2. Entry
        let cf_entries = self.cf_handle(CF_ENTRIES)?;
        batch.put_cf(
            cf_entries,
            write.entry.entry_id.as_bytes(),
            bincode::serialize(&write.entry)?,
        );

        // 3. Index: account || entry_id -> empty
        let cf_indices = self.cf_handle(CF_INDICES)?;
        let idx = Self::index_key(IDX_ACCOUNT_ENTRY, &write.account.id, write.entry.entry_id);
        batch.put_cf(cf_indices, &idx, b"");

        // 4. Receipt
        let cf_ops = self.cf_handle(CF_OPERATIONS)?;
        batch.put_cf(
            cf_ops,
            write.receipt.operation_id.as_bytes(),
            bincode::serialize(&write.receipt)?,
        );

        // Atomic commit
        self.db.write(batch)?;

        tracing::debug!(
            account_id = %write.account.id,
            entry_id = %write.entry.entry_id,
            version = write.account.version,
            "Balance committed"
        );

        Ok(())
    }

    fn entries_since(&self, id: &AccountId, since: DateTime<Utc>) -> Result<Vec<LedgerEntry>> {
        let prefix = Self::index_prefix(IDX_ACCOUNT_ENTRY, id);
        let mut entries = Vec::new();
        for entry_id in self.scan_index(&prefix)? {
            let entry = self.get_entry(entry_id)?;
            if entry.timestamp >= since {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    fn commission_applied(&self, operation_id: Uuid) -> Result<Option<CommissionRecord>> {
        let cf = self.cf_handle(CF_COMMISSION_LOG)?;
        match self.db.get_cf(cf, operation_id.as_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    fn credit_commission(&self, write: &CommissionWrite) -> Result<()> {
        let _guard = self.write_lock.lock();
        let record = &write.record;
        let beneficiary = &record.item.beneficiary;

        let current = self.commission_balance(beneficiary)?;
        if current != write.previous_balance {
            return Err(Error::TransientPersistence(format!(
                "Commission balance of {} moved during write",
                beneficiary
            )));
        }
        if self.commission_applied(record.operation_id)?.is_some() {
            return Err(Error::InvalidInput(format!(
                "Operation {} already applied",
                record.operation_id
            )));
        }

        let mut batch = WriteBatch::default();

        let cf_balance = self.cf_handle(CF_COMMISSION)?;
        batch.put_cf(
            cf_balance,
            beneficiary.as_str().as_bytes(),
            bincode::serialize(&record.balance_after)?,
        );

        let cf_log = self.cf_handle(CF_COMMISSION_LOG)?;
        batch.put_cf(
            cf_log,
            record.operation_id.as_bytes(),
            bincode::serialize(record)?,
        );

        let cf_indices = self.cf_handle(CF_INDICES)?;
        let idx = Self::index_key(IDX_BENEFICIARY_CREDIT, beneficiary, record.operation_id);
        batch.put_cf(cf_indices, &idx, b"");

        self.db.write(batch)?;

        tracing::debug!(
            beneficiary = %beneficiary,
            amount = %record.item.amount,
            balance = %record.balance_after,
            "Commission credited"
        );

        Ok(())
    }

    fn commission_balance(&self, id: &AccountId) -> Result<Decimal> {
        let cf = self.cf_handle(CF_COMMISSION)?;
        match self.db.get_cf(cf, id.as_str().as_bytes())? {
            Some(value) => Ok(bincode::deserialize(&value)?),
            None => Ok(Decimal::ZERO),
        }
    }

    fn commission_records(&self, id: &AccountId) -> Result<Vec<CommissionRecord>> {
        let prefix = Self::index_prefix(IDX_BENEFICIARY_CREDIT, id);
        let cf = self.cf_handle(CF_COMMISSION_LOG)?;
        let mut records = Vec::new();
        for operation_id in self.scan_index(&prefix)? {
            let value = self.db.get_cf(cf, operation_id.as_bytes())?.ok_or_else(|| {
                Error::Storage(format!("Indexed commission {} missing", operation_id))
            })?;
            records.push(bincode::deserialize(&value)?);
        }
        records.sort_by_key(|r: &CommissionRecord| r.timestamp);
        Ok(records)
    }
}
