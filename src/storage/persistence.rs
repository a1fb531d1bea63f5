//! Persistence of peer addresses and synced headers
//!
//! The network layer reports changes through `NetworkStore`; `FileStore`
//! keeps them as flat records on disk and `MemoryStore` keeps them in
//! memory for tests and throwaway nodes.

use crate::chain::header::parse_reversed_hex;
use crate::chain::{BlockHash, BlockHeader, HeaderRecord};
use crate::network::addrbook::AddressBookEntry;
use crate::wire::{NetworkAddress, ServiceFlags};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::net::{Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Mutex;
use thiserror::Error;

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Invalid record on line {line}: {reason}")]
    InvalidRecord { line: usize, reason: String },
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

/// Save/load interface the network layer persists through
pub trait NetworkStore: Send + Sync {
    /// Full snapshot of the address book
    fn addresses_changed(&self, entries: &[AddressBookEntry]) -> Result<(), StorageError>;

    /// Headers newly appended to the chain, in chain order
    fn headers_changed(&self, records: &[HeaderRecord]) -> Result<(), StorageError>;

    /// Replace all stored headers
    fn reset_headers(&self, records: &[HeaderRecord]) -> Result<(), StorageError>;

    fn load_addresses(&self) -> Result<Vec<AddressBookEntry>, StorageError>;

    fn load_headers(&self) -> Result<Vec<HeaderRecord>, StorageError>;
}

/// Storage configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub addresses_file: String,
    pub headers_file: String,
}

impl StorageConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".chainpeer"),
            addresses_file: "addresses.json".to_string(),
            headers_file: "headers.csv".to_string(),
        }
    }
}

// =============================================================================
// Flat records
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AddressRecord {
    last_seen: i64,
    ip: Ipv6Addr,
    port: u16,
    services: u64,
    source: Option<SocketAddr>,
    source_services: u64,
}

impl From<&AddressBookEntry> for AddressRecord {
    fn from(entry: &AddressBookEntry) -> Self {
        Self {
            last_seen: entry.last_seen,
            ip: entry.address.ip,
            port: entry.address.port,
            services: entry.address.services.bits(),
            source: entry.source,
            source_services: entry.source_services.bits(),
        }
    }
}

impl From<AddressRecord> for AddressBookEntry {
    fn from(record: AddressRecord) -> Self {
        Self {
            last_seen: record.last_seen,
            address: NetworkAddress {
                services: ServiceFlags::from_bits_retain(record.services),
                ip: record.ip,
                port: record.port,
            },
            source: record.source,
            source_services: ServiceFlags::from_bits_retain(record.source_services),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct AddressSnapshot {
    saved_at: DateTime<Utc>,
    entries: Vec<AddressRecord>,
}

/// `height,version,prev,merkle,timestamp,bits,nonce,hash`
fn header_to_csv(record: &HeaderRecord) -> String {
    let h = &record.header;
    format!(
        "{},{},{},{},{},{},{},{}",
        record.height,
        h.version,
        h.prev_block,
        h.merkle_root_hex(),
        h.timestamp,
        h.bits,
        h.nonce,
        record.hash
    )
}

fn header_from_csv(line: &str, line_no: usize) -> Result<HeaderRecord, StorageError> {
    let invalid = |reason: String| StorageError::InvalidRecord {
        line: line_no,
        reason,
    };

    let fields: Vec<&str> = line.trim().split(',').collect();
    if fields.len() != 8 {
        return Err(invalid(format!("expected 8 fields, found {}", fields.len())));
    }

    let number = |i: usize| -> Result<u64, StorageError> {
        fields[i]
            .parse::<u64>()
            .map_err(|e| invalid(format!("field {}: {}", i, e)))
    };

    let height = number(0)? as u32;
    let version: i32 = fields[1]
        .parse()
        .map_err(|e| invalid(format!("version: {}", e)))?;
    let prev_block = BlockHash::from_hex(fields[2]).map_err(|e| invalid(e.to_string()))?;
    let merkle_root = parse_reversed_hex(fields[3]).map_err(|e| invalid(e.to_string()))?;
    let header = BlockHeader {
        version,
        prev_block,
        merkle_root,
        timestamp: number(4)? as u32,
        bits: number(5)? as u32,
        nonce: number(6)? as u32,
    };
    let hash = BlockHash::from_hex(fields[7]).map_err(|e| invalid(e.to_string()))?;
    if header.hash() != hash {
        return Err(invalid(format!("hash mismatch at height {}", height)));
    }

    Ok(HeaderRecord {
        height,
        hash,
        header,
    })
}

// =============================================================================
// File Store
// =============================================================================

/// Flat-file persistence under a data directory
pub struct FileStore {
    config: StorageConfig,
    write_lock: Mutex<()>,
}

impl FileStore {
    /// Create the data directory if needed
    pub fn new(config: StorageConfig) -> Result<Self, StorageError> {
        fs::create_dir_all(&config.data_dir)?;
        Ok(Self {
            config,
            write_lock: Mutex::new(()),
        })
    }

    pub fn open(data_dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        Self::new(StorageConfig::new(data_dir))
    }

    fn addresses_path(&self) -> PathBuf {
        self.config.data_dir.join(&self.config.addresses_file)
    }

    fn headers_path(&self) -> PathBuf {
        self.config.data_dir.join(&self.config.headers_file)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        // A panicked writer leaves nothing half-shared behind the lock
        self.write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_headers(&self, records: &[HeaderRecord], append: bool) -> Result<(), StorageError> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(self.headers_path())?;
        let mut writer = BufWriter::new(file);
        for record in records {
            writeln!(writer, "{}", header_to_csv(record))?;
        }
        writer.flush()?;
        Ok(())
    }
}

impl NetworkStore for FileStore {
    fn addresses_changed(&self, entries: &[AddressBookEntry]) -> Result<(), StorageError> {
        let _guard = self.lock();
        let snapshot = AddressSnapshot {
            saved_at: Utc::now(),
            entries: entries.iter().map(AddressRecord::from).collect(),
        };

        // Write to temporary file first
        let temp_path = self.config.data_dir.join("addresses.tmp");
        let file = fs::File::create(&temp_path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &snapshot)?;
        writer.flush()?;

        // Atomic rename
        fs::rename(&temp_path, self.addresses_path())?;
        Ok(())
    }

    fn headers_changed(&self, records: &[HeaderRecord]) -> Result<(), StorageError> {
        if records.is_empty() {
            return Ok(());
        }
        let _guard = self.lock();
        self.write_headers(records, true)
    }

    fn reset_headers(&self, records: &[HeaderRecord]) -> Result<(), StorageError> {
        let _guard = self.lock();
        self.write_headers(records, false)
    }

    fn load_addresses(&self) -> Result<Vec<AddressBookEntry>, StorageError> {
        let path = self.addresses_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(fs::File::open(&path)?);
        let snapshot: AddressSnapshot = serde_json::from_reader(reader)?;
        Ok(snapshot.entries.into_iter().map(AddressBookEntry::from).collect())
    }

    fn load_headers(&self) -> Result<Vec<HeaderRecord>, StorageError> {
        let path = self.headers_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(fs::File::open(&path)?);
        let mut records = Vec::new();
        for (i, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(header_from_csv(&line, i + 1)?);
        }
        Ok(records)
    }
}

// =============================================================================
// Memory Store
// =============================================================================

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryStore {
    addresses: Mutex<Vec<AddressBookEntry>>,
    headers: Mutex<Vec<HeaderRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_contents(addresses: Vec<AddressBookEntry>, headers: Vec<HeaderRecord>) -> Self {
        Self {
            addresses: Mutex::new(addresses),
            headers: Mutex::new(headers),
        }
    }

    pub fn address_count(&self) -> usize {
        self.addresses.lock().map(|a| a.len()).unwrap_or(0)
    }

    pub fn header_count(&self) -> usize {
        self.headers.lock().map(|h| h.len()).unwrap_or(0)
    }
}

fn poisoned<T>(_: T) -> StorageError {
    StorageError::InvalidData("store lock poisoned".to_string())
}

impl NetworkStore for MemoryStore {
    fn addresses_changed(&self, entries: &[AddressBookEntry]) -> Result<(), StorageError> {
        *self.addresses.lock().map_err(poisoned)? = entries.to_vec();
        Ok(())
    }

    fn headers_changed(&self, records: &[HeaderRecord]) -> Result<(), StorageError> {
        self.headers.lock().map_err(poisoned)?.extend_from_slice(records);
        Ok(())
    }

    fn reset_headers(&self, records: &[HeaderRecord]) -> Result<(), StorageError> {
        *self.headers.lock().map_err(poisoned)? = records.to_vec();
        Ok(())
    }

    fn load_addresses(&self) -> Result<Vec<AddressBookEntry>, StorageError> {
        Ok(self.addresses.lock().map_err(poisoned)?.clone())
    }

    fn load_headers(&self) -> Result<Vec<HeaderRecord>, StorageError> {
        Ok(self.headers.lock().map_err(poisoned)?.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::header::tests::{genesis_header, BLOCK_1_HEADER};
    use crate::wire::Decodable;

    fn block_one_record() -> HeaderRecord {
        HeaderRecord::new(1, BlockHeader::from_bytes(&BLOCK_1_HEADER).unwrap())
    }

    fn sample_entry() -> AddressBookEntry {
        AddressBookEntry {
            last_seen: 1_700_000_000,
            address: NetworkAddress::parse("203.0.113.5:8333", 0)
                .unwrap()
                .with_services(ServiceFlags::NETWORK | ServiceFlags::BITCOIN_CASH),
            source: Some("198.51.100.2:8333".parse().unwrap()),
            source_services: ServiceFlags::NETWORK,
        }
    }

    #[test]
    fn test_missing_files_load_empty() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(temp_dir.path()).unwrap();
        assert!(store.load_addresses().unwrap().is_empty());
        assert!(store.load_headers().unwrap().is_empty());
    }

    #[test]
    fn test_addresses_snapshot_round_trip() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(temp_dir.path()).unwrap();

        let entry = sample_entry();
        store.addresses_changed(&[entry]).unwrap();
        let loaded = store.load_addresses().unwrap();
        assert_eq!(loaded, vec![entry]);
        assert_eq!(loaded[0].address.services, entry.address.services);

        // Second snapshot replaces the first
        store.addresses_changed(&[]).unwrap();
        assert!(store.load_addresses().unwrap().is_empty());
        assert!(!temp_dir.path().join("addresses.tmp").exists());
    }

    #[test]
    fn test_headers_append_and_load() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(temp_dir.path()).unwrap();

        let first = block_one_record();
        let second = HeaderRecord::new(
            2,
            BlockHeader {
                prev_block: first.hash,
                nonce: 7,
                ..first.header
            },
        );
        store.headers_changed(&[first]).unwrap();
        store.headers_changed(&[second]).unwrap();

        assert_eq!(store.load_headers().unwrap(), vec![first, second]);

        let contents = fs::read_to_string(temp_dir.path().join("headers.csv")).unwrap();
        let line = contents.lines().next().unwrap();
        assert!(line.starts_with(&format!("1,1,{},", genesis_header().hash())));
        assert!(line.ends_with(",00000000839a8e6886ab5951d76f411475428afc90947ee320161bbf18eb6048"));
    }

    #[test]
    fn test_reset_headers_truncates() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(temp_dir.path()).unwrap();
        let record = block_one_record();

        store.headers_changed(&[record, record]).unwrap();
        store.reset_headers(&[record]).unwrap();
        assert_eq!(store.load_headers().unwrap(), vec![record]);
    }

    #[test]
    fn test_corrupt_header_line_rejected() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(temp_dir.path()).unwrap();
        store.headers_changed(&[block_one_record()]).unwrap();

        let path = temp_dir.path().join("headers.csv");
        let mut contents = fs::read_to_string(&path).unwrap();
        contents = contents.replacen("1,1,", "1,2,", 1);
        fs::write(&path, contents).unwrap();

        let err = store.load_headers().unwrap_err();
        assert!(matches!(err, StorageError::InvalidRecord { line: 1, .. }));
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::new();
        store.headers_changed(&[block_one_record()]).unwrap();
        store.addresses_changed(&[sample_entry()]).unwrap();
        assert_eq!(store.header_count(), 1);
        assert_eq!(store.address_count(), 1);
        store.reset_headers(&[]).unwrap();
        assert_eq!(store.header_count(), 0);
    }
}
