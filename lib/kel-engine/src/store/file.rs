//! File-based KEL storage
//!
//! One JSON document per prefix (`<dir>/<prefix>.kel.json`) holding its log, escrows
//! and receipts. Reads are served from memory; each commit rewrites the document of
//! the prefix it touched through a temporary file and a rename before the in-memory
//! tables change. A rename is atomic for one file only, so a batch may touch a single
//! prefix.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::KelError;
use crate::escrow::EscrowClass;
use crate::store::memory::{PrefixRecord, PrefixTables, Staged};
use crate::store::{Batch, EventVisitor, KelStore, MemoryStore, ReceiptVisitor};
use crate::types::{Couplet, EventKey, ReceiptMessage, SignedKeyEvent};

const EXTENSION: &str = ".kel.json";

/// File-based store for the replay tool and single-node deployments
pub struct FileStore {
    dir: PathBuf,
    inner: MemoryStore,
}

impl FileStore {
    /// Opens (creating if needed) `dir` and loads every prefix document in it.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, KelError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| KelError::StorageError(e.to_string()))?;

        let mut tables = BTreeMap::new();
        for entry in std::fs::read_dir(&dir).map_err(|e| KelError::StorageError(e.to_string()))? {
            let path = entry
                .map_err(|e| KelError::StorageError(e.to_string()))?
                .path();
            let Some(prefix) = path
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(|name| name.strip_suffix(EXTENSION))
            else {
                continue;
            };
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| KelError::StorageError(e.to_string()))?;
            let record: PrefixRecord = serde_json::from_str(&contents)?;
            tables.insert(prefix.to_string(), PrefixTables::try_from(record)?);
        }
        debug!(dir = %dir.display(), prefixes = tables.len(), "Opened file store");

        Ok(Self {
            dir,
            inner: MemoryStore::from_tables(tables),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Prefixes are qb64, so the URL-safe base64 alphabet is all a file name needs.
    fn kel_path(&self, prefix: &str) -> Result<PathBuf, KelError> {
        let safe = !prefix.is_empty()
            && prefix
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        if !safe {
            return Err(KelError::InvalidPrefix(format!(
                "{} cannot name a file",
                prefix
            )));
        }
        Ok(self.dir.join(format!("{}{}", prefix, EXTENSION)))
    }

    fn write_staged(&self, staged: &Staged) -> Result<(), KelError> {
        for (prefix, tables) in staged {
            let path = self.kel_path(prefix)?;
            let tmp = path.with_extension("json.tmp");
            let contents = serde_json::to_string_pretty(&PrefixRecord::from(tables))?;

            let mut file =
                std::fs::File::create(&tmp).map_err(|e| KelError::StorageError(e.to_string()))?;
            file.write_all(contents.as_bytes())
                .map_err(|e| KelError::StorageError(e.to_string()))?;
            file.sync_all()
                .map_err(|e| KelError::StorageError(e.to_string()))?;
            std::fs::rename(&tmp, &path).map_err(|e| KelError::StorageError(e.to_string()))?;
        }
        Ok(())
    }
}

impl KelStore for FileStore {
    fn commit(&self, batch: Batch) -> Result<(), KelError> {
        let prefixes = batch.prefixes();
        if prefixes.len() > 1 {
            return Err(KelError::StorageError(format!(
                "batch touches {} prefixes; file commits are atomic per prefix",
                prefixes.len()
            )));
        }
        for prefix in &prefixes {
            self.kel_path(prefix)?;
        }
        self.inner.commit_with(batch, |staged| self.write_staged(staged))
    }

    fn event_at(&self, prefix: &str, sn: u64) -> Result<Option<SignedKeyEvent>, KelError> {
        self.inner.event_at(prefix, sn)
    }

    fn log_size(&self, prefix: &str) -> Result<usize, KelError> {
        self.inner.log_size(prefix)
    }

    fn stream_events(&self, prefix: &str, visit: &mut EventVisitor<'_>) -> Result<(), KelError> {
        self.inner.stream_events(prefix, visit)
    }

    fn escrowed(
        &self,
        class: EscrowClass,
        prefix: &str,
    ) -> Result<Vec<SignedKeyEvent>, KelError> {
        self.inner.escrowed(class, prefix)
    }

    fn escrowed_event(
        &self,
        class: EscrowClass,
        key: &EventKey,
    ) -> Result<Option<SignedKeyEvent>, KelError> {
        self.inner.escrowed_event(class, key)
    }

    fn stream_transferable_receipts(
        &self,
        prefix: &str,
        sn: u64,
        visit: &mut ReceiptVisitor<'_>,
    ) -> Result<(), KelError> {
        self.inner.stream_transferable_receipts(prefix, sn, visit)
    }

    fn non_transferable_receipts(&self, event: &EventKey) -> Result<Vec<Couplet>, KelError> {
        self.inner.non_transferable_receipts(event)
    }

    fn escrowed_receipts(&self) -> Result<Vec<ReceiptMessage>, KelError> {
        self.inner.escrowed_receipts()
    }

    fn prefixes(&self) -> Result<Vec<String>, KelError> {
        self.inner.prefixes()
    }
}
