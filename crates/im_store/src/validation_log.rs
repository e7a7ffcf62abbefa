//! Append-only log of rejected inbound messages.
//!
//! One JSON object per line. Every record carries the SHA-256 of its own
//! content and the hash of the previous record, so truncation or editing
//! in the middle of a file is detectable with [`ValidationLog::verify`].
//! Files rotate at `max_bytes` (`intake.log` → `intake.log.1` …); the chain
//! restarts in each new file while the sequence number keeps counting.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

const MAX_ROTATIONS: usize = 5;
const CHAIN_START: &str = "CHAIN_START";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationRecord {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub sender: String,
    pub message_id: String,
    pub type_byte: Option<u8>,
    pub reason: String,
    pub detail: Option<String>,
    pub prev_hash: String,
    pub hash: String,
}

/// What the caller knows about a rejected message.
#[derive(Debug, Clone)]
pub struct Rejection<'a> {
    pub sender: &'a str,
    pub message_id: &'a str,
    pub type_byte: Option<u8>,
    pub reason: &'a str,
    pub detail: Option<String>,
}

pub struct ValidationLog {
    path: PathBuf,
    max_bytes: u64,
    inner: Mutex<ChainState>,
}

#[derive(Debug)]
struct ChainState {
    last_seq: u64,
    last_hash: String,
}

fn record_hash(value: &serde_json::Value) -> String {
    hex::encode(im_crypto::hash::sha256(value.to_string().as_bytes()))
}

impl ValidationLog {
    pub fn open<P: AsRef<Path>>(path: P, max_bytes: u64) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let (last_seq, last_hash) = match Self::read_file(&path)?.last() {
            Some(r) => (r.seq, r.hash.clone()),
            None => (0, CHAIN_START.to_string()),
        };
        Ok(Self {
            path,
            max_bytes,
            inner: Mutex::new(ChainState { last_seq, last_hash }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_file(path: &Path) -> Result<Vec<ValidationRecord>, StoreError> {
        if !path.exists() {
            return Ok(vec![]);
        }
        let reader = BufReader::new(File::open(path)?);
        let mut records = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str(&line)?);
        }
        Ok(records)
    }

    pub fn append(&self, rejection: Rejection<'_>) -> Result<ValidationRecord, StoreError> {
        let mut state = self.inner.lock();
        self.rotate_if_needed(&mut state)?;

        let seq = state.last_seq + 1;
        let mut value = serde_json::json!({
            "seq": seq,
            "timestamp": Utc::now(),
            "sender": rejection.sender,
            "message_id": rejection.message_id,
            "type_byte": rejection.type_byte,
            "reason": rejection.reason,
            "detail": rejection.detail,
            "prev_hash": state.last_hash,
        });
        let hash = record_hash(&value);
        value["hash"] = serde_json::Value::String(hash.clone());
        let record: ValidationRecord = serde_json::from_value(value)?;

        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(file, "{}", serde_json::to_string(&record)?)?;
        file.flush()?;

        state.last_seq = seq;
        state.last_hash = hash;
        Ok(record)
    }

    fn rotate_if_needed(&self, state: &mut ChainState) -> Result<(), StoreError> {
        match fs::metadata(&self.path) {
            Ok(meta) if meta.len() >= self.max_bytes => {}
            _ => return Ok(()),
        }
        for i in (1..=MAX_ROTATIONS).rev() {
            let rotated = self.path_with_suffix(i);
            if rotated.exists() {
                if i == MAX_ROTATIONS {
                    fs::remove_file(&rotated)?;
                } else {
                    fs::rename(&rotated, self.path_with_suffix(i + 1))?;
                }
            }
        }
        fs::rename(&self.path, self.path_with_suffix(1))?;
        state.last_hash = CHAIN_START.to_string();
        Ok(())
    }

    /// Most recent first.
    pub fn read_recent(&self, limit: Option<usize>) -> Result<Vec<ValidationRecord>, StoreError> {
        let mut records = Self::read_file(&self.path)?;
        records.reverse();
        if let Some(limit) = limit {
            records.truncate(limit);
        }
        Ok(records)
    }

    /// Recompute every hash in the current file and check the links.
    pub fn verify(&self) -> Result<u64, StoreError> {
        let mut prev = CHAIN_START.to_string();
        let mut count = 0;
        for record in Self::read_file(&self.path)? {
            let mut value = serde_json::to_value(&record)?;
            if let Some(obj) = value.as_object_mut() {
                obj.remove("hash");
            }
            if record.prev_hash != prev || record_hash(&value) != record.hash {
                return Err(StoreError::ChainBroken { seq: record.seq });
            }
            prev = record.hash;
            count += 1;
        }
        Ok(count)
    }

    fn path_with_suffix(&self, index: usize) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "validation.log".to_string());
        self.path.with_file_name(format!("{name}.{index}"))
    }
}
