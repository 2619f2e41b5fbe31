//! Change log: the donor's ordered, replayable mutation stream
//!
//! Every mutation of a collection is appended here before it is applied.
//! On-disk format: [MAGIC][SEQ][OP][WRITTEN_AT][LEN][PAYLOAD][CRC32]
//!
//! The payload is the JSON document (post-image for inserts and updates,
//! pre-image for deletes). Sequence numbers start at 1 so that 0 can mean
//! "nothing applied yet". On open the log is replayed and the collection
//! rebuilt from it.

use crate::common::keys::Document;
use crate::common::{crc32, timestamp_now_millis};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

const LOG_MAGIC: [u8; 4] = [0x52, 0x53, 0x4C, 0x31]; // "RSL1"
const OP_INSERT: u8 = 1;
const OP_UPDATE: u8 = 2;
const OP_DELETE: u8 = 3;

/// A mutation as produced by the donor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationOp {
    Insert(Document),
    Update(Document),
    /// Carries the deleted document so consumers can filter by key
    Delete(Document),
}

impl MutationOp {
    fn code(&self) -> u8 {
        match self {
            MutationOp::Insert(_) => OP_INSERT,
            MutationOp::Update(_) => OP_UPDATE,
            MutationOp::Delete(_) => OP_DELETE,
        }
    }

    pub fn document(&self) -> &Document {
        match self {
            MutationOp::Insert(d) | MutationOp::Update(d) | MutationOp::Delete(d) => d,
        }
    }
}

/// One entry of the change log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    pub seq: u64,
    /// Donor wall clock at append time, used only for lag estimates
    pub written_at: u64,
    pub op: MutationOp,
}

/// Ordered mutation log for one collection.
///
/// Entries stay in memory for streaming; the file (when present) is the
/// durable copy.
pub struct ChangeLog {
    path: Option<PathBuf>,
    writer: Option<BufWriter<File>>,
    entries: Vec<Mutation>,
    next_seq: u64,
    sync_on_append: bool,
}

impl ChangeLog {
    /// Log that lives only in memory
    pub fn in_memory() -> Self {
        Self {
            path: None,
            writer: None,
            entries: Vec::new(),
            next_seq: 1,
            sync_on_append: false,
        }
    }

    /// Open or create a log file, replaying what is already there
    pub fn open(path: impl AsRef<Path>, sync_on_append: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut entries = Vec::new();
        let valid_len = replay_from(&path, |m| {
            entries.push(m);
            Ok(())
        })?;
        let next_seq = entries.last().map(|m| m.seq + 1).unwrap_or(1);

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        if file.metadata()?.len() > valid_len {
            tracing::warn!(path = %path.display(), valid_len, "truncating torn change log tail");
            file.set_len(valid_len)?;
        }

        Ok(Self {
            path: Some(path),
            writer: Some(BufWriter::new(file)),
            entries,
            next_seq,
            sync_on_append,
        })
    }

    /// Append a mutation and return it with its sequence number
    pub fn append(&mut self, op: MutationOp) -> Result<Mutation> {
        let mutation = Mutation {
            seq: self.next_seq,
            written_at: timestamp_now_millis(),
            op,
        };

        if let Some(writer) = self.writer.as_mut() {
            write_entry(writer, &mutation)?;
            writer.flush()?;
            if self.sync_on_append {
                writer.get_ref().sync_data()?;
            }
        }

        self.next_seq += 1;
        self.entries.push(mutation.clone());
        Ok(mutation)
    }

    /// Sequence number of the last appended mutation, 0 if empty
    pub fn last_seq(&self) -> u64 {
        self.next_seq - 1
    }

    /// Up to `limit` mutations with `seq > after`, in order
    pub fn read_after(&self, after: u64, limit: usize) -> &[Mutation] {
        let start = self.entries.partition_point(|m| m.seq <= after);
        let end = (start + limit).min(self.entries.len());
        &self.entries[start..end]
    }

    pub fn entries(&self) -> &[Mutation] {
        &self.entries
    }

    /// Remove the backing file
    pub fn destroy(mut self) -> Result<()> {
        self.writer.take();
        if let Some(path) = self.path.take() {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Sync to disk
    pub fn sync(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        Ok(())
    }

    /// Replay log entries in order, stopping at the first torn or corrupted
    /// entry
    pub fn replay<F>(path: impl AsRef<Path>, callback: F) -> Result<()>
    where
        F: FnMut(Mutation) -> Result<()>,
    {
        replay_from(path.as_ref(), callback).map(|_| ())
    }
}

/// Replay and return the length of the valid prefix in bytes
fn replay_from<F>(path: &Path, mut callback: F) -> Result<u64>
where
    F: FnMut(Mutation) -> Result<()>,
{
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let mut reader = BufReader::new(file);
    let mut last_seq = 0;
    let mut valid_len = 0u64;

    loop {
        match read_entry(&mut reader) {
            Ok(Some((entry, size))) => {
                if entry.seq <= last_seq {
                    return Err(Error::ChangeLog(format!(
                        "sequence went backwards: {} after {}",
                        entry.seq, last_seq
                    )));
                }
                last_seq = entry.seq;
                valid_len += size as u64;
                callback(entry)?
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, last_seq, "change log replay stopped at corrupted entry");
                break;
            }
        }
    }

    Ok(valid_len)
}

fn write_entry<W: Write>(writer: &mut W, mutation: &Mutation) -> Result<()> {
    let payload = serde_json::to_vec(mutation.op.document())
        .map_err(|e| Error::ChangeLog(format!("encode: {}", e)))?;
    let op = mutation.op.code();

    let mut body = Vec::with_capacity(21 + payload.len());
    body.extend_from_slice(&mutation.seq.to_le_bytes());
    body.push(op);
    body.extend_from_slice(&mutation.written_at.to_le_bytes());
    body.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    body.extend_from_slice(&payload);

    writer.write_all(&LOG_MAGIC)?;
    writer.write_all(&body)?;
    writer.write_all(&crc32(&body).to_le_bytes())?;
    Ok(())
}

fn read_entry<R: Read>(reader: &mut R) -> Result<Option<(Mutation, usize)>> {
    let mut magic = [0u8; 4];
    match reader.read_exact(&mut magic) {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    if magic != LOG_MAGIC {
        return Err(Error::ChangeLog("invalid magic".into()));
    }

    let mut header = [0u8; 21];
    reader.read_exact(&mut header)?;
    let mut u64_bytes = [0u8; 8];
    u64_bytes.copy_from_slice(&header[0..8]);
    let seq = u64::from_le_bytes(u64_bytes);
    let op = header[8];
    u64_bytes.copy_from_slice(&header[9..17]);
    let written_at = u64::from_le_bytes(u64_bytes);
    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&header[17..21]);
    let len = u32::from_le_bytes(len_bytes) as usize;

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;

    let mut checksum_bytes = [0u8; 4];
    reader.read_exact(&mut checksum_bytes)?;

    let mut body = header.to_vec();
    body.extend_from_slice(&payload);
    if crc32(&body) != u32::from_le_bytes(checksum_bytes) {
        return Err(Error::ChangeLog("checksum mismatch".into()));
    }

    let doc: Document = serde_json::from_slice(&payload)
        .map_err(|e| Error::ChangeLog(format!("decode: {}", e)))?;
    let op = match op {
        OP_INSERT => MutationOp::Insert(doc),
        OP_UPDATE => MutationOp::Update(doc),
        OP_DELETE => MutationOp::Delete(doc),
        other => return Err(Error::ChangeLog(format!("unknown op code: {}", other))),
    };

    let size = LOG_MAGIC.len() + header.len() + len + checksum_bytes.len();
    Ok(Some((
        Mutation {
            seq,
            written_at,
            op,
        },
        size,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn doc(id: &str, v: i64) -> Document {
        json!({"_id": id, "v": v}).as_object().cloned().unwrap()
    }

    #[test]
    fn test_sequence_starts_at_one() {
        let mut log = ChangeLog::in_memory();
        assert_eq!(log.last_seq(), 0);
        let m = log.append(MutationOp::Insert(doc("a", 1))).unwrap();
        assert_eq!(m.seq, 1);
        assert_eq!(log.last_seq(), 1);
    }

    #[test]
    fn test_read_after() {
        let mut log = ChangeLog::in_memory();
        for i in 0..10 {
            log.append(MutationOp::Insert(doc(&i.to_string(), i))).unwrap();
        }
        let batch = log.read_after(4, 3);
        assert_eq!(
            batch.iter().map(|m| m.seq).collect::<Vec<_>>(),
            vec![5, 6, 7]
        );
        assert!(log.read_after(10, 100).is_empty());
        assert_eq!(log.read_after(0, 100).len(), 10);
    }

    #[test]
    fn test_reopen_continues_sequence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("users.log");

        {
            let mut log = ChangeLog::open(&path, true).unwrap();
            log.append(MutationOp::Insert(doc("a", 1))).unwrap();
            log.append(MutationOp::Update(doc("a", 2))).unwrap();
            log.append(MutationOp::Delete(doc("a", 2))).unwrap();
            log.sync().unwrap();
        }

        let mut log = ChangeLog::open(&path, true).unwrap();
        assert_eq!(log.last_seq(), 3);
        assert!(matches!(log.entries()[1].op, MutationOp::Update(_)));
        let m = log.append(MutationOp::Insert(doc("b", 1))).unwrap();
        assert_eq!(m.seq, 4);
    }

    #[test]
    fn test_replay_stops_at_torn_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("torn.log");
        {
            let mut log = ChangeLog::open(&path, true).unwrap();
            log.append(MutationOp::Insert(doc("a", 1))).unwrap();
            log.append(MutationOp::Insert(doc("b", 1))).unwrap();
        }
        let len = std::fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 3).unwrap();

        let mut seen = Vec::new();
        ChangeLog::replay(&path, |m| {
            seen.push(m.seq);
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![1]);

        // Reopening drops the torn tail so new appends stay readable
        {
            let mut log = ChangeLog::open(&path, true).unwrap();
            assert_eq!(log.append(MutationOp::Insert(doc("c", 1))).unwrap().seq, 2);
        }
        let log = ChangeLog::open(&path, true).unwrap();
        assert_eq!(log.last_seq(), 2);
    }
}
