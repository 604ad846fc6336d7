// Append-only insert queue, one shard per (table, partition).
//
// Rows land here before any grid work happens; the insert cell drains a
// few at a time and only then advances the read head, so a crash replays
// unprocessed rows instead of losing them. Records are CRC-framed on
// disk; a sidecar file remembers the head across restarts. A shard's
// unread span can also be serialized as an opaque block for replica
// catch-up.

use crate::error::{Error, Result};
use crate::mem::BlockPool;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::PathBuf;

const FRAME_HEADER: usize = 8; // len u32 + crc u32

struct Shard {
    records: VecDeque<(u64, Vec<u8>)>,
    next_seq: u64,
    read_head: u64,
    file: Option<File>,
    head_path: Option<PathBuf>,
}

impl Shard {
    fn backlog(&self) -> usize {
        (self.next_seq - self.read_head) as usize
    }
}

pub struct SideLog {
    root: Option<PathBuf>,
    shards: Mutex<HashMap<(String, usize), Shard>>,
    /// recycled frame buffers for the write path
    pool: BlockPool,
}

fn frame(out: &mut Vec<u8>, record: &[u8]) {
    out.extend_from_slice(&(record.len() as u32).to_le_bytes());
    out.extend_from_slice(&crc32fast::hash(record).to_le_bytes());
    out.extend_from_slice(record);
}

fn unframe(data: &[u8]) -> Vec<Vec<u8>> {
    let mut records = Vec::new();
    let mut offset = 0usize;
    while offset + FRAME_HEADER <= data.len() {
        let len = u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap()) as usize;
        let crc = u32::from_le_bytes(data[offset + 4..offset + 8].try_into().unwrap());
        offset += FRAME_HEADER;
        if offset + len > data.len() {
            break; // torn tail write
        }
        let record = &data[offset..offset + len];
        if crc32fast::hash(record) != crc {
            break; // corruption: stop replay at the last good record
        }
        records.push(record.to_vec());
        offset += len;
    }
    records
}

impl SideLog {
    pub fn new(root: Option<PathBuf>) -> Self {
        Self {
            root,
            shards: Mutex::new(HashMap::new()),
            pool: BlockPool::new(),
        }
    }

    fn load_shard(&self, table: &str, partition: usize) -> Shard {
        let mut shard = Shard {
            records: VecDeque::new(),
            next_seq: 0,
            read_head: 0,
            file: None,
            head_path: None,
        };

        let Some(root) = &self.root else {
            return shard;
        };
        let dir = root.join(table).join("translog");
        if std::fs::create_dir_all(&dir).is_err() {
            return shard;
        }
        let log_path = dir.join(format!("{partition}.log"));
        let head_path = dir.join(format!("{partition}.head"));

        if let Ok(mut existing) = File::open(&log_path) {
            let mut data = Vec::new();
            if existing.read_to_end(&mut data).is_ok() {
                for record in unframe(&data) {
                    let seq = shard.next_seq;
                    shard.next_seq += 1;
                    shard.records.push_back((seq, record));
                }
            }
        }
        if let Ok(head_text) = std::fs::read_to_string(&head_path) {
            if let Ok(head) = head_text.trim().parse::<u64>() {
                shard.read_head = head.min(shard.next_seq);
                while shard
                    .records
                    .front()
                    .map(|(seq, _)| *seq < shard.read_head)
                    .unwrap_or(false)
                {
                    shard.records.pop_front();
                }
            }
        }

        shard.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .ok();
        shard.head_path = Some(head_path);
        shard
    }

    fn with_shard<R>(
        &self,
        table: &str,
        partition: usize,
        apply: impl FnOnce(&mut Shard) -> R,
    ) -> R {
        let mut shards = self.shards.lock();
        let key = (table.to_string(), partition);
        if !shards.contains_key(&key) {
            let shard = self.load_shard(table, partition);
            shards.insert(key.clone(), shard);
        }
        apply(shards.get_mut(&key).unwrap())
    }

    /// Ensure the shard is open so nothing gets purged before its insert
    /// cell attaches. Called when a partition is born.
    pub fn reset_read_head(&self, table: &str, partition: usize) {
        self.with_shard(table, partition, |_| ());
    }

    pub fn append(&self, table: &str, partition: usize, rows: &[Vec<u8>]) -> Result<()> {
        let estimated: usize = rows.iter().map(|r| r.len() + FRAME_HEADER).sum();
        self.with_shard(table, partition, |shard| {
            let mut framed = self.pool.get(estimated);
            for row in rows {
                frame(&mut framed, row);
                let seq = shard.next_seq;
                shard.next_seq += 1;
                shard.records.push_back((seq, row.clone()));
            }
            let written = match shard.file.as_mut() {
                Some(file) => file
                    .write_all(&framed)
                    .map_err(|e| Error::insert(format!("side log write: {e}"))),
                None => Ok(()),
            };
            self.pool.put(framed);
            written
        })
    }

    /// Read up to `limit` unprocessed rows. Does not advance the head;
    /// the returned handle is passed to `update_read_head` once every row
    /// has been applied.
    pub fn read(&self, table: &str, partition: usize, limit: usize) -> (Vec<Vec<u8>>, u64) {
        self.with_shard(table, partition, |shard| {
            let mut out = Vec::new();
            let mut handle = shard.read_head;
            for (seq, record) in shard.records.iter() {
                if *seq < shard.read_head {
                    continue;
                }
                if out.len() >= limit {
                    break;
                }
                out.push(record.clone());
                handle = *seq + 1;
            }
            (out, handle)
        })
    }

    /// Commit processed rows. The head never moves backwards.
    pub fn update_read_head(&self, table: &str, partition: usize, handle: u64) {
        self.with_shard(table, partition, |shard| {
            if handle <= shard.read_head {
                return;
            }
            shard.read_head = handle.min(shard.next_seq);
            while shard
                .records
                .front()
                .map(|(seq, _)| *seq < shard.read_head)
                .unwrap_or(false)
            {
                shard.records.pop_front();
            }
            if let Some(path) = &shard.head_path {
                let _ = std::fs::write(path, shard.read_head.to_string());
            }
        })
    }

    /// Rows appended but not yet consumed; drives insert back-pressure.
    pub fn backlog(&self, table: &str, partition: usize) -> usize {
        self.with_shard(table, partition, |shard| shard.backlog())
    }

    /// The unread span as an opaque block for replica transfer.
    pub fn serialize_block(&self, table: &str, partition: usize) -> Vec<u8> {
        self.with_shard(table, partition, |shard| {
            let mut out = Vec::new();
            for (seq, record) in shard.records.iter() {
                if *seq >= shard.read_head {
                    frame(&mut out, record);
                }
            }
            out
        })
    }

    /// Receiver side of a transfer: append the block's records locally.
    pub fn append_block(&self, table: &str, partition: usize, block: &[u8]) -> Result<()> {
        let records = unframe(block);
        self.append(table, partition, &records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_does_not_advance_head() {
        let log = SideLog::new(None);
        log.append("t", 0, &[b"a".to_vec(), b"b".to_vec(), b"c".to_vec()])
            .unwrap();

        let (rows, handle) = log.read("t", 0, 2);
        assert_eq!(rows.len(), 2);
        assert_eq!(log.backlog("t", 0), 3);

        log.update_read_head("t", 0, handle);
        assert_eq!(log.backlog("t", 0), 1);

        let (rows, handle) = log.read("t", 0, 10);
        assert_eq!(rows, vec![b"c".to_vec()]);
        log.update_read_head("t", 0, handle);
        assert_eq!(log.backlog("t", 0), 0);
    }

    #[test]
    fn test_head_never_regresses() {
        let log = SideLog::new(None);
        log.append("t", 0, &[b"a".to_vec(), b"b".to_vec()]).unwrap();
        let (_, handle) = log.read("t", 0, 10);
        log.update_read_head("t", 0, handle);
        log.update_read_head("t", 0, 0);
        assert_eq!(log.backlog("t", 0), 0);
    }

    #[test]
    fn test_restart_replays_unprocessed() {
        let dir = tempfile::tempdir().unwrap();
        let root = Some(dir.path().to_path_buf());
        {
            let log = SideLog::new(root.clone());
            log.append("t", 3, &[b"one".to_vec(), b"two".to_vec(), b"three".to_vec()])
                .unwrap();
            let (rows, handle) = log.read("t", 3, 1);
            assert_eq!(rows, vec![b"one".to_vec()]);
            log.update_read_head("t", 3, handle);
        }
        // new process: head survives, unread rows replay
        let log = SideLog::new(root);
        let (rows, _) = log.read("t", 3, 10);
        assert_eq!(rows, vec![b"two".to_vec(), b"three".to_vec()]);
    }

    #[test]
    fn test_block_transfer_round_trip() {
        let log = SideLog::new(None);
        log.append("t", 1, &[b"x".to_vec(), b"y".to_vec()]).unwrap();
        let block = log.serialize_block("t", 1);

        let peer = SideLog::new(None);
        peer.append_block("t", 1, &block).unwrap();
        let (rows, _) = peer.read("t", 1, 10);
        assert_eq!(rows, vec![b"x".to_vec(), b"y".to_vec()]);
    }

    #[test]
    fn test_corrupt_tail_stops_replay() {
        let log = SideLog::new(None);
        let mut block = Vec::new();
        frame(&mut block, b"good");
        block.extend_from_slice(&[9, 0, 0, 0, 1, 2, 3, 4, 0xff]); // torn frame
        log.append_block("t", 0, &block).unwrap();
        let (rows, _) = log.read("t", 0, 10);
        assert_eq!(rows, vec![b"good".to_vec()]);
    }
}
