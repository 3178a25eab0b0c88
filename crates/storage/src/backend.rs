//! Ordered KV backend adapter (spec §4.A).
//!
//! A minimal, crash-recoverable, atomic `get`/`put`/`delete`/`prefix_scan`
//! store. Durability is provided by a single append-only WAL file: every
//! mutation is framed as a self-delimiting, CRC32-checked record and
//! replayed in full on open to rebuild the in-memory ordered index.
//!
//! Key ordering is preserved by keeping the live index in a `BTreeMap`,
//! so `prefix_scan` can walk a contiguous range directly.

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::collections::BTreeMap;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::{Mutex, RwLock};

use profilestore_core::{Error, Result};

const OP_PUT: u8 = 1;
const OP_DELETE: u8 = 2;

/// Ordered, crash-recoverable byte-string key-value store (spec §4.A).
///
/// `get`/`prefix_scan` read the in-memory index directly; `put`/`delete`
/// append a record to the WAL, then flush the write (not fsynced) and
/// apply it to the in-memory index. [`Backend::sync`] fsyncs the WAL so
/// that everything applied so far is durable, matching spec §4.A's
/// "writes are durable after `sync()`".
pub struct Backend {
    path: PathBuf,
    index: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    wal: Mutex<BufWriter<File>>,
}

impl Backend {
    /// Open (creating if absent) the backend rooted at `path`, replaying
    /// its WAL to rebuild the in-memory index.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&path)?;
        let wal_path = path.join("backend.wal");

        let index = replay(&wal_path)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&wal_path)?;

        Ok(Backend {
            path,
            index: RwLock::new(index),
            wal: Mutex::new(BufWriter::new(file)),
        })
    }

    /// Directory this backend is rooted at.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Fetch the value for `key`, or `None` if absent. Absence is not an
    /// error (spec §4.A).
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.index.read().get(key).cloned())
    }

    /// Atomically write `key -> value`, journaling the write to the WAL
    /// first.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.append_record(OP_PUT, key, Some(value))?;
        self.index.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    /// Atomically remove `key`. Absent is a no-op.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.append_record(OP_DELETE, key, None)?;
        self.index.write().remove(key);
        Ok(())
    }

    /// Visit every `(key, value)` pair whose key starts with `prefix`, in
    /// key order, until `visit` returns `false` or the prefix range is
    /// exhausted.
    pub fn prefix_scan(
        &self,
        prefix: &[u8],
        mut visit: impl FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<()> {
        let index = self.index.read();
        for (k, v) in index.range(prefix.to_vec()..) {
            if !k.starts_with(prefix) {
                break;
            }
            if !visit(k, v) {
                break;
            }
        }
        Ok(())
    }

    /// Fsync the WAL. Everything written before this call is guaranteed
    /// durable afterward.
    pub fn sync(&self) -> Result<()> {
        let mut wal = self.wal.lock();
        wal.flush()?;
        wal.get_ref().sync_data()?;
        Ok(())
    }

    /// Sync and release the underlying file handle.
    pub fn close(self) -> Result<()> {
        self.sync()
    }

    fn append_record(&self, op: u8, key: &[u8], value: Option<&[u8]>) -> Result<()> {
        let mut buf = Vec::with_capacity(9 + key.len() + value.map_or(0, <[u8]>::len));
        buf.push(op);
        buf.write_u32::<LittleEndian>(key.len() as u32)
            .expect("write to Vec never fails");
        buf.extend_from_slice(key);
        if let Some(v) = value {
            buf.write_u32::<LittleEndian>(v.len() as u32)
                .expect("write to Vec never fails");
            buf.extend_from_slice(v);
        }
        let crc = crc32fast::hash(&buf);

        let mut wal = self.wal.lock();
        wal.write_u32::<LittleEndian>(buf.len() as u32)?;
        wal.write_all(&buf)?;
        wal.write_u32::<LittleEndian>(crc)?;
        wal.flush()?;
        Ok(())
    }
}

/// Replay the WAL at `wal_path` into a fresh in-memory index. A
/// truncated trailing record (a torn write from a crash mid-append) is
/// discarded and the WAL file truncated back to the last valid record
/// boundary; any other checksum mismatch is hard corruption.
fn replay(wal_path: &Path) -> Result<BTreeMap<Vec<u8>, Vec<u8>>> {
    let mut index = BTreeMap::new();
    let file = match OpenOptions::new().read(true).open(wal_path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(index),
        Err(e) => return Err(e.into()),
    };
    let len = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    let mut offset: u64 = 0;

    loop {
        if offset == len {
            break;
        }
        match read_record(&mut reader, len - offset) {
            Ok(Some((record_len, op, key, value))) => {
                offset += 4 + record_len as u64 + 4;
                match op {
                    OP_PUT => {
                        index.insert(key, value.expect("PUT record always carries a value"));
                    }
                    OP_DELETE => {
                        index.remove(&key);
                    }
                    other => {
                        return Err(Error::CorruptEntry(format!(
                            "unknown WAL opcode {other}"
                        )))
                    }
                }
            }
            Ok(None) => {
                // Torn trailing write: truncate and stop replaying.
                truncate_to(wal_path, offset)?;
                break;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(index)
}

type DecodedRecord = (u32, u8, Vec<u8>, Option<Vec<u8>>);

fn read_record(reader: &mut impl Read, remaining: u64) -> Result<Option<DecodedRecord>> {
    if remaining < 4 {
        return Ok(None);
    }
    let record_len = match reader.read_u32::<LittleEndian>() {
        Ok(v) => v,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if remaining < 4 + record_len as u64 + 4 {
        return Ok(None);
    }
    let mut buf = vec![0u8; record_len as usize];
    if reader.read_exact(&mut buf).is_err() {
        return Ok(None);
    }
    let stored_crc = match reader.read_u32::<LittleEndian>() {
        Ok(v) => v,
        Err(_) => return Ok(None),
    };
    if crc32fast::hash(&buf) != stored_crc {
        return Ok(None);
    }

    let mut cursor = io::Cursor::new(&buf);
    let op = cursor.read_u8()?;
    let key_len = cursor.read_u32::<LittleEndian>()? as usize;
    let mut key = vec![0u8; key_len];
    cursor.read_exact(&mut key)?;
    let value = if op == OP_PUT {
        let val_len = cursor.read_u32::<LittleEndian>()? as usize;
        let mut val = vec![0u8; val_len];
        cursor.read_exact(&mut val)?;
        Some(val)
    } else {
        None
    };
    Ok(Some((record_len, op, key, value)))
}

fn truncate_to(path: &Path, offset: u64) -> Result<()> {
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_len(offset)?;
    let mut f = file;
    f.seek(SeekFrom::Start(offset))?;
    Ok(())
}
