//! A [`DataLog`] with a bounded in-memory chunk cache.
//!
//! The replication log is read hot at two places: relays fetch entries one
//! at a time while streaming, and appended entries are usually shipped
//! straight away. `DataArray` keeps a small LRU of contiguous chunks so
//! those reads rarely touch disk, and caches the end sequence so `end()`
//! is free after the first call.

use std::sync::Mutex;

use bytes::Bytes;

use crate::error::{Result, StorageError};
use crate::log::{DataLog, LogIter, RevLogIter};
use crate::lru::LruCache;

/// Number of chunks kept in memory.
const DEFAULT_CHUNK_COUNT: usize = 4;

/// Records per chunk.
const DEFAULT_CHUNK_SIZE: i64 = 100;

struct ArrayInner {
    /// Contiguous runs of records, keyed by the sequence of their first
    /// record.
    chunks: LruCache<i64, Vec<Bytes>>,
    /// One past the last sequence, once known.
    end: Option<i64>,
}

/// A random-access view of a [`DataLog`]; see the module docs.
pub struct DataArray {
    log: DataLog,
    chunk_size: i64,
    inner: Mutex<ArrayInner>,
}

impl DataArray {
    pub fn new(log: DataLog) -> Self {
        Self::with_chunks(log, DEFAULT_CHUNK_COUNT, DEFAULT_CHUNK_SIZE)
    }

    pub fn with_chunks(log: DataLog, chunk_count: usize, chunk_size: i64) -> Self {
        Self {
            log,
            chunk_size,
            inner: Mutex::new(ArrayInner {
                chunks: LruCache::new(chunk_count),
                end: None,
            }),
        }
    }

    pub fn log(&self) -> &DataLog {
        &self.log
    }

    /// Appends a record, returning its sequence number.
    ///
    /// An explicit sequence may seed a non-zero base on an empty log; once
    /// the end is known it must equal the end exactly.
    pub fn append(&self, payload: &[u8], seq: Option<i64>) -> Result<i64> {
        let mut inner = self.inner.lock().expect("array lock poisoned");
        let end = self.end_locked(&mut inner)?;
        if let Some(given) = seq
            && inner.end.is_some()
            && given != end
        {
            return Err(StorageError::NonMonotonicSeq { given, end });
        }

        let (written, _) = self.log.append(payload, seq.or(Some(end)))?;
        inner.end = Some(written + 1);

        // Keep the hot tail cached: extend the top chunk while it is both
        // contiguous with this record and under the chunk size.
        let value = Bytes::copy_from_slice(payload);
        let top = inner.chunks.keys().max().copied();
        let extended = top.is_some_and(|base| {
            written - base < self.chunk_size
                && inner
                    .chunks
                    .get_mut(&base)
                    .filter(|c| base + c.len() as i64 == written)
                    .map(|c| c.push(value.clone()))
                    .is_some()
        });
        if !extended {
            inner.chunks.insert(written, vec![value]);
        }
        Ok(written)
    }

    /// Returns the record with sequence `i`, faulting in a chunk around it
    /// on a cache miss.
    pub fn get(&self, i: i64) -> Result<Bytes> {
        let mut inner = self.inner.lock().expect("array lock poisoned");

        // The cached chunks, besides possibly answering directly, bound the
        // uncached window around `i`.
        let mut lo: Option<i64> = None;
        let mut hi: Option<i64> = None;
        let mut hit: Option<(i64, Bytes)> = None;
        for (&base, chunk) in inner.chunks.iter() {
            let top = base + chunk.len() as i64;
            if base <= i && i < top {
                hit = Some((base, chunk[(i - base) as usize].clone()));
                break;
            } else if i < base {
                hi = Some(hi.map_or(base, |h: i64| h.min(base)));
            } else {
                lo = Some(lo.map_or(top, |l: i64| l.max(top)));
            }
        }
        if let Some((base, found)) = hit {
            inner.chunks.get(&base); // refresh recency of the answering chunk
            return Ok(found);
        }

        let lo = match lo {
            Some(lo) => lo,
            None => {
                let first = self.log.first()?.ok_or(StorageError::NoSuchSeq(i))?;
                if i < first {
                    return Err(StorageError::NoSuchSeq(i));
                }
                first
            }
        };
        let hi = match hi {
            Some(hi) => hi,
            None => self.log.last()?.ok_or(StorageError::NoSuchSeq(i))? + 1,
        };
        if i >= hi {
            return Err(StorageError::NoSuchSeq(i));
        }

        // [lo, hi) is the largest gap containing i that overlaps no cached
        // chunk. Trim it to one chunk's worth around i.
        let (mut lo, mut hi) = (lo, hi);
        if hi - lo > self.chunk_size {
            if hi - i < self.chunk_size / 2 {
                lo = hi - self.chunk_size;
            } else if i - lo < self.chunk_size / 2 {
                hi = lo + self.chunk_size;
            } else {
                lo = i - self.chunk_size / 2;
                hi = lo + self.chunk_size;
            }
        }

        let mut fresh = Vec::with_capacity((hi - lo) as usize);
        for item in self.log.iter(Some(lo))? {
            let (j, payload) = item?;
            if j >= hi {
                break;
            }
            fresh.push(payload);
        }
        let offset = (i - lo) as usize;
        if offset >= fresh.len() {
            return Err(StorageError::NoSuchSeq(i));
        }
        let found = fresh[offset].clone();
        inner.chunks.insert(lo, fresh);
        Ok(found)
    }

    /// Sequence number of the first record, or 0 on an empty log.
    pub fn begin(&self) -> Result<i64> {
        Ok(self.log.first()?.unwrap_or(0))
    }

    /// One past the last sequence number; 0 on an empty log.
    pub fn end(&self) -> Result<i64> {
        let mut inner = self.inner.lock().expect("array lock poisoned");
        self.end_locked(&mut inner)
    }

    fn end_locked(&self, inner: &mut ArrayInner) -> Result<i64> {
        if let Some(end) = inner.end {
            return Ok(end);
        }
        let end = match self.log.last()? {
            Some(last) => {
                inner.end = Some(last + 1);
                last + 1
            }
            None => 0,
        };
        Ok(end)
    }

    pub fn first(&self) -> Result<Option<i64>> {
        self.log.first()
    }

    pub fn last(&self) -> Result<Option<i64>> {
        self.log.last()
    }

    pub fn len(&self) -> Result<i64> {
        match (self.log.first()?, self.log.last()?) {
            (Some(first), Some(last)) => Ok(last + 1 - first),
            _ => Ok(0),
        }
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.log.first()?.is_none())
    }

    pub fn iter(&self, from: Option<i64>) -> Result<LogIter> {
        self.log.iter(from)
    }

    pub fn iter_rev(&self, from: Option<i64>) -> Result<RevLogIter> {
        self.log.iter_rev(from)
    }

    /// Removes whole segments below `seq` and drops cached chunks that
    /// start below it.
    pub fn truncate(&self, seq: i64) -> Result<()> {
        let mut inner = self.inner.lock().expect("array lock poisoned");
        self.log.truncate(seq)?;
        let stale: Vec<i64> = inner
            .chunks
            .keys()
            .copied()
            .filter(|&base| base < seq)
            .collect();
        for base in stale {
            inner.chunks.remove(&base);
        }
        Ok(())
    }

    /// Removes everything; the next append starts from sequence 0 again.
    pub fn clear(&self) -> Result<()> {
        let mut inner = self.inner.lock().expect("array lock poisoned");
        self.log.clear()?;
        inner.chunks.clear();
        inner.end = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn array(dir: &TempDir) -> DataArray {
        DataArray::with_chunks(
            DataLog::with_segment_limit(dir.path(), 128).unwrap(),
            3,
            8,
        )
    }

    #[test]
    fn append_get_and_end() {
        let dir = TempDir::new().unwrap();
        let a = array(&dir);
        assert_eq!(a.end().unwrap(), 0);
        for i in 0..30 {
            assert_eq!(a.append(format!("v{i}").as_bytes(), None).unwrap(), i);
        }
        assert_eq!(a.end().unwrap(), 30);
        assert_eq!(a.len().unwrap(), 30);
        for i in (0..30).rev() {
            assert_eq!(a.get(i).unwrap().as_ref(), format!("v{i}").as_bytes());
        }
    }

    #[test]
    fn cold_reads_fault_chunks_in() {
        let dir = TempDir::new().unwrap();
        {
            let a = array(&dir);
            for i in 0..40 {
                a.append(format!("v{i}").as_bytes(), None).unwrap();
            }
        }
        // A fresh instance has an empty cache; reads hit disk then cache.
        let a = array(&dir);
        assert_eq!(a.get(17).unwrap().as_ref(), b"v17");
        assert_eq!(a.get(17).unwrap().as_ref(), b"v17");
        assert_eq!(a.get(0).unwrap().as_ref(), b"v0");
        assert_eq!(a.get(39).unwrap().as_ref(), b"v39");
        assert!(matches!(a.get(40), Err(StorageError::NoSuchSeq(40))));
    }

    #[test]
    fn explicit_seq_must_continue_a_known_end() {
        let dir = TempDir::new().unwrap();
        let a = array(&dir);
        assert_eq!(a.append(b"seeded", Some(1000)).unwrap(), 1000);
        assert_eq!(a.end().unwrap(), 1001);
        assert_eq!(a.append(b"next", Some(1001)).unwrap(), 1001);
        assert!(matches!(
            a.append(b"bad", Some(5)),
            Err(StorageError::NonMonotonicSeq { given: 5, end: 1002 })
        ));
    }

    #[test]
    fn end_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let a = array(&dir);
            for _ in 0..5 {
                a.append(b"x", None).unwrap();
            }
        }
        let a = array(&dir);
        assert_eq!(a.end().unwrap(), 5);
        assert_eq!(a.append(b"y", None).unwrap(), 5);
    }

    #[test]
    fn truncate_drops_stale_chunks() {
        let dir = TempDir::new().unwrap();
        let a = array(&dir);
        for i in 0..32 {
            a.append(format!("padded record {i}").as_bytes(), None).unwrap();
        }
        a.truncate(16).unwrap();
        let first = a.begin().unwrap();
        assert!(first <= 16);
        for i in first..32 {
            a.get(i).unwrap();
        }
    }

    #[test]
    fn clear_resets_the_sequence() {
        let dir = TempDir::new().unwrap();
        let a = array(&dir);
        a.append(b"x", None).unwrap();
        a.clear().unwrap();
        assert_eq!(a.end().unwrap(), 0);
        assert_eq!(a.append(b"fresh", None).unwrap(), 0);
    }
}
