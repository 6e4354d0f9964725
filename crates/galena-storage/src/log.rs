//! Append-only log of opaque byte strings with 64-bit sequence numbers.
//!
//! # File layout
//!
//! ```text
//! {dir}/
//! ├── data.0      <- first segment (immutable once rotated away from)
//! ├── data.1
//! └── data.2      <- active segment (highest number)
//! ```
//!
//! Each segment holds records of the form
//! `<ascii-decimal-seq> <SP> <escaped-payload> \n`, where the payload
//! escaping doubles backslashes and rewrites a raw newline as `\n`. Records
//! are appended to the highest-numbered segment until its size reaches the
//! configured limit, at which point the next append starts a new segment.
//!
//! Newline-terminated records mean a torn trailing write is harmlessly
//! skipped on recovery; forward and reverse iteration are equally cheap;
//! and lookup by sequence number is a block-wise binary search, so even
//! large logs answer quickly.
//!
//! Sequence numbers are strictly increasing. By default they start from 0
//! and go up by 1, but any increasing run of signed 64-bit numbers can be
//! seeded through the explicit-sequence append (millisecond timestamps,
//! for example). Gaps are permitted; duplicates are not.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use bytes::Bytes;

use crate::error::{Result, StorageError};

/// Default byte size at which the active segment is retired (10 MiB).
pub const DEFAULT_SEGMENT_LIMIT: u64 = 10 * 1024 * 1024;

/// Block size for backward scans and binary-search probes.
const BLOCK_SIZE: u64 = 1024;

/// How many bytes to probe when reading a record's sequence number:
/// enough for `i64::MIN`, the space, and slack.
const SEQ_PROBE_LEN: usize = 36;

/// Doubles backslashes and rewrites raw newlines as `\n`.
fn escape(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len());
    for &b in payload {
        match b {
            b'\\' => out.extend_from_slice(b"\\\\"),
            b'\n' => out.extend_from_slice(b"\\n"),
            _ => out.push(b),
        }
    }
    out
}

/// Inverse of [`escape`]: `\x` becomes a newline when `x` is `n`, else `x`.
fn unescape(escaped: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(escaped.len());
    let mut bytes = escaped.iter();
    while let Some(&b) = bytes.next() {
        if b == b'\\' {
            match bytes.next() {
                Some(b'n') => out.push(b'\n'),
                Some(&c) => out.push(c),
                None => out.push(b),
            }
        } else {
            out.push(b);
        }
    }
    out
}

/// A persistent sequence of byte strings; see the module docs.
pub struct DataLog {
    dir: PathBuf,
    segment_limit: u64,
    /// Serializes appends and truncation. Readers go lock-free: they open
    /// their own handles and only ever see whole `\n`-terminated records.
    append_lock: Mutex<()>,
}

impl DataLog {
    /// Opens (creating if necessary) a log in `dir` with the default
    /// segment limit.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        Self::with_segment_limit(dir, DEFAULT_SEGMENT_LIMIT)
    }

    /// Opens a log with a caller-chosen segment byte limit.
    pub fn with_segment_limit(dir: impl Into<PathBuf>, segment_limit: u64) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            segment_limit,
            append_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of segment files currently on disk.
    pub fn segment_count(&self) -> Result<usize> {
        Ok(self.segment_numbers()?.len())
    }

    /// Sequence number of the first record, or `None` if the log is empty.
    pub fn first(&self) -> Result<Option<i64>> {
        for n in self.segment_numbers()? {
            let mut file = self.open_segment(n)?;
            if let Some(seq) = read_seq_at(&mut file, 0)? {
                return Ok(Some(seq));
            }
        }
        Ok(None)
    }

    /// Sequence number of the last complete record, or `None` if the log
    /// holds none.
    pub fn last(&self) -> Result<Option<i64>> {
        let nums = self.segment_numbers()?;
        self.last_in(&nums)
    }

    fn last_in(&self, nums: &[u64]) -> Result<Option<i64>> {
        for &n in nums.iter().rev() {
            let mut file = self.open_segment(n)?;
            if let Some(pos) = seek_last_line(&mut file)?
                && let Some(seq) = read_seq_at(&mut file, pos)?
            {
                return Ok(Some(seq));
            }
        }
        Ok(None)
    }

    /// Appends a record.
    ///
    /// Without an explicit sequence the record gets one more than the
    /// current highest. An explicit sequence is honored only while it keeps
    /// the log increasing: on a non-empty log it is clamped up to
    /// `last + 1`. Returns `(seq, rotated)` where `rotated` says a new
    /// segment file was started.
    pub fn append(&self, payload: &[u8], seq: Option<i64>) -> Result<(i64, bool)> {
        let _guard = self.append_lock.lock().expect("append lock poisoned");

        let nums = self.segment_numbers()?;
        let last = self.last_in(&nums)?;
        let seq = match (seq, last) {
            (Some(s), Some(l)) => s.max(l + 1),
            (Some(s), None) => s,
            (None, Some(l)) => l + 1,
            (None, None) => 0,
        };

        let (n, rotated) = match nums.last() {
            Some(&active) => {
                // A crash may have left a torn record at the tail; cut it
                // off so the new record starts its own line.
                heal_torn_tail(&self.segment_path(active))?;
                let size = fs::metadata(self.segment_path(active))?.len();
                if size >= self.segment_limit {
                    (active + 1, true)
                } else {
                    (active, false)
                }
            }
            None => (0, true),
        };

        let mut record = Vec::with_capacity(payload.len() + SEQ_PROBE_LEN);
        write!(record, "{seq} ").expect("writing to a Vec cannot fail");
        record.extend_from_slice(&escape(payload));
        record.push(b'\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.segment_path(n))?;
        file.write_all(&record)?;

        if rotated && n > 0 {
            tracing::debug!(dir = %self.dir.display(), segment = n, "started new log segment");
        }
        Ok((seq, rotated))
    }

    /// Returns the record with the given sequence number.
    pub fn get(&self, seq: i64) -> Result<Bytes> {
        let nums = self.segment_numbers()?;
        if nums.is_empty() {
            return Err(StorageError::NoSuchSeq(seq));
        }
        let n = self.find_segment(seq, &nums)?;
        let mut file = self.open_segment(n)?;
        let Some(pos) = seek_seq(&mut file, seq)? else {
            return Err(StorageError::NoSuchSeq(seq));
        };
        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(pos))?;
        match read_record(&mut reader)? {
            Some((found, payload)) if found == seq => Ok(payload),
            _ => Err(StorageError::NoSuchSeq(seq)),
        }
    }

    /// Iterates records in ascending sequence order, starting at `from`
    /// (or its successor when `from` is absent from the log).
    pub fn iter(&self, from: Option<i64>) -> Result<LogIter> {
        let nums = self.segment_numbers()?;
        let mut start = None;
        let mut rest = nums.clone();

        if let (Some(seq), false) = (from, nums.is_empty()) {
            let n = self.find_segment(seq, &nums)?;
            let mut file = self.open_segment(n)?;
            if let Some(pos) = seek_seq(&mut file, seq)? {
                let mut reader = BufReader::new(file);
                reader.seek(SeekFrom::Start(pos))?;
                start = Some(reader);
            }
            rest.retain(|&m| m > n);
        }

        Ok(LogIter {
            log_dir: self.dir.clone(),
            current: start,
            rest: rest.into_iter(),
        })
    }

    /// Iterates records in descending sequence order, starting at `from`
    /// (or its predecessor when `from` is absent), or from the last record.
    pub fn iter_rev(&self, from: Option<i64>) -> Result<RevLogIter> {
        let nums = self.segment_numbers()?;
        let mut start = None;
        let mut rest: Vec<u64> = nums.iter().rev().copied().collect();

        if let (Some(seq), false) = (from, nums.is_empty()) {
            // Position just past `seq` and walk left from there.
            let bound = seq.saturating_add(1);
            let n = self.find_segment(bound, &nums)?;
            let mut file = self.open_segment(n)?;
            let end = match seek_seq(&mut file, bound)? {
                Some(pos) => pos,
                // Everything in this segment is <= seq: take it whole.
                None => file.metadata()?.len(),
            };
            start = Some(RevFileIter::new(file, end));
            rest.retain(|&m| m < n);
        }

        Ok(RevLogIter {
            log_dir: self.dir.clone(),
            current: start,
            rest: rest.into_iter(),
        })
    }

    /// Removes every segment file all of whose records are strictly below
    /// `seq`. Never splits a segment.
    pub fn truncate(&self, seq: i64) -> Result<()> {
        let _guard = self.append_lock.lock().expect("append lock poisoned");
        for n in self.segment_numbers()? {
            let mut file = self.open_segment(n)?;
            if let Some(pos) = seek_last_line(&mut file)?
                && let Some(last) = read_seq_at(&mut file, pos)?
                && last >= seq
            {
                break;
            }
            fs::remove_file(self.segment_path(n))?;
        }
        Ok(())
    }

    /// Removes every segment file.
    pub fn clear(&self) -> Result<()> {
        let _guard = self.append_lock.lock().expect("append lock poisoned");
        for n in self.segment_numbers()? {
            fs::remove_file(self.segment_path(n))?;
        }
        Ok(())
    }

    fn segment_path(&self, n: u64) -> PathBuf {
        self.dir.join(format!("data.{n}"))
    }

    fn open_segment(&self, n: u64) -> Result<File> {
        Ok(File::open(self.segment_path(n))?)
    }

    fn segment_numbers(&self) -> Result<Vec<u64>> {
        let mut nums = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if let Some(n) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.strip_prefix("data."))
                .and_then(|n| n.parse::<u64>().ok())
            {
                nums.push(n);
            }
        }
        nums.sort_unstable();
        Ok(nums)
    }

    /// Binary search over segments for the one that must hold `seq` if any
    /// segment does. `nums` must be non-empty.
    fn find_segment(&self, seq: i64, nums: &[u64]) -> Result<u64> {
        let first_seq = |n: u64| -> Result<Option<i64>> {
            let mut file = self.open_segment(n)?;
            read_seq_at(&mut file, 0)
        };

        let mut lo = 0usize;
        let mut hi = nums.len() - 1;
        while lo < hi {
            let mid = (lo + 1 + hi) / 2;
            let mid_seq = first_seq(nums[mid])?;
            if hi == lo + 1 {
                return match mid_seq {
                    Some(s) if seq >= s => Ok(nums[hi]),
                    _ => Ok(nums[lo]),
                };
            }
            let Some(mid_seq) = mid_seq else {
                return Err(StorageError::CorruptSegment {
                    path: self.segment_path(nums[mid]),
                    reason: "segment has no readable first record".into(),
                });
            };
            if seq < mid_seq {
                hi = mid;
            } else {
                lo = mid;
            }
        }
        Ok(nums[lo])
    }
}

// ============================================================================
// Forward iteration
// ============================================================================

/// Forward record iterator; yields `(seq, payload)` in ascending order.
pub struct LogIter {
    log_dir: PathBuf,
    current: Option<BufReader<File>>,
    rest: std::vec::IntoIter<u64>,
}

impl Iterator for LogIter {
    type Item = Result<(i64, Bytes)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(reader) = &mut self.current {
                match read_record(reader) {
                    Ok(Some(item)) => return Some(Ok(item)),
                    Ok(None) => self.current = None,
                    Err(e) => return Some(Err(e)),
                }
            } else {
                let n = self.rest.next()?;
                let path = self.log_dir.join(format!("data.{n}"));
                match File::open(&path) {
                    Ok(file) => self.current = Some(BufReader::new(file)),
                    // Segment may have been truncated away underneath us.
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Some(Err(e.into())),
                }
            }
        }
    }
}

/// Reads one complete record. `None` at end of file or at a torn tail.
fn read_record(reader: &mut BufReader<File>) -> Result<Option<(i64, Bytes)>> {
    loop {
        let mut line = Vec::new();
        let n = reader.read_until(b'\n', &mut line)?;
        if n == 0 || line.last() != Some(&b'\n') {
            return Ok(None);
        }
        line.pop();
        match parse_record(&line) {
            Some(item) => return Ok(Some(item)),
            None => {
                tracing::warn!("skipping malformed log record");
            }
        }
    }
}

fn parse_record(line: &[u8]) -> Option<(i64, Bytes)> {
    let sp = line.iter().position(|&b| b == b' ')?;
    let seq: i64 = std::str::from_utf8(&line[..sp]).ok()?.parse().ok()?;
    Some((seq, Bytes::from(unescape(&line[sp + 1..]))))
}

// ============================================================================
// Reverse iteration
// ============================================================================

/// Reverse record iterator; yields `(seq, payload)` in descending order.
pub struct RevLogIter {
    log_dir: PathBuf,
    current: Option<RevFileIter>,
    rest: std::vec::IntoIter<u64>,
}

impl Iterator for RevLogIter {
    type Item = Result<(i64, Bytes)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(iter) = &mut self.current {
                match iter.next_line() {
                    Ok(Some(line)) => match parse_record(&line) {
                        Some(item) => return Some(Ok(item)),
                        None => {
                            tracing::warn!("skipping malformed log record");
                        }
                    },
                    Ok(None) => self.current = None,
                    Err(e) => return Some(Err(e)),
                }
            } else {
                let n = self.rest.next()?;
                let path = self.log_dir.join(format!("data.{n}"));
                match File::open(&path) {
                    Ok(file) => {
                        let end = match file.metadata() {
                            Ok(m) => m.len(),
                            Err(e) => return Some(Err(e.into())),
                        };
                        self.current = Some(RevFileIter::new(file, end));
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Some(Err(e.into())),
                }
            }
        }
    }
}

/// Walks one segment backward in blocks, emitting complete lines in
/// reverse order.
struct RevFileIter {
    file: File,
    /// Exclusive upper bound of the unread region.
    end: u64,
    /// Right fragment of the line currently being assembled, present once
    /// the first newline has been seen.
    carry: Option<Vec<u8>>,
    /// Complete lines ready to emit, last-emitted-first popped from the back.
    ready: Vec<Vec<u8>>,
    done: bool,
}

impl RevFileIter {
    fn new(file: File, end: u64) -> Self {
        Self {
            file,
            end,
            carry: None,
            ready: Vec::new(),
            done: false,
        }
    }

    fn next_line(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            if let Some(line) = self.ready.pop() {
                return Ok(Some(line));
            }
            if self.done {
                return Ok(None);
            }
            if self.end == 0 {
                self.done = true;
                // Whatever is left of the first line is complete: its start
                // is the start of the file.
                if let Some(first) = self.carry.take() {
                    return Ok(Some(first));
                }
                return Ok(None);
            }
            self.fill()?;
        }
    }

    /// Reads the next block leftward and splits out complete lines.
    fn fill(&mut self) -> Result<()> {
        let begin = self.end.saturating_sub(BLOCK_SIZE);
        let len = (self.end - begin) as usize;
        let mut block = vec![0u8; len];
        self.file.seek(SeekFrom::Start(begin))?;
        self.file.read_exact(&mut block)?;
        self.end = begin;

        let mut parts: Vec<Vec<u8>> = block.split(|&b| b == b'\n').map(<[u8]>::to_vec).collect();

        match self.carry.take() {
            None => {
                // First block: the fragment after the last newline is a
                // torn (or empty) tail. Drop it. No newline yet means the
                // whole block is tail.
                if parts.len() == 1 {
                    return Ok(());
                }
                parts.pop();
            }
            Some(carry) => {
                if parts.len() == 1 {
                    // No newline in this block: keep assembling.
                    let mut joined = parts.pop().expect("split yields at least one part");
                    joined.extend_from_slice(&carry);
                    self.carry = Some(joined);
                    return Ok(());
                }
                let mut tail = parts.pop().expect("checked len above");
                tail.extend_from_slice(&carry);
                parts.push(tail);
            }
        }

        // parts[0] may continue into the previous block; everything after
        // it is complete. Lines sit left-to-right, so popping from the back
        // of `ready` emits rightmost first.
        self.carry = Some(parts.remove(0));
        self.ready = parts;
        Ok(())
    }
}

// ============================================================================
// Block-wise file positioning
// ============================================================================

/// Truncates an unterminated trailing record, if the file ends in one.
fn heal_torn_tail(path: &Path) -> Result<()> {
    let mut file = match OpenOptions::new().read(true).write(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    let size = file.metadata()?.len();
    if size == 0 {
        return Ok(());
    }
    let last = read_at(&mut file, size - 1, 1)?;
    if last.first() == Some(&b'\n') {
        return Ok(());
    }
    let torn_start = seek_start_of_line(&mut file, size)?;
    file.set_len(torn_start)?;
    tracing::warn!(path = %path.display(), "dropped torn trailing record");
    Ok(())
}

fn read_at(file: &mut File, pos: u64, len: usize) -> Result<Vec<u8>> {
    file.seek(SeekFrom::Start(pos))?;
    let mut buf = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}

/// Reads the sequence number of the record starting at `pos`, or `None`
/// for an empty or torn record.
fn read_seq_at(file: &mut File, pos: u64) -> Result<Option<i64>> {
    let probe = read_at(file, pos, SEQ_PROBE_LEN)?;
    let Some(sp) = probe.iter().position(|&b| b == b' ') else {
        return Ok(None);
    };
    Ok(std::str::from_utf8(&probe[..sp])
        .ok()
        .and_then(|s| s.parse().ok()))
}

/// Start of the line containing (or ending at) `pos`: either 0 or one past
/// the previous newline.
fn seek_start_of_line(file: &mut File, pos: u64) -> Result<u64> {
    let mut end = pos;
    while end > 0 {
        let begin = end.saturating_sub(BLOCK_SIZE);
        let block = read_at(file, begin, (end - begin) as usize)?;
        if let Some(i) = block.iter().rposition(|&b| b == b'\n') {
            return Ok(begin + i as u64 + 1);
        }
        end = begin;
    }
    Ok(0)
}

/// Position one past the next newline at or after `pos`, if any.
fn seek_next_line(file: &mut File, pos: u64) -> Result<Option<u64>> {
    let mut begin = pos;
    loop {
        let block = read_at(file, begin, BLOCK_SIZE as usize)?;
        if block.is_empty() {
            return Ok(None);
        }
        if let Some(i) = block.iter().position(|&b| b == b'\n') {
            return Ok(Some(begin + i as u64 + 1));
        }
        begin += block.len() as u64;
    }
}

/// Start of the last complete (newline-terminated) line, or `None` if the
/// file holds none.
fn seek_last_line(file: &mut File) -> Result<Option<u64>> {
    let size = file.metadata()?.len();
    if size == 0 {
        return Ok(None);
    }
    let last_byte = read_at(file, size - 1, 1)?;
    let scan_from = if last_byte.first() == Some(&b'\n') {
        size - 1
    } else {
        // Trailing line is torn: back up to the newline that ends the
        // previous line.
        let torn_start = seek_start_of_line(file, size)?;
        if torn_start == 0 {
            return Ok(None);
        }
        torn_start - 1
    };
    Ok(Some(seek_start_of_line(file, scan_from)?))
}

/// Byte position of the first record with sequence >= `seq`, or `None` if
/// every record in the file is below `seq`.
fn seek_seq(file: &mut File, seq: i64) -> Result<Option<u64>> {
    let Some(last_pos) = seek_last_line(file)? else {
        return Ok(None);
    };
    let mut hi = last_pos;
    let Some(hi_seq) = read_seq_at(file, hi)? else {
        return Ok(None);
    };
    if seq > hi_seq {
        return Ok(None);
    }
    if seq == hi_seq {
        return Ok(Some(hi));
    }
    let Some(lo_seq) = read_seq_at(file, 0)? else {
        return Ok(None);
    };
    if seq <= lo_seq {
        return Ok(Some(0));
    }
    let Some(mut lo) = seek_next_line(file, 0)? else {
        return Ok(Some(hi));
    };
    while lo < hi {
        let probe = (lo + hi) / 2;
        let mid = seek_start_of_line(file, probe)?;
        let Some(mid_seq) = read_seq_at(file, mid)? else {
            return Ok(Some(hi));
        };
        if seq == mid_seq {
            return Ok(Some(mid));
        }
        if seq > mid_seq {
            lo = match seek_next_line(file, mid)? {
                Some(next) => next,
                None => return Ok(Some(hi)),
            };
        } else {
            hi = mid;
        }
    }
    Ok(Some(hi))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn collect(iter: impl Iterator<Item = Result<(i64, Bytes)>>) -> Vec<(i64, Vec<u8>)> {
        iter.map(|r| {
            let (seq, payload) = r.unwrap();
            (seq, payload.to_vec())
        })
        .collect()
    }

    #[test]
    fn append_and_read_back() {
        let dir = TempDir::new().unwrap();
        let log = DataLog::new(dir.path()).unwrap();

        assert_eq!(log.append(b"first item", None).unwrap().0, 0);
        assert_eq!(log.append(b"second item", None).unwrap().0, 1);

        assert_eq!(log.first().unwrap(), Some(0));
        assert_eq!(log.last().unwrap(), Some(1));
        assert_eq!(log.get(0).unwrap().as_ref(), b"first item");
        assert_eq!(log.get(1).unwrap().as_ref(), b"second item");
        assert!(matches!(log.get(2), Err(StorageError::NoSuchSeq(2))));
    }

    #[test]
    fn payloads_with_newlines_and_backslashes_survive() {
        let dir = TempDir::new().unwrap();
        let log = DataLog::new(dir.path()).unwrap();

        let nasty: &[&[u8]] = &[b"line1\nline2", b"back\\slash", b"\\n literal", b"\n\n\\\\\n"];
        for payload in nasty {
            log.append(payload, None).unwrap();
        }
        for (i, payload) in nasty.iter().enumerate() {
            assert_eq!(log.get(i as i64).unwrap().as_ref(), *payload);
        }
        // One record per line regardless of payload content.
        assert_eq!(collect(log.iter(None).unwrap()).len(), nasty.len());
    }

    #[test]
    fn explicit_seq_seeds_a_base_then_clamps() {
        let dir = TempDir::new().unwrap();
        let log = DataLog::new(dir.path()).unwrap();

        assert_eq!(log.append(b"a", Some(5000)).unwrap().0, 5000);
        // Gaps down are clamped back to increasing.
        assert_eq!(log.append(b"b", Some(10)).unwrap().0, 5001);
        assert_eq!(log.append(b"c", Some(6000)).unwrap().0, 6000);
        assert_eq!(
            collect(log.iter(None).unwrap())
                .iter()
                .map(|(s, _)| *s)
                .collect::<Vec<_>>(),
            vec![5000, 5001, 6000]
        );
    }

    #[test]
    fn segments_rotate_at_the_size_limit() {
        let dir = TempDir::new().unwrap();
        let log = DataLog::with_segment_limit(dir.path(), 64).unwrap();

        for i in 0..20 {
            log.append(format!("payload number {i}").as_bytes(), None)
                .unwrap();
        }
        assert!(log.segment_count().unwrap() > 1);
        for i in 0..20 {
            assert_eq!(
                log.get(i).unwrap().as_ref(),
                format!("payload number {i}").as_bytes()
            );
        }
    }

    #[test]
    fn hundred_records_across_segments_iterate_both_ways() {
        let dir = TempDir::new().unwrap();
        let log = DataLog::with_segment_limit(dir.path(), 256).unwrap();

        let payloads: Vec<Vec<u8>> = (0..100)
            .map(|i| {
                // Varying sizes so the limit is crossed several times.
                format!("{i}:").into_bytes().repeat(i % 7 + 1)
            })
            .collect();
        for p in &payloads {
            log.append(p, None).unwrap();
        }

        for (i, p) in payloads.iter().enumerate() {
            assert_eq!(log.get(i as i64).unwrap().as_ref(), &p[..], "record {i}");
        }
        for k in [0i64, 1, 37, 63, 99] {
            let forward = collect(log.iter(Some(k)).unwrap());
            assert_eq!(
                forward.iter().map(|(s, _)| *s).collect::<Vec<_>>(),
                (k..100).collect::<Vec<_>>()
            );
            let backward = collect(log.iter_rev(Some(k)).unwrap());
            assert_eq!(
                backward.iter().map(|(s, _)| *s).collect::<Vec<_>>(),
                (0..=k).rev().collect::<Vec<_>>()
            );
        }
    }

    #[test]
    fn torn_trailing_record_is_skipped() {
        let dir = TempDir::new().unwrap();
        let log = DataLog::new(dir.path()).unwrap();
        log.append(b"whole", None).unwrap();

        // Simulate a crash mid-write: an unterminated record at the tail.
        let path = dir.path().join("data.0");
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"1 torn-no-newline").unwrap();
        drop(file);

        assert_eq!(log.last().unwrap(), Some(0));
        assert_eq!(collect(log.iter(None).unwrap()), vec![(0, b"whole".to_vec())]);
        // The next append reuses the torn record's sequence number.
        assert_eq!(log.append(b"next", None).unwrap().0, 1);
        assert_eq!(log.get(1).unwrap().as_ref(), b"next");
    }

    #[test]
    fn truncate_removes_whole_segments_only() {
        let dir = TempDir::new().unwrap();
        let log = DataLog::with_segment_limit(dir.path(), 32).unwrap();
        for i in 0..12 {
            log.append(format!("record {i} padded out").as_bytes(), None)
                .unwrap();
        }
        let before = log.segment_count().unwrap();
        assert!(before >= 3);

        log.truncate(6).unwrap();
        let first = log.first().unwrap().unwrap();
        // Nothing at or above the cutoff was lost.
        assert!(first <= 6);
        for i in first..12 {
            log.get(i).unwrap();
        }
        assert!(log.segment_count().unwrap() < before);

        log.truncate(i64::MAX).unwrap();
        assert_eq!(log.first().unwrap(), None);
    }

    #[test]
    fn clear_empties_the_log() {
        let dir = TempDir::new().unwrap();
        let log = DataLog::new(dir.path()).unwrap();
        log.append(b"x", None).unwrap();
        log.clear().unwrap();
        assert_eq!(log.first().unwrap(), None);
        assert_eq!(log.append(b"y", None).unwrap().0, 0);
    }

    #[test]
    fn reverse_iteration_from_beyond_the_end() {
        let dir = TempDir::new().unwrap();
        let log = DataLog::new(dir.path()).unwrap();
        for i in 0..5 {
            log.append(format!("{i}").as_bytes(), None).unwrap();
        }
        let seqs: Vec<i64> = collect(log.iter_rev(Some(100)).unwrap())
            .iter()
            .map(|(s, _)| *s)
            .collect();
        assert_eq!(seqs, vec![4, 3, 2, 1, 0]);
    }

    #[test]
    fn iteration_from_a_gap_starts_at_the_successor() {
        let dir = TempDir::new().unwrap();
        let log = DataLog::new(dir.path()).unwrap();
        log.append(b"a", Some(10)).unwrap();
        log.append(b"b", Some(20)).unwrap();
        log.append(b"c", Some(30)).unwrap();

        let fwd: Vec<i64> = collect(log.iter(Some(15)).unwrap())
            .iter()
            .map(|(s, _)| *s)
            .collect();
        assert_eq!(fwd, vec![20, 30]);

        let rev: Vec<i64> = collect(log.iter_rev(Some(25)).unwrap())
            .iter()
            .map(|(s, _)| *s)
            .collect();
        assert_eq!(rev, vec![20, 10]);
    }

    proptest! {
        #[test]
        fn round_trip_arbitrary_payloads(payloads in prop::collection::vec(
            prop::collection::vec(any::<u8>(), 0..200), 1..40)
        ) {
            let dir = TempDir::new().unwrap();
            let log = DataLog::with_segment_limit(dir.path(), 512).unwrap();
            for p in &payloads {
                log.append(p, None).unwrap();
            }
            for (i, p) in payloads.iter().enumerate() {
                let got = log.get(i as i64).unwrap();
                prop_assert_eq!(got.as_ref(), &p[..]);
            }
            let seqs: Vec<i64> = collect(log.iter(None).unwrap()).iter().map(|(s, _)| *s).collect();
            let expected: Vec<i64> = (0..payloads.len() as i64).collect();
            prop_assert_eq!(seqs, expected);
        }

        #[test]
        fn sequence_numbers_are_strictly_monotonic(
            seeds in prop::collection::vec(prop::option::of(0i64..1000), 1..30)
        ) {
            let dir = TempDir::new().unwrap();
            let log = DataLog::new(dir.path()).unwrap();
            let mut written = Vec::new();
            for seed in seeds {
                written.push(log.append(b"x", seed).unwrap().0);
            }
            for pair in written.windows(2) {
                prop_assert!(pair[1] > pair[0]);
            }
        }
    }
}
