//!
//! Replica binlog.
//!
//! Every durable update produces one ASCII record, LF-terminated, fields
//! separated by single spaces. Slice records carry 7 fields
//! (`timestamp data_version op oid block_offset slice_offset slice_length`),
//! block records 5. Records are written per data group by a single thread
//! in strictly increasing `data_version` order; out-of-order arrivals are
//! held back until the gap closes. Segments are numbered files of bounded
//! size; an index file tracks the current write position.
//!


use crate::{
    combine::CombineStats,
    common::{BinlogConfig, BlockKey, BlockSliceKey, SliceRange},
    data_thread::OpKind,
};
use blockwise_core::{now_sec, CondQueue};
use parking_lot::Mutex;
use ruc::*;
use std::{
    collections::BTreeMap,
    fs::{self, File, OpenOptions},
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread,
};

/////////////////////////////////////////////////////////////////////////////
/////////////////////////////////////////////////////////////////////////////

const SLICE_FIELD_COUNT: usize = 7;
const BLOCK_FIELD_COUNT: usize = 5;

const INDEX_FILE_NAME: &str = "binlog.index";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RecordType {
    WriteSlice,
    AllocSlice,
    DelSlice,
    DelBlock,
    NoOp,
}

impl RecordType {
    #[inline(always)]
    pub fn as_char(&self) -> char {
        match self {
            Self::WriteSlice => 'W',
            Self::AllocSlice => 'A',
            Self::DelSlice => 'D',
            Self::DelBlock => 'R',
            Self::NoOp => 'N',
        }
    }

    pub fn from_char(c: char) -> Result<Self> {
        match c {
            'W' => Ok(Self::WriteSlice),
            'A' => Ok(Self::AllocSlice),
            'D' => Ok(Self::DelSlice),
            'R' => Ok(Self::DelBlock),
            'N' => Ok(Self::NoOp),
            _ => Err(eg!(format!("invalid op type: {} (0x{:02x})", c, c as u32))),
        }
    }

    /// Whether records of this type carry the slice fields.
    #[inline(always)]
    pub fn has_slice(&self) -> bool {
        matches!(self, Self::WriteSlice | Self::AllocSlice | Self::DelSlice)
    }
}

/////////////////////////////////////////////////////////////////////////////
/////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BinlogRecord {
    pub timestamp: i64,
    pub data_version: u64,
    pub op_type: RecordType,
    pub block: BlockKey,
    pub slice: Option<SliceRange>,
}

impl BinlogRecord {
    pub fn slice_record(
        timestamp: i64,
        data_version: u64,
        op_type: RecordType,
        bs_key: &BlockSliceKey,
    ) -> Self {
        Self {
            timestamp,
            data_version,
            op_type,
            block: bs_key.block,
            slice: Some(bs_key.slice),
        }
    }

    pub fn block_record(
        timestamp: i64,
        data_version: u64,
        op_type: RecordType,
        block: BlockKey,
    ) -> Self {
        Self {
            timestamp,
            data_version,
            op_type,
            block,
            slice: None,
        }
    }

    /// One LF-terminated line.
    pub fn pack(&self) -> String {
        match self.slice {
            Some(sl) => format!(
                "{} {} {} {} {} {} {}\n",
                self.timestamp,
                self.data_version,
                self.op_type.as_char(),
                self.block.oid,
                self.block.offset,
                sl.offset,
                sl.length,
            ),
            None => format!(
                "{} {} {} {} {}\n",
                self.timestamp,
                self.data_version,
                self.op_type.as_char(),
                self.block.oid,
                self.block.offset,
            ),
        }
    }

    pub fn unpack(line: &str) -> Result<Self> {
        let line = line.trim_end_matches('\n');
        let cols: Vec<&str> = line.split(' ').collect();
        if cols.len() < BLOCK_FIELD_COUNT {
            return Err(eg!(format!(
                "field count: {} < {}",
                cols.len(),
                BLOCK_FIELD_COUNT
            )));
        }

        let mut op_chars = cols[2].chars();
        let op_type = match (op_chars.next(), op_chars.next()) {
            (Some(c), None) => RecordType::from_char(c).c(d!())?,
            _ => return Err(eg!(format!("invalid op type field: {:?}", cols[2]))),
        };

        let expect = if op_type.has_slice() {
            SLICE_FIELD_COUNT
        } else {
            BLOCK_FIELD_COUNT
        };
        if cols.len() != expect {
            return Err(eg!(format!("field count: {} != {}", cols.len(), expect)));
        }

        let timestamp = parse_field::<i64>(cols[0], "timestamp", 0).c(d!())?;
        let data_version = parse_field::<u64>(cols[1], "data version", 1).c(d!())?;
        let oid = parse_field::<u64>(cols[3], "object ID", 1).c(d!())?;
        let offset = parse_field::<u64>(cols[4], "block offset", 0).c(d!())?;

        let slice = if op_type.has_slice() {
            Some(SliceRange {
                offset: parse_field::<u32>(cols[5], "slice offset", 0).c(d!())?,
                length: parse_field::<u32>(cols[6], "slice length", 1).c(d!())?,
            })
        } else {
            None
        };

        Ok(Self {
            timestamp,
            data_version,
            op_type,
            block: BlockKey { oid, offset },
            slice,
        })
    }
}

fn parse_field<T>(s: &str, caption: &str, min: T) -> Result<T>
where
    T: std::str::FromStr + PartialOrd + std::fmt::Display + Copy,
    <T as std::str::FromStr>::Err: std::fmt::Display,
{
    let v = s
        .parse::<T>()
        .map_err(|e| eg!(format!("invalid {}: {:?} ({})", caption, s, e)))?;
    if v < min {
        return Err(eg!(format!("invalid {}: {} < {}", caption, v, min)));
    }
    Ok(v)
}

/////////////////////////////////////////////////////////////////////////////
/////////////////////////////////////////////////////////////////////////////

#[inline(always)]
pub fn segment_path(dir: &Path, index: u32) -> PathBuf {
    dir.join(format!("binlog.{:06}", index))
}

fn index_path(dir: &Path) -> PathBuf {
    dir.join(INDEX_FILE_NAME)
}

fn read_index_file(dir: &Path) -> Result<(u32, u64)> {
    let raw = fs::read_to_string(index_path(dir)).c(d!())?;
    let mut it = raw.split_whitespace();
    let index = it
        .next()
        .ok_or(eg!("empty index file"))?
        .parse::<u32>()
        .c(d!())?;
    let offset = it
        .next()
        .ok_or(eg!("truncated index file"))?
        .parse::<u64>()
        .c(d!())?;
    Ok((index, offset))
}

fn write_index_file(dir: &Path, index: u32, offset: u64) -> Result<()> {
    fs::write(index_path(dir), format!("{} {}\n", index, offset)).c(d!())
}

/// First record of a segment, `None` for an empty file.
pub fn first_record_in(path: &Path) -> Result<Option<BinlogRecord>> {
    let mut reader = BinlogReader::open(path).c(d!())?;
    reader.next_record().c(d!())
}

/// Last record of a segment, `None` for an empty file.
pub fn last_record_in(path: &Path) -> Result<Option<BinlogRecord>> {
    let mut reader = BinlogReader::open(path).c(d!())?;
    let mut last = None;
    while let Some(rec) = reader.next_record().c(d!())? {
        last = Some(rec);
    }
    Ok(last)
}

/// Recover the newest data version of a group by walking segments
/// backwards from the index position.
pub fn last_data_version(dir: &Path) -> Result<u64> {
    let (start, _) = read_index_file(dir).unwrap_or((0, 0));
    let mut idx = start;
    loop {
        let p = segment_path(dir, idx);
        if p.exists() {
            if let Some(rec) = last_record_in(&p).c(d!())? {
                return Ok(rec.data_version);
            }
        }
        if idx == 0 {
            return Ok(0);
        }
        idx -= 1;
    }
}

/////////////////////////////////////////////////////////////////////////////
/////////////////////////////////////////////////////////////////////////////

/// Line-oriented record reader over one segment file.
pub struct BinlogReader {
    lines: std::io::Lines<BufReader<File>>,
    line_no: u64,
}

impl BinlogReader {
    pub fn open(path: &Path) -> Result<Self> {
        let f = File::open(path).c(d!(format!("open {:?}", path)))?;
        Ok(Self {
            lines: BufReader::new(f).lines(),
            line_no: 0,
        })
    }

    /// Next record; a malformed line reports its number.
    pub fn next_record(&mut self) -> Result<Option<BinlogRecord>> {
        loop {
            let Some(line) = self.lines.next() else {
                return Ok(None);
            };
            self.line_no += 1;
            let line = line.c(d!())?;
            if line.is_empty() {
                continue;
            }
            return BinlogRecord::unpack(&line)
                .c(d!(format!("line no: {}", self.line_no)))
                .map(Some);
        }
    }
}

/// Feed every record of a segment to `f`; returns the record count.
pub fn replay_file(path: &Path, mut f: impl FnMut(BinlogRecord)) -> Result<u64> {
    let mut reader = BinlogReader::open(path).c(d!())?;
    let mut count = 0;
    while let Some(rec) = reader.next_record().c(d!())? {
        f(rec);
        count += 1;
    }
    Ok(count)
}

/// Spawn the replica-apply thread for one segment. Records stream to
/// `apply` in file order; a malformed line is fatal for this thread, which
/// logs the chained context and aborts, leaving the join handle poisoned.
/// Returns the applied record count on a clean run.
pub fn spawn_replayer<F>(path: PathBuf, mut apply: F) -> thread::JoinHandle<u64>
where
    F: FnMut(BinlogRecord) + Send + 'static,
{
    pnk!(thread::Builder::new()
        .name("binlog-replay".to_owned())
        .spawn(move || pnk!(replay_file(&path, |rec| apply(rec)))))
}

/////////////////////////////////////////////////////////////////////////////
/////////////////////////////////////////////////////////////////////////////

struct WriterState {
    dir: PathBuf,
    segment_size: u64,
    index: u32,
    offset: u64,
    file: File,
}

impl WriterState {
    fn open(dir: PathBuf, segment_size: u64) -> Result<Self> {
        fs::create_dir_all(&dir).c(d!())?;
        let (index, _) = read_index_file(&dir).unwrap_or((0, 0));
        let path = segment_path(&dir, index);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .c(d!())?;
        let offset = file.metadata().c(d!())?.len();
        write_index_file(&dir, index, offset).c(d!())?;
        Ok(Self {
            dir,
            segment_size,
            index,
            offset,
            file,
        })
    }

    fn append(&mut self, rec: &BinlogRecord) -> Result<()> {
        if self.offset >= self.segment_size {
            self.rotate().c(d!())?;
        }
        let line = rec.pack();
        self.file.write_all(line.as_bytes()).c(d!())?;
        self.offset += line.len() as u64;
        Ok(())
    }

    fn rotate(&mut self) -> Result<()> {
        self.index += 1;
        self.offset = 0;
        let path = segment_path(&self.dir, self.index);
        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .c(d!())?;
        write_index_file(&self.dir, self.index, 0)
    }

    fn finish(&mut self) -> Result<()> {
        self.file.flush().c(d!())?;
        write_index_file(&self.dir, self.index, self.offset)
    }
}

/////////////////////////////////////////////////////////////////////////////
/////////////////////////////////////////////////////////////////////////////

struct GroupBinlog {
    queue: Arc<CondQueue<BinlogRecord>>,
    next_version: Arc<AtomicU64>,
    recovered: u64,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

/// One single-threaded binlog writer per data group.
pub struct BinlogSet {
    groups: Vec<GroupBinlog>,
    base_dir: PathBuf,
    stats: Arc<CombineStats>,
}

impl BinlogSet {
    pub fn new(cfg: &BinlogConfig, group_count: usize, stats: Arc<CombineStats>) -> Result<Self> {
        let mut groups = vec![];
        for id in 0..group_count.max(1) as u32 {
            let dir = cfg.base_dir.join(id.to_string());
            fs::create_dir_all(&dir).c(d!())?;

            let recovered = last_data_version(&dir).c(d!())?;
            let state = WriterState::open(dir, cfg.segment_size).c(d!())?;

            let queue = Arc::new(CondQueue::new(8192));
            let next_version = Arc::new(AtomicU64::new(recovered + 1));
            let errors = Arc::clone(&stats);

            let q = Arc::clone(&queue);
            let nv = Arc::clone(&next_version);
            let handle = thread::Builder::new()
                .name(format!("binlog-writer-{}", id))
                .spawn(move || writer_loop(state, q, nv, errors))
                .c(d!())?;

            groups.push(GroupBinlog {
                queue,
                next_version,
                recovered,
                handle: Mutex::new(Some(handle)),
            });
        }
        Ok(Self {
            groups,
            base_dir: cfg.base_dir.clone(),
            stats,
        })
    }

    /// The data version recovered from disk at startup.
    pub fn recovered_version(&self, group_id: u32) -> u64 {
        self.groups
            .get(group_id as usize)
            .map(|g| g.recovered)
            .unwrap_or(0)
    }

    pub fn group_dir(&self, group_id: u32) -> PathBuf {
        self.base_dir.join(group_id.to_string())
    }

    /// Log a completed update operation. Errors are counted, never
    /// propagated into the data path.
    pub fn append(&self, group_id: u32, data_version: u64, kind: OpKind, bs_key: &BlockSliceKey) {
        let op_type = match kind {
            OpKind::SliceWrite => RecordType::WriteSlice,
            OpKind::SliceAllocate => RecordType::AllocSlice,
            OpKind::SliceDelete => RecordType::DelSlice,
            OpKind::BlockDelete => RecordType::DelBlock,
            OpKind::SliceRead => return,
        };
        let rec = if op_type.has_slice() {
            BinlogRecord::slice_record(now_sec(), data_version, op_type, bs_key)
        } else {
            BinlogRecord::block_record(now_sec(), data_version, op_type, bs_key.block)
        };
        self.push(group_id, rec);
    }

    /// Log a version bump that carries no data change.
    pub fn append_no_op(&self, group_id: u32, data_version: u64, block: BlockKey) {
        self.push(
            group_id,
            BinlogRecord::block_record(now_sec(), data_version, RecordType::NoOp, block),
        );
    }

    fn push(&self, group_id: u32, rec: BinlogRecord) {
        let Some(g) = self.groups.get(group_id as usize) else {
            self.stats.binlog_errors.fetch_add(1, Ordering::AcqRel);
            return;
        };
        if g.queue.push(rec).is_err() {
            self.stats.binlog_errors.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Align the writer with an externally decided version (replica apply).
    pub fn set_next_version(&self, group_id: u32, next: u64) {
        if let Some(g) = self.groups.get(group_id as usize) {
            g.next_version.store(next, Ordering::Release);
        }
    }

    /// Stop the writers; queued records are written out first.
    pub fn shutdown(&self) {
        for g in self.groups.iter() {
            g.queue.shutdown();
        }
        for g in self.groups.iter() {
            if let Some(h) = g.handle.lock().take() {
                let _ = h.join();
            }
        }
    }
}

fn writer_loop(
    mut state: WriterState,
    queue: Arc<CondQueue<BinlogRecord>>,
    next_version: Arc<AtomicU64>,
    stats: Arc<CombineStats>,
) {
    let mut pending: BTreeMap<u64, BinlogRecord> = BTreeMap::new();

    while let Some(rec) = queue.pop() {
        pending.insert(rec.data_version, rec);
        drain_ready(&mut state, &mut pending, &next_version, &stats, false);
    }
    // shutdown: flush the stragglers in version order
    drain_ready(&mut state, &mut pending, &next_version, &stats, true);
    if state.finish().is_err() {
        stats.binlog_errors.fetch_add(1, Ordering::AcqRel);
    }
}

// write every record that is next in version order; with `force`, gaps are
// skipped so nothing is lost at shutdown
fn drain_ready(
    state: &mut WriterState,
    pending: &mut BTreeMap<u64, BinlogRecord>,
    next_version: &AtomicU64,
    stats: &CombineStats,
    force: bool,
) {
    loop {
        let nv = next_version.load(Ordering::Acquire);
        let rec = match pending.remove(&nv) {
            Some(rec) => rec,
            None if force => match pending.pop_first() {
                Some((_, rec)) => rec,
                None => return,
            },
            None => return,
        };
        if state.append(&rec).is_err() {
            stats.binlog_errors.fetch_add(1, Ordering::AcqRel);
        }
        next_version.store(rec.data_version + 1, Ordering::Release);
    }
}
