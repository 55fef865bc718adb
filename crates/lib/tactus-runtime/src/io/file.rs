//! File I/O adapter.
//!
//! Open flags combine an access mode (`READ | WRITE | READ_WRITE | APPEND`)
//! with a data type (`ASCII | BINARY`); ASCII is the default type and READ
//! the default mode. Binary reads and writes take a width selector
//! (`INT8..INT64`, signed and unsigned variants, `FLOAT32/64`). User faults
//! (no file open, conflicting flags, reads on a directory) are reported and
//! answered with a conservative default — zero for reads, no-op for writes —
//! and never unwind into the VM.
//!
//! In async mode, writes are posted to a worker that performs the operation
//! and then broadcasts the file's own completion event through the VM's
//! event ring.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use crate::object::ObjId;
use crate::vm::EventBufferProducer;

pub const TYPE_ASCII: i64 = 0x1;
pub const TYPE_BINARY: i64 = 0x2;

pub const FLOAT32: i64 = 0x10;
pub const FLOAT64: i64 = 0x20;
pub const INT8: i64 = 0x100;
pub const INT16: i64 = 0x200;
pub const INT24: i64 = 0x400;
pub const INT32: i64 = 0x800;
pub const INT64: i64 = 0x1000;
pub const SINT8: i64 = 0x2000;
pub const SINT16: i64 = 0x4000;
pub const SINT24: i64 = 0x8000;
pub const SINT32: i64 = 0x10000;
pub const SINT64: i64 = 0x20000;
pub const UINT8: i64 = 0x40000;
pub const UINT16: i64 = 0x80000;
pub const UINT24: i64 = 0x100000;
pub const UINT32: i64 = 0x200000;
pub const UINT64: i64 = 0x400000;

pub const FLAG_READONLY: i64 = 0x100;
pub const FLAG_WRITEONLY: i64 = 0x200;
pub const FLAG_READ_WRITE: i64 = 0x400;
pub const FLAG_APPEND: i64 = 0x800;

pub const MODE_SYNC: i64 = 0;
pub const MODE_ASYNC: i64 = 1;

/// A file (or directory) handle plus its async completion event.
pub struct FileIo {
    path: String,
    flags: i64,
    iomode: i64,
    file: Option<File>,
    dir: bool,
    event: ObjId,
    completion: Option<Arc<Mutex<EventBufferProducer>>>,
    pending: Option<mpsc::Receiver<File>>,
}

impl std::fmt::Debug for FileIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileIo")
            .field("path", &self.path)
            .field("flags", &self.flags)
            .field("iomode", &self.iomode)
            .field("dir", &self.dir)
            .field("event", &self.event)
            .field("pending", &self.pending.is_some())
            .finish()
    }
}

impl FileIo {
    pub fn new(event: ObjId) -> Self {
        Self {
            path: String::new(),
            flags: 0,
            iomode: MODE_SYNC,
            file: None,
            dir: false,
            event,
            completion: None,
            pending: None,
        }
    }

    /// The event broadcast when an async operation completes.
    pub fn event(&self) -> ObjId {
        self.event
    }

    /// Install the ring producer async completions are delivered through.
    pub fn set_async_completion(&mut self, producer: EventBufferProducer) {
        self.completion = Some(Arc::new(Mutex::new(producer)));
    }

    pub fn open(&mut self, path: &str, mut flags: i64) -> bool {
        log::info!("FileIO: opening {path}...");

        if flags & (FLAG_READ_WRITE | FLAG_READONLY | FLAG_WRITEONLY | FLAG_APPEND) == 0 {
            flags |= FLAG_READONLY;
        }
        if flags & FLAG_READONLY != 0 && flags & FLAG_WRITEONLY != 0 {
            flags ^= FLAG_READONLY | FLAG_WRITEONLY;
            flags |= FLAG_READ_WRITE;
        }

        let conflict = (flags & TYPE_ASCII != 0 && flags & TYPE_BINARY != 0)
            || (flags & FLAG_READ_WRITE != 0
                && flags & (FLAG_READONLY | FLAG_WRITEONLY | FLAG_APPEND) != 0)
            || (flags & FLAG_APPEND != 0 && flags & FLAG_READONLY != 0);
        if conflict {
            log::error!("FileIO: conflicting open flags ({flags:#x})");
            self.reset();
            return false;
        }

        if self.file.is_some() || self.dir {
            self.close();
        }

        if Path::new(path).is_dir() {
            self.path = path.to_string();
            self.dir = true;
            return true;
        }

        if flags & FLAG_READONLY == 0 && !Path::new(path).exists() {
            if let Err(e) = File::create(path) {
                log::error!("FileIO: cannot create file '{path}': {e}");
                self.reset();
                return false;
            }
        }

        let mut options = std::fs::OpenOptions::new();
        if flags & FLAG_READ_WRITE != 0 {
            options.read(true).write(true);
        } else if flags & FLAG_APPEND != 0 {
            options.append(true);
        } else if flags & FLAG_WRITEONLY != 0 {
            options.write(true).truncate(true);
        } else {
            options.read(true);
        }

        match options.open(path) {
            Ok(file) => {
                self.file = Some(file);
                self.path = path.to_string();
                self.flags = flags;
                if flags & TYPE_BINARY == 0 {
                    self.flags |= TYPE_ASCII;
                }
                self.iomode = MODE_SYNC;
                true
            }
            Err(e) => {
                log::error!("FileIO: cannot open file '{path}': {e}");
                self.reset();
                false
            }
        }
    }

    fn reset(&mut self) {
        self.path = String::new();
        self.flags = 0;
        self.iomode = MODE_SYNC;
        self.file = None;
        self.dir = false;
        self.pending = None;
    }

    pub fn close(&mut self) {
        log::info!("FileIO: closing '{}'...", self.path);
        self.finish_pending(true);
        self.reset();
    }

    pub fn good(&self) -> bool {
        self.dir || self.file.is_some() || self.pending.is_some()
    }

    pub fn mode(&self) -> i64 {
        if self.dir {
            log::error!("FileIO: cannot get mode on directory");
            return -1;
        }
        self.iomode
    }

    pub fn set_mode(&mut self, flag: i64) {
        if self.dir {
            log::error!("FileIO: cannot set mode on directory");
            return;
        }
        if flag != MODE_SYNC && flag != MODE_ASYNC {
            log::error!("FileIO: invalid mode flag");
            return;
        }
        self.iomode = flag;
    }

    pub fn is_dir(&self) -> bool {
        self.dir
    }

    /// Directory entries (excluding `.`/`..`), sorted for determinism.
    pub fn dir_list(&self) -> Vec<String> {
        if !self.dir {
            log::error!("FileIO: cannot get list: no directory open");
            return Vec::new();
        }
        let mut entries: Vec<String> = std::fs::read_dir(&self.path)
            .map(|rd| {
                rd.filter_map(|e| e.ok())
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default();
        entries.sort();
        entries
    }

    /// Collect a finished async operation, restoring the file handle.
    /// `block` waits for the worker; otherwise an operation still in flight
    /// leaves the handle with the worker.
    fn finish_pending(&mut self, block: bool) {
        let Some(rx) = &self.pending else {
            return;
        };
        let result = if block { rx.recv().ok() } else { rx.try_recv().ok() };
        if let Some(file) = result {
            self.file = Some(file);
            self.pending = None;
        } else if block {
            self.pending = None;
        }
    }

    fn file_for_io(&mut self, what: &str) -> Option<&mut File> {
        self.finish_pending(false);
        if self.dir {
            log::error!("FileIO: cannot {what} on directory");
            return None;
        }
        if self.pending.is_some() {
            log::error!("FileIO: cannot {what}: async operation in flight");
            return None;
        }
        if self.file.is_none() {
            log::error!("FileIO: cannot {what}: no file open");
        }
        self.file.as_mut()
    }

    pub fn size(&mut self) -> i64 {
        if self.dir {
            log::error!("FileIO: cannot get size on a directory");
            return -1;
        }
        self.finish_pending(false);
        match &self.file {
            Some(f) => f.metadata().map(|m| m.len() as i64).unwrap_or(-1),
            None => -1,
        }
    }

    pub fn seek(&mut self, pos: i64) {
        let Some(file) = self.file_for_io("seek") else {
            return;
        };
        if let Err(e) = file.seek(SeekFrom::Start(pos.max(0) as u64)) {
            log::error!("FileIO: cannot seek: {e}");
        }
    }

    pub fn tell(&mut self) -> i64 {
        let Some(file) = self.file_for_io("tell") else {
            return -1;
        };
        file.stream_position().map(|p| p as i64).unwrap_or(-1)
    }

    pub fn eof(&mut self) -> bool {
        if self.dir {
            log::error!("FileIO: cannot check eof on directory");
            return true;
        }
        self.finish_pending(false);
        let Some(file) = self.file.as_mut() else {
            return true;
        };
        let mut probe = [0u8; 1];
        match file.read(&mut probe) {
            Ok(0) => true,
            Ok(_) => {
                let _ = file.seek(SeekFrom::Current(-1));
                false
            }
            Err(_) => true,
        }
    }

    fn read_byte(file: &mut File) -> Option<u8> {
        let mut b = [0u8; 1];
        match file.read(&mut b) {
            Ok(1) => Some(b[0]),
            _ => None,
        }
    }

    /// Next whitespace-delimited token; the terminating delimiter is left in
    /// the stream.
    fn read_token(file: &mut File) -> Option<String> {
        let mut token = String::new();
        loop {
            match Self::read_byte(file) {
                Some(b) if (b as char).is_ascii_whitespace() => {
                    if !token.is_empty() {
                        let _ = file.seek(SeekFrom::Current(-1));
                        break;
                    }
                }
                Some(b) => token.push(b as char),
                None => break,
            }
        }
        if token.is_empty() {
            None
        } else {
            Some(token)
        }
    }

    pub fn read_line(&mut self) -> String {
        let Some(file) = self.file_for_io("readLine") else {
            return String::new();
        };
        let mut line = String::new();
        loop {
            match Self::read_byte(file) {
                Some(b'\n') | None => break,
                Some(b) => line.push(b as char),
            }
        }
        line
    }

    fn read_exact_bytes(file: &mut File, n: usize, what: &str) -> Option<[u8; 8]> {
        let mut buf = [0u8; 8];
        match file.read_exact(&mut buf[..n]) {
            Ok(()) => Some(buf),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                log::error!("FileIO: cannot {what}: not enough bytes left");
                None
            }
            Err(e) => {
                log::error!("FileIO: cannot {what}: {e}");
                None
            }
        }
    }

    /// Read the next integer. ASCII mode parses a token; binary mode reads
    /// the width selected by `flags`. 64-bit reads consume 8 bytes.
    pub fn read_int(&mut self, flags: i64) -> i64 {
        let type_flags = self.flags;
        let Some(file) = self.file_for_io("readInt") else {
            return 0;
        };
        if type_flags & TYPE_ASCII != 0 {
            return Self::read_token(file)
                .and_then(|t| t.parse::<i64>().ok())
                .unwrap_or(0);
        }
        if type_flags & TYPE_BINARY == 0 {
            log::error!("FileIO: readInt error: invalid ASCII/binary flag");
            return 0;
        }
        let read = |file: &mut File, n: usize| Self::read_exact_bytes(file, n, "readInt");
        if flags & (INT8 | UINT8) != 0 {
            read(file, 1).map_or(0, |b| b[0] as i64)
        } else if flags & (INT16 | UINT16) != 0 {
            read(file, 2).map_or(0, |b| u16::from_le_bytes([b[0], b[1]]) as i64)
        } else if flags & (INT24 | UINT24) != 0 {
            read(file, 3).map_or(0, |b| u32::from_le_bytes([b[0], b[1], b[2], 0]) as i64)
        } else if flags & (INT32 | UINT32) != 0 {
            read(file, 4).map_or(0, |b| {
                u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as i64
            })
        } else if flags & (INT64 | UINT64) != 0 {
            read(file, 8).map_or(0, |b| u64::from_le_bytes(b) as i64)
        } else if flags & SINT8 != 0 {
            read(file, 1).map_or(0, |b| b[0] as i8 as i64)
        } else if flags & SINT16 != 0 {
            read(file, 2).map_or(0, |b| i16::from_le_bytes([b[0], b[1]]) as i64)
        } else if flags & SINT24 != 0 {
            read(file, 3).map_or(0, |b| {
                let raw = i32::from_le_bytes([b[0], b[1], b[2], 0]);
                ((raw << 8) >> 8) as i64
            })
        } else if flags & SINT32 != 0 {
            read(file, 4).map_or(0, |b| {
                i32::from_le_bytes([b[0], b[1], b[2], b[3]]) as i64
            })
        } else if flags & SINT64 != 0 {
            read(file, 8).map_or(0, |b| i64::from_le_bytes(b))
        } else {
            log::error!("FileIO: readInt error: invalid/unsupported int size flag");
            0
        }
    }

    /// Read the next float; ASCII parses a token, binary reads the width
    /// selected by `flags` (FLOAT32 by default).
    pub fn read_float(&mut self, flags: i64) -> f64 {
        let type_flags = self.flags;
        let Some(file) = self.file_for_io("readFloat") else {
            return 0.0;
        };
        if type_flags & TYPE_ASCII != 0 {
            return Self::read_token(file)
                .and_then(|t| t.parse::<f64>().ok())
                .unwrap_or(0.0);
        }
        if type_flags & TYPE_BINARY == 0 {
            log::error!("FileIO: readFloat error: invalid ASCII/binary flag");
            return 0.0;
        }
        if flags & FLOAT64 != 0 {
            Self::read_exact_bytes(file, 8, "readFloat").map_or(0.0, f64::from_le_bytes)
        } else if flags & FLOAT32 != 0 {
            Self::read_exact_bytes(file, 4, "readFloat")
                .map_or(0.0, |b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64)
        } else {
            log::error!("FileIO: readFloat error: invalid/unsupported datatype size flag");
            0.0
        }
    }

    /// Read the next whitespace-delimited word (ASCII mode only).
    pub fn read_string(&mut self) -> Option<String> {
        let type_flags = self.flags;
        let Some(file) = self.file_for_io("readString") else {
            return None;
        };
        if type_flags & TYPE_ASCII != 0 {
            Self::read_token(file)
        } else {
            log::error!("FileIO: readString not supported for binary mode");
            None
        }
    }

    fn dispatch_write(&mut self, bytes: Vec<u8>, what: &str) {
        if self.iomode == MODE_ASYNC {
            self.spawn_async_write(bytes, what);
            return;
        }
        let Some(file) = self.file_for_io(what) else {
            return;
        };
        if let Err(e) = file.write_all(&bytes) {
            log::error!("FileIO: cannot {what}: {e}");
        }
    }

    fn spawn_async_write(&mut self, bytes: Vec<u8>, what: &str) {
        self.finish_pending(false);
        if self.pending.is_some() {
            log::error!("FileIO: cannot {what}: async operation in flight");
            return;
        }
        let Some(mut file) = self.file.take() else {
            log::error!("FileIO: cannot {what}: no file open");
            return;
        };
        let (tx, rx) = mpsc::channel();
        self.pending = Some(rx);
        let completion = self.completion.clone();
        let event = self.event;
        std::thread::spawn(move || {
            if let Err(e) = file.write_all(&bytes) {
                log::error!("FileIO: async write failed: {e}");
            }
            let _ = file.flush();
            let _ = tx.send(file);
            if let Some(completion) = completion {
                completion
                    .lock()
                    .expect("completion producer poisoned")
                    .queue_event(event, 1);
            }
        });
    }

    pub fn write_str(&mut self, s: &str) {
        self.dispatch_write(s.as_bytes().to_vec(), "write");
    }

    pub fn write_int(&mut self, v: i64) {
        if self.flags & TYPE_ASCII != 0 {
            self.dispatch_write(v.to_string().into_bytes(), "write");
        } else {
            self.dispatch_write(v.to_le_bytes().to_vec(), "write");
        }
    }

    /// Binary-mode integer write with an explicit width selector.
    pub fn write_int_width(&mut self, v: i64, flags: i64) {
        if self.flags & TYPE_ASCII != 0 {
            self.dispatch_write(v.to_string().into_bytes(), "write");
            return;
        }
        let bytes: Vec<u8> = if flags & (INT8 | UINT8 | SINT8) != 0 {
            vec![v as u8]
        } else if flags & (INT16 | UINT16 | SINT16) != 0 {
            (v as u16).to_le_bytes().to_vec()
        } else if flags & (INT24 | UINT24 | SINT24) != 0 {
            (v as u32).to_le_bytes()[..3].to_vec()
        } else if flags & (INT32 | UINT32 | SINT32) != 0 {
            (v as u32).to_le_bytes().to_vec()
        } else if flags & (INT64 | UINT64 | SINT64) != 0 {
            v.to_le_bytes().to_vec()
        } else {
            log::error!("FileIO: write error: invalid/unsupported int size flag");
            return;
        };
        self.dispatch_write(bytes, "write");
    }

    pub fn write_float(&mut self, v: f64) {
        self.write_float_width(v, FLOAT64);
    }

    pub fn write_float_width(&mut self, v: f64, flags: i64) {
        if self.flags & TYPE_ASCII != 0 {
            self.dispatch_write(v.to_string().into_bytes(), "write");
            return;
        }
        let bytes: Vec<u8> = if flags & FLOAT32 != 0 {
            (v as f32).to_le_bytes().to_vec()
        } else if flags & FLOAT64 != 0 {
            v.to_le_bytes().to_vec()
        } else {
            log::error!("FileIO: write error: invalid/unsupported datatype size flag");
            return;
        };
        self.dispatch_write(bytes, "write");
    }

    pub fn flush(&mut self) {
        if self.dir {
            log::error!("FileIO: cannot flush on directory");
            return;
        }
        self.finish_pending(false);
        if let Some(file) = self.file.as_mut() {
            if let Err(e) = file.flush() {
                log::error!("FileIO: cannot flush: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectStore;

    fn file_in(store: &mut ObjectStore) -> crate::object::ObjId {
        let id = store.new_file();
        store.retain(id);
        id
    }

    #[test]
    fn missing_flags_default_to_read_ascii() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, "42 3.5 word").unwrap();
        let mut store = ObjectStore::new();
        let id = file_in(&mut store);
        let f = store.file_mut(id);
        assert!(f.open(path.to_str().unwrap(), 0));
        assert_eq!(f.read_int(0), 42);
        assert_eq!(f.read_float(0), 3.5);
        assert_eq!(f.read_string().as_deref(), Some("word"));
        assert!(f.eof());
        store.release(id);
    }

    #[test]
    fn conflicting_flags_refused() {
        let mut store = ObjectStore::new();
        let id = file_in(&mut store);
        let f = store.file_mut(id);
        assert!(!f.open("/tmp/whatever", TYPE_ASCII | TYPE_BINARY | FLAG_READONLY));
        assert!(!f.open("/tmp/whatever", FLAG_READ_WRITE | FLAG_APPEND));
        assert!(!f.good());
        store.release(id);
    }

    #[test]
    fn binary_roundtrip_every_width() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b.bin");
        let path = path.to_str().unwrap();
        let mut store = ObjectStore::new();
        let id = file_in(&mut store);

        let f = store.file_mut(id);
        assert!(f.open(path, FLAG_WRITEONLY | TYPE_BINARY));
        f.write_int_width(0x7f, INT8);
        f.write_int_width(-2, SINT8);
        f.write_int_width(40_000, UINT16);
        f.write_int_width(-300, SINT16);
        f.write_int_width(0x123456, INT24);
        f.write_int_width(-(1 << 20), SINT24);
        f.write_int_width(3_000_000_000, UINT32);
        f.write_int_width(-70_000, SINT32);
        f.write_int_width(1 << 40, INT64);
        f.write_int_width(-(1 << 40), SINT64);
        f.write_float_width(1.5, FLOAT32);
        f.write_float_width(-2.25, FLOAT64);
        f.close();

        let f = store.file_mut(id);
        assert!(f.open(path, FLAG_READONLY | TYPE_BINARY));
        assert_eq!(f.read_int(INT8), 0x7f);
        assert_eq!(f.read_int(SINT8), -2);
        assert_eq!(f.read_int(UINT16), 40_000);
        assert_eq!(f.read_int(SINT16), -300);
        assert_eq!(f.read_int(INT24), 0x123456);
        assert_eq!(f.read_int(SINT24), -(1 << 20));
        assert_eq!(f.read_int(UINT32), 3_000_000_000);
        assert_eq!(f.read_int(SINT32), -70_000);
        assert_eq!(f.read_int(INT64), 1 << 40);
        assert_eq!(f.read_int(SINT64), -(1 << 40));
        assert_eq!(f.read_float(FLOAT32), 1.5);
        assert_eq!(f.read_float(FLOAT64), -2.25);
        assert!(f.eof());
        store.release(id);
    }

    #[test]
    fn seek_tell_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.bin");
        let path = path.to_str().unwrap();
        let mut store = ObjectStore::new();
        let id = file_in(&mut store);
        let f = store.file_mut(id);
        assert!(f.open(path, FLAG_WRITEONLY | TYPE_BINARY));
        f.write_str("abcdef");
        f.close();
        assert!(f.open(path, FLAG_READONLY | TYPE_BINARY));
        assert_eq!(f.size(), 6);
        f.seek(4);
        assert_eq!(f.tell(), 4);
        assert_eq!(f.read_int(INT8), b'e' as i64);
        store.release(id);
    }

    #[test]
    fn reads_on_closed_file_default_to_zero() {
        let mut store = ObjectStore::new();
        let id = file_in(&mut store);
        let f = store.file_mut(id);
        assert_eq!(f.read_int(INT32), 0);
        assert_eq!(f.read_float(FLOAT32), 0.0);
        assert_eq!(f.read_line(), "");
        assert!(f.eof());
        store.release(id);
    }

    #[test]
    fn directory_listing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("x"), "").unwrap();
        std::fs::write(dir.path().join("y"), "").unwrap();
        let mut store = ObjectStore::new();
        let id = file_in(&mut store);
        let f = store.file_mut(id);
        assert!(f.open(dir.path().to_str().unwrap(), 0));
        assert!(f.is_dir());
        assert_eq!(f.dir_list(), vec!["x".to_string(), "y".to_string()]);
        assert_eq!(f.read_int(0), 0);
        store.release(id);
    }
}
