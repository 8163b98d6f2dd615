//! Ledger storage backends
//!
//! Storage is append-only bytes. One record per line.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

pub trait LedgerStorage: Send + Sync {
    /// Append one record and make it durable before returning
    fn append(&self, record: &[u8]) -> io::Result<()>;

    /// Full stored contents
    fn load(&self) -> io::Result<Vec<u8>>;

    /// Drop a torn tail so the next append starts on a clean line
    fn truncate(&self, len: u64) -> io::Result<()>;

    /// Confirm the medium can take a write right now
    fn probe(&self) -> io::Result<()>;

    fn describe(&self) -> String;
}

// ============================================================================
// FILE STORAGE
// ============================================================================

/// JSON Lines file, fsync'd per record
pub struct FileStorage {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> io::Result<File> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        OpenOptions::new().create(true).append(true).open(&self.path)
    }
}

impl LedgerStorage for FileStorage {
    fn append(&self, record: &[u8]) -> io::Result<()> {
        let mut slot = self.file.lock();
        if slot.is_none() {
            *slot = Some(self.open()?);
        }
        let result = match slot.as_mut() {
            Some(file) => append_line(file, record),
            None => Err(io::Error::new(io::ErrorKind::Other, "ledger file not open")),
        };
        if result.is_err() {
            // Reopen on next append
            *slot = None;
        }
        result
    }

    fn load(&self) -> io::Result<Vec<u8>> {
        match File::open(&self.path) {
            Ok(mut file) => {
                let mut buf = Vec::new();
                file.read_to_end(&mut buf)?;
                Ok(buf)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    fn truncate(&self, len: u64) -> io::Result<()> {
        let mut slot = self.file.lock();
        *slot = None;
        let file = OpenOptions::new().write(true).open(&self.path)?;
        file.set_len(len)?;
        file.sync_all()
    }

    fn probe(&self) -> io::Result<()> {
        let mut slot = self.file.lock();
        if slot.is_none() {
            *slot = Some(self.open()?);
        }
        let result = match slot.as_ref() {
            Some(file) => file.sync_data(),
            None => Err(io::Error::new(io::ErrorKind::Other, "ledger file not open")),
        };
        if result.is_err() {
            *slot = None;
        }
        result
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// What `append_line` needs from the ledger file
trait LineFile: Write {
    fn end(&self) -> io::Result<u64>;
    fn cut(&self, len: u64) -> io::Result<()>;
    fn sync(&self) -> io::Result<()>;
}

impl LineFile for File {
    fn end(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn cut(&self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }

    fn sync(&self) -> io::Result<()> {
        self.sync_data()
    }
}

/// Write one record line. A failed write leaves no fragment behind: the
/// file is cut back to its length before the attempt.
fn append_line<F: LineFile>(file: &mut F, record: &[u8]) -> io::Result<()> {
    let start = file.end()?;
    let result = file
        .write_all(record)
        .and_then(|_| file.write_all(b"\n"))
        .and_then(|_| file.sync());
    if result.is_err() {
        if let Err(e) = file.cut(start) {
            log::error!("Failed to cut ledger back to {} bytes after a failed write: {}", start, e);
        }
    }
    result
}

// ============================================================================
// MEMORY STORAGE
// ============================================================================

/// In-process storage with switchable availability
pub struct MemoryStorage {
    bytes: Mutex<Vec<u8>>,
    available: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::from_bytes(Vec::new())
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Mutex::new(bytes),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the backing medium going away or coming back
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn contents(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }

    fn check(&self) -> io::Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(io::Error::new(io::ErrorKind::Other, "storage offline"))
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl LedgerStorage for MemoryStorage {
    fn append(&self, record: &[u8]) -> io::Result<()> {
        self.check()?;
        let mut bytes = self.bytes.lock();
        bytes.extend_from_slice(record);
        bytes.push(b'\n');
        Ok(())
    }

    fn load(&self) -> io::Result<Vec<u8>> {
        self.check()?;
        Ok(self.bytes.lock().clone())
    }

    fn truncate(&self, len: u64) -> io::Result<()> {
        self.check()?;
        self.bytes.lock().truncate(len as usize);
        Ok(())
    }

    fn probe(&self) -> io::Result<()> {
        self.check()
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_storage_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("nested").join("ledger.jsonl"));

        storage.append(b"{\"a\":1}").unwrap();
        storage.append(b"{\"a\":2}").unwrap();

        let text = String::from_utf8(storage.load().unwrap()).unwrap();
        assert_eq!(text, "{\"a\":1}\n{\"a\":2}\n");
    }

    #[test]
    fn test_file_storage_missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("absent.jsonl"));
        assert!(storage.load().unwrap().is_empty());
    }

    /// Accepts a fixed number of writes, then fails
    struct FlakyFile {
        bytes: std::cell::RefCell<Vec<u8>>,
        writes_left: usize,
    }

    impl Write for FlakyFile {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.writes_left == 0 {
                return Err(io::Error::new(io::ErrorKind::Other, "no space left on device"));
            }
            self.writes_left -= 1;
            self.bytes.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl LineFile for FlakyFile {
        fn end(&self) -> io::Result<u64> {
            Ok(self.bytes.borrow().len() as u64)
        }

        fn cut(&self, len: u64) -> io::Result<()> {
            self.bytes.borrow_mut().truncate(len as usize);
            Ok(())
        }

        fn sync(&self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_failed_newline_leaves_no_fragment() {
        let mut file = FlakyFile {
            bytes: std::cell::RefCell::new(b"{\"a\":1}\n".to_vec()),
            writes_left: 1,
        };
        assert!(append_line(&mut file, b"{\"a\":2}").is_err());
        assert_eq!(file.bytes.borrow().as_slice(), b"{\"a\":1}\n");

        // The retried record lands on its own line
        file.writes_left = 2;
        append_line(&mut file, b"{\"a\":2}").unwrap();
        assert_eq!(file.bytes.borrow().as_slice(), b"{\"a\":1}\n{\"a\":2}\n");
    }

    #[test]
    fn test_memory_storage_offline() {
        let storage = MemoryStorage::new();
        storage.set_available(false);
        assert!(storage.append(b"x").is_err());
        storage.set_available(true);
        assert!(storage.append(b"x").is_ok());
        assert_eq!(storage.contents(), b"x\n".to_vec());
    }
}
