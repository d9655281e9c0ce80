//! Storage abstraction — the engine's only window onto the filesystem.
//!
//! Tablet data may live on local disk, a distributed filesystem, or behind
//! an SSD block cache; the engine is agnostic. Everything it needs is the
//! small, object-safe surface defined here: open files for sequential,
//! random-access, or append-style writing, list a directory, delete and
//! rename files, hold an advisory lock on the tablet directory.
//!
//! Env calls are treated as potentially slow and remote: the engine never
//! holds its global mutex across one.
//!
//! [`LocalEnv`] is the default implementation over `std::fs`, using
//! `memmap2` for random-access reads.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::Mmap;

/// Shared handle to a storage backend.
pub type EnvRef = Arc<dyn Env>;

// ------------------------------------------------------------------------------------------------
// File traits
// ------------------------------------------------------------------------------------------------

/// A file read from front to back (WAL and manifest replay).
pub trait SequentialFile: Send {
    /// Reads up to `buf.len()` bytes, returning the count read (0 at EOF).
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// A file supporting positional reads (SSTable access).
pub trait RandomAccessFile: Send + Sync {
    /// Reads exactly `len` bytes starting at `offset`.
    fn read_at(&self, offset: u64, len: usize) -> io::Result<Vec<u8>>;

    /// Total file length in bytes.
    fn len(&self) -> u64;

    /// True for zero-length files.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An append-only writable file (logs, table outputs).
pub trait WritableFile: Send {
    /// Appends `data` at the current end of file.
    fn append(&mut self, data: &[u8]) -> io::Result<()>;

    /// Forces buffered data and metadata to stable storage.
    fn sync(&mut self) -> io::Result<()>;
}

/// An advisory lock on a tablet directory; released on drop.
pub trait FileLock: Send {}

// ------------------------------------------------------------------------------------------------
// Env trait
// ------------------------------------------------------------------------------------------------

/// The storage backend consumed by the engine.
pub trait Env: Send + Sync {
    /// Opens a file for sequential reading.
    fn new_sequential(&self, path: &Path) -> io::Result<Box<dyn SequentialFile>>;

    /// Opens a file for positional reads.
    fn new_random_access(&self, path: &Path) -> io::Result<Box<dyn RandomAccessFile>>;

    /// Creates (truncating) a file for appending.
    fn new_writable(&self, path: &Path) -> io::Result<Box<dyn WritableFile>>;

    /// Opens an existing file for appending, creating it if absent.
    fn new_appendable(&self, path: &Path) -> io::Result<Box<dyn WritableFile>>;

    /// Lists the file names (not full paths) inside `dir`.
    fn get_children(&self, dir: &Path) -> io::Result<Vec<String>>;

    /// Creates `dir` and any missing parents.
    fn create_dir_all(&self, dir: &Path) -> io::Result<()>;

    /// Removes a file.
    fn delete_file(&self, path: &Path) -> io::Result<()>;

    /// Atomically renames `from` to `to`.
    fn rename_file(&self, from: &Path, to: &Path) -> io::Result<()>;

    /// True if a file or directory exists at `path`.
    fn file_exists(&self, path: &Path) -> bool;

    /// Length of the file at `path` in bytes.
    fn get_file_size(&self, path: &Path) -> io::Result<u64>;

    /// Acquires an advisory lock file; fails if another instance holds it.
    fn lock_file(&self, path: &Path) -> io::Result<Box<dyn FileLock>>;

    /// Fsyncs a directory so renames and creations inside it are durable.
    fn sync_dir(&self, dir: &Path) -> io::Result<()>;
}

// ------------------------------------------------------------------------------------------------
// LocalEnv — std::fs + memmap2
// ------------------------------------------------------------------------------------------------

/// Local-disk storage backend.
#[derive(Debug, Default)]
pub struct LocalEnv;

impl LocalEnv {
    /// Creates a shared local-disk backend.
    pub fn shared() -> EnvRef {
        Arc::new(LocalEnv)
    }
}

struct LocalSequentialFile {
    file: File,
}

impl SequentialFile for LocalSequentialFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

/// Random-access reader backed by a shared mmap of the whole file.
///
/// Tables are immutable once written, so mapping the file once is safe;
/// concurrent readers share the map without locking.
struct LocalRandomAccessFile {
    map: Option<Mmap>,
    len: u64,
}

impl RandomAccessFile for LocalRandomAccessFile {
    fn read_at(&self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let Some(map) = &self.map else {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "read past end of empty file",
            ));
        };
        let start = usize::try_from(offset)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "offset exceeds usize"))?;
        let end = start.checked_add(len).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "offset + len overflows")
        })?;
        if end > map.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("read [{start}, {end}) past end of file ({} bytes)", map.len()),
            ));
        }
        Ok(map[start..end].to_vec())
    }

    fn len(&self) -> u64 {
        self.len
    }
}

struct LocalWritableFile {
    file: File,
}

impl WritableFile for LocalWritableFile {
    fn append(&mut self, data: &[u8]) -> io::Result<()> {
        self.file.write_all(data)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.file.sync_all()
    }
}

struct LocalFileLock {
    path: PathBuf,
}

impl FileLock for LocalFileLock {}

impl Drop for LocalFileLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

impl Env for LocalEnv {
    fn new_sequential(&self, path: &Path) -> io::Result<Box<dyn SequentialFile>> {
        let file = File::open(path)?;
        Ok(Box::new(LocalSequentialFile { file }))
    }

    fn new_random_access(&self, path: &Path) -> io::Result<Box<dyn RandomAccessFile>> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        // mmap of a zero-length file fails on some platforms; model it as
        // an always-EOF reader instead.
        let map = if len == 0 {
            None
        } else {
            // SAFETY: tables and logs opened for random access are never
            // mutated after creation (write-once, rename-into-place).
            Some(unsafe { Mmap::map(&file)? })
        };
        Ok(Box::new(LocalRandomAccessFile { map, len }))
    }

    fn new_writable(&self, path: &Path) -> io::Result<Box<dyn WritableFile>> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Ok(Box::new(LocalWritableFile { file }))
    }

    fn new_appendable(&self, path: &Path) -> io::Result<Box<dyn WritableFile>> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Box::new(LocalWritableFile { file }))
    }

    fn get_children(&self, dir: &Path) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        Ok(names)
    }

    fn create_dir_all(&self, dir: &Path) -> io::Result<()> {
        fs::create_dir_all(dir)
    }

    fn delete_file(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn rename_file(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }

    fn file_exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn get_file_size(&self, path: &Path) -> io::Result<u64> {
        Ok(fs::metadata(path)?.len())
    }

    fn lock_file(&self, path: &Path) -> io::Result<Box<dyn FileLock>> {
        // create_new gives exclusive creation: a second opener fails until
        // the first lock is dropped (which unlinks the file).
        match OpenOptions::new().create_new(true).write(true).open(path) {
            Ok(_) => Ok(Box::new(LocalFileLock {
                path: path.to_path_buf(),
            })),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                format!("lock file {} already held", path.display()),
            )),
            Err(e) => Err(e),
        }
    }

    fn sync_dir(&self, dir: &Path) -> io::Result<()> {
        File::open(dir)?.sync_all()
    }
}

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn writable_then_random_access_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("000001.sst");
        let env = LocalEnv;

        let mut w = env.new_writable(&path).unwrap();
        w.append(b"hello ").unwrap();
        w.append(b"tablet").unwrap();
        w.sync().unwrap();
        drop(w);

        let r = env.new_random_access(&path).unwrap();
        assert_eq!(r.len(), 12);
        assert_eq!(r.read_at(6, 6).unwrap(), b"tablet");
        assert!(r.read_at(10, 10).is_err());
    }

    #[test]
    fn empty_file_random_access() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty");
        let env = LocalEnv;
        env.new_writable(&path).unwrap().sync().unwrap();

        let r = env.new_random_access(&path).unwrap();
        assert!(r.is_empty());
        assert!(r.read_at(0, 1).is_err());
    }

    #[test]
    fn lock_file_is_exclusive() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("LOCK");
        let env = LocalEnv;

        let lock = env.lock_file(&path).unwrap();
        let second = env.lock_file(&path);
        assert!(second.is_err());

        drop(lock);
        // Released on drop — can be re-acquired.
        let _relock = env.lock_file(&path).unwrap();
    }

    #[test]
    fn get_children_lists_names() {
        let dir = TempDir::new().unwrap();
        let env = LocalEnv;
        env.new_writable(&dir.path().join("CURRENT"))
            .unwrap()
            .sync()
            .unwrap();
        env.new_writable(&dir.path().join("000007.log"))
            .unwrap()
            .sync()
            .unwrap();

        let mut names = env.get_children(dir.path()).unwrap();
        names.sort();
        assert_eq!(names, ["000007.log", "CURRENT"]);
    }
}
