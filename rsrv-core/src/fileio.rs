//! Per-connection file I/O handle (component C3, spec §4.3).
//!
//! A connection holds at most one open file; opening another implicitly
//! closes the first.

use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Default read length when `CMD_readFile` omits its length parameter
/// (spec §4.3).
pub const DEFAULT_READ_LEN: usize = 32 * 1024;

enum Mode {
    Read(File),
    Write(File),
}

/// The single file handle a connection may hold open at a time.
#[derive(Default)]
pub struct FileHandle {
    mode: Option<Mode>,
}

impl FileHandle {
    pub fn new() -> Self {
        FileHandle { mode: None }
    }

    pub fn is_open(&self) -> bool {
        self.mode.is_some()
    }

    /// `CMD_openFile`: open `path` for reading, closing any existing
    /// handle first.
    pub async fn open_read(&mut self, path: &Path) -> std::io::Result<()> {
        let file = File::open(path).await?;
        self.mode = Some(Mode::Read(file));
        Ok(())
    }

    /// `CMD_createFile`: open `path` for write, truncating it, closing
    /// any existing handle first.
    pub async fn create_write(&mut self, path: &Path) -> std::io::Result<()> {
        let file = File::create(path).await?;
        self.mode = Some(Mode::Write(file));
        Ok(())
    }

    /// `CMD_closeFile`: close any open handle. No error if none is open.
    pub fn close(&mut self) {
        self.mode = None;
    }

    /// `CMD_readFile`: read up to `len` bytes (default [`DEFAULT_READ_LEN`]).
    /// Returns `Err(NotOpen)`-shaped `None` to the caller via
    /// [`crate::wire::ERR_NOT_OPEN`] — callers check [`is_open`] first.
    pub async fn read(&mut self, len: usize) -> std::io::Result<Vec<u8>> {
        let Some(Mode::Read(file)) = &mut self.mode else {
            return Err(std::io::Error::new(std::io::ErrorKind::Other, "not open for read"));
        };
        let mut buf = vec![0u8; len];
        let n = file.read(&mut buf).await?;
        buf.truncate(n);
        Ok(buf)
    }

    /// `CMD_writeFile`: write all of `data`. A short write is reported as
    /// an IO error, matching spec §4.3.
    pub async fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        let Some(Mode::Write(file)) = &mut self.mode else {
            return Err(std::io::Error::new(std::io::ErrorKind::Other, "not open for write"));
        };
        file.write_all(data).await
    }
}

/// `CMD_removeFile`: delete the named path.
pub async fn remove_file(path: &Path) -> std::io::Result<()> {
    tokio::fs::remove_file(path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t");

        let mut handle = FileHandle::new();
        handle.create_write(&path).await.unwrap();
        handle.write(b"ABCD").await.unwrap();
        handle.close();

        handle.open_read(&path).await.unwrap();
        let data = handle.read(DEFAULT_READ_LEN).await.unwrap();
        assert_eq!(data, b"ABCD");
    }

    #[tokio::test]
    async fn opening_new_file_closes_previous_handle() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        tokio::fs::write(&a, b"aaa").await.unwrap();
        tokio::fs::write(&b, b"bbb").await.unwrap();

        let mut handle = FileHandle::new();
        handle.open_read(&a).await.unwrap();
        handle.open_read(&b).await.unwrap();
        let data = handle.read(DEFAULT_READ_LEN).await.unwrap();
        assert_eq!(data, b"bbb");
    }

    #[tokio::test]
    async fn read_without_open_handle_errors() {
        let mut handle = FileHandle::new();
        assert!(handle.read(16).await.is_err());
    }

    #[tokio::test]
    async fn remove_file_deletes_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gone");
        tokio::fs::write(&path, b"x").await.unwrap();
        remove_file(&path).await.unwrap();
        assert!(!path.exists());
    }
}
