use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::Local;

/// # Rotating File
///
/// An append-only log file that rolls over once it would grow past
/// `max_bytes`. On rotation `app.log` becomes `app.log.1`, `app.log.1`
/// becomes `app.log.2` and so on; the oldest backup beyond `backups` is
/// deleted. With `backups == 0` the file is simply truncated.
///
/// Timestamps are added by the `fern` formatter; this type only moves bytes.
pub struct RotatingFile {
    /// The path of the active log file.
    path: PathBuf,
    /// Size threshold that triggers a rotation before the next write.
    max_bytes: u64,
    /// Number of rotated files kept next to the active one.
    backups: usize,
    /// Handle to the active file, opened in append mode.
    file: File,
    /// Bytes currently in the active file.
    written: u64,
}

impl RotatingFile {
    /// Opens (or creates) the log file at `path`, creating parent directories
    /// when needed. Existing content counts toward the size threshold.
    pub fn open(path: impl Into<PathBuf>, max_bytes: u64, backups: usize) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata()?.len();
        Ok(Self {
            path,
            max_bytes: max_bytes.max(1),
            backups,
            file,
            written,
        })
    }

    /// The path of the active log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn backup_path(&self, index: usize) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(format!(".{}", index));
        PathBuf::from(name)
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;

        if self.backups == 0 {
            self.file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&self.path)?;
        } else {
            let oldest = self.backup_path(self.backups);
            if oldest.exists() {
                fs::remove_file(&oldest)?;
            }
            for index in (1..self.backups).rev() {
                let from = self.backup_path(index);
                if from.exists() {
                    fs::rename(&from, self.backup_path(index + 1))?;
                }
            }
            fs::rename(&self.path, self.backup_path(1))?;
            self.file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        }

        self.written = 0;
        let marker = format!(
            "{} log rotated, previous content in {}\n",
            Local::now().format("[%Y-%m-%d %H:%M:%S]"),
            self.backup_path(1).display()
        );
        if self.backups > 0 {
            self.file.write_all(marker.as_bytes())?;
            self.written = marker.len() as u64;
        }
        Ok(())
    }
}

impl Write for RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written > 0 && self.written + buf.len() as u64 > self.max_bytes {
            if let Err(e) = self.rotate() {
                // Keep logging into the current file rather than losing lines.
                eprintln!("Failed to rotate log file {}: {}", self.path.display(), e);
            }
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn read(path: &Path) -> String {
        fs::read_to_string(path).unwrap_or_default()
    }

    #[test]
    fn appends_until_threshold() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("relay.log");
        let mut log = RotatingFile::open(&path, 1024, 2).unwrap();
        writeln!(log, "first").unwrap();
        writeln!(log, "second").unwrap();
        log.flush().unwrap();
        assert_eq!(read(&path), "first\nsecond\n");
        assert!(!dir.path().join("relay.log.1").exists());
    }

    #[test]
    fn rotates_and_caps_backups() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("relay.log");
        let mut log = RotatingFile::open(&path, 100, 2).unwrap();

        for round in 0..4 {
            log.write_all(format!("round-{round}-{}\n", "x".repeat(80)).as_bytes())
                .unwrap();
        }
        log.flush().unwrap();

        assert!(read(&path).contains("round-3"));
        assert!(read(&dir.path().join("relay.log.1")).contains("round-2"));
        assert!(read(&dir.path().join("relay.log.2")).contains("round-1"));
        assert!(!dir.path().join("relay.log.3").exists());
    }

    #[test]
    fn truncates_without_backups() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("relay.log");
        let mut log = RotatingFile::open(&path, 10, 0).unwrap();
        log.write_all(b"0123456789").unwrap();
        log.write_all(b"abc").unwrap();
        log.flush().unwrap();
        assert_eq!(read(&path), "abc");
    }

    #[test]
    fn counts_existing_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("relay.log");
        {
            let mut log = RotatingFile::open(&path, 1000, 1).unwrap();
            log.write_all(&[b'a'; 990]).unwrap();
        }
        let mut log = RotatingFile::open(&path, 1000, 1).unwrap();
        log.write_all(&[b'b'; 20]).unwrap();
        log.flush().unwrap();
        assert_eq!(read(&dir.path().join("nested").join("relay.log.1")).len(), 990);
        assert!(read(&path).ends_with(&"b".repeat(20)));
    }
}
