//! Append-only JSON-lines files
//!
//! Used for the request log, the status ledger and the approval store.
//! Each record is one line of JSON; records are never rewritten.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

/// An append-only JSON-lines file
#[derive(Debug)]
pub struct JsonLines {
    path: PathBuf,
    file: File,
    fsync: bool,
}

impl JsonLines {
    /// Open (or create) the file for appending
    pub fn open(path: impl Into<PathBuf>, fsync: bool) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| Error::IoWrite {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| Error::IoWrite {
                path: path.clone(),
                source: e,
            })?;

        Ok(Self { path, file, fsync })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record; the record is on disk when this returns
    pub fn append<T: Serialize>(&mut self, record: &T) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        self.file.write_all(&line).map_err(|e| Error::IoWrite {
            path: self.path.clone(),
            source: e,
        })?;
        self.file.flush().map_err(|e| Error::IoWrite {
            path: self.path.clone(),
            source: e,
        })?;
        if self.fsync {
            self.file.sync_data().map_err(|e| Error::IoWrite {
                path: self.path.clone(),
                source: e,
            })?;
        }
        Ok(())
    }

    /// Read every record from `path`. A missing file is an empty log.
    ///
    /// A torn final line (crash mid-append) is skipped; any other unparsable
    /// line is reported as corruption.
    pub fn read_all<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(Error::IoRead {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };

        let lines: Vec<String> = BufReader::new(file)
            .lines()
            .collect::<std::io::Result<_>>()
            .map_err(|e| Error::IoRead {
                path: path.to_path_buf(),
                source: e,
            })?;

        let last = lines.len();
        let mut records = Vec::with_capacity(last);
        for (idx, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(record) => records.push(record),
                Err(e) if idx + 1 == last => {
                    tracing::warn!(
                        path = %path.display(),
                        line = idx + 1,
                        error = %e,
                        "Skipping torn trailing record"
                    );
                }
                Err(e) => {
                    return Err(Error::LedgerCorrupt {
                        path: path.to_path_buf(),
                        line: idx + 1,
                        message: e.to_string(),
                    })
                }
            }
        }
        Ok(records)
    }
}
