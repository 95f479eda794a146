//! Read and reset access to the agent's own log file.

use std::fs::OpenOptions;
use std::path::PathBuf;

pub struct LogStore {
    path: PathBuf,
}

impl LogStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn read(&self) -> std::io::Result<String> {
        std::fs::read_to_string(&self.path)
    }

    pub fn clear(&self) -> std::io::Result<()> {
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)
            .map(|_| ())
    }
}
