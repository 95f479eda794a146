//! File listing and transfer handlers.

use serde::Serialize;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FileError {
    #[error("File does not exist.")]
    NotFound,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct FileEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileDownload {
    pub file_name: String,
    /// Hex-encoded file contents; the controller decodes on its side.
    pub file_data: String,
}

pub fn list_files(directory: &str) -> Result<Vec<FileEntry>, FileError> {
    let mut entries = Vec::new();
    for entry in std::fs::read_dir(directory)? {
        let entry = entry?;
        let kind = if entry.file_type()?.is_dir() {
            "directory"
        } else {
            "file"
        };
        entries.push(FileEntry {
            name: entry.file_name().to_string_lossy().into_owned(),
            kind,
        });
    }
    Ok(entries)
}

pub fn download_file(path: &str) -> Result<FileDownload, FileError> {
    let path = Path::new(path);
    if !path.is_file() {
        return Err(FileError::NotFound);
    }
    let data = std::fs::read(path)?;
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(FileDownload {
        file_name,
        file_data: hex::encode(data),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lists_files_and_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        let mut entries = list_files(dir.path().to_str().unwrap()).unwrap();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "a.txt");
        assert_eq!(entries[0].kind, "file");
        assert_eq!(entries[1].name, "sub");
        assert_eq!(entries[1].kind, "directory");
    }

    #[test]
    fn download_hex_encodes_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.bin");
        std::fs::write(&path, [0xde, 0xad, 0xbe, 0xef]).unwrap();

        let download = download_file(path.to_str().unwrap()).unwrap();
        assert_eq!(download.file_name, "payload.bin");
        assert_eq!(download.file_data, "deadbeef");
    }

    #[test]
    fn missing_file_is_a_typed_failure() {
        assert!(matches!(
            download_file("/no/such/file"),
            Err(FileError::NotFound)
        ));
    }
}
