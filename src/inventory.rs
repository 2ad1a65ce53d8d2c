// Discovery of convertible input files.
//
// The inventory owns the input and output directories of a batch. Creating it
// makes sure the output directory exists; discovery then lists the candidate
// files directly inside the input directory in a stable order, excluding the
// ones that cannot be converted instead of failing the whole scan.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{ConvertError, Result};

/// A file accepted for conversion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InputFile {
    pub path: PathBuf,
    pub size: u64,
    pub discovered_at: DateTime<Utc>,
}

impl InputFile {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ExclusionReason {
    Empty,
    Unreadable(String),
}

impl std::fmt::Display for ExclusionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExclusionReason::Empty => f.write_str("file is empty"),
            ExclusionReason::Unreadable(reason) => write!(f, "file is not readable: {}", reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExcludedFile {
    pub path: PathBuf,
    pub reason: ExclusionReason,
}

#[derive(Debug, Clone, Default)]
pub struct Discovery {
    pub files: Vec<InputFile>,
    pub excluded: Vec<ExcludedFile>,
}

impl Discovery {
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}

pub struct FileInventory {
    input_dir: PathBuf,
    output_dir: PathBuf,
    extensions: Vec<String>,
}

impl FileInventory {
    /// Prepare an inventory, creating `output_dir` if it is missing.
    pub fn new<P: AsRef<Path>, Q: AsRef<Path>>(
        input_dir: P,
        output_dir: Q,
        extensions: &[String],
    ) -> Result<Self> {
        let input_dir = input_dir.as_ref().to_path_buf();
        let output_dir = output_dir.as_ref().to_path_buf();

        if !input_dir.is_dir() {
            return Err(ConvertError::InputDirectory {
                path: input_dir,
                reason: "not a directory".to_string(),
            });
        }

        std::fs::create_dir_all(&output_dir).map_err(|source| ConvertError::OutputDirectory {
            path: output_dir.clone(),
            source,
        })?;

        let extensions = extensions
            .iter()
            .map(|ext| ext.trim().trim_start_matches('.').to_lowercase())
            .filter(|ext| !ext.is_empty())
            .collect();

        Ok(Self {
            input_dir,
            output_dir,
            extensions,
        })
    }

    pub fn input_dir(&self) -> &Path {
        &self.input_dir
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn discover(&self) -> Discovery {
        info!("Scanning {} for {:?} files", self.input_dir.display(), self.extensions);

        let mut candidates = Vec::new();
        for entry in WalkDir::new(&self.input_dir).min_depth(1).max_depth(1) {
            match entry {
                Ok(entry) => {
                    if entry.file_type().is_file() && self.matches_extension(entry.path()) {
                        candidates.push(entry.into_path());
                    }
                }
                Err(e) => {
                    warn!("Skipping unreadable directory entry: {}", e);
                }
            }
        }

        candidates.sort_by(|a, b| {
            let a_name = a.file_name().unwrap_or_default().to_string_lossy();
            let b_name = b.file_name().unwrap_or_default().to_string_lossy();
            a_name
                .to_lowercase()
                .cmp(&b_name.to_lowercase())
                .then_with(|| a_name.cmp(&b_name))
        });

        let mut discovery = Discovery::default();
        for path in candidates {
            match inspect(&path) {
                Ok(size) => {
                    debug!("Found {} ({} bytes)", path.display(), size);
                    discovery.files.push(InputFile {
                        path,
                        size,
                        discovered_at: Utc::now(),
                    });
                }
                Err(reason) => {
                    warn!("Excluding {}: {}", path.display(), reason);
                    discovery.excluded.push(ExcludedFile { path, reason });
                }
            }
        }

        info!(
            "Discovered {} convertible files ({} excluded)",
            discovery.files.len(),
            discovery.excluded.len()
        );
        discovery
    }

    fn matches_extension(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| self.extensions.iter().any(|wanted| *wanted == ext.to_lowercase()))
            .unwrap_or(false)
    }
}

/// Size of a candidate, or why it cannot be converted.
fn inspect(path: &Path) -> std::result::Result<u64, ExclusionReason> {
    let metadata =
        std::fs::metadata(path).map_err(|e| ExclusionReason::Unreadable(e.to_string()))?;
    if metadata.len() == 0 {
        return Err(ExclusionReason::Empty);
    }

    let mut probe = [0u8; 1];
    File::open(path)
        .and_then(|mut file| file.read(&mut probe))
        .map_err(|e| ExclusionReason::Unreadable(e.to_string()))?;

    Ok(metadata.len())
}

/// Format a byte count for humans (B, KB, MB, GB).
pub fn format_file_size(size_bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if size_bytes >= GB {
        format!("{:.2} GB", size_bytes as f64 / GB as f64)
    } else if size_bytes >= MB {
        format!("{:.2} MB", size_bytes as f64 / MB as f64)
    } else if size_bytes >= KB {
        format!("{:.2} KB", size_bytes as f64 / KB as f64)
    } else {
        format!("{} B", size_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_fs::prelude::*;
    use assert_fs::TempDir;

    fn avi() -> Vec<String> {
        vec!["avi".to_string()]
    }

    #[test]
    fn test_discover_orders_and_excludes_empty_files() {
        let temp = TempDir::new().unwrap();
        temp.child("b.avi").write_binary(&[1u8; 200]).unwrap();
        temp.child("A.AVI").write_binary(&[1u8; 50]).unwrap();
        temp.child("c.avi").touch().unwrap();
        temp.child("notes.txt").write_str("not a video").unwrap();
        temp.child("nested").create_dir_all().unwrap();
        temp.child("nested/d.avi").write_binary(&[1u8; 10]).unwrap();

        let inventory = FileInventory::new(temp.path(), temp.path().join("output"), &avi()).unwrap();
        let discovery = inventory.discover();

        let names: Vec<String> = discovery.files.iter().map(|f| f.file_name()).collect();
        assert_eq!(names, vec!["A.AVI", "b.avi"]);
        assert_eq!(discovery.files[0].size, 50);
        assert_eq!(discovery.total_size(), 250);

        assert_eq!(discovery.excluded.len(), 1);
        assert!(discovery.excluded[0].path.ends_with("c.avi"));
        assert_eq!(discovery.excluded[0].reason, ExclusionReason::Empty);
    }

    #[test]
    fn test_new_creates_output_directory() {
        let temp = TempDir::new().unwrap();
        let output = temp.path().join("converted").join("mp4");

        let inventory = FileInventory::new(temp.path(), &output, &avi()).unwrap();
        assert!(output.is_dir());
        assert_eq!(inventory.output_dir(), output.as_path());
    }

    #[test]
    fn test_uncreatable_output_directory_is_fatal() {
        let temp = TempDir::new().unwrap();
        temp.child("blocker").write_str("a file, not a directory").unwrap();

        let result = FileInventory::new(temp.path(), temp.path().join("blocker/output"), &avi());
        match result {
            Err(err @ ConvertError::OutputDirectory { .. }) => assert!(err.is_setup_error()),
            other => panic!("expected output directory error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_missing_input_directory_is_fatal() {
        let temp = TempDir::new().unwrap();
        let result = FileInventory::new(temp.path().join("missing"), temp.path().join("out"), &avi());
        assert!(matches!(result, Err(ConvertError::InputDirectory { .. })));
    }

    #[test]
    fn test_extensions_are_normalized() {
        let temp = TempDir::new().unwrap();
        temp.child("clip.MKV").write_binary(&[1u8; 5]).unwrap();
        temp.child("clip.avi").write_binary(&[1u8; 5]).unwrap();

        let extensions = vec![".mkv".to_string(), " ".to_string()];
        let inventory = FileInventory::new(temp.path(), temp.path().join("out"), &extensions).unwrap();
        let discovery = inventory.discover();

        assert_eq!(discovery.files.len(), 1);
        assert_eq!(discovery.files[0].file_name(), "clip.MKV");
    }

    #[test]
    fn test_format_file_size() {
        assert_eq!(format_file_size(512), "512 B");
        assert_eq!(format_file_size(2048), "2.00 KB");
        assert_eq!(format_file_size(50 * 1024 * 1024), "50.00 MB");
        assert_eq!(format_file_size(3 * 1024 * 1024 * 1024), "3.00 GB");
    }
}
