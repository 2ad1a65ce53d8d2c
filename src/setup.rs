use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::config::Config;
use crate::encoder::Encoder;
use crate::error::Result;

/// Subdirectories of a search directory that may hold bundled encoder binaries.
const BUNDLE_DIRS: [&[&str]; 4] = [&[], &["_internal"], &["ffmpeg"], &["_internal", "ffmpeg"]];

/// Locates the encoder binaries and checks that they can run before a batch
/// starts.
pub struct SetupManager {
    search_dirs: Vec<PathBuf>,
}

impl SetupManager {
    /// Search next to the running executable, then fall back to `PATH`.
    pub fn new() -> Self {
        let search_dirs = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
            .into_iter()
            .collect();
        Self { search_dirs }
    }

    pub fn with_search_dirs(search_dirs: Vec<PathBuf>) -> Self {
        Self { search_dirs }
    }

    /// Replace bare binary names in `config` with bundled copies when present.
    pub fn initialize(&self, config: &mut Config) {
        config.encoder.binary_path = self.resolve_binary(&config.encoder.binary_path);
        config.encoder.probe_path = self.resolve_binary(&config.encoder.probe_path);
        info!(
            "Using encoder {} (probe {})",
            config.encoder.binary_path, config.encoder.probe_path
        );
    }

    /// A configured path is used as is; a bare name is looked up in the
    /// bundle directories and otherwise left for `PATH` resolution.
    pub fn resolve_binary(&self, configured: &str) -> String {
        if is_explicit_path(configured) {
            return configured.to_string();
        }

        let file_name = executable_name(configured);
        for dir in &self.search_dirs {
            for bundle in BUNDLE_DIRS {
                let candidate = bundle
                    .iter()
                    .fold(dir.clone(), |path, part| path.join(part))
                    .join(&file_name);
                if candidate.is_file() {
                    debug!("Found bundled {} at {}", configured, candidate.display());
                    return candidate.to_string_lossy().to_string();
                }
            }
        }

        configured.to_string()
    }

    /// Run the encoder's version check; any error is fatal for the batch.
    pub async fn verify(&self, encoder: &dyn Encoder) -> Result<String> {
        let version = encoder.version().await?;
        info!("Encoder available: version {}", version);
        Ok(version)
    }
}

impl Default for SetupManager {
    fn default() -> Self {
        Self::new()
    }
}

fn is_explicit_path(value: &str) -> bool {
    Path::new(value).components().count() > 1 || Path::new(value).is_absolute()
}

fn executable_name(name: &str) -> String {
    if cfg!(windows) && Path::new(name).extension().is_none() {
        format!("{}.exe", name)
    } else {
        name.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::MockEncoder;
    use crate::error::ConvertError;
    use assert_fs::prelude::*;

    #[test]
    fn test_bare_name_without_bundle_uses_path() {
        let dir = assert_fs::TempDir::new().unwrap();
        let setup = SetupManager::with_search_dirs(vec![dir.path().to_path_buf()]);
        assert_eq!(setup.resolve_binary("ffmpeg"), "ffmpeg");
    }

    #[test]
    fn test_explicit_path_is_kept() {
        let setup = SetupManager::with_search_dirs(Vec::new());
        assert_eq!(setup.resolve_binary("/opt/ffmpeg/bin/ffmpeg"), "/opt/ffmpeg/bin/ffmpeg");
        assert_eq!(setup.resolve_binary("./tools/ffmpeg"), "./tools/ffmpeg");
    }

    #[test]
    fn test_bundled_binary_lookup_order() {
        let dir = assert_fs::TempDir::new().unwrap();
        let name = executable_name("ffprobe");
        dir.child("ffmpeg").create_dir_all().unwrap();
        dir.child("ffmpeg").child(&name).write_str("").unwrap();
        dir.child("_internal/ffmpeg").create_dir_all().unwrap();
        dir.child("_internal/ffmpeg").child(&name).write_str("").unwrap();

        let setup = SetupManager::with_search_dirs(vec![dir.path().to_path_buf()]);
        let expected = dir.path().join("ffmpeg").join(&name);
        assert_eq!(setup.resolve_binary("ffprobe"), expected.to_string_lossy());

        dir.child("_internal").child(&name).write_str("").unwrap();
        let expected = dir.path().join("_internal").join(&name);
        assert_eq!(setup.resolve_binary("ffprobe"), expected.to_string_lossy());
    }

    #[test]
    fn test_initialize_resolves_both_binaries() {
        let dir = assert_fs::TempDir::new().unwrap();
        dir.child(executable_name("ffprobe")).write_str("").unwrap();

        let setup = SetupManager::with_search_dirs(vec![dir.path().to_path_buf()]);
        let mut config = Config::default();
        setup.initialize(&mut config);

        assert_eq!(config.encoder.binary_path, "ffmpeg");
        assert_eq!(
            config.encoder.probe_path,
            dir.path().join(executable_name("ffprobe")).to_string_lossy()
        );
    }

    #[tokio::test]
    async fn test_verify_propagates_missing_encoder() {
        let mut encoder = MockEncoder::new();
        encoder.expect_version().times(1).returning(|| {
            Err(ConvertError::EncoderNotFound {
                path: PathBuf::from("ffmpeg"),
            })
        });

        let err = SetupManager::with_search_dirs(Vec::new())
            .verify(&encoder)
            .await
            .unwrap_err();
        assert!(err.is_setup_error());
    }

    #[tokio::test]
    async fn test_verify_returns_version() {
        let mut encoder = MockEncoder::new();
        encoder
            .expect_version()
            .returning(|| Ok("6.1.1".to_string()));

        let version = SetupManager::with_search_dirs(Vec::new())
            .verify(&encoder)
            .await
            .unwrap();
        assert_eq!(version, "6.1.1");
    }
}
