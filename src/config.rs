use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{ConvertError, Result};

/// Valid constant-rate-factor range accepted for batch encodes.
pub const CRF_RANGE: std::ops::RangeInclusive<u8> = 18..=28;

fn default_grace_period_secs() -> u64 {
    5
}

fn default_diagnostic_lines() -> usize {
    10
}

fn default_workers() -> usize {
    1
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub encoder: EncoderConfig,
    pub batch: BatchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// Path or name of the ffmpeg binary
    pub binary_path: String,
    /// Path or name of the ffprobe binary, used to estimate input duration
    pub probe_path: String,
    /// x264 speed/quality preset
    pub preset: Preset,
    /// Constant rate factor (lower = better quality)
    pub crf: u8,
    pub video_codec: String,
    pub audio_codec: String,
    pub audio_bitrate: String,
    /// Optional scale filter argument, e.g. "-2:720"
    pub scale: Option<String>,
    /// Extra options appended before the progress/output arguments
    /// Example: ["-pix_fmt", "yuv420p"]
    pub extra_options: Vec<String>,
    /// Seconds to wait after a graceful stop request before killing the encoder
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
    /// Number of trailing diagnostic lines kept for failed encodes
    #[serde(default = "default_diagnostic_lines")]
    pub diagnostic_lines: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub input_dir: PathBuf,
    /// Defaults to `<input_dir>/output` when unset
    pub output_dir: Option<PathBuf>,
    /// Input extensions (case-insensitive, without the dot)
    pub input_extensions: Vec<String>,
    pub output_extension: String,
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Skip files whose output already exists with nonzero size
    pub resume: bool,
    /// Discover and list only
    pub dry_run: bool,
    /// Remove inputs after a successful conversion
    pub delete_originals: bool,
    /// Remove partially written outputs of failed conversions
    pub remove_partial_output: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Preset {
    Ultrafast,
    Superfast,
    Veryfast,
    Faster,
    Fast,
    Medium,
    Slow,
    Slower,
    Veryslow,
}

impl Preset {
    pub const ALL: [Preset; 9] = [
        Preset::Ultrafast,
        Preset::Superfast,
        Preset::Veryfast,
        Preset::Faster,
        Preset::Fast,
        Preset::Medium,
        Preset::Slow,
        Preset::Slower,
        Preset::Veryslow,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Preset::Ultrafast => "ultrafast",
            Preset::Superfast => "superfast",
            Preset::Veryfast => "veryfast",
            Preset::Faster => "faster",
            Preset::Fast => "fast",
            Preset::Medium => "medium",
            Preset::Slow => "slow",
            Preset::Slower => "slower",
            Preset::Veryslow => "veryslow",
        }
    }
}

impl fmt::Display for Preset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Preset {
    type Err = ConvertError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_lowercase();
        Preset::ALL
            .into_iter()
            .find(|preset| preset.as_str() == wanted)
            .ok_or_else(|| {
                let valid: Vec<&str> = Preset::ALL.iter().map(|p| p.as_str()).collect();
                ConvertError::Config(format!(
                    "Invalid preset '{}'. Valid presets: {}",
                    s,
                    valid.join(", ")
                ))
            })
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            binary_path: "ffmpeg".to_string(),
            probe_path: "ffprobe".to_string(),
            preset: Preset::Medium,
            crf: 23,
            video_codec: "libx264".to_string(),
            audio_codec: "aac".to_string(),
            audio_bitrate: "128k".to_string(),
            scale: None,
            extra_options: Vec::new(),
            grace_period_secs: default_grace_period_secs(),
            diagnostic_lines: default_diagnostic_lines(),
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::from("."),
            output_dir: None,
            input_extensions: vec!["avi".to_string()],
            output_extension: "mp4".to_string(),
            workers: default_workers(),
            resume: false,
            dry_run: false,
            delete_originals: false,
            remove_partial_output: false,
        }
    }
}

impl BatchConfig {
    pub fn resolved_output_dir(&self) -> PathBuf {
        match &self.output_dir {
            Some(dir) => dir.clone(),
            None => self.input_dir.join("output"),
        }
    }

    /// Whether an input file would map onto itself as its own output.
    pub fn writes_over_inputs(&self) -> bool {
        let output_ext = self.output_extension.trim().trim_start_matches('.');
        let same_extension = self
            .input_extensions
            .iter()
            .any(|ext| ext.trim().trim_start_matches('.').eq_ignore_ascii_case(output_ext));
        if !same_extension {
            return false;
        }
        let output_dir = self.resolved_output_dir();
        if output_dir == self.input_dir {
            return true;
        }
        match (output_dir.canonicalize(), self.input_dir.canonicalize()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConvertError::Config(format!("Failed to read config file: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| ConvertError::Config(format!("Failed to parse config file: {}", e)))
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConvertError::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| ConvertError::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !CRF_RANGE.contains(&self.encoder.crf) {
            return Err(ConvertError::Config(format!(
                "CRF {} is out of range ({}-{})",
                self.encoder.crf,
                CRF_RANGE.start(),
                CRF_RANGE.end()
            )));
        }
        if self.batch.workers == 0 {
            return Err(ConvertError::Config("Worker count must be at least 1".to_string()));
        }
        if self.batch.input_extensions.iter().all(|ext| ext.trim().is_empty()) {
            return Err(ConvertError::Config("No input extensions configured".to_string()));
        }
        if self.batch.output_extension.trim().is_empty() {
            return Err(ConvertError::Config("Output extension must not be empty".to_string()));
        }
        if self.batch.writes_over_inputs() {
            return Err(ConvertError::Config(format!(
                "Output directory {} is the input directory and .{} is an input extension; outputs would replace their inputs",
                self.batch.resolved_output_dir().display(),
                self.batch.output_extension.trim().trim_start_matches('.')
            )));
        }
        for (name, value) in [
            ("video_codec", &self.encoder.video_codec),
            ("audio_codec", &self.encoder.audio_codec),
            ("audio_bitrate", &self.encoder.audio_bitrate),
        ] {
            if value.trim().is_empty() {
                return Err(ConvertError::Config(format!("encoder.{} must not be empty", name)));
            }
        }
        Ok(())
    }
}

/// Normalize a user supplied scale into an ffmpeg `scale=` argument.
///
/// `720p` becomes `-2:720` (keep aspect, even width), `1280x720` becomes
/// `1280:720`, anything else is passed through.
pub fn normalize_scale(value: &str) -> String {
    let value = value.trim();
    if let Some(height) = value.strip_suffix(['p', 'P']) {
        if height.parse::<u32>().is_ok() {
            return format!("-2:{}", height);
        }
    }
    if let Some((w, h)) = value.split_once(['x', 'X']) {
        if w.parse::<i32>().is_ok() && h.parse::<i32>().is_ok() {
            return format!("{}:{}", w, h);
        }
    }
    value.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_encoder_template() {
        let config = Config::default();
        assert_eq!(config.encoder.preset, Preset::Medium);
        assert_eq!(config.encoder.crf, 23);
        assert_eq!(config.encoder.video_codec, "libx264");
        assert_eq!(config.encoder.audio_codec, "aac");
        assert_eq!(config.encoder.audio_bitrate, "128k");
        assert_eq!(config.batch.workers, 1);
        assert!(!config.batch.resume);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_output_dir_is_under_input() {
        let mut batch = BatchConfig::default();
        batch.input_dir = PathBuf::from("/videos");
        assert_eq!(batch.resolved_output_dir(), PathBuf::from("/videos/output"));

        batch.output_dir = Some(PathBuf::from("/elsewhere"));
        assert_eq!(batch.resolved_output_dir(), PathBuf::from("/elsewhere"));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [encoder]
            preset = "slow"
            crf = 20

            [batch]
            workers = 3
            resume = true
            "#,
        )
        .unwrap();

        assert_eq!(config.encoder.preset, Preset::Slow);
        assert_eq!(config.encoder.crf, 20);
        assert_eq!(config.encoder.audio_bitrate, "128k");
        assert_eq!(config.encoder.grace_period_secs, 5);
        assert_eq!(config.batch.workers, 3);
        assert!(config.batch.resume);
        assert_eq!(config.batch.input_extensions, vec!["avi".to_string()]);
    }

    #[test]
    fn test_save_and_load_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recast.toml");

        let mut config = Config::default();
        config.encoder.scale = Some("-2:720".to_string());
        config.batch.workers = 2;
        config.save_to_file(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.encoder.scale.as_deref(), Some("-2:720"));
        assert_eq!(loaded.batch.workers, 2);
    }

    #[test]
    fn test_validate_rejects_out_of_range_crf() {
        let mut config = Config::default();
        config.encoder.crf = 30;
        assert!(matches!(config.validate(), Err(ConvertError::Config(_))));

        config.encoder.crf = 18;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let mut config = Config::default();
        config.batch.workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_outputs_replacing_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.batch.input_dir = dir.path().to_path_buf();
        config.batch.output_dir = Some(dir.path().join("."));
        config.batch.input_extensions = vec!["avi".to_string(), "MP4".to_string()];
        config.batch.output_extension = ".mp4".to_string();
        assert!(config.batch.writes_over_inputs());
        assert!(matches!(config.validate(), Err(ConvertError::Config(_))));

        config.batch.output_extension = "mkv".to_string();
        assert!(config.validate().is_ok());

        config.batch.output_extension = "mp4".to_string();
        config.batch.output_dir = None;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_preset_parsing() {
        assert_eq!("FAST".parse::<Preset>().unwrap(), Preset::Fast);
        assert_eq!(" veryslow ".parse::<Preset>().unwrap(), Preset::Veryslow);
        assert!("turbo".parse::<Preset>().is_err());
    }

    #[test]
    fn test_normalize_scale() {
        assert_eq!(normalize_scale("720p"), "-2:720");
        assert_eq!(normalize_scale("1280x720"), "1280:720");
        assert_eq!(normalize_scale("iw/2:-2"), "iw/2:-2");
    }
}
