use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;

use crate::job::{ConversionTask, EncodeParams};

/// Encoder invocation as data: binary plus argument list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderCommand {
    pub binary_path: String,
    pub args: Vec<String>,
    pub description: String,
}

impl EncoderCommand {
    /// Create a command for `binary_path`
    pub fn new<S1: Into<String>, S2: Into<String>>(binary_path: S1, description: S2) -> Self {
        Self {
            binary_path: binary_path.into(),
            args: Vec::new(),
            description: description.into(),
        }
    }

    /// Add an argument
    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add multiple arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(|s| s.into()));
        self
    }

    /// Add input file
    pub fn input<P: AsRef<Path>>(self, path: P) -> Self {
        self.arg("-i").arg(path.as_ref().to_string_lossy().to_string())
    }

    /// Add output file
    pub fn output<P: AsRef<Path>>(self, path: P) -> Self {
        self.arg(path.as_ref().to_string_lossy().to_string())
    }

    /// Force overwrite output
    pub fn overwrite(self) -> Self {
        self.arg("-y")
    }

    /// Only errors on stderr, no banner or stats line
    pub fn quiet(self) -> Self {
        self.args(["-hide_banner", "-nostats", "-loglevel", "error"])
    }

    /// Set video codec
    pub fn video_codec<S: Into<String>>(self, codec: S) -> Self {
        self.arg("-c:v").arg(codec)
    }

    /// Set audio codec
    pub fn audio_codec<S: Into<String>>(self, codec: S) -> Self {
        self.arg("-c:a").arg(codec)
    }

    /// Set audio bitrate
    pub fn audio_bitrate<S: Into<String>>(self, bitrate: S) -> Self {
        self.arg("-b:a").arg(bitrate)
    }

    /// Set video filter graph
    pub fn video_filter<S: Into<String>>(self, filter: S) -> Self {
        self.arg("-vf").arg(filter)
    }

    /// Machine-readable `key=value` progress on stdout
    pub fn progress_to_stdout(self) -> Self {
        self.arg("-progress").arg("pipe:1")
    }

    /// Build a process with piped stdio that is killed when dropped.
    pub fn to_process(&self) -> Command {
        let mut cmd = Command::new(&self.binary_path);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

/// Builder for the encoder invocations used by a batch
pub struct EncoderCommandBuilder {
    binary_path: String,
    probe_path: String,
}

impl EncoderCommandBuilder {
    /// Builder for the given ffmpeg and ffprobe binaries
    pub fn new<S1: Into<String>, S2: Into<String>>(binary_path: S1, probe_path: S2) -> Self {
        Self {
            binary_path: binary_path.into(),
            probe_path: probe_path.into(),
        }
    }

    /// Build the re-encode command for one task
    pub fn encode(&self, task: &ConversionTask) -> EncoderCommand {
        let params: &EncodeParams = &task.params;
        let mut cmd = EncoderCommand::new(
            &self.binary_path,
            format!("Encode {}", task.input.path.display()),
        )
        .overwrite()
        .quiet()
        .input(&task.input.path)
        .video_codec(&params.video_codec)
        .arg("-preset")
        .arg(params.preset.as_str())
        .arg("-crf")
        .arg(params.crf.to_string());

        if let Some(scale) = &params.scale {
            cmd = cmd.video_filter(format!("scale={}", scale));
        }

        cmd = cmd
            .audio_codec(&params.audio_codec)
            .audio_bitrate(&params.audio_bitrate)
            .arg("-movflags")
            .arg("+faststart");

        for option in &params.extra_options {
            cmd = cmd.arg(option);
        }

        cmd.progress_to_stdout().output(&task.output_path)
    }

    /// Build the duration probe command
    pub fn probe_duration<P: AsRef<Path>>(&self, input: P) -> EncoderCommand {
        EncoderCommand::new(&self.probe_path, "Duration probe")
            .args(["-v", "error", "-show_entries", "format=duration", "-of", "json"])
            .arg(input.as_ref().to_string_lossy().to_string())
    }

    /// Build version check command
    pub fn version_check(&self) -> EncoderCommand {
        EncoderCommand::new(&self.binary_path, "Version check").arg("-version")
    }
}
