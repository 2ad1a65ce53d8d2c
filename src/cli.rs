use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Convert every matching video file in a directory
    Convert {
        /// Directory containing the input videos [default: current directory]
        #[arg(short, long)]
        input_dir: Option<PathBuf>,

        /// Directory for converted files [default: <input-dir>/output]
        #[arg(short, long)]
        output_dir: Option<PathBuf>,

        /// x264 preset (ultrafast … veryslow)
        #[arg(short, long)]
        preset: Option<String>,

        /// Constant rate factor, 18-28 (lower = better quality)
        #[arg(long)]
        crf: Option<u8>,

        /// Number of files encoded in parallel
        #[arg(short, long)]
        workers: Option<usize>,

        /// List the files that would be converted and exit
        #[arg(long)]
        dry_run: bool,

        /// Delete each original after its conversion succeeded
        #[arg(long)]
        delete_originals: bool,

        /// Skip files whose output already exists
        #[arg(long)]
        resume: bool,

        /// Output scale: 720p, 1280x720 or an ffmpeg scale expression
        #[arg(long)]
        scale: Option<String>,

        /// Remove partial outputs of failed or cancelled conversions
        #[arg(long)]
        remove_partial: bool,
    },

    /// Check that the encoder can be found and print its version
    Check,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convert_flags() {
        let args = Args::parse_from([
            "recast", "-v", "convert", "--input-dir", "/videos", "--crf", "20", "--workers", "2",
            "--resume", "--scale", "720p",
        ]);
        assert!(args.verbose);
        match args.command {
            Commands::Convert {
                input_dir,
                crf,
                workers,
                resume,
                dry_run,
                scale,
                ..
            } => {
                assert_eq!(input_dir, Some(PathBuf::from("/videos")));
                assert_eq!(crf, Some(20));
                assert_eq!(workers, Some(2));
                assert!(resume);
                assert!(!dry_run);
                assert_eq!(scale.as_deref(), Some("720p"));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_global_config_after_subcommand() {
        let args = Args::parse_from(["recast", "check", "--config", "recast.toml"]);
        assert_eq!(args.config, Some(PathBuf::from("recast.toml")));
        assert!(matches!(args.command, Commands::Check));
    }
}
