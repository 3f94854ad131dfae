//! FFmpeg command construction for loudness normalization.
//!
//! The mastering chain matches what the music backend has always applied to
//! cached tracks: rumble filter, light bass and treble shelving, gentle
//! compression, then EBU R128 loudness normalization.

use std::path::{Path, PathBuf};

/// Loudness and encoder targets for the normalization pass.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizeSettings {
    /// Integrated loudness target in LUFS.
    pub target_lufs: f64,
    /// Maximum true peak in dBTP.
    pub true_peak_db: f64,
    /// Loudness range target in LU.
    pub loudness_range: f64,
    /// Output sample rate in Hz.
    pub sample_rate: u32,
    /// Output bitrate passed to `-b:a` (e.g. `"320k"`).
    pub bitrate: String,
}

impl Default for NormalizeSettings {
    fn default() -> Self {
        Self {
            target_lufs: -14.0,
            true_peak_db: -1.0,
            loudness_range: 11.0,
            sample_rate: 48_000,
            bitrate: "320k".to_string(),
        }
    }
}

/// The external program to run and any arguments placed before the
/// generated normalization arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCommand {
    pub program: PathBuf,
    pub base_args: Vec<String>,
}

impl ToolCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            base_args: Vec::new(),
        }
    }

    pub fn with_base_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.base_args = args.into_iter().map(Into::into).collect();
        self
    }
}

impl Default for ToolCommand {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

/// Extension of every normalized artifact.
pub const OUTPUT_EXTENSION: &str = "mp3";

/// Build the `-af` filter graph for the given settings.
pub fn filter_chain(settings: &NormalizeSettings) -> String {
    format!(
        "highpass=f=40,\
         equalizer=f=60:width_type=o:width=2:g=2,\
         equalizer=f=14000:width_type=o:width=2:g=1,\
         compand=attacks=0:points=-80/-80|-15/-15|-0/-0.5|20/-0.1:gain=1,\
         loudnorm=I={}:TP={}:LRA={}",
        settings.target_lufs, settings.true_peak_db, settings.loudness_range
    )
}

/// Build the argument list for one normalization invocation.
///
/// `-nostdin` keeps ffmpeg from waiting on a terminal, `-vn` drops embedded
/// cover art so the output is audio-only.
pub fn build_normalize_args(
    input: &Path,
    output: &Path,
    settings: &NormalizeSettings,
) -> Vec<String> {
    vec![
        "-hide_banner".to_string(),
        "-nostdin".to_string(),
        "-y".to_string(),
        "-i".to_string(),
        input.to_string_lossy().into_owned(),
        "-vn".to_string(),
        "-af".to_string(),
        filter_chain(settings),
        "-ar".to_string(),
        settings.sample_rate.to_string(),
        "-codec:a".to_string(),
        "libmp3lame".to_string(),
        "-b:a".to_string(),
        settings.bitrate.clone(),
        output.to_string_lossy().into_owned(),
    ]
}
