use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Inclusive `[start, end]` interval of frames or executions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InclusiveRange {
    pub start: u32,
    pub end: u32,
}

impl InclusiveRange {
    pub fn new(start: u32, end: u32) -> Result<Self, RangeParseError> {
        if end < start {
            return Err(RangeParseError::Reversed { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn single(value: u32) -> Self {
        Self {
            start: value,
            end: value,
        }
    }

    pub fn contains(&self, value: u32) -> bool {
        (self.start..=self.end).contains(&value)
    }
}

impl fmt::Display for InclusiveRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RangeParseError {
    #[error("invalid range bound {0:?}")]
    InvalidBound(String),

    #[error("range end {end} precedes start {start}")]
    Reversed { start: u32, end: u32 },
}

impl FromStr for InclusiveRange {
    type Err = RangeParseError;

    /// Accepts `"10"` or `"10-12"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |bound: &str| {
            bound
                .trim()
                .parse::<u32>()
                .map_err(|_| RangeParseError::InvalidBound(bound.to_string()))
        };
        match s.split_once('-') {
            Some((start, end)) => Self::new(parse(start)?, parse(end)?),
            None => Ok(Self::single(parse(s)?)),
        }
    }
}

/// Settings of one subcapture.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubcaptureConfig {
    /// Directory the capture stream is written to; the analysis artifact lives inside it.
    pub stream_dir: PathBuf,
    pub frames: InclusiveRange,
    /// Executions (counted per frame, starting at 1) gating the range inside its first and last
    /// frame.
    pub executions: Option<InclusiveRange>,
    /// Prune acceleration structure states nothing after the cut point can observe.
    pub optimize: bool,
    /// Load the analysis artifact and restore only what it lists.
    pub use_analysis: bool,
    pub buffer_batch_bytes: u64,
    pub texture_batch_bytes: u64,
    /// Texture footprints are rounded up to this granularity when filling a batch.
    pub texture_footprint_granularity: u64,
    /// Slots of each auxiliary descriptor heap.
    pub aux_heap_capacity: u32,
}

impl Default for SubcaptureConfig {
    fn default() -> Self {
        Self {
            stream_dir: PathBuf::new(),
            frames: InclusiveRange::single(1),
            executions: None,
            optimize: false,
            use_analysis: false,
            buffer_batch_bytes: 1024 * 1024,
            texture_batch_bytes: 16 * 1024 * 1024,
            texture_footprint_granularity: 4096,
            aux_heap_capacity: 256,
        }
    }
}

impl SubcaptureConfig {
    pub fn analysis_path(&self) -> PathBuf {
        analysis_path(&self.stream_dir, self.frames, self.executions)
    }
}

/// `<stream dir name>_analysis_<start>-<end>[_<exec start>-<exec end>].txt`, inside the stream
/// directory.
pub fn analysis_file_name(
    stream_dir: &Path,
    frames: InclusiveRange,
    executions: Option<InclusiveRange>,
) -> String {
    let stem = stream_dir
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut name = format!("{stem}_analysis_{frames}");
    if let Some(executions) = executions {
        name.push_str(&format!("_{executions}"));
    }
    name.push_str(".txt");
    name
}

pub fn analysis_path(
    stream_dir: &Path,
    frames: InclusiveRange,
    executions: Option<InclusiveRange>,
) -> PathBuf {
    stream_dir.join(analysis_file_name(stream_dir, frames, executions))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_frames_and_ranges() {
        assert_eq!("7".parse::<InclusiveRange>().unwrap(), InclusiveRange::single(7));
        assert_eq!(
            "10-12".parse::<InclusiveRange>().unwrap(),
            InclusiveRange { start: 10, end: 12 }
        );
        assert_eq!(
            "12-10".parse::<InclusiveRange>(),
            Err(RangeParseError::Reversed { start: 12, end: 10 })
        );
        assert!(matches!(
            "a-3".parse::<InclusiveRange>(),
            Err(RangeParseError::InvalidBound(_))
        ));
    }

    #[test]
    fn artifact_name_includes_execution_range() {
        let dir = Path::new("/captures/game_2024");
        assert_eq!(
            analysis_file_name(dir, InclusiveRange::new(10, 12).unwrap(), None),
            "game_2024_analysis_10-12.txt"
        );
        assert_eq!(
            analysis_path(dir, InclusiveRange::single(5), Some(InclusiveRange::new(2, 3).unwrap())),
            Path::new("/captures/game_2024/game_2024_analysis_5-5_2-3.txt")
        );
    }

    #[test]
    fn config_defaults_fill_missing_fields() {
        let config: SubcaptureConfig =
            serde_json::from_str(r#"{ "frames": { "start": 3, "end": 4 }, "optimize": true }"#)
                .unwrap();
        assert_eq!(config.frames, InclusiveRange { start: 3, end: 4 });
        assert!(config.optimize);
        assert_eq!(config.buffer_batch_bytes, 1024 * 1024);
        assert_eq!(config.aux_heap_capacity, 256);
    }
}
