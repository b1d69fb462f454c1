//! Parser for FFmpeg's `-progress` key=value output.

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;

/// A progress snapshot emitted by FFmpeg once per reporting period.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EncodeProgress {
    /// Frames encoded so far.
    pub frame: Option<u64>,
    /// Position in the output timeline.
    pub out_time: Option<Duration>,
    /// Encoding speed relative to realtime (e.g., "3.75x").
    pub speed: Option<String>,
    /// True on the final block, after FFmpeg finished writing.
    pub finished: bool,
}

/// Accumulates `key=value` lines into [`EncodeProgress`] blocks.
///
/// FFmpeg ends every block with a `progress=continue` or `progress=end` line.
#[derive(Debug, Default)]
pub struct ProgressParser {
    current: EncodeProgress,
}

impl ProgressParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one line; returns a snapshot when the line closes a block.
    pub fn feed(&mut self, line: &str) -> Option<EncodeProgress> {
        let (key, value) = line.trim().split_once('=')?;
        let value = value.trim();

        match key {
            "frame" => self.current.frame = value.parse().ok(),
            "out_time" => self.current.out_time = parse_timestamp(value),
            "speed" if value != "N/A" => self.current.speed = Some(value.to_string()),
            "progress" => {
                self.current.finished = value == "end";
                return Some(std::mem::take(&mut self.current));
            }
            _ => {}
        }

        None
    }
}

/// Parses an `HH:MM:SS.ffffff` timestamp.
fn parse_timestamp(value: &str) -> Option<Duration> {
    static TIMESTAMP: OnceLock<Option<Regex>> = OnceLock::new();
    let re = TIMESTAMP
        .get_or_init(|| Regex::new(r"^(\d+):([0-5]\d):([0-5]\d(?:\.\d+)?)$").ok())
        .as_ref()?;

    let caps = re.captures(value)?;
    let hours: u64 = caps[1].parse().ok()?;
    let minutes: u64 = caps[2].parse().ok()?;
    let seconds: f64 = caps[3].parse().ok()?;

    Some(Duration::from_secs(hours * 3600 + minutes * 60) + Duration::from_secs_f64(seconds))
}
