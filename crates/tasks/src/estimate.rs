//! Stage time estimates.
//!
//! Lookup table keyed by stage name and input size class, used for the
//! per-step estimated timestamps and the task's humanized total.

use std::time::Duration;

/// Coarse input size classes for the estimate table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeClass {
    Small,
    Medium,
    Large,
}

impl SizeClass {
    /// Classify a unit count (papers, quotes, sections).
    pub fn of(count: usize) -> Self {
        match count {
            0..=4 => SizeClass::Small,
            5..=15 => SizeClass::Medium,
            _ => SizeClass::Large,
        }
    }
}

/// Expected duration of one stage.
pub fn stage_estimate(stage: &str, size: SizeClass) -> Duration {
    let seconds = match (stage, size) {
        ("decompose", _) => 5,
        ("retrieve", SizeClass::Small) => 10,
        ("retrieve", _) => 20,
        ("extract", SizeClass::Small) => 15,
        ("extract", SizeClass::Medium) => 30,
        ("extract", SizeClass::Large) => 60,
        ("plan", _) => 10,
        ("synthesize", SizeClass::Small) => 20,
        ("synthesize", SizeClass::Medium) => 45,
        ("synthesize", SizeClass::Large) => 90,
        _ => 15,
    };
    Duration::from_secs(seconds)
}

/// Total expected runtime, used for the task-level estimate at submission.
pub fn total_estimate(size: SizeClass) -> Duration {
    ["decompose", "retrieve", "extract", "plan", "synthesize"]
        .iter()
        .map(|stage| stage_estimate(stage, size))
        .sum()
}

/// Humanized rendering, e.g. `"~2m 30s"`.
pub fn humanize(duration: Duration) -> String {
    let total = duration.as_secs();
    let minutes = total / 60;
    let seconds = total % 60;
    if minutes == 0 {
        format!("~{seconds}s")
    } else if seconds == 0 {
        format!("~{minutes}m")
    } else {
        format!("~{minutes}m {seconds}s")
    }
}
