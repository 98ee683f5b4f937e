use serde::{Deserialize, Serialize};
use std::fmt;

/// Finite, ordered priority classes. Variant order is declaration order (highest first) and
/// backs both `Ord`/`PartialOrd` and the numeric `repr` used on the wire.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[repr(u8)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical = 0,
    High = 1,
    Medium = 2,
    Low = 3,
}

impl Priority {
    /// All classes, highest first — the deterministic ordering §3 requires.
    pub const ALL: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Medium,
        Priority::Low,
    ];

    /// Classes below this one, in descending order, for anti-starvation fallthrough.
    pub fn lower_classes(self) -> &'static [Priority] {
        match self {
            Priority::Critical => &[Priority::High, Priority::Medium, Priority::Low],
            Priority::High => &[Priority::Medium, Priority::Low],
            Priority::Medium => &[Priority::Low],
            Priority::Low => &[],
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Critical => write!(f, "critical"),
            Priority::High => write!(f, "high"),
            Priority::Medium => write!(f, "medium"),
            Priority::Low => write!(f, "low"),
        }
    }
}
