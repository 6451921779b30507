//! Version information for the bridge.

use std::fmt;

/// Bridge version from Cargo.toml
pub const BRIDGE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// A release as reported to the GUI: a display label plus a comparable number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseVersion {
    pub label: String,
    pub number: i32,
}

impl ReleaseVersion {
    pub fn new(label: impl Into<String>, number: i32) -> Self {
        Self {
            label: label.into(),
            number,
        }
    }

    /// The version of this build.
    pub fn current() -> Self {
        Self::parse(BRIDGE_VERSION).unwrap_or_else(|| Self::new(BRIDGE_VERSION, 0))
    }

    /// Parse `[v]MAJOR.MINOR[.PATCH][-pre]`.
    ///
    /// The number packs the components as `MAJOR * 10000 + MINOR * 100 + PATCH`.
    pub fn parse(s: &str) -> Option<Self> {
        let trimmed = s.trim();
        let core = trimmed.strip_prefix('v').unwrap_or(trimmed);
        let core = core.split(['-', '+']).next()?;

        let mut parts = core.split('.');
        let major: i32 = parts.next()?.parse().ok()?;
        let minor: i32 = parts.next()?.parse().ok()?;
        let patch: i32 = match parts.next() {
            Some(p) => p.parse().ok()?,
            None => 0,
        };
        if parts.next().is_some() || minor >= 100 || patch >= 100 {
            return None;
        }

        let number = major.checked_mul(10_000)?.checked_add(minor * 100 + patch)?;
        Some(Self::new(format!("v{core}"), number))
    }
}

impl fmt::Display for ReleaseVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}
