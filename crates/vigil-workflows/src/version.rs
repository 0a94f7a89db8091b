// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Version comparison for CMS cores and extensions.

use std::cmp::Ordering;
use std::fmt;

use vigil_core::CoreUpdatePreference;

/// Last Joomla release whose updater still ships the encrypted `restore.php`.
const LAST_LEGACY_EXTRACTOR: Version = Version {
    major: 4,
    minor: 0,
    patch: 3,
};

/// `major.minor.patch`, with missing components read as zero. Pre-release
/// and build suffixes (`-rc1`, `+build`) are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Version {
    /// Major component.
    pub major: u64,
    /// Minor component.
    pub minor: u64,
    /// Patch component.
    pub patch: u64,
}

impl Version {
    /// Parse a version string. Returns `None` when the leading component is
    /// not a number.
    pub fn parse(raw: &str) -> Option<Self> {
        let core = raw
            .trim()
            .trim_start_matches(['v', 'V'])
            .split(['-', '+', ' '])
            .next()?;

        let mut parts = core.split('.').map(|p| p.parse::<u64>());
        let major = parts.next()?.ok()?;
        let minor = parts.next().and_then(|p| p.ok()).unwrap_or(0);
        let patch = parts.next().and_then(|p| p.ok()).unwrap_or(0);
        Some(Self { major, minor, patch })
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch).cmp(&(other.major, other.minor, other.patch))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Whether `candidate` is strictly newer than `installed`. Unparseable
/// versions never count as newer.
pub fn is_newer(installed: Option<&str>, candidate: &str) -> bool {
    match (installed.and_then(Version::parse), Version::parse(candidate)) {
        (Some(installed), Some(candidate)) => candidate > installed,
        (None, Some(_)) => true,
        _ => false,
    }
}

/// Whether a Joomla site at `current` extracts updates with the legacy
/// encrypted script. Unknown versions use the modern script.
pub fn uses_legacy_extractor(current: Option<&str>) -> bool {
    current
        .and_then(Version::parse)
        .is_some_and(|v| v <= LAST_LEGACY_EXTRACTOR)
}

/// Whether the preference allows installing `target` over `current` without
/// asking anyone.
pub fn auto_update_allowed(preference: CoreUpdatePreference, current: Option<&str>, target: &str) -> bool {
    let Some(target) = Version::parse(target) else {
        return false;
    };
    let Some(current) = current.and_then(Version::parse) else {
        return preference == CoreUpdatePreference::Major;
    };
    if target <= current {
        return false;
    }

    match preference {
        CoreUpdatePreference::None | CoreUpdatePreference::Email => false,
        CoreUpdatePreference::Patch => target.major == current.major && target.minor == current.minor,
        CoreUpdatePreference::Minor => target.major == current.major,
        CoreUpdatePreference::Major => true,
    }
}
