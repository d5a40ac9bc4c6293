// Stable logical names for services, derived from artifact paths.
//
// OS pids change on every restart; the logical name is the durable key
// that configuration survives under.

use std::path::Path;

/// Derive the stable logical name for a service from its artifact path:
/// the base filename with its extension removed, lowercased so that every
/// key comparison is case-insensitive.
pub fn logical_name(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

/// True when the artifact sits in the subfolder layout, i.e. its immediate
/// parent folder carries the same name as the artifact (case-insensitive).
/// Records that disagree with folder context stay valid for monitoring;
/// they are only excluded from subfolder-based auto-launch matching.
pub fn matches_subfolder_layout(path: &Path) -> bool {
    let name = logical_name(path);
    if name.is_empty() {
        return false;
    }
    path.parent()
        .and_then(|parent| parent.file_name())
        .map(|folder| folder.to_string_lossy().to_lowercase() == name)
        .unwrap_or(false)
}
