//! UUID normalization.
//!
//! BLE UUIDs arrive in several spellings (`"0000180D-0000-1000-8000-00805F9B34FB"`,
//! `"180d"`). Every lookup in the bridge compares the normalized form:
//! lowercase, no dashes.

/// Normalizes a UUID string to the internal lookup form.
#[must_use]
pub fn normalize_uuid(uuid: &str) -> String {
    uuid.chars()
        .filter(|c| *c != '-')
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Normalizes every UUID in a slice.
#[must_use]
pub fn normalize_uuids<S: AsRef<str>>(uuids: &[S]) -> Vec<String> {
    uuids.iter().map(|u| normalize_uuid(u.as_ref())).collect()
}
