//! Module version packing and filename suffix parsing (spec §4.4/§6.1
//! "Version encoding").

/// Packs `major.minor.patch` the way the file format stores it:
/// `major * 10_000_000 + minor * 10_000 + patch`.
pub fn pack(major: u32, minor: u32, patch: u32) -> u32 {
    major * 10_000_000 + minor * 10_000 + patch
}

pub fn unpack(version: u32) -> (u32, u32, u32) {
    let major = version / 10_000_000;
    let minor = (version / 10_000) % 1_000;
    let patch = version % 10_000;
    (major, minor, patch)
}

/// Parses a `-M.m.p` suffix immediately before the `.mod` extension, e.g.
/// `ejs.web-2.3.1.mod` → `Some(pack(2,3,1))`.
pub fn parse_filename_version(filename: &str) -> Option<u32> {
    let stem = filename.strip_suffix(".mod")?;
    let dash = stem.rfind('-')?;
    let version_part = &stem[dash + 1..];
    let mut parts = version_part.split('.');
    let major: u32 = parts.next()?.parse().ok()?;
    let minor: u32 = parts.next()?.parse().ok()?;
    let patch: u32 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some(pack(major, minor, patch))
}
