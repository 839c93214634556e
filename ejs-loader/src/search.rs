//! Module search-path resolution (spec §4.4/§4.4a): a pure function of
//! `(name, candidate dirs, version range)`. Reading `EJSPATH` itself is a
//! one-line `std::env::var` call left to the embedding API (§6.3), so this
//! stays testable without touching the environment.

use crate::version::parse_filename_version;
use std::path::{Path, PathBuf};

/// Ranks candidate files for `name` across `dirs`, keeping only those
/// whose encoded version falls in `[min_version, max_version]` and
/// returning the highest-versioned match first (spec §4.4 "accept the
/// highest version in range").
pub fn resolve(name: &str, dirs: &[PathBuf], min_version: u32, max_version: u32) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    for dir in dirs {
        for candidate_name in candidate_names(name) {
            candidates.extend(scan_dir(dir, &candidate_name, min_version, max_version));
        }
    }
    candidates.sort_by(|a, b| version_of(b).cmp(&version_of(a)));
    candidates
}

/// The four name spellings tried per directory (spec §4.4 steps 2-5):
/// exact, dots-to-separators, and both again using only the basename.
fn candidate_names(name: &str) -> Vec<String> {
    let converted = name.replace('.', std::path::MAIN_SEPARATOR_STR);
    let basename_exact = name.rsplit('.').next().unwrap_or(name).to_string();
    let mut names = vec![name.to_string(), converted];
    if basename_exact != name {
        names.push(basename_exact.clone());
        names.push(basename_exact);
    }
    names.dedup();
    names
}

fn version_of(path: &Path) -> u32 {
    path.file_name()
        .and_then(|f| f.to_str())
        .and_then(parse_filename_version)
        .unwrap_or(0)
}

fn scan_dir(dir: &Path, candidate_name: &str, min_version: u32, max_version: u32) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let exact = dir.join(format!("{candidate_name}.mod"));
    if exact.is_file() {
        found.push(exact);
    }
    let Ok(entries) = std::fs::read_dir(dir) else {
        return found;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(file_name) = path.file_name().and_then(|f| f.to_str()) else {
            continue;
        };
        if !file_name.starts_with(candidate_name) || !file_name.ends_with(".mod") {
            continue;
        }
        let Some(version) = parse_filename_version(file_name) else {
            continue;
        };
        if version >= min_version && version <= max_version {
            found.push(path);
        }
    }
    found
}

/// Builds the default directory list (spec §6.4): `EJSPATH`-supplied
/// directories, then the caller-provided default install/module dir, then
/// the current directory. The embedding API owns reading `EJSPATH` and
/// calling this; this function never touches the environment itself.
pub fn default_search_dirs(ejspath: Option<&str>, module_dir: Option<&Path>, cwd: &Path) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Some(path) = ejspath {
        dirs.extend(std::env::split_paths(path));
    }
    if let Some(module_dir) = module_dir {
        dirs.push(module_dir.to_path_buf());
    }
    dirs.push(cwd.to_path_buf());
    dirs
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    #[test]
    fn candidate_names_converts_dots_and_basename() {
        let names = candidate_names("ejs.web.core");
        assert!(names.contains(&"ejs.web.core".to_string()));
        assert!(names.iter().any(|n| n.contains(std::path::MAIN_SEPARATOR)));
        assert!(names.contains(&"core".to_string()));
    }

    #[test]
    fn resolve_picks_highest_version_in_range() {
        let dir = std::env::temp_dir().join(format!("ejs-loader-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        for v in ["1.0.0", "2.0.0", "3.0.0"] {
            let mut f = std::fs::File::create(dir.join(format!("demo-{v}.mod"))).unwrap();
            writeln!(f, "x").unwrap();
        }
        let found = resolve("demo", &[dir.clone()], pack_for_test(1, 0, 0), pack_for_test(2, 5, 0));
        assert_eq!(found.first().unwrap().file_name().unwrap().to_str().unwrap(), "demo-2.0.0.mod");
        std::fs::remove_dir_all(&dir).ok();
    }

    fn pack_for_test(major: u32, minor: u32, patch: u32) -> u32 {
        crate::version::pack(major, minor, patch)
    }
}
