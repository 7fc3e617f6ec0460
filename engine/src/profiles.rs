//! Locating Firefox and Thunderbird profiles.
//!
//! Each application keeps its profiles under a per-OS root directory. The
//! root usually holds a `profiles.ini` naming the profiles and marking the
//! default one; profile directories themselves are recognized by the
//! `prefs.js` file every initialized profile contains.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use directories::BaseDirs;
use tracing::{debug, warn};

use crate::error::PathError;
use crate::model::{ApplicationKind, ProfileDescriptor};

/// File present in every initialized profile directory.
pub const PROFILE_MARKER: &str = "prefs.js";

/// Environment variable overriding the Firefox profile root.
pub const FIREFOX_ROOT_ENV: &str = "MOZMOVER_FIREFOX_ROOT";
/// Environment variable overriding the Thunderbird profile root.
pub const THUNDERBIRD_ROOT_ENV: &str = "MOZMOVER_THUNDERBIRD_ROOT";

/// Profile root directory per application.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileRoots {
    firefox: Option<PathBuf>,
    thunderbird: Option<PathBuf>,
}

impl ProfileRoots {
    /// Roots for this OS, with environment overrides applied.
    ///
    /// - Windows: `%APPDATA%\Mozilla\Firefox`, `%APPDATA%\Thunderbird`
    /// - macOS: `~/Library/Application Support/Firefox`, `~/Library/Thunderbird`
    /// - other: `~/.mozilla/firefox`, `~/.thunderbird`
    pub fn detect() -> Self {
        let from_env = |var: &str| {
            std::env::var_os(var)
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
        };
        ProfileRoots {
            firefox: from_env(FIREFOX_ROOT_ENV).or_else(|| default_root(ApplicationKind::Firefox)),
            thunderbird: from_env(THUNDERBIRD_ROOT_ENV)
                .or_else(|| default_root(ApplicationKind::Thunderbird)),
        }
    }

    /// No roots at all; every listing is empty until one is set.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_root<P: Into<PathBuf>>(mut self, kind: ApplicationKind, root: P) -> Self {
        match kind {
            ApplicationKind::Firefox => self.firefox = Some(root.into()),
            ApplicationKind::Thunderbird => self.thunderbird = Some(root.into()),
        }
        self
    }

    pub fn root(&self, kind: ApplicationKind) -> Option<&Path> {
        match kind {
            ApplicationKind::Firefox => self.firefox.as_deref(),
            ApplicationKind::Thunderbird => self.thunderbird.as_deref(),
        }
    }
}

fn default_root(kind: ApplicationKind) -> Option<PathBuf> {
    let base = BaseDirs::new()?;
    let root = if cfg!(target_os = "windows") {
        match kind {
            ApplicationKind::Firefox => base.config_dir().join("Mozilla").join("Firefox"),
            ApplicationKind::Thunderbird => base.config_dir().join("Thunderbird"),
        }
    } else if cfg!(target_os = "macos") {
        match kind {
            ApplicationKind::Firefox => base
                .home_dir()
                .join("Library")
                .join("Application Support")
                .join("Firefox"),
            ApplicationKind::Thunderbird => base.home_dir().join("Library").join("Thunderbird"),
        }
    } else {
        match kind {
            ApplicationKind::Firefox => base.home_dir().join(".mozilla").join("firefox"),
            ApplicationKind::Thunderbird => base.home_dir().join(".thunderbird"),
        }
    };
    Some(root)
}

/// One `[Section]` of an ini file.
#[derive(Debug, Default)]
struct IniSection {
    name: String,
    entries: Vec<(String, String)>,
}

impl IniSection {
    fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }
}

fn parse_ini(text: &str) -> Vec<IniSection> {
    let mut sections = Vec::new();
    let mut current: Option<IniSection> = None;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
            continue;
        }
        if line.starts_with('[') && line.ends_with(']') {
            if let Some(section) = current.take() {
                sections.push(section);
            }
            current = Some(IniSection {
                name: line[1..line.len() - 1].trim().to_string(),
                entries: Vec::new(),
            });
        } else if let Some((key, value)) = line.split_once('=') {
            // Keys outside any section are ignored
            if let Some(section) = current.as_mut() {
                section
                    .entries
                    .push((key.trim().to_string(), value.trim().to_string()));
            }
        }
    }
    if let Some(section) = current {
        sections.push(section);
    }
    sections
}

/// Resolve a `Path=` value from profiles.ini against the profile root.
fn resolve_ini_path(root: &Path, value: &str, is_relative: bool) -> PathBuf {
    let as_given = PathBuf::from(value);
    if is_relative || !as_given.is_absolute() {
        value
            .split(['/', '\\'])
            .filter(|part| !part.is_empty())
            .fold(root.to_path_buf(), |acc, part| acc.join(part))
    } else {
        as_given
    }
}

/// Best identity for a path: canonical form if it exists, otherwise as given.
fn identity(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Finds profiles on disk and validates paths.
#[derive(Debug, Clone)]
pub struct ProfileLocator {
    roots: ProfileRoots,
}

impl ProfileLocator {
    pub fn new(roots: ProfileRoots) -> Self {
        ProfileLocator { roots }
    }

    pub fn roots(&self) -> &ProfileRoots {
        &self.roots
    }

    /// Enumerate the profiles of `kind`, default first, then by name.
    ///
    /// The filesystem is read again on every call.
    pub fn list_profiles(&self, kind: ApplicationKind) -> Vec<ProfileDescriptor> {
        let Some(root) = self.roots.root(kind) else {
            return Vec::new();
        };

        let mut profiles = Vec::new();
        let mut seen = HashSet::new();

        let ini_path = root.join("profiles.ini");
        match fs::read_to_string(&ini_path) {
            Ok(text) => {
                for profile in profiles_from_ini(kind, root, &text) {
                    if seen.insert(identity(&profile.root_path)) {
                        profiles.push(profile);
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %ini_path.display(), "no profiles.ini");
            }
            Err(e) => {
                warn!(path = %ini_path.display(), error = %e, "could not read profiles.ini");
            }
        }

        // Profiles not listed in profiles.ini still count if they look like one
        for dir in [root.to_path_buf(), root.join("Profiles")] {
            let Ok(entries) = fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if !path.is_dir() || !path.join(PROFILE_MARKER).is_file() {
                    continue;
                }
                if seen.insert(identity(&path)) {
                    profiles.push(ProfileDescriptor::new(kind, &path));
                }
            }
        }

        profiles.sort_by(|a, b| {
            b.is_default
                .cmp(&a.is_default)
                .then_with(|| a.display_name.to_lowercase().cmp(&b.display_name.to_lowercase()))
        });
        profiles
    }

    /// Check that `path` exists, is a directory and can be listed.
    pub fn validate(&self, path: &Path) -> Result<(), PathError> {
        validate_dir(path)
    }
}

fn profiles_from_ini(kind: ApplicationKind, root: &Path, text: &str) -> Vec<ProfileDescriptor> {
    let sections = parse_ini(text);

    // Newer releases record the default per installation: relative to the
    // root, or absolute for profiles kept elsewhere
    let install_defaults: Vec<PathBuf> = sections
        .iter()
        .filter(|s| s.name.starts_with("Install"))
        .filter_map(|s| s.get("Default"))
        .map(|value| identity(&resolve_ini_path(root, value, false)))
        .collect();

    let mut profiles = Vec::new();
    for section in sections.iter().filter(|s| s.name.starts_with("Profile")) {
        let Some(value) = section.get("Path") else {
            continue;
        };
        let is_relative = section.get("IsRelative") == Some("1");
        let path = resolve_ini_path(root, value, is_relative);
        if !path.is_dir() {
            debug!(path = %path.display(), "profiles.ini entry has no directory");
            continue;
        }

        let is_default = if install_defaults.is_empty() {
            section.get("Default") == Some("1")
        } else {
            install_defaults.contains(&identity(&path))
        };

        let mut profile = ProfileDescriptor::new(kind, &path);
        if let Some(name) = section.get("Name").filter(|n| !n.is_empty()) {
            profile.display_name = name.to_string();
        }
        profile.is_default = is_default;
        profiles.push(profile);
    }
    profiles
}

/// Check that `path` exists, is a directory and can be listed.
pub fn validate_dir(path: &Path) -> Result<(), PathError> {
    let metadata = match fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(PathError::NotFound {
                path: path.to_path_buf(),
            })
        }
        Err(e) => {
            return Err(PathError::AccessDenied {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };

    if !metadata.is_dir() {
        return Err(PathError::NotADirectory {
            path: path.to_path_buf(),
        });
    }

    fs::read_dir(path).map_err(|e| PathError::AccessDenied {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(())
}

/// Check that `path` is a regular file that can be opened.
pub fn validate_file(path: &Path) -> Result<(), PathError> {
    match fs::metadata(path) {
        Ok(metadata) if metadata.is_file() => {}
        Ok(_) => {
            return Err(PathError::NotAFile {
                path: path.to_path_buf(),
            })
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(PathError::NotFound {
                path: path.to_path_buf(),
            })
        }
        Err(e) => {
            return Err(PathError::AccessDenied {
                path: path.to_path_buf(),
                source: e,
            })
        }
    }

    fs::File::open(path).map_err(|e| PathError::AccessDenied {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(())
}

/// Absolute, symlink-free form of a path that may not exist yet.
///
/// The nearest existing ancestor is canonicalized and the remaining
/// components are appended unchanged.
fn canonical_lenient(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };

    let mut existing = absolute.as_path();
    let mut rest = Vec::new();
    loop {
        if let Ok(canonical) = fs::canonicalize(existing) {
            return rest
                .iter()
                .rev()
                .fold(canonical, |acc: PathBuf, part| acc.join(part));
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                rest.push(name.to_os_string());
                existing = parent;
            }
            _ => return absolute,
        }
    }
}

/// Fail if one of the two trees lies inside the other.
pub fn check_no_overlap(source: &Path, destination: &Path) -> Result<(), PathError> {
    let src = canonical_lenient(source);
    let dst = canonical_lenient(destination);
    let src = src.components().filter(|c| !matches!(c, Component::CurDir)).collect::<PathBuf>();
    let dst = dst.components().filter(|c| !matches!(c, Component::CurDir)).collect::<PathBuf>();

    if dst.starts_with(&src) || src.starts_with(&dst) {
        return Err(PathError::Overlapping {
            source_path: source.to_path_buf(),
            destination: destination.to_path_buf(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_profile(dir: &Path) {
        fs::create_dir_all(dir).expect("Failed to create profile dir");
        fs::write(dir.join(PROFILE_MARKER), "// prefs").expect("Failed to write prefs.js");
    }

    #[test]
    fn test_parse_ini_sections() {
        let sections = parse_ini(
            "; comment\nstray=1\n[General]\nStartWithLastProfile=1\n\n[Profile0]\nName=default\nPath = abc.default\n",
        );
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].name, "General");
        assert_eq!(sections[1].get("path"), Some("abc.default"));
    }

    #[test]
    fn test_list_profiles_from_ini_with_install_default() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let root = temp_dir.path();
        make_profile(&root.join("Profiles").join("aaaa.default"));
        make_profile(&root.join("Profiles").join("bbbb.default-release"));
        fs::write(
            root.join("profiles.ini"),
            "[Install4F96D1932A9F858E]\nDefault=Profiles/bbbb.default-release\nLocked=1\n\n\
             [Profile1]\nName=default-release\nIsRelative=1\nPath=Profiles/bbbb.default-release\n\n\
             [Profile0]\nName=default\nIsRelative=1\nPath=Profiles/aaaa.default\nDefault=1\n",
        )
        .expect("Failed to write profiles.ini");

        let locator = ProfileLocator::new(ProfileRoots::empty().with_root(ApplicationKind::Firefox, root));
        let profiles = locator.list_profiles(ApplicationKind::Firefox);

        assert_eq!(profiles.len(), 2);
        assert_eq!(profiles[0].display_name, "default-release");
        assert!(profiles[0].is_default);
        assert!(!profiles[1].is_default);
        assert!(profiles.iter().all(|p| p.application_kind == ApplicationKind::Firefox));
    }

    #[test]
    fn test_list_profiles_with_absolute_install_default() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let root = temp_dir.path().join("firefox");
        let external = temp_dir.path().join("elsewhere").join("custom.profile");
        make_profile(&root.join("Profiles").join("aaaa.default"));
        make_profile(&external);
        fs::write(
            root.join("profiles.ini"),
            format!(
                "[Install4F96D1932A9F858E]\nDefault={external}\nLocked=1\n\n\
                 [Profile0]\nName=default\nIsRelative=1\nPath=Profiles/aaaa.default\n\n\
                 [Profile1]\nName=custom\nIsRelative=0\nPath={external}\n",
                external = external.display()
            ),
        )
        .expect("Failed to write profiles.ini");

        let locator =
            ProfileLocator::new(ProfileRoots::empty().with_root(ApplicationKind::Firefox, &root));
        let profiles = locator.list_profiles(ApplicationKind::Firefox);

        assert_eq!(profiles.len(), 2);
        assert_eq!(profiles[0].display_name, "custom");
        assert!(profiles[0].is_default);
        assert_eq!(identity(&profiles[0].root_path), identity(&external));
        assert!(!profiles[1].is_default);
    }

    #[test]
    fn test_list_profiles_legacy_default_flag() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let root = temp_dir.path();
        make_profile(&root.join("x1.work"));
        make_profile(&root.join("x2.home"));
        fs::write(
            root.join("profiles.ini"),
            "[Profile0]\nName=work\nIsRelative=1\nPath=x1.work\n\n\
             [Profile1]\nName=home\nIsRelative=1\nPath=x2.home\nDefault=1\n",
        )
        .expect("Failed to write profiles.ini");

        let locator =
            ProfileLocator::new(ProfileRoots::empty().with_root(ApplicationKind::Thunderbird, root));
        let profiles = locator.list_profiles(ApplicationKind::Thunderbird);
        let names: Vec<_> = profiles.iter().map(|p| p.display_name.as_str()).collect();
        assert_eq!(names, vec!["home", "work"]);
        assert!(profiles[0].is_default);
    }

    #[test]
    fn test_list_profiles_scans_marker_without_ini() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let root = temp_dir.path();
        make_profile(&root.join("zzzz.default"));
        fs::create_dir_all(root.join("Crash Reports")).expect("Failed to create dir");
        fs::write(root.join("installs.ini"), "").expect("Failed to write file");

        let locator = ProfileLocator::new(ProfileRoots::empty().with_root(ApplicationKind::Firefox, root));
        let profiles = locator.list_profiles(ApplicationKind::Firefox);
        assert_eq!(profiles.len(), 1);
        assert_eq!(profiles[0].display_name, "zzzz.default");
    }

    #[test]
    fn test_list_profiles_deduplicates_ini_and_scan() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let root = temp_dir.path();
        make_profile(&root.join("p.default"));
        fs::write(
            root.join("profiles.ini"),
            "[Profile0]\nName=Main\nIsRelative=1\nPath=p.default\n",
        )
        .expect("Failed to write profiles.ini");

        let locator = ProfileLocator::new(ProfileRoots::empty().with_root(ApplicationKind::Firefox, root));
        let profiles = locator.list_profiles(ApplicationKind::Firefox);
        assert_eq!(profiles.len(), 1);
        assert_eq!(profiles[0].display_name, "Main");
    }

    #[test]
    fn test_list_profiles_without_root() {
        let locator = ProfileLocator::new(ProfileRoots::empty());
        assert!(locator.list_profiles(ApplicationKind::Firefox).is_empty());
    }

    #[test]
    fn test_validate_missing_path() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let locator = ProfileLocator::new(ProfileRoots::empty());
        let result = locator.validate(&temp_dir.path().join("nope"));
        assert!(matches!(result, Err(PathError::NotFound { .. })));
    }

    #[test]
    fn test_validate_file_path() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let file = temp_dir.path().join("prefs.js");
        fs::write(&file, "x").expect("Failed to write file");

        let locator = ProfileLocator::new(ProfileRoots::empty());
        assert!(matches!(
            locator.validate(&file),
            Err(PathError::NotADirectory { .. })
        ));
        locator.validate(temp_dir.path()).expect("Directory should validate");
    }

    #[test]
    fn test_validate_archive_file() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let archive = temp_dir.path().join("MozMover_2024-05-01.zip");
        fs::write(&archive, b"PK").expect("Failed to write file");

        validate_file(&archive).expect("File should validate");
        assert!(matches!(
            validate_file(temp_dir.path()),
            Err(PathError::NotAFile { .. })
        ));
        assert!(matches!(
            validate_file(&temp_dir.path().join("missing.zip")),
            Err(PathError::NotFound { .. })
        ));
    }

    #[test]
    fn test_overlap_detection() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("profile");
        fs::create_dir(&src).expect("Failed to create dir");

        assert!(check_no_overlap(&src, &src).is_err());
        assert!(check_no_overlap(&src, &src.join("backup")).is_err());
        assert!(check_no_overlap(&src.join("inner"), &src).is_err());
        assert!(check_no_overlap(&src, &temp_dir.path().join("profile-backup")).is_ok());
    }
}
