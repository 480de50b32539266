// Platform detection: operating system, CPU architecture, and on Linux the
// distro family parsed from /etc/os-release. Recipes filter steps against
// this via `when` clauses, and the plan records the tuple it was built for.

use std::collections::BTreeMap;
use std::path::Path;

use crate::{log_debug, log_warn};

/// Everything a `when` clause or URL template can ask about the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    /// `linux` or `darwin`.
    pub os: String,
    /// `amd64` or `arm64`.
    pub arch: String,
    /// `debian`, `rhel`, `arch`, `suse` or `alpine`. None off-Linux or when
    /// the distro maps to no known family.
    pub linux_family: Option<String>,
    /// `glibc`, or `musl` on Alpine.
    pub libc: String,
    /// The raw `ID` from /etc/os-release, empty off-Linux.
    pub distro_id: String,
    /// The raw `ID_LIKE` entries from /etc/os-release.
    pub distro_id_like: Vec<String>,
}

impl Platform {
    /// Detects the current platform. On Linux this reads /etc/os-release;
    /// a missing or unreadable file degrades to an unknown distro rather
    /// than failing, since most recipes never ask.
    pub fn detect() -> Self {
        let os = normalize_os(std::env::consts::OS);
        let arch = normalize_arch(std::env::consts::ARCH);

        if os == "linux" {
            match std::fs::read_to_string("/etc/os-release") {
                Ok(contents) => Self::from_os_release_str(&os, &arch, &contents),
                Err(err) => {
                    log_warn!("[Platform] Could not read /etc/os-release: {err}");
                    Self::bare(&os, &arch)
                }
            }
        } else {
            Self::bare(&os, &arch)
        }
    }

    fn bare(os: &str, arch: &str) -> Self {
        Self {
            os: os.to_string(),
            arch: arch.to_string(),
            linux_family: None,
            libc: "glibc".to_string(),
            distro_id: String::new(),
            distro_id_like: Vec::new(),
        }
    }

    /// Builds a Linux platform from os-release contents. Split out from
    /// `detect` so distro mapping is testable without the host file.
    pub fn from_os_release_str(os: &str, arch: &str, contents: &str) -> Self {
        let fields = parse_os_release(contents);
        let distro_id = fields.get("ID").cloned().unwrap_or_default();
        let distro_id_like: Vec<String> = fields
            .get("ID_LIKE")
            .map(|v| v.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();

        let linux_family = family_of(&distro_id)
            .or_else(|| distro_id_like.iter().find_map(|id| family_of(id)));

        let libc = if linux_family.as_deref() == Some("alpine") { "musl" } else { "glibc" };

        log_debug!(
            "[Platform] Detected {}/{} distro={} family={:?} libc={}",
            os, arch, distro_id, linux_family, libc
        );

        Self {
            os: os.to_string(),
            arch: arch.to_string(),
            linux_family,
            libc: libc.to_string(),
            distro_id,
            distro_id_like,
        }
    }

    /// The `"{os}/{arch}"` tuple used in recipes and plans.
    pub fn tuple(&self) -> String {
        format!("{}/{}", self.os, self.arch)
    }

    /// Whether the named package manager binary is on PATH. Used by
    /// `when.package_manager` predicates.
    pub fn has_package_manager(&self, manager: &str) -> bool {
        command_on_path(manager)
    }

    /// Fixed platform for unit tests; no host probing.
    #[cfg(test)]
    pub fn for_tests(os: &str, arch: &str, family: Option<&str>, distro_id: &str) -> Self {
        Self {
            os: os.to_string(),
            arch: arch.to_string(),
            linux_family: family.map(str::to_string),
            libc: if family == Some("alpine") { "musl" } else { "glibc" }.to_string(),
            distro_id: distro_id.to_string(),
            distro_id_like: Vec::new(),
        }
    }
}

/// Maps Rust's OS name onto the recipe vocabulary.
pub fn normalize_os(os: &str) -> String {
    match os {
        "macos" => "darwin".to_string(),
        other => other.to_string(),
    }
}

/// Maps Rust's arch name onto the recipe vocabulary.
pub fn normalize_arch(arch: &str) -> String {
    match arch {
        "x86_64" => "amd64".to_string(),
        "aarch64" => "arm64".to_string(),
        other => other.to_string(),
    }
}

/// Maps an os-release ID (or ID_LIKE entry) to a linux family.
fn family_of(id: &str) -> Option<String> {
    let family = match id {
        "debian" | "ubuntu" | "linuxmint" | "pop" | "raspbian" => "debian",
        "rhel" | "fedora" | "centos" | "rocky" | "almalinux" | "amzn" => "rhel",
        "arch" | "manjaro" | "endeavouros" => "arch",
        "suse" | "opensuse" | "opensuse-leap" | "opensuse-tumbleweed" | "sles" => "suse",
        "alpine" => "alpine",
        _ => return None,
    };
    Some(family.to_string())
}

/// Parses the KEY=value lines of /etc/os-release, stripping quotes.
fn parse_os_release(contents: &str) -> BTreeMap<String, String> {
    let mut fields = BTreeMap::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let value = value.trim().trim_matches('"').trim_matches('\'');
            fields.insert(key.trim().to_string(), value.to_string());
        }
    }
    fields
}

/// Resolves a command name against PATH, returning whether it exists as an
/// executable file. Shared by platform probes and `require_command`.
pub fn command_on_path(command: &str) -> bool {
    resolve_command(command).is_some()
}

/// Finds the first PATH entry containing an executable with this name.
pub fn resolve_command(command: &str) -> Option<std::path::PathBuf> {
    if command.contains('/') {
        let path = Path::new(command);
        return is_executable_file(path).then(|| path.to_path_buf());
    }
    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(command);
        if is_executable_file(&candidate) {
            return Some(candidate);
        }
    }
    None
}

#[cfg(unix)]
fn is_executable_file(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable_file(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn os_release_maps_ubuntu_to_debian_family() {
        let contents = "NAME=\"Ubuntu\"\nID=ubuntu\nID_LIKE=debian\nVERSION_ID=\"24.04\"\n";
        let platform = Platform::from_os_release_str("linux", "amd64", contents);
        assert_eq!(platform.distro_id, "ubuntu");
        assert_eq!(platform.linux_family.as_deref(), Some("debian"));
        assert_eq!(platform.libc, "glibc");
    }

    #[test]
    fn os_release_maps_alpine_to_musl() {
        let contents = "ID=alpine\nVERSION_ID=3.20\n";
        let platform = Platform::from_os_release_str("linux", "arm64", contents);
        assert_eq!(platform.linux_family.as_deref(), Some("alpine"));
        assert_eq!(platform.libc, "musl");
    }

    #[test]
    fn unknown_distro_falls_back_to_id_like() {
        let contents = "ID=garuda\nID_LIKE=\"arch\"\n";
        let platform = Platform::from_os_release_str("linux", "amd64", contents);
        assert_eq!(platform.linux_family.as_deref(), Some("arch"));
    }

    #[test]
    fn unknown_distro_without_like_has_no_family() {
        let contents = "ID=solaris-at-home\n";
        let platform = Platform::from_os_release_str("linux", "amd64", contents);
        assert_eq!(platform.linux_family, None);
        assert_eq!(platform.libc, "glibc");
    }

    #[test]
    fn normalization_tables() {
        assert_eq!(normalize_os("macos"), "darwin");
        assert_eq!(normalize_os("linux"), "linux");
        assert_eq!(normalize_arch("x86_64"), "amd64");
        assert_eq!(normalize_arch("aarch64"), "arm64");
    }

    #[test]
    fn tuple_formats_os_slash_arch() {
        let platform = Platform::for_tests("linux", "amd64", None, "");
        assert_eq!(platform.tuple(), "linux/amd64");
    }
}
