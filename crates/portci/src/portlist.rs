//! The set of ports a run builds.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use tokio::process::Command;
use tracing::debug;

use crate::error::{CiError, Result};

/// Base ref used when the caller names none.
pub const DEFAULT_BASE_REF: &str = "macports/master";

/// Ordered, duplicate-free list of port names. Discovery order is kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortList {
    ports: Vec<String>,
}

impl PortList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `port` unless it is empty or already listed.
    pub fn push(&mut self, port: impl Into<String>) -> bool {
        let port = port.into();
        if port.is_empty() || self.ports.contains(&port) {
            return false;
        }
        self.ports.push(port);
        true
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.ports
    }

    pub fn iter(&self) -> std::slice::Iter<'_, String> {
        self.ports.iter()
    }

    /// One port per line, as recorded in the `port-list` part.
    pub fn to_text(&self) -> String {
        self.ports.iter().map(|p| format!("{p}\n")).collect()
    }
}

impl<S: Into<String>> FromIterator<S> for PortList {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut list = PortList::new();
        for port in iter {
            list.push(port);
        }
        list
    }
}

impl<'a> IntoIterator for &'a PortList {
    type Item = &'a String;
    type IntoIter = std::slice::Iter<'a, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.ports.iter()
    }
}

// Added/modified paths, or the new path of a rename. Top-level directories
// starting with `.` or `_` are not categories.
static CHANGED_PORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:[AM]|R[0-9]*\t[^\t]*)\t[^._/][^/]*/([^/]+)/(?:Portfile|files/)").unwrap()
});

/// Ports touched by a `git diff --name-status` listing.
pub fn parse_changed_ports(output: &str) -> PortList {
    output
        .lines()
        .filter_map(|line| CHANGED_PORT_RE.captures(line))
        .filter_map(|captures| captures.get(1))
        .map(|port| port.as_str().to_string())
        .collect()
}

/// Ports changed in `repo_dir` between `base_ref` and `HEAD`.
pub async fn changed_ports(repo_dir: &Path, base_ref: &str) -> Result<PortList> {
    let range = format!("{base_ref}...HEAD");
    let output = Command::new("git")
        .args(["diff", "--name-status", &range, "--"])
        .current_dir(repo_dir)
        .output()
        .await
        .map_err(|e| CiError::Git(format!("failed to run git: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(CiError::Git(format!(
            "git diff --name-status {range} failed: {}",
            stderr.trim()
        )));
    }

    let ports = parse_changed_ports(&String::from_utf8_lossy(&output.stdout));
    debug!(base_ref, count = ports.len(), "Detected changed ports");
    Ok(ports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as StdCommand;

    fn run_git(repo_dir: &Path, args: &[&str]) {
        let output = StdCommand::new("git")
            .args(args)
            .current_dir(repo_dir)
            .output()
            .unwrap();
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
    }

    fn make_ports_repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        run_git(dir.path(), &["init"]);
        run_git(dir.path(), &["config", "user.name", "test-user"]);
        run_git(dir.path(), &["config", "user.email", "test@example.com"]);
        std::fs::create_dir_all(dir.path().join("archivers/xz")).unwrap();
        std::fs::write(dir.path().join("archivers/xz/Portfile"), "name xz\n").unwrap();
        run_git(dir.path(), &["add", "."]);
        run_git(dir.path(), &["commit", "-m", "initial"]);
        run_git(dir.path(), &["tag", "base"]);
        dir
    }

    #[test]
    fn port_list_dedups_in_order() {
        let mut list = PortList::new();
        assert!(list.push("zlib"));
        assert!(list.push("xz"));
        assert!(!list.push("zlib"));
        assert!(!list.push(""));
        assert_eq!(list.as_slice(), ["zlib", "xz"]);
        assert_eq!(list.to_text(), "zlib\nxz\n");
    }

    #[test]
    fn parse_accepts_portfiles_and_files() {
        let diff = "M\tarchivers/xz/Portfile\n\
                    A\tdevel/zlib/files/patch-configure.diff\n\
                    M\tarchivers/xz/files/extra.patch\n";
        let ports = parse_changed_ports(diff);
        assert_eq!(ports.as_slice(), ["xz", "zlib"]);
    }

    #[test]
    fn parse_uses_rename_destination() {
        let diff = "R087\tdevel/oldname/Portfile\tdevel/newname/Portfile\n";
        assert_eq!(parse_changed_ports(diff).as_slice(), ["newname"]);
    }

    #[test]
    fn parse_ignores_unrelated_paths() {
        let diff = "D\tdevel/gone/Portfile\n\
                    M\t_resources/port1.0/group/foo.tcl\n\
                    M\t.github/workflows/ci.yml\n\
                    M\tdevel/zlib/README\n\
                    M\tREADME.md\n";
        assert!(parse_changed_ports(diff).is_empty());
    }

    #[tokio::test]
    async fn changed_ports_reads_git_history() {
        let repo = make_ports_repo();
        std::fs::create_dir_all(repo.path().join("devel/zlib")).unwrap();
        std::fs::write(repo.path().join("devel/zlib/Portfile"), "name zlib\n").unwrap();
        std::fs::write(repo.path().join("archivers/xz/Portfile"), "name xz\nrevision 1\n").unwrap();
        run_git(repo.path(), &["add", "."]);
        run_git(repo.path(), &["commit", "-m", "update ports"]);

        let ports = changed_ports(repo.path(), "base").await.unwrap();
        assert_eq!(ports.as_slice(), ["xz", "zlib"]);
    }

    #[tokio::test]
    async fn changed_ports_unknown_base_is_git_error() {
        let repo = make_ports_repo();
        let err = changed_ports(repo.path(), "does-not-exist").await.unwrap_err();
        assert!(matches!(err, CiError::Git(_)));
    }
}
