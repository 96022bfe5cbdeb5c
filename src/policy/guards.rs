//! Hard scope guards for filesystem and network targets.
//!
//! Guards run before rule evaluation and are not overridable by rules: a
//! path outside the configured scope, or a denied host, is rejected outright.
//! Denied entries always win over allowed ones.

use crate::errors::PolicyError;
use crate::policy::types::{NetworkScope, PathScope, ScopeMode};
use std::fmt;
use std::path::{Component, Path, PathBuf};

/// Result of a guard check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardVerdict {
    Allowed,
    Denied(String),
}

impl GuardVerdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, GuardVerdict::Allowed)
    }
}

/// Collapse `.` and `..` without touching the filesystem.
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Resolve to an absolute, symlink-expanded path. The longest existing
/// ancestor is canonicalized and the non-existent remainder re-appended, so
/// paths that are about to be created resolve too.
pub fn resolve_path(path: &Path, base: Option<&Path>) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else if let Some(base) = base {
        base.join(path)
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };
    let normalized = normalize_lexically(&absolute);

    let mut existing = normalized.as_path();
    let mut remainder = Vec::new();
    loop {
        if let Ok(canonical) = existing.canonicalize() {
            let mut resolved = canonical;
            for part in remainder.iter().rev() {
                resolved.push(part);
            }
            return resolved;
        }
        match (existing.file_name(), existing.parent()) {
            (Some(name), Some(parent)) => {
                remainder.push(name.to_os_string());
                existing = parent;
            }
            _ => return normalized,
        }
    }
}

/// Enforces the run's filesystem scope.
#[derive(Debug, Clone)]
pub struct PathGuard {
    mode: ScopeMode,
    allowed: Vec<PathBuf>,
    denied: Vec<PathBuf>,
}

impl PathGuard {
    pub fn new(scope: &PathScope) -> Result<Self, PolicyError> {
        if scope.mode == ScopeMode::Custom && scope.allowed_paths.is_empty() {
            return Err(PolicyError::InvalidScope(
                "custom path scope requires at least one allowed path".to_string(),
            ));
        }
        Ok(Self {
            mode: scope.mode,
            allowed: scope.allowed_paths.clone(),
            denied: scope.denied_paths.clone(),
        })
    }

    fn allowed_roots(&self, workspace: Option<&Path>) -> Vec<PathBuf> {
        match self.mode {
            ScopeMode::WorkspaceOnly => workspace
                .map(|w| vec![resolve_path(w, None)])
                .unwrap_or_default(),
            ScopeMode::TempOnly => vec![resolve_path(&std::env::temp_dir(), None)],
            ScopeMode::Custom => self
                .allowed
                .iter()
                .map(|p| resolve_path(p, workspace))
                .collect(),
        }
    }

    pub fn check(&self, path: &Path, workspace: Option<&Path>) -> GuardVerdict {
        let resolved = resolve_path(path, workspace);

        for denied in &self.denied {
            let denied = resolve_path(denied, workspace);
            if resolved.starts_with(&denied) {
                return GuardVerdict::Denied(format!(
                    "path '{}' is inside denied path '{}'",
                    resolved.display(),
                    denied.display()
                ));
            }
        }

        let roots = self.allowed_roots(workspace);
        if roots.is_empty() {
            return GuardVerdict::Denied(format!(
                "path '{}' cannot be checked: no workspace bound for workspace-only scope",
                resolved.display()
            ));
        }
        if roots.iter().any(|root| resolved.starts_with(root)) {
            GuardVerdict::Allowed
        } else {
            GuardVerdict::Denied(format!(
                "path '{}' escapes the allowed scope [{}]",
                resolved.display(),
                roots
                    .iter()
                    .map(|r| r.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ))
        }
    }
}

/// Pattern for matching domains; `*.example.com` also matches the bare base.
#[derive(Debug, Clone)]
pub struct DomainPattern {
    pattern: String,
    is_wildcard: bool,
    base_domain: String,
}

impl DomainPattern {
    pub fn new(pattern: &str) -> Self {
        let is_wildcard = pattern.starts_with("*.");
        let base_domain = if is_wildcard {
            pattern[2..].to_lowercase()
        } else {
            pattern.to_lowercase()
        };
        Self {
            pattern: pattern.to_string(),
            is_wildcard,
            base_domain,
        }
    }

    pub fn matches(&self, host: &str) -> bool {
        let host = host.to_lowercase();
        if self.is_wildcard {
            host == self.base_domain || host.ends_with(&format!(".{}", self.base_domain))
        } else {
            host == self.base_domain
        }
    }
}

impl fmt::Display for DomainPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.pattern)
    }
}

/// Split a URL into lowercase `(scheme, host, port)`.
fn split_url(url: &str) -> Option<(String, String, Option<u16>)> {
    let (scheme, rest) = url.split_once("://")?;
    if scheme.is_empty() {
        return None;
    }
    let authority_end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let authority = &rest[..authority_end];
    let host_port = authority.rsplit_once('@').map_or(authority, |(_, hp)| hp);

    let (host, port) = if let Some(stripped) = host_port.strip_prefix('[') {
        let close = stripped.find(']')?;
        let port = stripped[close + 1..]
            .strip_prefix(':')
            .and_then(|p| p.parse().ok());
        (&stripped[..close], port)
    } else if let Some((host, port)) = host_port.rsplit_once(':') {
        match port.parse::<u16>() {
            Ok(port) => (host, Some(port)),
            Err(_) => (host_port, None),
        }
    } else {
        (host_port, None)
    };

    if host.is_empty() {
        None
    } else {
        Some((scheme.to_lowercase(), host.to_lowercase(), port))
    }
}

/// Parse the host from a URL string.
pub fn extract_host(url: &str) -> Option<String> {
    split_url(url).map(|(_, host, _)| host)
}

/// The URL origin: `scheme://host[:port]`.
pub fn url_origin(url: &str) -> Option<String> {
    let (scheme, host, port) = split_url(url)?;
    Some(match port {
        Some(port) => format!("{}://{}:{}", scheme, host, port),
        None => format!("{}://{}", scheme, host),
    })
}

/// Enforces the run's network scope.
#[derive(Debug, Clone)]
pub struct NetworkGuard {
    allowed_domains: Vec<DomainPattern>,
    allowed_urls: Vec<glob::Pattern>,
    denied_domains: Vec<DomainPattern>,
}

impl NetworkGuard {
    pub fn new(scope: &NetworkScope) -> Result<Self, PolicyError> {
        let allowed_urls = scope
            .allowed_urls
            .iter()
            .map(|p| {
                glob::Pattern::new(p).map_err(|e| PolicyError::InvalidPattern {
                    rule_id: "network_scope".to_string(),
                    kind: "url",
                    pattern: p.clone(),
                    message: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            allowed_domains: scope
                .allowed_domains
                .iter()
                .map(|d| DomainPattern::new(d))
                .collect(),
            allowed_urls,
            denied_domains: scope
                .denied_domains
                .iter()
                .map(|d| DomainPattern::new(d))
                .collect(),
        })
    }

    pub fn check(&self, url: &str) -> GuardVerdict {
        let Some(host) = extract_host(url) else {
            return GuardVerdict::Denied(format!("cannot parse host from url '{}'", url));
        };

        if let Some(pattern) = self.denied_domains.iter().find(|p| p.matches(&host)) {
            return GuardVerdict::Denied(format!(
                "host '{}' matches denied domain '{}'",
                host, pattern
            ));
        }

        if self.allowed_domains.is_empty() && self.allowed_urls.is_empty() {
            return GuardVerdict::Allowed;
        }

        if self.allowed_domains.iter().any(|p| p.matches(&host))
            || self.allowed_urls.iter().any(|p| p.matches(url))
        {
            GuardVerdict::Allowed
        } else {
            GuardVerdict::Denied(format!(
                "host '{}' not in network allowlist: [{}]",
                host,
                self.allowed_domains
                    .iter()
                    .map(|p| p.to_string())
                    .chain(self.allowed_urls.iter().map(|p| p.as_str().to_string()))
                    .collect::<Vec<_>>()
                    .join(", ")
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn workspace_guard(denied: Vec<PathBuf>) -> PathGuard {
        PathGuard::new(&PathScope {
            mode: ScopeMode::WorkspaceOnly,
            allowed_paths: vec![],
            denied_paths: denied,
        })
        .unwrap()
    }

    #[test]
    fn test_workspace_scope_allows_inside_and_new_files() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        let guard = workspace_guard(vec![]);
        assert!(guard.check(Path::new("src/main.rs"), Some(dir.path())).is_allowed());
        assert!(
            guard
                .check(&dir.path().join("not/yet/created.txt"), Some(dir.path()))
                .is_allowed()
        );
    }

    #[test]
    fn test_workspace_scope_rejects_parent_escape() {
        let dir = tempdir().unwrap();
        let ws = dir.path().join("ws");
        fs::create_dir_all(&ws).unwrap();
        let guard = workspace_guard(vec![]);
        let verdict = guard.check(Path::new("../outside.txt"), Some(&ws));
        assert!(!verdict.is_allowed());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escape_is_rejected() {
        let dir = tempdir().unwrap();
        let ws = dir.path().join("ws");
        let outside = dir.path().join("outside");
        fs::create_dir_all(&ws).unwrap();
        fs::create_dir_all(&outside).unwrap();
        std::os::unix::fs::symlink(&outside, ws.join("link")).unwrap();

        let guard = workspace_guard(vec![]);
        let verdict = guard.check(Path::new("link/secret.txt"), Some(&ws));
        assert!(matches!(verdict, GuardVerdict::Denied(msg) if msg.contains("escapes")));
    }

    #[test]
    fn test_denied_path_wins_inside_scope() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join(".git")).unwrap();
        let guard = workspace_guard(vec![PathBuf::from(".git")]);
        let verdict = guard.check(Path::new(".git/config"), Some(dir.path()));
        assert!(matches!(verdict, GuardVerdict::Denied(msg) if msg.contains("denied path")));
        assert!(guard.check(Path::new("README.md"), Some(dir.path())).is_allowed());
    }

    #[test]
    fn test_workspace_scope_without_workspace_denies() {
        let guard = workspace_guard(vec![]);
        assert!(!guard.check(Path::new("/tmp/x"), None).is_allowed());
    }

    #[test]
    fn test_custom_scope_requires_paths() {
        let err = PathGuard::new(&PathScope {
            mode: ScopeMode::Custom,
            allowed_paths: vec![],
            denied_paths: vec![],
        });
        assert!(err.is_err());
    }

    #[test]
    fn test_temp_scope() {
        let guard = PathGuard::new(&PathScope {
            mode: ScopeMode::TempOnly,
            ..Default::default()
        })
        .unwrap();
        let inside = std::env::temp_dir().join("conductor-guard-test.txt");
        assert!(guard.check(&inside, None).is_allowed());
    }

    #[test]
    fn test_domain_wildcard_match() {
        let pattern = DomainPattern::new("*.example.com");
        assert!(pattern.matches("api.example.com"));
        assert!(pattern.matches("EXAMPLE.com"));
        assert!(!pattern.matches("badexample.com"));
    }

    #[test]
    fn test_network_guard_denied_wins_over_allowed() {
        let guard = NetworkGuard::new(&NetworkScope {
            allowed_domains: vec!["*.example.com".into()],
            allowed_urls: vec![],
            denied_domains: vec!["evil.example.com".into()],
        })
        .unwrap();
        assert!(guard.check("https://api.example.com/v1").is_allowed());
        assert!(!guard.check("https://evil.example.com/").is_allowed());
        assert!(!guard.check("https://other.org/").is_allowed());
    }

    #[test]
    fn test_network_guard_url_patterns_and_empty_allowlist() {
        let open = NetworkGuard::new(&NetworkScope::default()).unwrap();
        assert!(open.check("https://anything.dev/path").is_allowed());
        assert!(!open.check("not a url").is_allowed());

        let urls = NetworkGuard::new(&NetworkScope {
            allowed_urls: vec!["https://registry.npmjs.org/*".into()],
            ..Default::default()
        })
        .unwrap();
        assert!(urls.check("https://registry.npmjs.org/left-pad").is_allowed());
        assert!(!urls.check("https://github.com/").is_allowed());
    }

    #[test]
    fn test_url_origin() {
        assert_eq!(
            url_origin("https://API.example.com:8443/v1?q=1").as_deref(),
            Some("https://api.example.com:8443")
        );
        assert_eq!(
            url_origin("http://user@localhost/x").as_deref(),
            Some("http://localhost")
        );
        assert_eq!(url_origin("localhost"), None);
    }
}
