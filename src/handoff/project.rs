//! Best-effort project metadata detection from manifest files.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const UNKNOWN_LANGUAGE: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectContext {
    pub name: String,
    pub language: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub framework: Option<String>,
}

impl ProjectContext {
    fn new(name: String, language: &str, framework: Option<&str>) -> Self {
        Self {
            name,
            language: language.to_string(),
            framework: framework.map(str::to_string),
        }
    }
}

const JS_FRAMEWORKS: &[(&str, &str)] = &[
    ("next", "nextjs"),
    ("@angular/core", "angular"),
    ("svelte", "svelte"),
    ("vue", "vue"),
    ("react", "react"),
    ("@nestjs/core", "nestjs"),
    ("fastify", "fastify"),
    ("express", "express"),
];

const RUST_FRAMEWORKS: &[(&str, &str)] = &[
    ("axum", "axum"),
    ("actix-web", "actix-web"),
    ("rocket", "rocket"),
    ("tauri", "tauri"),
    ("leptos", "leptos"),
    ("bevy", "bevy"),
];

const PYTHON_FRAMEWORKS: &[(&str, &str)] = &[
    ("django", "django"),
    ("fastapi", "fastapi"),
    ("flask", "flask"),
];

const GO_FRAMEWORKS: &[(&str, &str)] = &[
    ("github.com/gin-gonic/gin", "gin"),
    ("github.com/labstack/echo", "echo"),
    ("github.com/gofiber/fiber", "fiber"),
];

/// Files that mark an ecosystem when no manifest could be read.
const LANGUAGE_MARKERS: &[(&str, &str)] = &[
    ("Cargo.toml", "rust"),
    ("go.mod", "go"),
    ("tsconfig.json", "typescript"),
    ("package.json", "javascript"),
    ("pyproject.toml", "python"),
    ("requirements.txt", "python"),
    ("setup.py", "python"),
    ("pom.xml", "java"),
    ("build.gradle", "java"),
    ("build.gradle.kts", "kotlin"),
    ("Gemfile", "ruby"),
    ("composer.json", "php"),
    ("mix.exs", "elixir"),
];

fn dir_name(root: &Path) -> String {
    root.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "project".to_string())
}

fn first_framework<'a>(
    table: &'a [(&'a str, &'a str)],
    has: impl Fn(&str) -> bool,
) -> Option<&'a str> {
    table
        .iter()
        .find(|entry| has(entry.0))
        .map(|(_, framework)| *framework)
}

fn from_package_json(root: &Path) -> Option<ProjectContext> {
    let raw = fs::read_to_string(root.join("package.json")).ok()?;
    let manifest: serde_json::Value = serde_json::from_str(&raw).ok()?;
    let has_dep = |dep: &str| {
        ["dependencies", "devDependencies", "peerDependencies"]
            .iter()
            .any(|section| manifest.get(section).and_then(|d| d.get(dep)).is_some())
    };
    let language = if root.join("tsconfig.json").exists() || has_dep("typescript") {
        "typescript"
    } else {
        "javascript"
    };
    let name = manifest
        .get("name")
        .and_then(|n| n.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| dir_name(root));
    Some(ProjectContext::new(
        name,
        language,
        first_framework(JS_FRAMEWORKS, has_dep),
    ))
}

fn from_cargo_toml(root: &Path) -> Option<ProjectContext> {
    let raw = fs::read_to_string(root.join("Cargo.toml")).ok()?;
    let manifest: toml::Table = toml::from_str(&raw).ok()?;
    let name = manifest
        .get("package")
        .and_then(|p| p.get("name"))
        .and_then(|n| n.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| dir_name(root));
    let has_dep = |dep: &str| {
        ["dependencies", "dev-dependencies"]
            .iter()
            .any(|section| manifest.get(*section).and_then(|d| d.get(dep)).is_some())
    };
    Some(ProjectContext::new(
        name,
        "rust",
        first_framework(RUST_FRAMEWORKS, has_dep),
    ))
}

fn from_pyproject(root: &Path) -> Option<ProjectContext> {
    let raw = fs::read_to_string(root.join("pyproject.toml")).ok()?;
    let manifest: toml::Table = toml::from_str(&raw).ok()?;
    let name = manifest
        .get("project")
        .and_then(|p| p.get("name"))
        .or_else(|| {
            manifest
                .get("tool")
                .and_then(|t| t.get("poetry"))
                .and_then(|p| p.get("name"))
        })
        .and_then(|n| n.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| dir_name(root));
    let lowered = raw.to_lowercase();
    Some(ProjectContext::new(
        name,
        "python",
        first_framework(PYTHON_FRAMEWORKS, |dep| lowered.contains(dep)),
    ))
}

fn from_go_mod(root: &Path) -> Option<ProjectContext> {
    let raw = fs::read_to_string(root.join("go.mod")).ok()?;
    let name = raw
        .lines()
        .find_map(|line| line.trim().strip_prefix("module "))
        .map(|m| m.trim().rsplit('/').next().unwrap_or(m).to_string())
        .unwrap_or_else(|| dir_name(root));
    Some(ProjectContext::new(
        name,
        "go",
        first_framework(GO_FRAMEWORKS, |dep| raw.contains(dep)),
    ))
}

/// Probe `root` for a manifest. Never fails; unrecognized projects get
/// `language: "unknown"`.
pub fn detect_project(root: &Path) -> ProjectContext {
    let detected = from_package_json(root)
        .or_else(|| from_cargo_toml(root))
        .or_else(|| from_pyproject(root))
        .or_else(|| from_go_mod(root));
    if let Some(project) = detected {
        return project;
    }

    let language = LANGUAGE_MARKERS
        .iter()
        .find(|(marker, _)| root.join(marker).exists())
        .map(|(_, language)| *language)
        .unwrap_or(UNKNOWN_LANGUAGE);
    ProjectContext::new(dir_name(root), language, None)
}

/// Conventional entry points for a language, relative to the project root.
pub fn entry_point_candidates(language: &str) -> &'static [&'static str] {
    match language {
        "rust" => &["src/main.rs", "src/lib.rs"],
        "typescript" => &["src/index.ts", "src/main.ts", "index.ts", "src/App.tsx"],
        "javascript" => &["index.js", "src/index.js", "src/main.js", "server.js", "src/App.jsx"],
        "python" => &["main.py", "app.py", "manage.py", "src/main.py", "__main__.py"],
        "go" => &["main.go", "cmd/main.go"],
        "java" | "kotlin" => &["src/main/java/Main.java", "src/main/kotlin/Main.kt"],
        "ruby" => &["config.ru", "app.rb"],
        "php" => &["index.php", "public/index.php"],
        "elixir" => &["lib/application.ex"],
        _ => &[],
    }
}

/// Entry points that exist on disk.
pub fn existing_entry_points(root: &Path, language: &str) -> Vec<String> {
    entry_point_candidates(language)
        .iter()
        .filter(|candidate| root.join(candidate).is_file())
        .map(|candidate| candidate.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_package_json_with_framework() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("package.json"),
            r#"{"name": "storefront", "dependencies": {"react": "^18", "next": "14"}, "devDependencies": {"typescript": "5"}}"#,
        )
        .unwrap();
        let project = detect_project(dir.path());
        assert_eq!(project.name, "storefront");
        assert_eq!(project.language, "typescript");
        assert_eq!(project.framework.as_deref(), Some("nextjs"));
    }

    #[test]
    fn test_cargo_manifest() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("Cargo.toml"),
            "[package]\nname = \"gateway\"\nversion = \"0.1.0\"\n\n[dependencies]\naxum = \"0.8\"\n",
        )
        .unwrap();
        let project = detect_project(dir.path());
        assert_eq!(project.name, "gateway");
        assert_eq!(project.language, "rust");
        assert_eq!(project.framework.as_deref(), Some("axum"));
    }

    #[test]
    fn test_pyproject_and_go_mod() {
        let py = tempdir().unwrap();
        fs::write(
            py.path().join("pyproject.toml"),
            "[project]\nname = \"billing\"\ndependencies = [\"fastapi>=0.100\"]\n",
        )
        .unwrap();
        let project = detect_project(py.path());
        assert_eq!((project.name.as_str(), project.language.as_str()), ("billing", "python"));
        assert_eq!(project.framework.as_deref(), Some("fastapi"));

        let go = tempdir().unwrap();
        fs::write(
            go.path().join("go.mod"),
            "module github.com/acme/ledger\n\ngo 1.22\n\nrequire github.com/gin-gonic/gin v1.9.1\n",
        )
        .unwrap();
        let project = detect_project(go.path());
        assert_eq!(project.name, "ledger");
        assert_eq!(project.framework.as_deref(), Some("gin"));
    }

    #[test]
    fn test_marker_fallback_and_unknown() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("Gemfile"), "source 'https://rubygems.org'").unwrap();
        assert_eq!(detect_project(dir.path()).language, "ruby");

        let empty = tempdir().unwrap();
        let project = detect_project(empty.path());
        assert_eq!(project.language, UNKNOWN_LANGUAGE);
        assert!(project.framework.is_none());
    }

    #[test]
    fn test_malformed_manifest_falls_back_to_marker() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("Cargo.toml"), "this is [not toml").unwrap();
        let project = detect_project(dir.path());
        assert_eq!(project.language, "rust");
    }

    #[test]
    fn test_existing_entry_points() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/main.rs"), "fn main() {}").unwrap();
        assert_eq!(existing_entry_points(dir.path(), "rust"), vec!["src/main.rs"]);
        assert!(existing_entry_points(dir.path(), UNKNOWN_LANGUAGE).is_empty());
    }
}
