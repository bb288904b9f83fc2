//! Repository metadata ingestion.
//!
//! Walks a checked-out repository with the `ignore` crate (gitignore aware),
//! counts lines in parallel with rayon, reads root-level dependency
//! manifests and derives the detected stack and basic counts.
//!
//! Supported manifests: `package.json`, `requirements.txt`, `Cargo.toml`.

use ignore::WalkBuilder;
use rayon::prelude::*;
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info};

use crate::types::{Dependency, DetectedStack, FileEntry, RepoMetadata, RepoStats};

/// Directories never descended into.
const IGNORED_DIRS: &[&str] = &[
    ".git",
    "node_modules",
    ".next",
    "__pycache__",
    ".venv",
    "venv",
    "dist",
    "build",
    "target",
];

/// Default cap on the file inventory carried in [`RepoMetadata::files`].
pub const DEFAULT_MAX_FILES: usize = 500;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Path does not exist: {0}")]
    RootNotFound(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Options controlling ingestion.
#[derive(Debug, Clone)]
pub struct IngestOptions {
    /// Maximum number of files kept in the inventory. Stats still count all.
    pub max_files: usize,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            max_files: DEFAULT_MAX_FILES,
        }
    }
}

/// Language name for a file extension.
fn detect_language(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?;
    match ext.to_lowercase().as_str() {
        "py" => Some("Python"),
        "js" | "jsx" | "mjs" => Some("JavaScript"),
        "ts" | "tsx" => Some("TypeScript"),
        "java" => Some("Java"),
        "go" => Some("Go"),
        "rs" => Some("Rust"),
        "rb" => Some("Ruby"),
        "php" => Some("PHP"),
        "cs" => Some("C#"),
        "cpp" | "cc" | "hpp" => Some("C++"),
        "c" | "h" => Some("C"),
        "swift" => Some("Swift"),
        "kt" | "kts" => Some("Kotlin"),
        "vue" => Some("Vue"),
        "svelte" => Some("Svelte"),
        _ => None,
    }
}

/// Count lines the way a line iterator would: a trailing fragment without
/// a newline still counts.
fn count_lines(path: &Path) -> u32 {
    match fs::read(path) {
        Ok(content) => {
            let newlines = bytecount::count(&content, b'\n');
            let trailing = usize::from(!content.is_empty() && !content.ends_with(b"\n"));
            (newlines + trailing) as u32
        }
        Err(_) => 0,
    }
}

/// Ingest a repository rooted at `root`.
pub fn ingest(root: &Path, options: &IngestOptions) -> Result<RepoMetadata, IngestError> {
    let start = Instant::now();
    if !root.is_dir() {
        return Err(IngestError::RootNotFound(root.to_path_buf()));
    }

    let mut builder = WalkBuilder::new(root);
    builder
        .hidden(false) // Include hidden files, let gitignore handle it
        .git_ignore(true)
        .git_exclude(true)
        .require_git(false) // Honour .gitignore even outside a git checkout
        .filter_entry(|entry| {
            let is_dir = entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false);
            !(is_dir
                && entry
                    .file_name()
                    .to_str()
                    .map(|name| IGNORED_DIRS.contains(&name))
                    .unwrap_or(false))
        });

    let paths: Vec<PathBuf> = builder
        .build()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_file()).unwrap_or(false))
        .map(|entry| entry.into_path())
        .collect();

    let mut files: Vec<FileEntry> = paths
        .par_iter()
        .map(|path| {
            let rel_path = path
                .strip_prefix(root)
                .unwrap_or(path)
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            let language = detect_language(path).unwrap_or("");
            FileEntry::new(rel_path, language, count_lines(path))
        })
        .collect();
    files.sort_by(|a, b| a.path.cmp(&b.path));

    let mut language_lines: HashMap<&str, u64> = HashMap::new();
    let mut total_lines = 0u64;
    for file in &files {
        total_lines += u64::from(file.lines);
        if !file.language.is_empty() {
            *language_lines.entry(file.language.as_str()).or_default() += u64::from(file.lines);
        }
    }
    let mut ranked: Vec<(&str, u64)> = language_lines.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));

    let mut dependencies = Vec::new();
    let has_package_json = read_manifest(root, "package.json", parse_package_json, &mut dependencies);
    let has_requirements = read_manifest(root, "requirements.txt", parse_requirements, &mut dependencies);
    let has_cargo = read_manifest(root, "Cargo.toml", parse_cargo_toml, &mut dependencies);

    let package_manager = if has_package_json {
        "npm"
    } else if has_requirements {
        "pip"
    } else if has_cargo {
        "cargo"
    } else {
        "unknown"
    };
    let build_system = if dependencies.iter().any(|d| d.name == "next") {
        "next"
    } else if has_cargo {
        "cargo"
    } else {
        "unknown"
    };

    let detected_stack = DetectedStack {
        languages: ranked.iter().take(5).map(|(lang, _)| lang.to_string()).collect(),
        frameworks: detect_frameworks(&dependencies),
        package_manager: package_manager.to_string(),
        build_system: build_system.to_string(),
    };

    let stats = RepoStats {
        total_files: files.len() as u64,
        total_lines,
        total_dependencies: dependencies.iter().filter(|d| !d.is_dev).count() as u64,
        total_dev_dependencies: dependencies.iter().filter(|d| d.is_dev).count() as u64,
        total_functions: 0,
        total_endpoints: 0,
    };

    files.truncate(options.max_files);

    info!(
        "Ingested {} files ({} kept), {} dependencies in {:?}",
        stats.total_files,
        files.len(),
        dependencies.len(),
        start.elapsed()
    );

    Ok(RepoMetadata {
        files,
        dependencies,
        detected_stack,
        stats,
    })
}

/// Parse a root-level manifest if present. Unreadable or malformed manifests
/// contribute nothing. Returns whether the manifest exists.
fn read_manifest(
    root: &Path,
    name: &str,
    parse: fn(&str) -> Option<Vec<Dependency>>,
    out: &mut Vec<Dependency>,
) -> bool {
    let path = root.join(name);
    if !path.is_file() {
        return false;
    }
    match fs::read(&path).map(|bytes| String::from_utf8_lossy(&bytes).into_owned()) {
        Ok(content) => match parse(&content) {
            Some(deps) => out.extend(deps.into_iter().map(|d| d.declared_in(name))),
            None => debug!("Skipping malformed manifest {}", name),
        },
        Err(e) => debug!("Could not read {}: {}", name, e),
    }
    true
}

fn parse_package_json(content: &str) -> Option<Vec<Dependency>> {
    let pkg: serde_json::Value = serde_json::from_str(content).ok()?;
    let mut deps = Vec::new();
    for (section, is_dev) in [("dependencies", false), ("devDependencies", true)] {
        if let Some(table) = pkg.get(section).and_then(|v| v.as_object()) {
            for (name, version) in table {
                let version = version.as_str().unwrap_or("*");
                deps.push(Dependency::new(name.clone(), version, is_dev));
            }
        }
    }
    Some(deps)
}

fn parse_requirements(content: &str) -> Option<Vec<Dependency>> {
    let deps = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with('-'))
        .map(|line| {
            let normalized = line.replace(">=", "==").replace("<=", "==");
            let mut parts = normalized.splitn(2, "==");
            let name = parts.next().unwrap_or_default().trim().to_string();
            let version = parts
                .next()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| "latest".to_string());
            Dependency::new(name, version, false)
        })
        .filter(|d| !d.name.is_empty())
        .collect();
    Some(deps)
}

fn parse_cargo_toml(content: &str) -> Option<Vec<Dependency>> {
    let manifest: toml::Value = content.parse().ok()?;
    let mut deps = Vec::new();
    for (section, is_dev) in [("dependencies", false), ("dev-dependencies", true)] {
        if let Some(table) = manifest.get(section).and_then(|v| v.as_table()) {
            for (name, spec) in table {
                let version = match spec {
                    toml::Value::String(v) => v.clone(),
                    toml::Value::Table(t) => t
                        .get("version")
                        .and_then(|v| v.as_str())
                        .unwrap_or("*")
                        .to_string(),
                    _ => "*".to_string(),
                };
                deps.push(Dependency::new(name.clone(), version, is_dev));
            }
        }
    }
    Some(deps)
}

/// Frameworks implied by dependency names.
fn detect_frameworks(deps: &[Dependency]) -> Vec<String> {
    let names: BTreeSet<String> = deps.iter().map(|d| d.name.to_lowercase()).collect();
    let known: [(&[&str], &str); 9] = [
        (&["next"], "Next.js"),
        (&["react"], "React"),
        (&["express"], "Express"),
        (&["fastapi"], "FastAPI"),
        (&["django"], "Django"),
        (&["vue"], "Vue"),
        (&["angular", "@angular/core"], "Angular"),
        (&["axum"], "Axum"),
        (&["actix-web"], "Actix"),
    ];
    let frameworks: Vec<String> = known
        .iter()
        .filter(|(keys, _)| keys.iter().any(|k| names.contains(*k)))
        .map(|(_, name)| name.to_string())
        .collect();
    if frameworks.is_empty() {
        vec!["Unknown".to_string()]
    } else {
        frameworks
    }
}
