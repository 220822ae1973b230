//! File path resolution for step inputs and outputs.
//!
//! Input paths are searched for in a fixed order. Output paths are always
//! rooted under the output directory and never fail to resolve.

use crate::config::EngineConfig;
use crate::errors::EngineWarning;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

/// Directory used when the output root cannot be written.
pub const TEMP_OUTPUT_DIR: &str = "harmonflow-output";

/// Whether a path is read or written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathMode {
    /// An existing file to read.
    Input,
    /// A file to create.
    Output,
}

impl PathMode {
    /// Returns the mode name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Output => "output",
        }
    }
}

/// How a path was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathStrategy {
    /// An absolute path that exists.
    Absolute,
    /// Relative to the base directory.
    BaseDir,
    /// Relative to one of the data directories.
    DataDir,
    /// Matched by file name alone in the primary data directory.
    FilenameFallback,
    /// Under the configured output directory.
    OutputRoot,
    /// Under the temporary directory, since the output root was unusable.
    TempFallback,
    /// Nothing matched.
    NotFound,
}

/// Result of resolving a path.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPath {
    /// The path to use.
    pub path: PathBuf,
    /// Whether the path exists (input) or is writable (output).
    pub found: bool,
    /// The rule that produced `path`.
    pub strategy: PathStrategy,
    /// Set when resolution fell back or failed.
    pub warning: Option<EngineWarning>,
}

/// Resolves input and output paths against configured directories.
#[derive(Debug, Clone)]
pub struct PathResolver {
    base_dir: PathBuf,
    data_dirs: Vec<PathBuf>,
    output_dir: PathBuf,
}

impl PathResolver {
    /// Creates a resolver. The first data directory is the primary one.
    #[must_use]
    pub fn new(
        base_dir: impl Into<PathBuf>,
        data_dirs: Vec<PathBuf>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            base_dir: base_dir.into(),
            data_dirs,
            output_dir: output_dir.into(),
        }
    }

    /// Creates a resolver from engine configuration.
    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            config.base_dir.clone(),
            config.data_search_dirs(),
            config.output_dir.clone(),
        )
    }

    /// The output root.
    #[must_use]
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Resolves a path in the given mode.
    #[must_use]
    pub fn resolve(&self, path: &str, mode: PathMode) -> ResolvedPath {
        match mode {
            PathMode::Input => self.resolve_input(path),
            PathMode::Output => self.resolve_output(path),
        }
    }

    /// Resolves an input path.
    ///
    /// Order: the absolute path as given, then relative to the base
    /// directory, then relative to each data directory, then a file with the
    /// same name in the primary data directory.
    #[must_use]
    pub fn resolve_input(&self, raw: &str) -> ResolvedPath {
        let requested = Path::new(raw);

        if requested.is_absolute() {
            if requested.exists() {
                return found(requested.to_path_buf(), PathStrategy::Absolute);
            }
        } else {
            let candidate = self.base_dir.join(requested);
            if candidate.exists() {
                return found(candidate, PathStrategy::BaseDir);
            }
            for dir in &self.data_dirs {
                let candidate = dir.join(requested);
                if candidate.exists() {
                    return found(candidate, PathStrategy::DataDir);
                }
            }
        }

        if let (Some(primary), Some(name)) = (self.data_dirs.first(), requested.file_name()) {
            let candidate = primary.join(name);
            if candidate.is_file() {
                let warning = EngineWarning::PathFallback {
                    requested: raw.to_string(),
                    resolved: candidate.display().to_string(),
                };
                warn!(
                    requested = %raw,
                    resolved = %candidate.display(),
                    "Input path matched by file name only; this may be the wrong file"
                );
                return ResolvedPath {
                    path: candidate,
                    found: true,
                    strategy: PathStrategy::FilenameFallback,
                    warning: Some(warning),
                };
            }
        }

        let path = if requested.is_absolute() {
            requested.to_path_buf()
        } else {
            self.base_dir.join(requested)
        };
        let warning = EngineWarning::PathResolution {
            path: raw.to_string(),
            mode: PathMode::Input.as_str().to_string(),
            reason: "no candidate location exists".to_string(),
        };
        warning.log();
        ResolvedPath {
            path,
            found: false,
            strategy: PathStrategy::NotFound,
            warning: Some(warning),
        }
    }

    /// Resolves an output path, creating parent directories.
    ///
    /// Absolute paths outside the output root are re-rooted under it and
    /// `..` components are dropped. If the output root cannot be written the
    /// path is placed under the system temporary directory instead.
    #[must_use]
    pub fn resolve_output(&self, raw: &str) -> ResolvedPath {
        let requested = Path::new(raw);
        let relative = requested
            .strip_prefix(&self.output_dir)
            .unwrap_or(requested);
        let relative: PathBuf = relative
            .components()
            .filter(|c| matches!(c, Component::Normal(_)))
            .collect();

        let target = self.output_dir.join(&relative);
        match ensure_parent(&target) {
            Ok(()) => {
                debug!(path = %target.display(), "Resolved output path");
                found(target, PathStrategy::OutputRoot)
            }
            Err(err) => {
                let fallback = std::env::temp_dir().join(TEMP_OUTPUT_DIR).join(&relative);
                let warning = EngineWarning::PathResolution {
                    path: raw.to_string(),
                    mode: PathMode::Output.as_str().to_string(),
                    reason: format!(
                        "output root '{}' is not writable ({err}); using '{}'",
                        self.output_dir.display(),
                        fallback.display()
                    ),
                };
                warning.log();
                let writable = ensure_parent(&fallback).is_ok();
                ResolvedPath {
                    path: fallback,
                    found: writable,
                    strategy: PathStrategy::TempFallback,
                    warning: Some(warning),
                }
            }
        }
    }
}

fn found(path: PathBuf, strategy: PathStrategy) -> ResolvedPath {
    ResolvedPath {
        path,
        found: true,
        strategy,
        warning: None,
    }
}

/// Creates the parent directory of `path` and checks a file can be written
/// there. An existing directory may still be read-only.
fn ensure_parent(path: &Path) -> std::io::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent)?;
    tempfile::NamedTempFile::new_in(parent).map(drop)
}
