//! Patch guard
//!
//! Every patch that leaves the generator passes through here before it can
//! reach verification or the repository host. The guard checks shape, path
//! safety and size limits, and hands back the normalized paths callers must
//! use from then on.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;

/// A single file write: normalized repository-relative path plus full content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePatch {
    pub path: String,
    pub content: String,
}

impl FilePatch {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }
}

/// Ordered set of file writes produced by one generation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchSet {
    pub files: Vec<FilePatch>,
}

impl PatchSet {
    pub fn paths(&self) -> Vec<String> {
        self.files.iter().map(|f| f.path.clone()).collect()
    }

    pub fn total_bytes(&self) -> usize {
        self.files.iter().map(|f| f.content.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ValidationLimits {
    pub max_files: usize,
    pub max_bytes_per_file: usize,
    pub max_total_bytes: usize,
    /// Path prefixes a normalized path must start with (e.g. `src/`)
    pub allowlist: Vec<String>,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self {
            max_files: 20,
            max_bytes_per_file: 200_000,
            max_total_bytes: 1_000_000,
            allowlist: vec!["src/".to_string()],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GuardErrorCode {
    InvalidShape,
    FilesNotArray,
    TooManyFiles,
    InvalidPathType,
    InvalidContentType,
    EmptyPath,
    AbsolutePath,
    PathTraversal,
    ForbiddenGitPath,
    PathNotAllowed,
    DuplicatePath,
    FileTooLarge,
    TotalTooLarge,
}

impl GuardErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            GuardErrorCode::InvalidShape => "INVALID_SHAPE",
            GuardErrorCode::FilesNotArray => "FILES_NOT_ARRAY",
            GuardErrorCode::TooManyFiles => "TOO_MANY_FILES",
            GuardErrorCode::InvalidPathType => "INVALID_PATH_TYPE",
            GuardErrorCode::InvalidContentType => "INVALID_CONTENT_TYPE",
            GuardErrorCode::EmptyPath => "EMPTY_PATH",
            GuardErrorCode::AbsolutePath => "ABSOLUTE_PATH",
            GuardErrorCode::PathTraversal => "PATH_TRAVERSAL",
            GuardErrorCode::ForbiddenGitPath => "FORBIDDEN_GIT_PATH",
            GuardErrorCode::PathNotAllowed => "PATH_NOT_ALLOWED",
            GuardErrorCode::DuplicatePath => "DUPLICATE_PATH",
            GuardErrorCode::FileTooLarge => "FILE_TOO_LARGE",
            GuardErrorCode::TotalTooLarge => "TOTAL_TOO_LARGE",
        }
    }
}

impl fmt::Display for GuardErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct GuardError {
    pub code: GuardErrorCode,
    pub message: String,
    pub details: Option<Value>,
}

impl GuardError {
    fn new(code: GuardErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Which side of the agent boundary a payload came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationPhase {
    /// Patch supplied by a caller (CLI `validate`, request bodies)
    Request,
    /// Patch produced by the text generator
    Response,
}

impl ValidationPhase {
    fn prefix(&self) -> &'static str {
        match self {
            ValidationPhase::Request => "REQUEST_VALIDATION_FAILED",
            ValidationPhase::Response => "RESPONSE_VALIDATION_FAILED",
        }
    }
}

fn absolute_path_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^(?:[a-zA-Z]:)?/").expect("absolute path pattern is valid"))
}

/// Normalize a repository-relative path and enforce path-safety rules.
///
/// Backslashes become forward slashes, empty and `.` segments are dropped.
/// Absolute paths, `..` segments, anything under `.git`, and paths outside
/// `allowlist` are rejected.
pub fn safe_path(raw_path: &str, allowlist: &[String]) -> Result<String, GuardError> {
    let path = raw_path.trim().replace('\\', "/");
    if path.is_empty() {
        return Err(GuardError::new(
            GuardErrorCode::EmptyPath,
            "File path must not be empty.",
        ));
    }

    if absolute_path_pattern().is_match(&path) {
        return Err(GuardError::new(
            GuardErrorCode::AbsolutePath,
            format!("Absolute path is not allowed: {}", raw_path),
        ));
    }

    let segments: Vec<&str> = path.split('/').collect();
    if segments.iter().any(|segment| *segment == "..") {
        return Err(GuardError::new(
            GuardErrorCode::PathTraversal,
            format!("Path traversal is not allowed: {}", raw_path),
        ));
    }

    let normalized = segments
        .into_iter()
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect::<Vec<_>>()
        .join("/");

    if normalized.is_empty() || normalized == ".git" || normalized.starts_with(".git/") {
        return Err(GuardError::new(
            GuardErrorCode::ForbiddenGitPath,
            format!("Access to .git is forbidden: {}", raw_path),
        ));
    }

    if !allowlist
        .iter()
        .any(|prefix| normalized.starts_with(prefix.as_str()))
    {
        return Err(GuardError::new(
            GuardErrorCode::PathNotAllowed,
            format!("Path is outside allowlist: {}", raw_path),
        )
        .with_details(json!({ "allowlist": allowlist })));
    }

    Ok(normalized)
}

/// Validate a raw `{ "files": [...] }` payload against `limits`.
///
/// Checks run in a fixed order and stop at the first failure. The returned
/// set carries normalized paths and untouched content.
pub fn validate(value: &Value, limits: &ValidationLimits) -> Result<PatchSet, GuardError> {
    let object = value.as_object().ok_or_else(|| {
        GuardError::new(
            GuardErrorCode::InvalidShape,
            "Output must be an object with a files array.",
        )
    })?;

    let entries = object
        .get("files")
        .and_then(Value::as_array)
        .ok_or_else(|| {
            GuardError::new(GuardErrorCode::FilesNotArray, "Output.files must be an array.")
        })?;

    if entries.len() > limits.max_files {
        return Err(
            GuardError::new(GuardErrorCode::TooManyFiles, "Too many files in one request.")
                .with_details(json!({
                    "maxFiles": limits.max_files,
                    "provided": entries.len(),
                })),
        );
    }

    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut total_bytes = 0usize;
    let mut files = Vec::with_capacity(entries.len());

    for (index, entry) in entries.iter().enumerate() {
        let entry = entry.as_object().ok_or_else(|| {
            GuardError::new(
                GuardErrorCode::InvalidShape,
                format!("File entry at index {} must be an object.", index),
            )
        })?;

        let path = entry.get("path").and_then(Value::as_str).ok_or_else(|| {
            GuardError::new(
                GuardErrorCode::InvalidPathType,
                format!("File path at index {} must be a string.", index),
            )
        })?;

        let content = entry.get("content").and_then(Value::as_str).ok_or_else(|| {
            GuardError::new(
                GuardErrorCode::InvalidContentType,
                format!("File content at index {} must be a string.", index),
            )
        })?;

        let safe = safe_path(path, &limits.allowlist)?;

        if let Some(first_index) = seen.get(&safe) {
            return Err(GuardError::new(
                GuardErrorCode::DuplicatePath,
                format!("Path appears more than once after normalization: {}", safe),
            )
            .with_details(json!({
                "path": safe,
                "firstIndex": first_index,
                "index": index,
            })));
        }
        seen.insert(safe.clone(), index);

        let file_bytes = content.len();
        if file_bytes > limits.max_bytes_per_file {
            return Err(GuardError::new(
                GuardErrorCode::FileTooLarge,
                format!("File exceeds byte limit: {}", safe),
            )
            .with_details(json!({
                "maxBytesPerFile": limits.max_bytes_per_file,
                "provided": file_bytes,
            })));
        }

        total_bytes += file_bytes;
        if total_bytes > limits.max_total_bytes {
            return Err(GuardError::new(
                GuardErrorCode::TotalTooLarge,
                "Total payload exceeds byte limit.",
            )
            .with_details(json!({
                "maxTotalBytes": limits.max_total_bytes,
                "provided": total_bytes,
            })));
        }

        files.push(FilePatch::new(safe, content));
    }

    Ok(PatchSet { files })
}

/// Same as [`validate`], with the message tagged by the side of the boundary
/// the payload came from. The error code is preserved.
pub fn validate_phase(
    value: &Value,
    limits: &ValidationLimits,
    phase: ValidationPhase,
) -> Result<PatchSet, GuardError> {
    validate(value, limits).map_err(|mut err| {
        err.message = format!("{}: {}", phase.prefix(), err.message);
        err
    })
}
