use crate::error::{OrchestratorError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Suffix of the compressed representation of an artifact
pub const COMPRESSED_SUFFIX: &str = ".gz";

/// A per-index output file.
///
/// The artifact counts as present when either the plain file or its `.gz`
/// sibling is non-empty. `compressible` decides which of the two the
/// command is told to write.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactDescriptor {
    pub path: PathBuf,
    pub compressible: bool,
}

impl ArtifactDescriptor {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            compressible: false,
        }
    }

    pub fn compressed(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            compressible: true,
        }
    }

    pub fn compressed_path(&self) -> PathBuf {
        let mut p = self.path.clone().into_os_string();
        p.push(COMPRESSED_SUFFIX);
        PathBuf::from(p)
    }

    /// Path the producing command should write to
    pub fn output_path(&self) -> PathBuf {
        if self.compressible {
            self.compressed_path()
        } else {
            self.path.clone()
        }
    }

    /// Both representations, uncompressed first
    pub fn representations(&self) -> [PathBuf; 2] {
        [self.path.clone(), self.compressed_path()]
    }

    pub fn is_present(&self) -> bool {
        self.representations().iter().any(|p| is_non_empty_file(p))
    }

    /// Remove both representations. Returns how many files were deleted.
    pub fn invalidate(&self) -> io::Result<usize> {
        let mut removed = 0;
        for path in self.representations() {
            if remove_if_exists(&path)? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

pub(crate) fn is_non_empty_file(path: &Path) -> bool {
    fs::metadata(path)
        .map(|m| m.is_file() && m.len() > 0)
        .unwrap_or(false)
}

pub(crate) fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Conditions under which a task's previous run is trusted
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionCriterion {
    /// Substring that must appear in the task log
    #[serde(default)]
    pub success_marker: Option<String>,
    /// Require the zero-byte sentinel written after a verified run
    #[serde(default)]
    pub require_sentinel: bool,
}

/// One unit of partitioned work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub index: u32,
    pub command: String,
    pub artifacts: Vec<ArtifactDescriptor>,
    pub log: PathBuf,
    pub sentinel: PathBuf,
}

impl Task {
    pub fn new(index: u32, command: impl Into<String>, log: impl Into<PathBuf>) -> Self {
        let log = log.into();
        let sentinel = sentinel_for(&log);
        Self {
            index,
            command: command.into(),
            artifacts: Vec::new(),
            log,
            sentinel,
        }
    }

    pub fn with_artifact(mut self, artifact: ArtifactDescriptor) -> Self {
        self.artifacts.push(artifact);
        self
    }

    /// Delete every output this task may have left behind
    pub fn invalidate(&self) -> io::Result<usize> {
        let mut removed = 0;
        for artifact in &self.artifacts {
            removed += artifact.invalidate()?;
        }
        if remove_if_exists(&self.sentinel)? {
            removed += 1;
        }
        Ok(removed)
    }
}

/// `log/decode.3.log` -> `log/decode.3.done`
pub fn sentinel_for(log: &Path) -> PathBuf {
    log.with_extension("done")
}

/// Values substituted into `{name}` placeholders
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TemplateVars(BTreeMap<String, String>);

impl TemplateVars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl ToString) {
        self.0.insert(key.into(), value.to_string());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Entries of `other` override entries of `self`
    pub fn merged(&self, other: &TemplateVars) -> TemplateVars {
        let mut merged = self.clone();
        for (k, v) in &other.0 {
            merged.0.insert(k.clone(), v.clone());
        }
        merged
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

/// Command line or path with `{name}` placeholders.
///
/// `${VAR}` is shell syntax and left untouched, as is any brace group whose
/// content is not an identifier (e.g. `awk '{print $1}'`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandTemplate(String);

impl CommandTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        Self(template.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Placeholder names in order of appearance
    pub fn placeholders(&self) -> Vec<&str> {
        scan(&self.0)
            .filter_map(|piece| match piece {
                Piece::Placeholder(name) => Some(name),
                Piece::Literal(_) => None,
            })
            .collect()
    }

    pub fn render(&self, vars: &TemplateVars) -> Result<String> {
        let mut out = String::with_capacity(self.0.len());
        for piece in scan(&self.0) {
            match piece {
                Piece::Literal(text) => out.push_str(text),
                Piece::Placeholder(name) => match vars.get(name) {
                    Some(value) => out.push_str(value),
                    None => {
                        return Err(OrchestratorError::validation(format!(
                            "unknown placeholder {{{}}} in '{}'",
                            name, self.0
                        )))
                    }
                },
            }
        }
        Ok(out)
    }

    /// Fail on placeholders outside `known`
    pub fn check_placeholders(&self, known: impl Fn(&str) -> bool) -> Result<()> {
        match self.placeholders().into_iter().find(|name| !known(*name)) {
            Some(name) => Err(OrchestratorError::validation(format!(
                "unknown placeholder {{{}}} in '{}'",
                name, self.0
            ))),
            None => Ok(()),
        }
    }
}

impl From<&str> for CommandTemplate {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

enum Piece<'a> {
    Literal(&'a str),
    Placeholder(&'a str),
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn scan(template: &str) -> impl Iterator<Item = Piece<'_>> {
    let bytes = template.as_bytes();
    let mut pieces = Vec::new();
    let mut literal_start = 0;
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'{' && (i == 0 || bytes[i - 1] != b'$') {
            if let Some(len) = template[i + 1..].find('}') {
                let name = &template[i + 1..i + 1 + len];
                if is_identifier(name) {
                    if literal_start < i {
                        pieces.push(Piece::Literal(&template[literal_start..i]));
                    }
                    pieces.push(Piece::Placeholder(name));
                    i += len + 2;
                    literal_start = i;
                    continue;
                }
            }
        }
        i += 1;
    }
    if literal_start < template.len() {
        pieces.push(Piece::Literal(&template[literal_start..]));
    }
    pieces.into_iter()
}
