use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::pdf::inspection::{self, DocumentStatus};

pub const PDF_EXTENSION: &str = ".pdf";
pub const SHADOW_EXTENSION: &str = ".edit.pdf";

const FORBIDDEN_CHARACTERS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// The three storage roots a document moves through.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum TargetDirectory {
    Inbox,
    Outbox,
    Archive,
}

impl TargetDirectory {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetDirectory::Inbox => "inbox",
            TargetDirectory::Outbox => "outbox",
            TargetDirectory::Archive => "archive",
        }
    }
}

impl fmt::Display for TargetDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetDirectory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "inbox" => Ok(TargetDirectory::Inbox),
            "outbox" => Ok(TargetDirectory::Outbox),
            "archive" => Ok(TargetDirectory::Archive),
            _ => Err(format!("unsupported target directory '{}'", s)),
        }
    }
}

impl TryFrom<String> for TargetDirectory {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Logical identity of a document: root, optional relative folder, and stem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentRef {
    pub target: TargetDirectory,
    pub subdirectory: Option<String>,
    pub name: String,
}

impl DocumentRef {
    pub fn new(target: TargetDirectory, subdirectory: Option<String>, name: &str) -> Self {
        DocumentRef {
            target,
            subdirectory: subdirectory
                .map(|s| s.trim_matches('/').to_string())
                .filter(|s| !s.is_empty()),
            name: normalize_name(name),
        }
    }

    pub fn id(&self) -> String {
        generate_id(&self.name, self.subdirectory.as_deref(), self.target)
    }
}

impl fmt::Display for DocumentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.subdirectory {
            Some(sub) => write!(f, "{}/{}/{}", self.target, sub, self.name),
            None => write!(f, "{}/{}", self.target, self.name),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: String,
    pub name: String,
    pub target_directory: TargetDirectory,
    pub subdirectory: Option<String>,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    pub has_changes: bool,
    pub status: DocumentStatus,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Folder {
    pub name: String,
    pub folders: Vec<Folder>,
    pub documents: Vec<Document>,
}

/* naming convention */

pub fn original_file_name(name: &str) -> String {
    format!("{}{}", name, PDF_EXTENSION)
}

pub fn shadow_file_name(name: &str) -> String {
    format!("{}{}", name, SHADOW_EXTENSION)
}

/// Strips a client supplied `.pdf` extension so names are always stems.
pub fn normalize_name(name: &str) -> String {
    let trimmed = name.trim();
    if trimmed.len() > PDF_EXTENSION.len()
        && trimmed.to_ascii_lowercase().ends_with(PDF_EXTENSION)
    {
        trimmed[..trimmed.len() - PDF_EXTENSION.len()].to_string()
    } else {
        trimmed.to_string()
    }
}

/// Document stem for an original file name, `None` for shadows and non-PDFs.
pub fn document_name(file_name: &str) -> Option<&str> {
    if file_name.ends_with(SHADOW_EXTENSION) {
        return None;
    }
    file_name
        .strip_suffix(PDF_EXTENSION)
        .filter(|stem| !stem.is_empty())
}

pub fn validate_name(name: &str) -> Result<(), String> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(format!("'{}' is not a valid document name", name));
    }
    if let Some(c) = name
        .chars()
        .find(|c| c.is_control() || FORBIDDEN_CHARACTERS.contains(c))
    {
        return Err(format!("document name '{}' contains invalid character {:?}", name, c));
    }
    if name.ends_with(".edit") {
        return Err(format!("document name '{}' may not end with '.edit'", name));
    }
    Ok(())
}

/// Subdirectories are relative, slash separated, and never leave their root.
pub fn validate_subdirectory(subdirectory: &str) -> Result<(), String> {
    if subdirectory.starts_with('/') || subdirectory.starts_with('\\') {
        return Err(format!("subdirectory '{}' must be relative", subdirectory));
    }
    for part in subdirectory.split('/').filter(|p| !p.is_empty()) {
        validate_name(part).map_err(|_| format!("'{}' is not a valid subdirectory", subdirectory))?;
    }
    Ok(())
}

/* generic functions */

pub fn build_path(base_path: &Path, subdirectory: Option<&str>) -> PathBuf {
    match subdirectory {
        Some(sub) => sub
            .split('/')
            .filter(|p| !p.is_empty())
            .fold(base_path.to_path_buf(), |path, part| path.join(part)),
        None => base_path.to_path_buf(),
    }
}

pub fn generate_id(name: &str, subdirectory: Option<&str>, target: TargetDirectory) -> String {
    let mut hasher = Sha256::new();

    hasher.update(target.as_str());
    if let Some(sub) = subdirectory {
        hasher.update(sub);
    }
    hasher.update("/");
    hasher.update(name);

    format!("{:x}", hasher.finalize())
}

/// Moves a file, falling back to copy + delete when a rename cannot cross devices.
pub fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(rename_error) => {
            if !from.exists() {
                return Err(rename_error);
            }
            tracing::debug!(
                "rename {:?} -> {:?} failed ({}), copying instead",
                from,
                to,
                rename_error
            );
            fs::copy(from, to)?;
            fs::remove_file(from)
        }
    }
}

/// Picks `name_<N>.pdf` with N one above the highest existing numeric suffix.
pub fn next_versioned_path(dir: &Path, name: &str) -> io::Result<PathBuf> {
    let mut highest = 0u64;

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };

        let stem = file_name
            .strip_suffix(SHADOW_EXTENSION)
            .or_else(|| file_name.strip_suffix(PDF_EXTENSION));
        let Some(stem) = stem else {
            continue;
        };

        let version = stem
            .strip_prefix(name)
            .and_then(|rest| rest.strip_prefix('_'))
            .filter(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|digits| digits.parse::<u64>().ok());

        if let Some(version) = version {
            highest = highest.max(version);
        }
    }

    Ok(dir.join(original_file_name(&format!("{}_{}", name, highest + 1))))
}

fn file_times(path: &Path) -> io::Result<(DateTime<Utc>, DateTime<Utc>)> {
    let metadata = fs::metadata(path)?;
    let modified = metadata.modified()?;
    let created = metadata.created().unwrap_or(modified);
    Ok((created.into(), modified.into()))
}

/// Builds the listing entry for a document whose original lives in `dir`.
pub fn describe_document(dir: &Path, doc: &DocumentRef) -> io::Result<Document> {
    let original = dir.join(original_file_name(&doc.name));
    let shadow = dir.join(shadow_file_name(&doc.name));
    let has_changes = shadow.is_file();

    let authoritative = if has_changes { &shadow } else { &original };
    if !authoritative.is_file() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} not found", doc),
        ));
    }

    let (created, _) = file_times(if original.is_file() { &original } else { &shadow })?;
    let (_, modified) = file_times(authoritative)?;

    Ok(Document {
        id: doc.id(),
        name: doc.name.clone(),
        target_directory: doc.target,
        subdirectory: doc.subdirectory.clone(),
        created,
        modified,
        has_changes,
        status: inspection::status(authoritative),
    })
}

fn is_hidden(entry: &fs::DirEntry) -> bool {
    entry.file_name().to_string_lossy().starts_with('.')
}

fn join_subdirectory(parent: Option<&str>, child: &str) -> String {
    match parent {
        Some(parent) => format!("{}/{}", parent, child),
        None => child.to_string(),
    }
}

/// Lists the documents below `dir`, descending into folders when `recursive`.
pub fn build_documents(
    root: &Path,
    target: TargetDirectory,
    subdirectory: Option<&str>,
    recursive: bool,
) -> io::Result<Vec<Document>> {
    let dir = build_path(root, subdirectory);
    tracing::debug!("build_documents with {:?} (recursive: {})", dir, recursive);

    let mut documents = Vec::new();
    let mut folders = Vec::new();

    for entry in fs::read_dir(&dir)? {
        let entry = entry?;
        if is_hidden(&entry) {
            continue;
        }
        let file_type = entry.file_type()?;
        let file_name = entry.file_name().to_string_lossy().into_owned();

        if file_type.is_dir() {
            folders.push(file_name);
        } else if let Some(name) = document_name(&file_name) {
            let doc = DocumentRef::new(target, subdirectory.map(str::to_string), name);
            match describe_document(&dir, &doc) {
                Ok(document) => documents.push(document),
                // the file moved away between read_dir and stat
                Err(why) if why.kind() == io::ErrorKind::NotFound => {
                    tracing::debug!("{} vanished while listing", doc)
                }
                Err(why) => return Err(why),
            }
        }
    }

    if recursive {
        folders.sort();
        for folder in folders {
            let child = join_subdirectory(subdirectory, &folder);
            documents.extend(build_documents(root, target, Some(&child), true)?);
        }
    }

    documents.sort_by(|a, b| {
        a.subdirectory
            .cmp(&b.subdirectory)
            .then_with(|| a.name.cmp(&b.name))
    });
    Ok(documents)
}

/// Recursively scans a root into a [`Folder`] tree. Nothing is cached.
pub fn build_folder(
    root: &Path,
    target: TargetDirectory,
    subdirectory: Option<&str>,
    name: &str,
) -> io::Result<Folder> {
    let dir = build_path(root, subdirectory);

    let mut folders = Vec::new();
    for entry in fs::read_dir(&dir)? {
        let entry = entry?;
        if is_hidden(&entry) || !entry.file_type()?.is_dir() {
            continue;
        }
        let child_name = entry.file_name().to_string_lossy().into_owned();
        let child = join_subdirectory(subdirectory, &child_name);
        folders.push(build_folder(root, target, Some(&child), &child_name)?);
    }
    folders.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(Folder {
        name: name.to_string(),
        folders,
        documents: build_documents(root, target, subdirectory, false)?,
    })
}
