//! Maps logical documents onto `name.pdf` originals and `name.edit.pdf`
//! shadows, and owns every file move, write and delete in the three roots.

use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use crate::config::Data;
use crate::filesystem::{
    build_documents, build_folder, build_path, describe_document, document_name,
    next_versioned_path, normalize_name, original_file_name, shadow_file_name, validate_name,
    validate_subdirectory, Document, DocumentRef, Folder, TargetDirectory,
};
use crate::journal::{Intent, Journal, JournalError};
use crate::pdf::{editing, inspection, PdfError};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Validation(String),
    #[error("file I/O error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Pdf(#[from] PdfError),
    #[error(transparent)]
    Journal(#[from] JournalError),
}

pub type Result<T> = std::result::Result<T, StoreError>;

type LockGuard = ArcMutexGuard<RawMutex, ()>;

/// One mutex per document key (directory + name). Multi-document operations
/// take their keys in sorted order so two of them can never deadlock.
#[derive(Default)]
struct LockTable {
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl LockTable {
    fn acquire(&self, mut keys: Vec<PathBuf>) -> Vec<LockGuard> {
        keys.sort();
        keys.dedup();

        let handles: Vec<Arc<Mutex<()>>> = {
            let mut locks = self.locks.lock();
            // entries nobody holds or waits on
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            keys.into_iter()
                .map(|key| locks.entry(key).or_default().clone())
                .collect()
        };

        handles.iter().map(|lock| lock.lock_arc()).collect()
    }
}

/// Physical files backing one document.
struct Files {
    dir: PathBuf,
    original: PathBuf,
    shadow: PathBuf,
}

impl Files {
    fn in_dir(dir: PathBuf, name: &str) -> Self {
        Files {
            original: dir.join(original_file_name(name)),
            shadow: dir.join(shadow_file_name(name)),
            dir,
        }
    }

    fn lock_key(&self) -> PathBuf {
        self.original.clone()
    }

    fn exists(&self) -> bool {
        self.original.is_file() || self.shadow.is_file()
    }

    fn taken(&self) -> Option<&Path> {
        [&self.original, &self.shadow]
            .into_iter()
            .find(|p| p.exists())
            .map(PathBuf::as_path)
    }
}

fn conflict(path: &Path) -> StoreError {
    StoreError::Conflict(format!("{} already exists", path.display()))
}

fn content_type_base(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Writes `bytes` to a hidden temp file next to `path` and renames it into place.
fn write_atomically(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp = dir.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

    let result = fs::write(&temp, bytes).and_then(|_| fs::rename(&temp, path));
    if result.is_err() {
        let _ = fs::remove_file(&temp);
    }
    result
}

fn create_new(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => file,
        Err(why) if why.kind() == io::ErrorKind::AlreadyExists => return Err(conflict(path)),
        Err(why) => return Err(why.into()),
    };
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}

pub struct DocumentStore {
    inbox: PathBuf,
    outbox: PathBuf,
    archive: PathBuf,
    library_path: Option<PathBuf>,
    journal: Journal,
    locks: LockTable,
}

impl DocumentStore {
    pub fn new(settings: &Data) -> Result<Self> {
        Ok(DocumentStore {
            inbox: settings.root(TargetDirectory::Inbox).to_path_buf(),
            outbox: settings.root(TargetDirectory::Outbox).to_path_buf(),
            archive: settings.root(TargetDirectory::Archive).to_path_buf(),
            library_path: settings.pdf.library_path.clone(),
            journal: Journal::open(&settings.journal_dir())?,
            locks: LockTable::default(),
        })
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn root(&self, target: TargetDirectory) -> &Path {
        match target {
            TargetDirectory::Inbox => &self.inbox,
            TargetDirectory::Outbox => &self.outbox,
            TargetDirectory::Archive => &self.archive,
        }
    }

    fn directory(&self, target: TargetDirectory, subdirectory: Option<&str>) -> Result<PathBuf> {
        if let Some(sub) = subdirectory {
            validate_subdirectory(sub).map_err(StoreError::Validation)?;
        }
        Ok(build_path(self.root(target), subdirectory))
    }

    fn files(&self, doc: &DocumentRef) -> Result<Files> {
        validate_name(&doc.name).map_err(StoreError::Validation)?;
        let dir = self.directory(doc.target, doc.subdirectory.as_deref())?;
        Ok(Files::in_dir(dir, &doc.name))
    }

    /// The shadow when it exists, else the original.
    pub fn resolve(&self, doc: &DocumentRef) -> Result<PathBuf> {
        let files = self.files(doc)?;
        if files.shadow.is_file() {
            Ok(files.shadow)
        } else if files.original.is_file() {
            Ok(files.original)
        } else {
            Err(StoreError::NotFound(doc.to_string()))
        }
    }

    /* reads */

    pub fn list(
        &self,
        target: TargetDirectory,
        subdirectory: Option<&str>,
        recursive: bool,
    ) -> Result<Vec<Document>> {
        let subdirectory = subdirectory.map(|s| s.trim_matches('/')).filter(|s| !s.is_empty());
        let dir = self.directory(target, subdirectory)?;
        if !dir.is_dir() {
            return Err(StoreError::NotFound(dir.display().to_string()));
        }
        Ok(build_documents(
            self.root(target),
            target,
            subdirectory,
            recursive,
        )?)
    }

    pub fn get(&self, doc: &DocumentRef) -> Result<Document> {
        let files = self.files(doc)?;
        describe_document(&files.dir, doc).map_err(|why| match why.kind() {
            io::ErrorKind::NotFound => StoreError::NotFound(doc.to_string()),
            _ => why.into(),
        })
    }

    pub fn folder_tree(&self, target: TargetDirectory) -> Result<Folder> {
        Ok(build_folder(self.root(target), target, None, target.as_str())?)
    }

    pub fn page_count(&self, doc: &DocumentRef) -> Result<u32> {
        Ok(inspection::page_count(&self.resolve(doc)?)?)
    }

    pub fn preview(&self, doc: &DocumentRef, page: u32, width: u32, height: u32) -> Result<Vec<u8>> {
        let path = self.resolve(doc)?;
        Ok(inspection::preview(
            &path,
            page,
            width,
            height,
            self.library_path.as_deref(),
        )?)
    }

    /// Bytes of the resolved file, offered under the original's file name.
    pub fn download(&self, doc: &DocumentRef) -> Result<(String, Vec<u8>)> {
        let path = self.resolve(doc)?;
        Ok((original_file_name(&doc.name), fs::read(path)?))
    }

    /* moves */

    pub fn rename(&self, doc: &DocumentRef, new_name: &str) -> Result<DocumentRef> {
        let new_name = normalize_name(new_name);
        validate_name(&new_name).map_err(StoreError::Validation)?;

        let from = self.files(doc)?;
        let renamed = DocumentRef::new(doc.target, doc.subdirectory.clone(), &new_name);
        if new_name == doc.name {
            return Ok(renamed);
        }
        let to = Files::in_dir(from.dir.clone(), &new_name);

        let _guards = self.locks.acquire(vec![from.lock_key(), to.lock_key()]);
        if !from.exists() {
            return Err(StoreError::NotFound(doc.to_string()));
        }
        if let Some(taken) = to.taken() {
            return Err(conflict(taken));
        }

        self.journal.execute(planned_moves("rename", &from, &to))?;
        tracing::info!("renamed {} to {}", doc, renamed);
        Ok(renamed)
    }

    /// Moves both files to the Archive root, or deletes them in place.
    pub fn archive(&self, doc: &DocumentRef, delete_in_place: bool) -> Result<()> {
        if doc.target == TargetDirectory::Archive {
            return Err(StoreError::Validation(format!("{} is already archived", doc)));
        }

        let from = self.files(doc)?;
        let to = Files::in_dir(self.archive.clone(), &doc.name);

        let _guards = self.locks.acquire(vec![from.lock_key(), to.lock_key()]);
        if !from.exists() {
            return Err(StoreError::NotFound(doc.to_string()));
        }

        if delete_in_place {
            let intent = Intent::new("archive")
                .delete_file(from.shadow.clone())
                .delete_file(from.original.clone());
            self.journal.execute(intent)?;
            tracing::info!("deleted {} instead of archiving it", doc);
            return Ok(());
        }

        if let Some(taken) = to.taken() {
            return Err(conflict(taken));
        }
        self.journal.execute(planned_moves("archive", &from, &to))?;
        tracing::info!("archived {}", doc);
        Ok(())
    }

    /// Moves an archived document back to the Inbox root.
    pub fn restore(&self, doc: &DocumentRef) -> Result<DocumentRef> {
        if doc.target != TargetDirectory::Archive {
            return Err(StoreError::Validation(format!(
                "only archived documents can be restored, {} is not",
                doc
            )));
        }

        let from = self.files(doc)?;
        let to = Files::in_dir(self.inbox.clone(), &doc.name);

        let _guards = self.locks.acquire(vec![from.lock_key(), to.lock_key()]);
        if !from.exists() {
            return Err(StoreError::NotFound(doc.to_string()));
        }
        if let Some(taken) = to.taken() {
            return Err(conflict(taken));
        }

        self.journal.execute(planned_moves("restore", &from, &to))?;
        tracing::info!("restored {}", doc);
        Ok(DocumentRef::new(TargetDirectory::Inbox, None, &doc.name))
    }

    /// Publishes an Inbox document to the Outbox, optionally under a new
    /// name and into an Outbox subdirectory.
    ///
    /// With pending edits the shadow becomes the published file and the
    /// stale original is archived or deleted, depending on `archive_original`.
    pub fn save(
        &self,
        doc: &DocumentRef,
        new_name: Option<&str>,
        destination: Option<&str>,
        archive_original: bool,
    ) -> Result<DocumentRef> {
        if doc.target != TargetDirectory::Inbox {
            return Err(StoreError::Validation(format!(
                "only inbox documents can be saved, {} is not",
                doc
            )));
        }

        let published = DocumentRef::new(
            TargetDirectory::Outbox,
            destination.map(str::to_string),
            new_name.unwrap_or(&doc.name),
        );
        let from = self.files(doc)?;
        let to = self.files(&published)?;
        let stale = Files::in_dir(self.archive.clone(), &doc.name);

        let mut keys = vec![from.lock_key(), to.lock_key()];
        if archive_original {
            keys.push(stale.lock_key());
        }
        let _guards = self.locks.acquire(keys);

        if !from.exists() {
            return Err(StoreError::NotFound(doc.to_string()));
        }
        if let Some(taken) = to.taken() {
            return Err(conflict(taken));
        }

        let has_changes = from.shadow.is_file();
        let intent = if has_changes {
            let intent = Intent::new("save").move_file(from.shadow.clone(), to.original.clone());
            if !from.original.is_file() {
                intent
            } else if archive_original {
                if let Some(taken) = stale.taken() {
                    return Err(conflict(taken));
                }
                intent.move_file(from.original.clone(), stale.original.clone())
            } else {
                intent.delete_file(from.original.clone())
            }
        } else {
            Intent::new("save").move_file(from.original.clone(), to.original.clone())
        };

        fs::create_dir_all(&to.dir)?;
        self.journal.execute(intent)?;
        tracing::info!("saved {} as {} (had changes: {})", doc, published, has_changes);
        Ok(published)
    }

    pub fn permanently_delete(&self, doc: &DocumentRef) -> Result<()> {
        if doc.target != TargetDirectory::Archive {
            return Err(StoreError::Validation(format!(
                "only archived documents can be deleted permanently, {} is not",
                doc
            )));
        }

        let files = self.files(doc)?;
        let _guards = self.locks.acquire(vec![files.lock_key()]);
        if !files.exists() {
            return Err(StoreError::NotFound(doc.to_string()));
        }

        let intent = Intent::new("delete")
            .delete_file(files.shadow.clone())
            .delete_file(files.original.clone());
        self.journal.execute(intent)?;
        tracing::info!("permanently deleted {}", doc);
        Ok(())
    }

    /// Stores an upload in the Inbox root. JPEGs are wrapped into a one page PDF.
    pub fn create(&self, name: &str, bytes: &[u8], content_type: &str) -> Result<DocumentRef> {
        let doc = DocumentRef::new(TargetDirectory::Inbox, None, name);
        let files = self.files(&doc)?;

        let contents = match content_type_base(content_type).as_str() {
            "application/pdf" => bytes.to_vec(),
            "image/jpeg" | "image/jpg" => editing::image_to_pdf(bytes, &doc.name)?,
            other => {
                return Err(StoreError::Validation(format!(
                    "unsupported content type '{}'",
                    other
                )))
            }
        };

        let _guards = self.locks.acquire(vec![files.lock_key()]);
        if let Some(taken) = files.taken() {
            return Err(conflict(taken));
        }
        create_new(&files.original, &contents)?;
        tracing::info!("created {} ({} bytes)", doc, contents.len());
        Ok(doc)
    }

    /* edits */

    /// Runs `operation` on the resolved file and replaces the shadow with its output.
    pub fn edit<F>(&self, doc: &DocumentRef, operation: F) -> Result<()>
    where
        F: FnOnce(&Path) -> crate::pdf::Result<Vec<u8>>,
    {
        let files = self.files(doc)?;
        let _guards = self.locks.acquire(vec![files.lock_key()]);

        let source = self.resolve(doc)?;
        let bytes = operation(&source)?;
        write_atomically(&files.shadow, &bytes)?;
        tracing::debug!("updated shadow of {}", doc);
        Ok(())
    }

    /// Drops pending edits. Reverting a document without edits is a no-op.
    pub fn revert(&self, doc: &DocumentRef) -> Result<()> {
        let files = self.files(doc)?;
        let _guards = self.locks.acquire(vec![files.lock_key()]);

        if !files.exists() {
            return Err(StoreError::NotFound(doc.to_string()));
        }
        if !files.original.is_file() {
            return Err(StoreError::Validation(format!(
                "{} has no original to revert to",
                doc
            )));
        }
        match fs::remove_file(&files.shadow) {
            Ok(()) => tracing::info!("reverted {}", doc),
            Err(why) if why.kind() == io::ErrorKind::NotFound => {
                tracing::debug!("{} has no edits to revert", doc)
            }
            Err(why) => return Err(why.into()),
        }
        Ok(())
    }

    /// Copies `pages` into a new sibling document named `<name>_<N>` and returns it.
    pub fn split(&self, doc: &DocumentRef, pages: &[u32]) -> Result<DocumentRef> {
        let files = self.files(doc)?;
        let _guards = self.locks.acquire(vec![files.lock_key()]);

        let source = self.resolve(doc)?;
        let bytes = editing::split(&source, pages)?;

        // another split of the same document may race us to the next name
        for _ in 0..8 {
            let path = next_versioned_path(&files.dir, &doc.name)?;
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(document_name)
                .map(str::to_string)
                .ok_or_else(|| StoreError::Validation(format!("cannot split {}", doc)))?;

            match create_new(&path, &bytes) {
                Ok(()) => {
                    let created = DocumentRef::new(doc.target, doc.subdirectory.clone(), &name);
                    tracing::info!("split pages {:?} of {} into {}", pages, doc, created);
                    return Ok(created);
                }
                Err(StoreError::Conflict(_)) => continue,
                Err(why) => return Err(why),
            }
        }
        Err(StoreError::Conflict(format!(
            "could not find a free name to split {} into",
            doc
        )))
    }

    /// Appends every page of `other` to `doc`. `other` is read but not changed.
    pub fn merge(&self, doc: &DocumentRef, other: &DocumentRef) -> Result<()> {
        let files = self.files(doc)?;
        let other_files = self.files(other)?;
        if files.original == other_files.original {
            return Err(StoreError::Validation(format!(
                "cannot merge {} into itself",
                doc
            )));
        }

        let _guards = self
            .locks
            .acquire(vec![files.lock_key(), other_files.lock_key()]);
        let source = self.resolve(doc)?;
        let appended = self.resolve(other)?;

        let bytes = editing::merge(&source, &appended)?;
        write_atomically(&files.shadow, &bytes)?;
        tracing::info!("merged {} into {}", other, doc);
        Ok(())
    }
}

/// Moves whichever of the original and shadow exist from one place to another.
fn planned_moves(operation: &str, from: &Files, to: &Files) -> Intent {
    let mut intent = Intent::new(operation);
    if from.original.is_file() {
        intent = intent.move_file(from.original.clone(), to.original.clone());
    }
    if from.shadow.is_file() {
        intent = intent.move_file(from.shadow.clone(), to.shadow.clone());
    }
    intent
}
