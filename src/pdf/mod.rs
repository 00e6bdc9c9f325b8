//! PDF inspection, rendering and page editing.
//!
//! Structure work (page counts, health checks, edits, decryption) goes
//! through `lopdf`. Rasterizing a page for previews goes through PDFium,
//! which is bound at runtime and may be absent.

pub mod editing;
pub mod inspection;
pub mod render;

use lopdf::{Document, Object};
use std::fs;
use std::io;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PdfError {
    #[error("file I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("document could not be parsed: {0}")]
    Corrupted(String),

    #[error("document is password protected")]
    PasswordProtected,

    #[error("the password is incorrect")]
    IncorrectPassword,

    #[error("document could not be unlocked: {0}")]
    Unlock(String),

    #[error("page {page} is out of range (document has {count} pages)")]
    PageOutOfRange { page: u32, count: u32 },

    #[error("a document must keep at least one page")]
    LastPage,

    #[error("{0}")]
    InvalidRequest(String),

    #[error("rendering failed: {0}")]
    Render(String),

    #[error("image processing failed: {0}")]
    Image(String),

    #[error("PDF operation failed: {0}")]
    Lopdf(#[from] lopdf::Error),
}

pub type Result<T> = std::result::Result<T, PdfError>;

/// Loads a document, classifying encryption that the empty password cannot open.
pub(crate) fn load(path: &Path) -> Result<Document> {
    let bytes = fs::read(path)?;
    load_bytes(&bytes)
}

/// lopdf already decrypts documents the empty password opens, leaving
/// `encryption_state` set. Anything still encrypted without a state needs a
/// user password.
pub(crate) fn load_bytes(bytes: &[u8]) -> Result<Document> {
    match Document::load_mem(bytes) {
        Ok(mut document) => {
            if document.is_encrypted() {
                if document.encryption_state.is_none() {
                    return Err(PdfError::PasswordProtected);
                }
                drop_encryption(&mut document);
            }
            Ok(document)
        }
        Err(lopdf::Error::Decryption(_)) => Err(PdfError::PasswordProtected),
        Err(_) if declares_encryption(bytes) => Err(PdfError::PasswordProtected),
        Err(why) => Err(PdfError::Corrupted(why.to_string())),
    }
}

/// Forgets the security handler of a document whose objects are already plain.
pub(crate) fn drop_encryption(document: &mut Document) {
    if let Some(Object::Reference(id)) = document.trailer.remove(b"Encrypt") {
        document.objects.remove(&id);
    }
    document.encryption_state = None;
}

fn declares_encryption(bytes: &[u8]) -> bool {
    bytes.windows(b"/Encrypt".len()).any(|w| w == b"/Encrypt")
}

pub(crate) fn to_bytes(mut document: Document) -> Result<Vec<u8>> {
    let mut output = Vec::new();
    document.save_to(&mut output)?;
    Ok(output)
}
