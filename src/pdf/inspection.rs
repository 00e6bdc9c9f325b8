use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{load, render, PdfError, Result};

pub const MAX_PREVIEW_SIZE: u32 = 4096;

/// Health of a document as seen by the PDF parser.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum DocumentStatus {
    Ok,
    Corrupted,
    PasswordProtected,
}

pub fn page_count(path: &Path) -> Result<u32> {
    Ok(load(path)?.get_pages().len() as u32)
}

pub fn status(path: &Path) -> DocumentStatus {
    match load(path) {
        Ok(_) => DocumentStatus::Ok,
        Err(PdfError::PasswordProtected) => DocumentStatus::PasswordProtected,
        Err(why) => {
            tracing::debug!("{:?} is unreadable: {}", path, why);
            DocumentStatus::Corrupted
        }
    }
}

/// Renders 1-based `page_number` to a PNG of exactly `width` x `height` pixels.
pub fn preview(
    path: &Path,
    page_number: u32,
    width: u32,
    height: u32,
    library_path: Option<&Path>,
) -> Result<Vec<u8>> {
    let count = page_count(path)?;
    if page_number == 0 || page_number > count {
        return Err(PdfError::PageOutOfRange {
            page: page_number,
            count,
        });
    }

    let width = width.clamp(1, MAX_PREVIEW_SIZE);
    let height = height.clamp(1, MAX_PREVIEW_SIZE);

    render::render_png(path, page_number - 1, width, height, library_path)
}
