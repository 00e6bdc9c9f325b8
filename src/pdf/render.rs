use image::{DynamicImage, RgbaImage};
use pdfium_render::prelude::*;
use std::io::Cursor;
use std::path::Path;

use super::{PdfError, Result};

/// Binds PDFium, trying the configured directory, the working directory,
/// then the system library paths.
fn create_pdfium(library_path: Option<&Path>) -> Result<Pdfium> {
    let configured = library_path
        .map(|dir| Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(dir)));

    let bindings = match configured {
        Some(Ok(bindings)) => Ok(bindings),
        _ => Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./"))
            .or_else(|_| Pdfium::bind_to_system_library()),
    }
    .map_err(|e| PdfError::Render(format!("failed to load the PDFium library: {:?}", e)))?;

    Ok(Pdfium::new(bindings))
}

/// Rasterizes the zero-based `page_index` and encodes it as PNG.
pub fn render_png(
    path: &Path,
    page_index: u32,
    width: u32,
    height: u32,
    library_path: Option<&Path>,
) -> Result<Vec<u8>> {
    let pdfium = create_pdfium(library_path)?;
    let document = pdfium
        .load_pdf_from_file(path, None)
        .map_err(|e| PdfError::Render(format!("failed to open {:?}: {:?}", path, e)))?;

    let index = PdfPageIndex::try_from(page_index)
        .map_err(|_| PdfError::Render(format!("page index {} is too large", page_index)))?;
    let page = document
        .pages()
        .get(index)
        .map_err(|e| PdfError::Render(format!("failed to load page {}: {:?}", page_index, e)))?;

    let config = PdfRenderConfig::new().set_target_size(width as i32, height as i32);
    let bitmap = page
        .render_with_config(&config)
        .map_err(|e| PdfError::Render(format!("failed to render page {}: {:?}", page_index, e)))?;

    let rgba = bitmap.as_rgba_bytes();
    let buffer = RgbaImage::from_raw(bitmap.width() as u32, bitmap.height() as u32, rgba)
        .ok_or_else(|| PdfError::Image("bitmap size does not match its pixel data".to_string()))?;

    let mut output = Vec::new();
    DynamicImage::ImageRgba8(buffer)
        .write_to(&mut Cursor::new(&mut output), image::ImageFormat::Png)
        .map_err(|e| PdfError::Image(e.to_string()))?;

    tracing::debug!(
        "rendered page {} of {:?} at {}x{} ({} bytes)",
        page_index,
        path,
        width,
        height,
        output.len()
    );
    Ok(output)
}
