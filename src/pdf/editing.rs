//! Page level edits. Every edit loads the whole source document, rebuilds it
//! in memory and hands back the serialized result for the store to write.

use lopdf::encryption::DecryptionError;
use lopdf::{Document, Object, ObjectId};
use printpdf::{
    Mm, Op, PdfDocument, PdfPage, PdfSaveOptions, PdfWarnMsg, Pt, RawImage, RawImageData,
    RawImageFormat, XObjectTransform,
};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use super::{drop_encryption, load, load_bytes, to_bytes, PdfError, Result};

/// Page attributes a page may inherit from its ancestors in the page tree.
const INHERITABLE_KEYS: [&[u8]; 4] = [b"Resources", b"MediaBox", b"CropBox", b"Rotate"];

/* in-memory operations */

fn page_ids(doc: &Document) -> Vec<ObjectId> {
    doc.get_pages().into_values().collect()
}

fn page_id(pages: &[ObjectId], page: u32) -> Result<ObjectId> {
    let count = pages.len() as u32;
    if page == 0 || page > count {
        return Err(PdfError::PageOutOfRange { page, count });
    }
    Ok(pages[(page - 1) as usize])
}

/// Looks `key` up on the page, then on each `/Parent` above it.
fn inherited(doc: &Document, page: ObjectId, key: &[u8]) -> Option<Object> {
    let mut current = Some(page);
    // bounded walk; malformed files can contain parent cycles
    for _ in 0..64 {
        let node = doc.get_object(current?).and_then(Object::as_dict).ok()?;
        if let Ok(value) = node.get(key) {
            return Some(value.clone());
        }
        current = node.get(b"Parent").and_then(Object::as_reference).ok();
    }
    None
}

/// Copies inherited attributes onto the page so it can be re-parented.
fn materialize_inherited(doc: &mut Document, page: ObjectId) -> Result<()> {
    let values: Vec<(&[u8], Object)> = INHERITABLE_KEYS
        .iter()
        .filter_map(|key| inherited(doc, page, key).map(|value| (*key, value)))
        .collect();

    let dict = doc.get_object_mut(page).and_then(Object::as_dict_mut)?;
    for (key, value) in values {
        if !dict.has(key) {
            dict.set(key.to_vec(), value);
        }
    }
    Ok(())
}

fn pages_root(doc: &Document) -> Result<ObjectId> {
    Ok(doc.catalog()?.get(b"Pages").and_then(Object::as_reference)?)
}

/// Replaces the page tree with a single flat node holding `order`.
fn rebuild_page_tree(doc: &mut Document, order: &[ObjectId]) -> Result<()> {
    for page in order {
        materialize_inherited(doc, *page)?;
    }

    let root = pages_root(doc)?;
    {
        let root_dict = doc.get_object_mut(root).and_then(Object::as_dict_mut)?;
        root_dict.set(
            "Kids",
            order
                .iter()
                .map(|id| Object::Reference(*id))
                .collect::<Vec<_>>(),
        );
        root_dict.set("Count", order.len() as i64);
        root_dict.remove(b"Parent");
    }

    for page in order {
        let page_dict = doc.get_object_mut(*page).and_then(Object::as_dict_mut)?;
        page_dict.set("Parent", root);
    }

    doc.prune_objects();
    Ok(())
}

fn current_rotation(doc: &Document, page: ObjectId) -> i64 {
    inherited(doc, page, b"Rotate")
        .and_then(|value| value.as_i64().ok())
        .unwrap_or(0)
}

pub fn rotate_pages(doc: &mut Document, pages: &[u32], degrees: i32) -> Result<()> {
    if degrees == 0 || degrees % 90 != 0 {
        return Err(PdfError::InvalidRequest(format!(
            "rotation must be a non-zero multiple of 90 degrees, got {}",
            degrees
        )));
    }
    let selected: BTreeSet<u32> = pages.iter().copied().collect();
    if selected.is_empty() {
        return Err(PdfError::InvalidRequest("no pages selected".to_string()));
    }

    let all = page_ids(doc);
    let targets = selected
        .iter()
        .map(|page| page_id(&all, *page))
        .collect::<Result<Vec<_>>>()?;

    for page in targets {
        let rotation = (current_rotation(doc, page) + degrees as i64).rem_euclid(360);
        let dict = doc.get_object_mut(page).and_then(Object::as_dict_mut)?;
        dict.set("Rotate", rotation);
    }
    Ok(())
}

/// Removes pages one by one; after K removals page N sits at position N - K.
pub fn delete_pages(doc: &mut Document, pages: &[u32]) -> Result<()> {
    let mut sorted = pages.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    if sorted.is_empty() {
        return Err(PdfError::InvalidRequest("no pages selected".to_string()));
    }

    let count = doc.get_pages().len() as u32;
    if let Some(page) = sorted.iter().find(|page| **page == 0 || **page > count) {
        return Err(PdfError::PageOutOfRange { page: *page, count });
    }
    if sorted.len() as u32 >= count {
        return Err(PdfError::LastPage);
    }

    for (removed, page) in sorted.iter().enumerate() {
        doc.delete_pages(&[page - removed as u32]);
    }
    doc.prune_objects();
    Ok(())
}

pub fn reorder_pages(doc: &mut Document, order: &[u32]) -> Result<()> {
    let all = page_ids(doc);
    let mut check = order.to_vec();
    check.sort_unstable();
    if !check.iter().copied().eq(1..=all.len() as u32) {
        return Err(PdfError::InvalidRequest(format!(
            "page order must list each of the {} pages exactly once",
            all.len()
        )));
    }

    let ids = order
        .iter()
        .map(|page| page_id(&all, *page))
        .collect::<Result<Vec<_>>>()?;
    rebuild_page_tree(doc, &ids)
}

/// Keeps only `pages`, in the given order.
pub fn extract_pages(doc: &mut Document, pages: &[u32]) -> Result<()> {
    if pages.is_empty() {
        return Err(PdfError::InvalidRequest("no pages selected".to_string()));
    }
    let unique: BTreeSet<u32> = pages.iter().copied().collect();
    if unique.len() != pages.len() {
        return Err(PdfError::InvalidRequest(
            "each page may only be selected once".to_string(),
        ));
    }

    let all = page_ids(doc);
    let ids = pages
        .iter()
        .map(|page| page_id(&all, *page))
        .collect::<Result<Vec<_>>>()?;
    rebuild_page_tree(doc, &ids)
}

/// Appends every page of `secondary` after the pages of `primary`.
pub fn append_document(primary: &mut Document, mut secondary: Document) -> Result<()> {
    for page in page_ids(&secondary) {
        materialize_inherited(&mut secondary, page)?;
    }

    secondary.renumber_objects_with(primary.max_id + 1);
    let appended = page_ids(&secondary);

    primary.max_id = primary.max_id.max(secondary.max_id);
    primary.objects.extend(secondary.objects);

    let root = pages_root(primary)?;
    {
        let root_dict = primary.get_object_mut(root).and_then(Object::as_dict_mut)?;
        let count = root_dict.get(b"Count").and_then(Object::as_i64).unwrap_or(0);
        let kids = root_dict.get_mut(b"Kids").and_then(Object::as_array_mut)?;
        kids.extend(appended.iter().map(|id| Object::Reference(*id)));
        root_dict.set("Count", count + appended.len() as i64);
    }

    for page in appended {
        let page_dict = primary.get_object_mut(page).and_then(Object::as_dict_mut)?;
        page_dict.set("Parent", root);
    }

    primary.prune_objects();
    Ok(())
}

/* file level operations */

pub fn rotate(source: &Path, pages: &[u32], degrees: i32) -> Result<Vec<u8>> {
    let mut doc = load(source)?;
    rotate_pages(&mut doc, pages, degrees)?;
    tracing::info!("rotated pages {:?} of {:?} by {}", pages, source, degrees);
    to_bytes(doc)
}

pub fn delete(source: &Path, pages: &[u32]) -> Result<Vec<u8>> {
    let mut doc = load(source)?;
    delete_pages(&mut doc, pages)?;
    tracing::info!("deleted pages {:?} of {:?}", pages, source);
    to_bytes(doc)
}

pub fn reorder(source: &Path, order: &[u32]) -> Result<Vec<u8>> {
    let mut doc = load(source)?;
    reorder_pages(&mut doc, order)?;
    tracing::info!("reordered {:?} as {:?}", source, order);
    to_bytes(doc)
}

pub fn split(source: &Path, pages: &[u32]) -> Result<Vec<u8>> {
    let mut doc = load(source)?;
    extract_pages(&mut doc, pages)?;
    tracing::info!("split pages {:?} out of {:?}", pages, source);
    to_bytes(doc)
}

pub fn merge(source: &Path, other: &Path) -> Result<Vec<u8>> {
    let mut doc = load(source)?;
    let secondary = load(other)?;
    append_document(&mut doc, secondary)?;
    tracing::info!("appended {:?} to {:?}", other, source);
    to_bytes(doc)
}

/// Decrypts `source`; a wrong password is reported as [`PdfError::IncorrectPassword`].
pub fn unlock(source: &Path, password: &str) -> Result<Vec<u8>> {
    let bytes = fs::read(source)?;
    let mut doc = match Document::load_mem(&bytes) {
        Ok(doc) => doc,
        Err(why) => return Err(PdfError::Unlock(why.to_string())),
    };

    if !doc.is_encrypted() {
        tracing::debug!("{:?} is not encrypted, nothing to unlock", source);
        return to_bytes(doc);
    }

    if doc.encryption_state.is_some() {
        tracing::debug!("{:?} opens without a password", source);
        drop_encryption(&mut doc);
    } else {
        doc = load_ciphertext(&bytes)?;
        match doc.decrypt(password) {
            Ok(()) => {}
            Err(lopdf::Error::Decryption(DecryptionError::IncorrectPassword)) => {
                tracing::info!("incorrect password for {:?}", source);
                return Err(PdfError::IncorrectPassword);
            }
            Err(why) => return Err(PdfError::Unlock(why.to_string())),
        }
    }

    doc.prune_objects();
    if doc.get_pages().is_empty() {
        return Err(PdfError::Unlock("decrypted document has no pages".to_string()));
    }
    tracing::info!("unlocked {:?}", source);
    to_bytes(doc)
}

/// Loads every object of an encrypted file without decrypting it.
///
/// lopdf only parses the encryption dictionary of a file the empty password
/// cannot open, so the trailer key and object stream types are renamed in
/// place (same length, offsets intact) and restored after parsing.
fn load_ciphertext(bytes: &[u8]) -> Result<Document> {
    let mut patched = bytes.to_vec();
    rename_pdf_name(&mut patched, b"/Encrypt", b"/NoCrypt");
    rename_pdf_name(&mut patched, b"/ObjStm", b"/ObjStX");

    let mut doc =
        Document::load_mem(&patched).map_err(|why| PdfError::Unlock(why.to_string()))?;
    let encrypt = doc
        .trailer
        .remove(b"NoCrypt")
        .ok_or_else(|| PdfError::Unlock("missing encryption dictionary".to_string()))?;
    doc.trailer.set("Encrypt", encrypt);

    for object in doc.objects.values_mut() {
        if let Ok(stream) = object.as_stream_mut() {
            if stream.dict.has_type(b"ObjStX") {
                stream.dict.set("Type", Object::Name(b"ObjStm".to_vec()));
            }
        }
    }
    Ok(doc)
}

/// Replaces the PDF name `from` wherever it stands alone, so `/Encrypt`
/// leaves `/EncryptMetadata` untouched.
fn rename_pdf_name(bytes: &mut [u8], from: &[u8], to: &[u8]) {
    debug_assert_eq!(from.len(), to.len());
    let mut at = 0;
    while at + from.len() <= bytes.len() {
        let end = at + from.len();
        let delimited = bytes
            .get(end)
            .map_or(true, |next| next.is_ascii_whitespace() || b"()<>[]{}/%".contains(next));
        if &bytes[at..end] == from && delimited {
            bytes[at..end].copy_from_slice(to);
            at = end;
        } else {
            at += 1;
        }
    }
}

/// Wraps a JPEG in a single page PDF sized to the image, without margins.
pub fn image_to_pdf(image_bytes: &[u8], title: &str) -> Result<Vec<u8>> {
    let dynamic_image =
        image::load_from_memory(image_bytes).map_err(|e| PdfError::Image(e.to_string()))?;

    let width = dynamic_image.width() as usize;
    let height = dynamic_image.height() as usize;
    let raw = RawImage {
        pixels: RawImageData::U8(dynamic_image.to_rgb8().into_raw()),
        width,
        height,
        data_format: RawImageFormat::RGB8,
        tag: Vec::new(),
    };

    let mut doc = PdfDocument::new(title);
    let xobject_id = doc.add_image(&raw);

    // one pixel per point at 72 dpi
    let page_w = Mm(width as f32 * 25.4 / 72.0);
    let page_h = Mm(height as f32 * 25.4 / 72.0);
    let ops = vec![Op::UseXobject {
        id: xobject_id,
        transform: XObjectTransform {
            translate_x: Some(Pt(0.0)),
            translate_y: Some(Pt(0.0)),
            scale_x: Some(1.0),
            scale_y: Some(1.0),
            dpi: Some(72.0),
            rotate: None,
        },
    }];
    doc.with_pages(vec![PdfPage::new(page_w, page_h, ops)]);

    let mut warnings: Vec<PdfWarnMsg> = Vec::new();
    let output = doc.save(&PdfSaveOptions::default(), &mut warnings);
    tracing::debug!("wrapped {}x{} image into a PDF page", width, height);

    // make sure what we produced parses before it lands in the inbox
    load_bytes(&output)?;
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdf::fixtures::{
        markers, page_text, sample_document, write_encrypted_sample, write_sample,
    };
    use tempfile::TempDir;

    fn rotation_of(doc: &Document, page: u32) -> i64 {
        current_rotation(doc, page_ids(doc)[(page - 1) as usize])
    }

    #[test]
    fn rotating_four_times_is_the_identity() {
        let mut doc = sample_document(2);
        for _ in 0..4 {
            rotate_pages(&mut doc, &[1], 90).unwrap();
        }
        assert_eq!(rotation_of(&doc, 1), 0);

        rotate_pages(&mut doc, &[1], -90).unwrap();
        assert_eq!(rotation_of(&doc, 1), 270);
        assert_eq!(rotation_of(&doc, 2), 0);
    }

    #[test]
    fn rotation_survives_a_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("doc.pdf");
        write_sample(&path, 3);

        let bytes = rotate(&path, &[2, 3], 90).unwrap();
        let doc = load_bytes(&bytes).unwrap();
        assert_eq!(rotation_of(&doc, 1), 0);
        assert_eq!(rotation_of(&doc, 2), 90);
        assert_eq!(rotation_of(&doc, 3), 90);
    }

    #[test]
    fn rotation_validates_its_input() {
        let mut doc = sample_document(2);
        assert!(matches!(
            rotate_pages(&mut doc, &[3], 90),
            Err(PdfError::PageOutOfRange { page: 3, count: 2 })
        ));
        assert!(matches!(
            rotate_pages(&mut doc, &[1], 45),
            Err(PdfError::InvalidRequest(_))
        ));
        assert!(matches!(
            rotate_pages(&mut doc, &[], 90),
            Err(PdfError::InvalidRequest(_))
        ));
    }

    #[test]
    fn deleting_pages_shifts_later_indices() {
        let mut doc = sample_document(5);
        delete_pages(&mut doc, &[4, 2]).unwrap();
        assert_eq!(markers(&doc), [1, 3, 5]);

        let doc = load_bytes(&to_bytes(doc).unwrap()).unwrap();
        assert_eq!(markers(&doc), [1, 3, 5]);
    }

    #[test]
    fn deleting_every_page_is_refused_untouched() {
        let mut doc = sample_document(3);
        assert!(matches!(
            delete_pages(&mut doc, &[1, 2, 3]),
            Err(PdfError::LastPage)
        ));
        assert!(matches!(
            delete_pages(&mut doc, &[6]),
            Err(PdfError::PageOutOfRange { page: 6, count: 3 })
        ));
        assert_eq!(markers(&doc), [1, 2, 3]);
    }

    #[test]
    fn reorder_follows_the_given_sequence() {
        let mut doc = sample_document(4);
        reorder_pages(&mut doc, &[4, 2, 1, 3]).unwrap();
        assert_eq!(markers(&doc), [4, 2, 1, 3]);

        // pages kept their inherited media box after the tree was rebuilt
        let first = page_ids(&doc)[0];
        assert!(inherited(&doc, first, b"MediaBox").is_some());
        assert!(inherited(&doc, first, b"Resources").is_some());
    }

    #[test]
    fn reorder_rejects_partial_or_duplicated_orders() {
        let mut doc = sample_document(3);
        for order in [&[1, 2][..], &[1, 1, 2], &[1, 2, 3, 4], &[0, 1, 2]] {
            assert!(matches!(
                reorder_pages(&mut doc, order),
                Err(PdfError::InvalidRequest(_))
            ));
        }
        assert_eq!(markers(&doc), [1, 2, 3]);
    }

    #[test]
    fn extract_keeps_only_the_selection() {
        let mut doc = sample_document(5);
        extract_pages(&mut doc, &[5, 2]).unwrap();
        assert_eq!(markers(&doc), [5, 2]);

        let mut doc = sample_document(2);
        assert!(matches!(
            extract_pages(&mut doc, &[1, 1]),
            Err(PdfError::InvalidRequest(_))
        ));
        assert!(matches!(
            extract_pages(&mut doc, &[]),
            Err(PdfError::InvalidRequest(_))
        ));
    }

    #[test]
    fn split_leaves_the_source_alone() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("doc.pdf");
        write_sample(&path, 3);
        let before = fs::read(&path).unwrap();

        let bytes = split(&path, &[3]).unwrap();
        assert_eq!(markers(&load_bytes(&bytes).unwrap()), [3]);
        assert_eq!(fs::read(&path).unwrap(), before);
    }

    #[test]
    fn append_puts_the_second_document_last() {
        let mut primary = sample_document(2);
        let secondary = sample_document(3);
        append_document(&mut primary, secondary).unwrap();

        assert_eq!(markers(&primary), [1, 2, 1, 2, 3]);
        let reloaded = load_bytes(&to_bytes(primary).unwrap()).unwrap();
        assert_eq!(reloaded.get_pages().len(), 5);
    }

    #[test]
    fn merge_reads_both_files() {
        let dir = TempDir::new().unwrap();
        let first = dir.path().join("first.pdf");
        let second = dir.path().join("second.pdf");
        write_sample(&first, 1);
        write_sample(&second, 2);

        let bytes = merge(&first, &second).unwrap();
        assert_eq!(markers(&load_bytes(&bytes).unwrap()), [1, 1, 2]);
    }

    #[test]
    fn unlocking_a_plain_document_keeps_its_pages() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("plain.pdf");
        write_sample(&path, 2);

        let bytes = unlock(&path, "anything").unwrap();
        assert_eq!(markers(&load_bytes(&bytes).unwrap()), [1, 2]);
    }

    #[test]
    fn unlocking_with_the_user_password_keeps_every_page() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("locked.pdf");
        write_encrypted_sample(&path, 3, "secret", "owner");

        let bytes = unlock(&path, "secret").unwrap();
        let doc = load_bytes(&bytes).unwrap();
        assert!(!doc.is_encrypted());
        assert_eq!(markers(&doc), [1, 2, 3]);
        assert!(page_text(&doc, 3).contains("Page 3"));
    }

    #[test]
    fn unlocking_with_the_owner_password_also_works() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("locked.pdf");
        write_encrypted_sample(&path, 2, "secret", "owner");

        let bytes = unlock(&path, "owner").unwrap();
        assert_eq!(markers(&load_bytes(&bytes).unwrap()), [1, 2]);
    }

    #[test]
    fn unlocking_with_a_wrong_password_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("locked.pdf");
        write_encrypted_sample(&path, 2, "secret", "owner");

        assert!(matches!(
            unlock(&path, "guess"),
            Err(PdfError::IncorrectPassword)
        ));
    }

    #[test]
    fn unlocking_an_owner_only_document_keeps_its_text() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("owner.pdf");
        write_encrypted_sample(&path, 2, "", "owner");

        let doc = load_bytes(&unlock(&path, "").unwrap()).unwrap();
        assert_eq!(markers(&doc), [1, 2]);
        assert!(page_text(&doc, 1).contains("Page 1"));
    }

    #[test]
    fn editing_an_owner_only_document_keeps_its_text() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("owner.pdf");
        write_encrypted_sample(&path, 2, "", "owner");

        let doc = load_bytes(&rotate(&path, &[1], 90).unwrap()).unwrap();
        assert_eq!(rotation_of(&doc, 1), 90);
        assert!(page_text(&doc, 1).contains("Page 1"));
        assert!(page_text(&doc, 2).contains("Page 2"));
    }

    #[test]
    fn pdf_names_are_only_renamed_when_whole() {
        let mut bytes = b"<</Encrypt 5 0 R/EncryptMetadata true/Encrypt>>".to_vec();
        rename_pdf_name(&mut bytes, b"/Encrypt", b"/NoCrypt");
        assert_eq!(
            bytes,
            b"<</NoCrypt 5 0 R/EncryptMetadata true/NoCrypt>>".to_vec()
        );
    }

    #[test]
    fn unlocking_garbage_fails_generically() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.pdf");
        fs::write(&path, b"nope").unwrap();

        assert!(matches!(unlock(&path, "pw"), Err(PdfError::Unlock(_))));
    }

    #[test]
    fn jpeg_becomes_a_single_page() {
        let mut jpeg = Vec::new();
        image::DynamicImage::ImageRgb8(image::RgbImage::from_pixel(
            40,
            20,
            image::Rgb([200, 30, 30]),
        ))
        .write_to(&mut std::io::Cursor::new(&mut jpeg), image::ImageFormat::Jpeg)
        .unwrap();

        let bytes = image_to_pdf(&jpeg, "scan").unwrap();
        assert_eq!(load_bytes(&bytes).unwrap().get_pages().len(), 1);
    }

    #[test]
    fn non_images_are_rejected() {
        assert!(matches!(
            image_to_pdf(b"definitely not a jpeg", "x"),
            Err(PdfError::Image(_))
        ));
    }
}
