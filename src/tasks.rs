use axum::{
    extract::{Multipart, Path, Query, State},
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        Html, IntoResponse, Response,
    },
    Json,
};
use futures::stream::{self, Stream};
use std::convert::Infallible;
use tokio::sync::broadcast::error::RecvError;

use crate::batch::{self, BatchItem};
use crate::configuration::Configuration;
use crate::error::{AppError, Result};
use crate::filesystem::{Document, DocumentRef, Folder, TargetDirectory};
use crate::models::*;
use crate::pdf::editing;
use crate::state::AppState;
use crate::watcher::{FilesChanged, FILES_CHANGED_EVENT};

/// Runs filesystem and PDF work on the blocking pool.
async fn blocking<T, F>(operation: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(operation).await?
}

fn document_ref(target: TargetDirectory, subdirectory: Option<String>, name: &str) -> DocumentRef {
    DocumentRef::new(target, subdirectory, name)
}

pub async fn help() -> Html<&'static str> {
    Html(
        "pdfdesk manages PDF documents across an inbox, an outbox and an archive. \
         The REST API lives under <code>/api</code>; change notifications stream from \
         <code>/api/events</code>.",
    )
}

/* configuration */

// GET configuration
pub async fn get_configuration(State(state): State<AppState>) -> Json<Configuration> {
    Json(state.configuration().current())
}

// POST configuration
pub async fn save_configuration(
    State(state): State<AppState>,
    Json(configuration): Json<Configuration>,
) -> Result<Json<Configuration>> {
    blocking(move || {
        state.configuration().update(configuration)?;
        Ok(Json(state.configuration().current()))
    })
    .await
}

// PATCH configuration
pub async fn reload_configuration(State(state): State<AppState>) -> Result<Json<Configuration>> {
    blocking(move || Ok(Json(state.configuration().reload()?))).await
}

/* listing and reading */

pub async fn list_documents(
    State(state): State<AppState>,
    Path(target): Path<TargetDirectory>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Document>>> {
    blocking(move || {
        let documents =
            state
                .store()
                .list(target, query.subdirectory.as_deref(), query.recursive)?;
        Ok(Json(documents))
    })
    .await
}

pub async fn get_document(
    State(state): State<AppState>,
    Path((target, document)): Path<(TargetDirectory, String)>,
    Query(query): Query<SubdirectoryQuery>,
) -> Result<Json<Document>> {
    blocking(move || {
        let doc = document_ref(target, query.subdirectory, &document);
        Ok(Json(state.store().get(&doc)?))
    })
    .await
}

pub async fn folder_tree(
    State(state): State<AppState>,
    Path(target): Path<TargetDirectory>,
) -> Result<Json<Folder>> {
    blocking(move || Ok(Json(state.store().folder_tree(target)?))).await
}

pub async fn download(
    State(state): State<AppState>,
    Path((target, document)): Path<(TargetDirectory, String)>,
    Query(query): Query<SubdirectoryQuery>,
) -> Result<Response> {
    let (file_name, bytes) = blocking(move || {
        let doc = document_ref(target, query.subdirectory, &document);
        Ok(state.store().download(&doc)?)
    })
    .await?;

    Ok((
        [
            (header::CONTENT_TYPE, "application/pdf".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", file_name),
            ),
        ],
        bytes,
    )
        .into_response())
}

pub async fn page_count(
    State(state): State<AppState>,
    Path((target, document)): Path<(TargetDirectory, String)>,
    Query(query): Query<SubdirectoryQuery>,
) -> Result<Json<PageCountResponse>> {
    blocking(move || {
        let doc = document_ref(target, query.subdirectory, &document);
        Ok(Json(PageCountResponse {
            page_count: state.store().page_count(&doc)?,
        }))
    })
    .await
}

pub async fn preview(
    State(state): State<AppState>,
    Path((target, document, page_number)): Path<(TargetDirectory, String, u32)>,
    Query(query): Query<PreviewQuery>,
) -> Result<Response> {
    let png = blocking(move || {
        let defaults = state.configuration().current().preview;
        let doc = document_ref(target, query.subdirectory, &document);
        Ok(state.store().preview(
            &doc,
            page_number,
            query.width.unwrap_or(defaults.width),
            query.height.unwrap_or(defaults.height),
        )?)
    })
    .await?;

    Ok((
        [
            (header::CONTENT_TYPE, "image/png"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        png,
    )
        .into_response())
}

/* page edits */

pub async fn rotate_pages(
    State(state): State<AppState>,
    Path((target, document)): Path<(TargetDirectory, String)>,
    Query(query): Query<RotateQuery>,
    Json(pages): Json<Vec<u32>>,
) -> Result<StatusCode> {
    blocking(move || {
        let doc = document_ref(target, query.subdirectory, &document);
        state
            .store()
            .edit(&doc, |source| editing::rotate(source, &pages, query.degrees))?;
        Ok(StatusCode::NO_CONTENT)
    })
    .await
}

pub async fn delete_pages(
    State(state): State<AppState>,
    Path((target, document)): Path<(TargetDirectory, String)>,
    Query(query): Query<SubdirectoryQuery>,
    Json(pages): Json<Vec<u32>>,
) -> Result<StatusCode> {
    blocking(move || {
        let doc = document_ref(target, query.subdirectory, &document);
        state
            .store()
            .edit(&doc, |source| editing::delete(source, &pages))?;
        Ok(StatusCode::NO_CONTENT)
    })
    .await
}

pub async fn reorder_pages(
    State(state): State<AppState>,
    Path((target, document)): Path<(TargetDirectory, String)>,
    Query(query): Query<SubdirectoryQuery>,
    Json(order): Json<Vec<u32>>,
) -> Result<StatusCode> {
    blocking(move || {
        let doc = document_ref(target, query.subdirectory, &document);
        state
            .store()
            .edit(&doc, |source| editing::reorder(source, &order))?;
        Ok(StatusCode::NO_CONTENT)
    })
    .await
}

pub async fn unlock(
    State(state): State<AppState>,
    Path((target, document)): Path<(TargetDirectory, String)>,
    Query(query): Query<UnlockQuery>,
) -> Result<StatusCode> {
    blocking(move || {
        let doc = document_ref(target, query.subdirectory, &document);
        state
            .store()
            .edit(&doc, |source| editing::unlock(source, &query.password))?;
        Ok(StatusCode::NO_CONTENT)
    })
    .await
}

pub async fn revert(
    State(state): State<AppState>,
    Path((target, document)): Path<(TargetDirectory, String)>,
    Query(query): Query<SubdirectoryQuery>,
) -> Result<StatusCode> {
    blocking(move || {
        let doc = document_ref(target, query.subdirectory, &document);
        state.store().revert(&doc)?;
        Ok(StatusCode::NO_CONTENT)
    })
    .await
}

pub async fn split(
    State(state): State<AppState>,
    Path((target, document)): Path<(TargetDirectory, String)>,
    Query(query): Query<SubdirectoryQuery>,
    Json(pages): Json<Vec<u32>>,
) -> Result<(StatusCode, Json<Document>)> {
    blocking(move || {
        let doc = document_ref(target, query.subdirectory, &document);
        let created = state.store().split(&doc, &pages)?;
        Ok((StatusCode::CREATED, Json(state.store().get(&created)?)))
    })
    .await
}

pub async fn merge(
    State(state): State<AppState>,
    Path((target, document)): Path<(TargetDirectory, String)>,
    Query(query): Query<MergeQuery>,
) -> Result<StatusCode> {
    blocking(move || {
        let doc = document_ref(target, query.subdirectory, &document);
        let other = document_ref(target, query.merge_subdirectory, &query.merge_document);
        state.store().merge(&doc, &other)?;
        Ok(StatusCode::NO_CONTENT)
    })
    .await
}

/* lifecycle */

pub async fn rename(
    State(state): State<AppState>,
    Path((target, document, new_name)): Path<(TargetDirectory, String, String)>,
    Query(query): Query<SubdirectoryQuery>,
) -> Result<Json<Document>> {
    blocking(move || {
        let doc = document_ref(target, query.subdirectory, &document);
        let renamed = state.store().rename(&doc, &new_name)?;
        Ok(Json(state.store().get(&renamed)?))
    })
    .await
}

fn archive_item(state: &AppState, doc: &DocumentRef) -> Result<()> {
    let delete_in_place = state.configuration().current().general.delete_on_archive;
    state.store().archive(doc, delete_in_place)?;
    Ok(())
}

fn save_item(
    state: &AppState,
    doc: &DocumentRef,
    new_name: Option<&str>,
    destination: Option<&str>,
) -> Result<DocumentRef> {
    let archive_original = state
        .configuration()
        .current()
        .general
        .archive_original_on_save;
    Ok(state
        .store()
        .save(doc, new_name, destination, archive_original)?)
}

pub async fn archive(
    State(state): State<AppState>,
    Path((target, document)): Path<(TargetDirectory, String)>,
    Query(query): Query<SubdirectoryQuery>,
) -> Result<StatusCode> {
    blocking(move || {
        let doc = document_ref(target, query.subdirectory, &document);
        archive_item(&state, &doc)?;
        Ok(StatusCode::NO_CONTENT)
    })
    .await
}

pub async fn restore(
    State(state): State<AppState>,
    Path((target, document)): Path<(TargetDirectory, String)>,
    Query(query): Query<SubdirectoryQuery>,
) -> Result<Json<Document>> {
    blocking(move || {
        let doc = document_ref(target, query.subdirectory, &document);
        let restored = state.store().restore(&doc)?;
        Ok(Json(state.store().get(&restored)?))
    })
    .await
}

pub async fn save(
    State(state): State<AppState>,
    Path((target, document)): Path<(TargetDirectory, String)>,
    Query(query): Query<SaveQuery>,
) -> Result<Json<Document>> {
    blocking(move || {
        let doc = document_ref(target, query.subdirectory, &document);
        let saved = save_item(&state, &doc, query.new_name.as_deref(), None)?;
        Ok(Json(state.store().get(&saved)?))
    })
    .await
}

pub async fn save_to(
    State(state): State<AppState>,
    Path((target, document)): Path<(TargetDirectory, String)>,
    Query(query): Query<SaveToQuery>,
) -> Result<Json<Document>> {
    blocking(move || {
        let doc = document_ref(target, query.subdirectory, &document);
        let saved = save_item(
            &state,
            &doc,
            query.new_name.as_deref(),
            query.directory.as_deref(),
        )?;
        Ok(Json(state.store().get(&saved)?))
    })
    .await
}

pub async fn delete_document(
    State(state): State<AppState>,
    Path((target, document)): Path<(TargetDirectory, String)>,
    Query(query): Query<SubdirectoryQuery>,
) -> Result<StatusCode> {
    blocking(move || {
        let doc = document_ref(target, query.subdirectory, &document);
        state.store().permanently_delete(&doc)?;
        Ok(StatusCode::NO_CONTENT)
    })
    .await
}

fn guess_content_type(file_name: &str) -> &'static str {
    let lower = file_name.to_ascii_lowercase();
    if lower.ends_with(".jpg") || lower.ends_with(".jpeg") {
        "image/jpeg"
    } else if lower.ends_with(".pdf") {
        "application/pdf"
    } else {
        "application/octet-stream"
    }
}

fn upload_name(file_name: &str) -> &str {
    let lower = file_name.to_ascii_lowercase();
    [".jpeg", ".jpg"]
        .iter()
        .find(|ext| lower.ends_with(*ext) && file_name.len() > ext.len())
        .map(|ext| &file_name[..file_name.len() - ext.len()])
        .unwrap_or(file_name)
}

pub async fn upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<Vec<Document>>)> {
    let mut files = Vec::new();

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        tracing::error!("failed to read multipart field: {}", e);
        AppError::BadRequest(format!("invalid multipart body: {}", e))
    })? {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field
            .file_name()
            .map(str::to_string)
            .ok_or_else(|| AppError::BadRequest("uploaded file has no file name".to_string()))?;
        let content_type = field
            .content_type()
            .filter(|ct| *ct != "application/octet-stream")
            .unwrap_or_else(|| guess_content_type(&file_name))
            .to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| AppError::BadRequest(format!("failed to read {}: {}", file_name, e)))?;

        tracing::info!("received upload {} ({}, {} bytes)", file_name, content_type, bytes.len());
        files.push((file_name, content_type, bytes));
    }

    if files.is_empty() {
        return Err(AppError::BadRequest("no file field in upload".to_string()));
    }

    blocking(move || {
        let mut documents = Vec::with_capacity(files.len());
        for (file_name, content_type, bytes) in files {
            let created = state
                .store()
                .create(upload_name(&file_name), &bytes, &content_type)?;
            documents.push(state.store().get(&created)?);
        }
        Ok((StatusCode::CREATED, Json(documents)))
    })
    .await
}

/* batches */

pub async fn batch(
    State(state): State<AppState>,
    Path(operation): Path<String>,
    Json(items): Json<Vec<BatchItem>>,
) -> Result<Response> {
    if !["archive", "save", "save-to", "restore", "delete"].contains(&operation.as_str()) {
        return Err(AppError::NotFound(format!("unknown batch operation '{}'", operation)));
    }

    let response = blocking(move || {
        Ok(batch::run(&items, |item| {
            let source = match operation.as_str() {
                // `directory` names the destination here, sources come from the inbox root
                "save-to" => None,
                _ => item.directory.clone(),
            };
            let doc = document_ref(item.target, source, &item.document);
            match operation.as_str() {
                "archive" => archive_item(&state, &doc),
                "save" => save_item(&state, &doc, None, None).map(|_| ()),
                "save-to" => save_item(&state, &doc, None, item.directory.as_deref()).map(|_| ()),
                "restore" => state.store().restore(&doc).map(|_| ()).map_err(AppError::from),
                _ => state.store().permanently_delete(&doc).map_err(AppError::from),
            }
        }))
    })
    .await?;

    let status = StatusCode::from_u16(response.status_code).unwrap_or(StatusCode::MULTI_STATUS);
    if status == StatusCode::NO_CONTENT {
        return Ok(StatusCode::NO_CONTENT.into_response());
    }
    Ok((status, Json(response)).into_response())
}

/* push notifications */

pub async fn events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let receiver = state.events();

    let stream = stream::unfold(receiver, |mut receiver| async move {
        match receiver.recv().await {
            Ok(FilesChanged) => {}
            // missed notifications collapse into one
            Err(RecvError::Lagged(skipped)) => {
                tracing::debug!("event subscriber lagged by {}", skipped)
            }
            Err(RecvError::Closed) => return None,
        }
        let event = Event::default().event(FILES_CHANGED_EVENT).data("");
        Some((Ok(event), receiver))
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_names_drop_image_extensions() {
        assert_eq!(upload_name("photo.JPG"), "photo");
        assert_eq!(upload_name("scan.jpeg"), "scan");
        assert_eq!(upload_name("report.pdf"), "report.pdf");
        assert_eq!(upload_name(".jpg"), ".jpg");
    }

    #[test]
    fn content_type_is_guessed_from_the_file_name() {
        assert_eq!(guess_content_type("a.PDF"), "application/pdf");
        assert_eq!(guess_content_type("a.jpeg"), "image/jpeg");
        assert_eq!(guess_content_type("a.txt"), "application/octet-stream");
    }
}
