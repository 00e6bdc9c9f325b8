use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::state::AppState;
use crate::tasks;

const UPLOAD_LIMIT_BYTES: usize = 256 * 1024 * 1024;

fn document_routes() -> Router<AppState> {
    Router::new()
        .route("/list/:target", get(tasks::list_documents))
        .route("/list/:target/:document", get(tasks::get_document))
        .route("/tree/:target", get(tasks::folder_tree))
        .route(
            "/upload",
            post(tasks::upload).layer(DefaultBodyLimit::max(UPLOAD_LIMIT_BYTES)),
        )
        .route("/batch/:operation", post(tasks::batch))
        .route("/:target/:document", axum::routing::delete(tasks::delete_document))
        .route("/:target/:document/download", get(tasks::download))
        .route("/:target/:document/page-count", get(tasks::page_count))
        .route("/:target/:document/preview/:page_number", get(tasks::preview))
        .route("/:target/:document/rename/:new_name", post(tasks::rename))
        .route("/:target/:document/rotate-pages", post(tasks::rotate_pages))
        .route("/:target/:document/delete-pages", post(tasks::delete_pages))
        .route("/:target/:document/reorder-pages", post(tasks::reorder_pages))
        .route("/:target/:document/revert", post(tasks::revert))
        .route("/:target/:document/unlock", post(tasks::unlock))
        .route("/:target/:document/archive", post(tasks::archive))
        .route("/:target/:document/restore", post(tasks::restore))
        .route("/:target/:document/save", post(tasks::save))
        .route("/:target/:document/save-to", post(tasks::save_to))
        .route("/:target/:document/split", post(tasks::split))
        .route("/:target/:document/merge", post(tasks::merge))
}

/// Builds the application router, serving a frontend bundle for unknown
/// paths when `agent.static_dir` is set.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let mut app = Router::new()
        .route("/", get(tasks::help))
        .route(
            "/api/configuration",
            get(tasks::get_configuration)
                .post(tasks::save_configuration)
                .patch(tasks::reload_configuration),
        )
        .route("/api/events", get(tasks::events))
        .nest("/api/documents", document_routes());

    if let Some(dir) = &state.settings().agent.static_dir {
        tracing::info!("serving static files from {}", dir.display());
        app = app.fallback_service(ServeDir::new(dir));
    }

    app.layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_data;
    use crate::configuration::ConfigurationHandle;
    use crate::pdf::fixtures;
    use crate::store::DocumentStore;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Method, Request, StatusCode};
    use serde_json::{json, Value};
    use std::path::Path;
    use tempfile::TempDir;
    use tokio::sync::broadcast;
    use tower::ServiceExt;

    fn app(base: &Path) -> Router {
        let settings = test_data(base);
        let store = DocumentStore::new(&settings).unwrap();
        let configuration =
            ConfigurationHandle::load_or_create(&settings.configuration_file()).unwrap();
        let (events, _) = broadcast::channel(8);
        router(AppState::new(settings, store, configuration, events))
    }

    fn add(base: &Path, root: &str, name: &str, pages: u32) {
        fixtures::write_sample(&base.join(root).join(format!("{}.pdf", name)), pages);
    }

    async fn send(app: Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Vec<u8>) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(json) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, bytes.to_vec())
    }

    fn json_body(bytes: &[u8]) -> Value {
        serde_json::from_slice(bytes).unwrap()
    }

    #[tokio::test]
    async fn help_is_served_at_the_root() {
        let base = TempDir::new().unwrap();
        let (status, _) = send(app(base.path()), Method::GET, "/", None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn list_returns_camel_case_documents() {
        let base = TempDir::new().unwrap();
        add(base.path(), "inbox", "scan", 2);

        let (status, body) = send(
            app(base.path()),
            Method::GET,
            "/api/documents/list/Inbox",
            None,
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        let docs = json_body(&body);
        assert_eq!(docs[0]["name"], "scan");
        assert_eq!(docs[0]["targetDirectory"], "inbox");
        assert_eq!(docs[0]["hasChanges"], false);
        assert_eq!(docs[0]["status"], "ok");
    }

    #[tokio::test]
    async fn unknown_targets_are_rejected() {
        let base = TempDir::new().unwrap();
        let (status, _) = send(
            app(base.path()),
            Method::GET,
            "/api/documents/list/trash",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn page_edits_update_the_page_count() {
        let base = TempDir::new().unwrap();
        add(base.path(), "inbox", "doc", 5);

        let (status, _) = send(
            app(base.path()),
            Method::POST,
            "/api/documents/inbox/doc/delete-pages",
            Some(json!([2, 4])),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, body) = send(
            app(base.path()),
            Method::GET,
            "/api/documents/inbox/doc/page-count",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json_body(&body)["pageCount"], 3);
    }

    #[tokio::test]
    async fn reorder_rejects_partial_orders() {
        let base = TempDir::new().unwrap();
        add(base.path(), "inbox", "doc", 3);

        let (status, body) = send(
            app(base.path()),
            Method::POST,
            "/api/documents/inbox/doc/reorder-pages",
            Some(json!([3, 1])),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json_body(&body)["error"], "bad_request");
    }

    #[tokio::test]
    async fn preview_outside_the_document_is_not_found() {
        let base = TempDir::new().unwrap();
        add(base.path(), "inbox", "doc", 1);

        let (status, body) = send(
            app(base.path()),
            Method::GET,
            "/api/documents/inbox/doc/preview/2",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json_body(&body)["error"], "not_found");
    }

    #[tokio::test]
    async fn rename_conflicts_are_reported() {
        let base = TempDir::new().unwrap();
        add(base.path(), "inbox", "a", 1);
        add(base.path(), "inbox", "b", 1);

        let (status, body) = send(
            app(base.path()),
            Method::POST,
            "/api/documents/inbox/a/rename/b",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(json_body(&body)["error"], "conflict");
    }

    #[tokio::test]
    async fn download_prefers_edits() {
        let base = TempDir::new().unwrap();
        add(base.path(), "inbox", "doc", 3);
        send(
            app(base.path()),
            Method::POST,
            "/api/documents/inbox/doc/delete-pages",
            Some(json!([1])),
        )
        .await;

        let response = app(base.path())
            .oneshot(
                Request::builder()
                    .uri("/api/documents/inbox/doc/download")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"doc.pdf\""
        );
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let doc = lopdf::Document::load_mem(&bytes).unwrap();
        assert_eq!(fixtures::markers(&doc), [2, 3]);
    }

    #[tokio::test]
    async fn unlocking_an_unencrypted_document_succeeds() {
        let base = TempDir::new().unwrap();
        add(base.path(), "inbox", "doc", 1);

        let (status, _) = send(
            app(base.path()),
            Method::POST,
            "/api/documents/inbox/doc/unlock?password=whatever",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(base.path().join("inbox").join("doc.edit.pdf").is_file());
    }

    #[tokio::test]
    async fn unlocking_a_protected_document_checks_the_password() {
        let base = TempDir::new().unwrap();
        let path = base.path().join("inbox").join("doc.pdf");
        fixtures::write_encrypted_sample(&path, 2, "secret", "owner");

        let (status, body) = send(
            app(base.path()),
            Method::POST,
            "/api/documents/inbox/doc/unlock?password=guess",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json_body(&body)["error"], "incorrect_password");

        let (status, _) = send(
            app(base.path()),
            Method::POST,
            "/api/documents/inbox/doc/unlock?password=secret",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, body) = send(
            app(base.path()),
            Method::GET,
            "/api/documents/inbox/doc/page-count",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json_body(&body)["pageCount"], 2);
    }

    #[tokio::test]
    async fn batch_archive_reports_each_item() {
        let base = TempDir::new().unwrap();
        add(base.path(), "inbox", "present", 1);

        let (status, body) = send(
            app(base.path()),
            Method::POST,
            "/api/documents/batch/archive",
            Some(json!([
                {"document": "present", "target": "inbox"},
                {"document": "missing", "target": "inbox"}
            ])),
        )
        .await;

        assert_eq!(status, StatusCode::MULTI_STATUS);
        let response = json_body(&body);
        assert_eq!(response["statusCode"], 207);
        assert_eq!(response["results"][0]["statusCode"], 200);
        assert_eq!(response["results"][1]["statusCode"], 404);
        assert!(base.path().join("archive").join("present.pdf").is_file());
    }

    #[tokio::test]
    async fn empty_batches_have_no_content() {
        let base = TempDir::new().unwrap();
        let (status, body) = send(
            app(base.path()),
            Method::POST,
            "/api/documents/batch/restore",
            Some(json!([])),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn batch_save_to_publishes_into_the_named_folder() {
        let base = TempDir::new().unwrap();
        add(base.path(), "inbox", "a", 1);
        add(base.path(), "inbox", "b", 1);

        let (status, _) = send(
            app(base.path()),
            Method::POST,
            "/api/documents/batch/save-to",
            Some(json!([
                {"document": "a", "directory": "clients/acme", "target": "inbox"},
                {"document": "b", "directory": "clients/acme", "target": "inbox"}
            ])),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        let folder = base.path().join("outbox").join("clients").join("acme");
        assert!(folder.join("a.pdf").is_file());
        assert!(folder.join("b.pdf").is_file());
    }

    #[tokio::test]
    async fn configuration_round_trips() {
        let base = TempDir::new().unwrap();

        let (status, body) = send(app(base.path()), Method::GET, "/api/configuration", None).await;
        assert_eq!(status, StatusCode::OK);
        let mut configuration = json_body(&body);
        assert_eq!(configuration["general"]["deleteOnArchive"], false);

        configuration["general"]["deleteOnArchive"] = json!(true);
        let (status, body) = send(
            app(base.path()),
            Method::POST,
            "/api/configuration",
            Some(configuration),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json_body(&body)["general"]["deleteOnArchive"], true);

        // a fresh app reads the saved file
        let (_, body) = send(app(base.path()), Method::PATCH, "/api/configuration", None).await;
        assert_eq!(json_body(&body)["general"]["deleteOnArchive"], true);
    }

    #[tokio::test]
    async fn upload_stores_pdfs_in_the_inbox() {
        let base = TempDir::new().unwrap();
        let pdf = crate::pdf::to_bytes(fixtures::sample_document(2)).unwrap();

        let boundary = "pdfdesk-boundary";
        let mut body = Vec::new();
        body.extend_from_slice(
            format!(
                "--{b}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"upload.pdf\"\r\n\
                 Content-Type: application/pdf\r\n\r\n",
                b = boundary
            )
            .as_bytes(),
        );
        body.extend_from_slice(&pdf);
        body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());

        let response = app(base.path())
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/api/documents/upload")
                    .header(
                        header::CONTENT_TYPE,
                        format!("multipart/form-data; boundary={}", boundary),
                    )
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(json_body(&bytes)[0]["name"], "upload");
        assert!(base.path().join("inbox").join("upload.pdf").is_file());
    }
}
