//! Shared setup for HTTP-level integration tests.
//!
//! Requests are sent straight to the router with `tower::ServiceExt::oneshot`;
//! no TCP listener is involved.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{Request, StatusCode};
use axum::response::Response;
use axum::Router;
use docconv_api::config::ServerConfig;
use docconv_api::router::build_app_router;
use docconv_api::state::AppState;
use docconv_core::token::{TokenAuthority, TokenParams};
use docconv_store::{LocalStorage, Storage};
use docconv_worker::{DocumentConverter, JobLifecycleEngine};
use http_body_util::BodyExt;
use lopdf::{dictionary, Document, Object, Stream};
use tempfile::TempDir;
use tower::ServiceExt;

pub const BOUNDARY: &str = "docconv-test-boundary";

/// A running app over its own temporary data directory.
pub struct TestApp {
    pub router: Router,
    pub engine: Arc<JobLifecycleEngine>,
    _dir: TempDir,
}

impl TestApp {
    pub async fn send(&self, request: Request<Body>) -> Response {
        self.router.clone().oneshot(request).await.unwrap()
    }

    pub async fn get(&self, uri: &str) -> Response {
        self.send(Request::get(uri).body(Body::empty()).unwrap()).await
    }

    pub async fn get_with_auth(&self, uri: &str, authorization: &str) -> Response {
        let request = Request::get(uri)
            .header(AUTHORIZATION, authorization)
            .body(Body::empty())
            .unwrap();
        self.send(request).await
    }

    /// POST one file as the `file` field of a multipart body.
    pub async fn upload(&self, filename: &str, content_type: &str, bytes: &[u8]) -> Response {
        let request = Request::post("/jobs")
            .header(
                CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(multipart_body(
                "file",
                filename,
                content_type,
                bytes,
            )))
            .unwrap();
        self.send(request).await
    }

    /// Number of job directories on disk.
    pub async fn job_count(&self) -> usize {
        self.engine.store().list_ids().await.unwrap().len()
    }

    /// Poll `GET /jobs/{id}` until the job is terminal, returning every
    /// status observed along the way and the final job body.
    pub async fn poll_until_terminal(
        &self,
        id: &str,
        token: &str,
    ) -> (Vec<String>, serde_json::Value) {
        let mut seen: Vec<String> = Vec::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
        loop {
            let response = self
                .get_with_auth(&format!("/jobs/{id}"), &format!("Bearer {token}"))
                .await;
            assert_eq!(response.status(), StatusCode::OK);
            let job = body_json(response).await["data"].clone();
            let status = job["status"].as_str().unwrap().to_string();
            if seen.last() != Some(&status) {
                seen.push(status.clone());
            }
            if status == "succeeded" || status == "failed" {
                return (seen, job);
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "job {id} did not finish, statuses seen: {seen:?}"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// Safe defaults for tests: small worker pool, local CORS origin.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        workers: 2,
        execution_slots: 2,
        job_timeout_secs: 30,
        ..ServerConfig::default()
    }
}

pub async fn build_test_app() -> TestApp {
    build_test_app_with(test_config()).await
}

/// Build the full router the binary serves, with cheap Argon2 parameters.
pub async fn build_test_app_with(mut config: ServerConfig) -> TestApp {
    let dir = TempDir::new().unwrap();
    config.data_dir = dir.path().to_path_buf();

    let storage: Arc<dyn Storage> = Arc::new(LocalStorage::new(dir.path()));
    let tokens = TokenAuthority::with_params(TokenParams::new(1024, 1, 1)).unwrap();
    let engine = JobLifecycleEngine::start(
        config.engine_config(),
        storage,
        Arc::new(DocumentConverter::new()),
        Arc::new(tokens),
    )
    .await
    .unwrap();
    let engine = Arc::new(engine);

    let state = AppState {
        engine: Arc::clone(&engine),
    };

    TestApp {
        router: build_app_router(state, &config),
        engine,
        _dir: dir,
    }
}

pub fn multipart_body(field: &str, filename: &str, content_type: &str, bytes: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
    body.extend_from_slice(
        format!(
            "Content-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(format!("Content-Type: {content_type}\r\n\r\n").as_bytes());
    body.extend_from_slice(bytes);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    body
}

pub async fn body_json(response: Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

pub async fn body_text(response: Response) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

/// A PDF with one line of Helvetica text per page.
pub fn sample_pdf(pages: usize) -> Vec<u8> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
        "Encoding" => "WinAnsiEncoding",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! { "F1" => font_id },
    });

    let mut kids = Vec::new();
    for n in 1..=pages {
        let content = format!("BT\n/F1 12 Tf\n50 742 Td\n(Chapter {n} text) Tj\nET\n");
        let content_id = doc.add_object(Stream::new(dictionary! {}, content.into_bytes()));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
            "Resources" => resources_id,
            "Contents" => content_id,
        });
        kids.push(Object::from(page_id));
    }
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => pages as i64,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut buffer = Vec::new();
    doc.save_to(&mut buffer).unwrap();
    buffer
}
