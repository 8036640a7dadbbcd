//! HTTP-level integration tests for the `/jobs` endpoints.

mod common;

use axum::body::Body;
use axum::http::header::{CONTENT_TYPE, LOCATION};
use axum::http::{Request, StatusCode};
use common::{
    body_json, body_text, build_test_app, build_test_app_with, multipart_body, sample_pdf,
    test_config, BOUNDARY,
};
use docconv_core::upload::MIME_PPT;

const UNKNOWN_ID: &str = "00000000-0000-4000-8000-000000000000";

/// Submit a PDF and return `(id, access_token)`.
async fn submit_pdf(app: &common::TestApp, pages: usize) -> (String, String) {
    let response = app
        .upload("report.pdf", "application/pdf", &sample_pdf(pages))
        .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let json = body_json(response).await;
    let data = &json["data"];
    (
        data["id"].as_str().unwrap().to_string(),
        data["access_token"].as_str().unwrap().to_string(),
    )
}

// ---------------------------------------------------------------------------
// Submission
// ---------------------------------------------------------------------------

#[tokio::test]
async fn submit_returns_202_with_one_time_token_and_links() {
    let app = build_test_app().await;
    let response = app
        .upload("report.pdf", "application/pdf", &sample_pdf(2))
        .await;

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let location = response.headers()[LOCATION].to_str().unwrap().to_string();

    let json = body_json(response).await;
    // Success bodies are wrapped; nothing sits next to `data`.
    assert_eq!(json.as_object().unwrap().len(), 1);
    let data = &json["data"];
    let id = data["id"].as_str().unwrap();
    let token = data["access_token"].as_str().unwrap();

    assert_eq!(location, format!("/jobs/{id}"));
    assert_eq!(data["status"], "queued");
    assert_eq!(data["progress"], 0);
    assert_eq!(data["filename"], "report.pdf");
    assert_eq!(data["content_type"], "application/pdf");
    assert_eq!(token.len(), 43);
    assert_eq!(data["links"]["self"], format!("/jobs/{id}"));
    assert_eq!(data["links"]["result"], format!("/jobs/{id}/result"));
    assert!(!data["links"].to_string().contains(token));
}

#[tokio::test]
async fn ten_page_pdf_converts_end_to_end() {
    let app = build_test_app().await;
    let (id, token) = submit_pdf(&app, 10).await;

    let (seen, job) = app.poll_until_terminal(&id, &token).await;

    assert_eq!(seen.last().map(String::as_str), Some("succeeded"));
    let order = ["queued", "running", "succeeded"];
    let positions: Vec<usize> = seen
        .iter()
        .map(|s| order.iter().position(|o| o == s).unwrap())
        .collect();
    assert!(positions.windows(2).all(|w| w[0] < w[1]), "{seen:?}");

    assert_eq!(job["progress"], 100);
    assert!(job["started_at"].is_string());
    assert!(job["completed_at"].is_string());
    assert!(job["error"].is_null());

    let response = app
        .get_with_auth(&format!("/jobs/{id}/result"), &format!("Bearer {token}"))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[CONTENT_TYPE],
        "text/markdown; charset=utf-8"
    );
    let markdown = body_text(response).await;
    assert!(!markdown.trim().is_empty());
    assert!(markdown.contains("## Page 1\n"));
    assert!(markdown.contains("## Page 10\n"));
}

#[tokio::test]
async fn octet_stream_pdf_is_accepted_by_extension() {
    let app = build_test_app().await;
    let response = app
        .upload("scan.PDF", "application/octet-stream", &sample_pdf(1))
        .await;

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let json = body_json(response).await;
    assert_eq!(json["data"]["content_type"], "application/pdf");
}

#[tokio::test]
async fn unsupported_media_type_is_415_and_creates_no_job() {
    let app = build_test_app().await;
    let response = app.upload("photo.png", "image/png", b"\x89PNG\r\n").await;

    assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    let json = body_json(response).await;
    assert_eq!(json["code"], "UNSUPPORTED_MEDIA_TYPE");
    assert_eq!(app.job_count().await, 0);
    assert_eq!(app.engine.queue_depth(), 0);
}

#[tokio::test]
async fn oversized_upload_is_413_and_creates_no_job() {
    let mut config = test_config();
    config.max_upload_mb = 1;
    let app = build_test_app_with(config).await;

    let bytes = vec![b'a'; 1024 * 1024 + 1];
    let response = app.upload("big.pdf", "application/pdf", &bytes).await;

    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    let json = body_json(response).await;
    assert_eq!(json["code"], "PAYLOAD_TOO_LARGE");
    assert_eq!(json["details"]["limit_bytes"], 1024 * 1024);
    assert_eq!(app.job_count().await, 0);
}

#[tokio::test]
async fn empty_file_is_a_validation_error() {
    let app = build_test_app().await;
    let response = app.upload("empty.pdf", "application/pdf", b"").await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["code"], "VALIDATION_ERROR");
    assert_eq!(app.job_count().await, 0);
}

#[tokio::test]
async fn missing_file_field_is_a_validation_error() {
    let app = build_test_app().await;
    let request = Request::post("/jobs")
        .header(
            CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", common::BOUNDARY),
        )
        .body(Body::from(common::multipart_body(
            "attachment",
            "report.pdf",
            "application/pdf",
            &sample_pdf(1),
        )))
        .unwrap();
    let response = app.send(request).await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["code"], "VALIDATION_ERROR");
    assert_eq!(app.job_count().await, 0);
}

#[tokio::test]
async fn non_multipart_body_is_rejected() {
    let app = build_test_app().await;
    let request = Request::post("/jobs")
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from("{}"))
        .unwrap();
    let response = app.send(request).await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn truncated_multipart_is_rejected_and_leaves_nothing_behind() {
    let app = build_test_app().await;
    let mut body = multipart_body("file", "report.pdf", "application/pdf", &sample_pdf(2));
    // Cut the closing boundary off.
    body.truncate(body.len() - format!("\r\n--{BOUNDARY}--\r\n").len());

    let request = Request::post("/jobs")
        .header(
            CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap();
    let response = app.send(request).await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["code"], "BAD_REQUEST");
    assert!(json.get("data").is_none());
    assert_eq!(app.job_count().await, 0);
    assert!(app
        .engine
        .store()
        .storage()
        .list(".staging")
        .await
        .unwrap()
        .is_empty());
}

// ---------------------------------------------------------------------------
// Access checks
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reads_distinguish_401_403_and_404() {
    let app = build_test_app().await;
    let (id, token) = submit_pdf(&app, 1).await;
    let (_, other_token) = submit_pdf(&app, 1).await;

    // No header at all.
    let response = app.get(&format!("/jobs/{id}")).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["code"], "UNAUTHORIZED");

    // Wrong scheme.
    let response = app
        .get_with_auth(&format!("/jobs/{id}"), &format!("Basic {token}"))
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Malformed secret, even for an unknown job.
    let response = app
        .get_with_auth(&format!("/jobs/{UNKNOWN_ID}"), "Bearer not-a-token")
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Well-formed secret, unknown job.
    let response = app
        .get_with_auth(&format!("/jobs/{UNKNOWN_ID}"), &format!("Bearer {token}"))
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["code"], "NOT_FOUND");

    // Ids that are not UUIDs are unknown.
    let response = app
        .get_with_auth("/jobs/..%2F..%2Fetc", &format!("Bearer {token}"))
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // Well-formed secret belonging to another job.
    let response = app
        .get_with_auth(&format!("/jobs/{id}"), &format!("Bearer {other_token}"))
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(body_json(response).await["code"], "FORBIDDEN");

    let response = app
        .get_with_auth(&format!("/jobs/{id}/result"), &format!("Bearer {other_token}"))
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // Lowercase scheme with the right secret.
    let response = app
        .get_with_auth(&format!("/jobs/{id}"), &format!("bearer {token}"))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn job_detail_never_exposes_secret_or_digest() {
    let app = build_test_app().await;
    let (id, token) = submit_pdf(&app, 1).await;

    let response = app
        .get_with_auth(&format!("/jobs/{id}"), &format!("Bearer {token}"))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    let text = json.to_string();

    assert_eq!(json["data"]["id"], id.as_str());
    assert!(json["data"].get("access_token").is_none());
    assert!(json["data"].get("token_digest").is_none());
    assert!(!text.contains(&token));
    assert!(!text.contains("$argon2id$"));
}

#[tokio::test]
async fn failed_job_has_no_result() {
    let app = build_test_app().await;
    let response = app.upload("deck.ppt", MIME_PPT, &[0xD0, 0xCF, 0x11, 0xE0]).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let json = body_json(response).await;
    let id = json["data"]["id"].as_str().unwrap().to_string();
    let token = json["data"]["access_token"].as_str().unwrap().to_string();

    let (_, job) = app.poll_until_terminal(&id, &token).await;
    assert_eq!(job["status"], "failed");
    assert_eq!(job["error"]["kind"], "unsupported_format");
    assert!(job["started_at"].is_string());
    assert!(job["failed_at"].is_string());

    let response = app
        .get_with_auth(&format!("/jobs/{id}/result"), &format!("Bearer {token}"))
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let json = body_json(response).await;
    assert_eq!(json["code"], "NOT_FOUND");
    assert_eq!(json["details"]["status"], "failed");
    assert_eq!(json["details"]["job_id"], id.as_str());
}
