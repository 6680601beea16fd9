//! End-to-end flow through the HTTP surface: multipart upload, code
//! registration, one-shot listener, retrieval bridge and revocation.

use std::sync::Arc;

use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use tower::ServiceExt;

use droplink::broker::CodeBroker;
use droplink::http_share::{AppState, UploadResponse, create_router};

const BOUNDARY: &str = "roundtrip-test-boundary";

fn file_part(filename: &str, content: &[u8]) -> Vec<u8> {
    let mut v = format!(
        "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"files\"; filename=\"{filename}\"\r\n\r\n"
    )
    .into_bytes();
    v.extend_from_slice(content);
    v.extend_from_slice(b"\r\n");
    v
}

fn multipart_request(mut body: Vec<u8>) -> Request<Body> {
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    Request::builder()
        .method("POST")
        .uri("/upload")
        .header(
            "content-type",
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap()
}

fn download_request(code: u16) -> Request<Body> {
    Request::builder()
        .uri(format!("/download/{code}"))
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn test_upload_then_download_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let state = Arc::new(AppState {
        broker: Arc::new(CodeBroker::new()),
        upload_dir: dir.path().to_path_buf(),
        base_url: "http://127.0.0.1:8080".to_string(),
    });
    let router = create_router(state);

    // Binary content with embedded boundary-lookalikes
    let mut content = format!("--{BOUNDARY} not a real marker\n").into_bytes();
    content.extend((0..=255u8).cycle().take(200_000));

    let response = router
        .clone()
        .oneshot(multipart_request(file_part("payload.bin", &content)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
    let upload: UploadResponse = serde_json::from_slice(&bytes).unwrap();
    assert!(!upload.is_zip);

    // The listener is spawned after the code is handed out; give it a
    // moment to bind before connecting.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    let response = router
        .clone()
        .oneshot(download_request(upload.invite_code))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let disposition = response
        .headers()
        .get("content-disposition")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(disposition.contains("payload.bin"), "{disposition}");

    let received = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&received[..], &content[..]);

    // The code served its one transfer; it is dead now
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    let response = router
        .oneshot(download_request(upload.invite_code))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_bundle_upload_downloads_as_zip() {
    let dir = tempfile::tempdir().unwrap();
    let state = Arc::new(AppState {
        broker: Arc::new(CodeBroker::new()),
        upload_dir: dir.path().to_path_buf(),
        base_url: "http://127.0.0.1:8080".to_string(),
    });
    let router = create_router(state);

    let mut body = file_part("a.txt", b"first file");
    body.extend_from_slice(&file_part("b.txt", b"second file"));

    let response = router
        .clone()
        .oneshot(multipart_request(body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
    let upload: UploadResponse = serde_json::from_slice(&bytes).unwrap();
    assert!(upload.is_zip);
    assert_eq!(upload.file_count, 2);

    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    let response = router
        .oneshot(download_request(upload.invite_code))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let received = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    // Zip local file header magic
    assert_eq!(&received[..4], b"PK\x03\x04");
}
