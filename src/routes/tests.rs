use crate::services::{
    extractor::{SevenZipMode, extractor_for},
    file_service::{FileService, ServiceOptions},
    ingestion::tests::build_zip,
    metadata_store::tests::memory_store,
    object_store::DiskObjectStore,
};
use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
    response::Response,
};
use http_body_util::BodyExt;
use serde_json::Value;
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

const BOUNDARY: &str = "gateway-test-boundary";

struct TestApp {
    _dir: TempDir,
    router: Router,
}

impl TestApp {
    async fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let service = FileService::new(
            Arc::new(DiskObjectStore::new(dir.path().join("objects"))),
            Arc::new(memory_store().await),
            extractor_for(SevenZipMode::Native, "7z"),
            ServiceOptions {
                scratch_dir: dir.path().join("scratch"),
                public_base_url: None,
                max_path_depth: 2,
            },
        );
        let router = super::routes::routes(16 * 1024 * 1024).with_state(service);
        Self { _dir: dir, router }
    }

    async fn send(&self, request: Request<Body>) -> Response {
        self.router.clone().oneshot(request).await.unwrap()
    }

    async fn post_form(&self, uri: &str, fields: &[(&str, &str)], file: Option<FormFile<'_>>) -> Response {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::HOST, "gw.test")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .body(Body::from(multipart_body(fields, file)))
            .unwrap();
        self.send(request).await
    }

    async fn get(&self, uri: &str, range: Option<&str>) -> Response {
        let mut builder = Request::builder().method("GET").uri(uri).header(header::HOST, "gw.test");
        if let Some(range) = range {
            builder = builder.header(header::RANGE, range);
        }
        self.send(builder.body(Body::empty()).unwrap()).await
    }

    async fn delete(&self, uri: &str) -> Response {
        let request = Request::builder()
            .method("DELETE")
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        self.send(request).await
    }

    /// Upload `data` as `filename` into bucket `docs`; returns the record id.
    async fn upload(&self, filename: &str, data: &[u8]) -> i64 {
        let res = self
            .post_form(
                "/api/v1/files",
                &[("bucket", "docs")],
                Some(FormFile {
                    field: "file",
                    filename,
                    content_type: None,
                    data,
                }),
            )
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        json_body(res).await["data"]["id"].as_i64().unwrap()
    }
}

struct FormFile<'a> {
    field: &'a str,
    filename: &'a str,
    content_type: Option<&'a str>,
    data: &'a [u8],
}

fn multipart_body(fields: &[(&str, &str)], file: Option<FormFile<'_>>) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, value) in fields {
        body.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n",
                BOUNDARY, name, value
            )
            .as_bytes(),
        );
    }
    if let Some(file) = file {
        body.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n",
                BOUNDARY, file.field, file.filename
            )
            .as_bytes(),
        );
        if let Some(ct) = file.content_type {
            body.extend_from_slice(format!("Content-Type: {}\r\n", ct).as_bytes());
        }
        body.extend_from_slice(b"\r\n");
        body.extend_from_slice(file.data);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
    body
}

async fn body_bytes(res: Response) -> Vec<u8> {
    res.into_body().collect().await.unwrap().to_bytes().to_vec()
}

async fn json_body(res: Response) -> Value {
    serde_json::from_slice(&body_bytes(res).await).unwrap()
}

fn header_str<'a>(res: &'a Response, name: header::HeaderName) -> Option<&'a str> {
    res.headers().get(name).and_then(|v| v.to_str().ok())
}

#[tokio::test]
async fn health_endpoints_report_ok() {
    let app = TestApp::new().await;

    let res = app.get("/healthz", None).await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(json_body(res).await["status"], "ok");

    let res = app.get("/readyz", None).await;
    assert_eq!(res.status(), StatusCode::OK);
    let body = json_body(res).await;
    assert_eq!(body["checks"]["catalog"]["ok"], true);
    assert_eq!(body["checks"]["scratch"]["ok"], true);
}

#[tokio::test]
async fn upload_then_fetch_metadata_and_download() {
    let app = TestApp::new().await;
    let id = app.upload("Notes.TXT", b"0123456789").await;

    let res = app.get(&format!("/api/v1/files/{}", id), None).await;
    assert_eq!(res.status(), StatusCode::OK);
    let body = json_body(res).await;
    assert_eq!(body["code"], 0);
    assert_eq!(body["data"]["original_name"], "Notes.TXT");
    assert_eq!(body["data"]["size_bytes"], 10);
    assert_eq!(
        body["data"]["url"],
        format!("http://gw.test/api/v1/files/{}/download", id)
    );
    assert!(body["data"]["object_key"].as_str().unwrap().ends_with(".txt"));

    let res = app.get(&format!("/api/v1/files/{}/download", id), None).await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(header_str(&res, header::ACCEPT_RANGES), Some("bytes"));
    assert_eq!(header_str(&res, header::CONTENT_LENGTH), Some("10"));
    assert_eq!(header_str(&res, header::CONTENT_TYPE), Some("text/plain"));
    assert_eq!(
        header_str(&res, header::CONTENT_DISPOSITION),
        Some("attachment; filename=\"Notes.TXT\"")
    );
    assert_eq!(body_bytes(res).await, b"0123456789");
}

#[tokio::test]
async fn range_requests_follow_partial_content_rules() {
    let app = TestApp::new().await;
    let id = app.upload("digits.bin", b"0123456789").await;
    let uri = format!("/api/v1/files/{}/download", id);

    for (range, content_range, expected) in [
        ("bytes=0-3", "bytes 0-3/10", &b"0123"[..]),
        ("bytes=5-", "bytes 5-9/10", &b"56789"[..]),
        ("bytes=8-20", "bytes 8-9/10", &b"89"[..]),
        ("Bytes=0-3", "bytes 0-3/10", &b"0123"[..]),
        ("BYTES=5-", "bytes 5-9/10", &b"56789"[..]),
    ] {
        let res = app.get(&uri, Some(range)).await;
        assert_eq!(res.status(), StatusCode::PARTIAL_CONTENT, "{range}");
        assert_eq!(header_str(&res, header::CONTENT_RANGE), Some(content_range));
        let length = expected.len().to_string();
        assert_eq!(header_str(&res, header::CONTENT_LENGTH), Some(length.as_str()));
        assert_eq!(body_bytes(res).await, expected);
    }

    for range in ["bytes=abc", "bytes=5-2", "bytes=0-1,3-4", "bytes=10-"] {
        let res = app.get(&uri, Some(range)).await;
        assert_eq!(res.status(), StatusCode::RANGE_NOT_SATISFIABLE, "{range}");
        assert_eq!(json_body(res).await["status"], 416);
    }
}

#[tokio::test]
async fn deleted_files_are_gone_and_delete_is_idempotent() {
    let app = TestApp::new().await;
    let id = app.upload("a.txt", b"a").await;

    let res = app.delete(&format!("/api/v1/files/{}", id)).await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(json_body(res).await["msg"], "deleted");

    let res = app.delete(&format!("/api/v1/files/{}", id)).await;
    assert_eq!(json_body(res).await["msg"], "already deleted");

    let res = app.get(&format!("/api/v1/files/{}/download", id), None).await;
    assert_eq!(res.status(), StatusCode::GONE);

    let res = app.get("/api/v1/files/bucket/docs", None).await;
    assert_eq!(json_body(res).await["data"], serde_json::json!([]));
}

#[tokio::test]
async fn hard_delete_removes_the_record() {
    let app = TestApp::new().await;
    let id = app.upload("a.txt", b"a").await;

    let res = app.delete(&format!("/api/v1/files/{}/hard-delete", id)).await;
    assert_eq!(res.status(), StatusCode::OK);

    let res = app.get(&format!("/api/v1/files/{}", id), None).await;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let res = app.get(&format!("/api/v1/files/{}/download", id), None).await;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn list_bucket_returns_newest_first() {
    let app = TestApp::new().await;
    let first = app.upload("one.txt", b"1").await;
    let second = app.upload("two.txt", b"2").await;

    let res = app.get("/api/v1/files/bucket/docs", None).await;
    let body = json_body(res).await;
    let ids: Vec<i64> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["id"].as_i64().unwrap())
        .collect();
    assert_eq!(ids, vec![second, first]);
}

#[tokio::test]
async fn archive_upload_reports_uploaded_and_skipped() {
    let app = TestApp::new().await;
    let archive = build_zip(&[
        ("a.txt", b"a"),
        ("b.txt", b"b"),
        ("dir/c.txt", b"c"),
        ("dir/d.txt", b"d"),
        ("dir/e.txt", b"e"),
        ("x/y/deep.txt", b"deep"),
        ("x/y/z/deeper.txt", b"deeper"),
    ]);

    let res = app
        .post_form(
            "/api/v1/files/archive",
            &[("bucket", "docs")],
            Some(FormFile {
                field: "file",
                filename: "bundle.zip",
                content_type: Some("application/zip"),
                data: &archive,
            }),
        )
        .await;
    assert_eq!(res.status(), StatusCode::OK);
    let body = json_body(res).await;
    assert_eq!(body["data"]["uploaded"].as_array().unwrap().len(), 5);
    let mut skipped: Vec<&str> = body["data"]["skipped"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap())
        .collect();
    skipped.sort();
    assert_eq!(skipped, vec!["x/y/deep.txt", "x/y/z/deeper.txt"]);
    assert_eq!(body["data"]["skip_reasons"][0]["reason"], "too_deep");
}

#[tokio::test]
async fn corrupt_archive_is_rejected() {
    let app = TestApp::new().await;
    let res = app
        .post_form(
            "/api/v1/files/archive",
            &[("bucket", "docs")],
            Some(FormFile {
                field: "file",
                filename: "broken.zip",
                content_type: None,
                data: b"not a zip at all",
            }),
        )
        .await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

async fn init(app: &TestApp, uri: &str, filename: &str) -> String {
    let res = app
        .post_form(uri, &[("bucket", "docs"), ("filename", filename)], None)
        .await;
    assert_eq!(res.status(), StatusCode::OK);
    json_body(res).await["data"]["upload_id"]
        .as_str()
        .unwrap()
        .to_string()
}

async fn send_chunk(app: &TestApp, uri: &str, upload_id: &str, index: u32, total: u32, data: &[u8]) -> Response {
    let index = index.to_string();
    let total = total.to_string();
    app.post_form(
        uri,
        &[
            ("upload_id", upload_id),
            ("chunk_index", &index),
            ("total_chunks", &total),
        ],
        Some(FormFile {
            field: "chunk",
            filename: "blob",
            content_type: None,
            data,
        }),
    )
    .await
}

#[tokio::test]
async fn chunked_upload_assembles_one_file() {
    let app = TestApp::new().await;
    let chunk_uri = "/api/v1/files/multipart/chunk";
    let upload_id = init(&app, "/api/v1/files/multipart/init", "movie.txt").await;

    let res = send_chunk(&app, chunk_uri, &upload_id, 1, 3, b"abc").await;
    assert_eq!(res.status(), StatusCode::OK);
    let body = json_body(res).await;
    assert_eq!(body["msg"], "chunk received");
    assert_eq!(body["data"]["received"], 1);
    assert_eq!(body["data"]["total"], 3);

    send_chunk(&app, chunk_uri, &upload_id, 2, 3, b"def").await;
    let res = send_chunk(&app, chunk_uri, &upload_id, 3, 3, b"gh").await;
    assert_eq!(res.status(), StatusCode::OK);
    let body = json_body(res).await;
    assert_eq!(body["data"]["original_name"], "movie.txt");
    assert_eq!(body["data"]["size_bytes"], 8);
    let id = body["data"]["id"].as_i64().unwrap();

    let res = app.get(&format!("/api/v1/files/{}/download", id), None).await;
    assert_eq!(body_bytes(res).await, b"abcdefgh");

    let res = send_chunk(&app, chunk_uri, &upload_id, 1, 3, b"abc").await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn chunked_archive_upload_is_ingested() {
    let app = TestApp::new().await;
    let chunk_uri = "/api/v1/files/archive/multipart/chunk";
    let upload_id = init(&app, "/api/v1/files/archive/multipart/init", "pack.zip").await;
    let archive = build_zip(&[("top.txt", b"top"), ("a/b/c.txt", b"deep")]);
    let (head, tail) = archive.split_at(archive.len() / 3);

    let res = send_chunk(&app, chunk_uri, &upload_id, 1, 2, head).await;
    assert_eq!(res.status(), StatusCode::OK);
    let res = send_chunk(&app, chunk_uri, &upload_id, 2, 2, tail).await;
    assert_eq!(res.status(), StatusCode::OK);

    let body = json_body(res).await;
    assert_eq!(body["data"]["uploaded"][0]["original_name"], "top.txt");
    assert_eq!(body["data"]["skipped"], serde_json::json!(["a/b/c.txt"]));
}

#[tokio::test]
async fn chunk_rejections() {
    let app = TestApp::new().await;
    let upload_id = init(&app, "/api/v1/files/multipart/init", "f.bin").await;

    // plain session, archive endpoint
    let res = send_chunk(&app, "/api/v1/files/archive/multipart/chunk", &upload_id, 1, 2, b"x").await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = send_chunk(&app, "/api/v1/files/multipart/chunk", &upload_id, 0, 2, b"x").await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let unknown = uuid::Uuid::new_v4().to_string();
    let res = send_chunk(&app, "/api/v1/files/multipart/chunk", &unknown, 1, 1, b"x").await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = app
        .post_form("/api/v1/files/multipart/init", &[("bucket", "docs")], None)
        .await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn missing_record_is_not_found() {
    let app = TestApp::new().await;
    let res = app.get("/api/v1/files/424242", None).await;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let body = json_body(res).await;
    assert_eq!(body["status"], 404);
}
