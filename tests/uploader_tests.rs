//! End-to-end tests for the browser front-end endpoints.

mod common;

use common::*;
use tempfile::TempDir;

use davshare::{Server, ServerConfig, Uploader};

async fn start_uploader() -> (Server, u16, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let mut server = Server::new(ServerConfig {
        bind_to_localhost: true,
        ..Default::default()
    });
    Uploader::builder(dir.path())
        .title("Drop zone")
        .build()
        .register(&mut server);
    server.start().await.unwrap();
    let port = server.port().unwrap();
    (server, port, dir)
}

fn multipart_upload(path: &str, files: &[(&str, &[u8])]) -> Vec<u8> {
    let boundary = "UPLOADBOUNDARY";
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
    body.extend_from_slice(
        b"Content-Disposition: form-data; name=\"path\"\r\n\r\n",
    );
    body.extend_from_slice(path.as_bytes());
    body.extend_from_slice(b"\r\n");
    for (name, data) in files {
        body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        body.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"files[]\"; filename=\"{name}\"\r\n\
                 Content-Type: application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(data);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());

    request(
        "POST",
        "/upload",
        &[(
            "Content-Type",
            "multipart/form-data; boundary=UPLOADBOUNDARY",
        )],
        &body,
    )
}

#[tokio::test]
async fn page_is_served() {
    let (mut server, port, _dir) = start_uploader().await;
    let resp = roundtrip(port, &request("GET", "/", &[], b"")).await;
    assert_eq!(resp.status, 200);
    assert_eq!(resp.header("content-type"), Some("text/html; charset=utf-8"));
    assert!(resp.text().contains("<title>Drop zone</title>"));
    server.stop().await;
}

#[tokio::test]
async fn upload_list_download_delete() {
    let (mut server, port, dir) = start_uploader().await;

    let resp = roundtrip(port, &multipart_upload("/", &[("hello.txt", b"uploaded")])).await;
    assert_eq!(resp.status, 200);
    assert_eq!(
        std::fs::read(dir.path().join("hello.txt")).unwrap(),
        b"uploaded"
    );

    // Uploading the same name again auto-renames.
    let resp = roundtrip(port, &multipart_upload("/", &[("hello.txt", b"second")])).await;
    assert_eq!(resp.status, 200);
    assert_eq!(
        std::fs::read(dir.path().join("hello (1).txt")).unwrap(),
        b"second"
    );

    let resp = roundtrip(port, &request("GET", "/list?path=/", &[], b"")).await;
    assert_eq!(resp.status, 200);
    assert_eq!(resp.header("content-type"), Some("application/json"));
    let items: serde_json::Value = serde_json::from_slice(&resp.body).unwrap();
    let names: Vec<&str> = items
        .as_array()
        .unwrap()
        .iter()
        .map(|i| i["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, ["hello (1).txt", "hello.txt"]);
    assert_eq!(items[0]["size"].as_u64(), Some(6));

    let resp = roundtrip(
        port,
        &request("GET", "/download?path=/hello.txt", &[], b""),
    )
    .await;
    assert_eq!(resp.status, 200);
    assert_eq!(
        resp.header("content-disposition"),
        Some("attachment; filename=\"hello.txt\"")
    );
    assert_eq!(resp.body, b"uploaded");

    let resp = roundtrip(
        port,
        &request(
            "POST",
            "/delete",
            &[("Content-Type", "application/x-www-form-urlencoded")],
            b"path=%2Fhello.txt",
        ),
    )
    .await;
    assert_eq!(resp.status, 200);
    assert!(!dir.path().join("hello.txt").exists());

    server.stop().await;
}

#[tokio::test]
async fn create_and_move() {
    let (mut server, port, dir) = start_uploader().await;

    let resp = roundtrip(
        port,
        &request(
            "POST",
            "/create",
            &[("Content-Type", "application/x-www-form-urlencoded")],
            b"path=/photos",
        ),
    )
    .await;
    assert_eq!(resp.status, 200);
    assert!(dir.path().join("photos").is_dir());

    roundtrip(port, &multipart_upload("/photos", &[("p.bin", b"pix")])).await;

    let resp = roundtrip(
        port,
        &request(
            "POST",
            "/move",
            &[("Content-Type", "application/x-www-form-urlencoded")],
            b"oldPath=/photos/p.bin&newPath=/p.bin",
        ),
    )
    .await;
    assert_eq!(resp.status, 200);
    assert!(dir.path().join("p.bin").exists());
    assert!(!dir.path().join("photos/p.bin").exists());

    server.stop().await;
}

#[tokio::test]
async fn policy_applies_to_uploads() {
    let dir = tempfile::tempdir().unwrap();
    let mut server = Server::new(ServerConfig {
        bind_to_localhost: true,
        ..Default::default()
    });
    Uploader::builder(dir.path())
        .allowed_file_extensions(["txt"])
        .build()
        .register(&mut server);
    server.start().await.unwrap();
    let port = server.port().unwrap();

    let resp = roundtrip(port, &multipart_upload("/", &[("evil.exe", b"mz")])).await;
    assert_eq!(resp.status, 403);
    assert!(!dir.path().join("evil.exe").exists());

    let resp = roundtrip(port, &multipart_upload("/", &[("fine.txt", b"ok")])).await;
    assert_eq!(resp.status, 200);

    server.stop().await;
}

#[tokio::test]
async fn client_directory_components_are_stripped() {
    let (mut server, port, dir) = start_uploader().await;
    let resp = roundtrip(
        port,
        &multipart_upload("/", &[("C:\\Users\\me\\doc.txt", b"windows client")]),
    )
    .await;
    assert_eq!(resp.status, 200);
    assert_eq!(
        std::fs::read(dir.path().join("doc.txt")).unwrap(),
        b"windows client"
    );
    server.stop().await;
}
