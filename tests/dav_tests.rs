//! End-to-end WebDAV scenarios over real sockets: PUT/GET round trips,
//! MKCOL conflicts, COPY/MOVE semantics, PROPFIND listings, and the
//! visibility policies.

mod common;

use common::*;
use tempfile::TempDir;

use davshare::{Server, ServerConfig, WebDavHandler};

async fn start_dav(dav: davshare::DavBuilder) -> (Server, u16) {
    let mut server = Server::new(ServerConfig {
        bind_to_localhost: true,
        ..Default::default()
    });
    dav.build().register(&mut server);
    server.start().await.unwrap();
    let port = server.port().unwrap();
    (server, port)
}

async fn start_default() -> (Server, u16, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let (server, port) = start_dav(WebDavHandler::builder(dir.path())).await;
    (server, port, dir)
}

#[tokio::test]
async fn put_then_get_then_overwrite() {
    let (mut server, port, _dir) = start_default().await;

    let resp = roundtrip(port, &request("PUT", "/hello.txt", &[], b"Hello")).await;
    assert_eq!(resp.status, 201);

    let resp = roundtrip(port, &request("GET", "/hello.txt", &[], b"")).await;
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body, b"Hello");
    assert_eq!(resp.header("content-type"), Some("text/plain"));

    let resp = roundtrip(port, &request("PUT", "/hello.txt", &[], b"Hi")).await;
    assert_eq!(resp.status, 204);

    let resp = roundtrip(port, &request("GET", "/hello.txt", &[], b"")).await;
    assert_eq!(resp.body, b"Hi");

    server.stop().await;
}

#[tokio::test]
async fn put_into_missing_parent_is_409() {
    let (mut server, port, _dir) = start_default().await;
    let resp = roundtrip(port, &request("PUT", "/no/such/dir.txt", &[], b"x")).await;
    assert_eq!(resp.status, 409);
    server.stop().await;
}

#[tokio::test]
async fn mkcol_and_propfind_listing() {
    let (mut server, port, _dir) = start_default().await;

    let resp = roundtrip(port, &request("MKCOL", "/a/b", &[], b"")).await;
    assert_eq!(resp.status, 409, "parent does not exist yet");

    let resp = roundtrip(port, &request("MKCOL", "/a", &[], b"")).await;
    assert_eq!(resp.status, 201);
    let resp = roundtrip(port, &request("MKCOL", "/a/b", &[], b"")).await;
    assert_eq!(resp.status, 201);

    // MKCOL on an existing target fails with an opaque 500.
    let resp = roundtrip(port, &request("MKCOL", "/a", &[], b"")).await;
    assert_eq!(resp.status, 500);

    let resp = roundtrip(port, &request("PROPFIND", "/a", &[("Depth", "1")], b"")).await;
    assert_eq!(resp.status, 207);
    let xml = resp.text();
    assert!(xml.contains("<D:href>/a/</D:href>"), "{xml}");
    assert!(xml.contains("<D:href>/a/b/</D:href>"), "{xml}");
    assert!(xml.contains("<D:collection"), "{xml}");

    server.stop().await;
}

#[tokio::test]
async fn copy_honors_overwrite_header() {
    let (mut server, port, _dir) = start_default().await;

    roundtrip(port, &request("PUT", "/src.txt", &[], b"the payload")).await;
    roundtrip(port, &request("PUT", "/dst.txt", &[], b"old")).await;

    let dest = format!("http://127.0.0.1:{port}/dst.txt");
    let resp = roundtrip(
        port,
        &request(
            "COPY",
            "/src.txt",
            &[("Destination", &dest), ("Overwrite", "F")],
            b"",
        ),
    )
    .await;
    assert_eq!(resp.status, 412);

    let resp = roundtrip(
        port,
        &request(
            "COPY",
            "/src.txt",
            &[("Destination", &dest), ("Overwrite", "T")],
            b"",
        ),
    )
    .await;
    assert_eq!(resp.status, 204);

    let a = roundtrip(port, &request("GET", "/src.txt", &[], b"")).await;
    let b = roundtrip(port, &request("GET", "/dst.txt", &[], b"")).await;
    assert_eq!(a.body, b.body);

    // Copy to a fresh name reports 201.
    let dest2 = format!("http://127.0.0.1:{port}/fresh.txt");
    let resp = roundtrip(
        port,
        &request("COPY", "/src.txt", &[("Destination", &dest2)], b""),
    )
    .await;
    assert_eq!(resp.status, 201);

    // Missing Destination header is a 400.
    let resp = roundtrip(port, &request("COPY", "/src.txt", &[], b"")).await;
    assert_eq!(resp.status, 400);

    server.stop().await;
}

#[tokio::test]
async fn move_leaves_404_behind() {
    let (mut server, port, _dir) = start_default().await;

    roundtrip(port, &request("PUT", "/src.txt", &[], b"move me")).await;
    let dest = format!("http://127.0.0.1:{port}/dst.txt");
    let resp = roundtrip(
        port,
        &request("MOVE", "/src.txt", &[("Destination", &dest)], b""),
    )
    .await;
    assert_eq!(resp.status, 201);

    let gone = roundtrip(port, &request("GET", "/src.txt", &[], b"")).await;
    assert_eq!(gone.status, 404);
    let there = roundtrip(port, &request("GET", "/dst.txt", &[], b"")).await;
    assert_eq!(there.status, 200);
    assert_eq!(there.body, b"move me");

    server.stop().await;
}

#[tokio::test]
async fn move_directory_recursively() {
    let (mut server, port, _dir) = start_default().await;
    roundtrip(port, &request("MKCOL", "/d", &[], b"")).await;
    roundtrip(port, &request("PUT", "/d/f.txt", &[], b"inner")).await;

    let dest = format!("http://127.0.0.1:{port}/e");
    let resp = roundtrip(port, &request("MOVE", "/d", &[("Destination", &dest)], b"")).await;
    assert_eq!(resp.status, 201);
    let inner = roundtrip(port, &request("GET", "/e/f.txt", &[], b"")).await;
    assert_eq!(inner.body, b"inner");
    server.stop().await;
}

#[tokio::test]
async fn delete_file_and_directory() {
    let (mut server, port, _dir) = start_default().await;
    roundtrip(port, &request("MKCOL", "/d", &[], b"")).await;
    roundtrip(port, &request("PUT", "/d/f.txt", &[], b"x")).await;

    let resp = roundtrip(port, &request("DELETE", "/d", &[], b"")).await;
    assert_eq!(resp.status, 204);
    let resp = roundtrip(port, &request("GET", "/d/f.txt", &[], b"")).await;
    assert_eq!(resp.status, 404);
    let resp = roundtrip(port, &request("DELETE", "/d", &[], b"")).await;
    assert_eq!(resp.status, 404);
    server.stop().await;
}

#[tokio::test]
async fn extension_filter_applies_to_files_only() {
    let dir = tempfile::tempdir().unwrap();
    // A file that exists on disk but is outside the allowed set.
    std::fs::write(dir.path().join("a.jpg"), b"jpeg").unwrap();
    let (mut server, port) = start_dav(
        WebDavHandler::builder(dir.path()).allowed_file_extensions(["txt"]),
    )
    .await;

    // Extension comparison is case-insensitive.
    let resp = roundtrip(port, &request("PUT", "/a.TXT", &[], b"upper")).await;
    assert_eq!(resp.status, 201);

    let resp = roundtrip(port, &request("PUT", "/b.jpg", &[], b"nope")).await;
    assert_eq!(resp.status, 403);

    let resp = roundtrip(port, &request("GET", "/a.jpg", &[], b"")).await;
    assert_eq!(resp.status, 403);

    // Directories are not subject to the extension filter.
    let resp = roundtrip(port, &request("MKCOL", "/subdir", &[], b"")).await;
    assert_eq!(resp.status, 201);

    let resp = roundtrip(port, &request("PROPFIND", "/", &[("Depth", "1")], b"")).await;
    assert_eq!(resp.status, 207);
    let xml = resp.text();
    assert!(xml.contains("a.TXT"), "{xml}");
    assert!(xml.contains("subdir"), "{xml}");
    assert!(!xml.contains("a.jpg"), "filtered file listed: {xml}");

    server.stop().await;
}

#[tokio::test]
async fn hidden_items_are_filtered_by_default() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join(".secret"), b"dot").unwrap();
    std::fs::write(dir.path().join("plain.txt"), b"ok").unwrap();

    let (mut server, port) = start_dav(WebDavHandler::builder(dir.path())).await;
    let resp = roundtrip(port, &request("GET", "/.secret", &[], b"")).await;
    assert_eq!(resp.status, 403);
    let resp = roundtrip(port, &request("PROPFIND", "/", &[("Depth", "1")], b"")).await;
    let xml = resp.text();
    assert!(!xml.contains(".secret"), "{xml}");
    assert!(xml.contains("plain.txt"), "{xml}");
    server.stop().await;

    // Opt in to hidden items.
    let (mut server, port) =
        start_dav(WebDavHandler::builder(dir.path()).allow_hidden_items(true)).await;
    let resp = roundtrip(port, &request("GET", "/.secret", &[], b"")).await;
    assert_eq!(resp.status, 200);
    server.stop().await;
}

#[tokio::test]
async fn propfind_depth_semantics() {
    let (mut server, port, _dir) = start_default().await;
    roundtrip(port, &request("MKCOL", "/a", &[], b"")).await;
    roundtrip(port, &request("PUT", "/a/f.txt", &[], b"leaf")).await;

    // Missing Depth header is a 400.
    let resp = roundtrip(port, &request("PROPFIND", "/", &[], b"")).await;
    assert_eq!(resp.status, 400);

    // Depth 0: exactly one response element, for the target itself.
    let resp = roundtrip(port, &request("PROPFIND", "/", &[("Depth", "0")], b"")).await;
    assert_eq!(resp.status, 207);
    assert_eq!(
        resp.header("content-type"),
        Some("application/xml; charset=\"utf-8\"")
    );
    let xml = resp.text();
    assert_eq!(xml.matches("<D:response>").count(), 1, "{xml}");
    assert!(xml.contains("xmlns:D=\"DAV:\""), "{xml}");
    assert!(xml.contains("<D:multistatus"), "{xml}");
    assert!(xml.contains("<D:collection"), "{xml}");
    assert!(xml.contains("<D:href>/</D:href>"), "{xml}");

    // Depth 1: the target plus its immediate children.
    let resp = roundtrip(port, &request("PROPFIND", "/", &[("Depth", "1")], b"")).await;
    let xml = resp.text();
    assert_eq!(xml.matches("<D:response>").count(), 2, "{xml}");
    assert!(xml.contains("<D:href>/a/</D:href>"), "{xml}");
    assert!(!xml.contains("f.txt"), "{xml}");

    // Depth infinity walks the whole tree.
    let resp = roundtrip(
        port,
        &request("PROPFIND", "/", &[("Depth", "infinity")], b""),
    )
    .await;
    let xml = resp.text();
    assert!(xml.contains("f.txt"), "{xml}");
    assert!(xml.contains("<D:getcontentlength>4</D:getcontentlength>"), "{xml}");
    assert!(xml.contains("<D:getcontenttype>text/plain</D:getcontenttype>"), "{xml}");
    assert!(xml.contains("<D:getlastmodified>"), "{xml}");
    assert!(xml.contains("<D:creationdate>"), "{xml}");

    // PROPFIND on something that is not there.
    let resp = roundtrip(
        port,
        &request("PROPFIND", "/nothing", &[("Depth", "0")], b""),
    )
    .await;
    assert_eq!(resp.status, 404);

    server.stop().await;
}

#[tokio::test]
async fn options_advertises_dav_class_1() {
    let (mut server, port, _dir) = start_default().await;
    let resp = roundtrip(port, &request("OPTIONS", "/", &[], b"")).await;
    assert_eq!(resp.status, 200);
    assert_eq!(resp.header("dav"), Some("1"));
    let allow = resp.header("allow").unwrap();
    for method in [
        "OPTIONS", "GET", "HEAD", "PUT", "DELETE", "MKCOL", "COPY", "MOVE", "PROPFIND",
    ] {
        assert!(allow.contains(method), "missing {method} in {allow}");
    }
    server.stop().await;
}

#[tokio::test]
async fn head_reports_length_without_body() {
    let (mut server, port, _dir) = start_default().await;
    let body = vec![b'z'; 100];
    roundtrip(port, &request("PUT", "/x", &[], &body)).await;

    let resp = roundtrip(port, &request("HEAD", "/x", &[], b"")).await;
    assert_eq!(resp.status, 200);
    assert_eq!(resp.header("content-length"), Some("100"));
    assert!(resp.body.is_empty());
    server.stop().await;
}

#[tokio::test]
async fn get_on_directory_is_empty_200() {
    let (mut server, port, _dir) = start_default().await;
    roundtrip(port, &request("MKCOL", "/d", &[], b"")).await;
    let resp = roundtrip(port, &request("GET", "/d", &[], b"")).await;
    assert_eq!(resp.status, 200);
    assert!(resp.body.is_empty());
    assert_eq!(resp.header("content-length"), Some("0"));
    server.stop().await;
}

#[tokio::test]
async fn traversal_cannot_escape_the_root() {
    let outer = tempfile::tempdir().unwrap();
    std::fs::write(outer.path().join("outside.txt"), b"top secret").unwrap();
    let root = outer.path().join("root");
    std::fs::create_dir(&root).unwrap();

    let (mut server, port) = start_dav(WebDavHandler::builder(&root)).await;
    let resp = roundtrip(port, &request("GET", "/../outside.txt", &[], b"")).await;
    assert_eq!(resp.status, 403);
    let resp = roundtrip(
        port,
        &request("GET", "/%2e%2e/outside.txt", &[], b""),
    )
    .await;
    assert_eq!(resp.status, 403);
    // Normalized paths that stay inside are fine.
    roundtrip(port, &request("MKCOL", "/a", &[], b"")).await;
    let resp = roundtrip(port, &request("PUT", "/a/../ok.txt", &[], b"fine")).await;
    assert_eq!(resp.status, 201);
    server.stop().await;
}

#[tokio::test]
async fn put_and_get_gzip_round_trip() {
    use std::io::Write as _;
    let (mut server, port, _dir) = start_default().await;

    // Upload a gzip-compressed body; the stored file is the inflated
    // bytes.
    let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    enc.write_all(b"inflated on arrival").unwrap();
    let compressed = enc.finish().unwrap();
    let resp = roundtrip(
        port,
        &request(
            "PUT",
            "/packed.txt",
            &[("Content-Encoding", "gzip")],
            &compressed,
        ),
    )
    .await;
    assert_eq!(resp.status, 201);

    let resp = roundtrip(port, &request("GET", "/packed.txt", &[], b"")).await;
    assert_eq!(resp.body, b"inflated on arrival");
    server.stop().await;
}
