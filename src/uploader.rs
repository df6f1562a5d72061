//! Browser front-end for the shared directory: a small HTML page plus
//! the JSON endpoints it talks to. Path resolution and the visibility
//! policy are the same rooted logic the WebDAV handler uses, so the
//! two views of the tree always agree.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use http::{Method, StatusCode};
use serde::Serialize;
use serde_json::json;

use crate::codec::href_encode;
use crate::davpath::{SharePolicy, ShareRoot};
use crate::errors::{HttpError, HttpResult};
use crate::handlers::RequestKind;
use crate::request::Request;
use crate::response::Response;
use crate::server::Server;
use crate::sink::temp_file_builder;

const PAGE_TEMPLATE: &str = r##"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>%TITLE%</title>
<style>
body { font-family: sans-serif; margin: 2em; }
h1 { font-size: 1.4em; }
table { border-collapse: collapse; min-width: 30em; }
td, th { border-bottom: 1px solid #ddd; padding: 0.3em 0.8em; text-align: left; }
#dropzone { border: 2px dashed #aaa; padding: 1.5em; margin: 1em 0; }
</style>
</head>
<body>
<h1>%TITLE%</h1>
<div id="dropzone">
  <input type="file" id="files" multiple>
  <button onclick="upload()">Upload</button>
  <button onclick="createDir()">New folder</button>
</div>
<table><thead><tr><th>Name</th><th>Size</th><th></th></tr></thead>
<tbody id="listing"></tbody></table>
<script>
var current = "/";
function esc(s) { return encodeURIComponent(s); }
function refresh() {
  fetch("/list?path=" + esc(current)).then(function (r) { return r.json(); })
    .then(function (items) {
      var rows = "";
      if (current !== "/") {
        rows += '<tr><td><a href="#" onclick="enter(\'..\')">..</a></td><td></td><td></td></tr>';
      }
      items.forEach(function (it) {
        var isDir = it.path.slice(-1) === "/";
        rows += "<tr><td>" + (isDir
          ? '<a href="#" onclick="enter(\'' + it.name + '\')">' + it.name + "/</a>"
          : '<a href="/download?path=' + esc(it.path) + '">' + it.name + "</a>")
          + "</td><td>" + (it.size === undefined ? "" : it.size)
          + '</td><td><a href="#" onclick="del(\'' + it.path + '\')">delete</a></td></tr>';
      });
      document.getElementById("listing").innerHTML = rows;
    });
}
function enter(name) {
  if (name === "..") {
    current = current.replace(/[^\/]+\/$/, "");
  } else {
    current += name + "/";
  }
  refresh();
}
function upload() {
  var input = document.getElementById("files");
  var form = new FormData();
  form.append("path", current);
  for (var i = 0; i < input.files.length; i++) form.append("files[]", input.files[i]);
  fetch("/upload", { method: "POST", body: form }).then(refresh);
}
function del(path) {
  fetch("/delete", { method: "POST",
    headers: { "Content-Type": "application/x-www-form-urlencoded" },
    body: "path=" + esc(path) }).then(refresh);
}
function createDir() {
  var name = prompt("Folder name");
  if (!name) return;
  fetch("/create", { method: "POST",
    headers: { "Content-Type": "application/x-www-form-urlencoded" },
    body: "path=" + esc(current + name) }).then(refresh);
}
refresh();
</script>
</body>
</html>
"##;

/// Configuration of the uploader front-end.
pub struct UploaderBuilder {
    root: PathBuf,
    policy: SharePolicy,
    title: String,
}

impl UploaderBuilder {
    pub fn new(root: impl Into<PathBuf>) -> UploaderBuilder {
        UploaderBuilder {
            root: root.into(),
            policy: SharePolicy::default(),
            title: "File sharing".to_string(),
        }
    }

    /// Only expose files with these extensions (case-insensitive).
    pub fn allowed_file_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let allow_hidden = self.policy.allow_hidden_items;
        self.policy = SharePolicy::with_extensions(extensions, allow_hidden);
        self
    }

    /// Expose `.`-prefixed entries (default is to hide them).
    pub fn allow_hidden_items(mut self, allow: bool) -> Self {
        self.policy.allow_hidden_items = allow;
        self
    }

    /// The page title of the browser UI.
    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn build(self) -> Uploader {
        Uploader {
            inner: Arc::new(UploaderInner {
                root: ShareRoot::new(self.root, self.policy),
                title: self.title,
            }),
        }
    }
}

struct UploaderInner {
    root: ShareRoot,
    title: String,
}

#[derive(Serialize)]
struct ListEntry {
    name: String,
    path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    size: Option<u64>,
}

/// The uploader front-end handler; cheap to clone.
#[derive(Clone)]
pub struct Uploader {
    inner: Arc<UploaderInner>,
}

macro_rules! endpoint {
    ($uploader:ident, $method:ident) => {{
        let uploader = $uploader.clone();
        move |req: Request| {
            let uploader = uploader.clone();
            async move {
                Some(match uploader.$method(&req).await {
                    Ok(resp) => resp,
                    Err(err) => Response::from_error(&err),
                })
            }
        }
    }};
}

impl Uploader {
    pub fn builder(root: impl Into<PathBuf>) -> UploaderBuilder {
        UploaderBuilder::new(root)
    }

    /// Register the page and its endpoints with a server.
    pub fn register(&self, server: &mut Server) {
        let title = htmlescape::encode_minimal(&self.inner.title);
        let page = PAGE_TEMPLATE.replace("%TITLE%", &title);
        server.add_static_data_handler("/", "text/html; charset=utf-8", page);

        server.add_path_handler(
            Method::GET,
            "/list",
            RequestKind::Discard,
            endpoint!(self, list),
        );
        server.add_path_handler(
            Method::GET,
            "/download",
            RequestKind::Discard,
            endpoint!(self, download),
        );
        server.add_path_handler(
            Method::POST,
            "/upload",
            RequestKind::Multipart,
            endpoint!(self, upload),
        );
        server.add_path_handler(
            Method::POST,
            "/delete",
            RequestKind::UrlEncoded,
            endpoint!(self, delete),
        );
        server.add_path_handler(
            Method::POST,
            "/move",
            RequestKind::UrlEncoded,
            endpoint!(self, relocate),
        );
        server.add_path_handler(
            Method::POST,
            "/create",
            RequestKind::UrlEncoded,
            endpoint!(self, create),
        );
    }

    async fn list(&self, req: &Request) -> HttpResult<Response> {
        let url_path = req.query_value("path").unwrap_or("/");
        let url_path = ensure_dir_path(url_path);
        let dir = self.inner.root.resolve(&url_path)?;
        let meta = tokio::fs::metadata(&dir).await?;
        if !meta.is_dir() {
            return Err(HttpError::Message(
                StatusCode::BAD_REQUEST,
                "Not a directory".to_string(),
            ));
        }
        self.inner.root.check_path(&dir, true)?;

        let mut items = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Ok(meta) = tokio::fs::metadata(entry.path()).await else {
                continue;
            };
            if !self.inner.root.policy().allows(&name, meta.is_dir()) {
                continue;
            }
            if meta.is_dir() {
                items.push(ListEntry {
                    path: format!("{url_path}{name}/"),
                    name,
                    size: None,
                });
            } else {
                items.push(ListEntry {
                    path: format!("{url_path}{name}"),
                    name,
                    size: Some(meta.len()),
                });
            }
        }
        // Directories first, then by name.
        items.sort_by(|a, b| {
            (a.size.is_some(), &a.name).cmp(&(b.size.is_some(), &b.name))
        });
        Ok(Response::json(&serde_json::to_value(items).map_err(
            |e| HttpError::Message(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        )?))
    }

    async fn download(&self, req: &Request) -> HttpResult<Response> {
        let url_path = req
            .query_value("path")
            .ok_or_else(|| missing_form_value("path"))?;
        let path = self.inner.root.resolve(url_path)?;
        let meta = tokio::fs::metadata(&path).await?;
        if meta.is_dir() {
            return Err(HttpError::Message(
                StatusCode::BAD_REQUEST,
                "Not a file".to_string(),
            ));
        }
        self.inner.root.check_path(&path, false)?;

        let mut resp = Response::file(&path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        resp.set_header(
            "Content-Disposition",
            &format!("attachment; filename=\"{}\"", name.replace('"', "")),
        );
        Ok(resp)
    }

    async fn upload(&self, req: &Request) -> HttpResult<Response> {
        let dir_path = req.form_value("path").unwrap_or_else(|| "/".to_string());
        let dir_path = ensure_dir_path(&dir_path);
        let dir = self.inner.root.resolve(&dir_path)?;
        let meta = tokio::fs::metadata(&dir).await?;
        if !meta.is_dir() {
            return Err(HttpError::Status(StatusCode::CONFLICT));
        }

        for file in req.files() {
            // Strip any client-supplied directory components.
            let name = file
                .file_name
                .rsplit(['/', '\\'])
                .next()
                .unwrap_or_default()
                .to_string();
            if name.is_empty() {
                continue;
            }
            if !self.inner.root.policy().allows(&name, false) {
                return Err(HttpError::Status(StatusCode::FORBIDDEN));
            }
            let dest = unique_destination(&dir, &name).await;
            stage_copy(file.path(), &dest).await?;
            info!("uploaded {}", dest.display());
        }
        Ok(Response::json(&json!({})))
    }

    async fn delete(&self, req: &Request) -> HttpResult<Response> {
        let url_path = req
            .form_value("path")
            .ok_or_else(|| missing_form_value("path"))?;
        let path = self.inner.root.resolve(&url_path)?;
        let meta = tokio::fs::metadata(&path).await?;
        self.inner.root.check_path(&path, meta.is_dir())?;
        if meta.is_dir() {
            tokio::fs::remove_dir_all(&path).await?;
        } else {
            tokio::fs::remove_file(&path).await?;
        }
        Ok(Response::json(&json!({})))
    }

    async fn relocate(&self, req: &Request) -> HttpResult<Response> {
        let old = req
            .form_value("oldPath")
            .ok_or_else(|| missing_form_value("oldPath"))?;
        let new = req
            .form_value("newPath")
            .ok_or_else(|| missing_form_value("newPath"))?;
        let from = self.inner.root.resolve(&old)?;
        let to = self.inner.root.resolve(&new)?;
        let meta = tokio::fs::metadata(&from).await?;
        self.inner.root.check_path(&from, meta.is_dir())?;
        self.inner.root.check_path(&to, meta.is_dir())?;
        tokio::fs::rename(&from, &to).await?;
        Ok(Response::json(&json!({})))
    }

    async fn create(&self, req: &Request) -> HttpResult<Response> {
        let url_path = req
            .form_value("path")
            .ok_or_else(|| missing_form_value("path"))?;
        let path = self.inner.root.resolve(&url_path)?;
        self.inner.root.check_path(&path, true)?;
        tokio::fs::create_dir_all(&path).await?;
        Ok(Response::json(&json!({
            "path": format!("{}/", href_encode(url_path.trim_end_matches('/')))
        })))
    }
}

fn missing_form_value(name: &str) -> HttpError {
    HttpError::Message(
        StatusCode::BAD_REQUEST,
        format!("Missing '{name}' value"),
    )
}

fn ensure_dir_path(p: &str) -> String {
    if p.ends_with('/') {
        p.to_string()
    } else {
        format!("{p}/")
    }
}

/// `name.ext` becomes `name (N).ext` until the destination is free.
async fn unique_destination(dir: &Path, name: &str) -> PathBuf {
    let mut dest = dir.join(name);
    let mut n = 1u32;
    while tokio::fs::metadata(&dest).await.is_ok() {
        let renamed = match name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => format!("{stem} ({n}).{ext}"),
            _ => format!("{name} ({n})"),
        };
        dest = dir.join(renamed);
        n += 1;
    }
    dest
}

/// Copy through a sibling temp file, then rename into place.
async fn stage_copy(src: &Path, dest: &Path) -> HttpResult<()> {
    let parent = dest
        .parent()
        .ok_or(HttpError::Status(StatusCode::CONFLICT))?;
    let staged = temp_file_builder().tempfile_in(parent)?;
    tokio::fs::copy(src, staged.path()).await?;
    staged.persist(dest).map_err(|e| HttpError::Io(e.error))?;
    Ok(())
}
