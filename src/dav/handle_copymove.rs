use std::io;
use std::path::Path;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use http::StatusCode;
use url::Url;

use crate::codec::percent_decode;
use crate::errors::{HttpError, HttpResult};
use crate::request::Request;
use crate::response::Response;

impl crate::dav::WebDavHandler {
    pub(crate) async fn handle_copymove(
        &self,
        req: &Request,
        is_move: bool,
    ) -> HttpResult<Response> {
        let source = self.resolve(req)?;
        let source_meta = self
            .metadata_opt(&source)
            .await
            .ok_or(HttpError::Status(StatusCode::NOT_FOUND))?;
        let is_dir = source_meta.is_dir();
        self.inner.root.check_path(&source, is_dir)?;

        // The Destination header is an absolute URL whose path lands
        // under the same root.
        let destination = req.header("destination").ok_or_else(|| {
            HttpError::Message(
                StatusCode::BAD_REQUEST,
                "Missing 'Destination' header".to_string(),
            )
        })?;
        let dest_url = Url::parse(destination).map_err(|_| {
            HttpError::Message(
                StatusCode::BAD_REQUEST,
                "Invalid 'Destination' header".to_string(),
            )
        })?;
        let dest_path = percent_decode(dest_url.path())?;
        let dest = self.inner.root.resolve(&dest_path)?;
        self.inner.root.check_path(&dest, is_dir)?;
        self.check_parent(&dest).await?;

        // Overwrite defaults to T.
        let overwrite = !req
            .header("overwrite")
            .map(|v| v.trim().eq_ignore_ascii_case("F"))
            .unwrap_or(false);
        let dest_meta = self.metadata_opt(&dest).await;
        let dest_existed = dest_meta.is_some();
        if dest_existed && !overwrite {
            return Err(HttpError::Status(StatusCode::PRECONDITION_FAILED));
        }

        if is_move {
            // Rename replaces a plain file atomically; an existing
            // directory in the way has to go first.
            if let Some(meta) = &dest_meta {
                if meta.is_dir() {
                    tokio::fs::remove_dir_all(&dest).await?;
                }
            }
            tokio::fs::rename(&source, &dest).await?;
            debug!("moved {} -> {}", source.display(), dest.display());
        } else {
            if let Some(meta) = &dest_meta {
                if meta.is_dir() {
                    tokio::fs::remove_dir_all(&dest).await?;
                } else {
                    tokio::fs::remove_file(&dest).await?;
                }
            }
            copy_tree(&source, &dest).await?;
            debug!("copied {} -> {}", source.display(), dest.display());
        }

        Ok(Response::new(if dest_existed {
            StatusCode::NO_CONTENT
        } else {
            StatusCode::CREATED
        }))
    }
}

// Recursive copy; directories are created eagerly, files copied one by
// one.
fn copy_tree<'a>(from: &'a Path, to: &'a Path) -> BoxFuture<'a, io::Result<()>> {
    async move {
        let meta = tokio::fs::metadata(from).await?;
        if meta.is_dir() {
            tokio::fs::create_dir(to).await?;
            let mut entries = tokio::fs::read_dir(from).await?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name();
                copy_tree(&from.join(&name), &to.join(&name)).await?;
            }
        } else {
            tokio::fs::copy(from, to).await?;
        }
        Ok(())
    }
    .boxed()
}
