use http::StatusCode;

use crate::errors::{HttpError, HttpResult};
use crate::request::Request;
use crate::response::Response;

impl crate::dav::WebDavHandler {
    pub(crate) async fn handle_delete(&self, req: &Request) -> HttpResult<Response> {
        let path = self.resolve(req)?;
        let meta = self
            .metadata_opt(&path)
            .await
            .ok_or(HttpError::Status(StatusCode::NOT_FOUND))?;
        self.inner.root.check_path(&path, meta.is_dir())?;

        if meta.is_dir() {
            tokio::fs::remove_dir_all(&path).await?;
        } else {
            tokio::fs::remove_file(&path).await?;
        }
        debug!("deleted {}", path.display());
        Ok(Response::new(StatusCode::NO_CONTENT))
    }
}
