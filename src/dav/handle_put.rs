use http::StatusCode;

use crate::errors::{HttpError, HttpResult};
use crate::request::Request;
use crate::response::Response;
use crate::sink::temp_file_builder;

impl crate::dav::WebDavHandler {
    pub(crate) async fn handle_put(&self, req: &Request) -> HttpResult<Response> {
        let path = self.resolve(req)?;
        self.check_parent(&path).await?;
        self.inner.root.check_path(&path, false)?;

        let existed = match self.metadata_opt(&path).await {
            Some(meta) if meta.is_dir() => {
                return Err(HttpError::Status(StatusCode::METHOD_NOT_ALLOWED))
            }
            Some(_) => true,
            None => false,
        };

        // Write a sibling in the target directory, then rename over the
        // destination so readers never see a half-written file.
        let parent = path
            .parent()
            .ok_or(HttpError::Status(StatusCode::CONFLICT))?;
        let staged = temp_file_builder().tempfile_in(parent)?;
        match req.temp_file_path() {
            Some(spooled) => {
                tokio::fs::copy(spooled, staged.path()).await?;
            }
            None => {
                // A PUT without a body creates an empty file.
            }
        }
        staged
            .persist(&path)
            .map_err(|e| HttpError::Io(e.error))?;

        debug!("put {} ({} bytes)", path.display(), req.content_length().unwrap_or(0));
        Ok(Response::new(if existed {
            StatusCode::NO_CONTENT
        } else {
            StatusCode::CREATED
        }))
    }
}
