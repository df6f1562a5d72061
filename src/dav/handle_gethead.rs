use http::StatusCode;

use crate::errors::{HttpError, HttpResult};
use crate::request::Request;
use crate::response::Response;

impl crate::dav::WebDavHandler {
    pub(crate) async fn handle_gethead(&self, req: &Request) -> HttpResult<Response> {
        let path = self.resolve(req)?;
        let meta = self
            .metadata_opt(&path)
            .await
            .ok_or(HttpError::Status(StatusCode::NOT_FOUND))?;

        if meta.is_dir() {
            self.inner.root.check_path(&path, true)?;
            // Collections answer GET with an empty body.
            return Ok(Response::new(StatusCode::OK));
        }

        self.inner.root.check_path(&path, false)?;
        let mut res = Response::file_range(&path, req.byte_range()).await?;
        res.set_cache_max_age(0);
        Ok(res)
    }
}
