use std::io;

use http::StatusCode;

use crate::errors::{HttpError, HttpResult};
use crate::request::Request;
use crate::response::Response;

impl crate::dav::WebDavHandler {
    pub(crate) async fn handle_mkcol(&self, req: &Request) -> HttpResult<Response> {
        let path = self.resolve(req)?;
        self.inner.root.check_path(&path, true)?;
        self.check_parent(&path).await?;

        match tokio::fs::create_dir(&path).await {
            Ok(()) => Ok(Response::new(StatusCode::CREATED)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                Err(HttpError::Message(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Failed creating directory \"{}\"", req.path()),
                ))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(HttpError::Status(StatusCode::CONFLICT))
            }
            Err(e) => Err(e.into()),
        }
    }
}
