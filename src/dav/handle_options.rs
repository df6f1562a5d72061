use http::StatusCode;

use crate::errors::HttpResult;
use crate::request::Request;
use crate::response::Response;
use crate::util::MethodSet;

impl crate::dav::WebDavHandler {
    pub(crate) async fn handle_options(&self, _req: &Request) -> HttpResult<Response> {
        let mut methods = self.inner.methods | MethodSet::OPTIONS;
        if methods.contains(MethodSet::GET) {
            methods |= MethodSet::HEAD;
        }

        let mut res = Response::new(StatusCode::OK);
        // Class 1 only: no locking, no live properties.
        res.set_header("DAV", "1");
        res.set_header("MS-Author-Via", "DAV");
        res.set_header("Allow", &methods.names().join(", "));
        Ok(res)
    }
}
