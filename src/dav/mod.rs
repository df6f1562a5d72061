//
// WebDAV Class 1 file sharing over a rooted directory tree.
// WebDavHandler plugs into a Server and implements
// OPTIONS/GET/HEAD/PUT/DELETE/MKCOL/COPY/MOVE/PROPFIND, with policy
// filters (allowed extensions, hidden items) applied throughout.
//

use std::path::PathBuf;
use std::sync::Arc;

use http::{Method, StatusCode};

use crate::davpath::{SharePolicy, ShareRoot};
use crate::errors::{HttpError, HttpResult};
use crate::handlers::{boxed_process, method_matcher, RequestKind, Route, RoutePattern};
use crate::request::Request;
use crate::response::Response;
use crate::server::Server;
use crate::util::MethodSet;

pub mod handle_copymove;
pub mod handle_delete;
pub mod handle_gethead;
pub mod handle_mkcol;
pub mod handle_options;
pub mod handle_propfind;
pub mod handle_put;

/// Configuration of the WebDAV handler.
pub struct DavBuilder {
    root: PathBuf,
    policy: SharePolicy,
    /// Set of served methods (defaults to the full Class 1 set).
    methods: MethodSet,
}

impl DavBuilder {
    pub fn new(root: impl Into<PathBuf>) -> DavBuilder {
        DavBuilder {
            root: root.into(),
            policy: SharePolicy::default(),
            methods: MethodSet::WEBDAV_RW,
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

    /// Which methods to serve, e.g. [`MethodSet::WEBDAV_RO`] for a
    /// read-only share.
    pub fn methods(mut self, methods: MethodSet) -> Self {
        self.methods = methods;
        self
    }

    pub fn build(self) -> WebDavHandler {
        WebDavHandler {
            inner: Arc::new(DavInner {
                root: ShareRoot::new(self.root, self.policy),
                methods: self.methods,
            }),
        }
    }
}

pub(crate) struct DavInner {
    pub(crate) root: ShareRoot,
    pub(crate) methods: MethodSet,
}

/// The WebDAV request handler; cheap to clone.
#[derive(Clone)]
pub struct WebDavHandler {
    pub(crate) inner: Arc<DavInner>,
}

impl WebDavHandler {
    pub fn builder(root: impl Into<PathBuf>) -> DavBuilder {
        DavBuilder::new(root)
    }

    /// Register this handler's methods with a server. Claims every
    /// path, so register more specific handlers afterwards (matching
    /// is last-registered-first).
    pub fn register(&self, server: &mut Server) {
        let mut methods = self.inner.methods;
        // HEAD rides along with GET even when the server-level
        // HEAD-to-GET mapping is off.
        if methods.contains(MethodSet::GET) {
            methods |= MethodSet::HEAD;
        }
        methods |= MethodSet::OPTIONS;

        for name in methods.names() {
            let method = Method::from_bytes(name.as_bytes()).unwrap_or(Method::OPTIONS);
            // PUT streams its body to a temp file; everything else can
            // afford memory (bodies there are small or ignored).
            let kind = match methods_bit(&method) {
                MethodSet::PUT => RequestKind::TempFile,
                MethodSet::PROPFIND => RequestKind::Memory,
                _ => RequestKind::Discard,
            };
            let dav = self.clone();
            let process = boxed_process(move |req: Request| {
                let dav = dav.clone();
                async move { Some(dav.handle(req).await) }
            });
            server.add_raw(
                method_matcher(method.clone(), kind),
                process,
                Some(Route {
                    method,
                    pattern: RoutePattern::Any,
                }),
            );
        }
    }

    /// Handle one request, turning any error into its HTTP response.
    pub async fn handle(&self, req: Request) -> Response {
        match self.dispatch(&req).await {
            Ok(resp) => resp,
            Err(err) => {
                debug!("dav {} {}: {}", req.method(), req.path(), err);
                Response::from_error(&err)
            }
        }
    }

    async fn dispatch(&self, req: &Request) -> HttpResult<Response> {
        let bit = methods_bit(req.method());
        match bit {
            MethodSet::OPTIONS => self.handle_options(req).await,
            MethodSet::HEAD | MethodSet::GET => self.handle_gethead(req).await,
            MethodSet::PUT => self.handle_put(req).await,
            MethodSet::DELETE => self.handle_delete(req).await,
            MethodSet::MKCOL => self.handle_mkcol(req).await,
            MethodSet::COPY => self.handle_copymove(req, false).await,
            MethodSet::MOVE => self.handle_copymove(req, true).await,
            MethodSet::PROPFIND => self.handle_propfind(req).await,
            _ => Err(HttpError::Status(StatusCode::METHOD_NOT_ALLOWED)),
        }
    }

    /// Resolve the request path under the share root.
    pub(crate) fn resolve(&self, req: &Request) -> HttpResult<PathBuf> {
        self.inner.root.resolve(req.path())
    }

    /// Metadata, or `None` for anything that is not there.
    pub(crate) async fn metadata_opt(
        &self,
        path: &std::path::Path,
    ) -> Option<std::fs::Metadata> {
        tokio::fs::metadata(path).await.ok()
    }

    /// 409 unless the parent of `path` is an existing directory.
    pub(crate) async fn check_parent(&self, path: &std::path::Path) -> HttpResult<()> {
        let parent = path
            .parent()
            .ok_or(HttpError::Status(StatusCode::CONFLICT))?;
        match self.metadata_opt(parent).await {
            Some(meta) if meta.is_dir() => Ok(()),
            _ => Err(HttpError::Status(StatusCode::CONFLICT)),
        }
    }
}

fn methods_bit(method: &Method) -> MethodSet {
    MethodSet::from_method(method).unwrap_or(MethodSet::empty())
}
