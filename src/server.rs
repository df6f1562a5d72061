//! The server: socket lifecycle, configuration, and handler
//! registration.
//!
//! A [`Server`] is built stopped, has handlers registered, then
//! `start()` binds the socket and spawns the accept loop. Handlers and
//! configuration are read-only while running; registration calls made
//! while running are ignored with a warning. `stop()` closes the
//! listener and drains live connections, bounded by the drain timeout.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::FutureExt;
use http::{Method, StatusCode};
use regex::Regex;
use tokio::net::TcpListener;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use url::Url;

use crate::auth::{AuthMethod, Authenticator};
use crate::conn::Connection;
use crate::errors::{HttpError, HttpResult};
use crate::handlers::{
    boxed_process, literal_matcher, method_matcher, regex_matcher, HandlerRegistry,
    MatchFn, ProcessFn, RequestKind, Route, RoutePattern,
};
use crate::request::{Request, RequestHead};
use crate::response::Response;

/// Options accepted at server start.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP port; 0 picks an ephemeral port.
    pub port: u16,
    /// Bind to 127.0.0.1 instead of all interfaces.
    pub bind_to_localhost: bool,
    /// Value of the `Server:` response header.
    pub server_name: String,
    /// Synthesize a GET invocation for HEAD requests, discarding the
    /// response body while keeping Content-Length.
    pub map_head_to_get: bool,
    pub authentication_method: AuthMethod,
    pub authentication_realm: String,
    /// Account table, name to secret.
    pub authentication_accounts: HashMap<String, String>,
    /// Upper bound on concurrently served connections.
    pub max_connections: usize,
    /// Header sections larger than this are refused with 431.
    pub max_header_size: usize,
    /// Request lines longer than this are refused with 414.
    pub max_uri_length: usize,
    /// Request bodies larger than this are refused with 413; `None`
    /// means unbounded.
    pub max_body_size: Option<u64>,
    /// Per-read timeout while a request head or body is arriving.
    pub read_header_timeout: Duration,
    /// How long an idle keep-alive connection waits for its next
    /// request.
    pub keep_alive_timeout: Duration,
    /// How long `stop()` waits for in-flight connections.
    pub drain_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            port: 0,
            bind_to_localhost: false,
            server_name: "davshare".to_string(),
            map_head_to_get: true,
            authentication_method: AuthMethod::None,
            authentication_realm: "davshare".to_string(),
            authentication_accounts: HashMap::new(),
            max_connections: 64,
            max_header_size: 16 * 1024,
            max_uri_length: 4096,
            max_body_size: None,
            read_header_timeout: Duration::from_secs(30),
            keep_alive_timeout: Duration::from_secs(15),
            drain_timeout: Duration::from_secs(5),
        }
    }
}

/// State shared with every connection task.
pub(crate) struct ServerInner {
    pub(crate) config: ServerConfig,
    pub(crate) registry: Arc<HandlerRegistry>,
    pub(crate) auth: Option<Authenticator>,
}

struct Running {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

/// An embeddable HTTP/1.1 server.
pub struct Server {
    config: ServerConfig,
    registry: Arc<HandlerRegistry>,
    running: Option<Running>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Server {
        Server {
            config,
            registry: Arc::new(HandlerRegistry::new()),
            running: None,
        }
    }

    fn registry_mut(&mut self) -> Option<&mut HandlerRegistry> {
        if self.running.is_some() {
            warn!("handler registration ignored while the server is running");
            return None;
        }
        Arc::get_mut(&mut self.registry)
    }

    pub(crate) fn add_raw(
        &mut self,
        matcher: Box<MatchFn>,
        process: Arc<ProcessFn>,
        route: Option<Route>,
    ) {
        if let Some(registry) = self.registry_mut() {
            registry.add(matcher, process, route);
        }
    }

    /// Register a handler with an arbitrary match predicate. The
    /// predicate claims a request by returning a constructed
    /// [`Request`] (thereby choosing the body sink).
    pub fn add_handler<M, F, Fut>(&mut self, matcher: M, process: F)
    where
        M: Fn(&RequestHead) -> Option<Request> + Send + Sync + 'static,
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<Response>> + Send + 'static,
    {
        self.add_raw(Box::new(matcher), boxed_process(process), None);
    }

    /// Register a default handler for every request of one method.
    pub fn add_method_handler<F, Fut>(&mut self, method: Method, kind: RequestKind, process: F)
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<Response>> + Send + 'static,
    {
        let route = Route {
            method: method.clone(),
            pattern: RoutePattern::Any,
        };
        self.add_raw(
            method_matcher(method, kind),
            boxed_process(process),
            Some(route),
        );
    }

    /// Register a handler for a literal path.
    pub fn add_path_handler<F, Fut>(
        &mut self,
        method: Method,
        path: &str,
        kind: RequestKind,
        process: F,
    ) where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<Response>> + Send + 'static,
    {
        let route = Route {
            method: method.clone(),
            pattern: RoutePattern::Literal(path.to_string()),
        };
        self.add_raw(
            literal_matcher(method, path.to_string(), kind),
            boxed_process(process),
            Some(route),
        );
    }

    /// Register a handler for a path regex. Capture groups are exposed
    /// as the request attribute
    /// [`REGEX_CAPTURES`](crate::request::REGEX_CAPTURES).
    pub fn add_regex_handler<F, Fut>(
        &mut self,
        method: Method,
        pattern: Regex,
        kind: RequestKind,
        process: F,
    ) where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<Response>> + Send + 'static,
    {
        let route = Route {
            method: method.clone(),
            pattern: RoutePattern::Regex(pattern.clone()),
        };
        self.add_raw(
            regex_matcher(method, pattern, kind),
            boxed_process(process),
            Some(route),
        );
    }

    /// Serve fixed bytes on a literal path.
    pub fn add_static_data_handler(
        &mut self,
        path: &str,
        content_type: &str,
        data: impl Into<Bytes>,
    ) {
        let data = data.into();
        let content_type = content_type.to_string();
        self.add_path_handler(Method::GET, path, RequestKind::Discard, move |_req| {
            let data = data.clone();
            let content_type = content_type.clone();
            async move { Some(Response::with_data(data, content_type)) }
        });
    }

    /// Serve one file on a literal path, honoring range requests.
    pub fn add_file_handler(&mut self, path: &str, file: impl Into<PathBuf>) {
        let file = file.into();
        self.add_path_handler(Method::GET, path, RequestKind::Discard, move |req| {
            let file = file.clone();
            async move {
                match Response::file_range(&file, req.byte_range()).await {
                    Ok(resp) => Some(resp),
                    Err(e) => Some(Response::from_error(&e)),
                }
            }
        });
    }

    /// Serve a directory tree under a base path; `index_filename` (if
    /// any) answers for the directory paths themselves.
    pub fn add_directory_handler(
        &mut self,
        base_path: &str,
        directory: impl Into<PathBuf>,
        index_filename: Option<&str>,
    ) {
        let base = if base_path.ends_with('/') {
            base_path.to_string()
        } else {
            format!("{base_path}/")
        };
        let directory = directory.into();
        let index = index_filename.map(str::to_string);
        let route = Route {
            method: Method::GET,
            pattern: RoutePattern::Prefix(base.clone()),
        };
        let matcher = {
            let base = base.clone();
            Box::new(move |head: &RequestHead| {
                if head.method == Method::GET
                    && (head.path.starts_with(base.as_str())
                        || head.path == base[..base.len() - 1])
                {
                    Request::new(head).ok()
                } else {
                    None
                }
            })
        };
        let process = boxed_process(move |req: Request| {
            let directory = directory.clone();
            let base = base.clone();
            let index = index.clone();
            async move {
                let rel = req.path().strip_prefix(base.as_str()).unwrap_or("");
                if rel.split('/').any(|seg| seg == "..") {
                    return Some(Response::error(
                        StatusCode::NOT_FOUND,
                        "Path escapes the served directory",
                    ));
                }
                let mut target = directory.join(rel);
                match tokio::fs::metadata(&target).await {
                    Ok(meta) if meta.is_dir() => match &index {
                        Some(name) => target = target.join(name),
                        None => {
                            return Some(Response::error(
                                StatusCode::NOT_FOUND,
                                "No index for directory",
                            ))
                        }
                    },
                    _ => {}
                }
                match Response::file_range(&target, req.byte_range()).await {
                    Ok(resp) => Some(resp),
                    Err(e) => Some(Response::from_error(&e)),
                }
            }
        });
        self.add_raw(matcher, process, Some(route));
    }

    /// Bind the socket and start serving.
    pub async fn start(&mut self) -> HttpResult<()> {
        if self.running.is_some() {
            return Err(HttpError::Io(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "server is already running",
            )));
        }
        if self.registry.is_empty() {
            warn!("starting with no registered handlers; every request will fail");
        }

        let ip: IpAddr = if self.config.bind_to_localhost {
            Ipv4Addr::LOCALHOST.into()
        } else {
            Ipv4Addr::UNSPECIFIED.into()
        };
        let listener = TcpListener::bind((ip, self.config.port)).await?;
        let local_addr = listener.local_addr()?;

        let inner = Arc::new(ServerInner {
            auth: Authenticator::new(
                self.config.authentication_method,
                self.config.authentication_realm.clone(),
                self.config.authentication_accounts.clone(),
            ),
            registry: self.registry.clone(),
            config: self.config.clone(),
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop(listener, inner, shutdown_rx));
        self.running = Some(Running {
            local_addr,
            shutdown_tx,
            accept_task,
        });
        info!("listening on {local_addr}");
        Ok(())
    }

    /// Stop accepting, signal connection tasks, and wait for them
    /// bounded by the drain timeout.
    pub async fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            let _ = running.shutdown_tx.send(true);
            let _ = running.accept_task.await;
            info!("stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// The bound port, while running.
    pub fn port(&self) -> Option<u16> {
        self.running.as_ref().map(|r| r.local_addr.port())
    }

    /// `http://host:port/` for the running server.
    pub fn server_url(&self) -> Option<Url> {
        let running = self.running.as_ref()?;
        let ip = match running.local_addr.ip() {
            ip if ip.is_unspecified() => IpAddr::from(Ipv4Addr::LOCALHOST),
            ip => ip,
        };
        let url = if running.local_addr.port() == 80 {
            format!("http://{ip}/")
        } else {
            format!("http://{}:{}/", ip, running.local_addr.port())
        };
        Url::parse(&url).ok()
    }
}

async fn accept_loop(
    listener: TcpListener,
    inner: Arc<ServerInner>,
    mut shutdown: watch::Receiver<bool>,
) {
    let limit = Arc::new(Semaphore::new(inner.config.max_connections));
    let mut tasks: JoinSet<()> = JoinSet::new();
    let bind_addr = listener.local_addr().ok();

    loop {
        // Reap whatever already finished.
        while let Some(Some(_)) = tasks.join_next().now_or_never() {}

        // Connection bound: hold a permit before accepting.
        let permit = tokio::select! {
            _ = shutdown.changed() => break,
            p = limit.clone().acquire_owned() => match p {
                Ok(p) => p,
                Err(_) => break,
            },
        };
        let accepted = tokio::select! {
            _ = shutdown.changed() => break,
            r = listener.accept() => r,
        };
        match accepted {
            Ok((stream, peer)) => {
                let local = stream
                    .local_addr()
                    .ok()
                    .or(bind_addr)
                    .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));
                let conn = Connection::new(
                    stream,
                    inner.clone(),
                    local,
                    peer,
                    shutdown.clone(),
                );
                tasks.spawn(async move {
                    conn.serve().await;
                    drop(permit);
                });
            }
            Err(e) => {
                warn!("accept failed: {e}");
                drop(permit);
            }
        }
    }

    drop(listener);
    let drain = inner.config.drain_timeout;
    let all_done = async {
        while tasks.join_next().await.is_some() {}
    };
    if tokio::time::timeout(drain, all_done).await.is_err() {
        warn!("drain timeout, aborting {} connections", tasks.len());
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }
}
