//! ## Embeddable async HTTP/1.1 server with WebDAV file sharing
//!
//! This crate lets an application expose request handlers, and
//! optionally a directory tree, over HTTP on a bound socket without
//! pulling in a web framework. It owns the whole exchange: the
//! per-connection HTTP/1.1 state machine, header and chunked-body
//! framing, gzip on both sides, handler matching, and response
//! streaming.
//!
//! ## Handlers
//!
//! A handler is a pair of a *match predicate* and an async *process*
//! function. The predicate looks at the parsed request line and
//! headers and claims the request by constructing a [`Request`] with
//! the body sink it wants (in memory, spooled to a temp file, parsed
//! `multipart/form-data`, or a decoded form). Matching is
//! last-registered-first; the process function receives the request
//! after its body has been streamed through the decoding pipeline and
//! returns a [`Response`], which the connection engine writes out
//! lazily (chunked when the length is unknown, gzip when enabled and
//! accepted).
//!
//! Convenience registrations cover literal paths, path regexes
//! (capture groups land in the request attribute bag), per-method
//! defaults, static data, single files, and directory trees.
//!
//! ## WebDAV and the browser UI
//!
//! [`WebDavHandler`] implements the WebDAV Class 1 subset
//! (OPTIONS/GET/HEAD/PUT/DELETE/MKCOL/COPY/MOVE/PROPFIND) over a root
//! directory with strict path containment and visibility policies
//! (allowed file extensions, hidden dotfiles). Linux, Windows and
//! macOS can mount it as a network share. [`Uploader`] serves a small
//! browser page plus JSON endpoints over the same rooted logic.
//!
//! ## Example
//!
//! Serve `/tmp` read-write over WebDAV on an ephemeral port:
//!
//! ```no_run
//! use davshare::{Server, ServerConfig, WebDavHandler};
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut server = Server::new(ServerConfig {
//!         bind_to_localhost: true,
//!         ..Default::default()
//!     });
//!     WebDavHandler::builder("/tmp").build().register(&mut server);
//!     server.start().await.expect("bind failed");
//!     println!("serving on {}", server.server_url().unwrap());
//!     tokio::signal::ctrl_c().await.ok();
//!     server.stop().await;
//! }
//! ```

#[macro_use]
extern crate log;

mod auth;
mod codec;
mod conditional;
mod conn;
mod davpath;
mod errors;
mod handlers;
mod multipart;
mod pipeline;
mod request;
mod response;
mod server;
mod sink;
mod util;

mod dav;
mod uploader;

pub use crate::auth::AuthMethod;
pub use crate::codec::ByteRange;
pub use crate::dav::{DavBuilder, WebDavHandler};
pub use crate::davpath::SharePolicy;
pub use crate::errors::{HttpError, HttpResult};
pub use crate::handlers::RequestKind;
pub use crate::multipart::{MultipartArgument, MultipartFile};
pub use crate::request::{AttrValue, ContentType, Request, RequestHead, REGEX_CAPTURES};
pub use crate::response::Response;
pub use crate::server::{Server, ServerConfig};
pub use crate::sink::BodySink;
pub use crate::uploader::{Uploader, UploaderBuilder};
pub use crate::util::MethodSet;
