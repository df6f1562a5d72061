//! The handler registry: an ordered list of (match predicate, async
//! process) pairs.
//!
//! Matching is LIFO: the handler registered last is tried first, and
//! the first predicate that returns a constructed [`Request`] claims
//! the request. The predicate also decides the body sink, so a handler
//! receives its body in the shape it asked for.

use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use http::{Method, StatusCode};
use regex::Regex;

use crate::request::{AttrValue, Request, RequestHead, REGEX_CAPTURES};
use crate::response::Response;

/// A match predicate: returns a constructed request to claim it.
pub type MatchFn = dyn Fn(&RequestHead) -> Option<Request> + Send + Sync;

/// An async request processor; `None` turns into a 500.
pub type ProcessFn = dyn Fn(Request) -> BoxFuture<'static, Option<Response>> + Send + Sync;

/// Which body sink a convenience registration gives its requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Body bytes are discarded.
    Discard,
    /// Body buffered in memory.
    Memory,
    /// Body spooled to a temp file.
    TempFile,
    /// Body parsed as `multipart/form-data`.
    Multipart,
    /// Body parsed as `application/x-www-form-urlencoded`.
    UrlEncoded,
}

impl RequestKind {
    fn build(self, head: &RequestHead) -> Option<Request> {
        match self {
            RequestKind::Discard => Request::new(head),
            RequestKind::Memory => Request::memory(head),
            RequestKind::TempFile => Request::temp_file(head),
            RequestKind::Multipart => Request::multipart(head),
            RequestKind::UrlEncoded => Request::url_encoded(head),
        }
        .ok()
    }
}

pub(crate) enum RoutePattern {
    Literal(String),
    Prefix(String),
    Regex(Regex),
    Any,
}

impl RoutePattern {
    fn matches(&self, path: &str) -> bool {
        match self {
            RoutePattern::Literal(p) => p == path,
            RoutePattern::Prefix(p) => path.starts_with(p.as_str()),
            RoutePattern::Regex(re) => re.is_match(path),
            RoutePattern::Any => true,
        }
    }
}

/// Route metadata carried by convenience registrations; used to tell
/// "wrong method on a known path" (405) from "nothing here" (501).
pub(crate) struct Route {
    pub method: Method,
    pub pattern: RoutePattern,
}

pub(crate) struct Handler {
    matcher: Box<MatchFn>,
    process: Arc<ProcessFn>,
    route: Option<Route>,
}

/// The ordered handler list shared by all connections.
#[derive(Default)]
pub(crate) struct HandlerRegistry {
    handlers: Vec<Handler>,
}

impl HandlerRegistry {
    pub(crate) fn new() -> HandlerRegistry {
        HandlerRegistry::default()
    }

    pub(crate) fn add(
        &mut self,
        matcher: Box<MatchFn>,
        process: Arc<ProcessFn>,
        route: Option<Route>,
    ) {
        self.handlers.push(Handler {
            matcher,
            process,
            route,
        });
    }

    /// Try the predicates in reverse registration order; first claim
    /// wins.
    pub(crate) fn find(&self, head: &RequestHead) -> Option<(Request, Arc<ProcessFn>)> {
        for handler in self.handlers.iter().rev() {
            if let Some(req) = (handler.matcher)(head) {
                return Some((req, handler.process.clone()));
            }
        }
        None
    }

    /// The status for an unmatched request: 405 when some route knows
    /// the path under another method, 501 otherwise.
    pub(crate) fn no_match_status(&self, head: &RequestHead) -> StatusCode {
        let other_method = self.handlers.iter().any(|h| {
            h.route.as_ref().map_or(false, |r| {
                r.method != head.method && r.pattern.matches(&head.path)
            })
        });
        if other_method {
            StatusCode::METHOD_NOT_ALLOWED
        } else {
            StatusCode::NOT_IMPLEMENTED
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Wrap an async closure into the boxed process form the registry
/// stores.
pub(crate) fn boxed_process<F, Fut>(f: F) -> Arc<ProcessFn>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Option<Response>> + Send + 'static,
{
    Arc::new(move |req| f(req).boxed())
}

/// Matcher for a literal path under one method.
pub(crate) fn literal_matcher(
    method: Method,
    path: String,
    kind: RequestKind,
) -> Box<MatchFn> {
    Box::new(move |head| {
        if head.method == method && head.path == path {
            kind.build(head)
        } else {
            None
        }
    })
}

/// Matcher for a path regex under one method; capture groups are
/// stored in the request attribute bag under [`REGEX_CAPTURES`].
pub(crate) fn regex_matcher(
    method: Method,
    pattern: Regex,
    kind: RequestKind,
) -> Box<MatchFn> {
    Box::new(move |head| {
        if head.method != method {
            return None;
        }
        let caps = pattern.captures(&head.path)?;
        let mut req = kind.build(head)?;
        let groups: Vec<String> = caps
            .iter()
            .skip(1)
            .map(|c| c.map_or(String::new(), |m| m.as_str().to_string()))
            .collect();
        req.set_attribute(REGEX_CAPTURES, AttrValue::List(groups));
        Some(req)
    })
}

/// Matcher claiming every request of one method.
pub(crate) fn method_matcher(method: Method, kind: RequestKind) -> Box<MatchFn> {
    Box::new(move |head| {
        if head.method == method {
            kind.build(head)
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::HeaderMap;
    use std::collections::HashMap;
    use url::Url;

    fn head(method: Method, path: &str) -> RequestHead {
        RequestHead {
            method,
            url: Url::parse(&format!("http://localhost{path}")).unwrap(),
            path: path.to_string(),
            query: HashMap::new(),
            headers: HeaderMap::new(),
            http10: false,
            local_addr: "127.0.0.1:80".parse().unwrap(),
            remote_addr: "127.0.0.1:9000".parse().unwrap(),
        }
    }

    fn tagged_process(tag: &'static str) -> Arc<ProcessFn> {
        boxed_process(move |_req| async move {
            Some(Response::with_data(tag, "text/plain"))
        })
    }

    async fn matched_tag(reg: &HandlerRegistry, head: &RequestHead) -> Option<String> {
        let (req, process) = reg.find(head)?;
        let mut resp = process(req).await?;
        resp.body_mut().open().await.ok()?;
        let chunk = resp.body_mut().read_chunk().await.ok()?;
        Some(String::from_utf8(chunk.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn lifo_matching() {
        let mut reg = HandlerRegistry::new();
        reg.add(
            literal_matcher(Method::GET, "/a".into(), RequestKind::Discard),
            tagged_process("first"),
            None,
        );
        reg.add(
            literal_matcher(Method::GET, "/a".into(), RequestKind::Discard),
            tagged_process("second"),
            None,
        );
        let tag = matched_tag(&reg, &head(Method::GET, "/a")).await;
        assert_eq!(tag.as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn unrelated_registration_order_is_irrelevant() {
        for flipped in [false, true] {
            let mut reg = HandlerRegistry::new();
            let mut adds: Vec<(&str, &str)> = vec![("/a", "a"), ("/b", "b")];
            if flipped {
                adds.reverse();
            }
            for (path, tag) in adds {
                let tag: &'static str = if tag == "a" { "a" } else { "b" };
                reg.add(
                    literal_matcher(Method::GET, path.into(), RequestKind::Discard),
                    tagged_process(tag),
                    None,
                );
            }
            let tag = matched_tag(&reg, &head(Method::GET, "/a")).await;
            assert_eq!(tag.as_deref(), Some("a"));
        }
    }

    #[test]
    fn no_match_status_picks_405_or_501() {
        let mut reg = HandlerRegistry::new();
        reg.add(
            literal_matcher(Method::GET, "/known".into(), RequestKind::Discard),
            tagged_process("x"),
            Some(Route {
                method: Method::GET,
                pattern: RoutePattern::Literal("/known".into()),
            }),
        );
        assert_eq!(
            reg.no_match_status(&head(Method::DELETE, "/known")),
            StatusCode::METHOD_NOT_ALLOWED
        );
        assert_eq!(
            reg.no_match_status(&head(Method::GET, "/other")),
            StatusCode::NOT_IMPLEMENTED
        );
    }

    #[test]
    fn regex_captures_stored() {
        let matcher = regex_matcher(
            Method::GET,
            Regex::new(r"^/files/(\d+)/(.*)$").unwrap(),
            RequestKind::Discard,
        );
        let req = matcher(&head(Method::GET, "/files/42/readme.txt")).unwrap();
        assert_eq!(
            req.regex_captures().unwrap(),
            ["42".to_string(), "readme.txt".to_string()]
        );
        assert!(matcher(&head(Method::GET, "/other")).is_none());
    }
}
