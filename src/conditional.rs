//! HTTP/1.1 conditional requests (RFC 7232), reduced to the fast path
//! the connection engine needs: decide whether a response can be
//! replaced by a 304 before any body bytes are produced.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::response::Response;

// SystemTime has nanosecond precision. Round it down to the
// nearest second, because an HttpDate has second precision.
fn round_time(tm: impl Into<SystemTime>) -> SystemTime {
    let tm = tm.into();
    match tm.duration_since(UNIX_EPOCH) {
        Ok(d) => UNIX_EPOCH + Duration::from_secs(d.as_secs()),
        Err(_) => tm,
    }
}

/// True when the request's validators match the response's, i.e. the
/// client's copy is current and a 304 should be substituted.
pub(crate) fn not_modified(
    if_none_match: Option<&str>,
    if_modified_since: Option<SystemTime>,
    resp: &Response,
) -> bool {
    // If-None-Match takes precedence over If-Modified-Since.
    if let Some(inm) = if_none_match {
        if let Some(etag) = resp.etag() {
            return inm == "*" || inm.split(',').map(str::trim).any(|t| t == etag);
        }
        return false;
    }
    if let (Some(ims), Some(modified)) = (if_modified_since, resp.last_modified()) {
        return round_time(modified) <= round_time(ims);
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;

    #[test]
    fn etag_match() {
        let mut resp = Response::new(StatusCode::OK);
        resp.set_etag("\"abc\"");
        assert!(not_modified(Some("\"abc\""), None, &resp));
        assert!(not_modified(Some("*"), None, &resp));
        assert!(not_modified(Some("\"x\", \"abc\""), None, &resp));
        assert!(!not_modified(Some("\"zzz\""), None, &resp));
        assert!(!not_modified(None, None, &resp));
    }

    #[test]
    fn modified_since_rounds_to_seconds() {
        let t = UNIX_EPOCH + Duration::from_secs(1_000_000);
        let mut resp = Response::new(StatusCode::OK);
        resp.set_last_modified(t + Duration::from_millis(300));
        assert!(not_modified(None, Some(t), &resp));

        resp.set_last_modified(t + Duration::from_secs(5));
        assert!(!not_modified(None, Some(t), &resp));
    }

    #[test]
    fn etag_takes_precedence() {
        let t = UNIX_EPOCH + Duration::from_secs(1_000_000);
        let mut resp = Response::new(StatusCode::OK);
        resp.set_etag("\"abc\"");
        resp.set_last_modified(t);
        // A stale etag wins over a matching date.
        assert!(!not_modified(Some("\"old\""), Some(t), &resp));
    }
}
