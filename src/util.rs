use std::io::{Cursor, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use bitflags::bitflags;
use bytes::Bytes;
use headers::Header;
use time::format_description::well_known::Rfc3339;
use time::macros::offset;

bitflags! {
    /// A set of HTTP/WebDAV methods.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MethodSet: u32 {
        const HEAD = 0x0001;
        const GET = 0x0002;
        const POST = 0x0004;
        const PUT = 0x0008;
        const DELETE = 0x0010;
        const OPTIONS = 0x0020;
        const MKCOL = 0x0040;
        const COPY = 0x0080;
        const MOVE = 0x0100;
        const PROPFIND = 0x0200;

        const HTTP_RO = Self::HEAD.bits() | Self::GET.bits() | Self::OPTIONS.bits();
        const WEBDAV_RO = Self::HTTP_RO.bits() | Self::PROPFIND.bits();
        const WEBDAV_RW = Self::WEBDAV_RO.bits()
            | Self::PUT.bits()
            | Self::DELETE.bits()
            | Self::MKCOL.bits()
            | Self::COPY.bits()
            | Self::MOVE.bits();
    }
}

impl MethodSet {
    /// The bit for a single method, `None` for methods outside the set
    /// this server knows about.
    pub fn from_method(m: &http::Method) -> Option<MethodSet> {
        let bit = match *m {
            http::Method::HEAD => MethodSet::HEAD,
            http::Method::GET => MethodSet::GET,
            http::Method::POST => MethodSet::POST,
            http::Method::PUT => MethodSet::PUT,
            http::Method::DELETE => MethodSet::DELETE,
            http::Method::OPTIONS => MethodSet::OPTIONS,
            _ => match m.as_str() {
                "MKCOL" => MethodSet::MKCOL,
                "COPY" => MethodSet::COPY,
                "MOVE" => MethodSet::MOVE,
                "PROPFIND" => MethodSet::PROPFIND,
                _ => return None,
            },
        };
        Some(bit)
    }

    /// The names of the methods in this set, in a fixed order, for
    /// `Allow:` headers.
    pub fn names(&self) -> Vec<&'static str> {
        const ORDER: [(MethodSet, &str); 10] = [
            (MethodSet::OPTIONS, "OPTIONS"),
            (MethodSet::GET, "GET"),
            (MethodSet::HEAD, "HEAD"),
            (MethodSet::POST, "POST"),
            (MethodSet::PUT, "PUT"),
            (MethodSet::DELETE, "DELETE"),
            (MethodSet::MKCOL, "MKCOL"),
            (MethodSet::COPY, "COPY"),
            (MethodSet::MOVE, "MOVE"),
            (MethodSet::PROPFIND, "PROPFIND"),
        ];
        ORDER
            .iter()
            .filter(|(bit, _)| self.contains(*bit))
            .map(|(_, name)| *name)
            .collect()
    }
}

pub(crate) fn systemtime_to_offsetdatetime(t: SystemTime) -> time::OffsetDateTime {
    match t.duration_since(UNIX_EPOCH) {
        Ok(t) => {
            let tm = time::OffsetDateTime::from_unix_timestamp(t.as_secs() as i64)
                .unwrap_or(time::OffsetDateTime::UNIX_EPOCH);
            tm.to_offset(offset!(UTC))
        }
        Err(_) => time::OffsetDateTime::UNIX_EPOCH.to_offset(offset!(UTC)),
    }
}

/// Format a timestamp as an IMF-fixdate (RFC 7231), e.g.
/// `Thu, 01 Jan 1970 00:00:00 GMT`.
pub(crate) fn systemtime_to_httpdate(t: SystemTime) -> String {
    let d = headers::Date::from(t);
    let mut v = Vec::new();
    d.encode(&mut v);
    v[0].to_str().unwrap_or_default().to_owned()
}

/// Format a timestamp as RFC 3339, e.g. `1996-12-19T16:39:57Z`.
/// Used for the DAV `creationdate` property.
pub(crate) fn systemtime_to_rfc3339(t: SystemTime) -> String {
    systemtime_to_offsetdatetime(t)
        .format(&Rfc3339)
        .unwrap_or_default()
}

// A buffer that implements "Write".
#[derive(Clone)]
pub(crate) struct MemBuffer(Cursor<Vec<u8>>);

impl MemBuffer {
    pub fn new() -> MemBuffer {
        MemBuffer(Cursor::new(Vec::new()))
    }

    pub fn take(&mut self) -> Bytes {
        let buf = std::mem::take(self.0.get_mut());
        self.0.set_position(0);
        Bytes::from(buf)
    }
}

impl Write for MemBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::UNIX_EPOCH;

    #[test]
    fn test_rfc3339() {
        assert!(systemtime_to_rfc3339(UNIX_EPOCH) == "1970-01-01T00:00:00Z");
    }

    #[test]
    fn test_httpdate() {
        assert_eq!(
            systemtime_to_httpdate(UNIX_EPOCH),
            "Thu, 01 Jan 1970 00:00:00 GMT"
        );
    }

    #[test]
    fn test_method_names() {
        let set = MethodSet::GET | MethodSet::PROPFIND | MethodSet::OPTIONS;
        assert_eq!(set.names(), vec!["OPTIONS", "GET", "PROPFIND"]);
        assert_eq!(
            MethodSet::from_method(&http::Method::from_bytes(b"PROPFIND").unwrap()),
            Some(MethodSet::PROPFIND)
        );
        assert_eq!(MethodSet::from_method(&http::Method::PATCH), None);
    }
}
