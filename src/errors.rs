use std::error::Error;
use std::fmt;
use std::io;

use http::StatusCode;

/// Error type used throughout the crate.
///
/// Every variant maps to an HTTP status code. Variants that indicate a
/// broken connection (I/O failure, unrecoverable protocol state) also
/// force the connection to be closed after the error response, if an
/// error response can still be written at all.
#[derive(Debug)]
pub enum HttpError {
    /// Reply with this status, connection stays usable.
    Status(StatusCode),
    /// Reply with this status, then close the connection.
    StatusClose(StatusCode),
    /// Reply with this status and an HTML body carrying the message.
    Message(StatusCode, String),
    /// I/O error on the socket or the filesystem.
    Io(io::Error),
    /// Failure while generating an XML body.
    Xml(xml::writer::Error),
    /// Request or header bytes that are not valid UTF-8.
    Utf8(std::str::Utf8Error),
}

/// Result alias used throughout the crate.
pub type HttpResult<T> = Result<T, HttpError>;

impl HttpError {
    /// The status code to send for this error. Filesystem errors map
    /// to 404/403 where they do so cleanly, 500 otherwise.
    pub fn statuscode(&self) -> StatusCode {
        match self {
            HttpError::Status(code) => *code,
            HttpError::StatusClose(code) => *code,
            HttpError::Message(code, _) => *code,
            HttpError::Io(e) => match e.kind() {
                io::ErrorKind::NotFound => StatusCode::NOT_FOUND,
                io::ErrorKind::PermissionDenied => StatusCode::FORBIDDEN,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            HttpError::Xml(_) => StatusCode::INTERNAL_SERVER_ERROR,
            HttpError::Utf8(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// Whether the connection must be closed after the response.
    pub fn must_close(&self) -> bool {
        !matches!(self, HttpError::Status(_) | HttpError::Message(..))
    }

    /// Human readable message for the HTML error body.
    pub fn message(&self) -> String {
        match self {
            HttpError::Status(code) | HttpError::StatusClose(code) => code
                .canonical_reason()
                .unwrap_or("unknown status")
                .to_string(),
            HttpError::Message(_, msg) => msg.clone(),
            HttpError::Io(e) => format!("i/o error: {e}"),
            HttpError::Xml(e) => format!("xml error: {e}"),
            HttpError::Utf8(e) => format!("invalid utf-8: {e}"),
        }
    }
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HttpError::Status(code) => write!(f, "{code}"),
            HttpError::StatusClose(code) => write!(f, "{code} (close)"),
            HttpError::Message(code, msg) => write!(f, "{code}: {msg}"),
            HttpError::Io(e) => write!(f, "io: {e}"),
            HttpError::Xml(e) => write!(f, "xml: {e}"),
            HttpError::Utf8(e) => write!(f, "utf8: {e}"),
        }
    }
}

impl Error for HttpError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            HttpError::Io(e) => Some(e),
            HttpError::Xml(e) => Some(e),
            HttpError::Utf8(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StatusCode> for HttpError {
    fn from(code: StatusCode) -> Self {
        HttpError::Status(code)
    }
}

impl From<io::Error> for HttpError {
    fn from(e: io::Error) -> Self {
        HttpError::Io(e)
    }
}

impl From<xml::writer::Error> for HttpError {
    fn from(e: xml::writer::Error) -> Self {
        HttpError::Xml(e)
    }
}

impl From<std::str::Utf8Error> for HttpError {
    fn from(e: std::str::Utf8Error) -> Self {
        HttpError::Utf8(e)
    }
}

impl From<HttpError> for io::Error {
    fn from(e: HttpError) -> Self {
        match e {
            HttpError::Io(e) => e,
            other => io::Error::new(io::ErrorKind::Other, other.to_string()),
        }
    }
}
