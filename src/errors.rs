//! Error handling for the gateway

use std::error;
use std::fmt;
use std::io;
use std::time::Duration;

/// A Result for internal operations.
pub type Result<T> = ::std::result::Result<T, Error>;

/// All errors which might arise within the application
#[derive(Debug)]
pub enum Error {
    Parse(httparse::Error),
    Io(io::Error),
    RequestIncomplete,
    PathNotInOriginForm,
    IllegalPercentEncoding,
    BodyTooLarge,
    LengthRequired,
    NotFound,
    PermissionDenied,
    /// Routing metadata needed to build the CGI environment is missing
    Configuration(String),
    /// The handler could not be started at all
    Launch(io::Error),
    /// The handler ran past its wall-clock budget and was killed
    HandlerTimeout(Duration),
    /// The handler wrote more than the configured limit to a stream
    OutputLimit(&'static str),
    /// No header/body separator within the scan limit
    MalformedResponse,
    /// An uploaded filename tried to leave the upload directory
    UnsafePath(String),
}

impl Error {
    /// The HTTP status the client sees when a request fails with this error
    pub fn status_code(&self) -> u16 {
        match *self {
            Error::Parse(_)
            | Error::RequestIncomplete
            | Error::PathNotInOriginForm
            | Error::IllegalPercentEncoding
            | Error::UnsafePath(_) => 400,
            Error::PermissionDenied => 403,
            Error::NotFound => 404,
            Error::LengthRequired => 411,
            Error::BodyTooLarge => 413,
            Error::MalformedResponse | Error::OutputLimit(_) => 502,
            Error::HandlerTimeout(_) => 504,
            Error::Io(_) | Error::Configuration(_) | Error::Launch(_) => 500,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::Parse(ref e) => write!(f, "malformed request: {}", e),
            Error::Io(ref e) => write!(f, "I/O error: {}", e),
            Error::RequestIncomplete => f.write_str("request ended before its headers"),
            Error::PathNotInOriginForm => f.write_str("request path is not in origin form"),
            Error::IllegalPercentEncoding => f.write_str("illegal percent-encoding in request path"),
            Error::BodyTooLarge => f.write_str("request body exceeds the configured limit"),
            Error::LengthRequired => f.write_str("request body without a Content-Length"),
            Error::NotFound => f.write_str("no such script"),
            Error::PermissionDenied => f.write_str("permission denied"),
            Error::Configuration(ref what) => write!(f, "configuration error: {}", what),
            Error::Launch(ref e) => write!(f, "could not launch handler: {}", e),
            Error::HandlerTimeout(limit) => write!(f, "handler timed out after {:?}", limit),
            Error::OutputLimit(stream) => write!(f, "handler {} exceeded its size limit", stream),
            Error::MalformedResponse => f.write_str("handler output has no header/body separator"),
            Error::UnsafePath(ref why) => write!(f, "unsafe upload path: {}", why),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match *self {
            Error::Parse(ref e) => Some(e),
            Error::Io(ref e) | Error::Launch(ref e) => Some(e),
            _ => None,
        }
    }
}

impl From<httparse::Error> for Error {
    fn from(e: httparse::Error) -> Error {
        Error::Parse(e)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        Error::Io(e)
    }
}

#[test]
fn adapter_errors_map_to_gateway_statuses() {
    assert_eq!(Error::HandlerTimeout(Duration::from_secs(1)).status_code(), 504);
    assert_eq!(Error::MalformedResponse.status_code(), 502);
    assert_eq!(Error::Configuration(String::from("no script")).status_code(), 500);
    assert_eq!(Error::UnsafePath(String::from("..")).status_code(), 400);
}
