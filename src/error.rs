//! Error classification shared by the ingestion and gateway paths

use std::fmt;

/// Category of a failure, used for logging and for picking the client-visible
/// response on the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed structural input (bad topic, bad device id, empty record set)
    Validation,
    /// Bad signature, expired credential or wrong claim shape
    Authentication,
    /// Authenticated principal acting outside its resource
    Authorization,
    /// Cache failure, never fatal
    Cache,
    /// Malformed message body
    Parsing,
    /// Transport failure scoped to one connection or one publish
    Connection,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Authentication => "authentication",
            ErrorKind::Authorization => "authorization",
            ErrorKind::Cache => "cache",
            ErrorKind::Parsing => "parsing",
            ErrorKind::Connection => "connection",
        };
        write!(f, "{}", s)
    }
}
