//! Transport fault taxonomy.

use std::fmt;
use std::io;
use std::sync::Arc;

/// A fault on the underlying byte stream, distinct from anything the
/// protocols running on top of it may signal.
///
/// Cloneable so that one backend failure can be reported to every task
/// blocked on the same connection.
#[derive(Clone, Debug)]
pub enum TransportError {
    /// The stream ended cleanly between frames.
    Eof,
    /// The stream ended in the middle of a frame.
    Truncated,
    /// A frame failed its integrity check or could not be parsed.
    Corrupted,
    /// Any other I/O failure.
    Io(Arc<io::Error>),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Eof => f.write_str("end of stream"),
            TransportError::Truncated => f.write_str("stream truncated mid-frame"),
            TransportError::Corrupted => f.write_str("corrupted frame"),
            TransportError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransportError::Io(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            TransportError::Truncated
        } else {
            TransportError::Io(Arc::new(e))
        }
    }
}
