//! Error handling for tree expansion, serialization and blob access
use std::fmt::Write as _;

/// A result type for tree operations, which can be either a successful value or an error.
pub type XmlResult<T> = std::result::Result<T, XmlError>;

/// An error raised by the tree, its builder, a blob or a SOAP envelope.
#[derive(Debug)]
pub struct XmlError {
    /// The context of the error
    pub context: Box<ErrorContext>,

    /// The kind of error that occurred
    pub kind: XmlErrorKind,
}
impl XmlError {
    /// Creates a new `XmlError`
    #[must_use]
    pub fn new(kind: XmlErrorKind, context: ErrorContext) -> Self {
        Self {
            context: Box::new(context),
            kind,
        }
    }

    /// Creates a new `XmlError` with an empty context.
    #[must_use]
    pub fn bare(kind: XmlErrorKind) -> Self {
        Self::new(kind, ErrorContext::default())
    }

    /// Returns the SOAP fault code carried by the error, if it is a SOAP processing error.
    #[must_use]
    pub fn fault_code(&self) -> Option<&str> {
        match &self.kind {
            XmlErrorKind::SoapProcessing { fault_code, .. } => Some(fault_code),
            _ => None,
        }
    }
}
impl std::fmt::Display for XmlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.context)?;

        for line in self.kind.to_string().lines() {
            writeln!(f, "= {line}")?;
        }
        Ok(())
    }
}
impl std::error::Error for XmlError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            XmlErrorKind::Io(e) => Some(e),
            _ => None,
        }
    }
}
impl From<XmlErrorKind> for XmlError {
    fn from(kind: XmlErrorKind) -> Self {
        Self::bare(kind)
    }
}
impl From<std::io::Error> for XmlError {
    fn from(err: std::io::Error) -> Self {
        Self::bare(XmlErrorKind::Io(err))
    }
}

/// The kind of error that occurred.
#[derive(Debug, thiserror::Error)]
pub enum XmlErrorKind {
    /// The token source produced a structurally invalid sequence.
    /// Fatal for the document; the affected container stays incomplete.
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    /// A blob was used outside of its phase
    #[error("Lifecycle violation: {0}")]
    LifecycleViolation(String),

    /// The builder was asked to expand a container that is not its current target
    #[error("Container is not the current expansion target of the builder")]
    OutOfOrderExpansion,

    /// A node was inserted or referenced across containers or documents
    #[error("Foreign node: {0}")]
    ForeignNode(String),

    /// A SOAP structural rule was violated
    #[error("SOAP processing error [{fault_code}]: {message}")]
    SoapProcessing {
        /// Human readable description
        message: String,

        /// The SOAP fault code to report to the peer
        fault_code: String,
    },

    /// Navigation was attempted after the token source was closed
    #[error("The token source for this document has been closed")]
    SourceClosed,

    /// The subtree was already streamed to a writer and cannot be traversed again
    #[error("Subtree has already been consumed by a pass-through serialization")]
    AlreadyConsumed,

    /// Text could not be encoded or decoded
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// IO error occurred while reading or writing
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Context describing where the builder was when the error occurred.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    /// Number of tokens consumed from the source so far.
    pub tokens: usize,

    /// Qualified name of the innermost open element, if any.
    pub element: Option<String>,
}
impl ErrorContext {
    /// Creates a new `ErrorContext` for the given token count and open element.
    #[must_use]
    pub fn new(tokens: usize, element: Option<String>) -> Self {
        Self { tokens, element }
    }
}
impl std::fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.tokens == 0 && self.element.is_none() {
            return Ok(());
        }

        let mut line = String::from("= At");
        if self.tokens > 0 {
            write!(line, " token {}", self.tokens)?;
        }
        if let Some(element) = &self.element {
            write!(line, " inside <{element}>")?;
        }
        writeln!(f, "{line}")
    }
}

/// Shorthand for returning an error from a function.
///
/// - `bail!(Kind)` returns the kind with an empty context
/// - `bail!(ctx, Kind)` returns the kind with the given context
/// - `bail!(msg = "...", args)` returns a `MalformedInput` with a formatted message
macro_rules! bail {
    (msg = $($arg:tt)+) => {
        return Err($crate::error::XmlError::bare(
            $crate::error::XmlErrorKind::MalformedInput(format!($($arg)+)),
        ))
    };
    ($ctx:expr, $kind:expr) => {
        return Err($crate::error::XmlError::new($kind, $ctx))
    };
    ($kind:expr) => {
        return Err($crate::error::XmlError::bare($kind))
    };
}
pub(crate) use bail;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_with_context() {
        let err = XmlError::new(
            XmlErrorKind::MalformedInput("end tag without start tag".into()),
            ErrorContext::new(12, Some("soapenv:Body".into())),
        );

        let text = err.to_string();
        assert!(text.contains("= At token 12 inside <soapenv:Body>"));
        assert!(text.contains("= Malformed input: end tag without start tag"));
    }

    #[test]
    fn test_display_without_context() {
        let err = XmlError::bare(XmlErrorKind::SourceClosed);
        assert_eq!(
            err.to_string(),
            "= The token source for this document has been closed\n"
        );
    }

    #[test]
    fn test_fault_code() {
        let err = XmlError::bare(XmlErrorKind::SoapProcessing {
            message: "bad child".into(),
            fault_code: "soapenv:Sender".into(),
        });
        assert_eq!(err.fault_code(), Some("soapenv:Sender"));
        assert_eq!(XmlError::bare(XmlErrorKind::AlreadyConsumed).fault_code(), None);
    }
}
