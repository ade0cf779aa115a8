//! Structural XML events and the pull-style source that produces them.
use crate::{
    error::{XmlErrorKind, XmlResult, bail},
    node::{Attribute, Namespace, QName},
};
use std::collections::VecDeque;

/// One structural event of an XML document.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// Start of the document
    StartDocument,

    /// End of the document
    EndDocument,

    /// A start tag with its attributes and namespace declarations
    StartElement {
        /// The resolved element name
        name: QName,

        /// Attributes, excluding namespace declarations
        attributes: Vec<Attribute>,

        /// Namespace declarations made on this element
        namespaces: Vec<Namespace>,
    },

    /// An end tag
    EndElement,

    /// Character data
    Characters(String),

    /// A piece of attachment content.
    /// Consecutive chunks with the same content id belong to one attachment.
    BinaryChunk {
        /// Content identifier, without the `cid:` scheme
        content_id: String,

        /// The bytes of this chunk
        bytes: Vec<u8>,
    },

    /// A comment
    Comment(String),

    /// A processing instruction
    ProcessingInstruction {
        /// Target of the instruction
        target: String,

        /// Data of the instruction
        data: Option<String>,
    },
}
impl Token {
    /// Create a start-element token with no attributes.
    pub fn start(name: impl Into<QName>) -> Self {
        Self::StartElement {
            name: name.into(),
            attributes: vec![],
            namespaces: vec![],
        }
    }

    /// Create a character data token.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Characters(text.into())
    }

    /// A short name for the token kind, for diagnostics.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::StartDocument => "start of document",
            Self::EndDocument => "end of document",
            Self::StartElement { .. } => "start tag",
            Self::EndElement => "end tag",
            Self::Characters(_) => "character data",
            Self::BinaryChunk { .. } => "binary chunk",
            Self::Comment(_) => "comment",
            Self::ProcessingInstruction { .. } => "processing instruction",
        }
    }
}

/// A pull-style producer of [`Token`]s, consumed strictly in order.
pub trait TokenSource {
    /// Returns the next token, or `None` once the input is exhausted.
    ///
    /// # Errors
    /// Returns an error if the input cannot be read or tokenized,
    /// or `SourceClosed` after [`TokenSource::close`].
    fn next_token(&mut self) -> XmlResult<Option<Token>>;

    /// Releases the underlying input. Later calls to `next_token` fail with `SourceClosed`.
    fn close(&mut self);

    /// The qualified name of the first element inside a SOAP Body, if the source
    /// can tell without consuming tokens. This is a performance hint only.
    fn body_first_child_hint(&self) -> Option<QName> {
        None
    }
}

/// A token source over an in-memory list of tokens.
///
/// # Example
/// ```rust
/// use lazy_xmltree::{Document, Token, VecTokenSource};
///
/// let source = VecTokenSource::new(vec![
///     Token::StartDocument,
///     Token::start("root"),
///     Token::text("hello"),
///     Token::EndElement,
///     Token::EndDocument,
/// ]);
///
/// let mut doc = Document::from_source(source);
/// let root = doc.document_element().unwrap().unwrap();
/// assert_eq!(doc.text_content(root).unwrap(), "hello");
/// ```
#[derive(Debug, Clone, Default)]
pub struct VecTokenSource {
    tokens: VecDeque<Token>,
    hint: Option<QName>,
    closed: bool,
    consumed: usize,
}
impl VecTokenSource {
    /// Create a source that yields the given tokens in order.
    #[must_use]
    pub fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens: tokens.into(),
            hint: None,
            closed: false,
            consumed: 0,
        }
    }

    /// Sets the value returned by [`TokenSource::body_first_child_hint`].
    #[must_use]
    pub fn with_body_hint(mut self, name: QName) -> Self {
        self.hint = Some(name);
        self
    }

    /// Number of tokens handed out so far.
    #[must_use]
    pub fn consumed(&self) -> usize {
        self.consumed
    }

    /// Number of tokens not handed out yet.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.tokens.len()
    }
}
impl TokenSource for VecTokenSource {
    fn next_token(&mut self) -> XmlResult<Option<Token>> {
        if self.closed {
            bail!(XmlErrorKind::SourceClosed);
        }

        let token = self.tokens.pop_front();
        if token.is_some() {
            self.consumed += 1;
        }
        Ok(token)
    }

    fn close(&mut self) {
        self.closed = true;
        self.tokens.clear();
    }

    fn body_first_child_hint(&self) -> Option<QName> {
        self.hint.clone()
    }
}

impl<T: TokenSource + ?Sized> TokenSource for Box<T> {
    fn next_token(&mut self) -> XmlResult<Option<Token>> {
        (**self).next_token()
    }

    fn close(&mut self) {
        (**self).close();
    }

    fn body_first_child_hint(&self) -> Option<QName> {
        (**self).body_first_child_hint()
    }
}
