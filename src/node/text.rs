use crate::Blob;
use std::sync::Arc;

/// The content of a text node.
///
/// Binary content is never inlined; the node keeps a reference to the committed
/// [`Blob`] together with the content identifier it travels under.
#[derive(Debug, Clone, PartialEq)]
pub enum TextContent {
    /// Character data
    Characters(String),

    /// An attachment reference
    Binary {
        /// Content identifier of the attachment, without the `cid:` scheme
        content_id: String,

        /// The attachment bytes
        blob: Arc<Blob>,
    },
}
impl TextContent {
    /// Returns the character data, or `None` for binary content.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Characters(text) => Some(text),
            Self::Binary { .. } => None,
        }
    }

    /// Returns true if this text carries an attachment.
    #[must_use]
    pub fn is_binary(&self) -> bool {
        matches!(self, Self::Binary { .. })
    }

    /// Returns the blob and content id for binary content.
    #[must_use]
    pub fn binary(&self) -> Option<(&str, &Arc<Blob>)> {
        match self {
            Self::Binary { content_id, blob } => Some((content_id, blob)),
            Self::Characters(_) => None,
        }
    }
}
