//! A deferred XML tree.
//!
//! A [`Document`] is built from a pull-style [`TokenSource`] only as far as navigation
//! requires. Untouched subtrees can be written straight from the source to an
//! [`XmlWriter`] without ever being materialized, or built into the tree first so
//! they stay traversable.
//!
//! On top of the tree:
//! - [`Blob`] stores large binary content in fixed-size chunks
//! - [`StreamWriter`] writes XML text, optionally moving binary content out of band
//!   as XOP attachments
//! - [`soap::SoapMessage`] enforces the structure of SOAP 1.1 and 1.2 envelopes
//!
//! # Example
//! ```rust
//! use lazy_xmltree::Document;
//!
//! let mut doc = Document::parse_str("<list><item>a</item><item>b</item></list>");
//! let list = doc.document_element().unwrap().unwrap();
//! let first = doc.first_element_child(list).unwrap().unwrap();
//! assert_eq!(doc.text_content(first).unwrap(), "a");
//!
//! // The second item was never built; it is streamed from the source
//! let xml = doc.to_xml_string(false).unwrap();
//! assert_eq!(xml, "<list><item>a</item><item>b</item></list>");
//! ```
#![warn(missing_docs)]

mod error;
pub use error::{ErrorContext, XmlError, XmlErrorKind, XmlResult};

mod blob;
pub use blob::{Blob, BlobPhase, BlobReader, DEFAULT_CHUNK_SIZE};

mod node;
pub use node::*;

mod arena;
pub use arena::NodeId;

mod token;
pub use token::{Token, TokenSource, VecTokenSource};

mod reader;
pub use reader::{ReaderOptions, XML_NAMESPACE, XmlReader};

mod builder;
pub use builder::BuilderOptions;

mod document;
pub use document::{ChildPolicy, Document, Placement, Position, Relation, TreeView};

mod writer;
pub use writer::{StreamWriter, TokenCollector, WriterOptions, XOP_NAMESPACE, XmlWriter};

pub mod serializer;

pub mod soap;
