//! The types of nodes and related data that can appear in a document tree.
mod name;
pub use name::*;

mod attribute;
pub use attribute::Attribute;
pub(crate) use attribute::AttributeMap;

mod text;
pub use text::*;

mod pi;
pub use pi::*;

/// The node variants of the information model.
///
/// Attributes and namespace declarations are owned by an element and never
/// appear in the child chain; they are listed here so callers can talk about
/// every variant with a single type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeType {
    /// The document container
    Document,

    /// An element container
    Element,

    /// Character or binary text
    Text,

    /// A comment
    Comment,

    /// A processing instruction
    ProcessingInstruction,

    /// An attribute of an element
    Attribute,

    /// A namespace declaration of an element
    NamespaceDeclaration,
}

/// How far the builder has gotten with a container.
///
/// The serializer picks its mode purely from this state: only an `Untouched`
/// element can be streamed straight from the token source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Expansion {
    /// Created by the builder from a start tag; nothing inside it was read or modified
    Untouched,

    /// Some children are materialized, more may still arrive
    PartiallyExpanded,

    /// The child sequence is final
    Complete,

    /// The content was streamed to a writer and is gone
    Consumed,
}
impl Expansion {
    /// True for `Complete`
    #[must_use]
    pub fn is_complete(self) -> bool {
        self == Self::Complete
    }
}

/// The payload of a node in the tree.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    /// The document container
    Document,

    /// An element: `<name attr="value">...</name>`
    Element(Element),

    /// A text node
    Text(TextContent),

    /// A comment node
    Comment(String),

    /// A processing instruction node
    ProcessingInstruction(ProcessingInstruction),
}
impl NodeKind {
    /// Returns the variant of this node.
    #[must_use]
    pub fn node_type(&self) -> NodeType {
        match self {
            Self::Document => NodeType::Document,
            Self::Element(_) => NodeType::Element,
            Self::Text(_) => NodeType::Text,
            Self::Comment(_) => NodeType::Comment,
            Self::ProcessingInstruction(_) => NodeType::ProcessingInstruction,
        }
    }

    /// True for documents and elements.
    #[must_use]
    pub fn is_container(&self) -> bool {
        matches!(self, Self::Document | Self::Element(_))
    }

    /// Returns the element data, if this is an element.
    #[must_use]
    pub fn as_element(&self) -> Option<&Element> {
        match self {
            Self::Element(element) => Some(element),
            _ => None,
        }
    }

    pub(crate) fn as_element_mut(&mut self) -> Option<&mut Element> {
        match self {
            Self::Element(element) => Some(element),
            _ => None,
        }
    }
}

/// Element data: the name, attributes and namespace declarations.
///
/// Attributes are kept in insertion order and keyed by (namespace, local name);
/// namespace declarations are keyed by prefix.
#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    name: QName,
    attributes: AttributeMap,
    namespaces: Vec<Namespace>,
}
impl Element {
    /// Create an element with no attributes.
    pub fn new(name: impl Into<QName>) -> Self {
        Self {
            name: name.into(),
            attributes: AttributeMap::default(),
            namespaces: vec![],
        }
    }

    pub(crate) fn with_content(
        name: QName,
        attributes: Vec<Attribute>,
        namespaces: Vec<Namespace>,
    ) -> Self {
        let mut element = Self::new(name);
        for attribute in attributes {
            element.attributes.set(attribute);
        }
        for namespace in namespaces {
            element.declare_namespace(namespace);
        }
        element
    }

    /// Returns the name of the element.
    #[must_use]
    pub fn name(&self) -> &QName {
        &self.name
    }

    /// Get an attribute by namespace and local name.
    #[must_use]
    pub fn attribute(&self, namespace: Option<&str>, local: &str) -> Option<&Attribute> {
        self.attributes.get(namespace, local)
    }

    /// Get the attributes of the element, in insertion order.
    #[must_use]
    pub fn attributes(&self) -> &[Attribute] {
        self.attributes.as_slice()
    }

    /// Get the namespace declarations of the element, in insertion order.
    #[must_use]
    pub fn namespaces(&self) -> &[Namespace] {
        &self.namespaces
    }

    /// Returns the URI bound to `prefix` by this element's own declarations.
    #[must_use]
    pub fn declared_namespace(&self, prefix: Option<&str>) -> Option<&str> {
        self.namespaces
            .iter()
            .find(|ns| ns.prefix() == prefix)
            .map(Namespace::uri)
    }

    pub(crate) fn set_attribute(&mut self, attribute: Attribute) -> Option<String> {
        self.attributes.set(attribute)
    }

    pub(crate) fn remove_attribute(
        &mut self,
        namespace: Option<&str>,
        local: &str,
    ) -> Option<Attribute> {
        self.attributes.remove(namespace, local)
    }

    /// Adds or replaces the declaration for the namespace's prefix.
    pub(crate) fn declare_namespace(&mut self, namespace: Namespace) {
        match self
            .namespaces
            .iter_mut()
            .find(|ns| ns.prefix() == namespace.prefix())
        {
            Some(existing) => *existing = namespace,
            None => self.namespaces.push(namespace),
        }
    }
}
