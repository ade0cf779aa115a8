use crate::{
    Blob, XmlReader,
    arena::{Arena, NodeData, NodeId},
    builder::{Builder, BuilderOptions},
    error::{XmlErrorKind, XmlResult, bail},
    node::{
        Attribute, Element, Expansion, Namespace, NodeKind, NodeType, ProcessingInstruction,
        QName, TextContent,
    },
    token::TokenSource,
    writer::{StreamWriter, WriterOptions, XmlWriter},
};
use std::sync::Arc;

/// A structural relation between two nodes, used by [`Document::navigate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    /// The first child of a container
    FirstChild,

    /// The last child of a container
    LastChild,

    /// The following sibling
    NextSibling,

    /// The preceding sibling
    PreviousSibling,

    /// The owning container
    Parent,
}

/// Where to insert a node, used by [`Document::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    /// After the existing children of the container
    LastChildOf(NodeId),

    /// Before the existing children of the container
    FirstChildOf(NodeId),

    /// Immediately before `sibling`, which must be a child of `container`
    Before {
        /// The expected parent of `sibling`
        container: NodeId,

        /// The reference node
        sibling: NodeId,
    },

    /// Immediately after `sibling`, which must be a child of `container`
    After {
        /// The expected parent of `sibling`
        container: NodeId,

        /// The reference node
        sibling: NodeId,
    },
}

/// Where an element child goes among the existing children of its container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// After the existing children
    Append,

    /// Immediately before the given existing child
    Before(NodeId),
}

/// Structural rules for element children, consulted whenever an element is added
/// to a container, whether by the builder or by a client.
///
/// The policy only sees what is already materialized; it must never trigger expansion.
/// `requested` is where the caller asked for the child to go: [`Placement::Append`]
/// for the builder and for appends, the resolved reference node otherwise.
pub trait ChildPolicy {
    /// Decide where `child` goes in `parent`, or reject it.
    ///
    /// # Errors
    /// Returns an error if `child` is not allowed in `parent`, or not at the requested
    /// position. The tree is left unchanged.
    fn place(
        &self,
        tree: &TreeView<'_>,
        parent: NodeId,
        child: NodeId,
        requested: Placement,
    ) -> XmlResult<Placement>;
}

/// A read-only view of the materialized part of a tree.
/// None of its accessors ever pull tokens from the source.
pub struct TreeView<'a> {
    arena: &'a Arena,
}
impl<'a> TreeView<'a> {
    pub(crate) fn new(arena: &'a Arena) -> Self {
        Self { arena }
    }

    /// Returns the payload of the node.
    #[must_use]
    pub fn kind(&self, id: NodeId) -> &'a NodeKind {
        self.arena.kind(id)
    }

    /// Returns the element name, if the node is an element.
    #[must_use]
    pub fn name(&self, id: NodeId) -> Option<&'a QName> {
        self.arena.kind(id).as_element().map(Element::name)
    }

    /// Returns the expansion state of the node.
    #[must_use]
    pub fn expansion(&self, id: NodeId) -> Expansion {
        self.arena.expansion(id)
    }

    /// Returns the parent of the node.
    #[must_use]
    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.arena.node(id).parent
    }

    /// Returns the first materialized child.
    #[must_use]
    pub fn first_child(&self, id: NodeId) -> Option<NodeId> {
        self.arena.node(id).first_child
    }

    /// Returns the last materialized child.
    #[must_use]
    pub fn last_child(&self, id: NodeId) -> Option<NodeId> {
        self.arena.node(id).last_child
    }

    /// Returns the next materialized sibling.
    #[must_use]
    pub fn next_sibling(&self, id: NodeId) -> Option<NodeId> {
        self.arena.node(id).next
    }

    /// Returns the previous sibling.
    #[must_use]
    pub fn previous_sibling(&self, id: NodeId) -> Option<NodeId> {
        self.arena.node(id).prev
    }
}

/// An XML document whose tree is materialized on demand.
///
/// A document either lives purely in memory, or is attached to a [`TokenSource`].
/// In the latter case every navigation method may pull tokens from the source to
/// answer the query, which is why they take `&mut self` and return a `Result`.
///
/// Containers (the document and its elements) track their [`Expansion`] state.
/// Once the whole document is complete, or [`Document::close`] is called,
/// the token source is released.
///
/// # Example
/// ```rust
/// use lazy_xmltree::Document;
///
/// let mut doc = Document::parse_str("<order><item>1</item><item>2</item></order>");
/// let order = doc.document_element().unwrap().unwrap();
///
/// // Only the first <item> start tag has been read so far
/// let first = doc.first_element_child(order).unwrap().unwrap();
/// assert!(!doc.is_complete(order).unwrap());
///
/// let second = doc.next_element_sibling(first).unwrap().unwrap();
/// assert_eq!(doc.text_content(second).unwrap(), "2");
/// ```
pub struct Document<'src> {
    arena: Arena,
    root: NodeId,
    builder: Option<Builder<'src>>,
    policy: Option<Box<dyn ChildPolicy + 'src>>,
    closed: bool,
}
impl<'src> Document<'src> {
    /// Creates an empty, complete, in-memory document.
    #[must_use]
    pub fn new() -> Self {
        let mut arena = Arena::new();
        let root = arena.alloc(NodeKind::Document, Expansion::Complete);
        Self {
            arena,
            root,
            builder: None,
            policy: None,
            closed: false,
        }
    }

    /// Creates a document that is built lazily from the given token source.
    pub fn from_source(source: impl TokenSource + 'src) -> Self {
        Self::from_source_with_options(source, BuilderOptions::default())
    }

    /// Creates a document that is built lazily from the given token source.
    pub fn from_source_with_options(
        source: impl TokenSource + 'src,
        options: BuilderOptions,
    ) -> Self {
        let mut arena = Arena::new();
        let root = arena.alloc(NodeKind::Document, Expansion::PartiallyExpanded);
        let builder = Builder::new(Box::new(source), root, options);
        Self {
            arena,
            root,
            builder: Some(builder),
            policy: None,
            closed: false,
        }
    }

    /// Creates a document built lazily from XML text.
    /// Nothing is parsed until the tree is navigated; syntax errors surface then.
    #[must_use]
    pub fn parse_str(src: &'src str) -> Self {
        Self::from_source(XmlReader::new(src))
    }

    /// Installs structural rules for element children.
    pub fn set_policy(&mut self, policy: Box<dyn ChildPolicy + 'src>) {
        self.policy = Some(policy);
    }

    /// Returns the document node.
    #[must_use]
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Returns a read-only view of what has been materialized so far.
    #[must_use]
    pub fn view(&self) -> TreeView<'_> {
        TreeView::new(&self.arena)
    }

    /// Returns true while a token source is attached.
    #[must_use]
    pub fn has_builder(&self) -> bool {
        self.builder.is_some()
    }

    /// Returns true if the document was closed before it was complete.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    //
    // Node data

    /// Returns the payload of a node.
    ///
    /// # Errors
    /// Returns `ForeignNode` if the handle belongs to another document.
    pub fn kind(&self, id: NodeId) -> XmlResult<&NodeKind> {
        Ok(self.arena.kind(self.arena.check(id)?))
    }

    /// Returns the variant of a node.
    ///
    /// # Errors
    /// Returns `ForeignNode` if the handle belongs to another document.
    pub fn node_type(&self, id: NodeId) -> XmlResult<NodeType> {
        Ok(self.kind(id)?.node_type())
    }

    /// Returns the element data of a node, or `None` if it is not an element.
    ///
    /// # Errors
    /// Returns `ForeignNode` if the handle belongs to another document.
    pub fn element(&self, id: NodeId) -> XmlResult<Option<&Element>> {
        Ok(self.kind(id)?.as_element())
    }

    /// Returns the name of an element, or `None` for other nodes.
    ///
    /// # Errors
    /// Returns `ForeignNode` if the handle belongs to another document.
    pub fn name(&self, id: NodeId) -> XmlResult<Option<&QName>> {
        Ok(self.element(id)?.map(Element::name))
    }

    /// Returns the expansion state of a node.
    ///
    /// # Errors
    /// Returns `ForeignNode` if the handle belongs to another document.
    pub fn expansion(&self, id: NodeId) -> XmlResult<Expansion> {
        Ok(self.arena.expansion(self.arena.check(id)?))
    }

    /// Returns true if all children of the node are materialized.
    ///
    /// # Errors
    /// Returns `ForeignNode` if the handle belongs to another document.
    pub fn is_complete(&self, id: NodeId) -> XmlResult<bool> {
        Ok(self.expansion(id)?.is_complete())
    }

    //
    // Factory

    /// Creates a detached element.
    pub fn create_element(&mut self, name: impl Into<QName>) -> NodeId {
        self.arena
            .alloc(NodeKind::Element(Element::new(name)), Expansion::Complete)
    }

    /// Creates a detached text node.
    pub fn create_text(&mut self, text: impl Into<String>) -> NodeId {
        let content = TextContent::Characters(text.into());
        self.arena.alloc(NodeKind::Text(content), Expansion::Complete)
    }

    /// Creates a detached text node carrying an attachment.
    ///
    /// # Errors
    /// Returns a `LifecycleViolation` if the blob is not committed.
    pub fn create_binary_text(
        &mut self,
        content_id: impl Into<String>,
        blob: Arc<Blob>,
    ) -> XmlResult<NodeId> {
        if !blob.is_committed() {
            bail!(XmlErrorKind::LifecycleViolation(
                "binary text requires a committed blob".into()
            ));
        }

        let content = TextContent::Binary {
            content_id: content_id.into(),
            blob,
        };
        Ok(self.arena.alloc(NodeKind::Text(content), Expansion::Complete))
    }

    /// Creates a detached comment.
    pub fn create_comment(&mut self, text: impl Into<String>) -> NodeId {
        self.arena
            .alloc(NodeKind::Comment(text.into()), Expansion::Complete)
    }

    /// Creates a detached processing instruction.
    pub fn create_processing_instruction(
        &mut self,
        target: impl Into<String>,
        data: Option<&str>,
    ) -> NodeId {
        let pi = ProcessingInstruction::new(target, data.map(ToString::to_string));
        self.arena
            .alloc(NodeKind::ProcessingInstruction(pi), Expansion::Complete)
    }

    //
    // Attributes and namespaces

    /// Sets an attribute on an element, returning the previous value.
    ///
    /// # Errors
    /// Returns `ForeignNode` if the node is not an element of this document.
    pub fn set_attribute(
        &mut self,
        element: NodeId,
        attribute: Attribute,
    ) -> XmlResult<Option<String>> {
        Ok(self.element_mut(element)?.set_attribute(attribute))
    }

    /// Removes an attribute from an element.
    ///
    /// # Errors
    /// Returns `ForeignNode` if the node is not an element of this document.
    pub fn remove_attribute(
        &mut self,
        element: NodeId,
        namespace: Option<&str>,
        local: &str,
    ) -> XmlResult<Option<Attribute>> {
        Ok(self.element_mut(element)?.remove_attribute(namespace, local))
    }

    /// Returns the value of an attribute.
    ///
    /// # Errors
    /// Returns `ForeignNode` if the handle belongs to another document.
    pub fn attribute(
        &self,
        element: NodeId,
        namespace: Option<&str>,
        local: &str,
    ) -> XmlResult<Option<&str>> {
        Ok(self
            .element(element)?
            .and_then(|e| e.attribute(namespace, local))
            .map(Attribute::value))
    }

    /// Declares a namespace on an element, replacing a declaration with the same prefix.
    ///
    /// # Errors
    /// Returns `ForeignNode` if the node is not an element of this document.
    pub fn declare_namespace(&mut self, element: NodeId, namespace: Namespace) -> XmlResult<()> {
        self.element_mut(element)?.declare_namespace(namespace);
        Ok(())
    }

    /// Resolves a prefix against the declarations in scope at `node`.
    ///
    /// # Errors
    /// Returns `ForeignNode` if the handle belongs to another document.
    pub fn lookup_namespace(&self, node: NodeId, prefix: Option<&str>) -> XmlResult<Option<&str>> {
        if prefix == Some("xml") {
            return Ok(Some(crate::reader::XML_NAMESPACE));
        }

        let mut current = Some(self.arena.check(node)?);
        while let Some(id) = current {
            if let Some(uri) = self
                .arena
                .kind(id)
                .as_element()
                .and_then(|e| e.declared_namespace(prefix))
            {
                return Ok(Some(uri).filter(|uri| !uri.is_empty()));
            }
            current = self.arena.node(id).parent;
        }
        Ok(None)
    }

    fn element_mut(&mut self, id: NodeId) -> XmlResult<&mut Element> {
        let id = self.arena.check(id)?;
        self.arena.touch(id);
        match self.arena.node_mut(id).kind.as_element_mut() {
            Some(element) => Ok(element),
            None => bail!(XmlErrorKind::ForeignNode("node is not an element".into())),
        }
    }

    //
    // Navigation

    /// Follows a relation from `node`, expanding the tree as far as needed.
    ///
    /// # Errors
    /// - `ForeignNode` if the handle belongs to another document
    /// - `MalformedInput` if the token source is invalid
    /// - `SourceClosed` if the answer needs tokens but the source was closed
    /// - `AlreadyConsumed` if the container was streamed by a pass-through
    pub fn navigate(&mut self, node: NodeId, relation: Relation) -> XmlResult<Option<NodeId>> {
        match relation {
            Relation::FirstChild => self.first_child(node),
            Relation::LastChild => self.last_child(node),
            Relation::NextSibling => self.next_sibling(node),
            Relation::PreviousSibling => self.previous_sibling(node),
            Relation::Parent => self.parent(node),
        }
    }

    /// Returns the first child of a container, reading only as far as its first child.
    ///
    /// # Errors
    /// See [`Document::navigate`].
    pub fn first_child(&mut self, node: NodeId) -> XmlResult<Option<NodeId>> {
        let id = self.arena.check(node)?;
        if !self.arena.kind(id).is_container() {
            return Ok(None);
        }
        if let Some(child) = self.arena.node(id).first_child {
            return Ok(Some(child));
        }

        self.expand(id, |arena| arena.node(id).first_child.is_some())?;
        Ok(self.arena.node(id).first_child)
    }

    /// Returns the last child of a container. This completes the container.
    ///
    /// # Errors
    /// See [`Document::navigate`].
    pub fn last_child(&mut self, node: NodeId) -> XmlResult<Option<NodeId>> {
        let id = self.arena.check(node)?;
        if !self.arena.kind(id).is_container() {
            return Ok(None);
        }

        self.expand(id, |_| false)?;
        Ok(self.arena.node(id).last_child)
    }

    /// Returns the next sibling, reading only as far as that sibling's start.
    ///
    /// # Errors
    /// See [`Document::navigate`].
    pub fn next_sibling(&mut self, node: NodeId) -> XmlResult<Option<NodeId>> {
        let id = self.arena.check(node)?;
        if let Some(next) = self.arena.node(id).next {
            return Ok(Some(next));
        }
        let Some(parent) = self.arena.node(id).parent else {
            return Ok(None);
        };

        self.expand(parent, |arena| arena.node(id).next.is_some())?;
        Ok(self.arena.node(id).next)
    }

    /// Returns the previous sibling. Preceding siblings are always materialized.
    ///
    /// # Errors
    /// Returns `ForeignNode` if the handle belongs to another document.
    pub fn previous_sibling(&self, node: NodeId) -> XmlResult<Option<NodeId>> {
        Ok(self.arena.node(self.arena.check(node)?).prev)
    }

    /// Returns the parent of a node, or `None` for detached nodes and the document.
    ///
    /// # Errors
    /// Returns `ForeignNode` if the handle belongs to another document.
    pub fn parent(&self, node: NodeId) -> XmlResult<Option<NodeId>> {
        Ok(self.arena.node(self.arena.check(node)?).parent)
    }

    /// Returns the first element child of a container, skipping other nodes.
    ///
    /// # Errors
    /// See [`Document::navigate`].
    pub fn first_element_child(&mut self, node: NodeId) -> XmlResult<Option<NodeId>> {
        let mut current = self.first_child(node)?;
        while let Some(id) = current {
            if matches!(self.arena.kind(id), NodeKind::Element(_)) {
                return Ok(Some(id));
            }
            current = self.next_sibling(id)?;
        }
        Ok(None)
    }

    /// Returns the next sibling that is an element.
    ///
    /// # Errors
    /// See [`Document::navigate`].
    pub fn next_element_sibling(&mut self, node: NodeId) -> XmlResult<Option<NodeId>> {
        let mut current = self.next_sibling(node)?;
        while let Some(id) = current {
            if matches!(self.arena.kind(id), NodeKind::Element(_)) {
                return Ok(Some(id));
            }
            current = self.next_sibling(id)?;
        }
        Ok(None)
    }

    /// Returns the document element.
    ///
    /// # Errors
    /// See [`Document::navigate`].
    pub fn document_element(&mut self) -> XmlResult<Option<NodeId>> {
        self.first_element_child(self.root)
    }

    /// Returns all children of a container. This completes the container.
    ///
    /// # Errors
    /// See [`Document::navigate`].
    pub fn children(&mut self, node: NodeId) -> XmlResult<Vec<NodeId>> {
        let id = self.arena.check(node)?;
        if self.arena.kind(id).is_container() {
            self.expand(id, |_| false)?;
        }

        let mut out = vec![];
        let mut current = self.arena.node(id).first_child;
        while let Some(child) = current {
            out.push(child);
            current = self.arena.node(child).next;
        }
        Ok(out)
    }

    /// Concatenates the character data of a node and its descendants.
    /// Binary content is skipped. This completes the subtree.
    ///
    /// # Errors
    /// See [`Document::navigate`].
    pub fn text_content(&mut self, node: NodeId) -> XmlResult<String> {
        let id = self.arena.check(node)?;
        self.build_node(id)?;

        let mut out = String::new();
        let mut stack = vec![id];
        while let Some(id) = stack.pop() {
            let node = self.arena.node(id);
            if let NodeKind::Text(TextContent::Characters(text)) = &node.kind {
                out.push_str(text);
            }

            let mut child = node.last_child;
            while let Some(c) = child {
                stack.push(c);
                child = self.arena.node(c).prev;
            }
        }
        Ok(out)
    }

    //
    // Expansion

    /// Advances the token source until `until` holds for the tree, or `container` is complete.
    ///
    /// `container` must be the builder's current expansion target, which is the
    /// innermost open container.
    ///
    /// # Errors
    /// - `OutOfOrderExpansion` if `container` is not the current target
    /// - `MalformedInput` if the token sequence is invalid
    /// - `SourceClosed` if the source was closed
    pub fn advance_until(
        &mut self,
        container: NodeId,
        mut until: impl FnMut(&TreeView<'_>) -> bool,
    ) -> XmlResult<()> {
        let id = self.arena.check(container)?;
        if self.arena.expansion(id).is_complete() {
            return Ok(());
        }

        let policy = self.policy.as_deref();
        let Some(builder) = self.builder.as_mut() else {
            bail!(XmlErrorKind::SourceClosed);
        };
        builder.advance_until(&mut self.arena, policy, id, &mut |arena: &Arena| {
            until(&TreeView::new(arena))
        })?;

        self.release_if_finished();
        Ok(())
    }

    /// Consumes exactly one token from the source.
    /// Returns false if there was nothing left to consume.
    ///
    /// # Errors
    /// - `MalformedInput` if the token sequence is invalid
    /// - `SourceClosed` if the source was closed before the document was complete
    pub fn step(&mut self) -> XmlResult<bool> {
        let policy = self.policy.as_deref();
        let Some(builder) = self.builder.as_mut() else {
            if self.closed {
                bail!(XmlErrorKind::SourceClosed);
            }
            return Ok(false);
        };

        let consumed = builder.step(&mut self.arena, policy)?;
        self.release_if_finished();
        Ok(consumed)
    }

    /// Materializes the whole document.
    ///
    /// # Errors
    /// See [`Document::navigate`].
    pub fn build(&mut self) -> XmlResult<()> {
        self.build_node(self.root)
    }

    /// Materializes the subtree of a node.
    ///
    /// # Errors
    /// See [`Document::navigate`].
    pub fn build_node(&mut self, node: NodeId) -> XmlResult<()> {
        let id = self.arena.check(node)?;
        if !self.arena.kind(id).is_container() {
            return Ok(());
        }
        self.expand(id, |_| false)
    }

    /// Releases the token source. Containers that are not complete stay that way,
    /// and navigating into them fails with `SourceClosed`.
    pub fn close(&mut self) {
        if let Some(mut builder) = self.builder.take() {
            if builder.open_containers() > 0 {
                tracing::warn!(
                    open = builder.open_containers(),
                    "closing document with incomplete containers"
                );
            }
            builder.close();
            self.closed = true;
        }
    }

    /// Expands `container` until `until` holds or it is complete.
    /// Inner containers that are still open are completed first.
    fn expand(
        &mut self,
        container: NodeId,
        mut until: impl FnMut(&Arena) -> bool,
    ) -> XmlResult<()> {
        loop {
            match self.arena.expansion(container) {
                Expansion::Complete => return Ok(()),
                Expansion::Consumed => bail!(XmlErrorKind::AlreadyConsumed),
                Expansion::Untouched | Expansion::PartiallyExpanded => {}
            }
            if until(&self.arena) {
                return Ok(());
            }

            let policy = self.policy.as_deref();
            let Some(builder) = self.builder.as_mut() else {
                bail!(XmlErrorKind::SourceClosed);
            };
            let Some(current) = builder.current() else {
                bail!(XmlErrorKind::SourceClosed);
            };

            if current == container {
                builder.advance_until(&mut self.arena, policy, container, &mut until)?;
            } else if builder.is_open(container) {
                builder.advance_until(&mut self.arena, policy, current, &mut |_: &Arena| false)?;
            } else {
                bail!(XmlErrorKind::OutOfOrderExpansion);
            }

            self.release_if_finished();
        }
    }

    fn release_if_finished(&mut self) {
        if self.builder.as_ref().is_some_and(Builder::is_finished) {
            tracing::debug!("document complete, releasing token source");
            if let Some(mut builder) = self.builder.take() {
                builder.close();
            }
        }
    }

    pub(crate) fn body_first_child_hint(&self) -> Option<QName> {
        self.builder.as_ref().and_then(Builder::body_first_child_hint)
    }

    //
    // Mutation

    /// Inserts a node at the given position. A node that already has a parent is moved.
    ///
    /// A node that would become the last child of a container still being built is
    /// only linked once the container is complete, so it stays last whatever the
    /// source holds. If a [`ChildPolicy`] is installed it decides the final position
    /// of element children.
    ///
    /// # Errors
    /// - `ForeignNode` if the reference sibling is not a child of the container,
    ///   the target is not a container, the node is a document, the insertion
    ///   would create a cycle, or a handle belongs to another document
    /// - expansion errors while completing the container
    /// - any error of the installed [`ChildPolicy`]
    ///
    /// The tree is unchanged when an error is returned.
    pub fn insert(&mut self, node: NodeId, position: Position) -> XmlResult<()> {
        let node = self.arena.check(node)?;
        let parent = match position {
            Position::LastChildOf(parent) | Position::FirstChildOf(parent) => {
                self.arena.check(parent)?
            }
            Position::Before { container, sibling } | Position::After { container, sibling } => {
                let container = self.arena.check(container)?;
                let sibling = self.arena.check(sibling)?;
                if self.arena.node(sibling).parent != Some(container) {
                    bail!(XmlErrorKind::ForeignNode(
                        "reference node is not a child of the container".into()
                    ));
                }
                if sibling == node {
                    return Ok(());
                }
                container
            }
        };

        if !self.arena.kind(parent).is_container() {
            bail!(XmlErrorKind::ForeignNode(
                "only documents and elements can have children".into()
            ));
        }
        if matches!(self.arena.kind(node), NodeKind::Document) {
            bail!(XmlErrorKind::ForeignNode(
                "a document cannot be inserted into a tree".into()
            ));
        }
        if self.arena.is_ancestor_or_self(node, parent) {
            bail!(XmlErrorKind::ForeignNode(
                "a node cannot be inserted into its own subtree".into()
            ));
        }

        let mut requested = self.requested_placement(node, parent, position);
        if requested == Placement::Append && !self.arena.expansion(parent).is_complete() {
            self.expand(parent, |_| false)?;
            requested = self.requested_placement(node, parent, position);
        }

        let placement = match &self.policy {
            Some(policy) if matches!(self.arena.kind(node), NodeKind::Element(_)) => {
                policy.place(&TreeView::new(&self.arena), parent, node, requested)?
            }
            _ => requested,
        };

        self.detach(node)?;
        self.arena.touch(parent);
        match placement {
            Placement::Before(reference)
                if reference != node && self.arena.node(reference).parent == Some(parent) =>
            {
                self.arena.insert_before(reference, node);
            }
            _ => self.arena.append(parent, node),
        }
        Ok(())
    }

    /// Resolves a position to the child `node` would precede, ignoring `node` itself.
    fn requested_placement(&self, node: NodeId, parent: NodeId, position: Position) -> Placement {
        let following = match position {
            Position::LastChildOf(_) => None,
            Position::FirstChildOf(_) => self.arena.node(parent).first_child,
            Position::Before { sibling, .. } => Some(sibling),
            Position::After { sibling, .. } => self.arena.node(sibling).next,
        };

        let mut current = following;
        while let Some(id) = current {
            if id != node {
                return Placement::Before(id);
            }
            current = self.arena.node(id).next;
        }
        Placement::Append
    }

    /// Appends a node to a container. See [`Document::insert`].
    ///
    /// # Errors
    /// See [`Document::insert`].
    pub fn append_child(&mut self, parent: NodeId, node: NodeId) -> XmlResult<()> {
        self.insert(node, Position::LastChildOf(parent))
    }

    /// Inserts a node before `sibling`, which must be a child of `container`.
    ///
    /// # Errors
    /// See [`Document::insert`].
    pub fn insert_before(
        &mut self,
        container: NodeId,
        sibling: NodeId,
        node: NodeId,
    ) -> XmlResult<()> {
        self.insert(node, Position::Before { container, sibling })
    }

    /// Inserts a node after `sibling`, which must be a child of `container`.
    ///
    /// # Errors
    /// See [`Document::insert`].
    pub fn insert_after(
        &mut self,
        container: NodeId,
        sibling: NodeId,
        node: NodeId,
    ) -> XmlResult<()> {
        self.insert(node, Position::After { container, sibling })
    }

    /// Removes a node from its parent. An element still being built is completed first,
    /// so the builder never writes into a detached subtree.
    ///
    /// # Errors
    /// Returns `ForeignNode` for handles of another document, or an expansion error.
    pub fn detach(&mut self, node: NodeId) -> XmlResult<()> {
        let id = self.arena.check(node)?;
        if self.arena.node(id).parent.is_none() {
            return Ok(());
        }

        let open = self.builder.as_ref().is_some_and(|b| b.is_open(id));
        if open {
            self.expand(id, |_| false)?;
        }

        self.arena.unlink(id);
        Ok(())
    }

    //
    // Serialization

    /// Streams an untouched element from the token source to `writer` without
    /// creating nodes. The element can't be traversed afterward.
    ///
    /// # Errors
    /// - `AlreadyConsumed` if the element was expanded, modified, or already streamed
    /// - `SourceClosed` if the source was closed
    /// - `MalformedInput` or writer errors while streaming
    pub fn pass_through(&mut self, element: NodeId, writer: &mut dyn XmlWriter) -> XmlResult<()> {
        let id = self.arena.check(element)?;
        if self.arena.expansion(id) != Expansion::Untouched {
            bail!(XmlErrorKind::AlreadyConsumed);
        }
        let Some(builder) = self.builder.as_mut() else {
            bail!(XmlErrorKind::SourceClosed);
        };

        builder.pass_through(&mut self.arena, id, writer)?;
        self.release_if_finished();
        Ok(())
    }

    /// Writes the whole document to `writer`.
    ///
    /// With `cache = true` every node is materialized and the document can be
    /// traversed again afterward. With `cache = false`, untouched elements are
    /// streamed straight from the token source, and the source is released when done.
    ///
    /// # Errors
    /// Returns expansion errors, `AlreadyConsumed`, or writer errors.
    pub fn serialize(&mut self, writer: &mut dyn XmlWriter, cache: bool) -> XmlResult<()> {
        crate::serializer::serialize(self, self.root, writer, cache)?;
        writer.flush()?;

        if !cache {
            self.close();
        }
        Ok(())
    }

    /// Writes one node and its subtree to `writer`. See [`Document::serialize`].
    ///
    /// # Errors
    /// Returns expansion errors, `AlreadyConsumed`, or writer errors.
    pub fn serialize_node(
        &mut self,
        node: NodeId,
        writer: &mut dyn XmlWriter,
        cache: bool,
    ) -> XmlResult<()> {
        crate::serializer::serialize(self, node, writer, cache)
    }

    /// Serializes the document as XML text with default writer options.
    ///
    /// # Errors
    /// See [`Document::serialize`].
    pub fn to_xml_string(&mut self, cache: bool) -> XmlResult<String> {
        let mut writer = StreamWriter::new(Vec::new(), WriterOptions::default());
        self.serialize(&mut writer, cache)?;
        String::from_utf8(writer.into_inner())
            .map_err(|e| XmlErrorKind::Encoding(e.to_string()).into())
    }

    pub(crate) fn data(&self, id: NodeId) -> &NodeData {
        self.arena.node(id)
    }
}
impl Default for Document<'_> {
    fn default() -> Self {
        Self::new()
    }
}
impl std::fmt::Debug for Document<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Document")
            .field("root", &self.root)
            .field("has_builder", &self.has_builder())
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Token, VecTokenSource};

    fn source(tokens: Vec<Token>) -> VecTokenSource {
        VecTokenSource::new(tokens)
    }

    fn simple() -> Vec<Token> {
        vec![
            Token::StartDocument,
            Token::start("root"),
            Token::start("a"),
            Token::text("1"),
            Token::EndElement,
            Token::start("b"),
            Token::EndElement,
            Token::text("tail"),
            Token::EndElement,
            Token::EndDocument,
        ]
    }

    #[test]
    fn test_first_child_reads_minimum() {
        let mut doc = Document::from_source(source(simple()));
        let root = doc.document_element().unwrap().unwrap();
        assert_eq!(doc.expansion(root).unwrap(), Expansion::Untouched);

        let a = doc.first_child(root).unwrap().unwrap();
        assert_eq!(doc.name(a).unwrap().unwrap().local_name(), "a");
        assert_eq!(doc.expansion(root).unwrap(), Expansion::PartiallyExpanded);
        assert_eq!(doc.expansion(a).unwrap(), Expansion::Untouched);
        assert!(doc.view().next_sibling(a).is_none());
    }

    #[test]
    fn test_next_sibling_completes_previous() {
        let mut doc = Document::from_source(source(simple()));
        let root = doc.document_element().unwrap().unwrap();
        let a = doc.first_child(root).unwrap().unwrap();
        let b = doc.next_sibling(a).unwrap().unwrap();

        assert!(doc.is_complete(a).unwrap());
        assert_eq!(doc.name(b).unwrap().unwrap().local_name(), "b");
        let tail = doc.next_sibling(b).unwrap().unwrap();
        assert_eq!(
            doc.kind(tail).unwrap(),
            &NodeKind::Text(TextContent::Characters("tail".into()))
        );
        assert_eq!(doc.next_sibling(tail).unwrap(), None);
        assert!(doc.is_complete(root).unwrap());
    }

    #[test]
    fn test_builder_released_when_complete() {
        let mut doc = Document::from_source(source(simple()));
        doc.build().unwrap();
        assert!(!doc.has_builder());
        assert!(!doc.is_closed());
        assert!(doc.is_complete(doc.root()).unwrap());
    }

    #[test]
    fn test_step_consumes_one_token() {
        let mut doc = Document::from_source(source(simple()));
        assert!(doc.step().unwrap());
        assert!(doc.view().first_child(doc.root()).is_none());
        assert!(doc.step().unwrap());
        assert!(doc.view().first_child(doc.root()).is_some());
    }

    #[test]
    fn test_out_of_order_expansion() {
        let mut doc = Document::from_source(source(simple()));
        let root = doc.document_element().unwrap().unwrap();
        let a = doc.first_child(root).unwrap().unwrap();

        let err = doc.advance_until(root, |_| false).unwrap_err();
        assert!(matches!(err.kind, XmlErrorKind::OutOfOrderExpansion));

        doc.advance_until(a, |_| false).unwrap();
        assert!(doc.is_complete(a).unwrap());
        doc.advance_until(root, |view| view.last_child(root).is_some_and(|l| l != a))
            .unwrap();
    }

    #[test]
    fn test_malformed_input_is_permanent() {
        let tokens = vec![
            Token::StartDocument,
            Token::start("root"),
            Token::start("a"),
            Token::EndElement,
            Token::EndElement,
            Token::EndElement,
        ];
        let mut doc = Document::from_source(source(tokens));
        let root = doc.document_element().unwrap().unwrap();
        let a = doc.first_child(root).unwrap().unwrap();

        // The third end tag closes the document node
        let err = doc.build().unwrap_err();
        assert!(matches!(err.kind, XmlErrorKind::MalformedInput(_)));
        assert!(doc.is_complete(root).unwrap());
        assert!(!doc.is_complete(doc.root()).unwrap());
        assert!(doc.is_complete(a).unwrap());

        let err = doc.build().unwrap_err();
        assert!(matches!(err.kind, XmlErrorKind::MalformedInput(_)));
    }

    #[test]
    fn test_unexpected_end_of_input() {
        let tokens = vec![Token::StartDocument, Token::start("root"), Token::text("x")];
        let mut doc = Document::from_source(source(tokens));
        let root = doc.document_element().unwrap().unwrap();

        let err = doc.children(root).unwrap_err();
        assert!(matches!(err.kind, XmlErrorKind::MalformedInput(_)));
        assert_eq!(err.context.element.as_deref(), Some("root"));
        assert!(!doc.is_complete(root).unwrap());

        // Materialized nodes stay inspectable
        let text = doc.view().first_child(root).unwrap();
        assert!(matches!(doc.kind(text).unwrap(), NodeKind::Text(_)));
    }

    #[test]
    fn test_close_early() {
        let mut doc = Document::from_source(source(simple()));
        let root = doc.document_element().unwrap().unwrap();
        doc.close();

        assert!(doc.is_closed());
        let err = doc.first_child(root).unwrap_err();
        assert!(matches!(err.kind, XmlErrorKind::SourceClosed));
        assert!(!doc.is_complete(root).unwrap());
    }

    #[test]
    fn test_insert_and_detach() {
        let mut doc = Document::new();
        let root = doc.create_element("root");
        doc.append_child(doc.root(), root).unwrap();

        let a = doc.create_element("a");
        let b = doc.create_element("b");
        let c = doc.create_comment("c");
        doc.append_child(root, b).unwrap();
        doc.insert_before(root, b, a).unwrap();
        doc.insert_after(root, b, c).unwrap();
        assert_eq!(doc.children(root).unwrap(), vec![a, b, c]);

        doc.detach(b).unwrap();
        assert_eq!(doc.children(root).unwrap(), vec![a, c]);
        assert_eq!(doc.parent(b).unwrap(), None);

        doc.insert(b, Position::FirstChildOf(root)).unwrap();
        assert_eq!(doc.children(root).unwrap(), vec![b, a, c]);
        assert_eq!(doc.previous_sibling(a).unwrap(), Some(b));
        assert_eq!(doc.navigate(c, Relation::Parent).unwrap(), Some(root));
    }

    #[test]
    fn test_insert_moves_between_parents() {
        let mut doc = Document::new();
        let root = doc.create_element("root");
        let x = doc.create_element("x");
        let y = doc.create_element("y");
        let item = doc.create_text("item");
        doc.append_child(doc.root(), root).unwrap();
        doc.append_child(root, x).unwrap();
        doc.append_child(root, y).unwrap();

        doc.append_child(x, item).unwrap();
        doc.append_child(y, item).unwrap();
        assert!(doc.children(x).unwrap().is_empty());
        assert_eq!(doc.children(y).unwrap(), vec![item]);
        assert_eq!(doc.parent(item).unwrap(), Some(y));
    }

    #[test]
    fn test_foreign_node_rejected_before_mutation() {
        let mut doc = Document::new();
        let root = doc.create_element("root");
        let other = doc.create_element("other");
        let a = doc.create_element("a");
        let b = doc.create_element("b");
        doc.append_child(root, a).unwrap();
        doc.append_child(other, b).unwrap();

        let c = doc.create_element("c");
        let err = doc.insert_before(root, b, c).unwrap_err();
        assert!(matches!(err.kind, XmlErrorKind::ForeignNode(_)));
        assert_eq!(doc.parent(c).unwrap(), None);
        assert_eq!(doc.children(root).unwrap(), vec![a]);

        let err = doc.append_child(a, root).unwrap_err();
        assert!(matches!(err.kind, XmlErrorKind::ForeignNode(_)));

        let text = doc.create_text("t");
        let err = doc.append_child(text, c).unwrap_err();
        assert!(matches!(err.kind, XmlErrorKind::ForeignNode(_)));

        let mut second = Document::new();
        let foreign = second.create_element("f");
        let err = doc.append_child(root, foreign).unwrap_err();
        assert!(matches!(err.kind, XmlErrorKind::ForeignNode(_)));
    }

    #[test]
    fn test_detach_incomplete_element_completes_it() {
        let mut doc = Document::from_source(source(simple()));
        let root = doc.document_element().unwrap().unwrap();
        let a = doc.first_child(root).unwrap().unwrap();

        doc.detach(a).unwrap();
        assert!(doc.is_complete(a).unwrap());
        assert_eq!(doc.text_content(a).unwrap(), "1");

        let children: Vec<String> = doc
            .children(root)
            .unwrap()
            .into_iter()
            .filter_map(|id| doc.name(id).unwrap().map(ToString::to_string))
            .collect();
        assert_eq!(children, ["b"]);
    }

    #[test]
    fn test_append_to_partial_container_goes_last() {
        let mut doc = Document::from_source(source(simple()));
        let root = doc.document_element().unwrap().unwrap();
        let extra = doc.create_comment("client");
        doc.append_child(root, extra).unwrap();

        assert_eq!(doc.expansion(root).unwrap(), Expansion::Complete);
        let children = doc.children(root).unwrap();
        assert_eq!(children.len(), 4);
        assert_eq!(children.last(), Some(&extra));
    }

    #[test]
    fn test_inserts_agree_with_eager_build() {
        let src = "<root><a/><b/></root>";
        let mut eager = Document::parse_str(src);
        eager.build().unwrap();
        let mut lazy = Document::parse_str(src);

        for doc in [&mut eager, &mut lazy] {
            let root = doc.document_element().unwrap().unwrap();
            let a = doc.first_child(root).unwrap().unwrap();

            let x = doc.create_element("x");
            doc.append_child(root, x).unwrap();
            let y = doc.create_element("y");
            doc.insert_after(root, a, y).unwrap();
            let z = doc.create_element("z");
            doc.insert(z, Position::FirstChildOf(root)).unwrap();
        }

        let expected = "<root><z/><a/><y/><b/><x/></root>";
        assert_eq!(eager.to_xml_string(true).unwrap(), expected);
        assert_eq!(lazy.to_xml_string(true).unwrap(), expected);
    }

    #[test]
    fn test_step_after_close() {
        let mut doc = Document::from_source(source(simple()));
        assert!(doc.step().unwrap());
        doc.close();

        let err = doc.step().unwrap_err();
        assert!(matches!(err.kind, XmlErrorKind::SourceClosed));

        let mut done = Document::from_source(source(simple()));
        done.build().unwrap();
        assert!(!done.step().unwrap());
    }

    #[test]
    fn test_attributes_and_namespaces() {
        let mut doc = Document::new();
        let root = doc.create_element(QName::new(Some("urn:r"), Some("r"), "root"));
        doc.declare_namespace(root, Namespace::new(Some("r"), "urn:r"))
            .unwrap();
        let child = doc.create_element("child");
        doc.append_child(root, child).unwrap();

        doc.set_attribute(child, Attribute::new("id", "1")).unwrap();
        assert_eq!(
            doc.set_attribute(child, Attribute::new("id", "2")).unwrap(),
            Some("1".into())
        );
        assert_eq!(doc.attribute(child, None, "id").unwrap(), Some("2"));
        assert_eq!(doc.lookup_namespace(child, Some("r")).unwrap(), Some("urn:r"));
        assert_eq!(doc.lookup_namespace(child, Some("q")).unwrap(), None);
        assert!(doc.remove_attribute(child, None, "id").unwrap().is_some());
        assert_eq!(doc.attribute(child, None, "id").unwrap(), None);

        let text = doc.create_text("x");
        let err = doc.set_attribute(text, Attribute::new("id", "1")).unwrap_err();
        assert!(matches!(err.kind, XmlErrorKind::ForeignNode(_)));
    }

    #[test]
    fn test_binary_text_requires_committed_blob() {
        let mut doc = Document::new();
        let mut blob = Blob::new();
        blob.append(b"abc").unwrap();

        let err = doc
            .create_binary_text("id", Arc::new(blob.clone()))
            .unwrap_err();
        assert!(matches!(err.kind, XmlErrorKind::LifecycleViolation(_)));

        blob.commit();
        let id = doc.create_binary_text("id", Arc::new(blob)).unwrap();
        assert!(matches!(doc.kind(id).unwrap(), NodeKind::Text(t) if t.is_binary()));
    }
}
