//! The deferred tree builder.
//!
//! The builder pulls tokens from a [`TokenSource`] only when the tree needs a
//! relation that is not materialized yet. Every token is consumed exactly once,
//! in source order. The containers that are still open form a stack; the top of
//! that stack is the only container the builder can extend.
use crate::{
    Blob,
    arena::{Arena, NodeId},
    document::{ChildPolicy, Placement, TreeView},
    error::{ErrorContext, XmlError, XmlErrorKind, XmlResult},
    node::{Element, Expansion, NodeKind, ProcessingInstruction, TextContent},
    token::{Token, TokenSource},
    writer::XmlWriter,
};
use std::sync::Arc;

/// Options controlling how a [`Document`](crate::Document) is built from a token source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuilderOptions {
    /// Chunk size of the blobs that receive binary content
    pub blob_chunk_size: usize,

    /// Merge consecutive character tokens into a single text node
    pub coalesce_text: bool,
}
impl BuilderOptions {
    /// Sets the chunk size used for attachment blobs.
    #[must_use]
    pub fn with_blob_chunk_size(mut self, size: usize) -> Self {
        self.blob_chunk_size = size;
        self
    }

    /// Enables or disables merging of adjacent character tokens.
    #[must_use]
    pub fn with_coalesce_text(mut self, coalesce: bool) -> Self {
        self.coalesce_text = coalesce;
        self
    }
}
impl Default for BuilderOptions {
    fn default() -> Self {
        Self {
            blob_chunk_size: crate::blob::DEFAULT_CHUNK_SIZE,
            coalesce_text: true,
        }
    }
}

/// Binary content being collected for a text node that does not exist yet.
struct PendingBlob {
    content_id: String,
    parent: NodeId,
    blob: Blob,
}

pub(crate) struct Builder<'src> {
    source: Box<dyn TokenSource + 'src>,
    options: BuilderOptions,

    /// Open containers; the last one is the current expansion target
    stack: Vec<NodeId>,
    started: bool,
    tokens: usize,
    failure: Option<String>,

    /// Text node created by the previous token, for coalescing
    pending_text: Option<NodeId>,
    pending_blob: Option<PendingBlob>,
}
impl<'src> Builder<'src> {
    pub fn new(
        source: Box<dyn TokenSource + 'src>,
        document: NodeId,
        options: BuilderOptions,
    ) -> Self {
        Self {
            source,
            options,
            stack: vec![document],
            started: false,
            tokens: 0,
            failure: None,
            pending_text: None,
            pending_blob: None,
        }
    }

    /// The container the builder is currently expanding.
    pub fn current(&self) -> Option<NodeId> {
        self.stack.last().copied()
    }

    /// True if the container is open on the builder's nesting stack.
    pub fn is_open(&self, id: NodeId) -> bool {
        self.stack.contains(&id)
    }

    /// True once the end of the document was reached.
    pub fn is_finished(&self) -> bool {
        self.started && self.stack.is_empty()
    }

    pub fn open_containers(&self) -> usize {
        self.stack.len()
    }

    pub fn body_first_child_hint(&self) -> Option<crate::QName> {
        self.source.body_first_child_hint()
    }

    pub fn close(&mut self) {
        self.source.close();
        self.pending_blob = None;
        self.pending_text = None;
    }

    /// Pulls tokens until `until` holds or `container` is complete.
    ///
    /// # Errors
    /// - `OutOfOrderExpansion` if `container` is not the current target
    /// - `MalformedInput` if the token sequence is invalid, or the builder failed before
    pub fn advance_until(
        &mut self,
        arena: &mut Arena,
        policy: Option<&dyn ChildPolicy>,
        container: NodeId,
        until: &mut dyn FnMut(&Arena) -> bool,
    ) -> XmlResult<()> {
        self.check_usable(arena)?;
        if self.current() != Some(container) {
            return Err(XmlError::new(
                XmlErrorKind::OutOfOrderExpansion,
                self.context(arena),
            ));
        }

        loop {
            if until(arena) || arena.expansion(container).is_complete() {
                return Ok(());
            }
            if !self.step(arena, policy)? {
                return Ok(());
            }
        }
    }

    /// Consumes exactly one token. Returns false if the input was already exhausted.
    ///
    /// # Errors
    /// Returns `MalformedInput` for an invalid token sequence, or the source's error.
    pub fn step(&mut self, arena: &mut Arena, policy: Option<&dyn ChildPolicy>) -> XmlResult<bool> {
        self.check_usable(arena)?;
        if self.is_finished() {
            return Ok(false);
        }

        let Some(token) = self.pull(arena)? else {
            return Err(self.fail(arena, "unexpected end of input"));
        };

        tracing::trace!(
            token = token.name(),
            depth = self.stack.len(),
            "builder consumed token"
        );

        if !matches!(token, Token::BinaryChunk { .. }) {
            self.flush_blob(arena);
        }
        if !matches!(token, Token::Characters(_)) {
            self.pending_text = None;
        }

        if let Err(e) = self.process(arena, policy, token) {
            if self.failure.is_none() {
                self.failure = Some(e.kind.to_string());
            }
            return Err(e);
        }
        Ok(true)
    }

    /// Streams the remaining content of an untouched element straight to `writer`,
    /// without creating any nodes. The element ends up `Consumed`.
    ///
    /// # Errors
    /// - `AlreadyConsumed` if the element is not untouched
    /// - `OutOfOrderExpansion` if the element is not the current target
    /// - `MalformedInput` or writer errors while streaming; the builder is unusable afterward
    pub fn pass_through(
        &mut self,
        arena: &mut Arena,
        element: NodeId,
        writer: &mut dyn XmlWriter,
    ) -> XmlResult<()> {
        self.check_usable(arena)?;
        if arena.expansion(element) != Expansion::Untouched {
            return Err(XmlError::new(
                XmlErrorKind::AlreadyConsumed,
                self.context(arena),
            ));
        }
        if self.current() != Some(element) {
            return Err(XmlError::new(
                XmlErrorKind::OutOfOrderExpansion,
                self.context(arena),
            ));
        }

        let NodeKind::Element(data) = arena.kind(element) else {
            return Err(XmlError::new(
                XmlErrorKind::AlreadyConsumed,
                self.context(arena),
            ));
        };
        tracing::debug!(element = %data.name(), "pass-through started");

        let result = writer
            .write_start_element(data.name(), data.namespaces(), data.attributes())
            .and_then(|()| self.forward(arena, writer))
            .and_then(|()| writer.write_end_element());

        if let Err(e) = result {
            if self.failure.is_none() {
                self.failure = Some(e.kind.to_string());
            }
            return Err(e);
        }

        arena.set_expansion(element, Expansion::Consumed);
        self.stack.pop();
        self.pending_text = None;
        tracing::debug!(tokens = self.tokens, "pass-through finished");
        Ok(())
    }

    /// Forwards tokens up to, not including, the end tag of the current element.
    fn forward(&mut self, arena: &Arena, writer: &mut dyn XmlWriter) -> XmlResult<()> {
        let mut depth = 0usize;
        let mut pending: Option<(String, Blob)> = None;

        loop {
            let Some(token) = self.pull(arena)? else {
                return Err(self.fail(arena, "unexpected end of input"));
            };

            if !matches!(token, Token::BinaryChunk { .. }) {
                if let Some((content_id, mut blob)) = pending.take() {
                    blob.commit();
                    writer.write_binary(&content_id, &Arc::new(blob))?;
                }
            }

            match token {
                Token::StartElement {
                    name,
                    attributes,
                    namespaces,
                } => {
                    depth += 1;
                    writer.write_start_element(&name, &namespaces, &attributes)?;
                }

                Token::EndElement => {
                    if depth == 0 {
                        return Ok(());
                    }
                    depth -= 1;
                    writer.write_end_element()?;
                }

                Token::Characters(text) => writer.write_characters(&text)?,

                Token::BinaryChunk { content_id, bytes } => match &mut pending {
                    Some((id, blob)) if *id == content_id => {
                        blob.append(&bytes)?;
                    }
                    _ => {
                        if let Some((id, mut blob)) = pending.take() {
                            blob.commit();
                            writer.write_binary(&id, &Arc::new(blob))?;
                        }
                        let mut blob = Blob::with_chunk_size(self.options.blob_chunk_size);
                        blob.append(&bytes)?;
                        pending = Some((content_id, blob));
                    }
                },

                Token::Comment(text) => writer.write_comment(&text)?,

                Token::ProcessingInstruction { target, data } => {
                    writer.write_processing_instruction(&target, data.as_deref())?;
                }

                Token::StartDocument | Token::EndDocument => {
                    let message = format!("unexpected {} inside an element", token.name());
                    return Err(self.fail(arena, &message));
                }
            }
        }
    }

    fn process(
        &mut self,
        arena: &mut Arena,
        policy: Option<&dyn ChildPolicy>,
        token: Token,
    ) -> XmlResult<()> {
        if !self.started {
            self.started = true;
            if token == Token::StartDocument {
                return Ok(());
            }
        }

        match token {
            Token::StartDocument => Err(self.fail(arena, "start of document inside the document")),

            Token::EndDocument => {
                if self.stack.len() != 1 {
                    return Err(self.fail(arena, "end of document with unclosed elements"));
                }
                let Some(document) = self.stack.pop() else {
                    return Err(self.fail(arena, "end of document reached twice"));
                };
                arena.set_expansion(document, Expansion::Complete);
                tracing::debug!(tokens = self.tokens, "document complete");
                Ok(())
            }

            Token::StartElement {
                name,
                attributes,
                namespaces,
            } => {
                let parent = self.target(arena)?;
                if matches!(arena.kind(parent), NodeKind::Document)
                    && has_element_child(arena, parent)
                {
                    return Err(self.fail(arena, "more than one document element"));
                }

                let element = Element::with_content(name, attributes, namespaces);
                let id = arena.alloc(NodeKind::Element(element), Expansion::Untouched);
                self.attach(arena, policy, parent, id)?;
                self.stack.push(id);
                Ok(())
            }

            Token::EndElement => {
                let target = self.target(arena)?;
                let NodeKind::Element(element) = arena.kind(target) else {
                    return Err(self.fail(arena, "end tag without matching start tag"));
                };

                tracing::debug!(element = %element.name(), "element complete");
                arena.set_expansion(target, Expansion::Complete);
                self.stack.pop();
                Ok(())
            }

            Token::Characters(text) => {
                let target = self.target(arena)?;
                if matches!(arena.kind(target), NodeKind::Document) {
                    if text.trim().is_empty() {
                        return Ok(());
                    }
                    return Err(self.fail(arena, "character data outside of the document element"));
                }

                arena.touch(target);
                if let Some(pending) = self.pending_text {
                    let trailing = arena.node(target).last_child == Some(pending);
                    if self.options.coalesce_text && trailing {
                        if let NodeKind::Text(TextContent::Characters(existing)) =
                            &mut arena.node_mut(pending).kind
                        {
                            existing.push_str(&text);
                            return Ok(());
                        }
                    }
                }

                let id = arena.alloc(
                    NodeKind::Text(TextContent::Characters(text)),
                    Expansion::Complete,
                );
                arena.append(target, id);
                self.pending_text = Some(id);
                Ok(())
            }

            Token::BinaryChunk { content_id, bytes } => {
                let target = self.target(arena)?;
                if matches!(arena.kind(target), NodeKind::Document) {
                    return Err(self.fail(arena, "binary content outside of the document element"));
                }
                arena.touch(target);

                if let Some(pending) = &mut self.pending_blob {
                    if pending.content_id == content_id && pending.parent == target {
                        pending.blob.append(&bytes)?;
                        return Ok(());
                    }
                }

                self.flush_blob(arena);
                let mut blob = Blob::with_chunk_size(self.options.blob_chunk_size);
                blob.append(&bytes)?;
                self.pending_blob = Some(PendingBlob {
                    content_id,
                    parent: target,
                    blob,
                });
                Ok(())
            }

            Token::Comment(text) => {
                let target = self.target(arena)?;
                let id = arena.alloc(NodeKind::Comment(text), Expansion::Complete);
                arena.touch(target);
                arena.append(target, id);
                Ok(())
            }

            Token::ProcessingInstruction { target: pi_target, data } => {
                let target = self.target(arena)?;
                let pi = ProcessingInstruction::new(pi_target, data);
                let id = arena.alloc(NodeKind::ProcessingInstruction(pi), Expansion::Complete);
                arena.touch(target);
                arena.append(target, id);
                Ok(())
            }
        }
    }

    /// Links a new child into `parent`, consulting the child policy for elements.
    fn attach(
        &mut self,
        arena: &mut Arena,
        policy: Option<&dyn ChildPolicy>,
        parent: NodeId,
        child: NodeId,
    ) -> XmlResult<()> {
        let placement = match policy {
            Some(policy) if matches!(arena.kind(child), NodeKind::Element(_)) => {
                policy.place(&TreeView::new(arena), parent, child, Placement::Append)?
            }
            _ => Placement::Append,
        };

        arena.touch(parent);
        match placement {
            Placement::Before(reference) if arena.node(reference).parent == Some(parent) => {
                arena.insert_before(reference, child);
            }
            _ => arena.append(parent, child),
        }
        Ok(())
    }

    /// Commits the pending blob and links its text node.
    fn flush_blob(&mut self, arena: &mut Arena) {
        let Some(PendingBlob {
            content_id,
            parent,
            mut blob,
        }) = self.pending_blob.take()
        else {
            return;
        };

        blob.commit();
        tracing::trace!(%content_id, length = blob.total_length(), "attachment stored");
        let content = TextContent::Binary {
            content_id,
            blob: Arc::new(blob),
        };
        let id = arena.alloc(NodeKind::Text(content), Expansion::Complete);
        arena.append(parent, id);
    }

    fn pull(&mut self, arena: &Arena) -> XmlResult<Option<Token>> {
        match self.source.next_token() {
            Ok(Some(token)) => {
                self.tokens += 1;
                Ok(Some(token))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                self.failure = Some(e.kind.to_string());
                Err(XmlError::new(e.kind, self.context(arena)))
            }
        }
    }

    fn target(&mut self, arena: &Arena) -> XmlResult<NodeId> {
        match self.current() {
            Some(id) => Ok(id),
            None => Err(self.fail(arena, "content after the end of the document")),
        }
    }

    fn check_usable(&self, arena: &Arena) -> XmlResult<()> {
        match &self.failure {
            Some(message) => Err(XmlError::new(
                XmlErrorKind::MalformedInput(message.clone()),
                self.context(arena),
            )),
            None => Ok(()),
        }
    }

    /// Records a fatal error; the builder refuses to continue afterward.
    fn fail(&mut self, arena: &Arena, message: &str) -> XmlError {
        tracing::debug!(tokens = self.tokens, reason = message, "builder failed");
        self.failure = Some(message.to_string());
        XmlError::new(
            XmlErrorKind::MalformedInput(message.to_string()),
            self.context(arena),
        )
    }

    fn context(&self, arena: &Arena) -> ErrorContext {
        let element = self
            .stack
            .iter()
            .rev()
            .find_map(|id| arena.kind(*id).as_element())
            .map(|e| e.name().to_string());
        ErrorContext::new(self.tokens, element)
    }
}

fn has_element_child(arena: &Arena, parent: NodeId) -> bool {
    let mut current = arena.node(parent).first_child;
    while let Some(id) = current {
        if matches!(arena.kind(id), NodeKind::Element(_)) {
            return true;
        }
        current = arena.node(id).next;
    }
    false
}
