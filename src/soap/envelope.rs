use super::SoapVersion;
use crate::{
    arena::NodeId,
    document::{ChildPolicy, Placement, TreeView},
    error::{XmlErrorKind, XmlResult, bail},
    node::{Expansion, NodeKind},
};

/// Structural rules of a SOAP envelope, installed on the document of a
/// [`SoapMessage`](super::SoapMessage).
///
/// - At most one Header and one Body
/// - A Header always goes before the Body, even when it is added after it
/// - SOAP 1.2 envelopes accept no other element children
/// - Nothing may be put in front of the Header, and SOAP 1.1 trailing elements
///   may not be put in front of the Body
///
/// While the envelope is still being built, only the children read so far are
/// considered; a Body that has not been read yet simply follows the Header.
#[derive(Debug, Clone, Copy)]
pub struct EnvelopeRules {
    version: SoapVersion,
}
impl EnvelopeRules {
    /// Creates the rules for the given version.
    #[must_use]
    pub fn new(version: SoapVersion) -> Self {
        Self { version }
    }

    /// Returns the version the rules enforce.
    #[must_use]
    pub fn version(&self) -> SoapVersion {
        self.version
    }

    fn is_envelope(&self, tree: &TreeView<'_>, id: NodeId) -> bool {
        tree.name(id)
            .is_some_and(|name| name.equals(Some(self.version.namespace()), "Envelope"))
            && tree
                .parent(id)
                .is_some_and(|parent| matches!(tree.kind(parent), NodeKind::Document))
    }

    fn is_named(&self, tree: &TreeView<'_>, id: NodeId, local: &str) -> bool {
        tree.name(id)
            .is_some_and(|name| name.equals(Some(self.version.namespace()), local))
    }

    /// Finds an existing child with the given name, walking back from the last child.
    fn find_child(
        &self,
        tree: &TreeView<'_>,
        envelope: NodeId,
        local: &str,
        skip: NodeId,
    ) -> Option<NodeId> {
        let mut current = tree.last_child(envelope);
        while let Some(id) = current {
            if id != skip && self.is_named(tree, id, local) {
                return Some(id);
            }
            current = tree.previous_sibling(id);
        }
        None
    }

    /// The Body of a complete envelope: its first or second element child.
    fn leading_body(&self, tree: &TreeView<'_>, envelope: NodeId) -> Option<NodeId> {
        let mut current = tree.first_child(envelope);
        let mut seen = 0;
        while let Some(id) = current {
            if matches!(tree.kind(id), NodeKind::Element(_)) {
                if self.is_named(tree, id, "Body") {
                    return Some(id);
                }
                seen += 1;
                if seen == 2 {
                    return None;
                }
            }
            current = tree.next_sibling(id);
        }
        None
    }

    /// True if a child named `local`, other than `skip`, is at or after `reference`.
    fn named_from(
        &self,
        tree: &TreeView<'_>,
        reference: NodeId,
        local: &str,
        skip: NodeId,
    ) -> bool {
        let mut current = Some(reference);
        while let Some(id) = current {
            if id != skip && self.is_named(tree, id, local) {
                return true;
            }
            current = tree.next_sibling(id);
        }
        false
    }

    fn reject(&self, message: String) -> XmlResult<Placement> {
        tracing::debug!(version = %self.version, reason = %message, "envelope rejected child");
        bail!(XmlErrorKind::SoapProcessing {
            message,
            fault_code: self.version.sender_fault_code().to_string(),
        })
    }
}
impl ChildPolicy for EnvelopeRules {
    fn place(
        &self,
        tree: &TreeView<'_>,
        parent: NodeId,
        child: NodeId,
        requested: Placement,
    ) -> XmlResult<Placement> {
        if !self.is_envelope(tree, parent) || !matches!(tree.kind(child), NodeKind::Element(_)) {
            return Ok(requested);
        }

        let is_header = self.is_named(tree, child, "Header");
        let is_body = self.is_named(tree, child, "Body");
        let name = tree.name(child).map(ToString::to_string).unwrap_or_default();
        if !is_header && !is_body && !self.version.allows_trailing_elements() {
            return self.reject(format!(
                "SOAP Envelope can only contain a Header and a Body, found <{name}>"
            ));
        }

        if is_header || is_body {
            let local = if is_header { "Header" } else { "Body" };
            if self.find_child(tree, parent, local, child).is_some() {
                return self.reject(format!("SOAP Envelope already has a {local}"));
            }
        }

        if is_header {
            // While the envelope is still being read, the Body may not be there yet
            let body = if tree.expansion(parent) == Expansion::Complete {
                self.leading_body(tree, parent)
            } else {
                self.find_child(tree, parent, "Body", child)
            };
            return Ok(body.map_or(requested, Placement::Before));
        }

        // Everything else stays behind the Header, and trailing elements behind the Body
        if let Placement::Before(reference) = requested {
            let misplaced = self.named_from(tree, reference, "Header", child)
                || (!is_body && self.named_from(tree, reference, "Body", child));
            if misplaced {
                return self.reject(format!(
                    "<{name}> can not precede the SOAP Header or Body of the Envelope"
                ));
            }
        }
        Ok(requested)
    }
}
