//! SOAP envelopes layered on the lazy tree
//!
//! A [`SoapMessage`] owns a [`Document`] whose document element is a SOAP
//! `Envelope`. The envelope's structure is enforced by [`EnvelopeRules`], both
//! while the message is being read and when children are added by hand.
mod version;
pub use version::*;

mod envelope;
pub use envelope::EnvelopeRules;

use crate::{
    Document, XmlReader,
    arena::NodeId,
    builder::BuilderOptions,
    error::{XmlErrorKind, XmlResult, bail},
    node::{Attribute, Expansion, Namespace, QName},
    reader::XML_NAMESPACE,
    token::TokenSource,
    writer::XmlWriter,
};

/// Prefix used for the envelope namespace in messages created from scratch.
pub const DEFAULT_PREFIX: &str = "soapenv";

/// A SOAP message: an envelope with an optional Header and a Body.
///
/// Lookups only read as much of the message as they need; [`SoapMessage::has_fault`]
/// for example stops at the start tag of the first element inside the Body.
///
/// # Example
/// ```rust
/// use lazy_xmltree::soap::SoapMessage;
///
/// let src = r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope">
///     <s:Body><s:Fault><s:Code><s:Value>s:Receiver</s:Value></s:Code></s:Fault></s:Body>
/// </s:Envelope>"#;
///
/// let mut message = SoapMessage::parse_str(src).unwrap();
/// assert!(message.has_fault().unwrap());
/// ```
#[derive(Debug)]
pub struct SoapMessage<'src> {
    doc: Document<'src>,
    version: SoapVersion,
    envelope: NodeId,
}
impl<'src> SoapMessage<'src> {
    /// Creates a message with an empty Body.
    ///
    /// # Errors
    /// Returns an error if the envelope cannot be assembled.
    pub fn new(version: SoapVersion) -> XmlResult<Self> {
        let mut doc = Document::new();
        let namespace = version.namespace();
        let envelope = doc.create_element(QName::new(
            Some(namespace),
            Some(DEFAULT_PREFIX),
            "Envelope",
        ));
        doc.declare_namespace(envelope, Namespace::new(Some(DEFAULT_PREFIX), namespace))?;
        doc.append_child(doc.root(), envelope)?;
        doc.set_policy(Box::new(EnvelopeRules::new(version)));

        let mut message = Self {
            doc,
            version,
            envelope,
        };
        message.create_body()?;
        Ok(message)
    }

    /// Opens a message read lazily from a token source.
    /// Only the envelope's start tag is read here.
    ///
    /// # Errors
    /// - `SoapProcessing` with the `VersionMismatch` code if the document element is
    ///   not an Envelope in the SOAP 1.1 or 1.2 namespace
    /// - `MalformedInput` if the source has no document element
    pub fn from_source(source: impl TokenSource + 'src) -> XmlResult<Self> {
        Self::from_source_with_options(source, BuilderOptions::default())
    }

    /// Opens a message read lazily from a token source. See [`SoapMessage::from_source`].
    ///
    /// # Errors
    /// See [`SoapMessage::from_source`].
    pub fn from_source_with_options(
        source: impl TokenSource + 'src,
        options: BuilderOptions,
    ) -> XmlResult<Self> {
        let mut doc = Document::from_source_with_options(source, options);
        let Some(envelope) = doc.document_element()? else {
            bail!(msg = "SOAP message without an envelope");
        };

        let name = doc.name(envelope)?.cloned().unwrap_or_else(|| QName::local(""));
        let version = name
            .namespace()
            .filter(|_| name.local_name() == "Envelope")
            .and_then(SoapVersion::from_namespace);
        let Some(version) = version else {
            bail!(XmlErrorKind::SoapProcessing {
                message: format!("<{name}> is not a SOAP 1.1 or SOAP 1.2 envelope"),
                fault_code: VERSION_MISMATCH_CODE.to_string(),
            });
        };

        doc.set_policy(Box::new(EnvelopeRules::new(version)));
        tracing::debug!(%version, "opened SOAP message");
        Ok(Self {
            doc,
            version,
            envelope,
        })
    }

    /// Opens a message read lazily from XML text.
    ///
    /// # Errors
    /// See [`SoapMessage::from_source`].
    pub fn parse_str(src: &'src str) -> XmlResult<Self> {
        Self::from_source(XmlReader::new(src))
    }

    /// Returns the SOAP version of the message.
    #[must_use]
    pub fn version(&self) -> SoapVersion {
        self.version
    }

    /// Returns the envelope element.
    #[must_use]
    pub fn envelope(&self) -> NodeId {
        self.envelope
    }

    /// Returns the underlying document.
    #[must_use]
    pub fn document(&self) -> &Document<'src> {
        &self.doc
    }

    /// Returns the underlying document, for navigation and editing.
    pub fn document_mut(&mut self) -> &mut Document<'src> {
        &mut self.doc
    }

    /// Consumes the message, returning the underlying document.
    #[must_use]
    pub fn into_document(self) -> Document<'src> {
        self.doc
    }

    /// Returns the Header, which can only be the first element of the envelope.
    ///
    /// # Errors
    /// Returns expansion errors.
    pub fn header(&mut self) -> XmlResult<Option<NodeId>> {
        let Some(first) = self.doc.first_element_child(self.envelope)? else {
            return Ok(None);
        };
        Ok(self.is_soap(first, "Header").then_some(first))
    }

    /// Returns the Body, which is the first or second element of the envelope.
    /// Returns `None` when the envelope holds nothing but a Header.
    ///
    /// # Errors
    /// Returns `MalformedInput` if neither of the first two elements is a Body,
    /// or expansion errors.
    pub fn body(&mut self) -> XmlResult<Option<NodeId>> {
        let Some(first) = self.doc.first_element_child(self.envelope)? else {
            return Ok(None);
        };
        if self.is_soap(first, "Body") {
            return Ok(Some(first));
        }

        match self.doc.next_element_sibling(first)? {
            None => Ok(None),
            Some(second) if self.is_soap(second, "Body") => Ok(Some(second)),
            Some(_) => bail!(
                msg = "SOAP Envelope must contain a Body as its first or second element"
            ),
        }
    }

    /// Returns the Header, creating it if there is none.
    ///
    /// # Errors
    /// Returns expansion errors.
    pub fn get_or_create_header(&mut self) -> XmlResult<NodeId> {
        match self.header()? {
            Some(header) => Ok(header),
            None => self.create_header(),
        }
    }

    /// Creates a Header and adds it to the envelope, before the Body.
    ///
    /// # Errors
    /// Returns `SoapProcessing` if the envelope already has a Header.
    pub fn create_header(&mut self) -> XmlResult<NodeId> {
        let header = self.doc.create_element(self.soap_name("Header"));
        self.add_child(header)?;
        Ok(header)
    }

    /// Creates a Body and adds it to the envelope.
    ///
    /// # Errors
    /// Returns `SoapProcessing` if the envelope already has a Body.
    pub fn create_body(&mut self) -> XmlResult<NodeId> {
        let body = self.doc.create_element(self.soap_name("Body"));
        self.add_child(body)?;
        Ok(body)
    }

    /// Adds a child to the envelope, following the envelope's structural rules.
    ///
    /// # Errors
    /// Returns `SoapProcessing` if the rules reject the child. The envelope is unchanged.
    pub fn add_child(&mut self, node: NodeId) -> XmlResult<()> {
        self.doc.append_child(self.envelope, node)
    }

    /// Returns true if the first element of the Body is a SOAP `Fault`.
    ///
    /// At most the start tag of that element is read; the rest of the Body is left alone.
    ///
    /// # Errors
    /// Returns expansion errors.
    pub fn has_fault(&mut self) -> XmlResult<bool> {
        Ok(self.body_first_element_name()?.is_some_and(|name| is_fault(&name)))
    }

    /// Returns the name of the first element in the Body.
    ///
    /// # Errors
    /// Returns expansion errors.
    pub fn body_first_element_name(&mut self) -> XmlResult<Option<QName>> {
        if self.body_is_unread() {
            if let Some(name) = self.doc.body_first_child_hint() {
                return Ok(Some(name));
            }
        }

        let Some(body) = self.body()? else {
            return Ok(None);
        };
        let Some(first) = self.doc.first_element_child(body)? else {
            return Ok(None);
        };
        Ok(self.doc.name(first)?.cloned())
    }

    /// Adds a fault to the Body, creating the Body if needed.
    /// `code` is a fault code local name, such as [`SoapVersion::sender_fault_code`].
    ///
    /// # Errors
    /// Returns expansion errors.
    pub fn create_fault(&mut self, code: &str, reason: &str) -> XmlResult<NodeId> {
        let body = match self.body()? {
            Some(body) => body,
            None => self.create_body()?,
        };

        let fault = self.doc.create_element(self.soap_name("Fault"));
        self.doc.append_child(body, fault)?;

        let code = match self.prefix() {
            Some(prefix) => format!("{prefix}:{code}"),
            None => code.to_string(),
        };
        match self.version {
            SoapVersion::Soap11 => {
                self.text_element(fault, QName::local("faultcode"), &code)?;
                self.text_element(fault, QName::local("faultstring"), reason)?;
            }
            SoapVersion::Soap12 => {
                let code_element = self.doc.create_element(self.soap_name("Code"));
                self.doc.append_child(fault, code_element)?;
                self.text_element(code_element, self.soap_name("Value"), &code)?;

                let reason_element = self.doc.create_element(self.soap_name("Reason"));
                self.doc.append_child(fault, reason_element)?;
                let text = self.text_element(reason_element, self.soap_name("Text"), reason)?;
                let lang = QName::new(Some(XML_NAMESPACE), Some("xml"), "lang");
                self.doc.set_attribute(text, Attribute::new(lang, "en"))?;
            }
        }

        Ok(fault)
    }

    /// Writes the whole message, including the start and end of the document.
    /// See [`Document::serialize`].
    ///
    /// # Errors
    /// Returns expansion or writer errors.
    pub fn serialize(&mut self, writer: &mut dyn XmlWriter, cache: bool) -> XmlResult<()> {
        self.doc.serialize(writer, cache)
    }

    /// Serializes the message as XML text. See [`Document::to_xml_string`].
    ///
    /// # Errors
    /// Returns expansion or writer errors.
    pub fn to_xml_string(&mut self, cache: bool) -> XmlResult<String> {
        self.doc.to_xml_string(cache)
    }

    /// True while the Body is exactly as the source holds it: not read yet, or untouched.
    fn body_is_unread(&self) -> bool {
        let view = self.doc.view();
        let mut current = view.first_child(self.envelope);
        while let Some(id) = current {
            if self.is_soap(id, "Body") {
                return view.expansion(id) == Expansion::Untouched;
            }
            current = view.next_sibling(id);
        }
        !view.expansion(self.envelope).is_complete()
    }

    fn prefix(&self) -> Option<&str> {
        self.doc
            .view()
            .name(self.envelope)
            .and_then(QName::prefix)
    }

    fn soap_name(&self, local: &str) -> QName {
        QName::new(Some(self.version.namespace()), self.prefix(), local)
    }

    fn is_soap(&self, id: NodeId, local: &str) -> bool {
        self.doc
            .view()
            .name(id)
            .is_some_and(|name| name.equals(Some(self.version.namespace()), local))
    }

    fn text_element(&mut self, parent: NodeId, name: QName, text: &str) -> XmlResult<NodeId> {
        let element = self.doc.create_element(name);
        let content = self.doc.create_text(text);
        self.doc.append_child(element, content)?;
        self.doc.append_child(parent, element)?;
        Ok(element)
    }
}

/// True for `Fault` in either SOAP namespace.
fn is_fault(name: &QName) -> bool {
    name.local_name() == "Fault"
        && name
            .namespace()
            .is_some_and(|ns| SoapVersion::from_namespace(ns).is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Token, VecTokenSource};

    fn envelope_xml(version: SoapVersion, body: &str) -> String {
        format!(
            r#"<s:Envelope xmlns:s="{}"><s:Header/><s:Body>{body}</s:Body></s:Envelope>"#,
            version.namespace()
        )
    }

    fn names(message: &mut SoapMessage<'_>) -> Vec<String> {
        let envelope = message.envelope();
        let doc = message.document_mut();
        doc.children(envelope)
            .unwrap()
            .into_iter()
            .filter_map(|id| doc.name(id).unwrap().map(|n| n.local_name().to_string()))
            .collect()
    }

    #[test]
    fn test_header_goes_before_body() {
        for version in [SoapVersion::Soap11, SoapVersion::Soap12] {
            let mut message = SoapMessage::new(version).unwrap();
            let header = message.create_header().unwrap();
            assert_eq!(names(&mut message), ["Header", "Body"]);
            assert_eq!(message.header().unwrap(), Some(header));
            assert_eq!(message.get_or_create_header().unwrap(), header);
        }
    }

    #[test]
    fn test_other_children_by_version() {
        let mut message = SoapMessage::new(SoapVersion::Soap12).unwrap();
        let extra = message.document_mut().create_element("extra");
        let err = message.add_child(extra).unwrap_err();
        assert_eq!(err.fault_code(), Some("Sender"));
        assert_eq!(names(&mut message), ["Body"]);

        let mut message = SoapMessage::new(SoapVersion::Soap11).unwrap();
        let extra = message.document_mut().create_element("extra");
        message.add_child(extra).unwrap();
        assert_eq!(names(&mut message), ["Body", "extra"]);
    }

    #[test]
    fn test_duplicates_rejected() {
        let mut message = SoapMessage::new(SoapVersion::Soap11).unwrap();
        let err = message.create_body().unwrap_err();
        assert_eq!(err.fault_code(), Some("Client"));

        message.create_header().unwrap();
        assert!(message.create_header().is_err());
        assert_eq!(names(&mut message), ["Header", "Body"]);
    }

    #[test]
    fn test_has_fault() {
        for version in [SoapVersion::Soap11, SoapVersion::Soap12] {
            let fault = envelope_xml(version, "<s:Fault/>");
            assert!(SoapMessage::parse_str(&fault).unwrap().has_fault().unwrap());

            let other = envelope_xml(version, "<s:Other/>");
            assert!(!SoapMessage::parse_str(&other).unwrap().has_fault().unwrap());

            let plain = envelope_xml(version, "<Fault/>");
            assert!(!SoapMessage::parse_str(&plain).unwrap().has_fault().unwrap());

            let empty = envelope_xml(version, "");
            assert!(!SoapMessage::parse_str(&empty).unwrap().has_fault().unwrap());
        }
    }

    #[test]
    fn test_has_fault_reads_only_first_tag() {
        let src = envelope_xml(
            SoapVersion::Soap11,
            "<s:Fault><faultcode>s:Server</faultcode></s:Fault><after/>",
        );
        let mut message = SoapMessage::parse_str(&src).unwrap();
        assert!(message.has_fault().unwrap());

        let body = message.body().unwrap().unwrap();
        let doc = message.document();
        let fault = doc.view().first_child(body).unwrap();
        assert_eq!(doc.expansion(fault).unwrap(), Expansion::Untouched);
        assert_eq!(doc.view().next_sibling(fault), None);
    }

    #[test]
    fn test_has_fault_uses_hint() {
        let ns = SoapVersion::Soap12.namespace();
        let source = VecTokenSource::new(vec![
            Token::StartDocument,
            Token::start(QName::new(Some(ns), Some("s"), "Envelope")),
            Token::start(QName::new(Some(ns), Some("s"), "Body")),
        ])
        .with_body_hint(QName::new(Some(ns), Some("s"), "Fault"));

        let mut message = SoapMessage::from_source(source).unwrap();
        assert!(message.has_fault().unwrap());
        assert_eq!(message.document().view().first_child(message.envelope()), None);
    }

    #[test]
    fn test_hint_ignored_once_body_changes() {
        let ns = SoapVersion::Soap12.namespace();
        let source = VecTokenSource::new(vec![
            Token::StartDocument,
            Token::start(QName::new(Some(ns), Some("s"), "Envelope")),
            Token::start(QName::new(Some(ns), Some("s"), "Body")),
            Token::start(QName::new(Some(ns), Some("s"), "Fault")),
            Token::EndElement,
            Token::EndElement,
            Token::EndElement,
            Token::EndDocument,
        ])
        .with_body_hint(QName::new(Some(ns), Some("s"), "Fault"));

        let mut message = SoapMessage::from_source(source).unwrap();
        let body = message.body().unwrap().unwrap();
        let doc = message.document_mut();
        let fault = doc.first_element_child(body).unwrap().unwrap();
        doc.detach(fault).unwrap();
        let payload = doc.create_element("Payload");
        doc.append_child(body, payload).unwrap();
        assert!(doc.has_builder());

        assert!(!message.has_fault().unwrap());
        let name = message.body_first_element_name().unwrap().unwrap();
        assert_eq!(name.local_name(), "Payload");
    }

    #[test]
    fn test_version_mismatch() {
        let err = SoapMessage::parse_str(r#"<Envelope xmlns="urn:other"/>"#).unwrap_err();
        assert_eq!(err.fault_code(), Some(VERSION_MISMATCH_CODE));
    }

    #[test]
    fn test_streamed_header_after_body() {
        let ns = SoapVersion::Soap12.namespace();
        let src = format!(
            r#"<s:Envelope xmlns:s="{ns}"><s:Body><x>1</x></s:Body><s:Header/></s:Envelope>"#
        );
        let mut message = SoapMessage::parse_str(&src).unwrap();
        assert_eq!(names(&mut message), ["Header", "Body"]);
        assert_eq!(
            message.to_xml_string(true).unwrap(),
            format!(
                r#"<s:Envelope xmlns:s="{ns}"><s:Header/><s:Body><x>1</x></s:Body></s:Envelope>"#
            )
        );
    }

    #[test]
    fn test_parsed_soap12_rejects_extra_element() {
        let ns = SoapVersion::Soap12.namespace();
        let src = format!(r#"<s:Envelope xmlns:s="{ns}"><s:Body/><extra/></s:Envelope>"#);
        let mut message = SoapMessage::parse_str(&src).unwrap();
        assert!(message.body().unwrap().is_some());

        let envelope = message.envelope();
        let err = message.document_mut().children(envelope).unwrap_err();
        assert_eq!(err.fault_code(), Some("Sender"));

        let err = message.document_mut().children(envelope).unwrap_err();
        assert!(matches!(err.kind, XmlErrorKind::MalformedInput(_)));
    }

    #[test]
    fn test_body_position() {
        let ns = SoapVersion::Soap11.namespace();
        let header_only = format!(r#"<s:Envelope xmlns:s="{ns}"><s:Header/></s:Envelope>"#);
        let mut message = SoapMessage::parse_str(&header_only).unwrap();
        assert_eq!(message.body().unwrap(), None);

        let third = format!(r#"<s:Envelope xmlns:s="{ns}"><s:Header/><x/><s:Body/></s:Envelope>"#);
        let mut message = SoapMessage::parse_str(&third).unwrap();
        let err = message.body().unwrap_err();
        assert!(matches!(err.kind, XmlErrorKind::MalformedInput(_)));
    }

    #[test]
    fn test_create_fault() {
        let mut message = SoapMessage::new(SoapVersion::Soap11).unwrap();
        let code = message.version().sender_fault_code();
        message.create_fault(code, "bad request").unwrap();
        assert!(message.has_fault().unwrap());
        assert_eq!(
            message.to_xml_string(true).unwrap(),
            concat!(
                r#"<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/">"#,
                "<soapenv:Body><soapenv:Fault>",
                "<faultcode>soapenv:Client</faultcode><faultstring>bad request</faultstring>",
                "</soapenv:Fault></soapenv:Body></soapenv:Envelope>"
            )
        );

        let mut message = SoapMessage::new(SoapVersion::Soap12).unwrap();
        message.create_fault("Receiver", "oops").unwrap();
        let xml = message.to_xml_string(true).unwrap();
        assert!(xml.contains(
            "<soapenv:Code><soapenv:Value>soapenv:Receiver</soapenv:Value></soapenv:Code>"
        ));
        assert!(xml.contains(r#"<soapenv:Text xml:lang="en">oops</soapenv:Text>"#));
    }
}
