//! XML output
//!
//! [`XmlWriter`] is the event sink shared by the serializer and pass-through streaming.
//! [`StreamWriter`] formats events as XML text; [`TokenCollector`] records them as tokens.
use crate::{
    Blob,
    error::{XmlErrorKind, XmlResult, bail},
    node::{Attribute, Namespace, QName},
    token::Token,
};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use htmlentity::entity::ICodedDataTrait;
use htmlentity::entity::{CharacterSet, EncodeType, encode};
use std::{borrow::Cow, io::Write, sync::Arc};

/// Namespace of the XOP `Include` element used for optimized binary content.
pub const XOP_NAMESPACE: &str = "http://www.w3.org/2004/08/xop/include";

/// A sink for structural XML events.
///
/// Calls must be balanced: every `write_start_element` is matched by one
/// `write_end_element`.
pub trait XmlWriter {
    /// Begins the document.
    ///
    /// # Errors
    /// Returns an error if the output fails.
    fn write_start_document(&mut self) -> XmlResult<()>;

    /// Ends the document.
    ///
    /// # Errors
    /// Returns an error if elements are still open or the output fails.
    fn write_end_document(&mut self) -> XmlResult<()>;

    /// Opens an element.
    ///
    /// # Errors
    /// Returns an error if the output fails.
    fn write_start_element(
        &mut self,
        name: &QName,
        namespaces: &[Namespace],
        attributes: &[Attribute],
    ) -> XmlResult<()>;

    /// Closes the innermost open element.
    ///
    /// # Errors
    /// Returns an error if no element is open or the output fails.
    fn write_end_element(&mut self) -> XmlResult<()>;

    /// Writes character data.
    ///
    /// # Errors
    /// Returns an error if the output fails.
    fn write_characters(&mut self, text: &str) -> XmlResult<()>;

    /// Writes binary content.
    ///
    /// # Errors
    /// Returns an error if the blob is not committed or the output fails.
    fn write_binary(&mut self, content_id: &str, blob: &Arc<Blob>) -> XmlResult<()>;

    /// Writes a comment.
    ///
    /// # Errors
    /// Returns an error if the output fails.
    fn write_comment(&mut self, text: &str) -> XmlResult<()>;

    /// Writes a processing instruction.
    ///
    /// # Errors
    /// Returns an error if the output fails.
    fn write_processing_instruction(&mut self, target: &str, data: Option<&str>) -> XmlResult<()>;

    /// Flushes buffered output.
    ///
    /// # Errors
    /// Returns an error if the output fails.
    fn flush(&mut self) -> XmlResult<()>;

    /// Flushes and finishes the output.
    ///
    /// # Errors
    /// Returns an error if the output fails.
    fn close(&mut self) -> XmlResult<()> {
        self.flush()
    }
}

/// Options for [`StreamWriter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterOptions {
    /// Emit binary content as `xop:Include` references and keep the bytes as attachments,
    /// instead of inlining them as base64
    pub optimize_binary: bool,

    /// Emit an `<?xml ...?>` declaration at the start of the document
    pub xml_declaration: bool,

    /// Add the namespace declarations that element and attribute names need
    /// but that are not in scope
    pub repair_namespaces: bool,
}
impl WriterOptions {
    /// Enables or disables XOP output for binary content.
    #[must_use]
    pub fn with_optimize_binary(mut self, optimize: bool) -> Self {
        self.optimize_binary = optimize;
        self
    }

    /// Enables or disables the XML declaration.
    #[must_use]
    pub fn with_xml_declaration(mut self, declaration: bool) -> Self {
        self.xml_declaration = declaration;
        self
    }

    /// Enables or disables namespace repair.
    #[must_use]
    pub fn with_repair_namespaces(mut self, repair: bool) -> Self {
        self.repair_namespaces = repair;
        self
    }
}
impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            optimize_binary: false,
            xml_declaration: false,
            repair_namespaces: true,
        }
    }
}

/// Formats XML events as text into any [`std::io::Write`].
///
/// Empty elements are written as `<a/>`. Attachments collected in optimized
/// mode are available from [`StreamWriter::attachments`].
///
/// # Example
/// ```rust
/// use lazy_xmltree::{Document, StreamWriter, WriterOptions};
///
/// let mut doc = Document::parse_str("<a><b>x &amp; y</b><c/></a>");
/// let mut writer = StreamWriter::new(Vec::new(), WriterOptions::default());
/// doc.serialize(&mut writer, true).unwrap();
///
/// let xml = String::from_utf8(writer.into_inner()).unwrap();
/// assert_eq!(xml, "<a><b>x &amp; y</b><c/></a>");
/// ```
pub struct StreamWriter<W: Write> {
    inner: W,
    options: WriterOptions,

    /// Qualified names of the open elements
    open: Vec<String>,

    /// Namespace declarations in scope, one frame per open element
    scopes: Vec<Vec<Namespace>>,

    /// The last start tag is still missing its `>`
    start_pending: bool,
    generated_prefixes: usize,
    attachments: Vec<(String, Arc<Blob>)>,
}
impl<W: Write> StreamWriter<W> {
    /// Creates a writer over the given output.
    pub fn new(inner: W, options: WriterOptions) -> Self {
        Self {
            inner,
            options,
            open: vec![],
            scopes: vec![],
            start_pending: false,
            generated_prefixes: 0,
            attachments: vec![],
        }
    }

    /// Returns the options of the writer.
    pub fn options(&self) -> WriterOptions {
        self.options
    }

    /// Returns the attachments collected in optimized mode, in output order.
    pub fn attachments(&self) -> &[(String, Arc<Blob>)] {
        &self.attachments
    }

    /// Returns the underlying output.
    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    /// Consumes the writer, returning the underlying output.
    pub fn into_inner(self) -> W {
        self.inner
    }

    fn finish_start_tag(&mut self) -> XmlResult<()> {
        if self.start_pending {
            self.inner.write_all(b">")?;
            self.start_pending = false;
        }
        Ok(())
    }

    fn lookup<'a>(&'a self, frame: &'a [Namespace], prefix: Option<&str>) -> Option<&'a str> {
        if prefix == Some("xml") {
            return Some(crate::reader::XML_NAMESPACE);
        }

        frame
            .iter()
            .chain(self.scopes.iter().rev().flatten())
            .find(|ns| ns.prefix() == prefix)
            .map(Namespace::uri)
    }

    /// Adds the declarations `name` needs to `frame`, returning the prefix to write it with.
    fn repair(
        &mut self,
        frame: &mut Vec<Namespace>,
        name: &QName,
        is_attribute: bool,
    ) -> Option<String> {
        let Some(uri) = name.namespace() else {
            // Unqualified elements must not inherit a default namespace
            if !is_attribute
                && name.prefix().is_none()
                && self.lookup(frame, None).is_some_and(|uri| !uri.is_empty())
            {
                frame.push(Namespace::new(None, ""));
            }
            return name.prefix().map(ToString::to_string);
        };

        let mut prefix = name.prefix().map(ToString::to_string);
        if is_attribute && prefix.is_none() {
            // Unprefixed attributes are never in a namespace
            let existing = frame
                .iter()
                .chain(self.scopes.iter().rev().flatten())
                .find(|ns| ns.prefix().is_some() && ns.uri() == uri)
                .and_then(Namespace::prefix)
                .map(ToString::to_string);
            prefix = Some(existing.unwrap_or_else(|| {
                self.generated_prefixes += 1;
                format!("ns{}", self.generated_prefixes)
            }));
        }

        if self.lookup(frame, prefix.as_deref()) != Some(uri) {
            frame.retain(|ns| ns.prefix() != prefix.as_deref());
            frame.push(Namespace::new(prefix.as_deref(), uri));
        }
        prefix
    }

    fn write_attribute(&mut self, name: &str, value: &str) -> XmlResult<()> {
        let value = escape(value)?;
        write!(self.inner, r#" {name}="{value}""#)?;
        Ok(())
    }

    fn write_inline_binary(&mut self, blob: &Blob) -> XmlResult<()> {
        let mut carry: Vec<u8> = Vec::with_capacity(3);
        for chunk in blob.chunks()? {
            let mut chunk = chunk;
            if !carry.is_empty() {
                let n = (3 - carry.len()).min(chunk.len());
                carry.extend_from_slice(&chunk[..n]);
                chunk = &chunk[n..];
                if carry.len() < 3 {
                    continue;
                }
                self.inner.write_all(STANDARD.encode(&carry).as_bytes())?;
                carry.clear();
            }

            let whole = chunk.len() - chunk.len() % 3;
            if whole > 0 {
                self.inner
                    .write_all(STANDARD.encode(&chunk[..whole]).as_bytes())?;
            }
            carry.extend_from_slice(&chunk[whole..]);
        }

        if !carry.is_empty() {
            self.inner.write_all(STANDARD.encode(&carry).as_bytes())?;
        }
        Ok(())
    }
}
impl<W: Write> XmlWriter for StreamWriter<W> {
    fn write_start_document(&mut self) -> XmlResult<()> {
        if self.options.xml_declaration {
            self.inner
                .write_all(br#"<?xml version="1.0" encoding="UTF-8"?>"#)?;
        }
        Ok(())
    }

    fn write_end_document(&mut self) -> XmlResult<()> {
        if !self.open.is_empty() {
            bail!(XmlErrorKind::MalformedInput(format!(
                "end of document with {} open elements",
                self.open.len()
            )));
        }
        Ok(())
    }

    fn write_start_element(
        &mut self,
        name: &QName,
        namespaces: &[Namespace],
        attributes: &[Attribute],
    ) -> XmlResult<()> {
        self.finish_start_tag()?;

        let mut frame = namespaces.to_vec();
        let mut tag = name.to_string();
        let mut attribute_names = Vec::with_capacity(attributes.len());
        if self.options.repair_namespaces {
            let prefix = self.repair(&mut frame, name, false);
            tag = qualified(prefix.as_deref(), name.local_name());
            for attribute in attributes {
                let prefix = self.repair(&mut frame, attribute.name(), true);
                attribute_names.push(qualified(prefix.as_deref(), attribute.name().local_name()));
            }
        } else {
            attribute_names.extend(attributes.iter().map(|a| a.name().to_string()));
        }

        write!(self.inner, "<{tag}")?;
        for ns in &frame {
            match ns.prefix() {
                Some(prefix) => self.write_attribute(&format!("xmlns:{prefix}"), ns.uri())?,
                None => self.write_attribute("xmlns", ns.uri())?,
            }
        }
        for (attribute, name) in attributes.iter().zip(&attribute_names) {
            self.write_attribute(name, attribute.value())?;
        }

        self.start_pending = true;
        self.open.push(tag);
        self.scopes.push(frame);
        Ok(())
    }

    fn write_end_element(&mut self) -> XmlResult<()> {
        let Some(tag) = self.open.pop() else {
            bail!(XmlErrorKind::MalformedInput(
                "end tag written without an open element".into()
            ));
        };
        self.scopes.pop();

        if self.start_pending {
            self.start_pending = false;
            self.inner.write_all(b"/>")?;
        } else {
            write!(self.inner, "</{tag}>")?;
        }
        Ok(())
    }

    fn write_characters(&mut self, text: &str) -> XmlResult<()> {
        if text.is_empty() {
            return Ok(());
        }

        self.finish_start_tag()?;
        let text = escape(text)?;
        self.inner.write_all(text.as_bytes())?;
        Ok(())
    }

    fn write_binary(&mut self, content_id: &str, blob: &Arc<Blob>) -> XmlResult<()> {
        self.finish_start_tag()?;
        if self.options.optimize_binary {
            if !blob.is_committed() {
                bail!(XmlErrorKind::LifecycleViolation(
                    "cannot attach a blob before it is committed".into()
                ));
            }

            let href = escape(content_id)?;
            write!(
                self.inner,
                r#"<xop:Include xmlns:xop="{XOP_NAMESPACE}" href="cid:{href}"/>"#
            )?;
            self.attachments
                .push((content_id.to_string(), Arc::clone(blob)));
            tracing::trace!(content_id, "attachment referenced");
            Ok(())
        } else {
            self.write_inline_binary(blob)
        }
    }

    fn write_comment(&mut self, text: &str) -> XmlResult<()> {
        self.finish_start_tag()?;
        write!(self.inner, "<!--{text}-->")?;
        Ok(())
    }

    fn write_processing_instruction(&mut self, target: &str, data: Option<&str>) -> XmlResult<()> {
        self.finish_start_tag()?;
        match data {
            Some(data) => write!(self.inner, "<?{target} {data}?>")?,
            None => write!(self.inner, "<?{target}?>")?,
        }
        Ok(())
    }

    fn flush(&mut self) -> XmlResult<()> {
        self.inner.flush()?;
        Ok(())
    }
}

/// Records the events it receives as [`Token`]s, which can be replayed
/// through a [`VecTokenSource`](crate::VecTokenSource).
///
/// Adjacent character data is merged into one token, and each attachment
/// becomes a single [`Token::BinaryChunk`].
#[derive(Debug, Default)]
pub struct TokenCollector {
    tokens: Vec<Token>,
    depth: usize,
}
impl TokenCollector {
    /// Creates an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the tokens recorded so far.
    #[must_use]
    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    /// Consumes the collector, returning the recorded tokens.
    #[must_use]
    pub fn into_tokens(self) -> Vec<Token> {
        self.tokens
    }
}
impl XmlWriter for TokenCollector {
    fn write_start_document(&mut self) -> XmlResult<()> {
        self.tokens.push(Token::StartDocument);
        Ok(())
    }

    fn write_end_document(&mut self) -> XmlResult<()> {
        self.tokens.push(Token::EndDocument);
        Ok(())
    }

    fn write_start_element(
        &mut self,
        name: &QName,
        namespaces: &[Namespace],
        attributes: &[Attribute],
    ) -> XmlResult<()> {
        self.depth += 1;
        self.tokens.push(Token::StartElement {
            name: name.clone(),
            attributes: attributes.to_vec(),
            namespaces: namespaces.to_vec(),
        });
        Ok(())
    }

    fn write_end_element(&mut self) -> XmlResult<()> {
        if self.depth == 0 {
            bail!(XmlErrorKind::MalformedInput(
                "end tag written without an open element".into()
            ));
        }
        self.depth -= 1;
        self.tokens.push(Token::EndElement);
        Ok(())
    }

    fn write_characters(&mut self, text: &str) -> XmlResult<()> {
        if let Some(Token::Characters(existing)) = self.tokens.last_mut() {
            existing.push_str(text);
        } else {
            self.tokens.push(Token::Characters(text.to_string()));
        }
        Ok(())
    }

    fn write_binary(&mut self, content_id: &str, blob: &Arc<Blob>) -> XmlResult<()> {
        self.tokens.push(Token::BinaryChunk {
            content_id: content_id.to_string(),
            bytes: blob.to_vec()?,
        });
        Ok(())
    }

    fn write_comment(&mut self, text: &str) -> XmlResult<()> {
        self.tokens.push(Token::Comment(text.to_string()));
        Ok(())
    }

    fn write_processing_instruction(&mut self, target: &str, data: Option<&str>) -> XmlResult<()> {
        self.tokens.push(Token::ProcessingInstruction {
            target: target.to_string(),
            data: data.map(ToString::to_string),
        });
        Ok(())
    }

    fn flush(&mut self) -> XmlResult<()> {
        Ok(())
    }
}

fn qualified(prefix: Option<&str>, local: &str) -> String {
    match prefix {
        Some(prefix) => format!("{prefix}:{local}"),
        None => local.to_string(),
    }
}

/// Escapes markup characters for use in text or attribute values.
fn escape(input: &str) -> XmlResult<Cow<'_, str>> {
    if !input.contains(['<', '>', '&', '"', '\'']) {
        return Ok(Cow::Borrowed(input));
    }

    encode(
        input.as_bytes(),
        &EncodeType::Named,
        &CharacterSet::SpecialChars,
    )
    .to_string()
    .map(Cow::Owned)
    .map_err(|e| XmlErrorKind::Encoding(e.to_string()).into())
}
