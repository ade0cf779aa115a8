//! A [`TokenSource`] over XML text
//!
//! Tokenization is done by `xmlparser`; this module turns its low-level tokens
//! into structural [`Token`]s, resolving namespace prefixes and entity references.
use crate::{
    blob::DEFAULT_CHUNK_SIZE,
    error::{XmlErrorKind, XmlResult, bail},
    node::{Attribute, Namespace, QName},
    token::{Token, TokenSource},
    writer::XOP_NAMESPACE,
};
use htmlentity::entity::{ICodedDataTrait, decode};
use std::collections::{HashMap, VecDeque};
use xmlparser::{ElementEnd, StrSpan, Tokenizer};

/// Namespace bound to the reserved `xml` prefix.
pub const XML_NAMESPACE: &str = "http://www.w3.org/XML/1998/namespace";

/// Options for [`XmlReader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderOptions {
    /// Drop character data that consists only of whitespace
    pub skip_whitespace: bool,

    /// Size of the `BinaryChunk` tokens produced for attachments
    pub binary_chunk_size: usize,
}
impl ReaderOptions {
    /// Enables or disables dropping whitespace-only text.
    #[must_use]
    pub fn with_skip_whitespace(mut self, skip: bool) -> Self {
        self.skip_whitespace = skip;
        self
    }

    /// Sets the size of attachment chunks.
    #[must_use]
    pub fn with_binary_chunk_size(mut self, size: usize) -> Self {
        self.binary_chunk_size = size;
        self
    }
}
impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            skip_whitespace: false,
            binary_chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReaderState {
    Prolog,
    Dtd,
    TagAttributes,
    TagChildren,
    Epilog,
    Finished,
}

/// A start tag whose attributes are still being read.
struct StartTag<'a> {
    prefix: &'a str,
    local: &'a str,
    attributes: Vec<(&'a str, &'a str, StrSpan<'a>)>,
}

struct OpenTag<'a> {
    prefix: &'a str,
    local: &'a str,

    /// False for elements replaced by attachment content, and everything inside them
    emitted: bool,
}

/// Reads XML text as a stream of [`Token`]s.
///
/// - The XML declaration and any DTD are skipped
/// - CDATA sections become character data
/// - Entity references in text and attribute values are decoded
/// - Namespace declarations are reported on their element, not as attributes
///
/// When attachments are supplied with [`XmlReader::with_attachments`], every
/// `xop:Include` element referring to one of them by `cid:` is replaced with
/// its content, as [`Token::BinaryChunk`]s.
///
/// # Example
/// ```rust
/// use lazy_xmltree::{Token, TokenSource, XmlReader};
///
/// let mut reader = XmlReader::new(r#"<a xmlns="urn:x">1 &lt; 2</a>"#);
/// assert_eq!(reader.next_token().unwrap(), Some(Token::StartDocument));
///
/// let Some(Token::StartElement { name, namespaces, .. }) = reader.next_token().unwrap() else {
///     panic!("expected a start tag");
/// };
/// assert_eq!(name.namespace(), Some("urn:x"));
/// assert_eq!(namespaces.len(), 1);
/// assert_eq!(reader.next_token().unwrap(), Some(Token::text("1 < 2")));
/// ```
pub struct XmlReader<'a> {
    tokenizer: Tokenizer<'a>,
    options: ReaderOptions,
    attachments: Option<HashMap<String, Vec<u8>>>,

    state: ReaderState,
    started: bool,
    closed: bool,
    pending: VecDeque<Token>,

    start: Option<StartTag<'a>>,
    open: Vec<OpenTag<'a>>,

    /// Namespace declarations, one frame per open element
    scopes: Vec<Vec<Namespace>>,
}
impl<'a> XmlReader<'a> {
    /// Creates a reader over the given text.
    #[must_use]
    pub fn new(src: &'a str) -> Self {
        Self {
            tokenizer: Tokenizer::from(src),
            options: ReaderOptions::default(),
            attachments: None,
            state: ReaderState::Prolog,
            started: false,
            closed: false,
            pending: VecDeque::new(),
            start: None,
            open: vec![],
            scopes: vec![],
        }
    }

    /// Replaces the options of the reader.
    #[must_use]
    pub fn with_options(mut self, options: ReaderOptions) -> Self {
        self.options = options;
        self
    }

    /// Supplies attachment content by content id, without the `cid:` scheme.
    #[must_use]
    pub fn with_attachments(mut self, attachments: HashMap<String, Vec<u8>>) -> Self {
        self.attachments = Some(attachments);
        self
    }

    /// Reads one tokenizer token, queueing the structural tokens it produces.
    fn advance(&mut self) -> XmlResult<()> {
        let Some(next) = self.tokenizer.next() else {
            return self.finish();
        };
        let next = match next {
            Ok(next) => next,
            Err(e) => {
                self.state = ReaderState::Finished;
                self.pending.clear();
                bail!(XmlErrorKind::MalformedInput(e.to_string()));
            }
        };

        match self.state {
            ReaderState::Prolog | ReaderState::Epilog => match next {
                xmlparser::Token::ElementStart { prefix, local, .. }
                    if self.state == ReaderState::Prolog =>
                {
                    self.begin_tag(prefix, local);
                }

                xmlparser::Token::Declaration { .. } => {}

                xmlparser::Token::EmptyDtd { .. } => {}
                xmlparser::Token::DtdStart { .. } => self.state = ReaderState::Dtd,

                xmlparser::Token::Comment { text, .. } => {
                    self.pending.push_back(Token::Comment(text.as_str().to_string()));
                }

                xmlparser::Token::ProcessingInstruction {
                    target, content, ..
                } => self.push_pi(target, content),

                xmlparser::Token::Text { text } if text.as_str().trim().is_empty() => {}

                _ => {
                    let section = if self.state == ReaderState::Prolog {
                        "before"
                    } else {
                        "after"
                    };
                    bail!(
                        msg = "Unexpected {} {section} the document element",
                        describe(&next)
                    );
                }
            },

            ReaderState::Dtd => {
                if let xmlparser::Token::DtdEnd { .. } = next {
                    self.state = ReaderState::Prolog;
                }
            }

            ReaderState::TagAttributes => match next {
                xmlparser::Token::Attribute {
                    prefix,
                    local,
                    value,
                    ..
                } => {
                    let Some(tag) = self.start.as_mut() else {
                        bail!(msg = "Attribute outside of a start tag");
                    };
                    tag.attributes
                        .push((prefix.as_str(), local.as_str(), value));
                }

                xmlparser::Token::ElementEnd {
                    end: ElementEnd::Open,
                    ..
                } => {
                    self.open_tag(false)?;
                    self.state = ReaderState::TagChildren;
                }

                xmlparser::Token::ElementEnd {
                    end: ElementEnd::Empty,
                    ..
                } => {
                    self.open_tag(true)?;
                    self.close_tag(None)?;
                }

                _ => bail!(msg = "Unexpected {} in tag attributes", describe(&next)),
            },

            ReaderState::TagChildren => match next {
                xmlparser::Token::ElementStart { prefix, local, .. } => {
                    self.begin_tag(prefix, local);
                }

                xmlparser::Token::ElementEnd {
                    end: ElementEnd::Close(prefix, local),
                    ..
                } => self.close_tag(Some((prefix.as_str(), local.as_str())))?,

                xmlparser::Token::Text { text } => {
                    if self.emitting() {
                        let text = decode_entities(text.as_str())?;
                        if !(self.options.skip_whitespace && text.trim().is_empty()) {
                            self.pending.push_back(Token::Characters(text));
                        }
                    }
                }

                xmlparser::Token::Cdata { text, .. } => {
                    if self.emitting() {
                        self.pending
                            .push_back(Token::Characters(text.as_str().to_string()));
                    }
                }

                xmlparser::Token::Comment { text, .. } => {
                    if self.emitting() {
                        self.pending.push_back(Token::Comment(text.as_str().to_string()));
                    }
                }

                xmlparser::Token::ProcessingInstruction {
                    target, content, ..
                } => {
                    if self.emitting() {
                        self.push_pi(target, content);
                    }
                }

                _ => bail!(msg = "Unexpected {} inside tag", describe(&next)),
            },

            ReaderState::Finished => {}
        }

        Ok(())
    }

    fn finish(&mut self) -> XmlResult<()> {
        match self.state {
            ReaderState::Epilog => {
                self.state = ReaderState::Finished;
                self.pending.push_back(Token::EndDocument);
                Ok(())
            }
            ReaderState::Finished => Ok(()),
            ReaderState::Prolog | ReaderState::Dtd => {
                self.state = ReaderState::Finished;
                bail!(msg = "Unexpected end of input before the document element")
            }
            ReaderState::TagAttributes | ReaderState::TagChildren => {
                self.state = ReaderState::Finished;
                let name = match (&self.start, self.open.last()) {
                    (Some(tag), _) => qualified(tag.prefix, tag.local),
                    (None, Some(tag)) => qualified(tag.prefix, tag.local),
                    (None, None) => String::new(),
                };
                bail!(msg = "Unexpected end of input; unclosed tag <{name}>")
            }
        }
    }

    fn emitting(&self) -> bool {
        self.open.last().is_none_or(|tag| tag.emitted)
    }

    fn begin_tag(&mut self, prefix: StrSpan<'a>, local: StrSpan<'a>) {
        self.start = Some(StartTag {
            prefix: prefix.as_str(),
            local: local.as_str(),
            attributes: vec![],
        });
        self.state = ReaderState::TagAttributes;
    }

    /// Completes the pending start tag.
    fn open_tag(&mut self, empty: bool) -> XmlResult<()> {
        let Some(tag) = self.start.take() else {
            bail!(msg = "End of a start tag that was never opened");
        };

        let mut frame = vec![];
        let mut raw = vec![];
        for (prefix, local, value) in tag.attributes {
            let value = decode_entities(value.as_str())?;
            match (prefix, local) {
                ("", "xmlns") => frame.push(Namespace::new(None, value)),
                ("xmlns", prefix) => frame.push(Namespace::new(Some(prefix), value)),
                _ => raw.push((prefix, local, value)),
            }
        }
        self.scopes.push(frame.clone());

        let name = self.resolve(tag.prefix, tag.local, true)?;
        let mut attributes = Vec::with_capacity(raw.len());
        for (prefix, local, value) in raw {
            attributes.push(Attribute::new(self.resolve(prefix, local, false)?, value));
        }

        let mut emitted = self.emitting();
        if emitted && name.equals(Some(XOP_NAMESPACE), "Include") && self.attachments.is_some() {
            self.push_attachment(&attributes)?;
            emitted = false;
        }

        if emitted {
            self.pending.push_back(Token::StartElement {
                name,
                attributes,
                namespaces: frame,
            });
        }

        self.open.push(OpenTag {
            prefix: tag.prefix,
            local: tag.local,
            emitted,
        });
        if empty {
            self.state = ReaderState::TagChildren;
        }
        Ok(())
    }

    /// Closes the innermost open tag, checking its name for explicit end tags.
    fn close_tag(&mut self, name: Option<(&str, &str)>) -> XmlResult<()> {
        let Some(tag) = self.open.pop() else {
            bail!(msg = "End tag without a matching start tag");
        };
        if let Some((prefix, local)) = name {
            if (prefix, local) != (tag.prefix, tag.local) {
                bail!(
                    msg = "Mismatched end tag </{}>; expected </{}>",
                    qualified(prefix, local),
                    qualified(tag.prefix, tag.local)
                );
            }
        }

        self.scopes.pop();
        if tag.emitted {
            self.pending.push_back(Token::EndElement);
        }
        if self.open.is_empty() {
            self.state = ReaderState::Epilog;
        }
        Ok(())
    }

    fn push_attachment(&mut self, attributes: &[Attribute]) -> XmlResult<()> {
        let Some(href) = attributes
            .iter()
            .find(|a| a.name().equals(None, "href"))
            .map(Attribute::value)
        else {
            bail!(msg = "xop:Include without an href attribute");
        };
        let Some(content_id) = href.strip_prefix("cid:") else {
            bail!(msg = "xop:Include href `{href}` is not a cid: reference");
        };
        let Some(bytes) = self.attachments.as_ref().and_then(|a| a.get(content_id)) else {
            bail!(msg = "Unknown attachment `{content_id}`");
        };

        tracing::trace!(content_id, length = bytes.len(), "resolving attachment");
        if bytes.is_empty() {
            self.pending.push_back(Token::BinaryChunk {
                content_id: content_id.to_string(),
                bytes: vec![],
            });
        }
        for chunk in bytes.chunks(self.options.binary_chunk_size.max(1)) {
            self.pending.push_back(Token::BinaryChunk {
                content_id: content_id.to_string(),
                bytes: chunk.to_vec(),
            });
        }
        Ok(())
    }

    fn push_pi(&mut self, target: StrSpan<'a>, content: Option<StrSpan<'a>>) {
        self.pending.push_back(Token::ProcessingInstruction {
            target: target.as_str().to_string(),
            data: content.map(|c| c.as_str().to_string()),
        });
    }

    /// Resolves a prefix against the namespace declarations in scope.
    fn resolve(&self, prefix: &str, local: &str, is_element: bool) -> XmlResult<QName> {
        if prefix.is_empty() {
            // Unprefixed attributes are never in a namespace
            let namespace = if is_element { self.lookup(None) } else { None };
            return Ok(QName::new(namespace, None, local));
        }

        match self.lookup(Some(prefix)) {
            Some(uri) => Ok(QName::new(Some(uri), Some(prefix), local)),
            None => bail!(msg = "Unbound namespace prefix `{prefix}` on `{prefix}:{local}`"),
        }
    }

    fn lookup(&self, prefix: Option<&str>) -> Option<&str> {
        if prefix == Some("xml") {
            return Some(XML_NAMESPACE);
        }

        self.scopes
            .iter()
            .rev()
            .flatten()
            .find(|ns| ns.prefix() == prefix)
            .map(Namespace::uri)
            .filter(|uri| !uri.is_empty())
    }
}
impl TokenSource for XmlReader<'_> {
    fn next_token(&mut self) -> XmlResult<Option<Token>> {
        if self.closed {
            bail!(XmlErrorKind::SourceClosed);
        }

        loop {
            if let Some(token) = self.pending.pop_front() {
                return Ok(Some(token));
            }
            if !self.started {
                self.started = true;
                return Ok(Some(Token::StartDocument));
            }
            if self.state == ReaderState::Finished {
                return Ok(None);
            }

            self.advance()?;
        }
    }

    fn close(&mut self) {
        self.closed = true;
        self.pending.clear();
        self.state = ReaderState::Finished;
    }
}
impl std::fmt::Debug for XmlReader<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XmlReader")
            .field("options", &self.options)
            .field("state", &self.state)
            .field("depth", &self.open.len())
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

fn qualified(prefix: &str, local: &str) -> String {
    if prefix.is_empty() {
        local.to_string()
    } else {
        format!("{prefix}:{local}")
    }
}

/// Decodes the predefined XML entities and character references.
/// Any other entity reference is rejected, as no DTD declares it.
fn decode_entities(input: &str) -> XmlResult<String> {
    if !input.contains('&') {
        return Ok(input.to_string());
    }

    for (start, _) in input.match_indices('&') {
        let rest = &input[start + 1..];
        let Some(end) = rest.find(';') else {
            bail!(msg = "Unterminated entity reference in `{input}`");
        };
        if !is_xml_reference(&rest[..end]) {
            bail!(msg = "Undeclared entity `&{};`", &rest[..end]);
        }
    }

    decode(input.as_bytes())
        .to_string()
        .map_err(|e| XmlErrorKind::Encoding(e.to_string()).into())
}

fn is_xml_reference(name: &str) -> bool {
    let code = if let Some(hex) = name.strip_prefix("#x") {
        u32::from_str_radix(hex, 16).ok()
    } else if let Some(decimal) = name.strip_prefix('#') {
        decimal.parse::<u32>().ok()
    } else {
        return matches!(name, "amp" | "lt" | "gt" | "quot" | "apos");
    };
    code.and_then(char::from_u32).is_some_and(|c| c != '\0')
}

/// A short name for a tokenizer token, for diagnostics.
fn describe(token: &xmlparser::Token<'_>) -> &'static str {
    match token {
        xmlparser::Token::Declaration { .. } => "declaration",
        xmlparser::Token::ProcessingInstruction { .. } => "processing instruction",
        xmlparser::Token::Comment { .. } => "comment",
        xmlparser::Token::DtdStart { .. }
        | xmlparser::Token::EmptyDtd { .. }
        | xmlparser::Token::EntityDeclaration { .. }
        | xmlparser::Token::DtdEnd { .. } => "DTD",
        xmlparser::Token::ElementStart { .. } => "start tag",
        xmlparser::Token::Attribute { .. } => "attribute",
        xmlparser::Token::ElementEnd { .. } => "end tag",
        xmlparser::Token::Text { .. } => "text",
        xmlparser::Token::Cdata { .. } => "CDATA section",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(reader: &mut XmlReader<'_>) -> XmlResult<Vec<Token>> {
        let mut out = vec![];
        while let Some(token) = reader.next_token()? {
            out.push(token);
        }
        Ok(out)
    }

    #[test]
    fn test_structure() {
        let src = r#"<?xml version="1.0"?>
            <!DOCTYPE root [<!ENTITY e "x">]>
            <!-- before -->
            <root id="1"><a/><![CDATA[<raw>]]><?pi data?></root>"#;
        let mut reader = XmlReader::new(src);

        assert_eq!(
            tokens(&mut reader).unwrap(),
            vec![
                Token::StartDocument,
                Token::Comment(" before ".into()),
                Token::StartElement {
                    name: QName::local("root"),
                    attributes: vec![Attribute::new("id", "1")],
                    namespaces: vec![],
                },
                Token::start("a"),
                Token::EndElement,
                Token::text("<raw>"),
                Token::ProcessingInstruction {
                    target: "pi".into(),
                    data: Some("data".into())
                },
                Token::EndElement,
                Token::EndDocument,
            ]
        );
    }

    #[test]
    fn test_namespaces() {
        let src = concat!(
            r#"<s:a xmlns:s="urn:s" xmlns="urn:d">"#,
            r#"<b s:flag="1" plain="2"/><c xmlns=""/></s:a>"#,
        );
        let all = tokens(&mut XmlReader::new(src)).unwrap();

        let Token::StartElement {
            name, namespaces, ..
        } = &all[1]
        else {
            panic!("expected a start tag");
        };
        assert!(name.equals(Some("urn:s"), "a"));
        assert_eq!(name.prefix(), Some("s"));
        assert_eq!(namespaces.len(), 2);

        let Token::StartElement {
            name, attributes, ..
        } = &all[2]
        else {
            panic!("expected a start tag");
        };
        assert!(name.equals(Some("urn:d"), "b"));
        assert!(attributes[0].name().equals(Some("urn:s"), "flag"));
        assert!(attributes[1].name().equals(None, "plain"));

        let Token::StartElement { name, .. } = &all[4] else {
            panic!("expected a start tag");
        };
        assert!(name.equals(None, "c"));
    }

    #[test]
    fn test_unbound_prefix() {
        let err = tokens(&mut XmlReader::new("<x:a/>")).unwrap_err();
        assert!(matches!(err.kind, XmlErrorKind::MalformedInput(_)));
    }

    #[test]
    fn test_mismatched_end_tag() {
        let err = tokens(&mut XmlReader::new("<a><b></a></b>")).unwrap_err();
        assert!(matches!(err.kind, XmlErrorKind::MalformedInput(_)));
    }

    #[test]
    fn test_unclosed_tag() {
        let err = tokens(&mut XmlReader::new("<a><b>")).unwrap_err();
        assert!(matches!(err.kind, XmlErrorKind::MalformedInput(_)));
    }

    #[test]
    fn test_entities_decoded() {
        let src = r#"<a v="&quot;x&quot;">&lt;&amp;&#65;</a>"#;
        let all = tokens(&mut XmlReader::new(src)).unwrap();
        assert_eq!(
            all[1],
            Token::StartElement {
                name: QName::local("a"),
                attributes: vec![Attribute::new("v", "\"x\"")],
                namespaces: vec![],
            }
        );
        assert_eq!(all[2], Token::text("<&A"));
    }

    #[test]
    fn test_only_xml_entities_decoded() {
        let all = tokens(&mut XmlReader::new("<a>&#65;&#x42;&apos;</a>")).unwrap();
        assert_eq!(all[2], Token::text("AB'"));

        for src in ["<a>&nbsp;</a>", r#"<a v="&copy;"/>"#, "<a>&#0;</a>", "<a>&amp</a>"] {
            let err = tokens(&mut XmlReader::new(src)).unwrap_err();
            assert!(matches!(err.kind, XmlErrorKind::MalformedInput(_)), "{src}");
        }
    }

    #[test]
    fn test_tokenizer_error_is_malformed() {
        let mut reader = XmlReader::new("<a b></a>");
        let err = tokens(&mut reader).unwrap_err();
        assert!(matches!(err.kind, XmlErrorKind::MalformedInput(_)));
        assert!(reader.next_token().unwrap().is_none());
    }

    #[test]
    fn test_skip_whitespace() {
        let options = ReaderOptions::default().with_skip_whitespace(true);
        let all = tokens(&mut XmlReader::new("<a>\n  <b/>\n</a>").with_options(options)).unwrap();
        assert_eq!(all.len(), 6);

        let all = tokens(&mut XmlReader::new("<a>\n  <b/>\n</a>")).unwrap();
        assert_eq!(all.len(), 8);
    }

    #[test]
    fn test_xop_include() {
        let src = concat!(
            r#"<data><xop:Include xmlns:xop="http://www.w3.org/2004/08/xop/include""#,
            r#" href="cid:part"/></data>"#,
        );
        let attachments = HashMap::from([("part".to_string(), b"abcdefg".to_vec())]);
        let options = ReaderOptions::default().with_binary_chunk_size(3);
        let mut reader = XmlReader::new(src)
            .with_options(options)
            .with_attachments(attachments);

        let all = tokens(&mut reader).unwrap();
        let chunks: Vec<&[u8]> = all
            .iter()
            .filter_map(|t| match t {
                Token::BinaryChunk { content_id, bytes } if content_id == "part" => {
                    Some(bytes.as_slice())
                }
                _ => None,
            })
            .collect();
        assert_eq!(chunks, vec![&b"abc"[..], &b"def"[..], &b"g"[..]]);
        assert_eq!(all.len(), 7);
    }

    #[test]
    fn test_xop_unknown_attachment() {
        let src = concat!(
            r#"<data><xop:Include xmlns:xop="http://www.w3.org/2004/08/xop/include""#,
            r#" href="cid:missing"/></data>"#,
        );
        let mut reader = XmlReader::new(src).with_attachments(HashMap::new());
        let err = tokens(&mut reader).unwrap_err();
        assert!(matches!(err.kind, XmlErrorKind::MalformedInput(_)));
    }

    #[test]
    fn test_close() {
        let mut reader = XmlReader::new("<a/>");
        reader.next_token().unwrap();
        reader.close();
        let err = reader.next_token().unwrap_err();
        assert!(matches!(err.kind, XmlErrorKind::SourceClosed));
    }
}
