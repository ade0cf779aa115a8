//! Tree serialization
//!
//! A subtree is written in one of two modes, chosen per call:
//! - cached: every container is materialized first, and the tree stays traversable
//! - streaming: untouched elements are handed to the builder, which forwards their
//!   tokens straight to the writer without creating nodes
//!
//! Both modes emit exactly the same events for the same input.
use crate::{
    Document,
    arena::NodeId,
    error::{XmlErrorKind, XmlResult, bail},
    node::{Expansion, NodeKind, TextContent},
    writer::XmlWriter,
};

enum Task {
    /// Write a node
    Visit(NodeId),

    /// Write the children of `container` that follow `after`, or all of them
    Children {
        container: NodeId,
        after: Option<NodeId>,
    },

    /// Close the innermost open element
    Close,

    EndDocument,
}

/// Writes `node` and its subtree to `writer`.
///
/// # Errors
/// - `AlreadyConsumed` if the subtree contains an element that was streamed before
/// - `SourceClosed` if unexpanded content is needed after the source was closed
/// - expansion and writer errors
pub fn serialize(
    doc: &mut Document<'_>,
    node: NodeId,
    writer: &mut dyn XmlWriter,
    cache: bool,
) -> XmlResult<()> {
    if cache {
        doc.build_node(node)?;
    }
    tracing::debug!(cache, "serializing node {}", node.index());

    let mut stack = vec![Task::Visit(node)];
    while let Some(task) = stack.pop() {
        match task {
            Task::Visit(id) => {
                let expansion = doc.expansion(id)?;
                if matches!(doc.kind(id)?, NodeKind::Element(_)) {
                    match expansion {
                        Expansion::Consumed => bail!(XmlErrorKind::AlreadyConsumed),
                        Expansion::Untouched if !cache => {
                            doc.pass_through(id, writer)?;
                            continue;
                        }
                        _ => {}
                    }
                }

                match &doc.data(id).kind {
                    NodeKind::Document => {
                        writer.write_start_document()?;
                        stack.push(Task::EndDocument);
                        stack.push(Task::Children {
                            container: id,
                            after: None,
                        });
                    }

                    NodeKind::Element(element) => {
                        writer.write_start_element(
                            element.name(),
                            element.namespaces(),
                            element.attributes(),
                        )?;
                        stack.push(Task::Close);
                        stack.push(Task::Children {
                            container: id,
                            after: None,
                        });
                    }

                    NodeKind::Text(TextContent::Characters(text)) => writer.write_characters(text)?,
                    NodeKind::Text(TextContent::Binary { content_id, blob }) => {
                        writer.write_binary(content_id, blob)?;
                    }

                    NodeKind::Comment(text) => writer.write_comment(text)?,
                    NodeKind::ProcessingInstruction(pi) => {
                        writer.write_processing_instruction(pi.target(), pi.data())?;
                    }
                }
            }

            Task::Children { container, after } => {
                let next = match after {
                    None => doc.first_child(container)?,
                    Some(previous) => doc.next_sibling(previous)?,
                };

                if let Some(child) = next {
                    stack.push(Task::Children {
                        container,
                        after: Some(child),
                    });
                    stack.push(Task::Visit(child));
                }
            }

            Task::Close => writer.write_end_element()?,
            Task::EndDocument => writer.write_end_document()?,
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Blob, StreamWriter, Token, TokenCollector, VecTokenSource, WriterOptions};
    use std::sync::Arc;

    fn tokens() -> Vec<Token> {
        vec![
            Token::StartDocument,
            Token::start("root"),
            Token::start("a"),
            Token::text("one"),
            Token::text(" two"),
            Token::EndElement,
            Token::Comment("note".into()),
            Token::start("b"),
            Token::BinaryChunk {
                content_id: "bin".into(),
                bytes: b"hel".to_vec(),
            },
            Token::BinaryChunk {
                content_id: "bin".into(),
                bytes: b"lo".to_vec(),
            },
            Token::EndElement,
            Token::EndElement,
            Token::EndDocument,
        ]
    }

    fn write(doc: &mut Document<'_>, cache: bool) -> String {
        let mut writer = StreamWriter::new(Vec::new(), WriterOptions::default());
        doc.serialize(&mut writer, cache).unwrap();
        String::from_utf8(writer.into_inner()).unwrap()
    }

    #[test]
    fn test_modes_agree() {
        let cached = write(&mut Document::from_source(VecTokenSource::new(tokens())), true);
        let streamed = write(&mut Document::from_source(VecTokenSource::new(tokens())), false);

        assert_eq!(cached, "<root><a>one two</a><!--note--><b>aGVsbG8=</b></root>");
        assert_eq!(cached, streamed);
    }

    #[test]
    fn test_cached_document_stays_traversable() {
        let mut doc = Document::from_source(VecTokenSource::new(tokens()));
        let first = write(&mut doc, true);
        let second = write(&mut doc, true);
        assert_eq!(first, second);

        let root = doc.document_element().unwrap().unwrap();
        assert_eq!(doc.children(root).unwrap().len(), 3);
    }

    #[test]
    fn test_streaming_mixes_materialized_and_untouched() {
        let mut doc = Document::from_source(VecTokenSource::new(tokens()));
        let root = doc.document_element().unwrap().unwrap();
        let a = doc.first_child(root).unwrap().unwrap();
        assert_eq!(doc.expansion(a).unwrap(), Expansion::Untouched);

        // Materialize <a> only; <b> is still unread
        assert_eq!(doc.text_content(a).unwrap(), "one two");
        let streamed = write(&mut doc, false);
        assert_eq!(streamed, "<root><a>one two</a><!--note--><b>aGVsbG8=</b></root>");

        // The source is released after a streaming serialization
        assert!(!doc.has_builder());
    }

    #[test]
    fn test_streaming_twice_fails() {
        let mut doc = Document::from_source(VecTokenSource::new(tokens()));
        let root = doc.document_element().unwrap().unwrap();

        let mut collector = TokenCollector::new();
        doc.serialize_node(root, &mut collector, false).unwrap();
        assert_eq!(doc.expansion(root).unwrap(), Expansion::Consumed);

        let err = doc
            .serialize_node(root, &mut TokenCollector::new(), false)
            .unwrap_err();
        assert!(matches!(err.kind, XmlErrorKind::AlreadyConsumed));

        let err = doc.first_child(root).unwrap_err();
        assert!(matches!(err.kind, XmlErrorKind::AlreadyConsumed));
    }

    #[test]
    fn test_streamed_tokens_replay() {
        let mut doc = Document::from_source(VecTokenSource::new(tokens()));
        let mut collector = TokenCollector::new();
        doc.serialize(&mut collector, false).unwrap();

        let mut expected = tokens();
        expected[3] = Token::text("one two");
        expected.remove(4);
        expected[7] = Token::BinaryChunk {
            content_id: "bin".into(),
            bytes: b"hello".to_vec(),
        };
        expected.remove(8);
        assert_eq!(collector.into_tokens(), expected);
    }

    #[test]
    fn test_in_memory_tree() {
        let mut doc = Document::new();
        let root = doc.create_element("root");
        doc.append_child(doc.root(), root).unwrap();
        let text = doc.create_text("x & y");
        doc.append_child(root, text).unwrap();
        let blob = Arc::new(Blob::from_bytes(b"\x00\x01", 4));
        let bin = doc.create_binary_text("id", blob).unwrap();
        doc.append_child(root, bin).unwrap();
        let pi = doc.create_processing_instruction("target", Some("data"));
        doc.append_child(root, pi).unwrap();

        assert_eq!(
            doc.to_xml_string(true).unwrap(),
            "<root>x &amp; yAAE=<?target data?></root>"
        );
        assert_eq!(doc.to_xml_string(false).unwrap(), doc.to_xml_string(true).unwrap());
    }
}
