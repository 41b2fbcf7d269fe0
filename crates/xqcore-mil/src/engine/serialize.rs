//! Result printing: XML for nodes, canonical lexical forms for atomic values.
use quick_xml::Writer;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};

use super::store::{NodeKind, NodeRef, Store};
use super::{ExecError, Item};

fn xml_err(e: impl std::fmt::Display) -> ExecError {
    ExecError::internal(format!("serialization failed: {e}"))
}

fn write_node(writer: &mut Writer<Vec<u8>>, store: &Store, n: NodeRef) -> Result<(), ExecError> {
    match store.kind(n) {
        Some(NodeKind::Document) => {
            for c in store.children(n) {
                write_node(writer, store, *c)?;
            }
        }
        Some(NodeKind::Text) => {
            writer.write_event(Event::Text(BytesText::new(store.value(n)))).map_err(xml_err)?;
        }
        Some(NodeKind::Attribute) => {
            let name = store.name(n).map(|q| q.to_string()).unwrap_or_default();
            let escaped = quick_xml::escape::escape(store.value(n));
            writer
                .write_event(Event::Text(BytesText::from_escaped(format!("{name}=\"{escaped}\""))))
                .map_err(xml_err)?;
        }
        Some(NodeKind::Element) => {
            let name = store.name(n).map(|q| q.to_string()).unwrap_or_default();
            let mut start = BytesStart::new(name.as_str());
            for a in store.attributes(n) {
                let an = store.name(*a).map(|q| q.to_string()).unwrap_or_default();
                start.push_attribute((an.as_str(), store.value(*a)));
            }
            if store.children(n).is_empty() {
                writer.write_event(Event::Empty(start)).map_err(xml_err)?;
            } else {
                writer.write_event(Event::Start(start)).map_err(xml_err)?;
                for c in store.children(n) {
                    write_node(writer, store, *c)?;
                }
                writer.write_event(Event::End(BytesEnd::new(name.as_str()))).map_err(xml_err)?;
            }
        }
        None => return Err(ExecError::internal(format!("dangling node reference {}", n.0))),
    }
    Ok(())
}

/// Serialize one result sequence; adjacent atomic values are separated by a space.
pub fn serialize(store: &Store, items: &[Item]) -> Result<String, ExecError> {
    let mut writer = Writer::new(Vec::new());
    let mut prev_atomic = false;
    for item in items {
        match item {
            Item::Node(n) => {
                write_node(&mut writer, store, *n)?;
                prev_atomic = false;
            }
            atomic => {
                if prev_atomic {
                    writer.write_event(Event::Text(BytesText::new(" "))).map_err(xml_err)?;
                }
                writer.write_event(Event::Text(BytesText::new(&atomic.to_text(store)))).map_err(xml_err)?;
                prev_atomic = true;
            }
        }
    }
    String::from_utf8(writer.into_inner()).map_err(xml_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::store::{doc, elem, text};

    #[test]
    fn elements_and_atoms() {
        let mut store = Store::new();
        let d = store.load("a.xml", doc().child(elem("a").attr("k", "x<y").child(text("1 & 2")).child(elem("b"))));
        let root = store.children(d)[0];
        let out = serialize(&store, &[Item::Int(1), Item::Str("two".into()), Item::Node(root)]);
        assert_eq!(out.ok().as_deref(), Some("1 two<a k=\"x&lt;y\">1 &amp; 2<b/></a>"));
    }
}
