//! Node tree queries and projections

use serde_json::json;

use soap_stream::node::ROOT_NODE_NAME;
use soap_stream::{SoapError, node_tree_from_data};

use crate::common::test_helpers::items_response;

#[test]
fn test_dictionary_projection() {
    let xml = r#"<Item id="7"><name>Pen</name><price currency="EUR">2.5</price><note/></Item>"#;
    let tree = node_tree_from_data(xml.as_bytes()).unwrap();
    let item = tree.root().children().next().unwrap();

    let dictionary = item.to_dictionary().unwrap();
    assert_eq!(
        serde_json::Value::Object(dictionary),
        json!({
            "@id": "7",
            "name": "Pen",
            "price": { "@currency": "EUR", "#text": "2.5" },
            "note": ""
        })
    );
}

#[test]
fn test_repeated_siblings_are_not_projectable() {
    let tree = node_tree_from_data(items_response(2).as_bytes()).unwrap();
    let result = tree
        .root()
        .search_node_by_name("GetItemsResult")
        .unwrap()
        .to_dictionary();

    match result {
        Err(SoapError::NotProjectable { name }) => assert_eq!(name, "item"),
        other => panic!("expected NotProjectable, got {:?}", other),
    }

    // A single item still projects
    let item = tree.root().search_node_by_name("item").unwrap();
    assert!(item.to_dictionary().is_ok());
}

#[test]
fn test_first_nonsingle_parent_skips_wrappers() {
    let tree = node_tree_from_data(items_response(3).as_bytes()).unwrap();
    let list = tree.root().first_nonsingle_parent().unwrap();
    assert_eq!(list.name(), "GetItemsResult");
    assert_eq!(list.child_count(), 3);

    let chain = node_tree_from_data(b"<a><b><c/></b></a>").unwrap();
    assert!(chain.root().first_nonsingle_parent().is_none());
}

#[test]
fn test_queries_and_parent_links() {
    let tree = node_tree_from_data(items_response(4).as_bytes()).unwrap();
    let root = tree.root();

    assert_eq!(root.name(), ROOT_NODE_NAME);
    assert!(root.parent().is_none());
    assert_eq!(root.count_of_nodes_by_name("item"), 4);
    assert_eq!(root.count_of_nodes_by_name("missing"), 0);

    let price = root.search_node_by_name("price").unwrap();
    assert_eq!(price.value(), "0.50");
    assert_eq!(price.parent().unwrap().attribute("id"), Some("0"));
    assert_eq!(price.root_node().id(), root.id());

    for node in root.descendants().skip(1) {
        let parent = node.parent().expect("every non-root node has a parent");
        assert!(parent.children().any(|child| child.id() == node.id()));
    }
}

#[test]
fn test_extracted_subtree_is_standalone() {
    let tree = node_tree_from_data(items_response(2).as_bytes()).unwrap();
    let second = tree
        .root()
        .descendants()
        .filter(|node| node.name() == "item")
        .nth(1)
        .unwrap();

    let unit = tree.extract_subtree(second.id());
    let element = unit.root().children().next().unwrap();
    assert_eq!(unit.root().child_count(), 1);
    assert_eq!(element.parent().unwrap().name(), ROOT_NODE_NAME);
    assert_eq!(element.attribute("id"), Some("1"));
    assert_eq!(unit.node_count(), 4);
    assert!(unit.tree_data().is_none());

    assert_eq!(
        unit.root().to_xml_string(),
        r#"<item id="1"><name>item-1</name><price>1.50</price></item>"#
    );
}

#[test]
fn test_xml_string_escapes_text() {
    let tree = node_tree_from_data(br#"<a note="&quot;x&quot;">1 &lt; 2 &amp; 3</a>"#).unwrap();
    let a = tree.root().children().next().unwrap();
    assert_eq!(a.value(), "1 < 2 & 3");
    assert_eq!(a.attribute("note"), Some("\"x\""));
    assert_eq!(
        tree.root().to_xml_string(),
        r#"<a note="&quot;x&quot;">1 &lt; 2 &amp; 3</a>"#
    );
}
