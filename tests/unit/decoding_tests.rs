//! Incremental decoding of fragmented SOAP responses

use soap_stream::{ExtractingDecoder, Extraction, SoapError, TagSets, node_tree_from_data};

use crate::common::mocks::split;
use crate::common::test_helpers::{items_response, soap_response};

fn tags() -> TagSets {
    TagSets {
        unit_tags: vec!["item".to_string()],
        streaming_tags: vec!["log".to_string()],
        ordered_special_tags: vec!["status".to_string()],
    }
}

fn document() -> String {
    let items = items_response(3);
    let body_end = items.find("</soap:Body>").unwrap();
    format!(
        "{}<status>ok</status><log>first &amp; second line</log>{}",
        &items[..body_end],
        &items[body_end..]
    )
}

/// Decode `data` in fragments of `size` bytes, joining streaming chunks per tag
fn decode(data: &[u8], size: usize) -> (Vec<Extraction>, soap_stream::NodeTree) {
    let mut decoder = ExtractingDecoder::new(&tags());
    let mut events = Vec::new();
    for fragment in split(data, size) {
        events.extend(decoder.feed(&fragment).unwrap());
    }
    let (tree, last) = decoder.finish().unwrap();
    events.extend(last);
    (coalesce(events), tree)
}

fn coalesce(events: Vec<Extraction>) -> Vec<Extraction> {
    let mut out: Vec<Extraction> = Vec::new();
    for event in events {
        if let (
            Some(Extraction::Content {
                text: previous,
                tag: previous_tag,
                last_chunk: false,
            }),
            Extraction::Content {
                text,
                tag,
                last_chunk,
            },
        ) = (out.last_mut(), &event)
        {
            if *previous_tag == *tag {
                previous.push_str(text);
                if *last_chunk {
                    let joined = previous.clone();
                    out.pop();
                    out.push(Extraction::Content {
                        text: joined,
                        tag: tag.clone(),
                        last_chunk: true,
                    });
                }
                continue;
            }
        }
        out.push(event);
    }
    out
}

#[test]
fn test_fragment_size_does_not_change_the_result() {
    let xml = document();
    let (expected_events, expected_tree) = decode(xml.as_bytes(), xml.len());

    assert_eq!(
        expected_tree,
        node_tree_from_data(xml.as_bytes()).unwrap()
    );

    for size in [1, 2, 3, 7, 16, 61] {
        let (events, tree) = decode(xml.as_bytes(), size);
        assert_eq!(tree, expected_tree, "tree differs at fragment size {size}");
        assert_eq!(events, expected_events, "events differ at fragment size {size}");
    }
}

#[test]
fn test_extraction_order_matches_close_order() {
    let xml = document();
    let (events, _) = decode(xml.as_bytes(), 5);

    let kinds: Vec<String> = events
        .iter()
        .map(|event| match event {
            Extraction::Unit(unit) => {
                let item = unit.root().children().next().unwrap();
                format!("unit:{}", item.attribute("id").unwrap_or_default())
            }
            Extraction::OrderedTag { tag, .. } => format!("ordered:{tag}"),
            Extraction::Content {
                text, last_chunk, ..
            } => format!("content:{text}:{last_chunk}"),
        })
        .collect();

    assert_eq!(
        kinds,
        vec![
            "unit:0",
            "unit:1",
            "unit:2",
            "ordered:status",
            "content:first & second line:true",
        ]
    );
}

#[test]
fn test_streaming_text_around_nested_tags_keeps_its_place() {
    let xml = soap_response(
        "<log>start <item id=\"9\">mid</item> then <status>busy</status> end</log>",
    );
    let (expected, _) = decode(xml.as_bytes(), xml.len());

    let kinds: Vec<String> = expected
        .iter()
        .map(|event| match event {
            Extraction::Unit(_) => "unit".to_string(),
            Extraction::OrderedTag { tag, .. } => format!("ordered:{tag}"),
            Extraction::Content {
                text, last_chunk, ..
            } => format!("content:{text}:{last_chunk}"),
        })
        .collect();
    assert_eq!(
        kinds,
        vec![
            "content:start mid:false",
            "unit",
            "content: then busy:false",
            "ordered:status",
            "content: end:true",
        ]
    );

    for size in [1, 2, 5, 13] {
        let (events, _) = decode(xml.as_bytes(), size);
        assert_eq!(events, expected, "events differ at fragment size {size}");
    }
}

#[test]
fn test_units_keep_their_content() {
    let xml = items_response(2);
    let (events, tree) = decode(xml.as_bytes(), 9);

    let units: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            Extraction::Unit(unit) => Some(unit),
            _ => None,
        })
        .collect();
    assert_eq!(units.len(), 2);

    for (unit, original) in units
        .iter()
        .zip(tree.root().descendants().filter(|node| node.name() == "item"))
    {
        assert_eq!(unit.root().to_xml_string(), original.to_xml_string());
    }
}

#[test]
fn test_malformed_fragment_keeps_earlier_events() {
    let xml = soap_response("<r><item>A</item><item>B</wrong></r>");
    let mut decoder = ExtractingDecoder::new(&tags());

    let mut units = 0;
    let mut failure = None;
    for fragment in split(xml.as_bytes(), 4) {
        match decoder.feed(&fragment) {
            Ok(events) => units += events.len(),
            Err(error) => {
                units += decoder.drain().len();
                failure = Some(error);
                break;
            }
        }
    }

    assert_eq!(units, 1);
    match failure {
        Some(SoapError::MalformedDocument { partial, .. }) => {
            assert_eq!(partial.root().count_of_nodes_by_name("item"), 2);
        }
        other => panic!("expected MalformedDocument, got {:?}", other),
    }
}
