use std::sync::Arc;
use std::time::Duration;

use soap_stream::{ResponseDelegate, SoapAction, SoapEngine, Transport};

use super::mocks::{MockReply, MockTransport, RecordingDelegate};

pub const SERVICE_URL: &str = "http://service.test/items.asmx";

/// Wrap body content in a SOAP 1.1 response envelope
pub fn soap_response(body: &str) -> String {
    format!(
        concat!(
            r#"<?xml version="1.0" encoding="utf-8"?>"#,
            r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">"#,
            "<soap:Body>{}</soap:Body></soap:Envelope>"
        ),
        body
    )
}

/// Response listing `count` items named `item-<n>`
pub fn items_response(count: usize) -> String {
    let items: String = (0..count)
        .map(|n| format!(r#"<item id="{n}"><name>item-{n}</name><price>{n}.50</price></item>"#))
        .collect();
    soap_response(&format!(
        "<GetItemsResponse><GetItemsResult>{}</GetItemsResult></GetItemsResponse>",
        items
    ))
}

pub fn action() -> SoapAction {
    SoapAction::parse(SERVICE_URL, "GetItems")
        .expect("valid test URL")
        .with_parameter("category", "books")
}

pub struct Harness {
    pub transport: Arc<MockTransport>,
    pub delegate: Arc<RecordingDelegate>,
    pub engine: SoapEngine,
}

impl Harness {
    pub fn new(replies: impl IntoIterator<Item = MockReply>) -> Self {
        let transport = Arc::new(MockTransport::new(replies));
        let delegate = Arc::new(RecordingDelegate::new());
        let engine = SoapEngine::new(
            transport.clone() as Arc<dyn Transport>,
            delegate.clone() as Arc<dyn ResponseDelegate>,
        );
        Self {
            transport,
            delegate,
            engine,
        }
    }

    /// Load `action` and wait for the run to end
    pub async fn run(&self, action: &SoapAction) {
        self.engine.load(action).expect("run should start");
        self.engine.wait().await;
    }
}

pub fn assert_duration_within_bounds(actual: Duration, expected: Duration, tolerance: Duration) {
    assert!(
        actual >= expected.saturating_sub(tolerance) && actual <= expected + tolerance,
        "duration {:?} not within {:?} of {:?}",
        actual,
        tolerance,
        expected
    );
}
