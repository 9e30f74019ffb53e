use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::channel::mpsc;
use futures::{StreamExt, stream};
use tokio::time::Instant;

use soap_stream::{
    Credential, NodeTree, ResponseDelegate, ResponseMetadata, SoapError, SoapRequest, Transport,
    TransportError, TransportExchange, TransportResult, with_idle_timeout,
};

/// Sender side of a [`MockReply::Channel`] body
pub type BodySender = mpsc::UnboundedSender<TransportResult<Bytes>>;

#[derive(Clone, Debug)]
pub enum MockFailureType {
    Timeout,
    NetworkError,
    /// Not retryable
    InvalidRequest,
}

impl MockFailureType {
    pub fn into_error(self, url: &str) -> TransportError {
        match self {
            MockFailureType::Timeout => TransportError::Timeout {
                url: url.to_string(),
                timeout_seconds: 30,
            },
            MockFailureType::NetworkError => TransportError::Connection {
                url: url.to_string(),
                details: "connection reset by peer".to_string(),
            },
            MockFailureType::InvalidRequest => TransportError::InvalidRequest {
                details: "header value is not valid".to_string(),
            },
        }
    }
}

/// What the mock transport does for one exchange
pub enum MockReply {
    /// Respond with these body fragments, then end cleanly
    Document {
        status: u16,
        fragments: Vec<Vec<u8>>,
        content_length: Option<u64>,
    },
    /// Fail before the response starts
    Fail(MockFailureType),
    /// Start the response, deliver some fragments, then break
    FailAfter {
        fragments: Vec<Vec<u8>>,
        failure: MockFailureType,
    },
    /// Deliver some fragments, then send nothing more; the body times out after `idle`
    Stall {
        fragments: Vec<Vec<u8>>,
        idle: Duration,
    },
    /// Ask for credentials
    Challenge { realm: Option<String> },
    /// Body fragments are pushed by the test through the paired sender
    Channel(mpsc::UnboundedReceiver<TransportResult<Bytes>>),
}

impl MockReply {
    /// Whole document split into fragments of `fragment_size` bytes
    pub fn document(xml: &str, fragment_size: usize) -> Self {
        MockReply::Document {
            status: 200,
            fragments: split(xml.as_bytes(), fragment_size),
            content_length: Some(xml.len() as u64),
        }
    }

    pub fn channel() -> (Self, BodySender) {
        let (sender, receiver) = mpsc::unbounded();
        (MockReply::Channel(receiver), sender)
    }
}

pub fn split(data: &[u8], fragment_size: usize) -> Vec<Vec<u8>> {
    data.chunks(fragment_size.max(1)).map(<[u8]>::to_vec).collect()
}

#[derive(Clone, Debug)]
pub struct ExchangeRecord {
    pub body: String,
    pub credential: Option<Credential>,
    pub at: Instant,
}

/// Transport replaying scripted replies in order
///
/// Once the script is exhausted every exchange fails with a retryable
/// connection error.
pub struct MockTransport {
    replies: Mutex<VecDeque<MockReply>>,
    request_log: Mutex<Vec<ExchangeRecord>>,
}

impl MockTransport {
    pub fn new(replies: impl IntoIterator<Item = MockReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
            request_log: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, reply: MockReply) {
        self.replies.lock().unwrap().push_back(reply);
    }

    pub fn exchanges(&self) -> Vec<ExchangeRecord> {
        self.request_log.lock().unwrap().clone()
    }

    pub fn exchange_count(&self) -> usize {
        self.request_log.lock().unwrap().len()
    }
}

fn started(request: &SoapRequest, status: u16, content_length: Option<u64>) -> ResponseMetadata {
    let mut metadata = ResponseMetadata::new(request.url.clone(), status);
    metadata.content_length = content_length;
    metadata
}

fn fragments_stream(
    fragments: Vec<Vec<u8>>,
) -> impl futures::Stream<Item = TransportResult<Bytes>> + Send + 'static {
    stream::iter(fragments.into_iter().map(|fragment| Ok(Bytes::from(fragment))))
}

#[async_trait]
impl Transport for MockTransport {
    async fn exchange(
        &self,
        request: &SoapRequest,
        credential: Option<&Credential>,
    ) -> TransportResult<TransportExchange> {
        self.request_log.lock().unwrap().push(ExchangeRecord {
            body: request.body_text(),
            credential: credential.cloned(),
            at: Instant::now(),
        });
        let url = request.url.to_string();
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(MockReply::Fail(MockFailureType::NetworkError));

        match reply {
            MockReply::Document {
                status,
                fragments,
                content_length,
            } => Ok(TransportExchange {
                metadata: started(request, status, content_length),
                body: fragments_stream(fragments).boxed(),
            }),
            MockReply::Fail(failure) => Err(failure.into_error(&url)),
            MockReply::FailAfter { fragments, failure } => {
                let error = failure.into_error(&url);
                Ok(TransportExchange {
                    metadata: started(request, 200, None),
                    body: fragments_stream(fragments)
                        .chain(stream::once(async move { Err(error) }))
                        .boxed(),
                })
            }
            MockReply::Stall { fragments, idle } => Ok(TransportExchange {
                metadata: started(request, 200, None),
                body: with_idle_timeout(
                    fragments_stream(fragments).chain(stream::pending()).boxed(),
                    url,
                    idle,
                ),
            }),
            MockReply::Challenge { realm } => Err(TransportError::AuthenticationChallenge { realm }),
            MockReply::Channel(receiver) => Ok(TransportExchange {
                metadata: started(request, 200, None),
                body: receiver.boxed(),
            }),
        }
    }
}

/// Event observed by [`RecordingDelegate`]
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    Progress(f64),
    Started(u16),
    Unit { name: String, value: String },
    Content {
        text: String,
        tag: String,
        last_chunk: bool,
    },
    Ordered { tag: String, value: String },
    Entire { nodes: usize },
    FailedLoading(String),
    FailedAuthentication(String),
    FailedConnection(String),
    FailedCommon(String),
    Finished,
}

impl Event {
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Event::FailedLoading(_)
                | Event::FailedAuthentication(_)
                | Event::FailedConnection(_)
                | Event::FailedCommon(_)
        )
    }
}

fn unit_element(unit: &NodeTree) -> (String, String) {
    unit.root()
        .children()
        .next()
        .map(|node| (node.name().to_string(), node.value().to_string()))
        .unwrap_or_default()
}

/// Delegate recording every callback in arrival order
#[derive(Default)]
pub struct RecordingDelegate {
    events: Mutex<Vec<Event>>,
    units: Mutex<Vec<NodeTree>>,
    entire: Mutex<Option<NodeTree>>,
    failed_attempts: Mutex<Option<u32>>,
}

impl RecordingDelegate {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn units(&self) -> Vec<NodeTree> {
        self.units.lock().unwrap().clone()
    }

    pub fn unit_values(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Unit { value, .. } => Some(value),
                _ => None,
            })
            .collect()
    }

    pub fn entire(&self) -> Option<NodeTree> {
        self.entire.lock().unwrap().clone()
    }

    /// Attempt count carried by a `failed_loading` error
    pub fn failed_attempts(&self) -> Option<u32> {
        *self.failed_attempts.lock().unwrap()
    }

    pub fn count(&self, predicate: impl Fn(&Event) -> bool) -> usize {
        self.events().iter().filter(|event| predicate(event)).count()
    }

    pub fn finished(&self) -> bool {
        self.count(|event| *event == Event::Finished) > 0
    }

    pub fn failures(&self) -> Vec<Event> {
        self.events().into_iter().filter(Event::is_failure).collect()
    }

    /// Poll until `predicate` holds for the recorded events
    pub async fn wait_until(&self, predicate: impl Fn(&[Event]) -> bool) {
        for _ in 0..2000 {
            if predicate(&self.events()) {
                return;
            }
            tokio::task::yield_now().await;
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
        panic!("condition not reached; events: {:?}", self.events());
    }
}

impl ResponseDelegate for RecordingDelegate {
    fn progress(&self, fraction: f64) {
        self.record(Event::Progress(fraction));
    }

    fn response_started(&self, metadata: &ResponseMetadata) {
        self.record(Event::Started(metadata.status));
    }

    fn unit_received(&self, unit: NodeTree) {
        let (name, value) = unit_element(&unit);
        self.record(Event::Unit { name, value });
        self.units.lock().unwrap().push(unit);
    }

    fn content_received(&self, text: &str, tag: &str, last_chunk: bool) {
        self.record(Event::Content {
            text: text.to_string(),
            tag: tag.to_string(),
            last_chunk,
        });
    }

    fn ordered_tag_received(&self, tag: &str, unit: NodeTree) {
        let (_, value) = unit_element(&unit);
        self.record(Event::Ordered {
            tag: tag.to_string(),
            value,
        });
    }

    fn entire_response_received(&self, tree: NodeTree) {
        self.record(Event::Entire {
            nodes: tree.node_count(),
        });
        *self.entire.lock().unwrap() = Some(tree);
    }

    fn failed_loading(&self, error: &SoapError) {
        *self.failed_attempts.lock().unwrap() = error.attempts();
        self.record(Event::FailedLoading(error.to_string()));
    }

    fn failed_authentication(&self, error: &SoapError) {
        self.record(Event::FailedAuthentication(error.to_string()));
    }

    fn failed_connection(&self, error: &SoapError) {
        self.record(Event::FailedConnection(error.to_string()));
    }

    fn failed_common(&self, error: &SoapError) {
        self.record(Event::FailedCommon(error.to_string()));
    }

    fn finished_loading(&self) {
        self.record(Event::Finished);
    }
}
