//! Caller-facing callbacks of an engine run

use crate::error::SoapError;
use crate::node::NodeTree;
use crate::transport::ResponseMetadata;

/// Receives the events of engine runs
///
/// Every method has a no-op default; implement only the events of interest.
/// Callbacks come from the run's tasks, so implementations use interior
/// mutability for any state they keep.
pub trait ResponseDelegate: Send + Sync {
    /// Fraction of the declared body received so far; `0.0` means finished
    fn progress(&self, _fraction: f64) {}

    /// A response started; sent once per connection attempt
    fn response_started(&self, _metadata: &ResponseMetadata) {}

    /// A unit tag closed; the tree's root holds the unit element
    fn unit_received(&self, _unit: NodeTree) {}

    /// Character data of a streaming tag
    fn content_received(&self, _text: &str, _tag: &str, _last_chunk: bool) {}

    /// An ordered special tag closed
    fn ordered_tag_received(&self, _tag: &str, _unit: NodeTree) {}

    /// The whole document was decoded; sent after every unit of the run
    fn entire_response_received(&self, _tree: NodeTree) {}

    /// Transport failures exhausted the attempt budget
    fn failed_loading(&self, _error: &SoapError) {}

    /// Credential missing or rejected
    fn failed_authentication(&self, _error: &SoapError) {}

    /// The request could not be issued
    fn failed_connection(&self, _error: &SoapError) {}

    /// Any other failure, malformed documents included
    fn failed_common(&self, _error: &SoapError) {}

    fn finished_loading(&self) {}
}

/// Delegate that ignores every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDelegate;

impl ResponseDelegate for NoopDelegate {}

/// Route a terminal run failure to the matching callback
pub(crate) fn report_failure(delegate: &dyn ResponseDelegate, error: &SoapError) {
    match error {
        SoapError::RetriesExhausted { .. } => delegate.failed_loading(error),
        SoapError::Authentication { .. } => delegate.failed_authentication(error),
        SoapError::Transport(_) | SoapError::InvalidRequest { .. } => {
            delegate.failed_connection(error)
        }
        _ => delegate.failed_common(error),
    }
}
