//! Immutable snapshot of an action for the duration of one run

use std::time::Duration;

use crate::action::{Credential, SoapAction, SoapRequest};
use crate::retry::RetryPolicy;
use crate::tag_extractor::TagSets;

/// Request and configuration frozen when a run starts
///
/// Retries reissue exactly this request; edits to the originating
/// [`SoapAction`] only affect later runs.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionStamp {
    soap_action: String,
    request: SoapRequest,
    credential: Option<Credential>,
    load_attempts: u32,
    max_timeout: Duration,
    tags: TagSets,
    parse_units_asynchronously: bool,
    network_activity_indicator: bool,
}

impl ActionStamp {
    pub(crate) fn new(request: SoapRequest, action: &SoapAction) -> Self {
        Self {
            soap_action: action.soap_action.clone(),
            request,
            credential: action.credential.clone(),
            load_attempts: action.load_attempts,
            max_timeout: action.max_timeout,
            tags: action.tags.clone(),
            parse_units_asynchronously: action.parse_units_asynchronously,
            network_activity_indicator: action.network_activity_indicator,
        }
    }

    pub fn soap_action(&self) -> &str {
        &self.soap_action
    }

    pub fn request(&self) -> &SoapRequest {
        &self.request
    }

    pub fn credential(&self) -> Option<&Credential> {
        self.credential.as_ref()
    }

    pub fn tags(&self) -> &TagSets {
        &self.tags
    }

    pub fn parse_units_asynchronously(&self) -> bool {
        self.parse_units_asynchronously
    }

    pub fn network_activity_indicator(&self) -> bool {
        self.network_activity_indicator
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.load_attempts, self.max_timeout)
    }
}
