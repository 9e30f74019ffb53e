//! SOAP action: envelope template, parameters and run configuration
//!
//! A [`SoapAction`] describes one SOAP exchange. The HTTP request is derived
//! from it on demand; an engine run freezes the request together with the
//! configuration into an [`ActionStamp`](crate::stamp::ActionStamp).

use std::time::Duration;

use quick_xml::escape::escape;
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SoapError};
use crate::retry::RetryPolicy;
use crate::stamp::ActionStamp;
use crate::tag_extractor::TagSets;
use crate::tree_builder::node_tree_from_data;

pub const POST_METHOD: &str = "POST";
pub const CONTENT_TYPE: &str = "Content-Type";
pub const CONTENT_LENGTH: &str = "Content-Length";
pub const SOAP_ACTION_HEADER: &str = "SOAPAction";
pub const DEFAULT_CONTENT_TYPE: &str = "text/xml; charset=utf-8";

/// SOAP 1.1 envelope up to the body element
pub const SOAP11_ENVELOPE_HEAD: &str = concat!(
    r#"<?xml version="1.0" encoding="utf-8"?>"#,
    r#"<soap:Envelope xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" "#,
    r#"xmlns:xsd="http://www.w3.org/2001/XMLSchema" "#,
    r#"xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">"#,
    "<soap:Body>"
);

/// SOAP 1.1 envelope after the body content
pub const SOAP11_ENVELOPE_TAIL: &str = "</soap:Body></soap:Envelope>";

/// Credential answered to an authentication challenge
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

impl Credential {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Fully built HTTP request for one SOAP exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoapRequest {
    pub method: String,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl SoapRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Description of a SOAP exchange and how its response is consumed
///
/// The fields may be changed freely; a run that is already in flight keeps
/// the snapshot taken when it started.
#[derive(Debug, Clone)]
pub struct SoapAction {
    url: Url,
    /// Name of the SOAP action; also the element wrapping the parameters
    pub soap_action: String,
    /// Extra text placed inside the action start tag, e.g. `xmlns="urn:example"`
    pub action_tag_attributes: String,
    pub envelope_head: String,
    pub envelope_tail: String,
    /// Rendered as `<key>value</key>` in order
    pub parameters: Vec<(String, String)>,
    /// Extra HTTP header fields; Content-Length is always derived
    pub header_fields: Vec<(String, String)>,
    pub credential: Option<Credential>,
    pub load_attempts: u32,
    pub max_timeout: Duration,
    pub tags: TagSets,
    pub parse_units_asynchronously: bool,
    pub network_activity_indicator: bool,
}

impl SoapAction {
    pub fn new(url: Url, soap_action: impl Into<String>) -> Self {
        Self {
            url,
            soap_action: soap_action.into(),
            action_tag_attributes: String::new(),
            envelope_head: SOAP11_ENVELOPE_HEAD.to_string(),
            envelope_tail: SOAP11_ENVELOPE_TAIL.to_string(),
            parameters: Vec::new(),
            header_fields: Vec::new(),
            credential: None,
            load_attempts: 1,
            max_timeout: Duration::from_secs(30),
            tags: TagSets::default(),
            parse_units_asynchronously: false,
            network_activity_indicator: true,
        }
    }

    /// Parse the service URL and create an action
    pub fn parse(url: &str, soap_action: impl Into<String>) -> Result<Self> {
        let url = Url::parse(url).map_err(|e| SoapError::InvalidRequest {
            details: format!("invalid URL '{}': {}", url, e),
        })?;
        Ok(Self::new(url, soap_action))
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.push((key.into(), value.into()));
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.header_fields.push((name.into(), value.into()));
        self
    }

    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }

    pub fn with_retries(mut self, load_attempts: u32, max_timeout: Duration) -> Self {
        self.load_attempts = load_attempts;
        self.max_timeout = max_timeout;
        self
    }

    pub fn with_unit_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.unit_tags.push(checked_tag(tag.into()));
        self
    }

    pub fn with_streaming_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.streaming_tags.push(checked_tag(tag.into()));
        self
    }

    pub fn with_ordered_special_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.ordered_special_tags.push(checked_tag(tag.into()));
        self
    }

    pub fn with_async_parsing(mut self, enabled: bool) -> Self {
        self.parse_units_asynchronously = enabled;
        self
    }

    pub fn with_network_activity_indicator(mut self, enabled: bool) -> Self {
        self.network_activity_indicator = enabled;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.load_attempts, self.max_timeout)
    }

    /// Envelope text that would be sent as the HTTP body
    pub fn http_body(&self) -> String {
        let mut body = String::with_capacity(
            self.envelope_head.len() + self.envelope_tail.len() + 64 * (self.parameters.len() + 1),
        );
        body.push_str(&self.envelope_head);

        body.push('<');
        body.push_str(&self.soap_action);
        if !self.action_tag_attributes.trim().is_empty() {
            body.push(' ');
            body.push_str(self.action_tag_attributes.trim());
        }
        body.push('>');

        for (key, value) in &self.parameters {
            body.push('<');
            body.push_str(key);
            body.push('>');
            body.push_str(&escape(value.as_str()));
            body.push_str("</");
            body.push_str(key);
            body.push('>');
        }

        body.push_str("</");
        body.push_str(&self.soap_action);
        body.push('>');
        body.push_str(&self.envelope_tail);
        body
    }

    /// Build the POST request; fails when the envelope is not well-formed XML
    pub fn build_request(&self) -> Result<SoapRequest> {
        if self.soap_action.trim().is_empty() {
            return Err(SoapError::InvalidEnvelope {
                details: "SOAP action name is empty".to_string(),
            });
        }

        let body = self.http_body().into_bytes();
        if let Err(error) = node_tree_from_data(&body) {
            return Err(SoapError::InvalidEnvelope {
                details: error.to_string(),
            });
        }

        let mut headers: Vec<(String, String)> = Vec::with_capacity(self.header_fields.len() + 3);
        if !self
            .header_fields
            .iter()
            .any(|(name, _)| name.eq_ignore_ascii_case(CONTENT_TYPE))
        {
            headers.push((CONTENT_TYPE.to_string(), DEFAULT_CONTENT_TYPE.to_string()));
        }
        if !self
            .header_fields
            .iter()
            .any(|(name, _)| name.eq_ignore_ascii_case(SOAP_ACTION_HEADER))
        {
            headers.push((SOAP_ACTION_HEADER.to_string(), self.soap_action.clone()));
        }
        headers.extend(
            self.header_fields
                .iter()
                .filter(|(name, _)| !name.eq_ignore_ascii_case(CONTENT_LENGTH))
                .cloned(),
        );
        headers.push((CONTENT_LENGTH.to_string(), body.len().to_string()));

        Ok(SoapRequest {
            method: POST_METHOD.to_string(),
            url: self.url.clone(),
            headers,
            body,
        })
    }

    /// Freeze the request and configuration for one run
    pub fn stamp(&self) -> Result<ActionStamp> {
        Ok(ActionStamp::new(self.build_request()?, self))
    }
}

/// Panics on an empty tag name
fn checked_tag(tag: String) -> String {
    assert!(!tag.is_empty(), "watched tag names must not be empty");
    tag
}
