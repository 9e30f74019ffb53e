//! # soap-stream Library
//!
//! A streaming SOAP-over-HTTP client. Responses are decoded into a node tree
//! while the bytes are still arriving; configured unit tags are delivered as
//! standalone subtrees as soon as they close, streaming tags chunk by chunk,
//! and failed connections are retried with a linearly growing delay.

pub mod action;
pub mod cli;
pub mod client;
pub mod config;
pub mod delegate;
pub mod engine;
pub mod error;
pub mod node;
pub mod pool;
pub mod retry;
pub mod stamp;
pub mod tag_extractor;
pub mod transport;
pub mod tree_builder;

pub use action::{Credential, SoapAction, SoapRequest};
pub use cli::{Cli, VerbosityLevel};
pub use client::SoapClient;
pub use config::{Config, ConfigError, ConfigManager, EnvProvider, SystemEnvProvider};
pub use delegate::{NoopDelegate, ResponseDelegate};
pub use engine::SoapEngine;
pub use error::{Result, SoapError, TransportError, TransportResult};
pub use node::{Node, NodeId, NodeTree};
pub use pool::{ActivityPool, EngineId, RunListener};
pub use retry::{RetryDecision, RetryPhase, RetryPolicy, RetryState};
pub use stamp::ActionStamp;
pub use tag_extractor::{ExtractingDecoder, Extraction, TagExtractor, TagSets};
pub use transport::{
    ByteStream, HttpTransportConfig, ReqwestTransport, ResponseMetadata, Transport,
    TransportExchange, with_idle_timeout,
};
pub use tree_builder::{
    ParseErrorHandler, TreeBuilder, TreeObserver, node_tree_from_data,
    node_tree_from_data_with_handler,
};
