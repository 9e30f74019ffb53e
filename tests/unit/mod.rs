pub mod config_tests;
pub mod decoding_tests;
pub mod error_tests;
pub mod node_tests;
