//! HTTP client wrappers for talking to the registry

pub mod registry_client;

pub use registry_client::RegistryClient;
