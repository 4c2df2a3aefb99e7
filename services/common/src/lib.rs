//! Common models and client wrappers shared by the mesh control plane
//!
//! Everything that crosses a service boundary lives here: the instance
//! data model, the wire DTOs for the registry API, the error taxonomy,
//! W3C trace-context propagation, and the typed HTTP registry client.

pub mod clients;
pub mod constants;
pub mod errors;
pub mod models;
pub mod trace;

pub use clients::RegistryClient;
pub use errors::MeshError;
pub use models::{
    ChangeKind, ChangesResponse, DeregisterResponse, DiscoverResponse, HeartbeatRequest,
    HeartbeatResponse, InstanceRecord, InstanceStatus, RegisterRequest, RegisterResponse,
    ServiceChangeEvent,
};
pub use trace::TraceContext;
