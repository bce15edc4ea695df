//! The `transport` module is responsible for moving messages between bus
//! instances over HTTP.
//!
//! It defines the known remote endpoints and their credentials, the
//! classification of transport failures, and the HTTP transport service
//! that sends, publishes and subscribes on behalf of the local instance.

pub mod endpoint;
pub mod error;
pub mod http;

pub use endpoint::{Endpoint, EndpointCollection, EndpointCredentials};
pub use error::TransportError;
pub use http::{HttpTransportService, LocalDeliveryHandler, PublishReport, TransportOptions};
