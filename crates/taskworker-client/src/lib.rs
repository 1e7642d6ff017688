//! Taskworker Client - broker RPC capability
//!
//! Supported backends:
//! - gRPC (tonic), one or more broker replicas
//! - In-memory, for local runs and tests

pub mod convert;
pub mod generated;
pub mod grpc;
pub mod memory;
pub mod traits;

pub use grpc::GrpcBrokerClient;
pub use memory::{MemoryBroker, StatusUpdate};
pub use traits::{BrokerClient, RpcError, RpcResult};

pub use tonic::Code;
