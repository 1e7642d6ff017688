//! Generated protobuf and gRPC client code

pub mod taskbroker {
    pub mod v1 {
        include!("taskbroker.v1.rs");
    }
}
