pub mod client;

pub use client::{
    classify_status, FailureClass, GatewayConfig, PaymentApiClient, PaymentGateway,
    TransferOutcome, TransferRecord,
};
