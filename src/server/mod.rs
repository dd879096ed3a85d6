//! HTTP and WebSocket surface

pub mod http;
pub mod websocket;

pub use http::{
    router, run, AppState, DeviceAuth, NodeAuth, DEVICE_CERT_HEADER, DEVICE_SIGNATURE_HEADER,
    DEVICE_TIMESTAMP_HEADER,
};
