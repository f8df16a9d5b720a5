//! HTTP API Module
//!
//! Provides a REST API for cluster status and broadcast ingress.

mod http;

pub use http::{
    BroadcastRequest, BroadcastResponse, BufferResponse, ClusterInfoResponse, ErrorResponse,
    HealthResponse, HttpServer,
};
