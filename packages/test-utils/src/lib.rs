//! Shared test utilities for the similarity workspace
//!
//! This crate provides mock implementations of external services for testing
//! without network dependencies.
//!
//! # Mock Services
//!
//! - [`MockComputeServer`] - Mock signature-computation service for handler
//!   and worker pool tests
//!
//! For the queue itself, use `similarity_job_queue::InMemoryBroker`.
//!
//! # Example
//!
//! ```rust,ignore
//! use similarity_test_utils::MockComputeServer;
//!
//! #[tokio::test]
//! async fn test_with_mocks() {
//!     let compute = MockComputeServer::start().await;
//!     compute.mock_install_artist(202).await;
//!
//!     // Use compute.config() to build your ComputeClient
//! }
//! ```

mod compute;

pub use compute::{unreachable_compute_config, MockComputeServer};
