//! Client for the external signature-computation service
//!
//! The service downloads tracks, fingerprints them and stores audio
//! signatures. This crate only knows its HTTP surface:
//!
//! | Verb | Path | Body | Success |
//! |---|---|---|---|
//! | POST | /install/artist | `{"artist_id": string}` | 200/202 |
//! | POST | /install/album | `{"album_id": string}` | 200/202 |
//! | POST | /signatures/set | (empty) | 200 |
//! | GET | /ping | (none) | 200 |
//!
//! # Example
//!
//! ```no_run
//! use similarity_compute_client::ComputeClient;
//! use similarity_shared_config::ComputeConfig;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = ComputeClient::new(&ComputeConfig::from_env()?)?;
//! let pong = client.ping().await?;
//! println!("compute service says: {}", pong.body);
//! # Ok(())
//! # }
//! ```

mod client;
mod error;

pub use client::{ComputeClient, ComputeResponse};
pub use error::{ComputeError, ComputeResult};

/// Re-exported so callers of [`ComputeClient::call`] need no direct reqwest dependency
pub use reqwest::Method;
