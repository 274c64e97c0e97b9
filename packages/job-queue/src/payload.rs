//! JSON payload schemas for the built-in job types

use serde::{Deserialize, Serialize};

/// Payload of `install_by_artist`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallByArtistPayload {
    pub artist_id: String,
}

/// Payload of `install_by_album`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallByAlbumPayload {
    pub album_id: String,
}

/// Payload of jobs that carry no arguments (`set_signatures`, `ping`)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmptyPayload {}
