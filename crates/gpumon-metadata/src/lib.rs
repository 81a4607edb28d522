//! GCE metadata server access.
//!
//! Resolves the instance identity attached to every time series and
//! provides ambient access tokens when no credential file is configured.

pub mod client;
pub mod error;
pub mod identity;

pub use client::{MetadataClient, MetadataTokenProvider, DEFAULT_METADATA_URL};
pub use error::{MetadataError, MetadataResult};
pub use identity::{parse_zone_path, InstanceIdentity};
