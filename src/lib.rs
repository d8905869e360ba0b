//! Face-identity index for a personal photo library.
//!
//! Faces found by a [`faces::FaceDetector`] are stored in an
//! [`db::IdentityStore`], grouped into people by density clustering, and can
//! be renamed, merged, searched for and exported.

pub mod config;
pub mod db;
pub mod error;
pub mod export;
pub mod faces;
pub mod indexer;
pub mod logging;
pub mod scanner;
pub mod tasks;

pub use error::{Error, Result};
