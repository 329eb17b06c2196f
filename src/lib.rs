//! Read-mostly query engine over a reference taxonomy and the synthetic
//! phylogenies drawn from it.
//!
//! The crate holds the whole data set in memory: the taxonomy tree with its
//! id/name lookup tables and fuzzy name index, plus one or more summary
//! trees with their per-node source mappings. A thin facade
//! ([`api::TreeService`]) exposes the query operations; transporting them
//! over HTTP, wire formatting, and configuration loading belong to the
//! caller.

pub mod api;
pub mod conflict;
pub mod context;
pub mod ctrie;
mod errors;
pub mod flags;
pub mod formats;
pub mod gate;
mod rank;
pub mod resolve;
pub mod strutils;
pub mod synth;
pub mod taxonomy;
pub mod tnrs;

pub use crate::api::TreeService;
pub use crate::errors::{Error, Result};
pub use crate::rank::TaxRank;
pub use crate::taxonomy::{OttId, Taxonomy};
