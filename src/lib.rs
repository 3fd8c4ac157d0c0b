//! Daily topic clustering of arXiv articles.
//!
//! Training fits a manifold reducer, a density-based clusterer on its output and a 2-D
//! visualization reducer on a historical corpus of embeddings, and commits the three as one
//! versioned [`store::ModelSet`]. Inference pushes a new day's embeddings through the frozen
//! models and assigns each one to a known cluster or to noise. The daily batch itself comes from
//! the arXiv RSS feed ([`fetch`]) and an embedding server ([`embed`]).

pub mod cli;
pub mod cluster;
pub mod corpus;
pub mod embed;
mod error;
pub mod fetch;
pub mod linalg;
pub mod logging;
pub mod pipeline;
pub mod plot;
pub mod reduce;
pub(crate) mod serde_helpers;
pub mod store;

pub use error::{AppError, AppResult};
