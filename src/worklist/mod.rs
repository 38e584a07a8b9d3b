//! Read models for queue screens. Projections only; the lifecycle owns
//! the authoritative state.

pub mod index;

pub use index::{
    VerificationStats, WorklistEntry, WorklistIndex, WorklistPage, WorklistQuery,
    DEFAULT_PAGE_SIZE,
};
