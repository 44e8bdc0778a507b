//! Pure per-symbol computations. Nothing in here touches storage except
//! `state`, which rebuilds carry-forward seeds through the store trait.

pub mod basic;
pub mod capital;
pub mod factor;
pub mod index;
pub mod preclose;
pub mod state;
