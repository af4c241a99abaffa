//! Protocol layer: codes, container framing and dataset parsing.
//! Nothing here does I/O.

pub mod codes;
pub mod container;
pub mod dataset;
