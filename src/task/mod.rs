#![forbid(unsafe_code)]

pub mod execution;
pub mod frontmatter;
pub mod index;
pub mod model;
pub mod store;
pub mod sync;
