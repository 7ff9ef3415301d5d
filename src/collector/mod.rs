//! Database integrations built on the collection core.

pub mod pg;
