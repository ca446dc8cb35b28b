//! Bundled implementations of the filesystem access layer

pub mod ram;
