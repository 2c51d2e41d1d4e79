//! Service Layer - the index builder and its scan task

pub mod index_builder;
mod scan;

pub use index_builder::IndexBuilderService;
