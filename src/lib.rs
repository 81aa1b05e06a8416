pub mod blob;
pub mod cli;
pub mod config;
pub mod context;
pub mod data_types;
pub mod index;
pub mod query;
pub mod repository;
pub mod schema;
pub mod session;

#[cfg(test)]
pub(crate) mod testutils;
