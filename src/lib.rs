pub mod config;
pub mod db;
pub mod query_builder;
pub mod query_spec;
pub mod service;
