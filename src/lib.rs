pub mod capture;
pub mod config;
pub mod db;
pub mod hash;
pub mod index;
pub mod ingest;
pub mod plan;
pub mod rules;
pub mod scheduler;
pub mod serializer;
