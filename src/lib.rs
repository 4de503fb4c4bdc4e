pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod llm;
pub mod models;
pub mod pdf;
pub mod routes;
pub mod schema;
pub mod state;
pub mod storage;
