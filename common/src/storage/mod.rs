pub mod cache;
pub mod db;
pub mod indexes;
pub mod types;
