pub mod client;
pub mod config;
pub mod credentials;
pub mod db;
pub mod lease;
pub mod model;
pub mod note;
pub mod publish;
pub mod queue;
pub mod sync;
