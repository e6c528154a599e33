pub mod config;
pub mod database;
pub mod error;
pub mod executor;
pub mod handlers;
pub mod lock;
pub mod messaging;
pub mod models;
pub mod probe;
pub mod reactor;
pub mod resources;
pub mod routes;
pub mod scheduler;
pub mod state;
pub mod store;
pub mod suppress;
