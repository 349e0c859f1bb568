mod inference;
mod ort_service;
mod routes;
mod server;

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod loader;
pub mod model_service;
pub mod preprocess;
pub mod response;
pub mod state;
pub mod vit;

pub use server::{build_router, start_server};
