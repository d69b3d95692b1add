pub mod engine_api;
pub mod http;
pub mod services;
