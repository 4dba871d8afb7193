pub mod daemon;
pub mod http_api;
pub mod sync;
