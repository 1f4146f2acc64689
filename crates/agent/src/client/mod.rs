pub mod api;

pub use api::{ApiDialer, HttpTransport};
