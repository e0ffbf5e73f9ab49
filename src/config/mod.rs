mod client;

pub use client::{API_KEY_ENV, BASE_URL_ENV, ClientConfig};
