use reqwest::{Client, redirect::Policy};
use std::time::Duration;

use crate::config::env_u64;

fn builder() -> reqwest::ClientBuilder {
    let timeout = env_u64("HTTP_TIMEOUT_SECS", 15);
    let connect = env_u64("HTTP_CONNECT_TIMEOUT_SECS", 5);
    Client::builder()
        .timeout(Duration::from_secs(timeout))
        .connect_timeout(Duration::from_secs(connect))
}

pub fn build_client() -> Client {
    builder().build().unwrap_or_else(|_| Client::new())
}

/// Client that never follows redirects; callers walk `Location` headers themselves.
/// There is no fallback here, since a default client would follow redirects.
pub fn build_manual_redirect_client() -> Result<Client, reqwest::Error> {
    builder().redirect(Policy::none()).build()
}
