mod api;
mod fetch;

pub use api::ModelsApi;
pub use fetch::{ByteStream, FetchResponse, Fetcher, HttpFetcher};

use anyhow::{Context, Result};
use reqwest::Client;

use crate::core::settings::Settings;

pub fn build_client(settings: &Settings) -> Result<Client> {
    Client::builder()
        .timeout(settings.request_timeout())
        .user_agent(settings.user_agent.clone())
        .build()
        .context("create http client")
}
