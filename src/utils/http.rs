use crate::prelude::*;
use http::header::USER_AGENT;
use reqwest::blocking::{Client, ClientBuilder, RequestBuilder};
use reqwest::redirect::Policy;
use reqwest::Method;
use std::time::Duration;

const MAX_REDIRECTS: usize = 4;

// Hard cap on any single outbound call; per-request deadlines shrink it.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

lazy_static! {
    static ref HTTP_CLIENT: Client = setup_client();
}

fn setup_client() -> Client {
    ClientBuilder::new()
        .redirect(Policy::limited(MAX_REDIRECTS))
        .timeout(DEFAULT_TIMEOUT)
        .build()
        .unwrap()
}

pub(crate) fn prepare(method: Method, url: &str) -> RequestBuilder {
    HTTP_CLIENT
        .request(method, url)
        .header(USER_AGENT, crate::USER_AGENT.clone())
}
