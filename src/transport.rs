use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    Reqwest(#[from] reqwest::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

pub const USER_AGENT: &str = concat!("orastore/", env!("CARGO_PKG_VERSION"));

const POOL_MAX_IDLE_PER_HOST: usize = 100;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Two long-lived HTTP clients sharing the same pool tuning: one verifying
/// TLS, one skipping verification. TLS config is baked into a reqwest
/// client, so a per-call choice would defeat connection pooling; both are
/// built once at store construction and shared immutably.
#[derive(Clone)]
pub struct TransportPair {
    verified: reqwest::Client,
    insecure: reqwest::Client,
}

fn builder(allow_plain_http: bool) -> reqwest::ClientBuilder {
    reqwest::Client::builder()
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .timeout(REQUEST_TIMEOUT)
        .redirect(reqwest::redirect::Policy::limited(2))
        .user_agent(USER_AGENT)
        .https_only(!allow_plain_http)
}

impl TransportPair {
    pub fn new(allow_plain_http: bool) -> Result<Self, Error> {
        Ok(TransportPair {
            verified: builder(allow_plain_http).build()?,
            insecure: builder(allow_plain_http)
                .danger_accept_invalid_certs(true)
                .build()?,
        })
    }

    pub fn select(&self, insecure: bool) -> &reqwest::Client {
        if insecure { &self.insecure } else { &self.verified }
    }
}
