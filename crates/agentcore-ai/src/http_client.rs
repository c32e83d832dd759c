use std::time::Duration;

use reqwest::Client;

const DISABLE_SYSTEM_PROXY_ENV: &str = "AGENTCORE_DISABLE_SYSTEM_PROXY";

pub(crate) fn build_http_client() -> Client {
    build_http_client_with_timeout(None)
}

pub(crate) fn build_http_client_with_timeout(connect_timeout: Option<Duration>) -> Client {
    let mut builder = Client::builder();
    if should_disable_system_proxy() {
        builder = builder.no_proxy();
    }
    if let Some(timeout) = connect_timeout {
        builder = builder.connect_timeout(timeout);
    }
    builder.build().unwrap_or_else(|error| {
        tracing::warn!(error = %error, "Falling back to default HTTP client");
        Client::new()
    })
}

fn should_disable_system_proxy() -> bool {
    if std::env::var_os(DISABLE_SYSTEM_PROXY_ENV).is_some() {
        return true;
    }

    cfg!(test)
}
