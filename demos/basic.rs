use restpipe::{ClientOptions, RequestSpec, RestClient, RetryOptions};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct Ip {
    origin: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut options = ClientOptions::from_env()?;
    if options.base_url.is_empty() {
        options.base_url = "https://httpbin.org".to_owned();
    }
    options.retry.get_or_insert(RetryOptions {
        max_retries: 2,
        delay_ms: 100,
        methods: Vec::new(),
    });

    let client = RestClient::from_options(options)?;

    let ip: Ip = client.get("/ip").await?.error_for_status()?.fill_up()?;
    println!("origin: {}", ip.origin);

    let pending = client.spawn(RequestSpec::get("/status/503"));
    let response = pending.await?;
    println!(
        "status {} after {} attempt(s)",
        response.status(),
        response.attempts()
    );

    Ok(())
}
