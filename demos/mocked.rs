use std::sync::Arc;

use reqwest::{Method, StatusCode};
use restpipe::{Mock, MockRouter, RestClient};
use serde_json::json;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let router = Arc::new(MockRouter::new());
    router.register(
        Mock::new(Method::POST, "http://orders.internal/orders")
            .with_body(r#"{"id":"1"}"#)
            .respond(StatusCode::CREATED, r#"{"status":"ok"}"#)
            .times(1),
    )?;

    let client = RestClient::new("http://orders.internal").with_mock(Arc::clone(&router));
    let response = client.post("/orders", json!({"id": "1"})).await?;
    println!("{} {}", response.status(), response.text());

    router.verify_call_counts()?;
    Ok(())
}
