use anyhow::Context;
use authed_call::{AccessToken, ApiClient, Authenticator, Credentials, EmptyHandler};
use reqwest::header::{HeaderValue, AUTHORIZATION};
use std::sync::Arc;
use url::Url;

#[derive(serde::Deserialize, Debug)]
struct Config {
    client_id: String,
    client_secret: String,
    refresh_token: String,
    access_token: Option<String>,
    base_url: Url,
    room_id: String,
}

impl Config {
    fn read() -> anyhow::Result<Self> {
        config::Config::builder()
            .add_source(config::File::with_name("config"))
            .build()?
            .try_deserialize()
            .context("Failed to assemble the required configuration")
    }
}

#[derive(serde::Deserialize, Debug)]
struct Person {
    id: String,
    #[serde(rename = "displayName")]
    display_name: String,
}

async fn run() -> anyhow::Result<()> {
    let config = Config::read()?;

    // Exchange the refresh token whenever the access token is rejected
    let credentials = Credentials::RefreshToken {
        client_id: config.client_id,
        client_secret: config.client_secret.into(),
        refresh_token: config.refresh_token.into(),
    };
    let token_url = config.base_url.join("access_token")?;
    let authenticator = match config.access_token {
        Some(access_token) => Authenticator::with_access_token(
            reqwest::Client::new().into(),
            token_url,
            Some(credentials),
            AccessToken::new(access_token, None),
        ),
        None => Authenticator::new(reqwest::Client::new().into(), token_url, Some(credentials)),
    };

    let client = ApiClient::builder(Arc::new(authenticator))
        .with_base_url(config.base_url)
        .build();

    let me: Person = client.get_json("people/me").await?;
    tracing::info!("Authenticated as {} ({})", me.display_name, me.id);

    // Send a message and delete it straight away
    let message: serde_json::Value = client
        .post_json(
            "messages",
            &serde_json::json!({
                "roomId": config.room_id,
                "text": "Hello from authed-call",
            }),
        )
        .await?;
    let message_id = message["id"]
        .as_str()
        .context("Message created without an id")?
        .to_string();
    tracing::info!("Sent message {}", message_id);

    let url = client.url(&format!("messages/{}", message_id))?;
    let http = client.http_client().clone();
    let deleted = client
        .call(move |authorization: HeaderValue| {
            http.delete(url.clone()).header(AUTHORIZATION, authorization)
        })
        .spawn(EmptyHandler);
    deleted.await??;
    tracing::info!("Deleted message {}", message_id);

    // The token used last, possibly refreshed along the way
    let token = client.token_provider().get_token().await?;
    tracing::info!("Current access token: {:?}", token);

    Ok(())
}

#[tokio::main]
async fn main() {
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(tracing::Level::INFO)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Setting default subscriber failed");

    if let Err(e) = run().await {
        tracing::error!("Fatal error: {:?}", e);
        std::process::exit(1);
    }
}
