//! `parley flush` and `parley status`: talk to a running relay's HTTP façade.

use {
    anyhow::{Context, Result, bail},
    parley_config::ParleyConfig,
    serde_json::Value,
};

/// Base URL of the façade described by `config`. Wildcard binds are
/// reached over loopback.
fn base_url(config: &ParleyConfig) -> String {
    let host = match config.server.bind.as_str() {
        "0.0.0.0" | "::" | "[::]" => "127.0.0.1",
        other => other,
    };
    format!("http://{host}:{}", config.server.port)
}

async fn print_response(response: reqwest::Response) -> Result<()> {
    let status = response.status();
    let body: Value = response
        .json()
        .await
        .context("relay answered with a non-JSON body")?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    if !status.is_success() {
        bail!("relay answered {status}");
    }
    Ok(())
}

pub async fn flush(config: &ParleyConfig) -> Result<()> {
    let url = format!("{}/send-pending", base_url(config));
    let response = reqwest::Client::new()
        .post(&url)
        .send()
        .await
        .with_context(|| format!("is parley running? failed to reach {url}"))?;
    print_response(response).await
}

pub async fn status(config: &ParleyConfig) -> Result<()> {
    let url = format!("{}/stats", base_url(config));
    let response = reqwest::get(&url)
        .await
        .with_context(|| format!("is parley running? failed to reach {url}"))?;
    print_response(response).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_bind_uses_loopback() {
        let mut config = ParleyConfig::default();
        config.server.bind = "0.0.0.0".into();
        config.server.port = 3002;
        assert_eq!(base_url(&config), "http://127.0.0.1:3002");

        config.server.bind = "10.0.0.5".into();
        assert_eq!(base_url(&config), "http://10.0.0.5:3002");
    }
}
