//! Line-delimited JSON client for the control surface.

use anyhow::{anyhow, bail, Context, Result};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracegate_core::{ControlEnvelope, ControlRequest, ControlResponse};
use tracing::debug;

pub struct ControlClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
    token: String,
}

impl ControlClient {
    /// Connect to `addr`, sending `token` with every request.
    pub async fn connect(addr: &str, token: &str) -> Result<Self> {
        if token.is_empty() {
            bail!("no token: pass --token, set TRACEGATE_TOKEN, or add one to the config file");
        }
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("failed to connect to {addr}"))?;
        debug!(addr, "connected");
        let (reader, writer) = stream.into_split();
        Ok(Self {
            lines: BufReader::new(reader).lines(),
            writer,
            token: token.to_string(),
        })
    }

    /// Send one request and wait for its response.
    pub async fn request(&mut self, request: ControlRequest) -> Result<ControlResponse> {
        let envelope = ControlEnvelope {
            token: self.token.clone(),
            request,
        };
        let mut line = serde_json::to_vec(&envelope).context("failed to encode request")?;
        line.push(b'\n');
        self.writer.write_all(&line).await.context("failed to send request")?;

        let reply = self
            .lines
            .next_line()
            .await
            .context("failed to read response")?
            .ok_or_else(|| anyhow!("server closed the connection"))?;
        serde_json::from_str(&reply).context("malformed response")
    }

    /// Like [`request`](Self::request), turning error responses into errors.
    pub async fn call(&mut self, request: ControlRequest) -> Result<Value> {
        let response = self.request(request).await?;
        into_body(response)
    }
}

fn into_body(response: ControlResponse) -> Result<Value> {
    if response.is_success() {
        return Ok(response.body.unwrap_or(Value::Null));
    }
    match response.error {
        Some(err) => bail!("{} ({}): {}", err.code, response.status, err.message),
        None => bail!("request failed with status {}", response.status),
    }
}
