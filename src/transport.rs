use std::fmt;
use std::process::Stdio;

use rmcp::transport::{
    sse_client::SseClientConfig,
    streamable_http_client::StreamableHttpClientTransportConfig,
    SseClientTransport, StreamableHttpClientTransport, TokioChildProcess,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{info, warn};

use crate::config::{LaunchConfig, TransportKind};

#[derive(Debug)]
pub enum TransportError {
    InvalidConfig(String),
    Spawn(String),
    Connect(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::InvalidConfig(m) => write!(f, "invalid launch config: {m}"),
            TransportError::Spawn(m) => write!(f, "spawn failed: {m}"),
            TransportError::Connect(m) => write!(f, "connect failed: {m}"),
        }
    }
}

impl std::error::Error for TransportError {}

/// A constructed downstream transport, ready to be served.
pub enum DownstreamTransport {
    Stdio(TokioChildProcess),
    StreamableHttp(StreamableHttpClientTransport<reqwest::Client>),
    Sse(SseClientTransport<reqwest::Client>),
}

/// Decide which transport a launch config describes without building it.
/// An explicit `type` wins; otherwise `command` means stdio and `url` means
/// streamable-HTTP, except URLs whose path ends in `/sse` or `/events`.
pub fn infer_kind(config: &LaunchConfig) -> Result<TransportKind, TransportError> {
    if let Some(kind) = config.kind {
        return Ok(kind);
    }
    if config.command.as_deref().is_some_and(|c| !c.is_empty()) {
        return Ok(TransportKind::Stdio);
    }
    if let Some(url) = config.url.as_deref().filter(|u| !u.is_empty()) {
        if sse_path(url) {
            return Ok(TransportKind::Sse);
        }
        return Ok(TransportKind::StreamableHttp);
    }
    Err(TransportError::InvalidConfig(
        "neither command nor url present".into(),
    ))
}

fn sse_path(url: &str) -> bool {
    let path = url
        .split_once("://")
        .map(|(_, rest)| rest)
        .and_then(|rest| rest.find('/').map(|i| &rest[i..]))
        .unwrap_or("");
    let path = path.split(['?', '#']).next().unwrap_or("");
    let path = path.trim_end_matches('/');
    path.ends_with("/sse") || path.ends_with("/events")
}

/// Build the transport for a launch config. Returns the transport together
/// with the kind actually used, which may differ from the inferred one when
/// streamable-HTTP construction falls back to SSE.
pub async fn create(
    server_id: &str,
    config: &LaunchConfig,
) -> Result<(DownstreamTransport, TransportKind), TransportError> {
    match infer_kind(config)? {
        TransportKind::Stdio => Ok((build_stdio(server_id, config)?, TransportKind::Stdio)),
        TransportKind::StreamableHttp => match build_streamable_http(config) {
            Ok(t) => Ok((t, TransportKind::StreamableHttp)),
            Err(e) => {
                warn!(target = "transport", server = %server_id, error = %e, "streamable_http_failed_falling_back_to_sse");
                Ok((build_sse(config).await?, TransportKind::Sse))
            }
        },
        TransportKind::Sse => Ok((build_sse(config).await?, TransportKind::Sse)),
    }
}

fn build_stdio(server_id: &str, config: &LaunchConfig) -> Result<DownstreamTransport, TransportError> {
    let program = config
        .command
        .as_deref()
        .filter(|c| !c.is_empty())
        .ok_or_else(|| TransportError::InvalidConfig("missing command".into()))?;
    if program.contains("..") {
        return Err(TransportError::InvalidConfig(format!(
            "command must not contain '..': {program}"
        )));
    }
    let mut command = Command::new(program);
    command.args(&config.args);
    // Launch-config env is merged over the process env, launch side winning.
    for (k, v) in &config.env {
        command.env(k, v);
    }
    if let Some(cwd) = &config.cwd {
        command.current_dir(cwd);
    }
    let (transport, stderr) = TokioChildProcess::builder(command)
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| TransportError::Spawn(e.to_string()))?;
    if let Some(stderr) = stderr {
        let server = server_id.to_string();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                info!(target = "transport", server = %server, "stderr: {line}");
            }
        });
    }
    Ok(DownstreamTransport::Stdio(transport))
}

fn http_client(config: &LaunchConfig) -> Result<reqwest::Client, TransportError> {
    let mut map = reqwest::header::HeaderMap::new();
    for (k, v) in &config.headers {
        let name = reqwest::header::HeaderName::from_bytes(k.as_bytes())
            .map_err(|e| TransportError::InvalidConfig(format!("header name {k}: {e}")))?;
        let val = reqwest::header::HeaderValue::from_str(v)
            .map_err(|e| TransportError::InvalidConfig(format!("header value for {k}: {e}")))?;
        map.insert(name, val);
    }
    reqwest::Client::builder()
        .default_headers(map)
        .build()
        .map_err(|e| TransportError::Connect(format!("http client build: {e}")))
}

fn build_streamable_http(config: &LaunchConfig) -> Result<DownstreamTransport, TransportError> {
    let url = config
        .url
        .as_deref()
        .filter(|u| !u.is_empty())
        .ok_or_else(|| TransportError::InvalidConfig("missing url".into()))?;
    reqwest::Url::parse(url).map_err(|e| TransportError::InvalidConfig(format!("url: {e}")))?;
    let client = http_client(config)?;
    let transport = StreamableHttpClientTransport::with_client(
        client,
        StreamableHttpClientTransportConfig::with_uri(url.to_string()),
    );
    Ok(DownstreamTransport::StreamableHttp(transport))
}

async fn build_sse(config: &LaunchConfig) -> Result<DownstreamTransport, TransportError> {
    let url = config
        .url
        .as_deref()
        .filter(|u| !u.is_empty())
        .ok_or_else(|| TransportError::InvalidConfig("missing url".into()))?;
    let client = http_client(config)?;
    let transport = SseClientTransport::start_with_client(
        client,
        SseClientConfig {
            sse_endpoint: url.to_string().into(),
            ..Default::default()
        },
    )
    .await
    .map_err(|e| TransportError::Connect(format!("sse start: {e}")))?;
    Ok(DownstreamTransport::Sse(transport))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> LaunchConfig {
        LaunchConfig::default()
    }

    #[test]
    fn explicit_kind_wins() {
        let mut c = cfg();
        c.kind = Some(TransportKind::Sse);
        c.command = Some("echo".into());
        assert_eq!(infer_kind(&c).unwrap(), TransportKind::Sse);
    }

    #[test]
    fn command_implies_stdio() {
        let mut c = cfg();
        c.command = Some("npx".into());
        assert_eq!(infer_kind(&c).unwrap(), TransportKind::Stdio);
    }

    #[test]
    fn url_implies_streamable_http_unless_sse_path() {
        let mut c = cfg();
        c.url = Some("https://example.com/mcp".into());
        assert_eq!(infer_kind(&c).unwrap(), TransportKind::StreamableHttp);
        c.url = Some("https://example.com/sse".into());
        assert_eq!(infer_kind(&c).unwrap(), TransportKind::Sse);
        c.url = Some("https://example.com/api/events?x=1".into());
        assert_eq!(infer_kind(&c).unwrap(), TransportKind::Sse);
    }

    #[test]
    fn empty_config_is_invalid() {
        assert!(matches!(
            infer_kind(&cfg()),
            Err(TransportError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn parent_traversal_in_command_is_rejected() {
        let mut c = cfg();
        c.command = Some("../evil".into());
        let err = create("srv", &c).await.err().expect("must reject");
        assert!(matches!(err, TransportError::InvalidConfig(_)));
    }
}
