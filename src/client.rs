// client side of the protocol: content sources push readings, readers fetch
// the aggregate. both carry their own lamport clock across requests
use std::{path::Path, time::Duration};

use anyhow::Context as _;
use axum::http::{header::CONTENT_TYPE, Method, StatusCode};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::{
    clock::{LamportClock, LogicalTime, MAX_PRESENTED},
    config::DEFAULT_PORT,
    protocol::{header_str, Reply, LAMPORT_CLOCK, SOURCE_ID},
    register::ENTITY_ID_KEY,
    retry::{Failure, RetryPolicy},
    server::WEATHER_PATH,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    // `host:port`
    pub authority: String,
    pub path: String,
}

impl Target {
    pub fn url(&self) -> String {
        format!("http://{}{}", self.authority, self.path)
    }
}

/// `http://host:port[/path]` or `host:port[/path]`, port and path optional.
pub fn parse_target(target: &str) -> anyhow::Result<Target> {
    let target = target.trim();
    let rest = match target.split_once("://") {
        Some(("http", rest)) => rest,
        Some((scheme, _)) => anyhow::bail!("unsupported scheme {scheme:?}"),
        None => target,
    };
    let (authority, path) = match rest.find('/') {
        Some(index) => rest.split_at(index),
        None => (rest, ""),
    };
    anyhow::ensure!(!authority.is_empty(), "missing host in {target:?}");
    let authority = match authority.rsplit_once(':') {
        // a colon inside brackets belongs to an ipv6 literal
        Some((host, port)) if !port.contains(']') => {
            let port = port
                .parse::<u16>()
                .with_context(|| format!("invalid port in {target:?}"))?;
            format!("{host}:{port}")
        }
        _ => format!("{authority}:{DEFAULT_PORT}"),
    };
    let path = match path.trim_end_matches('/') {
        "" => WEATHER_PATH.into(),
        path => path.into(),
    };
    Ok(Target { authority, path })
}

#[derive(Debug)]
pub struct Client {
    http: reqwest::Client,
    url: String,
    source_id: String,
    clock: LamportClock,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl Client {
    pub fn new(target: &Target, source_id: impl Into<String>) -> anyhow::Result<Self> {
        Ok(Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()?,
            url: target.url(),
            source_id: source_id.into(),
            clock: LamportClock::new(),
            policy: RetryPolicy::default(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    // cancelling interrupts a pending backoff sleep
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn clock(&self) -> &LamportClock {
        &self.clock
    }

    pub async fn put(&self, body: &[u8]) -> anyhow::Result<Reply> {
        self.send(Method::PUT, body).await
    }

    pub async fn get(&self) -> anyhow::Result<Reply> {
        self.send(Method::GET, &[]).await
    }

    async fn send(&self, method: Method, body: &[u8]) -> anyhow::Result<Reply> {
        self.policy
            .execute(|_| self.attempt(method.clone(), body), &self.cancel)
            .await
    }

    async fn attempt(&self, method: Method, body: &[u8]) -> Result<Reply, Failure> {
        let mut request = self
            .http
            .request(method.clone(), &self.url)
            .header(SOURCE_ID, &self.source_id)
            .header(LAMPORT_CLOCK, self.clock.tick());
        if !body.is_empty() {
            request = request
                .header(CONTENT_TYPE, "application/json")
                .body(body.to_vec())
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("{method} {}", self.url))
            .map_err(Failure::transient)?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .with_context(|| format!("{method} {} body", self.url))
            .map_err(Failure::transient)?
            .to_vec();
        if let Some(remote) = header_str(&headers, LAMPORT_CLOCK)
            .and_then(|value| value.trim().parse::<LogicalTime>().ok())
            .filter(|remote| *remote <= MAX_PRESENTED)
        {
            self.clock.on_receive(remote);
        }
        match status {
            StatusCode::TOO_MANY_REQUESTS
            | StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::SERVICE_UNAVAILABLE => Err(Failure::Transient {
                error: anyhow::anyhow!(
                    "{method} {} answered {status}: {}",
                    self.url,
                    String::from_utf8_lossy(&body)
                ),
                retry_after: header_str(&headers, "retry-after")
                    .and_then(|value| value.trim().parse().ok())
                    .map(Duration::from_secs),
            }),
            _ => Ok(Reply {
                status,
                headers,
                body,
            }),
        }
    }
}

/// Turns a local feed into a write body. Text starting with `{` is sent as it
/// is, otherwise `key: value` lines become a flat object of strings. Blank text
/// becomes an empty body.
pub fn reading_from_text(text: &str) -> anyhow::Result<Vec<u8>> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(Vec::new());
    }
    if text.starts_with('{') {
        return Ok(text.as_bytes().to_vec());
    }
    let mut reading = Map::new();
    for line in text.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim().replace(' ', "_");
        if key.is_empty() {
            continue;
        }
        reading.insert(key, Value::String(value.trim().into()));
    }
    anyhow::ensure!(
        reading
            .get(ENTITY_ID_KEY)
            .and_then(Value::as_str)
            .is_some_and(|id| !id.is_empty()),
        "feed is missing {ENTITY_ID_KEY:?}"
    );
    Ok(serde_json::to_vec(&reading)?)
}

pub async fn reading_from_file(path: impl AsRef<Path>) -> anyhow::Result<Vec<u8>> {
    let path = path.as_ref();
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("read {}", path.display()))?;
    reading_from_text(&text)
}

/// Formats a read response body, one `=== id ===` block per entity.
pub fn render(body: &[u8], filter: Option<&str>) -> anyhow::Result<String> {
    let all = serde_json::from_slice::<Map<String, Value>>(body)?;
    let mut out = String::new();
    let mut block = |id: &str, reading: &Value| {
        out.push_str(&format!("=== {id} ===\n"));
        if let Value::Object(fields) = reading {
            for (key, value) in fields {
                // strings without their json quotes
                let value = match value {
                    Value::String(value) => value.clone(),
                    value => value.to_string(),
                };
                out.push_str(&format!("{key}: {value}\n"))
            }
        }
        out.push('\n')
    };
    match filter.filter(|id| !id.trim().is_empty()) {
        Some(id) => match all.get(id) {
            Some(reading) => block(id, reading),
            None => return Ok(format!("No data for {id}\n")),
        },
        None => all.iter().for_each(|(id, reading)| block(id, reading)),
    }
    Ok(out)
}
