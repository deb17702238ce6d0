use core::{net::SocketAddr, time::Duration};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{anyhow, bail, Context, Error};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::Value;

use crate::{
    cmd::Cmd,
    request::{build_images, BodySpec, ChunkPlan, RequestImage},
    resolve::AddrCache,
};

/// Upper bound on per-template client replication.
pub const MAX_CLIENTS: u64 = 32768;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    #[inline]
    pub fn default_port(self) -> u16 {
        match self {
            Self::Http => 80,
            Self::Https => 443,
        }
    }
}

/// TCP keep-alive probing parameters.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpKeepAliveCfg {
    pub enable: bool,
    /// Seconds of idleness before probing begins.
    pub idle: u64,
    /// Seconds between probes.
    pub intvl: u64,
    /// Probes sent before the connection is dropped.
    pub cnt: u32,
}

/// One immutable connection description from the input file.
///
/// Built once at configuration load and shared by every client instance
/// replicated from it; the pre-rendered request images are borrowed through
/// the `Arc`, never copied per client.
#[derive(Debug)]
pub struct Template {
    /// Index of the file entry this template came from.
    pub id: usize,
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub addr_to: SocketAddr,
    pub addr_from: Option<SocketAddr>,
    /// Keep-alive request image.
    pub request: RequestImage,
    /// `Connection: close` request image.
    pub request_cclose: RequestImage,
    pub body: Option<BodySpec>,
    pub chunk_plan: Option<ChunkPlan>,
    /// Inter-request delay bounds [ms].
    pub delay_min: u64,
    pub delay_max: u64,
    /// Per-connection ramp-up window [ms].
    pub ramp_up_ms: u64,
    /// Lifetime request cap, 0 = unlimited.
    pub reqs_max: u64,
    /// Requests per established connection before reconnecting, 0 = unlimited.
    pub keep_alive_reqs: u64,
    /// Whether the client initiates connection close.
    pub close_client: bool,
    /// SO_LINGER seconds, when lingering is requested.
    pub close_linger: Option<u64>,
    /// Whether every request carries `Connection: close`.
    pub cclose: bool,
    pub tcp_keep_alive: TcpKeepAliveCfg,
    pub tls_session_reuse: bool,
    /// How many client instances to run off this template.
    pub clients: usize,
}

#[derive(Debug)]
pub struct Config {
    pub cookies: bool,
    pub duration: Duration,
    /// Worker-thread ramp-up window.
    pub ramp_up: Duration,
    pub threads: usize,
    pub ssl_version: u8,
    pub response_file: Option<PathBuf>,
    pub templates: Vec<Arc<Template>>,
}

impl TryFrom<Cmd> for Config {
    type Error = Error;

    fn try_from(cmd: Cmd) -> Result<Self, Self::Error> {
        if cmd.duration == 0 {
            bail!("duration must be > 0");
        }
        if cmd.ramp_up >= cmd.duration {
            bail!(
                "ramp-up time ({}) >= test duration ({})",
                cmd.ramp_up,
                cmd.duration
            );
        }
        if cmd.ssl_version > 4 {
            bail!("ssl-version must be >= 0 and <= 4");
        }
        if cmd.threads == 0 {
            bail!("number of threads must be > 0");
        }

        let mut resolver = AddrCache::new()?;
        let templates = load_request_file(&cmd.request_file, &mut resolver)?;

        Ok(Self {
            cookies: cmd.cookies,
            duration: Duration::from_secs(cmd.duration),
            ramp_up: Duration::from_secs(cmd.ramp_up),
            threads: cmd.threads,
            ssl_version: cmd.ssl_version,
            response_file: cmd.response_file,
            templates,
        })
    }
}

pub fn load_request_file(
    path: &Path,
    resolver: &mut AddrCache,
) -> Result<Vec<Arc<Template>>, Error> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("unable to read `{}'", path.display()))?;

    templates_from_str(&data, resolver)
}

/// Parses the JSON request array into templates.
///
/// Unknown keys and type mismatches are fatal; the error message names the
/// offending key. Target and source hosts are resolved here, so resolution
/// failures abort before any worker starts.
pub fn templates_from_str(
    data: &str,
    resolver: &mut AddrCache,
) -> Result<Vec<Arc<Template>>, Error> {
    let mut de = serde_json::Deserializer::from_str(data);
    let raw: Vec<RawConnection> = serde_path_to_error::deserialize(&mut de)
        .map_err(|err| anyhow!("invalid input request file: {err}"))?;

    if raw.is_empty() {
        bail!("no requests found in the input request file");
    }

    raw.into_iter()
        .enumerate()
        .map(|(id, rc)| Ok(Arc::new(template_from_raw(id, rc, resolver)?)))
        .collect()
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConnection {
    host: String,
    port: u16,
    host_from: Option<String>,
    scheme: Option<RawScheme>,
    method: Option<String>,
    path: Option<String>,
    headers: Option<serde_json::Map<String, Value>>,
    body: Option<RawBody>,
    delay: Option<RawDelay>,
    tcp: Option<RawTcp>,
    close: Option<RawClose>,
    #[serde(rename = "max-requests")]
    max_requests: Option<u64>,
    #[serde(rename = "keep-alive-requests")]
    keep_alive_requests: Option<u64>,
    #[serde(rename = "tls-session-reuse")]
    tls_session_reuse: Option<bool>,
    clients: Option<u64>,
    #[serde(rename = "ramp-up")]
    ramp_up: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum RawScheme {
    Http,
    Https,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawBody {
    /// Versions up to 0.1.5 used a bare string for "body".
    Legacy(String),
    Spec(RawBodySpec),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawBodySpec {
    content: Option<String>,
    size: Option<u64>,
    #[serde(rename = "type")]
    kind: Option<RawBodyKind>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum RawBodyKind {
    Content,
    Random,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDelay {
    min: Option<u64>,
    max: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTcp {
    #[serde(rename = "keep-alive")]
    keep_alive: Option<RawTcpKeepAlive>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTcpKeepAlive {
    enable: Option<bool>,
    idle: Option<u64>,
    intvl: Option<u64>,
    cnt: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawClose {
    client: Option<bool>,
    linger: Option<u64>,
}

fn body_from_raw(raw: Option<RawBody>) -> Result<Option<BodySpec>, Error> {
    let Some(raw) = raw else {
        return Ok(None);
    };

    match raw {
        RawBody::Legacy(s) => {
            log::warn!(
                "using string type for request body is deprecated, \
                 please change your input request file"
            );
            Ok(Some(BodySpec::Content(Bytes::from(s))))
        }
        RawBody::Spec(spec) => match spec.kind {
            Some(RawBodyKind::Random) => {
                if spec.content.is_some() {
                    log::warn!(
                        "request body content provided but body random type specified; \
                         ignoring request's body.content"
                    );
                }
                match spec.size {
                    Some(0) | None => bail!(
                        "request's body.size cannot be 0 when request's body random type \
                         is specified"
                    ),
                    Some(size) => Ok(Some(BodySpec::Random(size))),
                }
            }
            Some(RawBodyKind::Content) | None => {
                Ok(spec.content.map(|c| BodySpec::Content(Bytes::from(c))))
            }
        },
    }
}

fn template_from_raw(
    id: usize,
    raw: RawConnection,
    resolver: &mut AddrCache,
) -> Result<Template, Error> {
    let scheme = match raw.scheme {
        Some(RawScheme::Https) => Scheme::Https,
        Some(RawScheme::Http) | None => Scheme::Http,
    };
    let method = raw.method.unwrap_or_else(|| "GET".to_string());
    let path = raw.path.unwrap_or_else(|| "/".to_string());

    let mut headers = Vec::new();
    if let Some(map) = raw.headers {
        for (k, v) in map {
            let Value::String(v) = v else {
                bail!("invalid input request file: string expected for headers.{k}");
            };
            headers.push((k, v));
        }
    }

    let (delay_min, delay_max) = match raw.delay {
        Some(d) => (d.min.unwrap_or(0), d.max.unwrap_or(0)),
        None => (0, 0),
    };
    if delay_min > delay_max {
        bail!(
            "invalid input request file: delay.min ({delay_min}) > delay.max ({delay_max})"
        );
    }

    let tcp_keep_alive = match raw.tcp.and_then(|t| t.keep_alive) {
        Some(ka) => TcpKeepAliveCfg {
            enable: ka.enable.unwrap_or(false),
            idle: ka.idle.unwrap_or(0),
            intvl: ka.intvl.unwrap_or(0),
            cnt: ka.cnt.unwrap_or(0),
        },
        None => TcpKeepAliveCfg::default(),
    };

    let (close_client, close_linger) = match raw.close {
        Some(c) => (c.client.unwrap_or(false), c.linger),
        None => (false, None),
    };

    let clients = raw.clients.unwrap_or(1);
    if clients == 0 {
        bail!("clients must be >= 1");
    }
    if clients > MAX_CLIENTS {
        bail!("too many clients specified for a request ({clients} > {MAX_CLIENTS})");
    }

    let body = body_from_raw(raw.body)?;
    let chunk_plan = match &body {
        Some(BodySpec::Random(size)) => Some(ChunkPlan::new(*size)),
        _ => None,
    };

    let addr_to = resolver.resolve(&raw.host, raw.port)?;
    let addr_from = match &raw.host_from {
        Some(host) => Some(resolver.resolve(host, 0)?),
        None => None,
    };

    let (request, request_cclose) = build_images(
        scheme,
        &raw.host,
        raw.port,
        &method,
        &path,
        &headers,
        body.as_ref(),
    );

    Ok(Template {
        id,
        scheme,
        host: raw.host,
        port: raw.port,
        addr_to,
        addr_from,
        request,
        request_cclose,
        body,
        chunk_plan,
        delay_min,
        delay_max,
        ramp_up_ms: raw.ramp_up.unwrap_or(0),
        reqs_max: raw.max_requests.unwrap_or(0),
        keep_alive_reqs: raw.keep_alive_requests.unwrap_or(0),
        close_client,
        close_linger,
        cclose: close_client,
        tcp_keep_alive,
        tls_session_reuse: raw.tls_session_reuse.unwrap_or(false),
        clients: clients as usize,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(data: &str) -> Result<Vec<Arc<Template>>, Error> {
        let mut resolver = AddrCache::new().unwrap();
        templates_from_str(data, &mut resolver)
    }

    #[test]
    fn full_entry() {
        let templates = load(
            r#"[{
                "host": "127.0.0.1",
                "port": 8080,
                "scheme": "http",
                "method": "POST",
                "path": "/api",
                "headers": {"X-A": "1", "X-B": "2"},
                "body": {"type": "random", "size": 1000},
                "delay": {"min": 10, "max": 20},
                "tcp": {"keep-alive": {"enable": true, "idle": 30, "intvl": 5, "cnt": 3}},
                "close": {"client": true, "linger": 0},
                "max-requests": 100,
                "keep-alive-requests": 10,
                "tls-session-reuse": false,
                "clients": 4,
                "ramp-up": 500
            }]"#,
        )
        .unwrap();

        assert_eq!(templates.len(), 1);
        let t = &templates[0];
        assert_eq!(t.addr_to, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(t.clients, 4);
        assert_eq!((t.delay_min, t.delay_max), (10, 20));
        assert_eq!(t.reqs_max, 100);
        assert_eq!(t.keep_alive_reqs, 10);
        assert_eq!(t.ramp_up_ms, 500);
        assert!(t.close_client && t.cclose);
        assert_eq!(t.close_linger, Some(0));
        assert!(t.tcp_keep_alive.enable);
        assert!(t.chunk_plan.is_some());
        assert!(matches!(t.body, Some(BodySpec::Random(1000))));

        let image = String::from_utf8(t.request.bytes().to_vec()).unwrap();
        assert!(image.starts_with("POST /api HTTP/1.1\r\n"));
        assert!(image.contains("X-A: 1\r\n"));
        assert!(image.contains("Transfer-Encoding: chunked\r\n"));
    }

    #[test]
    fn minimal_entry_gets_defaults() {
        let templates = load(r#"[{"host": "127.0.0.1", "port": 80}]"#).unwrap();
        let t = &templates[0];

        assert_eq!(t.scheme, Scheme::Http);
        assert_eq!(t.clients, 1);
        assert_eq!(t.reqs_max, 0);
        assert_eq!(t.keep_alive_reqs, 0);
        assert!(t.body.is_none());

        let image = String::from_utf8(t.request.bytes().to_vec()).unwrap();
        assert!(image.starts_with("GET / HTTP/1.1\r\nHost: 127.0.0.1\r\n"));
    }

    #[test]
    fn legacy_string_body_is_content() {
        let templates =
            load(r#"[{"host": "127.0.0.1", "port": 80, "body": "payload"}]"#).unwrap();

        assert!(
            matches!(&templates[0].body, Some(BodySpec::Content(b)) if &b[..] == b"payload")
        );
    }

    #[test]
    fn unknown_key_is_fatal_and_named() {
        let err = load(r#"[{"host": "127.0.0.1", "port": 80, "bogus": 1}]"#).unwrap_err();
        assert!(err.to_string().contains("bogus"), "{err}");
    }

    #[test]
    fn type_mismatch_names_the_key() {
        let err = load(
            r#"[{"host": "127.0.0.1", "port": 80, "delay": {"min": "fast"}}]"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("delay.min"), "{err}");
    }

    #[test]
    fn delay_bounds_are_validated() {
        let err = load(
            r#"[{"host": "127.0.0.1", "port": 80, "delay": {"min": 5, "max": 1}}]"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("delay.min (5) > delay.max (1)"));
    }

    #[test]
    fn random_body_requires_a_size() {
        let err = load(
            r#"[{"host": "127.0.0.1", "port": 80, "body": {"type": "random"}}]"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("body.size"));
    }

    #[test]
    fn empty_array_is_fatal() {
        let err = load("[]").unwrap_err();
        assert!(err.to_string().contains("no requests found"));
    }

    #[test]
    fn zero_clients_is_fatal() {
        let err =
            load(r#"[{"host": "127.0.0.1", "port": 80, "clients": 0}]"#).unwrap_err();
        assert!(err.to_string().contains("clients"));
    }
}
