//! HTTP/S block source.
//!
//! Serves reads (and optional writes) against a remote URL using byte-range
//! requests.  Every request constructs a fresh transfer; all transfers are
//! multiplexed by a single background worker that owns the HTTP engine
//! (see [`worker`]).  The device size comes from a HEAD probe, with a GET
//! fallback for servers that forbid HEAD but answer GET.

mod worker;

use once_cell::sync::OnceCell;
use reqwest::Method;
use serde::{Deserialize, Serialize};

use crate::api::{CmdFlags, DeviceError, OpResult, ThreadModel};
use crate::backend::{Handle, Plugin};
use crate::config::{parse_bool, parse_unsigned, ConfigError, ConfigResult};

use worker::{HttpWorker, Transfer};

/// Connection parameters for the HTTP source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// The remote URL (required).
    pub url: Option<String>,
    /// Connection-pool sizing for the engine.
    pub connections: u32,
    /// Value of the `Cookie` header.
    pub cookie: Option<String>,
    /// Extra headers sent with every request.
    pub headers: Vec<(String, String)>,
    /// Basic-auth username.
    pub user: Option<String>,
    /// Basic-auth password.
    pub password: Option<String>,
    /// Proxy URL.
    pub proxy: Option<String>,
    /// Per-transfer timeout in seconds; 0 disables.
    pub timeout: Option<u64>,
    /// `User-Agent` header.
    pub user_agent: Option<String>,
    /// Verify TLS certificates (default true).
    pub sslverify: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        HttpConfig {
            url: None,
            connections: 16,
            cookie: None,
            headers: Vec::new(),
            user: None,
            password: None,
            proxy: None,
            timeout: None,
            user_agent: None,
            sslverify: true,
        }
    }
}

/// The HTTP plugin.
pub struct HttpPlugin {
    cfg: HttpConfig,
    worker: OnceCell<HttpWorker>,
}

struct HttpConn {
    readonly: bool,
}

impl Default for HttpPlugin {
    fn default() -> Self {
        HttpPlugin::with_config(HttpConfig::default())
    }
}

impl HttpPlugin {
    /// A plugin serving the given URL with default settings.
    pub fn new(url: impl Into<String>) -> HttpPlugin {
        let mut cfg = HttpConfig::default();
        cfg.url = Some(url.into());
        HttpPlugin::with_config(cfg)
    }

    /// A plugin with the given connection parameters.
    pub fn with_config(cfg: HttpConfig) -> HttpPlugin {
        HttpPlugin {
            cfg,
            worker: OnceCell::new(),
        }
    }

    fn url(&self) -> OpResult<&str> {
        self.cfg
            .url
            .as_deref()
            .ok_or_else(|| DeviceError::inval("http: no url was configured"))
    }

    fn worker(&self) -> OpResult<&HttpWorker> {
        self.worker
            .get()
            .ok_or_else(|| DeviceError::inval("http: the transfer worker is not running"))
    }

    fn is_http_url(&self) -> bool {
        self.cfg
            .url
            .as_deref()
            .map(|u| {
                let u = u.to_ascii_lowercase();
                u.starts_with("http://") || u.starts_with("https://")
            })
            .unwrap_or(false)
    }
}

impl Plugin for HttpPlugin {
    fn name(&self) -> &str {
        "http"
    }

    fn longname(&self) -> &str {
        "HTTP/S range-request plugin"
    }

    fn config_help(&self) -> &str {
        "url=<URL>               (required) The remote URL to serve.\n\
         connections=<N>         Engine connection pool size (default: 16).\n\
         cookie=<COOKIE>         Cookie header sent with every request.\n\
         header=<NAME>:<VALUE>   Extra header, may be repeated.\n\
         password=<PASSWORD>     Basic-auth password.\n\
         proxy=<URL>             Proxy to use.\n\
         timeout=<N>             Per-transfer timeout in seconds, 0 disables.\n\
         user=<USER>             Basic-auth username.\n\
         user-agent=<UA>         User-Agent header.\n\
         sslverify=yes|no        Verify TLS certificates (default: yes)."
    }

    fn magic_config_key(&self) -> Option<&str> {
        Some("url")
    }

    fn config(&mut self, key: &str, value: &str) -> ConfigResult<()> {
        match key {
            "url" => self.cfg.url = Some(value.to_string()),
            "connections" => {
                let n = parse_unsigned("connections", value)?;
                if n == 0 {
                    return Err(ConfigError::invalid("connections cannot be 0"));
                }
                self.cfg.connections = n;
            }
            "cookie" => self.cfg.cookie = Some(value.to_string()),
            "header" => {
                let (name, val) = value.split_once(':').ok_or_else(|| {
                    ConfigError::invalid("header must have the form <NAME>:<VALUE>")
                })?;
                self.cfg
                    .headers
                    .push((name.trim().to_string(), val.trim().to_string()));
            }
            "password" => self.cfg.password = Some(value.to_string()),
            "proxy" => self.cfg.proxy = Some(value.to_string()),
            "timeout" => self.cfg.timeout = Some(u64::from(parse_unsigned("timeout", value)?)),
            "user" => self.cfg.user = Some(value.to_string()),
            "user-agent" => self.cfg.user_agent = Some(value.to_string()),
            "sslverify" => self.cfg.sslverify = parse_bool(value)?,
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        }
        Ok(())
    }

    fn config_complete(&mut self) -> ConfigResult<()> {
        if self.cfg.url.is_none() {
            return Err(ConfigError::invalid("you must supply the url parameter"));
        }
        Ok(())
    }

    fn thread_model(&self) -> ThreadModel {
        ThreadModel::Parallel
    }

    /// The worker (and with it the engine) starts once the outer server
    /// has forked; serving threads only ever talk to the queue.
    fn after_fork(&self) -> ConfigResult<()> {
        let worker = HttpWorker::start(&self.cfg)
            .map_err(|e| ConfigError::invalid(e.to_string()))?;
        let _ = self.worker.set(worker);
        Ok(())
    }

    fn unload(&self) {
        if let Some(worker) = self.worker.get() {
            worker.stop();
        }
    }

    fn open(&self, readonly: bool) -> OpResult<Handle> {
        Ok(Handle::new(HttpConn { readonly }))
    }

    /// Multi-conn is safe for read-only connections, but HTTP has no
    /// notion of flushing, so read-write connections cannot promise
    /// cross-connection consistency.
    fn can_multi_conn(&self, h: &Handle) -> OpResult<bool> {
        let conn = h
            .get::<HttpConn>()
            .ok_or_else(|| DeviceError::inval("http: wrong handle type"))?;
        Ok(conn.readonly)
    }

    fn can_write(&self, _h: &Handle) -> OpResult<bool> {
        Ok(true)
    }

    fn get_size(&self, _h: &Handle) -> OpResult<u64> {
        let url = self.url()?.to_string();
        let worker = self.worker()?;

        let mut outcome = worker.submit(Transfer {
            method: Method::HEAD,
            url: url.clone(),
            range: None,
            body: None,
            capture: 0,
        })?;

        // Some servers forbid HEAD but answer GET; fetch the headers with
        // a GET whose body is abandoned immediately.
        if outcome.status == 403 {
            log::debug!("HEAD returned 403, attempting to fetch headers using GET");
            outcome = worker.submit(Transfer {
                method: Method::GET,
                url: url.clone(),
                range: None,
                body: None,
                capture: 0,
            })?;
        }

        if !(200..300).contains(&outcome.status) {
            return Err(DeviceError::io(format!(
                "problem fetching the size of URL [{}]: HTTP status {}",
                url, outcome.status
            )));
        }

        // Servers using chunked encoding have no usable content length;
        // the engine reports none in that case.
        let size = outcome.content_length.ok_or_else(|| {
            DeviceError::io(format!(
                "could not get the length of the remote file [{}], is the URL correct?",
                url
            ))
        })?;
        log::debug!("content length: {}", size);

        if self.is_http_url() && !outcome.accept_ranges {
            return Err(DeviceError::io(
                "the server does not support 'range' (byte range) requests",
            ));
        }

        Ok(size)
    }

    fn pread(&self, _h: &Handle, buf: &mut [u8], offset: u64, _flags: CmdFlags) -> OpResult<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let url = self.url()?.to_string();
        let worker = self.worker()?;
        let count = buf.len();

        let outcome = worker.submit(Transfer {
            method: Method::GET,
            url: url.clone(),
            range: Some((offset, offset + count as u64 - 1)),
            body: None,
            capture: count,
        })?;

        if !(200..300).contains(&outcome.status) {
            return Err(DeviceError::io(format!(
                "pread: [{}]: HTTP status {}",
                url, outcome.status
            )));
        }
        if outcome.body.len() < count {
            return Err(DeviceError::io(format!(
                "pread: [{}]: short read ({} of {} bytes)",
                url,
                outcome.body.len(),
                count
            )));
        }
        buf.copy_from_slice(&outcome.body[..count]);
        Ok(())
    }

    fn pwrite(&self, h: &Handle, buf: &[u8], offset: u64, _flags: CmdFlags) -> OpResult<()> {
        let conn = h
            .get::<HttpConn>()
            .ok_or_else(|| DeviceError::inval("http: wrong handle type"))?;
        if conn.readonly {
            return Err(DeviceError::rofs("connection is read-only"));
        }
        if buf.is_empty() {
            return Ok(());
        }
        let url = self.url()?.to_string();
        let worker = self.worker()?;

        let outcome = worker.submit(Transfer {
            method: Method::PUT,
            url: url.clone(),
            range: Some((offset, offset + buf.len() as u64 - 1)),
            body: Some(buf.to_vec()),
            capture: 0,
        })?;

        if !(200..300).contains(&outcome.status) {
            return Err(DeviceError::io(format!(
                "pwrite: [{}]: HTTP status {}",
                url, outcome.status
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    use crate::backend::ChainBuilder;

    /// A tiny single-purpose HTTP/1.1 server for driving the plugin
    /// without the network: serves a fixed byte pattern with range
    /// support, optionally refusing HEAD.
    fn spawn_server(data: Vec<u8>, forbid_head: bool) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let mut stream = match stream {
                    Ok(s) => s,
                    Err(_) => break,
                };
                let data = data.clone();
                std::thread::spawn(move || {
                    let mut req = Vec::new();
                    let mut byte = [0u8; 1];
                    while !req.ends_with(b"\r\n\r\n") {
                        match stream.read(&mut byte) {
                            Ok(1) => req.push(byte[0]),
                            _ => return,
                        }
                    }
                    let req = String::from_utf8_lossy(&req);
                    let head = req.starts_with("HEAD");
                    let range = req
                        .lines()
                        .find_map(|l| l.strip_prefix("range: ").or_else(|| l.strip_prefix("Range: ")))
                        .and_then(|r| r.strip_prefix("bytes="))
                        .and_then(|r| {
                            let (a, b) = r.trim().split_once('-')?;
                            Some((a.parse::<usize>().ok()?, b.parse::<usize>().ok()?))
                        });

                    if head && forbid_head {
                        let _ = stream.write_all(
                            b"HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                        );
                        return;
                    }

                    let (status, body) = match range {
                        Some((a, b)) if b < data.len() => ("206 Partial Content", &data[a..=b]),
                        _ => ("200 OK", &data[..]),
                    };
                    let mut resp = format!(
                        "HTTP/1.1 {}\r\nContent-Length: {}\r\nAccept-Ranges: bytes\r\nConnection: close\r\n\r\n",
                        status,
                        body.len()
                    )
                    .into_bytes();
                    if !head {
                        resp.extend_from_slice(body);
                    }
                    let _ = stream.write_all(&resp);
                });
            }
        });
        format!("http://{}/disk", addr)
    }

    fn http_chain(url: String) -> crate::backend::Chain {
        let mut builder = ChainBuilder::new(Box::new(HttpPlugin::new(url))).unwrap();
        builder.config_complete().unwrap();
        let chain = builder.ready().unwrap();
        chain.after_fork().unwrap();
        chain
    }

    fn test_pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 253) as u8).collect()
    }

    #[test]
    fn head_probe_and_range_reads() {
        let data = test_pattern(64 * 1024);
        let url = spawn_server(data.clone(), false);
        let chain = http_chain(url);
        let conn = chain.connect(true, "").unwrap();

        assert_eq!(conn.get_size().unwrap(), data.len() as u64);

        let mut buf = vec![0u8; 512];
        conn.pread(&mut buf, 1000, CmdFlags::empty()).unwrap();
        assert_eq!(&buf[..], &data[1000..1512]);

        assert!(conn.can_multi_conn().unwrap());
        chain.disconnect(conn).unwrap();
    }

    #[test]
    fn head_forbidden_falls_back_to_get() {
        let data = test_pattern(8192);
        let url = spawn_server(data, true);
        let chain = http_chain(url);
        let conn = chain.connect(true, "").unwrap();
        assert_eq!(conn.get_size().unwrap(), 8192);
        chain.disconnect(conn).unwrap();
    }

    #[test]
    fn read_write_connection_disables_multi_conn() {
        let url = spawn_server(test_pattern(4096), false);
        let chain = http_chain(url);
        let conn = chain.connect(false, "").unwrap();
        assert!(!conn.can_multi_conn().unwrap());
        chain.disconnect(conn).unwrap();
    }

    #[test]
    fn missing_url_fails_config_complete() {
        let mut builder =
            ChainBuilder::new(Box::new(HttpPlugin::with_config(HttpConfig::default()))).unwrap();
        assert!(builder.config_complete().is_err());
    }

    #[test]
    fn config_keys_round_trip() {
        let mut plugin = HttpPlugin::default();
        plugin.config("url", "https://example.com/disk.img").unwrap();
        plugin.config("connections", "4").unwrap();
        plugin.config("header", "X-Auth: secret").unwrap();
        plugin.config("timeout", "30").unwrap();
        plugin.config("sslverify", "no").unwrap();
        assert!(plugin.config("no-such-key", "x").is_err());
        assert!(plugin.config("connections", "0").is_err());
        assert_eq!(plugin.cfg.connections, 4);
        assert_eq!(plugin.cfg.headers[0], ("X-Auth".to_string(), "secret".to_string()));
        assert_eq!(plugin.cfg.timeout, Some(30));
        assert!(!plugin.cfg.sslverify);
    }
}
