//! The background transfer worker.
//!
//! One worker thread owns the HTTP engine (a client plus the set of
//! in-flight transfers, driven on a current-thread async runtime).  The
//! serving threads never touch the engine: they enqueue commands over a
//! bounded channel and block on the command's completion rendezvous until
//! the worker retires it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use reqwest::header::{ACCEPT_RANGES, CONTENT_RANGE, RANGE};
use reqwest::Method;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::api::{DeviceError, OpResult};

use super::HttpConfig;

/// One HTTP transfer to carry out.
pub(super) struct Transfer {
    pub method: Method,
    pub url: String,
    /// Inclusive byte range.  Sent as `Range` on downloads and
    /// `Content-Range` on uploads.
    pub range: Option<(u64, u64)>,
    pub body: Option<Vec<u8>>,
    /// Maximum response-body bytes to keep.  Zero reads the headers and
    /// abandons the body, which is how HEAD-forbidden servers are probed.
    pub capture: usize,
}

/// What came back from a finished transfer.
#[derive(Debug, Default)]
pub(super) struct TransferOutcome {
    pub status: u16,
    pub content_length: Option<u64>,
    pub accept_ranges: bool,
    pub body: Vec<u8>,
}

enum CommandStatus {
    /// Sentinel: the worker has not retired the command yet.
    Pending,
    Done(OpResult<TransferOutcome>),
}

struct Completion {
    status: Mutex<CommandStatus>,
    cond: Condvar,
}

impl Completion {
    fn new() -> Arc<Completion> {
        Arc::new(Completion {
            status: Mutex::new(CommandStatus::Pending),
            cond: Condvar::new(),
        })
    }

    fn complete(&self, result: OpResult<TransferOutcome>) {
        let mut status = self.status.lock();
        *status = CommandStatus::Done(result);
        self.cond.notify_one();
    }

    fn wait(&self) -> OpResult<TransferOutcome> {
        let mut status = self.status.lock();
        while matches!(*status, CommandStatus::Pending) {
            self.cond.wait(&mut status);
        }
        match std::mem::replace(&mut *status, CommandStatus::Pending) {
            CommandStatus::Done(r) => r,
            CommandStatus::Pending => unreachable!(),
        }
    }
}

enum CommandKind {
    Transfer(Transfer),
    Stop,
}

struct Command {
    id: u64,
    kind: CommandKind,
    done: Arc<Completion>,
}

fn kind_name(kind: &CommandKind) -> &'static str {
    match kind {
        CommandKind::Transfer(_) => "TRANSFER",
        CommandKind::Stop => "STOP",
    }
}

/// Handle to the background worker.
pub(super) struct HttpWorker {
    tx: mpsc::Sender<Command>,
    thread: Mutex<Option<JoinHandle<()>>>,
    next_id: AtomicU64,
}

impl HttpWorker {
    /// Spawn the worker thread and its engine.
    pub(super) fn start(cfg: &HttpConfig) -> Result<HttpWorker, DeviceError> {
        let (tx, rx) = mpsc::channel(cfg.connections.max(1) as usize);
        let cfg = cfg.clone();
        let thread = std::thread::Builder::new()
            .name("http-worker".to_string())
            .spawn(move || worker_main(cfg, rx))
            .map_err(|e| DeviceError::io(format!("could not start the transfer worker: {}", e)))?;
        Ok(HttpWorker {
            tx,
            thread: Mutex::new(Some(thread)),
            next_id: AtomicU64::new(0),
        })
    }

    /// Send one transfer to the worker and wait for completion.
    pub(super) fn submit(&self, transfer: Transfer) -> OpResult<TransferOutcome> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let done = Completion::new();
        let cmd = Command {
            id,
            kind: CommandKind::Transfer(transfer),
            done: Arc::clone(&done),
        };
        log::debug!("http: dispatching TRANSFER command {}", id);
        self.tx
            .blocking_send(cmd)
            .map_err(|_| DeviceError::shutdown("the transfer worker has exited"))?;
        done.wait()
    }

    /// Stop the worker and join its thread.  Transfers still attached to
    /// the engine are aborted.
    pub(super) fn stop(&self) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let done = Completion::new();
        let cmd = Command {
            id,
            kind: CommandKind::Stop,
            done: Arc::clone(&done),
        };
        log::debug!("http: dispatching STOP command {}", id);
        if self.tx.blocking_send(cmd).is_ok() {
            let _ = done.wait();
        }
        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.join();
        }
    }
}

/// Worker thread body: build the engine, then drive transfers and the
/// command queue until STOP.
fn worker_main(cfg: HttpConfig, mut rx: mpsc::Receiver<Command>) {
    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            log::error!("http: could not build the worker runtime: {}", e);
            fail_all(&mut rx, &format!("worker runtime failed: {}", e));
            return;
        }
    };

    rt.block_on(async move {
        let client = match build_client(&cfg) {
            Ok(c) => c,
            Err(e) => {
                log::error!("http: could not build the client: {}", e);
                while let Some(cmd) = rx.recv().await {
                    let stop = matches!(cmd.kind, CommandKind::Stop);
                    cmd.done.complete(Err(e.clone()));
                    if stop {
                        break;
                    }
                }
                return;
            }
        };

        log::debug!("http: background worker thread started");
        let cfg = Arc::new(cfg);
        let mut inflight: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                cmd = rx.recv() => {
                    let Command { id, kind, done } = match cmd {
                        None => break,
                        Some(c) => c,
                    };
                    log::debug!("http: handling {} command {}", kind_name(&kind), id);
                    match kind {
                        CommandKind::Stop => {
                            done.complete(Ok(TransferOutcome::default()));
                            break;
                        }
                        CommandKind::Transfer(t) => {
                            let client = client.clone();
                            let cfg = Arc::clone(&cfg);
                            inflight.spawn(async move {
                                let r = perform(&client, &cfg, t).await;
                                log::debug!("http: retiring command {}", id);
                                done.complete(r);
                            });
                        }
                    }
                }
                Some(_finished) = inflight.join_next(), if !inflight.is_empty() => {}
            }
        }

        // Remove and destroy transfers still attached to the engine.
        inflight.abort_all();
        while inflight.join_next().await.is_some() {}
        log::debug!("http: background worker thread stopped");
    });
}

/// Fail every queued command; used when the engine cannot come up at all.
fn fail_all(rx: &mut mpsc::Receiver<Command>, message: &str) {
    while let Ok(cmd) = rx.try_recv() {
        cmd.done.complete(Err(DeviceError::io(message.to_string())));
    }
}

fn build_client(cfg: &HttpConfig) -> OpResult<reqwest::Client> {
    use reqwest::header::{HeaderMap, HeaderName, HeaderValue, COOKIE};

    let mut builder = reqwest::Client::builder();

    if let Some(ua) = &cfg.user_agent {
        builder = builder.user_agent(ua.clone());
    }

    let mut headers = HeaderMap::new();
    for (name, value) in &cfg.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| DeviceError::inval(format!("bad header name {:?}: {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| DeviceError::inval(format!("bad header value: {}", e)))?;
        headers.insert(name, value);
    }
    if let Some(cookie) = &cfg.cookie {
        let value = HeaderValue::from_str(cookie)
            .map_err(|e| DeviceError::inval(format!("bad cookie value: {}", e)))?;
        headers.insert(COOKIE, value);
    }
    if !headers.is_empty() {
        builder = builder.default_headers(headers);
    }

    if let Some(proxy) = &cfg.proxy {
        builder = builder.proxy(
            reqwest::Proxy::all(proxy)
                .map_err(|e| DeviceError::inval(format!("bad proxy {:?}: {}", proxy, e)))?,
        );
    }
    if let Some(secs) = cfg.timeout {
        if secs > 0 {
            builder = builder.timeout(std::time::Duration::from_secs(secs));
        }
    }
    if !cfg.sslverify {
        builder = builder.danger_accept_invalid_certs(true);
    }
    builder = builder.pool_max_idle_per_host(cfg.connections.max(1) as usize);

    builder
        .build()
        .map_err(|e| DeviceError::io(format!("could not build the HTTP client: {}", e)))
}

async fn perform(
    client: &reqwest::Client,
    cfg: &HttpConfig,
    t: Transfer,
) -> OpResult<TransferOutcome> {
    let mut req = client.request(t.method.clone(), &t.url);

    if let Some((start, end)) = t.range {
        if t.body.is_some() {
            req = req.header(CONTENT_RANGE, format!("bytes {}-{}/*", start, end));
        } else {
            req = req.header(RANGE, format!("bytes={}-{}", start, end));
        }
    }
    if let Some(user) = &cfg.user {
        req = req.basic_auth(user, cfg.password.as_deref());
    }
    if let Some(body) = t.body {
        req = req.body(body);
    }

    let mut resp = req
        .send()
        .await
        .map_err(|e| DeviceError::io(format!("http: {}: {}", t.url, e)))?;

    let status = resp.status().as_u16();
    let content_length = resp.content_length();
    let accept_ranges = resp
        .headers()
        .get(ACCEPT_RANGES)
        .map(|v| v.as_bytes().eq_ignore_ascii_case(b"bytes"))
        .unwrap_or(false);

    let mut body = Vec::new();
    if t.capture > 0 {
        // Keep no more than the requested amount, even if the server or
        // the engine delivers more; the rest of the stream is abandoned.
        while body.len() < t.capture {
            match resp
                .chunk()
                .await
                .map_err(|e| DeviceError::io(format!("http: {}: {}", t.url, e)))?
            {
                Some(chunk) => {
                    let take = (t.capture - body.len()).min(chunk.len());
                    body.extend_from_slice(&chunk[..take]);
                }
                None => break,
            }
        }
    }

    Ok(TransferOutcome {
        status,
        content_length,
        accept_ranges,
        body,
    })
}
