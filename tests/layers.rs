//! Chain dispatch ordering: control flow through stacked layers.
//!
//! Builds a three-filter chain over a logging plugin and asserts the
//! contractual orders: requests descend outer-to-inner and return
//! inner-to-outer; open completes inner-to-outer; prepare runs
//! inner-to-outer; finalize and close run outer-to-inner; and every layer
//! is dispatched with its own handle.

use std::sync::Arc;

use parking_lot::Mutex;

use nbdstack::backend::{ChainBuilder, Filter, Handle, NextCtx, NextOpen, Plugin};
use nbdstack::{CmdFlags, OpResult, ThreadModel};

type Log = Arc<Mutex<Vec<String>>>;

struct LogPlugin {
    log: Log,
}

impl Plugin for LogPlugin {
    fn name(&self) -> &str {
        "logplugin"
    }

    fn open(&self, _readonly: bool) -> OpResult<Handle> {
        self.log.lock().push("plugin-open".to_string());
        Ok(Handle::new("logplugin".to_string()))
    }

    fn close(&self, _h: &Handle) {
        self.log.lock().push("plugin-close".to_string());
    }

    fn get_size(&self, _h: &Handle) -> OpResult<u64> {
        Ok(1 << 20)
    }

    fn pread(&self, h: &Handle, buf: &mut [u8], _offset: u64, _flags: CmdFlags) -> OpResult<()> {
        assert_eq!(h.get::<String>().map(String::as_str), Some("logplugin"));
        self.log.lock().push("plugin-pread".to_string());
        buf.fill(0);
        Ok(())
    }
}

struct Recorder {
    tag: &'static str,
    log: Log,
}

impl Recorder {
    fn push(&self, event: &str) {
        self.log.lock().push(format!("{}-{}", self.tag, event));
    }
}

impl Filter for Recorder {
    fn name(&self) -> &str {
        self.tag
    }

    fn open(&self, next: NextOpen<'_>, readonly: bool, exportname: &str) -> OpResult<Handle> {
        self.push("open-pre");
        next.open(readonly, exportname)?;
        self.push("open-post");
        Ok(Handle::new(self.tag))
    }

    fn close(&self, handle: &Handle) {
        assert_eq!(handle.get::<&'static str>(), Some(&self.tag));
        self.push("close");
    }

    fn prepare(&self, _next: &NextCtx<'_>, handle: &Handle, _readonly: bool) -> OpResult<()> {
        assert_eq!(handle.get::<&'static str>(), Some(&self.tag));
        self.push("prepare");
        Ok(())
    }

    fn finalize(&self, _next: &NextCtx<'_>, handle: &Handle) -> OpResult<()> {
        assert_eq!(handle.get::<&'static str>(), Some(&self.tag));
        self.push("finalize");
        Ok(())
    }

    fn pread(
        &self,
        next: &NextCtx<'_>,
        handle: &Handle,
        buf: &mut [u8],
        offset: u64,
        flags: CmdFlags,
    ) -> OpResult<()> {
        // Invariant: this layer is dispatched with its own handle, never
        // an adjacent layer's.
        assert_eq!(handle.get::<&'static str>(), Some(&self.tag));
        self.push("pread-pre");
        next.pread(buf, offset, flags)?;
        self.push("pread-post");
        Ok(())
    }
}

fn recorded_chain(log: &Log) -> nbdstack::Chain {
    let _ = env_logger::builder().is_test(true).try_init();
    // filter1 is innermost, filter3 outermost.
    ChainBuilder::new(Box::new(LogPlugin { log: log.clone() }))
        .unwrap()
        .filter(Box::new(Recorder {
            tag: "filter1",
            log: log.clone(),
        }))
        .unwrap()
        .filter(Box::new(Recorder {
            tag: "filter2",
            log: log.clone(),
        }))
        .unwrap()
        .filter(Box::new(Recorder {
            tag: "filter3",
            log: log.clone(),
        }))
        .unwrap()
        .ready()
        .unwrap()
}

#[test]
fn request_flow_is_outer_to_inner_and_back() {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let chain = recorded_chain(&log);
    let conn = chain.connect(true, "").unwrap();

    log.lock().clear();
    let mut buf = [0u8; 512];
    conn.pread(&mut buf, 0, CmdFlags::empty()).unwrap();

    assert_eq!(
        &*log.lock(),
        &[
            "filter3-pread-pre",
            "filter2-pread-pre",
            "filter1-pread-pre",
            "plugin-pread",
            "filter1-pread-post",
            "filter2-pread-post",
            "filter3-pread-post",
        ]
    );
    chain.disconnect(conn).unwrap();
}

#[test]
fn open_completes_inner_to_outer() {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let chain = recorded_chain(&log);
    let conn = chain.connect(true, "").unwrap();

    let events = log.lock().clone();
    let open_events: Vec<&str> = events
        .iter()
        .map(String::as_str)
        .filter(|e| e.contains("open"))
        .collect();
    assert_eq!(
        open_events,
        [
            "filter3-open-pre",
            "filter2-open-pre",
            "filter1-open-pre",
            "plugin-open",
            "filter1-open-post",
            "filter2-open-post",
            "filter3-open-post",
        ]
    );
    chain.disconnect(conn).unwrap();
}

#[test]
fn prepare_runs_inner_to_outer_finalize_outer_to_inner() {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let chain = recorded_chain(&log);
    let conn = chain.connect(true, "").unwrap();

    let prepares: Vec<String> = log
        .lock()
        .iter()
        .filter(|e| e.contains("prepare"))
        .cloned()
        .collect();
    assert_eq!(
        prepares,
        ["filter1-prepare", "filter2-prepare", "filter3-prepare"]
    );

    log.lock().clear();
    chain.disconnect(conn).unwrap();
    let teardown = log.lock().clone();
    assert_eq!(
        teardown,
        [
            "filter3-finalize",
            "filter2-finalize",
            "filter1-finalize",
            "filter3-close",
            "filter2-close",
            "filter1-close",
            "plugin-close",
        ]
    );
}

#[test]
fn chain_defaults_to_parallel() {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let chain = recorded_chain(&log);
    assert_eq!(chain.thread_model(), ThreadModel::Parallel);
}
