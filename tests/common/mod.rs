#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::{Cursor, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use tempfile::TempDir;
use zip::write::SimpleFileOptions;

use bts_ingest::clock::Clock;
use bts_ingest::config::PipelineConfig;
use bts_ingest::error::IngestError;
use bts_ingest::form::{FormSession, SessionSettings};
use bts_ingest::object_store::{FsObjectStore, ObjectStore};
use bts_ingest::processor::{Pipeline, ProcessOptions};
use bts_ingest::store::LocalLayout;
use bts_ingest::transport::{FormTransport, HttpReply, StreamOptions, TransportError};

pub const INVOCATION: &str = "00000000000000aa";

/// Manual clock: `sleep` only moves time forward.
#[derive(Clone)]
pub struct FakeClock {
    base: Instant,
    offset: Arc<Mutex<Duration>>,
}

impl FakeClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.offset.lock().unwrap() += by;
    }

    pub fn elapsed(&self) -> Duration {
        *self.offset.lock().unwrap()
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock().unwrap()
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

pub type Scripted = Result<HttpReply, TransportError>;

/// Pops GET and POST replies from scripts; GETs fall back to the landing page.
#[derive(Clone)]
pub struct ScriptedTransport {
    landing: Arc<Mutex<Scripted>>,
    gets_script: Arc<Mutex<VecDeque<Scripted>>>,
    posts: Arc<Mutex<VecDeque<Scripted>>>,
    post_cost: Duration,
    clock: FakeClock,
    pub gets: Arc<AtomicUsize>,
    pub buffered_posts: Arc<AtomicUsize>,
    pub streamed_posts: Arc<AtomicUsize>,
}

impl ScriptedTransport {
    pub fn new(clock: FakeClock) -> Self {
        Self {
            landing: Arc::new(Mutex::new(Ok(html_reply(200, &landing_page(&[2001]))))),
            gets_script: Arc::new(Mutex::new(VecDeque::new())),
            posts: Arc::new(Mutex::new(VecDeque::new())),
            post_cost: Duration::ZERO,
            clock,
            gets: Arc::new(AtomicUsize::new(0)),
            buffered_posts: Arc::new(AtomicUsize::new(0)),
            streamed_posts: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn set_landing(&self, reply: Scripted) {
        *self.landing.lock().unwrap() = reply;
    }

    /// Every POST moves the fake clock forward by `cost`.
    pub fn with_post_cost(mut self, cost: Duration) -> Self {
        self.post_cost = cost;
        self
    }

    /// Served by the next GET instead of the landing page.
    pub fn push_get(&self, reply: Scripted) {
        self.gets_script.lock().unwrap().push_back(reply);
    }

    pub fn push_post(&self, reply: Scripted) {
        self.posts.lock().unwrap().push_back(reply);
    }

    pub fn post_count(&self) -> usize {
        self.buffered_posts.load(Ordering::SeqCst) + self.streamed_posts.load(Ordering::SeqCst)
    }

    pub fn network_calls(&self) -> usize {
        self.gets.load(Ordering::SeqCst) + self.post_count()
    }

    fn next_post(&self) -> Scripted {
        self.clock.advance(self.post_cost);
        self.posts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(TransportError::Other("script exhausted".to_string())))
    }
}

impl FormTransport for ScriptedTransport {
    fn get(&self, _url: &str, _read_timeout: Duration) -> Scripted {
        self.gets.fetch_add(1, Ordering::SeqCst);
        match self.gets_script.lock().unwrap().pop_front() {
            Some(reply) => reply,
            None => self.landing.lock().unwrap().clone(),
        }
    }

    fn post_form(
        &self,
        _url: &str,
        _form: &[(String, String)],
        _read_timeout: Duration,
    ) -> Scripted {
        self.buffered_posts.fetch_add(1, Ordering::SeqCst);
        self.next_post()
    }

    fn post_form_streamed(
        &self,
        _url: &str,
        _form: &[(String, String)],
        _read_timeout: Duration,
        _stream: StreamOptions,
    ) -> Scripted {
        self.streamed_posts.fetch_add(1, Ordering::SeqCst);
        self.next_post()
    }
}

pub fn landing_page(years: &[i32]) -> String {
    let options: String = years
        .iter()
        .map(|y| format!(r#"<option value="{y}">{y}</option>"#))
        .collect();
    format!(
        r#"<html><body><form method="post">
        <input type="hidden" name="__VIEWSTATE" value="vs" />
        <input type="hidden" name="__VIEWSTATEGENERATOR" value="gen" />
        <input type="hidden" name="__EVENTVALIDATION" value="ev" />
        <select name="cboYear">{options}</select>
        <select name="cboPeriod"><option value="1">1</option><option value="2">2</option><option value="3">3</option><option value="4">4</option></select>
        </form></body></html>"#
    )
}

pub fn html_reply(status: u16, html: &str) -> HttpReply {
    HttpReply {
        status,
        content_type: "text/html; charset=utf-8".to_string(),
        url: "https://www.transtats.bts.gov/form".to_string(),
        body: html.as_bytes().to_vec(),
    }
}

pub fn zip_reply(archive: Vec<u8>) -> HttpReply {
    HttpReply {
        status: 200,
        content_type: "application/x-zip-compressed".to_string(),
        url: "https://www.transtats.bts.gov/form".to_string(),
        body: archive,
    }
}

pub fn zip_of(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
    for (name, content) in entries {
        writer.start_file(*name, options).unwrap();
        writer.write_all(content.as_bytes()).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

pub const MARKET_CSV: &str = "YEAR,QUARTER,ORIGIN,DEST,PASSENGERS,MARKET_DISTANCE\n\
2001,3,JFK,LAX,2,2475\n\
2001,3,JFK,SFO,1,2586\n\
2001,3,BOS,JFK,3,187\n";

pub fn market_zip() -> Vec<u8> {
    zip_of(&[("T_DB1B_MARKET.csv", MARKET_CSV)])
}

pub fn test_config(work: &TempDir) -> PipelineConfig {
    PipelineConfig {
        courtesy_delay_ms: [0, 0],
        max_attempts: 3,
        patient_mode: false,
        work_dir: work.path().join("out"),
        ..PipelineConfig::default()
    }
}

pub fn utf8(path: std::path::PathBuf) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(path).unwrap()
}

pub struct Harness {
    pub dir: TempDir,
    pub clock: FakeClock,
    pub transport: ScriptedTransport,
    pub store: FsObjectStore,
    pub config: PipelineConfig,
}

impl Harness {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let clock = FakeClock::new();
        let transport = ScriptedTransport::new(clock.clone());
        let store = FsObjectStore::new(utf8(dir.path().join("blob")));
        let config = test_config(&dir);
        Self {
            dir,
            clock,
            transport,
            store,
            config,
        }
    }

    pub fn layout(&self) -> LocalLayout {
        LocalLayout::from_config(&self.config).unwrap()
    }

    pub fn session(&self) -> FormSession<ScriptedTransport, FakeClock> {
        FormSession::new(
            self.transport.clone(),
            self.clock.clone(),
            SessionSettings::from_config(&self.config),
            self.layout(),
        )
    }

    pub fn pipeline(&self) -> Pipeline<ScriptedTransport, FakeClock, FsObjectStore> {
        self.pipeline_with(self.store.clone())
    }

    pub fn pipeline_with<S: ObjectStore>(
        &self,
        store: S,
    ) -> Pipeline<ScriptedTransport, FakeClock, S> {
        Pipeline::new(
            self.session(),
            store,
            self.layout(),
            self.config.dataset,
            self.config.container().to_string(),
            ProcessOptions::from_config(&self.config, INVOCATION.to_string()),
        )
    }
}

/// Wraps a store: fails the first `failures` curated puts and counts marker
/// lookups.
pub struct FlakyStore<S> {
    inner: S,
    curated_failures: Mutex<usize>,
    pub marker_checks: AtomicUsize,
}

impl<S: ObjectStore> FlakyStore<S> {
    pub fn new(inner: S, curated_failures: usize) -> Self {
        Self {
            inner,
            curated_failures: Mutex::new(curated_failures),
            marker_checks: AtomicUsize::new(0),
        }
    }
}

impl<S: ObjectStore> ObjectStore for FlakyStore<S> {
    fn put(
        &self,
        container: &str,
        path: &str,
        bytes: &[u8],
        content_type: Option<&str>,
        overwrite: bool,
    ) -> Result<(), IngestError> {
        if path.contains("/curated/") {
            let mut remaining = self.curated_failures.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(IngestError::ObjectStore("injected upload failure".to_string()));
            }
        }
        self.inner.put(container, path, bytes, content_type, overwrite)
    }

    fn get(&self, container: &str, path: &str) -> Result<Vec<u8>, IngestError> {
        self.inner.get(container, path)
    }

    fn exists(&self, container: &str, path: &str) -> Result<bool, IngestError> {
        if path.ends_with(".done") {
            self.marker_checks.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.exists(container, path)
    }

    fn list(&self, container: &str, prefix: &str) -> Result<Vec<String>, IngestError> {
        self.inner.list(container, prefix)
    }
}
