//! End-to-end tests for the pull driver.
//!
//! An in-memory [`LayerSource`] serves tar layers with per-layer delays so
//! downloads complete out of chain order; the real [`TarApplier`] merges them
//! onto a temp directory.

use std::collections::{HashMap, HashSet};
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use layerpull::apply::TarApplier;
use layerpull::snapshot::{GitSnapshotter, SnapshotError, Snapshotter};
use layerpull::source::LayerSource;
use layerpull::{Error, LayerFailure, Layering, PullConfig, Puller};
use layerpull_hub::{
    EndpointFailure, FetchError, FetchedLayer, HubError, ImageName, LayerChain, LayerId,
    LayerStream, RepositoryData,
};
use secrecy::SecretString;

// =============================================================================
// FIXTURES
// =============================================================================

enum Entry<'a> {
    File(&'a str, &'a str),
    Whiteout(&'a str),
}

fn tar_layer(entries: &[Entry<'_>]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for entry in entries {
        let (name, data) = match *entry {
            Entry::File(name, data) => (name.to_string(), data.as_bytes()),
            Entry::Whiteout(name) => (format!(".wh.{}", name), &b""[..]),
        };
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        builder.append_data(&mut header, name, data).unwrap();
    }
    builder.into_inner().unwrap()
}

fn gzip(data: &[u8]) -> Vec<u8> {
    use std::io::Write;
    let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

/// Reader that counts how many layer streams were released.
struct TrackedReader {
    inner: Cursor<Vec<u8>>,
    released: Arc<AtomicUsize>,
}

impl Read for TrackedReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Drop for TrackedReader {
    fn drop(&mut self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct MemorySource {
    tags: HashMap<String, LayerId>,
    /// Ancestry as a registry lists it: leaf first.
    ancestry: Vec<LayerId>,
    layers: HashMap<LayerId, Vec<u8>>,
    delays_ms: HashMap<LayerId, u64>,
    unfetchable: HashSet<LayerId>,
    /// Endpoints whose history lookups fail.
    broken_history: HashSet<String>,
    missing_repository: bool,
    endpoints: Vec<String>,

    running: AtomicUsize,
    peak: AtomicUsize,
    fetched: Mutex<Vec<LayerId>>,
    released: Arc<AtomicUsize>,
}

impl MemorySource {
    /// Chain `root -> ... -> leaf` tagged `latest`.
    fn chain(layers: Vec<(&str, Vec<u8>)>) -> Self {
        let ids: Vec<LayerId> = layers.iter().map(|(id, _)| LayerId::from(*id)).collect();
        let mut ancestry = ids.clone();
        ancestry.reverse();

        let mut tags = HashMap::new();
        tags.insert("latest".to_string(), ids[ids.len() - 1].clone());

        // Later layers download faster, so completions arrive leaf first.
        let n = ids.len() as u64;
        let delays_ms = ids
            .iter()
            .enumerate()
            .map(|(i, id)| (id.clone(), (n - i as u64) * 15))
            .collect();

        Self {
            tags,
            ancestry,
            layers: layers
                .into_iter()
                .map(|(id, data)| (LayerId::from(id), data))
                .collect(),
            delays_ms,
            endpoints: vec!["reg-a.test".to_string(), "reg-b.test".to_string()],
            ..Default::default()
        }
    }

    fn fail(mut self, id: &str) -> Self {
        self.unfetchable.insert(LayerId::from(id));
        self
    }

    fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LayerSource for MemorySource {
    async fn resolve_repository(&self, image: &ImageName) -> Result<RepositoryData, HubError> {
        if self.missing_repository {
            return Err(HubError::NotFound(image.repository.clone()));
        }
        Ok(RepositoryData {
            endpoints: self.endpoints.clone(),
            tokens: vec![SecretString::from("token")],
        })
    }

    async fn resolve_tags(
        &self,
        _image: &ImageName,
        _repo: &RepositoryData,
    ) -> Result<HashMap<String, LayerId>, HubError> {
        Ok(self.tags.clone())
    }

    async fn resolve_ancestry(
        &self,
        _leaf: &LayerId,
        endpoint: &str,
        _tokens: &[SecretString],
    ) -> Result<LayerChain, HubError> {
        if self.broken_history.contains(endpoint) {
            return Err(HubError::Registry(format!("{} is down", endpoint)));
        }
        LayerChain::from_ancestry(self.ancestry.clone())
    }

    async fn fetch_layer(
        &self,
        id: &LayerId,
        repo: &RepositoryData,
    ) -> Result<FetchedLayer, FetchError> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let delay = self.delays_ms.get(id).copied().unwrap_or(1);
        tokio::time::sleep(Duration::from_millis(delay)).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        self.fetched.lock().unwrap().push(id.clone());

        if self.unfetchable.contains(id) {
            return Err(FetchError::Exhausted {
                layer: id.clone(),
                attempts: repo
                    .endpoints
                    .iter()
                    .map(|ep| EndpointFailure {
                        endpoint: ep.clone(),
                        error: HubError::NotFound(format!("{}/{}", ep, id)),
                    })
                    .collect(),
            });
        }

        let data = self.layers.get(id).cloned().unwrap_or_default();
        Ok(FetchedLayer {
            id: id.clone(),
            size: data.len() as u64,
            stream: LayerStream::from_reader(TrackedReader {
                inner: Cursor::new(data),
                released: Arc::clone(&self.released),
            }),
            metadata: format!(r#"{{"id":"{}"}}"#, id).into_bytes(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SnapEvent {
    Init,
    Branch(String),
    /// Commit message plus the value of `order.txt` at commit time.
    Commit(String, String),
}

#[derive(Default)]
struct RecordingSnapshotter {
    root: Option<PathBuf>,
    events: Vec<SnapEvent>,
    fail_init: bool,
    fail_branch_at: Option<usize>,
    fail_commit_at: Option<usize>,
}

impl RecordingSnapshotter {
    fn count(&self, pred: fn(&SnapEvent) -> bool) -> usize {
        self.events.iter().filter(|e| pred(e)).count()
    }
}

#[async_trait]
impl Snapshotter for RecordingSnapshotter {
    async fn init_root(&mut self, root: &Path) -> Result<(), SnapshotError> {
        if self.fail_init {
            return Err(SnapshotError::NotInitialized);
        }
        self.root = Some(root.to_path_buf());
        self.events.push(SnapEvent::Init);
        Ok(())
    }

    async fn branch(&mut self, name: &str) -> Result<(), SnapshotError> {
        if self.fail_branch_at == Some(self.count(|e| matches!(e, SnapEvent::Branch(_)))) {
            return Err(SnapshotError::NotInitialized);
        }
        self.events.push(SnapEvent::Branch(name.to_string()));
        Ok(())
    }

    async fn commit_all(&mut self, message: &str) -> Result<(), SnapshotError> {
        if self.fail_commit_at == Some(self.count(|e| matches!(e, SnapEvent::Commit(..)))) {
            return Err(SnapshotError::NotInitialized);
        }
        let root = self.root.as_ref().ok_or(SnapshotError::NotInitialized)?;
        let order = std::fs::read_to_string(root.join("order.txt")).unwrap_or_default();
        self.events
            .push(SnapEvent::Commit(message.to_string(), order));
        Ok(())
    }
}

/// Layers A, B, C: each rewrites `order.txt`, B removes A's scratch file.
fn abc_source() -> MemorySource {
    MemorySource::chain(vec![
        (
            "aaa",
            tar_layer(&[
                Entry::File("order.txt", "A"),
                Entry::File("a.txt", "from A"),
                Entry::File("scratch.txt", "temp"),
            ]),
        ),
        (
            "bbb",
            gzip(&tar_layer(&[
                Entry::File("order.txt", "AB"),
                Entry::File("b.txt", "from B"),
                Entry::Whiteout("scratch.txt"),
            ])),
        ),
        (
            "ccc",
            tar_layer(&[
                Entry::File("order.txt", "ABC"),
                Entry::File("a.txt", "patched by C"),
            ]),
        ),
    ])
}

fn puller(source: Arc<MemorySource>, k: usize) -> Puller {
    Puller::with_parts(source, Arc::new(TarApplier), PullConfig::default().concurrency(k)).unwrap()
}

fn image() -> ImageName {
    ImageName::parse("team/tool:latest", "index.test").unwrap()
}

fn read(dest: &Path, file: &str) -> String {
    std::fs::read_to_string(dest.join(file)).unwrap()
}

fn git_available() -> bool {
    std::process::Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

// =============================================================================
// ORDERED APPLY
// =============================================================================

#[tokio::test]
async fn flat_pull_applies_layers_in_chain_order() {
    let tmp = tempfile::tempdir().unwrap();
    let dest = tmp.path().join("rootfs");
    let source = Arc::new(abc_source());

    let report = puller(Arc::clone(&source), 2)
        .pull(&image(), &dest, Layering::Flat)
        .await
        .unwrap();

    let order: Vec<&str> = report.layers.iter().map(|l| l.as_str()).collect();
    assert_eq!(order, vec!["aaa", "bbb", "ccc"]);
    assert_eq!(report.leaf.as_str(), "ccc");

    assert_eq!(read(&dest, "order.txt"), "ABC");
    assert_eq!(read(&dest, "a.txt"), "patched by C");
    assert_eq!(read(&dest, "b.txt"), "from B");
    assert!(!dest.join("scratch.txt").exists());

    // Only the leaf's metadata survives; no size file without layering.
    assert_eq!(read(&dest, "json"), r#"{"id":"ccc"}"#);
    assert!(!dest.join("layersize").exists());

    // Every stream was released exactly once.
    assert_eq!(source.released(), 3);
}

#[tokio::test]
async fn downloads_complete_out_of_order_but_apply_stays_ordered() {
    let tmp = tempfile::tempdir().unwrap();
    let source = Arc::new(abc_source());

    puller(Arc::clone(&source), 3)
        .pull(&image(), tmp.path(), Layering::Flat)
        .await
        .unwrap();

    let fetched = source.fetched.lock().unwrap().clone();
    assert_eq!(fetched.first().map(|l| l.as_str()), Some("ccc"));
    assert_eq!(read(tmp.path(), "order.txt"), "ABC");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pull_respects_concurrency_bound() {
    let layers: Vec<(String, Vec<u8>)> = (0..9)
        .map(|i| {
            let name = format!("l{i}");
            let data = tar_layer(&[Entry::File(&format!("f{i}"), "x")]);
            (name, data)
        })
        .collect();
    let source = Arc::new(MemorySource::chain(
        layers.iter().map(|(n, d)| (n.as_str(), d.clone())).collect(),
    ));

    let tmp = tempfile::tempdir().unwrap();
    let report = puller(Arc::clone(&source), 2)
        .pull(&image(), tmp.path(), Layering::Flat)
        .await
        .unwrap();

    assert_eq!(report.layers.len(), 9);
    assert!(source.peak.load(Ordering::SeqCst) <= 2);
    for i in 0..9 {
        assert!(tmp.path().join(format!("f{i}")).exists());
    }
}

// =============================================================================
// LAYERED PULLS
// =============================================================================

#[tokio::test]
async fn layered_pull_branches_and_commits_each_layer() {
    let tmp = tempfile::tempdir().unwrap();
    let source = Arc::new(abc_source());
    let mut snaps = RecordingSnapshotter::default();

    puller(Arc::clone(&source), 2)
        .pull(&image(), tmp.path(), Layering::Snapshots(&mut snaps))
        .await
        .unwrap();

    assert_eq!(
        snaps.events,
        vec![
            SnapEvent::Init,
            SnapEvent::Branch("layer0_aaa".into()),
            SnapEvent::Commit("adding layer 0".into(), "A".into()),
            SnapEvent::Branch("layer1_bbb".into()),
            SnapEvent::Commit("adding layer 1".into(), "AB".into()),
            SnapEvent::Branch("layer2_ccc".into()),
            SnapEvent::Commit("adding layer 2".into(), "ABC".into()),
        ]
    );

    let leaf_size = abc_source().layers[&LayerId::from("ccc")].len();
    assert_eq!(read(tmp.path(), "layersize"), leaf_size.to_string());
    assert_eq!(read(tmp.path(), "json"), r#"{"id":"ccc"}"#);
}

#[tokio::test]
async fn commit_failure_aborts_with_layer_position() {
    let tmp = tempfile::tempdir().unwrap();
    let source = Arc::new(abc_source());
    let mut snaps = RecordingSnapshotter {
        fail_commit_at: Some(1),
        ..Default::default()
    };

    let err = puller(source, 2)
        .pull(&image(), tmp.path(), Layering::Snapshots(&mut snaps))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Commit { position: 1, .. }), "{err}");
    assert!(!snaps
        .events
        .contains(&SnapEvent::Branch("layer2_ccc".into())));
}

#[tokio::test]
async fn snapshot_init_failure_applies_nothing() {
    let tmp = tempfile::tempdir().unwrap();
    let dest = tmp.path().join("rootfs");
    let source = Arc::new(abc_source());
    let mut snaps = RecordingSnapshotter {
        fail_init: true,
        ..Default::default()
    };

    let err = puller(Arc::clone(&source), 2)
        .pull(&image(), &dest, Layering::Snapshots(&mut snaps))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::SnapshotInit { .. }), "{err}");
    assert!(snaps.events.is_empty());
    assert!(source.fetched.lock().unwrap().is_empty());
    assert!(!dest.join("order.txt").exists());
    assert!(!dest.join("json").exists());
}

#[tokio::test]
async fn branch_failure_aborts_before_the_layer_lands() {
    let tmp = tempfile::tempdir().unwrap();
    let source = Arc::new(abc_source());
    let mut snaps = RecordingSnapshotter {
        fail_branch_at: Some(1),
        ..Default::default()
    };

    let err = puller(Arc::clone(&source), 2)
        .pull(&image(), tmp.path(), Layering::Snapshots(&mut snaps))
        .await
        .unwrap_err();

    match &err {
        Error::Branch {
            position, layer, ..
        } => {
            assert_eq!(*position, 1);
            assert_eq!(layer.as_str(), "bbb");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(
        snaps.events,
        vec![
            SnapEvent::Init,
            SnapEvent::Branch("layer0_aaa".into()),
            SnapEvent::Commit("adding layer 0".into(), "A".into()),
        ]
    );
    assert_eq!(read(tmp.path(), "order.txt"), "A");
    assert!(!tmp.path().join("b.txt").exists());
    assert_eq!(source.released(), 3);
}

#[tokio::test]
async fn layered_pull_with_git_history() {
    if !git_available() {
        eprintln!("skipping: git not installed");
        return;
    }

    let tmp = tempfile::tempdir().unwrap();
    let dest = tmp.path().join("repo");
    let mut git = GitSnapshotter::new();

    puller(Arc::new(abc_source()), 2)
        .pull(&image(), &dest, Layering::Snapshots(&mut git))
        .await
        .unwrap();

    let git_out = |args: &[&str]| {
        let out = std::process::Command::new("git")
            .args(args)
            .current_dir(&dest)
            .output()
            .unwrap();
        assert!(out.status.success(), "git {:?} failed", args);
        String::from_utf8(out.stdout).unwrap()
    };

    let branches = git_out(&["branch", "--format=%(refname:short)"]);
    let mut branches: Vec<&str> = branches.lines().collect();
    branches.sort();
    assert_eq!(branches, vec!["layer0_aaa", "layer1_bbb", "layer2_ccc"]);

    assert_eq!(git_out(&["rev-list", "--count", "layer0_aaa"]).trim(), "1");
    assert_eq!(git_out(&["rev-list", "--count", "layer2_ccc"]).trim(), "3");
    assert_eq!(git_out(&["log", "-1", "--format=%s", "layer1_bbb"]).trim(), "adding layer 1");
    assert_eq!(git_out(&["show", "layer0_aaa:order.txt"]), "A");
    assert_eq!(git_out(&["status", "--porcelain"]).trim(), "");
}

// =============================================================================
// FAILURES
// =============================================================================

#[tokio::test]
async fn failed_layer_aborts_before_it_is_applied() {
    let tmp = tempfile::tempdir().unwrap();
    let source = Arc::new(abc_source().fail("bbb"));
    let mut snaps = RecordingSnapshotter::default();

    let err = puller(Arc::clone(&source), 2)
        .pull(&image(), tmp.path(), Layering::Snapshots(&mut snaps))
        .await
        .unwrap_err();

    match &err {
        Error::ApplyAborted {
            position,
            layer,
            cause: LayerFailure::Fetch(FetchError::Exhausted { attempts, .. }),
        } => {
            assert_eq!(*position, 1);
            assert_eq!(layer.as_str(), "bbb");
            assert_eq!(attempts.len(), 2);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.to_string().contains("bbb"));

    // A is applied and committed; C never lands.
    assert_eq!(read(tmp.path(), "order.txt"), "A");
    assert!(!tmp.path().join("b.txt").exists());
    assert_eq!(
        snaps.events,
        vec![
            SnapEvent::Init,
            SnapEvent::Branch("layer0_aaa".into()),
            SnapEvent::Commit("adding layer 0".into(), "A".into()),
        ]
    );

    // The sibling downloads still ran to completion, and their streams were
    // released with the batch.
    assert_eq!(source.fetched.lock().unwrap().len(), 3);
    assert_eq!(source.released(), 2);
}

#[tokio::test]
async fn corrupt_layer_is_an_apply_failure() {
    let mut source = abc_source();
    source
        .layers
        .insert(LayerId::from("bbb"), vec![0x1f, 0x8b, 0xde, 0xad, 0xbe, 0xef]);
    let source = Arc::new(source);
    let tmp = tempfile::tempdir().unwrap();

    let err = puller(Arc::clone(&source), 2)
        .pull(&image(), tmp.path(), Layering::Flat)
        .await
        .unwrap_err();

    assert!(
        matches!(
            err,
            Error::ApplyAborted {
                position: 1,
                cause: LayerFailure::Apply(_),
                ..
            }
        ),
        "{err}"
    );
    assert_eq!(source.released(), 3);
}

#[tokio::test]
async fn unwritable_metadata_file_is_a_persist_failure() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::create_dir(tmp.path().join("json")).unwrap();
    let source = Arc::new(abc_source());

    let err = puller(Arc::clone(&source), 2)
        .pull(&image(), tmp.path(), Layering::Flat)
        .await
        .unwrap_err();

    match &err {
        Error::ApplyAborted {
            position: 0,
            cause: LayerFailure::Persist { file, .. },
            ..
        } => assert_eq!(file, "json"),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(read(tmp.path(), "order.txt"), "A");
    assert_eq!(source.released(), 3);
}

#[tokio::test]
async fn unknown_tag_is_a_tag_resolution_error() {
    let tmp = tempfile::tempdir().unwrap();
    let image = ImageName::parse("team/tool:nope", "index.test").unwrap();

    let err = puller(Arc::new(abc_source()), 2)
        .pull(&image, tmp.path(), Layering::Flat)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::TagResolution { source: None, .. }), "{err}");
}

#[tokio::test]
async fn missing_repository_touches_nothing() {
    let tmp = tempfile::tempdir().unwrap();
    let dest = tmp.path().join("never");
    let mut source = abc_source();
    source.missing_repository = true;

    let err = puller(Arc::new(source), 2)
        .pull(&image(), &dest, Layering::Flat)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::MetadataResolution { .. }), "{err}");
    assert!(!dest.exists());
}

#[tokio::test]
async fn history_fails_over_to_next_endpoint() {
    let tmp = tempfile::tempdir().unwrap();
    let mut source = abc_source();
    source.broken_history.insert("reg-a.test".to_string());

    let report = puller(Arc::new(source), 2)
        .pull(&image(), tmp.path(), Layering::Flat)
        .await
        .unwrap();
    assert_eq!(report.layers.len(), 3);
}

#[tokio::test]
async fn history_on_no_endpoint_is_fatal() {
    let tmp = tempfile::tempdir().unwrap();
    let dest = tmp.path().join("never");
    let mut source = abc_source();
    source.broken_history.insert("reg-a.test".to_string());
    source.broken_history.insert("reg-b.test".to_string());

    let err = puller(Arc::new(source), 2)
        .pull(&image(), &dest, Layering::Flat)
        .await
        .unwrap_err();

    match err {
        Error::HistoryResolution { leaf, source } => {
            assert_eq!(leaf.as_str(), "ccc");
            assert!(source.to_string().contains("reg-b.test"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!dest.exists());
}

#[tokio::test]
async fn destination_under_a_file_is_a_destination_error() {
    let tmp = tempfile::tempdir().unwrap();
    let blocker = tmp.path().join("file");
    std::fs::write(&blocker, "x").unwrap();

    let err = puller(Arc::new(abc_source()), 2)
        .pull(&image(), &blocker.join("rootfs"), Layering::Flat)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Destination { .. }), "{err}");
}

#[tokio::test]
async fn zero_concurrency_is_rejected_up_front() {
    let result = Puller::with_parts(
        Arc::new(abc_source()),
        Arc::new(TarApplier),
        PullConfig::default().concurrency(0),
    );
    assert!(matches!(result, Err(Error::Config(_))));
}
