//! Single-slot analysis job runner.
//!
//! An [`Orchestrator`] owns one job slot. `start` claims it, scans the
//! workspace, and spawns a task that walks the targets in scan order,
//! calling the summarizer only for files whose fingerprint is not in the
//! cache snapshot taken at start. Progress is a lock-protected snapshot
//! that never waits on the running task.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use plm_core::cache::{AnalysisCache, CacheSnapshot};
use plm_core::domains;
use plm_core::scanner::FileScanner;
use plm_core::{DomainStore, FileAnalysis, Fingerprint, SourceFile, Workspace};

use crate::error::{AnalyzeError, Result};
use crate::job::AnalysisJob;
use crate::summarizer::Summarizer;

struct Inner {
    workspace: Arc<Workspace>,
    cache: Arc<AnalysisCache>,
    summarizer: Arc<dyn Summarizer>,
    job: Mutex<AnalysisJob>,
    running: AtomicBool,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

/// Everything a run needs, fixed at start.
struct Plan {
    base: PathBuf,
    targets: Vec<SourceFile>,
    domain_ids: Vec<String>,
    snapshot: CacheSnapshot,
    full_run: bool,
}

/// Holds the job slot. Dropping it without `finish` (a panicking task)
/// marks a still-running job as failed and frees the slot.
struct JobSlot {
    inner: Arc<Inner>,
    armed: bool,
}

impl JobSlot {
    fn finish(mut self, update: impl FnOnce(&mut AnalysisJob)) -> AnalysisJob {
        let mut job = self.inner.job.lock();
        update(&mut job);
        self.inner.running.store(false, Ordering::Release);
        self.armed = false;
        job.clone()
    }
}

impl Drop for JobSlot {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut job = self.inner.job.lock();
        if job.is_running() {
            job.fail("analysis task ended unexpectedly".to_string());
        }
        self.inner.running.store(false, Ordering::Release);
    }
}

/// Handle to a spawned job.
pub struct JobHandle {
    task: JoinHandle<AnalysisJob>,
}

impl JobHandle {
    /// Wait for the job and return its final state.
    pub async fn wait(self) -> Result<AnalysisJob> {
        self.task.await.map_err(|e| AnalyzeError::Join(e.to_string()))
    }
}

fn normalize_request(path: &str) -> String {
    let path = path.trim().replace('\\', "/");
    path.strip_prefix("./").unwrap_or(&path).to_string()
}

impl Orchestrator {
    pub fn new(workspace: Arc<Workspace>, cache: Arc<AnalysisCache>, summarizer: Arc<dyn Summarizer>) -> Self {
        Self {
            inner: Arc::new(Inner {
                workspace,
                cache,
                summarizer,
                job: Mutex::new(AnalysisJob::default()),
                running: AtomicBool::new(false),
            }),
        }
    }

    /// Orchestrator over the workspace's own cache file.
    pub fn open(workspace: Arc<Workspace>, summarizer: Arc<dyn Summarizer>) -> Result<Self> {
        let cache = Arc::new(AnalysisCache::in_workspace(&workspace)?);
        Ok(Self::new(workspace, cache, summarizer))
    }

    pub fn workspace(&self) -> &Arc<Workspace> {
        &self.inner.workspace
    }

    /// Scan the workspace with its current settings.
    pub fn scan(&self) -> Result<Vec<SourceFile>> {
        let workspace = &self.inner.workspace;
        let settings = workspace.settings()?;
        let scanner = FileScanner::from_settings(workspace.root(), &settings)?;
        Ok(scanner.scan()?)
    }

    /// Start a job over `files` (workspace-relative paths), or over every
    /// scanned file when `None`.
    ///
    /// Rejected with [`AnalyzeError::AlreadyRunning`] while a job runs; any
    /// error returned here leaves the previous progress untouched.
    pub fn start(&self, files: Option<Vec<String>>) -> Result<JobHandle> {
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(AnalyzeError::AlreadyRunning);
        }
        let slot = JobSlot {
            inner: Arc::clone(&self.inner),
            armed: true,
        };

        let plan = self.plan(files)?;
        let runtime = Handle::try_current().map_err(|_| AnalyzeError::NoRuntime)?;

        *self.inner.job.lock() = AnalysisJob::started(plan.targets.len());
        info!(
            "analysis started: {} files ({} cached entries)",
            plan.targets.len(),
            plan.snapshot.len()
        );

        let inner = Arc::clone(&self.inner);
        let task = runtime.spawn(async move {
            let outcome = run(&inner, &plan).await;
            let outcome = match outcome {
                Ok(()) if plan.full_run => prune(&inner, &plan),
                other => other,
            };
            let job = slot.finish(|job| match outcome {
                Ok(()) => job.complete(),
                Err(e) => {
                    error!("analysis failed: {}", e);
                    job.fail(e.to_string());
                }
            });
            info!(
                "analysis {}: {}/{} analyzed, {} failed",
                job.status,
                job.analyzed_files,
                job.total_files,
                job.failed_files()
            );
            job
        });
        Ok(JobHandle { task })
    }

    fn plan(&self, files: Option<Vec<String>>) -> Result<Plan> {
        let scanned = self.scan()?;
        let full_run = files.is_none();
        let targets: Vec<SourceFile> = match files {
            None => scanned,
            Some(requested) => {
                let requested: HashSet<String> = requested.iter().map(|p| normalize_request(p)).collect();
                scanned
                    .into_iter()
                    .filter(|f| requested.contains(&f.path))
                    .collect()
            }
        };
        if targets.is_empty() {
            return Err(AnalyzeError::NoMatchingFiles);
        }

        let domain_ids = self
            .inner
            .workspace
            .load_domains()?
            .into_iter()
            .map(|d| d.id)
            .collect();

        Ok(Plan {
            base: self.inner.workspace.root().to_path_buf(),
            targets,
            domain_ids,
            snapshot: self.inner.cache.snapshot(),
            full_run,
        })
    }

    /// Snapshot of the current or last job.
    pub fn progress(&self) -> AnalysisJob {
        self.inner.job.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Every cached analysis keyed by workspace-relative path.
    pub fn results(&self) -> BTreeMap<String, FileAnalysis> {
        self.inner.cache.results()
    }
}

async fn run(inner: &Inner, plan: &Plan) -> Result<()> {
    for file in &plan.targets {
        if plan.snapshot.lookup(&file.path, &file.fingerprint).is_some() {
            debug!("cache hit: {}", file.path);
            inner.job.lock().analyzed_files += 1;
            continue;
        }

        inner.job.lock().current_file = Some(file.path.clone());
        let content = match tokio::fs::read(plan.base.join(&file.path)).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("could not read {}: {}", file.path, e);
                inner.job.lock().record_failure(&file.path, format!("read failed: {e}"));
                continue;
            }
        };
        // Fingerprint what was actually summarized, not what was scanned.
        let fingerprint = Fingerprint::of_bytes(&content);
        let text = String::from_utf8_lossy(&content);

        debug!("cache miss: {}", file.path);
        let mut analysis = match inner.summarizer.analyze(&text, &file.language).await {
            Ok(analysis) => analysis,
            Err(e) => {
                warn!("summarizer failed for {}: {}", file.path, e);
                inner.job.lock().record_failure(&file.path, e.to_string());
                continue;
            }
        };
        if analysis.domain.is_none() {
            analysis.domain = domains::infer_from_path(&file.path, plan.domain_ids.iter().map(String::as_str));
        }

        inner
            .cache
            .put(&file.path, fingerprint, analysis)
            .map_err(AnalyzeError::Cache)?;

        let mut job = inner.job.lock();
        job.analyzed_files += 1;
        job.current_file = None;
    }
    Ok(())
}

fn prune(inner: &Inner, plan: &Plan) -> Result<()> {
    let keep: HashSet<&str> = plan.targets.iter().map(|f| f.path.as_str()).collect();
    let removed = inner.cache.retain_paths(&keep).map_err(AnalyzeError::Cache)?;
    if removed > 0 {
        info!("dropped {} cache entries for vanished files", removed);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::summarizer::SummarizeError;
    use async_trait::async_trait;
    use plm_core::store::CACHE_DIR;
    use plm_core::DomainConfig;
    use std::fs;
    use std::path::Path;
    use tokio::sync::Notify;

    fn write(root: &Path, rel: &str, body: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, body).unwrap();
    }

    /// Echoes the first line as purpose; fails on files containing "FAIL".
    struct Echo;

    #[async_trait]
    impl Summarizer for Echo {
        async fn analyze(&self, content: &str, _language: &str) -> std::result::Result<FileAnalysis, SummarizeError> {
            if content.contains("FAIL") {
                return Err(SummarizeError::Backend("boom".into()));
            }
            Ok(FileAnalysis {
                purpose: content.lines().next().unwrap_or_default().to_string(),
                ..FileAnalysis::default()
            })
        }
    }

    /// Blocks inside `analyze` until released.
    #[derive(Default)]
    struct Gate {
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl Summarizer for Gate {
        async fn analyze(&self, _content: &str, _language: &str) -> std::result::Result<FileAnalysis, SummarizeError> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(FileAnalysis {
                purpose: "gated".into(),
                ..FileAnalysis::default()
            })
        }
    }

    fn orchestrator(root: &Path, summarizer: Arc<dyn Summarizer>) -> Orchestrator {
        let workspace = Arc::new(Workspace::open(root).unwrap());
        Orchestrator::open(workspace, summarizer).unwrap()
    }

    #[tokio::test]
    async fn second_start_is_rejected_while_running() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "src/a.py", "a");
        let gate = Arc::new(Gate::default());
        let orch = orchestrator(dir.path(), gate.clone());

        let handle = orch.start(None).unwrap();
        gate.entered.notified().await;

        let before = orch.progress();
        assert!(before.is_running());
        assert_eq!(before.current_file.as_deref(), Some("src/a.py"));
        assert!(matches!(orch.start(None), Err(AnalyzeError::AlreadyRunning)));
        assert_eq!(orch.progress(), before);

        gate.release.notify_one();
        let done = handle.wait().await.unwrap();
        assert_eq!(done.status, crate::JobStatus::Completed);
        assert!(!orch.is_running());
        assert!(orch.start(None).is_ok());
    }

    #[tokio::test]
    async fn summarizer_failures_are_recorded_and_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "src/a.py", "alpha");
        write(dir.path(), "src/b.py", "FAIL");
        write(dir.path(), "src/c.py", "gamma");
        let orch = orchestrator(dir.path(), Arc::new(Echo));

        let job = orch.start(None).unwrap().wait().await.unwrap();
        assert_eq!(job.status, crate::JobStatus::Completed);
        assert_eq!(job.total_files, 3);
        assert_eq!(job.analyzed_files, 2);
        assert_eq!(job.failures[0].path, "src/b.py");
        assert!(job.current_file.is_none());
        assert_eq!(orch.results().len(), 2);
        assert_eq!(orch.progress(), job);
    }

    #[tokio::test]
    async fn missing_domain_falls_back_to_path() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "src/motor/step.py", "stepper");
        let orch = orchestrator(dir.path(), Arc::new(Echo));
        orch.workspace()
            .save_domains(&[DomainConfig {
                id: "motor".into(),
                name: "Motor".into(),
                description: String::new(),
                subdomain_ids: vec![],
            }])
            .unwrap();

        orch.start(None).unwrap().wait().await.unwrap();
        assert_eq!(
            orch.results()["src/motor/step.py"].domain.as_deref(),
            Some("motor")
        );
    }

    #[tokio::test]
    async fn unmatched_file_list_never_starts_a_job() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "src/a.py", "a");
        let orch = orchestrator(dir.path(), Arc::new(Echo));

        let err = orch.start(Some(vec!["src/nope.py".into()])).err().unwrap();
        assert!(matches!(err, AnalyzeError::NoMatchingFiles));
        assert_eq!(orch.progress(), AnalysisJob::default());
        assert!(!orch.is_running());

        let job = orch
            .start(Some(vec!["./src/a.py".into()]))
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(job.analyzed_files, 1);
    }

    #[tokio::test]
    async fn bad_patterns_are_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "src/a.py", "a");
        let orch = orchestrator(dir.path(), Arc::new(Echo));
        let mut settings = orch.workspace().settings().unwrap();
        settings.include_patterns = vec!["src/[.py".into()];
        orch.workspace().save_settings(&settings).unwrap();

        assert!(matches!(orch.start(None), Err(AnalyzeError::Scan(_))));
        assert!(!orch.is_running());
    }

    #[tokio::test]
    async fn cache_write_failure_fails_the_job() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "src/a.py", "a");
        let orch = orchestrator(dir.path(), Arc::new(Echo));
        fs::write(orch.workspace().data_path(CACHE_DIR), "").unwrap();

        let job = orch.start(None).unwrap().wait().await.unwrap();
        assert_eq!(job.status, crate::JobStatus::Error);
        assert!(job.error_message.unwrap().contains("cache"));
        assert_eq!(job.analyzed_files, 0);
        assert!(!orch.is_running());
    }

    #[tokio::test]
    async fn unreadable_source_is_recorded_and_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "src/a.py", "a");
        write(dir.path(), "src/b.py", "b");
        let gate = Arc::new(Gate::default());
        let orch = orchestrator(dir.path(), gate.clone());

        let handle = orch.start(None).unwrap();
        gate.entered.notified().await;
        fs::remove_file(dir.path().join("src/b.py")).unwrap();
        gate.release.notify_one();

        let job = handle.wait().await.unwrap();
        assert_eq!(job.status, crate::JobStatus::Completed);
        assert_eq!(job.total_files, 2);
        assert_eq!(job.analyzed_files, 1);
        assert_eq!(job.failures.len(), 1);
        assert_eq!(job.failures[0].path, "src/b.py");
        assert!(job.failures[0].message.starts_with("read failed"));
        assert_eq!(orch.results().keys().collect::<Vec<_>>(), vec!["src/a.py"]);
    }

    #[tokio::test]
    async fn full_run_prunes_vanished_files() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "src/a.py", "a");
        write(dir.path(), "src/b.py", "b");
        let orch = orchestrator(dir.path(), Arc::new(Echo));
        orch.start(None).unwrap().wait().await.unwrap();

        fs::remove_file(dir.path().join("src/b.py")).unwrap();
        orch.start(None).unwrap().wait().await.unwrap();
        assert_eq!(orch.results().keys().collect::<Vec<_>>(), vec!["src/a.py"]);
    }

    #[test]
    fn start_outside_a_runtime_is_rejected_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "src/a.py", "a");
        let orch = orchestrator(dir.path(), Arc::new(Echo));
        assert!(matches!(orch.start(None).err(), Some(AnalyzeError::NoRuntime)));
        assert!(!orch.is_running());
    }
}
