use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Idle,
    Running,
    Completed,
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Idle => "idle",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Error)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A file the job had to skip.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileFailure {
    pub path: String,
    pub message: String,
}

/// Progress of the current (or last) analysis job.
///
/// Counters freeze when the job reaches a terminal status and are reset by
/// the next start.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisJob {
    pub total_files: usize,
    pub analyzed_files: usize,
    pub current_file: Option<String>,
    pub status: JobStatus,
    pub error_message: Option<String>,
    #[serde(default)]
    pub failures: Vec<FileFailure>,
}

impl AnalysisJob {
    pub(crate) fn started(total_files: usize) -> Self {
        Self {
            total_files,
            status: JobStatus::Running,
            ..Self::default()
        }
    }

    /// Fraction of files analyzed, in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        if self.total_files == 0 {
            return 0.0;
        }
        (self.analyzed_files as f64 / self.total_files as f64).min(1.0)
    }

    pub fn failed_files(&self) -> usize {
        self.failures.len()
    }

    pub fn is_running(&self) -> bool {
        self.status == JobStatus::Running
    }

    pub(crate) fn record_failure(&mut self, path: &str, message: String) {
        self.failures.push(FileFailure {
            path: path.to_string(),
            message,
        });
        self.current_file = None;
    }

    pub(crate) fn complete(&mut self) {
        self.status = JobStatus::Completed;
        self.current_file = None;
    }

    pub(crate) fn fail(&mut self, message: String) {
        self.status = JobStatus::Error;
        self.error_message = Some(message);
        self.current_file = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_fraction() {
        let mut job = AnalysisJob::started(4);
        assert_eq!(job.progress(), 0.0);
        job.analyzed_files = 1;
        assert_eq!(job.progress(), 0.25);
        assert_eq!(AnalysisJob::default().progress(), 0.0);
    }

    #[test]
    fn terminal_transitions_clear_current_file() {
        let mut job = AnalysisJob::started(2);
        job.current_file = Some("src/a.py".into());
        job.record_failure("src/a.py", "timeout".into());
        assert_eq!(job.failed_files(), 1);
        assert!(job.current_file.is_none());

        job.current_file = Some("src/b.py".into());
        job.fail("disk full".into());
        assert!(job.status.is_terminal());
        assert!(job.current_file.is_none());
        assert_eq!(job.error_message.as_deref(), Some("disk full"));
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_value(AnalysisJob::started(1)).unwrap();
        assert_eq!(json["status"], "running");
        assert_eq!(json["totalFiles"], 1);
        assert!(json["currentFile"].is_null());
    }
}
