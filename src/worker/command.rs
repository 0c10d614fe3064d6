//! Launch specifications for worker processes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::SystemTime;

use tokio::process::Command;

use crate::config::WorkerSettings;

/// How to launch the worker: candidate programs tried in order, with shared
/// arguments, working directory, and environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Candidate executables, tried in order.
    pub candidates: Vec<String>,
    /// Arguments passed to whichever candidate is used.
    pub args: Vec<String>,
    /// Working directory (inherits the host's if unset).
    pub working_dir: Option<PathBuf>,
    /// Extra environment variables.
    pub env: BTreeMap<String, String>,
}

impl LaunchSpec {
    /// Launch spec for the long-lived worker.
    pub fn persistent(settings: &WorkerSettings) -> Self {
        Self::with_args(settings, settings.persistent_args.clone())
    }

    /// Launch spec for one-shot fallback processes.
    pub fn oneshot(settings: &WorkerSettings) -> Self {
        Self::with_args(settings, settings.oneshot_args.clone())
    }

    fn with_args(settings: &WorkerSettings, args: Vec<String>) -> Self {
        Self {
            candidates: settings.candidates.clone(),
            args,
            working_dir: settings.working_dir.as_ref().map(PathBuf::from),
            env: settings.env.clone(),
        }
    }

    /// Build the command for one candidate with all three pipes captured.
    pub fn command(&self, program: &str) -> Command {
        let mut command = Command::new(program);
        command
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }
        command
    }
}

/// Modification times of the worker's source artifacts at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceSnapshot {
    mtimes: BTreeMap<PathBuf, Option<SystemTime>>,
}

impl SourceSnapshot {
    /// Read the modification time of every watched path.
    ///
    /// A missing file is recorded as `None`, so creating or deleting a
    /// watched file also counts as a change.
    pub async fn capture(paths: &[PathBuf]) -> Self {
        let mut mtimes = BTreeMap::new();
        for path in paths {
            mtimes.insert(path.clone(), modified(path).await);
        }
        Self { mtimes }
    }

    pub fn is_empty(&self) -> bool {
        self.mtimes.is_empty()
    }

    /// Paths whose modification time differs from `other`.
    pub fn changed_paths(&self, other: &SourceSnapshot) -> Vec<PathBuf> {
        self.mtimes
            .iter()
            .filter(|(path, mtime)| other.mtimes.get(*path) != Some(*mtime))
            .map(|(path, _)| path.clone())
            .collect()
    }
}

async fn modified(path: &Path) -> Option<SystemTime> {
    tokio::fs::metadata(path).await.ok()?.modified().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_launch_specs_share_candidates() {
        let settings = WorkerSettings {
            candidates: vec!["python3".into(), "python".into()],
            persistent_args: vec!["w.py".into(), "--serve".into()],
            oneshot_args: vec!["w.py".into()],
            working_dir: Some("/srv/ai".into()),
            ..WorkerSettings::default()
        };
        let persistent = LaunchSpec::persistent(&settings);
        let oneshot = LaunchSpec::oneshot(&settings);
        assert_eq!(persistent.candidates, oneshot.candidates);
        assert_eq!(persistent.args, vec!["w.py", "--serve"]);
        assert_eq!(oneshot.args, vec!["w.py"]);
        assert_eq!(persistent.working_dir, Some(PathBuf::from("/srv/ai")));
        assert_eq!(persistent.env.get("PYTHONIOENCODING").map(String::as_str), Some("utf-8"));
    }

    #[tokio::test]
    async fn test_snapshot_detects_modification() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.py");
        std::fs::write(&path, "print('v1')").unwrap();

        let before = SourceSnapshot::capture(&[path.clone()]).await;
        assert!(before.changed_paths(&before).is_empty());

        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(5))
            .unwrap();
        drop(file);

        let after = SourceSnapshot::capture(&[path.clone()]).await;
        assert_eq!(after.changed_paths(&before), vec![path]);
    }

    #[tokio::test]
    async fn test_snapshot_missing_file_is_tracked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.py");
        let before = SourceSnapshot::capture(&[path.clone()]).await;
        assert!(!before.is_empty());

        std::fs::write(&path, "x").unwrap();
        let after = SourceSnapshot::capture(&[path.clone()]).await;
        assert_eq!(after.changed_paths(&before), vec![path]);
    }
}
