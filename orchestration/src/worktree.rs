//! Per-domain git worktree isolation.
//!
//! Each domain agent gets its own worktree on branch
//! `wave/{run_id}/{domain}` under `{repo_parent}/worktrees/{run_id}/`,
//! so parallel coders never contend on a working copy. Merging goes
//! through a temporary worktree on the run's integration branch.
//!
//! Creation and cleanup of a given `{run_id, domain}` pair are
//! serialized through a filesystem lock so two racing sessions cannot
//! clobber each other's branch.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::{debug, info, warn};

/// Upper bound on any single git invocation.
pub const GIT_TIMEOUT: Duration = Duration::from_secs(30);

/// How long to wait for the per-worktree lock before giving up.
const LOCK_WAIT: Duration = Duration::from_secs(10);

/// Lock files older than this are considered abandoned.
const LOCK_STALE_AFTER: Duration = Duration::from_secs(120);

/// Error type for worktree operations
#[derive(Debug, thiserror::Error)]
pub enum WorktreeError {
    #[error("Git operation failed: {operation} - {message}")]
    Git { operation: String, message: String },

    #[error("Git operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid identifier '{0}': only alphanumerics, '-', '_' and '.' are allowed")]
    InvalidIdentifier(String),

    #[error("Timed out waiting for worktree lock {0}")]
    LockTimeout(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for worktree operations
pub type WorktreeResult<T> = Result<T, WorktreeError>;

/// Information about a domain-specific worktree.
#[derive(Debug, Clone)]
pub struct DomainWorktreeInfo {
    pub domain: String,
    pub run_id: String,
    pub path: PathBuf,
    pub branch: String,
    pub base_branch: String,
    pub created_at: DateTime<Utc>,
    pub is_valid: bool,
}

/// Outcome of a merge into the integration branch.
#[derive(Debug, Clone)]
pub struct MergeResult {
    pub success: bool,
    pub has_conflicts: bool,
    pub conflict_files: Vec<String>,
    pub merged_sha: Option<String>,
    pub message: String,
}

/// Runs git commands in a repository with a bounded wall clock.
struct GitRunner {
    repo_path: PathBuf,
}

impl GitRunner {
    fn new(repo_path: PathBuf) -> Self {
        Self { repo_path }
    }

    /// Run git, failing on non-zero exit.
    fn run(&self, args: &[&str], cwd: Option<&Path>) -> WorktreeResult<String> {
        let (success, output) = self.run_unchecked(args, cwd)?;
        if !success {
            return Err(WorktreeError::Git {
                operation: args.join(" "),
                message: output,
            });
        }
        Ok(output)
    }

    /// Run git, reporting success instead of failing. Used where a
    /// failure is an acceptable outcome (deleting a branch that may not
    /// exist, pruning, abort).
    fn run_unchecked(&self, args: &[&str], cwd: Option<&Path>) -> WorktreeResult<(bool, String)> {
        let dir = cwd.unwrap_or(&self.repo_path).to_path_buf();
        let args_owned: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        debug!(args = %args_owned.join(" "), cwd = %dir.display(), "git");

        let child = Command::new("git")
            .args(&args_owned)
            .current_dir(&dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        // Collect output on a helper thread so the bound covers the whole
        // invocation; a timed-out child is left to be reaped when it exits.
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let _ = tx.send(child.wait_with_output());
        });

        match rx.recv_timeout(GIT_TIMEOUT) {
            Ok(result) => {
                let output = result?;
                let stdout = String::from_utf8_lossy(&output.stdout);
                let stderr = String::from_utf8_lossy(&output.stderr);
                let combined = if stderr.trim().is_empty() {
                    stdout.trim().to_string()
                } else {
                    format!("{}\n{}", stdout.trim(), stderr.trim())
                        .trim()
                        .to_string()
                };
                Ok((output.status.success(), combined))
            }
            Err(_) => Err(WorktreeError::Timeout(GIT_TIMEOUT)),
        }
    }
}

/// RAII filesystem lock for one `{run_id, domain}` worktree key.
struct WorktreeLock {
    path: PathBuf,
}

impl WorktreeLock {
    fn acquire(path: PathBuf) -> WorktreeResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let deadline = Instant::now() + LOCK_WAIT;
        loop {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(_) => return Ok(Self { path }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    // Break abandoned locks.
                    if let Ok(metadata) = std::fs::metadata(&path) {
                        let stale = metadata
                            .modified()
                            .ok()
                            .and_then(|modified| modified.elapsed().ok())
                            .is_some_and(|age| age > LOCK_STALE_AFTER);
                        if stale {
                            warn!(lock = %path.display(), "Breaking stale worktree lock");
                            let _ = std::fs::remove_file(&path);
                            continue;
                        }
                    }
                    if Instant::now() >= deadline {
                        return Err(WorktreeError::LockTimeout(path));
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Drop for WorktreeLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn validate_component(value: &str) -> WorktreeResult<()> {
    if value.is_empty()
        || !value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(WorktreeError::InvalidIdentifier(value.to_string()));
    }
    Ok(())
}

/// Manages per-domain git worktrees for isolated parallel development.
pub struct DomainWorktreeManager {
    repo_path: PathBuf,
    git: GitRunner,
    worktrees_base: PathBuf,
    tracked: Mutex<HashMap<String, DomainWorktreeInfo>>,
    branch_pattern: Regex,
}

impl DomainWorktreeManager {
    pub fn new(repo_path: impl AsRef<Path>) -> Self {
        let repo_path = repo_path.as_ref().to_path_buf();
        let worktrees_base = repo_path
            .parent()
            .map(|parent| parent.join("worktrees"))
            .unwrap_or_else(|| repo_path.join("worktrees"));
        Self {
            git: GitRunner::new(repo_path.clone()),
            repo_path,
            worktrees_base,
            tracked: Mutex::new(HashMap::new()),
            branch_pattern: Regex::new(r"^wave/([^/]+)/([^/]+)$")
                .expect("branch pattern is valid"),
        }
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    pub fn worktrees_base(&self) -> &Path {
        &self.worktrees_base
    }

    fn worktree_path(&self, run_id: &str, domain: &str) -> PathBuf {
        self.worktrees_base.join(run_id).join(domain)
    }

    fn lock_path(&self, run_id: &str, domain: &str) -> PathBuf {
        self.worktrees_base.join(run_id).join(format!(".{domain}.lock"))
    }

    /// Branch name for a domain worktree.
    pub fn branch_name(&self, run_id: &str, domain: &str) -> String {
        format!("wave/{run_id}/{domain}")
    }

    /// Integration branch name for a run.
    pub fn integration_branch(&self, run_id: &str) -> String {
        format!("wave/{run_id}/integration")
    }

    fn track_key(run_id: &str, domain: &str) -> String {
        format!("{run_id}:{domain}")
    }

    fn lock_tracked(&self) -> std::sync::MutexGuard<'_, HashMap<String, DomainWorktreeInfo>> {
        self.tracked.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create an isolated worktree for a domain.
    ///
    /// Any prior worktree at the path and any stale branch of the same
    /// name are destroyed first, so re-creating is equivalent to a fresh
    /// create. Returns a descriptor with `is_valid = false` when git
    /// refuses the creation.
    pub fn create_domain_worktree(
        &self,
        domain: &str,
        run_id: &str,
        base_branch: &str,
    ) -> WorktreeResult<DomainWorktreeInfo> {
        validate_component(domain)?;
        validate_component(run_id)?;

        let worktree_path = self.worktree_path(run_id, domain);
        let branch = self.branch_name(run_id, domain);
        let _lock = WorktreeLock::acquire(self.lock_path(run_id, domain))?;

        if let Some(parent) = worktree_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if worktree_path.exists() {
            self.remove_worktree(&worktree_path)?;
        }
        // Leftover branch from a previous run.
        self.git.run_unchecked(&["branch", "-D", &branch], None)?;

        let path_str = worktree_path.display().to_string();
        let (success, output) = self.git.run_unchecked(
            &["worktree", "add", "-b", &branch, &path_str, base_branch],
            None,
        )?;

        let info = DomainWorktreeInfo {
            domain: domain.to_string(),
            run_id: run_id.to_string(),
            path: worktree_path.clone(),
            branch: branch.clone(),
            base_branch: base_branch.to_string(),
            created_at: Utc::now(),
            is_valid: success,
        };
        if success {
            info!(run_id, domain, branch = %branch, path = %worktree_path.display(), "Created worktree");
        } else {
            warn!(run_id, domain, branch = %branch, output = %output, "Failed to create worktree");
        }
        self.lock_tracked()
            .insert(Self::track_key(run_id, domain), info.clone());
        Ok(info)
    }

    /// Tracked descriptor for a domain worktree, if any.
    pub fn get_domain_worktree(&self, domain: &str, run_id: &str) -> Option<DomainWorktreeInfo> {
        self.lock_tracked()
            .get(&Self::track_key(run_id, domain))
            .cloned()
    }

    /// Tracked worktrees for a run.
    pub fn list_run_worktrees(&self, run_id: &str) -> Vec<DomainWorktreeInfo> {
        self.lock_tracked()
            .values()
            .filter(|info| info.run_id == run_id)
            .cloned()
            .collect()
    }

    /// Remove one domain worktree: deregister, delete the directory,
    /// prune stale references. Cleaning a non-existent worktree
    /// succeeds.
    pub fn cleanup_domain_worktree(&self, domain: &str, run_id: &str) -> WorktreeResult<bool> {
        validate_component(domain)?;
        validate_component(run_id)?;
        let _lock = WorktreeLock::acquire(self.lock_path(run_id, domain))?;

        let key = Self::track_key(run_id, domain);
        let info = self.lock_tracked().remove(&key);
        let path = info
            .map(|info| info.path)
            .unwrap_or_else(|| self.worktree_path(run_id, domain));

        if !path.exists() {
            return Ok(true);
        }
        let removed = self.remove_worktree(&path)?;
        info!(run_id, domain, "Cleaned up worktree");
        Ok(removed)
    }

    /// Remove every worktree of a run.
    pub fn cleanup_run_worktrees(&self, run_id: &str) -> WorktreeResult<bool> {
        let worktrees = self.list_run_worktrees(run_id);
        let mut all_ok = true;
        for info in worktrees {
            if !self.cleanup_domain_worktree(&info.domain, run_id)? {
                all_ok = false;
            }
        }
        Ok(all_ok)
    }

    /// Re-discover worktrees from git and re-register them in memory.
    ///
    /// Scans `git worktree list --porcelain` for branches matching
    /// `wave/{run_id}/{domain}`; this is how a fresh manager resumes
    /// after a crash. Integration worktrees are skipped.
    pub fn discover_worktrees(&self) -> WorktreeResult<Vec<DomainWorktreeInfo>> {
        let output = self.git.run(&["worktree", "list", "--porcelain"], None)?;

        let mut discovered = Vec::new();
        let mut current_path: Option<PathBuf> = None;
        let mut current_branch: Option<String> = None;

        let mut flush =
            |path: &mut Option<PathBuf>, branch: &mut Option<String>| {
                if let (Some(path), Some(branch)) = (path.take(), branch.take()) {
                    if let Some(captures) = self.branch_pattern.captures(&branch) {
                        let run_id = captures[1].to_string();
                        let domain = captures[2].to_string();
                        if domain != "integration" {
                            discovered.push(DomainWorktreeInfo {
                                is_valid: path.exists(),
                                domain,
                                run_id,
                                path,
                                branch: branch.clone(),
                                base_branch: "main".to_string(),
                                created_at: Utc::now(),
                            });
                        }
                    }
                }
            };

        for line in output.lines() {
            if let Some(path) = line.strip_prefix("worktree ") {
                current_path = Some(PathBuf::from(path));
            } else if let Some(branch) = line.strip_prefix("branch ") {
                current_branch = Some(branch.trim_start_matches("refs/heads/").to_string());
            } else if line.is_empty() {
                flush(&mut current_path, &mut current_branch);
            }
        }
        flush(&mut current_path, &mut current_branch);

        let mut tracked = self.lock_tracked();
        for info in &discovered {
            tracked.insert(Self::track_key(&info.run_id, &info.domain), info.clone());
        }
        info!(count = discovered.len(), "Discovered worktrees");
        Ok(discovered)
    }

    /// Create (or recreate) the integration branch for a run.
    pub fn create_integration_branch(
        &self,
        run_id: &str,
        base_branch: &str,
    ) -> WorktreeResult<String> {
        validate_component(run_id)?;
        let branch = self.integration_branch(run_id);
        self.git.run_unchecked(&["branch", "-D", &branch], None)?;
        let (success, output) = self
            .git
            .run_unchecked(&["branch", &branch, base_branch], None)?;
        if !success {
            warn!(branch = %branch, output = %output, "Failed to create integration branch");
        }
        Ok(branch)
    }

    /// Merge a domain branch into the run's integration branch.
    ///
    /// Opens a temporary worktree on the integration branch, runs a
    /// no-fast-forward merge, captures per-file conflicts, aborts on
    /// conflict, and always removes the temporary worktree.
    pub fn merge_domain_to_integration(
        &self,
        domain: &str,
        run_id: &str,
    ) -> WorktreeResult<MergeResult> {
        validate_component(domain)?;
        validate_component(run_id)?;

        let domain_branch = self.branch_name(run_id, domain);
        let integration_branch = self.integration_branch(run_id);
        let integration_path = self.worktrees_base.join(run_id).join("_integration");

        if let Some(parent) = integration_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if integration_path.exists() {
            self.remove_worktree(&integration_path)?;
        }

        let path_str = integration_path.display().to_string();
        let (success, output) = self.git.run_unchecked(
            &["worktree", "add", &path_str, &integration_branch],
            None,
        )?;
        if !success {
            return Ok(MergeResult {
                success: false,
                has_conflicts: false,
                conflict_files: Vec::new(),
                merged_sha: None,
                message: format!("Failed to checkout integration branch: {output}"),
            });
        }

        let result = self.merge_in_worktree(&integration_path, &domain_branch, &integration_branch);
        // The temporary worktree goes away no matter how the merge went.
        self.remove_worktree(&integration_path)?;
        result
    }

    fn merge_in_worktree(
        &self,
        integration_path: &Path,
        domain_branch: &str,
        integration_branch: &str,
    ) -> WorktreeResult<MergeResult> {
        let message = format!("Merge {domain_branch} into {integration_branch}");
        let (success, output) = self.git.run_unchecked(
            &[
                "-c",
                "user.name=WAVE Merge",
                "-c",
                "user.email=wave@wave.dev",
                "merge",
                "--no-ff",
                "-m",
                &message,
                domain_branch,
            ],
            Some(integration_path),
        )?;

        if !success {
            let has_conflicts = output.contains("CONFLICT");
            let conflict_files = output
                .lines()
                .filter_map(|line| {
                    line.split("Merge conflict in ")
                        .nth(1)
                        .map(|file| file.trim().to_string())
                })
                .collect();
            if has_conflicts {
                self.git
                    .run_unchecked(&["merge", "--abort"], Some(integration_path))?;
            }
            return Ok(MergeResult {
                success: false,
                has_conflicts,
                conflict_files,
                merged_sha: None,
                message: output,
            });
        }

        let (_, sha) = self
            .git
            .run_unchecked(&["rev-parse", "HEAD"], Some(integration_path))?;
        Ok(MergeResult {
            success: true,
            has_conflicts: false,
            conflict_files: Vec::new(),
            merged_sha: Some(sha.trim().to_string()),
            message,
        })
    }

    /// Merge every domain into the integration branch, in order.
    ///
    /// Conflict-only failures accumulate and the remaining domains still
    /// merge; a non-conflict failure aborts the sweep.
    pub fn merge_all_domains(
        &self,
        run_id: &str,
        domains: &[String],
    ) -> WorktreeResult<MergeResult> {
        let mut conflict_files = Vec::new();
        let mut has_any_conflicts = false;

        for domain in domains {
            let result = self.merge_domain_to_integration(domain, run_id)?;
            if result.has_conflicts {
                has_any_conflicts = true;
                conflict_files.extend(result.conflict_files);
            } else if !result.success {
                return Ok(result);
            }
        }

        Ok(MergeResult {
            success: !has_any_conflicts,
            has_conflicts: has_any_conflicts,
            conflict_files,
            merged_sha: None,
            message: format!("Merged {} domains into integration", domains.len()),
        })
    }

    fn remove_worktree(&self, path: &Path) -> WorktreeResult<bool> {
        let path_str = path.display().to_string();
        let (removed, _) =
            self.git
                .run_unchecked(&["worktree", "remove", &path_str, "--force"], None)?;

        if path.exists() {
            if let Err(e) = std::fs::remove_dir_all(path) {
                warn!(path = %path.display(), error = %e, "Failed to remove worktree directory");
            }
        }
        self.git.run_unchecked(&["worktree", "prune"], None)?;
        Ok(removed || !path.exists())
    }
}
