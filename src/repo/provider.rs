//! Repository provisioning: one bare repo per logical repository, one
//! worktree per session on a fresh branch.
//!
//! The provider keeps a bare clone of the configured repository under the
//! data dir and materializes an isolated worktree for every session, so
//! concurrent sessions on the same repository never share a checkout. All
//! mutating operations on a bare repo are serialized by a per-repo async
//! mutex; branch names carry a monotonic nanosecond stamp so tight loops
//! cannot collide.
//!
//! Git runs as a subprocess. Short-lived access tokens are embedded in the
//! remote URL for clone/fetch and handed to the agent subprocess through
//! its environment; they are never written to disk.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::GlobalConfig;
use crate::github::TokenProvider;
use crate::{AppError, Result};

/// Branch namespace for session branches.
const BRANCH_PREFIX: &str = "acp-agent";

/// Result of provisioning a working directory for one session.
#[derive(Debug, Clone)]
pub struct RepositoryHandle {
    /// Absolute worktree path the agent runs in.
    pub cwd: PathBuf,
    /// Branch the worktree is on; empty when no repository is configured.
    pub branch_name: String,
    /// Environment for the agent subprocess (fresh tokens included).
    pub env: HashMap<String, String>,
}

/// Convert free text into a branch-safe slug.
#[must_use]
pub fn slugify(text: &str, max_length: usize) -> String {
    let mut slug = String::with_capacity(text.len());
    let mut last_hyphen = true;
    for ch in text.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
            last_hyphen = false;
        } else if !last_hyphen {
            slug.push('-');
            last_hyphen = true;
        }
    }
    let mut slug = slug.trim_matches('-').to_owned();
    if slug.len() > max_length {
        slug.truncate(max_length);
        slug = slug.trim_end_matches('-').to_owned();
    }
    if slug.is_empty() {
        "task".into()
    } else {
        slug
    }
}

/// Issues per-session isolated working directories on shared bare repos.
pub struct RepoProvider {
    config: Arc<GlobalConfig>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    branch_stamp: AtomicU64,
}

impl RepoProvider {
    /// Create a provider rooted at the configured data dir.
    #[must_use]
    pub fn new(config: Arc<GlobalConfig>) -> Self {
        Self {
            config,
            locks: Mutex::default(),
            branch_stamp: AtomicU64::new(0),
        }
    }

    /// Provision a working directory for a new session.
    ///
    /// With a repository configured this ensures the bare clone is current,
    /// creates `acp-agent/<slug>-<stamp>` from the default branch tip,
    /// attaches a worktree at a deterministic path, and installs skill
    /// files. Without one it falls back to a plain scratch directory (no
    /// branch), so the bridge stays usable for repositories managed out of
    /// band.
    ///
    /// # Errors
    ///
    /// - `AppError::Repo` — clone/fetch/worktree failure, or the worktree
    ///   path already exists.
    /// - `AppError::Auth` — the token vendor could not mint a token.
    pub async fn provision(
        &self,
        repo_id: &str,
        slug: &str,
        tokens: Option<&Arc<dyn TokenProvider>>,
    ) -> Result<RepositoryHandle> {
        let env = self.build_agent_env(tokens).await;
        let slug = slugify(slug, 60);
        let stamp = self.next_branch_stamp();

        if repo_id.is_empty() {
            let cwd = self.config.worktrees_dir().join(format!("{slug}-{stamp}"));
            tokio::fs::create_dir_all(&cwd).await?;
            warn!(cwd = %cwd.display(), "no repository configured; using scratch directory");
            return Ok(RepositoryHandle {
                cwd,
                branch_name: String::new(),
                env,
            });
        }

        let lock = self.repo_lock(repo_id).await;
        let _guard = lock.lock().await;

        let bare = self.bare_path(repo_id)?;
        self.ensure_bare_repo(repo_id, &bare, tokens).await?;
        let default_branch = self.default_branch(&bare).await?;

        let branch_name = format!("{BRANCH_PREFIX}/{slug}-{stamp}");
        let cwd = self.config.worktrees_dir().join(format!("{slug}-{stamp}"));
        if cwd.exists() {
            return Err(AppError::Repo(format!(
                "worktree conflict: {} already exists",
                cwd.display()
            )));
        }
        if let Some(parent) = cwd.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        run_git(
            &bare,
            &[
                "worktree",
                "add",
                "-b",
                &branch_name,
                &cwd.to_string_lossy(),
                &default_branch,
            ],
        )
        .await?;

        self.install_skill_files(&cwd).await;

        info!(
            repo = repo_id,
            branch = %branch_name,
            cwd = %cwd.display(),
            "provisioned session worktree"
        );

        Ok(RepositoryHandle {
            cwd,
            branch_name,
            env,
        })
    }

    /// Refresh a session's working copy for a follow-up turn: fetch the
    /// latest refs into the bare repo, re-install skill files, and rebuild
    /// the agent environment with fresh tokens.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Repo` when the worktree is gone or the fetch
    /// fails.
    pub async fn prepare_resume(
        &self,
        repo_id: &str,
        branch_name: &str,
        cwd: &Path,
        tokens: Option<&Arc<dyn TokenProvider>>,
    ) -> Result<RepositoryHandle> {
        let env = self.build_agent_env(tokens).await;

        if !cwd.is_dir() {
            return Err(AppError::Repo(format!(
                "worktree missing: {}",
                cwd.display()
            )));
        }

        if !repo_id.is_empty() && !branch_name.is_empty() {
            let lock = self.repo_lock(repo_id).await;
            let _guard = lock.lock().await;

            let bare = self.bare_path(repo_id)?;
            self.ensure_bare_repo(repo_id, &bare, tokens).await?;
            self.install_skill_files(cwd).await;
        }

        Ok(RepositoryHandle {
            cwd: cwd.to_path_buf(),
            branch_name: branch_name.to_owned(),
            env,
        })
    }

    /// Build the environment for an agent subprocess: forwarded model API
    /// keys plus a fresh `GH_TOKEN` when a vendor is available. Token
    /// failures degrade to a warning — a session without push access is
    /// still better than no session.
    pub async fn build_agent_env(
        &self,
        tokens: Option<&Arc<dyn TokenProvider>>,
    ) -> HashMap<String, String> {
        let mut env = self.config.forwarded_agent_env();

        if let Some(provider) = tokens {
            match provider.installation_token().await {
                Ok(token) => {
                    env.insert("GH_TOKEN".into(), token);
                }
                Err(err) => {
                    warn!(%err, "failed to mint agent access token");
                }
            }
        }

        env
    }

    /// Remove a session's worktree. The branch is left for review.
    pub async fn cleanup_worktree(&self, repo_id: &str, cwd: &Path) {
        if repo_id.is_empty() {
            if let Err(err) = tokio::fs::remove_dir_all(cwd).await {
                debug!(cwd = %cwd.display(), %err, "scratch directory removal failed");
            }
            return;
        }

        let Ok(bare) = self.bare_path(repo_id) else {
            return;
        };

        if let Err(err) = run_git(
            &bare,
            &["worktree", "remove", "--force", &cwd.to_string_lossy()],
        )
        .await
        {
            debug!(cwd = %cwd.display(), %err, "worktree remove failed, deleting directly");
            tokio::fs::remove_dir_all(cwd).await.ok();
        }
        run_git(&bare, &["worktree", "prune"]).await.ok();
    }

    /// Remove worktree directories older than `max_age` that belong to no
    /// active session. Returns how many were removed.
    pub async fn sweep_stale_worktrees(
        &self,
        max_age: Duration,
        active_cwds: &HashSet<PathBuf>,
    ) -> usize {
        let dir = self.config.worktrees_dir();
        let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
            return 0;
        };

        let mut removed = 0;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if active_cwds.contains(&path) {
                continue;
            }
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            let stale = meta
                .modified()
                .ok()
                .and_then(|mtime| mtime.elapsed().ok())
                .is_some_and(|age| age > max_age);
            if !stale {
                continue;
            }

            self.cleanup_worktree(&self.config.github.repo, &path).await;
            info!(path = %path.display(), "removed stale worktree");
            removed += 1;
        }
        removed
    }

    // ── Internals ────────────────────────────────────────────────────────────

    async fn repo_lock(&self, repo_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(locks.entry(repo_id.to_owned()).or_default())
    }

    fn bare_path(&self, repo_id: &str) -> Result<PathBuf> {
        let (owner, name) = repo_id
            .split_once('/')
            .ok_or_else(|| AppError::Repo(format!("invalid repo id '{repo_id}'")))?;
        Ok(self
            .config
            .repos_dir()
            .join(owner)
            .join(format!("{name}.git")))
    }

    /// Clone the bare repo if absent, otherwise re-point its remote at a
    /// freshly tokened URL and fetch all branches.
    async fn ensure_bare_repo(
        &self,
        repo_id: &str,
        bare: &Path,
        tokens: Option<&Arc<dyn TokenProvider>>,
    ) -> Result<()> {
        let token = match tokens {
            Some(provider) => Some(provider.installation_token().await?),
            None => None,
        };
        let url = self.config.github.remote_url(token.as_deref());

        if bare.is_dir() {
            debug!(repo = repo_id, "fetching latest into bare repo");
            run_git(bare, &["remote", "set-url", "origin", &url]).await?;
            // No --prune here: session branches live in refs/heads of the
            // bare repo and must not be collected when upstream lacks them.
            run_git(bare, &["fetch", "origin", "+refs/heads/*:refs/heads/*"]).await?;
        } else {
            info!(repo = repo_id, bare = %bare.display(), "cloning bare repo");
            if let Some(parent) = bare.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            run_git_anywhere(&["clone", "--bare", &url, &bare.to_string_lossy()]).await?;
        }
        Ok(())
    }

    async fn default_branch(&self, bare: &Path) -> Result<String> {
        let out = run_git(bare, &["symbolic-ref", "--short", "HEAD"]).await?;
        let branch = out.trim();
        if branch.is_empty() {
            // Detached bare HEAD; fall back to the conventional name.
            Ok("main".into())
        } else {
            Ok(branch.to_owned())
        }
    }

    /// Copy per-service skill files into `<worktree>/.claude/skills/`.
    /// Missing source directories are fine — skills are optional.
    async fn install_skill_files(&self, worktree: &Path) {
        let source_root = &self.config.skills_dir;
        if !source_root.is_dir() {
            return;
        }

        for service in &self.config.enabled_services {
            let source = source_root.join(service);
            let Ok(mut entries) = tokio::fs::read_dir(&source).await else {
                continue;
            };
            let target = worktree.join(".claude").join("skills").join(service);
            if let Err(err) = tokio::fs::create_dir_all(&target).await {
                warn!(%err, "failed to create skills dir, skipping");
                continue;
            }
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                if path.is_file() {
                    if let Some(name) = path.file_name() {
                        if let Err(err) = tokio::fs::copy(&path, target.join(name)).await {
                            warn!(file = %path.display(), %err, "failed to install skill file");
                        }
                    }
                }
            }
            debug!(service, worktree = %worktree.display(), "installed skill files");
        }
    }

    /// Strictly increasing branch stamp: nanoseconds since the epoch,
    /// bumped past the previous value when the clock stands still.
    fn next_branch_stamp(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX));
        loop {
            let prev = self.branch_stamp.load(Ordering::SeqCst);
            let next = now.max(prev + 1);
            if self
                .branch_stamp
                .compare_exchange(prev, next, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return next;
            }
        }
    }
}

/// Run a git command inside `repo_dir`, returning stdout.
async fn run_git(repo_dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .arg("-C")
        .arg(repo_dir)
        .args(args)
        .output()
        .await
        .map_err(|err| AppError::Repo(format!("failed to run git: {err}")))?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        Err(AppError::Repo(format!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

/// Run a git command with no working directory (clone).
async fn run_git_anywhere(args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .output()
        .await
        .map_err(|err| AppError::Repo(format!("failed to run git: {err}")))?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        Err(AppError::Repo(format!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}
