//! Global configuration parsing, validation, and credential resolution.
//!
//! All configuration is read from environment variables into one immutable
//! [`GlobalConfig`] value at boot. Per-agent credential overrides use the
//! `<VAR>__<AGENT>` suffix convention: a non-default agent only sees a
//! credential when its suffixed variant is set, so two agents never end up
//! sharing an ingress identity by accident.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::{AppError, Result};

/// Name assigned to the agent synthesized from `ACP_AGENT_COMMAND` when no
/// `AGENTS_JSON` registry is provided.
pub const SINGLE_AGENT_NAME: &str = "default";

fn default_agent_command() -> String {
    "claude-code-acp".into()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/acp-bridge")
}

fn default_http_port() -> u16 {
    8000
}

fn default_debounce_ms() -> u64 {
    2_000
}

/// One configured agent binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    /// Registry key, used in routes and persisted metadata.
    pub name: String,
    /// Program to spawn.
    pub command: String,
    /// Arguments passed before any protocol traffic.
    pub args: Vec<String>,
    /// Whether this agent owns the unqualified webhook routes.
    pub is_default: bool,
}

/// Raw `AGENTS_JSON` entry: `{"command": "...", "default": true}`.
#[derive(Debug, Deserialize)]
struct AgentEntry {
    command: String,
    #[serde(default)]
    default: bool,
}

/// GitHub integration settings for the Repository Provider. App
/// credentials themselves are resolved per agent by the application shell
/// (`GITHUB_APP_ID` / `GITHUB_PRIVATE_KEY`, optionally `__<AGENT>`-scoped).
#[derive(Debug, Clone, Default)]
pub struct GithubConfig {
    /// `owner/name` of the managed repository; empty disables repo features.
    pub repo: String,
    /// Installation to mint access tokens for.
    pub installation_id: u64,
    /// Base URL for clone remotes. Overridable so tests can point at a
    /// local filesystem remote.
    pub remote_base: String,
}

impl GithubConfig {
    /// Clone/fetch remote URL for `repo`, embedding `token` when present.
    #[must_use]
    pub fn remote_url(&self, token: Option<&str>) -> String {
        match token {
            Some(t) if self.remote_base.starts_with("https://") => {
                let host = self.remote_base.trim_start_matches("https://");
                format!("https://x-access-token:{t}@{host}/{}.git", self.repo)
            }
            _ => format!("{}/{}.git", self.remote_base, self.repo),
        }
    }
}

/// Global configuration assembled from the process environment.
#[derive(Debug, Clone)]
pub struct GlobalConfig {
    /// Root for bare repos, worktrees, and the session store.
    pub data_dir: PathBuf,
    /// Port for the HTTP ingress surface.
    pub http_port: u16,
    /// Public base URL used to build session-viewer links; empty disables.
    pub base_url: String,
    /// Enabled adapter services, in declaration order.
    pub enabled_services: Vec<String>,
    /// Agent registry keyed by name.
    pub agents: HashMap<String, AgentConfig>,
    /// GitHub integration settings.
    pub github: GithubConfig,
    /// Update-router debounce window.
    pub debounce_window: Duration,
    /// Directory holding per-service skill files to install into worktrees.
    pub skills_dir: PathBuf,
    /// Raw environment snapshot for credential lookups.
    env: HashMap<String, String>,
}

impl GlobalConfig {
    /// Load configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_env() -> Result<Self> {
        Self::from_map(env::vars().collect())
    }

    /// Build configuration from an explicit variable map (test seam).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if `AGENTS_JSON` is malformed, the agent
    /// registry is empty or has no unique default, or numeric fields fail
    /// to parse.
    pub fn from_map(vars: HashMap<String, String>) -> Result<Self> {
        let get = |key: &str| vars.get(key).cloned().unwrap_or_default();

        let agents = parse_agents(&vars)?;

        let enabled_services: Vec<String> = get("ENABLED_SERVICES")
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect();

        let installation_id = match vars.get("GITHUB_INSTALLATION_ID") {
            Some(raw) if !raw.is_empty() => raw.parse::<u64>().map_err(|err| {
                AppError::Config(format!("GITHUB_INSTALLATION_ID invalid: {err}"))
            })?,
            _ => 0,
        };

        let github = GithubConfig {
            repo: get("GITHUB_REPO"),
            installation_id,
            remote_base: match vars.get("GIT_REMOTE_BASE") {
                Some(base) if !base.is_empty() => base.trim_end_matches('/').to_owned(),
                _ => "https://github.com".into(),
            },
        };

        let debounce_ms = match vars.get("BRIDGE_DEBOUNCE_MS") {
            Some(raw) if !raw.is_empty() => raw
                .parse::<u64>()
                .map_err(|err| AppError::Config(format!("BRIDGE_DEBOUNCE_MS invalid: {err}")))?,
            _ => default_debounce_ms(),
        };

        let http_port = match vars.get("BRIDGE_HTTP_PORT") {
            Some(raw) if !raw.is_empty() => raw
                .parse::<u16>()
                .map_err(|err| AppError::Config(format!("BRIDGE_HTTP_PORT invalid: {err}")))?,
            _ => default_http_port(),
        };

        let config = Self {
            data_dir: match vars.get("BRIDGE_DATA_DIR") {
                Some(dir) if !dir.is_empty() => PathBuf::from(dir),
                _ => default_data_dir(),
            },
            http_port,
            base_url: get("BRIDGE_BASE_URL").trim_end_matches('/').to_owned(),
            enabled_services,
            agents,
            github,
            debounce_window: Duration::from_millis(debounce_ms),
            skills_dir: match vars.get("BRIDGE_SKILLS_DIR") {
                Some(dir) if !dir.is_empty() => PathBuf::from(dir),
                _ => PathBuf::from("skills"),
            },
            env: vars,
        };

        config.validate()?;
        Ok(config)
    }

    /// The agent that owns unqualified webhook routes.
    ///
    /// Validation guarantees exactly one default exists.
    #[must_use]
    pub fn default_agent(&self) -> &AgentConfig {
        self.agents
            .values()
            .find(|a| a.is_default)
            .unwrap_or_else(|| unreachable!("validated: registry has a default agent"))
    }

    /// Look up an agent by name, falling back to the default for an empty
    /// name (legacy persisted records carry no agent name).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` when the name is unknown.
    pub fn agent(&self, name: &str) -> Result<&AgentConfig> {
        if name.is_empty() {
            return Ok(self.default_agent());
        }
        self.agents
            .get(name)
            .ok_or_else(|| AppError::Config(format!("unknown agent '{name}'")))
    }

    /// Resolve a credential for an agent.
    ///
    /// The suffixed form `<VAR>__<AGENT>` (agent uppercased, `-` → `_`)
    /// always wins. The bare variable is only consulted for the default
    /// agent, so non-default agents must be provisioned explicitly.
    #[must_use]
    pub fn service_credential(&self, var: &str, agent: &AgentConfig) -> Option<String> {
        let suffix = agent.name.to_uppercase().replace('-', "_");
        let scoped = format!("{var}__{suffix}");
        if let Some(value) = self.env.get(&scoped).filter(|v| !v.is_empty()) {
            return Some(value.clone());
        }
        if agent.is_default {
            return self.env.get(var).filter(|v| !v.is_empty()).cloned();
        }
        None
    }

    /// Environment variables forwarded verbatim into every agent subprocess.
    #[must_use]
    pub fn forwarded_agent_env(&self) -> HashMap<String, String> {
        let mut env = HashMap::new();
        for key in ["ANTHROPIC_API_KEY", "OPENAI_API_KEY"] {
            if let Some(value) = self.env.get(key).filter(|v| !v.is_empty()) {
                env.insert(key.to_owned(), value.clone());
            }
        }
        env
    }

    /// Path of the persisted session document.
    #[must_use]
    pub fn persistence_path(&self) -> PathBuf {
        self.data_dir.join("sessions.json")
    }

    /// Root directory for bare repositories.
    #[must_use]
    pub fn repos_dir(&self) -> PathBuf {
        self.data_dir.join("repos")
    }

    /// Root directory for per-session worktrees.
    #[must_use]
    pub fn worktrees_dir(&self) -> PathBuf {
        self.data_dir.join("worktrees")
    }

    /// Viewer URL for an ACP session, or empty when no base URL is set.
    #[must_use]
    pub fn session_url(&self, acp_session_id: &str) -> String {
        if self.base_url.is_empty() {
            String::new()
        } else {
            format!("{}/sessions/{acp_session_id}", self.base_url)
        }
    }

    fn validate(&self) -> Result<()> {
        if self.agents.is_empty() {
            return Err(AppError::Config(
                "no agents configured: set ACP_AGENT_COMMAND or AGENTS_JSON".into(),
            ));
        }

        let defaults = self.agents.values().filter(|a| a.is_default).count();
        if defaults != 1 {
            return Err(AppError::Config(format!(
                "agent registry must have exactly one default agent, found {defaults}"
            )));
        }

        if self.data_dir.as_os_str().is_empty() {
            return Err(AppError::Config("BRIDGE_DATA_DIR must not be empty".into()));
        }

        Ok(())
    }
}

/// Parse the agent registry from `AGENTS_JSON`, or synthesize a single-agent
/// registry from `ACP_AGENT_COMMAND`.
fn parse_agents(vars: &HashMap<String, String>) -> Result<HashMap<String, AgentConfig>> {
    if let Some(raw) = vars.get("AGENTS_JSON").filter(|v| !v.is_empty()) {
        let entries: HashMap<String, AgentEntry> = serde_json::from_str(raw)
            .map_err(|err| AppError::Config(format!("AGENTS_JSON invalid: {err}")))?;

        let mut agents = HashMap::new();
        let single = entries.len() == 1;
        let explicit_default = entries.values().any(|e| e.default);
        for (name, entry) in entries {
            let (command, args) = split_command(&entry.command)
                .ok_or_else(|| AppError::Config(format!("agent '{name}' has empty command")))?;
            // A lone registry entry is the default even without the flag.
            let is_default = entry.default || (single && !explicit_default);
            agents.insert(
                name.clone(),
                AgentConfig {
                    name,
                    command,
                    args,
                    is_default,
                },
            );
        }
        return Ok(agents);
    }

    let raw_command = vars
        .get("ACP_AGENT_COMMAND")
        .filter(|v| !v.is_empty())
        .cloned()
        .unwrap_or_else(default_agent_command);
    let (command, args) = split_command(&raw_command)
        .ok_or_else(|| AppError::Config("ACP_AGENT_COMMAND must not be blank".into()))?;

    Ok(HashMap::from([(
        SINGLE_AGENT_NAME.to_owned(),
        AgentConfig {
            name: SINGLE_AGENT_NAME.to_owned(),
            command,
            args,
            is_default: true,
        },
    )]))
}

/// Split a command string on whitespace into program + arguments.
fn split_command(raw: &str) -> Option<(String, Vec<String>)> {
    let mut parts = raw.split_whitespace().map(str::to_owned);
    let program = parts.next()?;
    Some((program, parts.collect()))
}
