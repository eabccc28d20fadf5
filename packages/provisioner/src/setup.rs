// ABOUTME: Repository checkout inside the sandbox: fresh shallow clone or update in place
// ABOUTME: Resolves the remote default branch when none is pinned; failure to do so is fatal

use crate::error::{ProvisionError, Result};
use crate::provisioner::{synopsis, CliProvisioner};
use hatchery_sandbox::ExecOutput;
use serde::Serialize;
use std::collections::HashMap;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupResult {
    pub repo_dir: String,
    /// Branch checked out after setup
    pub branch: String,
    pub commit: Option<String>,
    /// False when an existing checkout was updated
    pub fresh_clone: bool,
}

/// Default branch from `git ls-remote --symref <url> HEAD` output
pub fn parse_symref_head(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let rest = line.trim().strip_prefix("ref:")?;
        let (reference, head) = rest.trim().split_once(char::is_whitespace)?;
        if head.trim() != "HEAD" {
            return None;
        }
        reference
            .strip_prefix("refs/heads/")
            .filter(|branch| !branch.is_empty())
            .map(str::to_string)
    })
}

impl CliProvisioner {
    async fn git(&self, args: &[&str]) -> ExecOutput {
        let mut argv = vec!["git"];
        argv.extend_from_slice(args);
        let env = HashMap::from([("GIT_TERMINAL_PROMPT".to_string(), "0".to_string())]);
        self.exec(&argv, &env).await
    }

    async fn git_step(&self, step: &str, args: &[&str]) -> Result<ExecOutput> {
        let output = self.git(args).await;
        if output.success() {
            Ok(output)
        } else {
            Err(ProvisionError::setup_command(
                format!("{}: {}", step, synopsis(&output)),
                &output,
            ))
        }
    }

    /// Ask the remote which branch HEAD points at
    pub async fn resolve_default_branch(&self, repo_url: &str) -> Result<String> {
        let output = self.git(&["ls-remote", "--symref", repo_url, "HEAD"]).await;
        if !output.success() {
            return Err(ProvisionError::setup_command(
                format!(
                    "could not resolve default branch of {}: {}",
                    repo_url,
                    synopsis(&output)
                ),
                &output,
            ));
        }
        parse_symref_head(&output.output).ok_or_else(|| {
            ProvisionError::setup_command(
                format!("remote {} did not report a default branch", repo_url),
                &output,
            )
        })
    }

    /// Bring the checkout at the configured repo dir to `branch` of `repo_url`.
    ///
    /// An existing checkout is re-pointed at the URL and fast-forwarded; otherwise
    /// a fresh repository is initialised and the branch fetched shallow.
    pub async fn setup_environment(&self, repo_url: &str, branch: Option<&str>) -> Result<SetupResult> {
        let branch = match branch.map(str::trim).filter(|b| !b.is_empty()) {
            Some(branch) => branch.to_string(),
            None => self.resolve_default_branch(repo_url).await?,
        };
        let dir = self.config().repo_dir.clone();
        let git_dir = format!("{}/.git", dir);

        let existing = self
            .exec(&["test", "-d", &git_dir], &HashMap::new())
            .await
            .success();
        info!(
            container_id = %self.container_id(),
            repo = %repo_url,
            branch = %branch,
            existing,
            "Setting up repository"
        );

        if existing {
            let set_url = self.git(&["-C", &dir, "remote", "set-url", "origin", repo_url]).await;
            if !set_url.success() {
                self.git_step("add remote", &["-C", &dir, "remote", "add", "origin", repo_url])
                    .await?;
            }
            self.git_step("fetch", &["-C", &dir, "fetch", "origin", &branch])
                .await?;
            let checkout = self.git(&["-C", &dir, "checkout", &branch]).await;
            if !checkout.success() {
                self.git_step(
                    "checkout",
                    &["-C", &dir, "checkout", "-b", &branch, "FETCH_HEAD"],
                )
                .await?;
            }
            self.git_step("fast-forward", &["-C", &dir, "merge", "--ff-only", "FETCH_HEAD"])
                .await?;
        } else {
            let mkdir = self.exec(&["mkdir", "-p", &dir], &HashMap::new()).await;
            if !mkdir.success() {
                return Err(ProvisionError::setup_command(
                    format!("could not create {}: {}", dir, synopsis(&mkdir)),
                    &mkdir,
                ));
            }
            self.git_step("init", &["init", "-q", &dir]).await?;
            self.git_step("add remote", &["-C", &dir, "remote", "add", "origin", repo_url])
                .await?;
            self.git_step(
                "fetch",
                &["-C", &dir, "fetch", "--depth", "1", "origin", &branch],
            )
            .await?;
            self.git_step(
                "checkout",
                &["-C", &dir, "checkout", "-q", "-b", &branch, "FETCH_HEAD"],
            )
            .await?;
        }

        let current = self
            .git_step("read branch", &["-C", &dir, "rev-parse", "--abbrev-ref", "HEAD"])
            .await?;
        let commit = self.git(&["-C", &dir, "rev-parse", "HEAD"]).await;

        Ok(SetupResult {
            repo_dir: dir,
            branch: current.output.trim().to_string(),
            commit: commit
                .success()
                .then(|| commit.output.trim().to_string()),
            fresh_clone: !existing,
        })
    }
}
