//! Git-worktree experiment flow: create a worktree-backed child session,
//! then merge it back or discard it. The session manager only records the
//! links; all git work happens here.

use std::path::Path;
use std::path::PathBuf;

use axum::Json;
use axum::extract::State;
use chrono::Utc;
use claudex_core::SessionInfo;
use serde::Deserialize;
use serde::Serialize;
use serde_json::json;
use tracing::warn;

use crate::AppState;
use crate::api::ApiError;

/// Config files copied into a fresh worktree so experiments run out of the
/// box.
const WORKTREE_SEED_FILES: &[&str] = &[".env", "config.json", "config.local.json", ".env.local"];

#[derive(Debug, Default, Serialize)]
pub struct WorktreeInfo {
    pub is_worktree: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub main_repo: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateExperimentRequest {
    pub parent_id: String,
    #[serde(default)]
    pub branch_name: String,
    #[serde(default)]
    pub copy_files: Vec<String>,
}

async fn git(dir: &Path, args: &[&str]) -> std::io::Result<std::process::Output> {
    tokio::process::Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .await
}

async fn git_ok(dir: &Path, args: &[&str]) -> Result<String, String> {
    match git(dir, args).await {
        Ok(output) if output.status.success() => {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        }
        Ok(output) => Err(String::from_utf8_lossy(&output.stderr).into_owned()),
        Err(err) => Err(err.to_string()),
    }
}

/// Walks up from `dir` to the first directory containing `.git`.
fn find_git_root(dir: &str) -> Option<PathBuf> {
    let mut current = PathBuf::from(dir);
    loop {
        if current.join(".git").exists() {
            return Some(current);
        }
        if !current.pop() {
            return None;
        }
    }
}

pub async fn create_experiment(
    State(state): State<AppState>,
    Json(req): Json<CreateExperimentRequest>,
) -> Result<Json<SessionInfo>, ApiError> {
    let parent = state
        .manager
        .get(&req.parent_id)
        .ok_or_else(|| ApiError::NotFound(format!("parent session not found: {}", req.parent_id)))?;

    let git_root = find_git_root(&parent.directory()).ok_or_else(|| {
        ApiError::BadRequest("parent directory is not a git repository".to_string())
    })?;

    let current_branch = git_ok(&git_root, &["branch", "--show-current"])
        .await
        .map_err(|err| ApiError::Internal(format!("failed to get current branch: {err}")))?
        .trim()
        .to_string();

    let branch_name = if req.branch_name.is_empty() {
        format!("exp-{current_branch}-{}", Utc::now().timestamp())
    } else {
        req.branch_name.clone()
    };

    // The worktree lands as a sibling of the main checkout.
    let worktree_path = git_root
        .parent()
        .unwrap_or(&git_root)
        .join(&branch_name);
    let worktree_str = worktree_path.display().to_string();

    git_ok(
        &git_root,
        &["worktree", "add", "-b", &branch_name, &worktree_str],
    )
    .await
    .map_err(|err| ApiError::Internal(format!("failed to create worktree: {err}")))?;

    let mut seed_files: Vec<String> =
        WORKTREE_SEED_FILES.iter().map(|f| f.to_string()).collect();
    seed_files.extend(req.copy_files.iter().cloned());
    for file in &seed_files {
        let src = git_root.join(file);
        if !src.exists() {
            continue;
        }
        let dst = worktree_path.join(file);
        if let Some(dir) = dst.parent() {
            let _ = std::fs::create_dir_all(dir);
        }
        if let Err(err) = std::fs::copy(&src, &dst) {
            warn!(%file, error = %err, "failed to seed worktree file");
        }
    }

    match state
        .manager
        .create_experiment(&req.parent_id, &branch_name, &worktree_str)
    {
        Ok(session) => Ok(Json(session.info()?)),
        Err(err) => {
            // Leave no half-created worktree behind.
            let _ = git(&git_root, &["worktree", "remove", &worktree_str]).await;
            Err(err.into())
        }
    }
}

pub async fn info() -> Json<WorktreeInfo> {
    Json(current_worktree_info().await)
}

/// Merges the server's worktree branch into master and removes the
/// worktree. Pending changes are committed first.
pub async fn merge() -> Result<Json<serde_json::Value>, ApiError> {
    let info = current_worktree_info().await;
    if !info.is_worktree {
        return Err(ApiError::BadRequest("not in a worktree".to_string()));
    }
    let worktree = PathBuf::from(info.path.unwrap_or_default());
    let main_repo = PathBuf::from(info.main_repo.unwrap_or_default());
    let branch = info.branch.unwrap_or_default();

    let _ = git(&worktree, &["add", "-A"]).await;
    if let Ok(output) = git(&worktree, &["diff", "--cached", "--quiet"]).await
        && !output.status.success()
    {
        git_ok(
            &worktree,
            &["commit", "-m", "WIP: Auto-commit before merge"],
        )
        .await
        .map_err(|err| ApiError::Internal(format!("failed to commit changes: {err}")))?;
    }

    git_ok(&main_repo, &["checkout", "master"])
        .await
        .map_err(|err| ApiError::Internal(format!("failed to checkout master: {err}")))?;
    git_ok(&main_repo, &["merge", &branch, "--no-edit"])
        .await
        .map_err(|err| ApiError::Internal(format!("failed to merge: {err}")))?;

    let worktree_str = worktree.display().to_string();
    let _ = git(&main_repo, &["worktree", "remove", &worktree_str]).await;
    let _ = git(&main_repo, &["branch", "-d", &branch]).await;

    Ok(Json(json!({ "status": "merged" })))
}

/// Throws away the worktree and its branch.
pub async fn discard() -> Result<Json<serde_json::Value>, ApiError> {
    let info = current_worktree_info().await;
    if !info.is_worktree {
        return Err(ApiError::BadRequest("not in a worktree".to_string()));
    }
    let worktree = info.path.unwrap_or_default();
    let main_repo = PathBuf::from(info.main_repo.unwrap_or_default());
    let branch = info.branch.unwrap_or_default();

    let _ = git(&main_repo, &["worktree", "remove", "--force", &worktree]).await;
    let _ = git(&main_repo, &["branch", "-D", &branch]).await;

    Ok(Json(json!({ "status": "discarded" })))
}

/// Inspects the directory the server was started from. A `.git` regular
/// file (as opposed to a directory) marks a linked worktree and points back
/// at the main repository.
async fn current_worktree_info() -> WorktreeInfo {
    let Ok(cwd) = std::env::current_dir() else {
        return WorktreeInfo::default();
    };
    let Some(root) = find_git_root(&cwd.display().to_string()) else {
        return WorktreeInfo::default();
    };
    let git_path = root.join(".git");
    let Ok(meta) = std::fs::metadata(&git_path) else {
        return WorktreeInfo::default();
    };
    if meta.is_dir() {
        return WorktreeInfo::default();
    }

    let Ok(content) = std::fs::read_to_string(&git_path) else {
        return WorktreeInfo::default();
    };
    let line = content.trim();
    let Some(git_dir) = line.strip_prefix("gitdir: ") else {
        return WorktreeInfo::default();
    };

    // Format: /path/to/main/.git/worktrees/<name>; the main repo is the
    // parent of that .git directory.
    let main_repo = Path::new(git_dir)
        .ancestors()
        .find(|p| p.file_name().is_some_and(|n| n == ".git"))
        .and_then(|p| p.parent())
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "/".to_string());

    let branch = git_ok(&cwd, &["branch", "--show-current"])
        .await
        .map(|out| out.trim().to_string())
        .unwrap_or_default();

    WorktreeInfo {
        is_worktree: true,
        branch: Some(branch),
        main_repo: Some(main_repo),
        path: Some(root.display().to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_git_root_walks_upwards() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b/c");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();

        let root = find_git_root(&nested.display().to_string()).unwrap();
        assert_eq!(root, dir.path());
    }

    #[test]
    fn find_git_root_gives_up_outside_repositories() {
        let dir = tempfile::tempdir().unwrap();
        // No .git anywhere under the temp root; the walk must terminate.
        let found = find_git_root(&dir.path().join("x").display().to_string());
        if let Some(root) = &found {
            assert!(!root.starts_with(dir.path()));
        }
    }
}
