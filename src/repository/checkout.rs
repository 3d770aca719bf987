use super::{
    remote::{replace_origin, ORIGIN},
    RepositoryError, Worktree,
};
use crate::event::RepositoryTarget;
use git2::{build::CheckoutBuilder, BranchType, Commit, Oid, Repository, ResetType};
use log::debug;
use std::path::Path;

/// Move a freshly cloned repository to the commit of the event.
///
/// With a commit, HEAD is detached on it. Without, the default branch is created
/// or moved to the tip of `origin/<default branch>` and checked out. Afterwards
/// `origin` is rewired to the event's clone URL and the index and the files are
/// hard reset, so the working tree is exactly the commit.
pub fn check_out(
    repo: &Repository,
    path: &Path,
    target: &RepositoryTarget,
) -> Result<Worktree, RepositoryError> {
    let (commit, branch) = match &target.commit {
        Some(sha) => (detach_on_commit(repo, sha)?, None),
        None => (
            move_default_branch(repo, &target.default_branch)?,
            Some(target.default_branch.clone()),
        ),
    };
    let commit_id = commit.id();

    replace_origin(repo, &target.clone_url)
        .map_err(|err| RepositoryError::CheckoutFailed(err.message().to_string()))?;
    if let Some(branch) = &branch {
        track_origin(repo, branch, commit_id)?;
    }

    repo.reset(
        commit.as_object(),
        ResetType::Hard,
        Some(CheckoutBuilder::new().force()),
    )
    .map_err(|err| RepositoryError::CheckoutFailed(err.message().to_string()))?;

    debug!(
        "Checked out {} of {} in {}.",
        branch.as_deref().unwrap_or(&commit_id.to_string()),
        target.full_name,
        path.to_string_lossy()
    );

    Ok(Worktree {
        path: path.to_path_buf(),
        commit: commit_id.to_string(),
        branch,
    })
}

fn detach_on_commit<'r>(repo: &'r Repository, sha: &str) -> Result<Commit<'r>, RepositoryError> {
    let unknown = || RepositoryError::UnknownCommit(sha.to_string());
    let oid = Oid::from_str(sha).map_err(|_| unknown())?;
    let commit = repo.find_commit(oid).map_err(|_| unknown())?;

    repo.set_head_detached(oid)
        .map_err(|err| RepositoryError::CheckoutFailed(err.message().to_string()))?;

    Ok(commit)
}

fn move_default_branch<'r>(
    repo: &'r Repository,
    branch: &str,
) -> Result<Commit<'r>, RepositoryError> {
    let failed = |reason: &str| {
        RepositoryError::BranchResolutionFailed(branch.to_string(), reason.to_string())
    };

    let commit = repo
        .find_reference(&format!("refs/remotes/{ORIGIN}/{branch}"))
        .and_then(|reference| reference.peel_to_commit())
        .map_err(|err| failed(err.message()))?;

    match repo.find_branch(branch, BranchType::Local) {
        Ok(mut local) => {
            let message = format!("gwh: moving {branch} to {}", commit.id());
            local
                .get_mut()
                .set_target(commit.id(), &message)
                .map_err(|err| failed(err.message()))?;
        }
        Err(_) => {
            repo.branch(branch, &commit, false)
                .map_err(|err| failed(err.message()))?;
        }
    }

    repo.set_head(&format!("refs/heads/{branch}"))
        .map_err(|err| failed(err.message()))?;

    Ok(commit)
}

/// Recreate `origin/<branch>` after rewiring the remote and track it.
fn track_origin(repo: &Repository, branch: &str, commit_id: Oid) -> Result<(), RepositoryError> {
    let failed = |err: git2::Error| {
        RepositoryError::BranchResolutionFailed(branch.to_string(), err.message().to_string())
    };

    repo.reference(
        &format!("refs/remotes/{ORIGIN}/{branch}"),
        commit_id,
        true,
        "gwh: remote-tracking branch",
    )
    .map_err(failed)?;
    repo.find_branch(branch, BranchType::Local)
        .and_then(|mut local| local.set_upstream(Some(&format!("{ORIGIN}/{branch}"))))
        .map_err(failed)?;

    Ok(())
}
