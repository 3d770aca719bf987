use crate::{
    cancel::{Cancellation, Deadline},
    event::RepositoryTarget,
};
use git2::{
    build::{CheckoutBuilder, CloneLocal, RepoBuilder},
    Repository,
};
use log::{debug, info};
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use thiserror::Error;

mod checkout;
mod credentials;
mod remote;

use checkout::check_out;
use remote::{
    fetch, fetch_options, interrupted, mirror_refspecs, point_mirror_origin,
    reference_outside_branches, ORIGIN,
};

/// A custom error describing the error cases of preparing a working tree.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// The event doesn't name a usable repository.
    #[error("bad event payload: {0}")]
    BadPayload(String),
    /// The cache entry cannot be created or opened.
    #[error("cannot open cache at {0}: {1}")]
    CacheUnavailable(String, String),
    /// The remote cannot be fetched. This can be a network failure, authentication error or many other things.
    #[error("cannot fetch ({0})")]
    RemoteFetchFailed(String),
    /// The cache cannot be cloned into the working directory.
    #[error("cannot clone into {0} ({1})")]
    CloneFailed(String, String),
    /// The commit of the event is not reachable from the fetched refs.
    #[error("commit {0} is unknown")]
    UnknownCommit(String),
    /// The default branch doesn't exist on the remote or cannot be checked out.
    #[error("cannot resolve branch {0} ({1})")]
    BranchResolutionFailed(String, String),
    /// The working tree cannot be reset to the commit.
    #[error("cannot check out ({0})")]
    CheckoutFailed(String),
    /// Fetching or cloning took longer than allowed.
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
    /// Fetching or cloning was cancelled.
    #[error("cancelled")]
    Cancelled,
}

/// A checked out copy of a repository at the commit of an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Worktree {
    pub path: PathBuf,
    pub commit: String,
    /// The checked out branch, if the commit was resolved from the default branch.
    pub branch: Option<String>,
}

/// Persistent bare mirrors of every repository we have seen, one per full name.
///
/// Operations on one repository's mirror are linearizable: everything from
/// opening the mirror until the working tree is cloned from it runs under a lock
/// keyed by the full name. Different repositories don't block each other.
pub struct RepositoryCache {
    root: PathBuf,
    fetch_timeout: Duration,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl RepositoryCache {
    pub fn new(root: PathBuf, fetch_timeout: Duration) -> Self {
        RepositoryCache {
            root,
            fetch_timeout,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// The location of the bare mirror, `<root>/<owner>/<name>.git`.
    pub fn mirror_path(&self, full_name: &str) -> PathBuf {
        self.root.join(format!("{full_name}.git"))
    }

    fn lock_for(&self, full_name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(full_name.to_string()).or_default().clone()
    }

    /// Update the mirror from the event's clone URL and check out a working tree
    /// in `working_dir` at the event's commit.
    ///
    /// `working_dir` has to be missing or empty, and is owned by the caller.
    pub fn prepare_worktree(
        &self,
        target: &RepositoryTarget,
        working_dir: &Path,
        cancellation: &Cancellation,
    ) -> Result<Worktree, RepositoryError> {
        if target.full_name.is_empty() || target.clone_url.is_empty() {
            return Err(RepositoryError::BadPayload(
                "missing repository name or clone URL".to_string(),
            ));
        }
        let lock = self.lock_for(&target.full_name);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        debug!("Acquired cache lock for {}.", target.full_name);
        let deadline = Deadline::after(self.fetch_timeout);
        if let Some(err) = interrupted(deadline, cancellation) {
            return Err(err);
        }

        let mirror_path = self.mirror_path(&target.full_name);
        let mirror = open_mirror(&mirror_path)?;
        update_mirror(&mirror, target, deadline, cancellation)?;
        if let Some(err) = interrupted(deadline, cancellation) {
            return Err(err);
        }

        let mirror_url = mirror_path.to_str().ok_or_else(|| {
            RepositoryError::CacheUnavailable(
                mirror_path.to_string_lossy().to_string(),
                "path is not valid UTF-8".to_string(),
            )
        })?;
        let working = clone_without_checkout(
            mirror_url,
            working_dir,
            CloneLocal::None,
            deadline,
            cancellation,
        )?;
        fetch_outside_branches(&working, target, deadline, cancellation)?;

        check_out(&working, working_dir, target)
    }
}

/// Limit how long libgit2 waits for a remote to connect and to answer.
///
/// The deadline of a fetch is only checked while data arrives, so a remote that
/// stops responding would hold the cache lock forever without these.
pub fn set_network_timeouts(timeout: Duration) -> Result<(), git2::Error> {
    let millis = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
    debug!("Setting the git network timeouts to {timeout:?}.");
    // SAFETY: called once at startup, before any other thread uses libgit2.
    unsafe {
        git2::opts::set_server_connect_timeout_in_milliseconds(millis)?;
        git2::opts::set_server_timeout_in_milliseconds(millis)?;
    }

    Ok(())
}

fn open_mirror(path: &Path) -> Result<Repository, RepositoryError> {
    let unavailable =
        |reason: String| RepositoryError::CacheUnavailable(path.to_string_lossy().to_string(), reason);

    if path.exists() {
        Repository::open_bare(path).map_err(|err| unavailable(err.message().to_string()))
    } else {
        info!("Creating cache at {}.", path.to_string_lossy());
        fs::create_dir_all(path).map_err(|err| unavailable(err.to_string()))?;
        Repository::init_bare(path).map_err(|err| unavailable(err.message().to_string()))
    }
}

fn update_mirror(
    mirror: &Repository,
    target: &RepositoryTarget,
    deadline: Deadline,
    cancellation: &Cancellation,
) -> Result<(), RepositoryError> {
    let unavailable = |err: git2::Error| {
        RepositoryError::CacheUnavailable(target.full_name.clone(), err.message().to_string())
    };

    point_mirror_origin(mirror, &target.clone_url).map_err(unavailable)?;
    mirror
        .set_head(&format!("refs/heads/{}", target.default_branch))
        .map_err(unavailable)?;

    let refspecs = mirror_refspecs(target.reference.as_deref(), target.commit.is_none());
    debug!(
        "Fetching {} from {} ({}).",
        target.full_name,
        target.clone_url,
        if refspecs.is_empty() {
            "all refs".to_string()
        } else {
            refspecs.join(", ")
        }
    );

    let mut origin = mirror.find_remote(ORIGIN).map_err(unavailable)?;
    fetch(&mut origin, &refspecs, deadline, cancellation)
}

fn clone_without_checkout(
    url: &str,
    working_dir: &Path,
    local: CloneLocal,
    deadline: Deadline,
    cancellation: &Cancellation,
) -> Result<Repository, RepositoryError> {
    let mut checkout = CheckoutBuilder::new();
    checkout.dry_run();

    RepoBuilder::new()
        .clone_local(local)
        .with_checkout(checkout)
        .fetch_options(fetch_options(deadline, cancellation))
        .clone(url, working_dir)
        .map_err(|err| {
            interrupted(deadline, cancellation).unwrap_or_else(|| {
                RepositoryError::CloneFailed(
                    working_dir.to_string_lossy().to_string(),
                    err.message().to_string(),
                )
            })
        })
}

/// Clone straight from the event's clone URL without a cache and check out the
/// event's commit, the same way [RepositoryCache::prepare_worktree] does.
pub fn clone_direct(
    target: &RepositoryTarget,
    working_dir: &Path,
    fetch_timeout: Duration,
    cancellation: &Cancellation,
) -> Result<Worktree, RepositoryError> {
    if target.clone_url.is_empty() {
        return Err(RepositoryError::BadPayload("missing clone URL".to_string()));
    }
    let deadline = Deadline::after(fetch_timeout);

    info!("Cloning {} into {}.", target.clone_url, working_dir.to_string_lossy());
    let working = clone_without_checkout(
        &target.clone_url,
        working_dir,
        CloneLocal::Auto,
        deadline,
        cancellation,
    )?;

    fetch_outside_branches(&working, target, deadline, cancellation)?;

    check_out(&working, working_dir, target)
}

/// The pushed ref may not be a branch or a tag (e.g. a pull request), fetch it explicitly.
fn fetch_outside_branches(
    working: &Repository,
    target: &RepositoryTarget,
    deadline: Deadline,
    cancellation: &Cancellation,
) -> Result<(), RepositoryError> {
    let Some(reference) = reference_outside_branches(target.reference.as_deref()) else {
        return Ok(());
    };

    debug!("Fetching {reference} into the working tree.");
    let mut origin = working
        .find_remote(ORIGIN)
        .map_err(|err| RepositoryError::RemoteFetchFailed(err.message().to_string()))?;
    fetch(&mut origin, &[format!("+{reference}:{reference}")], deadline, cancellation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use duct::cmd;
    use std::{error::Error, thread};
    use tempfile::TempDir;

    fn git_commit(directory: &Path, file: &str, contents: &str) -> Result<String, Box<dyn Error>> {
        fs::write(directory.join(file), contents)?;
        cmd!("git", "add", "-A").dir(directory).read()?;
        cmd!(
            "git",
            "-c",
            "user.name=gwh",
            "-c",
            "user.email=gwh@example.com",
            "commit",
            "-m",
            file
        )
        .dir(directory)
        .read()?;
        let sha = cmd!("git", "rev-parse", "HEAD").dir(directory).read()?;

        Ok(sha)
    }

    struct Remote {
        _root: TempDir,
        url: String,
        local: PathBuf,
    }

    /// A bare remote with one commit on master, and a clone to push more from.
    fn create_remote() -> Result<Remote, Box<dyn Error>> {
        let root = tempfile::tempdir()?;
        let remote = root.path().join("remote.git");
        let local = root.path().join("local");

        cmd!("git", "init", "--bare", &remote).read()?;
        cmd!("git", "init", &local).read()?;
        git_commit(&local, "1", "1")?;
        cmd!("git", "push", &remote, "HEAD:refs/heads/master")
            .dir(&local)
            .read()?;
        cmd!("git", "symbolic-ref", "HEAD", "refs/heads/master")
            .dir(&remote)
            .read()?;

        Ok(Remote {
            url: remote.to_string_lossy().to_string(),
            local,
            _root: root,
        })
    }

    fn push(remote: &Remote, file: &str, contents: &str) -> Result<String, Box<dyn Error>> {
        let sha = git_commit(&remote.local, file, contents)?;
        cmd!("git", "push", &remote.url, "HEAD:refs/heads/master")
            .dir(&remote.local)
            .read()?;

        Ok(sha)
    }

    fn target(remote: &Remote, commit: Option<String>) -> RepositoryTarget {
        RepositoryTarget {
            full_name: "org/x".to_string(),
            clone_url: remote.url.clone(),
            default_branch: "master".to_string(),
            reference: Some("refs/heads/master".to_string()),
            commit,
        }
    }

    fn cache(root: &TempDir) -> RepositoryCache {
        RepositoryCache::new(root.path().join("cache"), Duration::from_secs(60))
    }

    #[test]
    fn it_should_check_out_the_exact_commit() -> Result<(), Box<dyn Error>> {
        let remote = create_remote()?;
        let first = cmd!("git", "rev-parse", "HEAD").dir(&remote.local).read()?;
        push(&remote, "2", "2")?;

        let root = tempfile::tempdir()?;
        let working_dir = root.path().join("repo");
        let worktree = cache(&root).prepare_worktree(
            &target(&remote, Some(first.clone())),
            &working_dir,
            &Cancellation::new(),
        )?;

        assert_eq!(first, worktree.commit);
        assert_eq!(None, worktree.branch);
        assert!(working_dir.join("1").exists());
        assert!(!working_dir.join("2").exists());
        let head = cmd!("git", "rev-parse", "HEAD").dir(&working_dir).read()?;
        assert_eq!(first, head);
        let status = cmd!("git", "status", "--porcelain").dir(&working_dir).read()?;
        assert_eq!("", status);

        Ok(())
    }

    #[test]
    fn it_should_create_the_mirror_in_the_cache() -> Result<(), Box<dyn Error>> {
        let remote = create_remote()?;
        let sha = push(&remote, "2", "2")?;

        let root = tempfile::tempdir()?;
        let cache = cache(&root);
        cache.prepare_worktree(
            &target(&remote, Some(sha.clone())),
            &root.path().join("repo"),
            &Cancellation::new(),
        )?;

        let mirror_path = root.path().join("cache/org/x.git");
        assert_eq!(mirror_path, cache.mirror_path("org/x"));
        let mirrored = cmd!("git", "rev-parse", "refs/heads/master")
            .dir(&mirror_path)
            .read()?;
        assert_eq!(sha, mirrored);

        Ok(())
    }

    #[test]
    fn it_should_check_out_the_default_branch_without_commit() -> Result<(), Box<dyn Error>> {
        let remote = create_remote()?;
        let sha = push(&remote, "2", "2")?;

        let root = tempfile::tempdir()?;
        let working_dir = root.path().join("repo");
        let worktree =
            cache(&root).prepare_worktree(&target(&remote, None), &working_dir, &Cancellation::new())?;

        assert_eq!(sha, worktree.commit);
        assert_eq!(Some("master".to_string()), worktree.branch);
        assert!(working_dir.join("2").exists());
        let branch = cmd!("git", "rev-parse", "--abbrev-ref", "HEAD")
            .dir(&working_dir)
            .read()?;
        assert_eq!("master", branch);
        let upstream = cmd!("git", "rev-parse", "--abbrev-ref", "master@{upstream}")
            .dir(&working_dir)
            .read()?;
        assert_eq!("origin/master", upstream);

        Ok(())
    }

    #[test]
    fn it_should_point_origin_at_the_clone_url() -> Result<(), Box<dyn Error>> {
        let remote = create_remote()?;

        let root = tempfile::tempdir()?;
        let working_dir = root.path().join("repo");
        cache(&root).prepare_worktree(&target(&remote, None), &working_dir, &Cancellation::new())?;

        let origin = cmd!("git", "remote", "get-url", "origin")
            .dir(&working_dir)
            .read()?;
        assert_eq!(remote.url, origin);

        Ok(())
    }

    #[test]
    fn it_should_follow_a_moved_remote() -> Result<(), Box<dyn Error>> {
        let old_remote = create_remote()?;
        let new_remote = create_remote()?;
        let sha = push(&new_remote, "moved", "moved")?;

        let root = tempfile::tempdir()?;
        let cache = cache(&root);
        cache.prepare_worktree(
            &target(&old_remote, None),
            &root.path().join("first"),
            &Cancellation::new(),
        )?;
        let worktree = cache.prepare_worktree(
            &target(&new_remote, Some(sha.clone())),
            &root.path().join("second"),
            &Cancellation::new(),
        )?;

        assert_eq!(sha, worktree.commit);
        let mirror_origin = cmd!("git", "remote", "get-url", "origin")
            .dir(cache.mirror_path("org/x"))
            .read()?;
        assert_eq!(new_remote.url, mirror_origin);

        Ok(())
    }

    #[test]
    fn it_should_check_out_a_commit_outside_of_branches() -> Result<(), Box<dyn Error>> {
        let remote = create_remote()?;
        cmd!("git", "checkout", "-b", "pull-request").dir(&remote.local).read()?;
        let sha = git_commit(&remote.local, "pr", "pr")?;
        cmd!("git", "push", &remote.url, "HEAD:refs/pull/1/head")
            .dir(&remote.local)
            .read()?;

        let root = tempfile::tempdir()?;
        let working_dir = root.path().join("repo");
        let mut target = target(&remote, Some(sha.clone()));
        target.reference = Some("refs/pull/1/head".to_string());
        let worktree = cache(&root).prepare_worktree(&target, &working_dir, &Cancellation::new())?;

        assert_eq!(sha, worktree.commit);
        assert!(working_dir.join("pr").exists());
        let head = cmd!("git", "rev-parse", "HEAD").dir(&working_dir).read()?;
        assert_eq!(sha, head);

        Ok(())
    }

    #[test]
    fn it_should_start_the_fetch_timeout_after_acquiring_the_lock() -> Result<(), Box<dyn Error>> {
        let remote = create_remote()?;
        let sha = push(&remote, "2", "2")?;

        let root = tempfile::tempdir()?;
        let cache = Arc::new(RepositoryCache::new(
            root.path().join("cache"),
            Duration::from_secs(1),
        ));
        let lock = cache.lock_for("org/x");
        let guard = lock.lock().map_err(|_| "lock poisoned")?;

        let handle = {
            let cache = Arc::clone(&cache);
            let target = target(&remote, Some(sha.clone()));
            let working_dir = root.path().join("repo");
            thread::spawn(move || cache.prepare_worktree(&target, &working_dir, &Cancellation::new()))
        };
        thread::sleep(Duration::from_millis(1500));
        drop(guard);

        let worktree = handle.join().map_err(|_| "thread panicked")??;
        assert_eq!(sha, worktree.commit);

        Ok(())
    }

    #[test]
    fn it_should_set_the_network_timeouts() -> Result<(), Box<dyn Error>> {
        set_network_timeouts(Duration::MAX)?;
        set_network_timeouts(Duration::from_secs(600))?;

        Ok(())
    }

    #[test]
    fn it_should_fail_on_an_unknown_commit() -> Result<(), Box<dyn Error>> {
        let remote = create_remote()?;

        let root = tempfile::tempdir()?;
        let working_dir = root.path().join("repo");
        let result = cache(&root).prepare_worktree(
            &target(&remote, Some("0123456789abcdef0123456789abcdef01234567".to_string())),
            &working_dir,
            &Cancellation::new(),
        );

        assert!(
            matches!(result, Err(RepositoryError::UnknownCommit(_))),
            "{result:?} should be UnknownCommit"
        );
        assert!(!working_dir.join("1").exists());

        Ok(())
    }

    #[test]
    fn it_should_fail_on_a_missing_default_branch() -> Result<(), Box<dyn Error>> {
        let remote = create_remote()?;

        let root = tempfile::tempdir()?;
        let mut target = target(&remote, None);
        target.reference = None;
        target.default_branch = "trunk".to_string();
        let result =
            cache(&root).prepare_worktree(&target, &root.path().join("repo"), &Cancellation::new());

        assert!(
            matches!(result, Err(RepositoryError::BranchResolutionFailed(_, _))),
            "{result:?} should be BranchResolutionFailed"
        );

        Ok(())
    }

    #[test]
    fn it_should_fail_if_the_remote_is_unreachable() -> Result<(), Box<dyn Error>> {
        let root = tempfile::tempdir()?;
        let target = RepositoryTarget {
            full_name: "org/x".to_string(),
            clone_url: root.path().join("nowhere.git").to_string_lossy().to_string(),
            default_branch: "master".to_string(),
            reference: None,
            commit: None,
        };

        let result =
            cache(&root).prepare_worktree(&target, &root.path().join("repo"), &Cancellation::new());
        assert!(
            matches!(result, Err(RepositoryError::RemoteFetchFailed(_))),
            "{result:?} should be RemoteFetchFailed"
        );

        Ok(())
    }

    #[test]
    fn it_should_stop_when_cancelled() -> Result<(), Box<dyn Error>> {
        let remote = create_remote()?;
        let cancellation = Cancellation::new();
        cancellation.cancel();

        let root = tempfile::tempdir()?;
        let result = cache(&root).prepare_worktree(
            &target(&remote, None),
            &root.path().join("repo"),
            &cancellation,
        );

        assert!(
            matches!(result, Err(RepositoryError::Cancelled)),
            "{result:?} should be Cancelled"
        );

        Ok(())
    }

    #[test]
    fn it_should_serialize_concurrent_requests_for_one_repository() -> Result<(), Box<dyn Error>> {
        let remote = create_remote()?;
        let sha = push(&remote, "2", "2")?;

        let root = tempfile::tempdir()?;
        let cache = Arc::new(cache(&root));
        let handles: Vec<_> = (0..4)
            .map(|index| {
                let cache = Arc::clone(&cache);
                let target = target(&remote, Some(sha.clone()));
                let working_dir = root.path().join(format!("repo-{index}"));
                thread::spawn(move || {
                    cache.prepare_worktree(&target, &working_dir, &Cancellation::new())
                })
            })
            .collect();

        for handle in handles {
            let worktree = handle.join().map_err(|_| "thread panicked")??;
            assert_eq!(sha, worktree.commit);
            assert!(worktree.path.join("2").exists());
        }

        Ok(())
    }

    #[test]
    fn it_should_clone_directly_without_a_cache() -> Result<(), Box<dyn Error>> {
        let remote = create_remote()?;
        let sha = push(&remote, "2", "2")?;

        let root = tempfile::tempdir()?;
        let working_dir = root.path().join("repo");
        let worktree = clone_direct(
            &target(&remote, None),
            &working_dir,
            Duration::from_secs(60),
            &Cancellation::new(),
        )?;

        assert_eq!(sha, worktree.commit);
        assert!(working_dir.join("2").exists());

        Ok(())
    }
}
