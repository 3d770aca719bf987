use super::{credentials::CredentialAttempts, RepositoryError};
use crate::cancel::{Cancellation, Deadline};
use git2::{AutotagOption, ErrorCode, FetchOptions, Remote, RemoteCallbacks, Repository};
use log::trace;

pub const ORIGIN: &str = "origin";

/// Mirrors keep the remote branches as their own local branches.
pub const MIRROR_HEADS_REFSPEC: &str = "+refs/heads/*:refs/heads/*";
pub const MIRROR_TAGS_REFSPEC: &str = "+refs/tags/*:refs/tags/*";

/// Fetch options that authenticate and abort once cancelled or past the deadline.
pub fn fetch_options(deadline: Deadline, cancellation: &Cancellation) -> FetchOptions<'static> {
    let mut callbacks = RemoteCallbacks::new();

    let mut credentials = CredentialAttempts::new();
    callbacks.credentials(move |url, username, allowed| credentials.next(url, username, allowed));

    let transfer_cancellation = cancellation.clone();
    callbacks.transfer_progress(move |progress| {
        trace!(
            "Received {}/{} objects.",
            progress.received_objects(),
            progress.total_objects()
        );
        !transfer_cancellation.is_cancelled() && !deadline.is_expired()
    });
    let sideband_cancellation = cancellation.clone();
    callbacks.sideband_progress(move |_| {
        !sideband_cancellation.is_cancelled() && !deadline.is_expired()
    });

    let mut options = FetchOptions::new();
    options.remote_callbacks(callbacks);
    options.download_tags(AutotagOption::All);
    options
}

/// The refspecs to update the mirror with for an event.
///
/// With a commit, only the pushed ref is fetched, into the same name. Without
/// one, the default branch has to be resolved, so every branch and tag is
/// fetched, plus the pushed ref if it lives outside of them. An empty list
/// means the configured refspecs of the mirror.
pub fn mirror_refspecs(reference: Option<&str>, with_all_branches: bool) -> Vec<String> {
    if with_all_branches {
        let mut refspecs = vec![];
        if let Some(reference) = reference_outside_branches(reference) {
            refspecs.push(MIRROR_HEADS_REFSPEC.to_string());
            refspecs.push(MIRROR_TAGS_REFSPEC.to_string());
            refspecs.push(format!("+{reference}:{reference}"));
        }
        refspecs
    } else {
        reference
            .map(qualify)
            .map(|reference| vec![format!("+{reference}:{reference}")])
            .unwrap_or_default()
    }
}

/// The qualified ref, if it is neither a branch nor a tag (e.g. `refs/pull/1/head`).
///
/// Clones only carry branches and tags, these refs have to be fetched on their own.
pub fn reference_outside_branches(reference: Option<&str>) -> Option<String> {
    reference
        .map(qualify)
        .filter(|reference| !reference.starts_with("refs/heads/"))
        .filter(|reference| !reference.starts_with("refs/tags/"))
}

fn qualify(reference: &str) -> String {
    if reference.starts_with("refs/") {
        reference.to_string()
    } else {
        format!("refs/heads/{reference}")
    }
}

/// Run a fetch and turn the failure into the reason it happened.
pub fn fetch(
    remote: &mut Remote,
    refspecs: &[String],
    deadline: Deadline,
    cancellation: &Cancellation,
) -> Result<(), RepositoryError> {
    let mut options = fetch_options(deadline, cancellation);

    remote
        .fetch(refspecs, Some(&mut options), None)
        .map_err(|err| interrupted(deadline, cancellation).unwrap_or_else(|| {
            RepositoryError::RemoteFetchFailed(err.message().to_string())
        }))
}

/// The error to report if a git operation was stopped by us.
pub fn interrupted(deadline: Deadline, cancellation: &Cancellation) -> Option<RepositoryError> {
    if cancellation.is_cancelled() {
        Some(RepositoryError::Cancelled)
    } else if deadline.is_expired() {
        Some(RepositoryError::TimedOut(deadline.timeout().unwrap_or_default()))
    } else {
        None
    }
}

/// Point `origin` at `url`, whatever it pointed to before.
///
/// Deleting a remote also deletes its remote-tracking branches, so this is only
/// used for working trees. Mirrors keep their refs and only swap the URL.
pub fn replace_origin(repo: &Repository, url: &str) -> Result<(), git2::Error> {
    match repo.remote_delete(ORIGIN) {
        Ok(()) => {}
        Err(err) if err.code() == ErrorCode::NotFound => {}
        Err(err) => return Err(err),
    }
    repo.remote(ORIGIN, url)?;

    Ok(())
}

/// Point the mirror's `origin` at `url`, creating it with mirror refspecs if missing.
pub fn point_mirror_origin(repo: &Repository, url: &str) -> Result<(), git2::Error> {
    match repo.find_remote(ORIGIN) {
        Ok(_) => repo.remote_set_url(ORIGIN, url),
        Err(err) if err.code() == ErrorCode::NotFound => {
            repo.remote_with_fetch(ORIGIN, url, MIRROR_HEADS_REFSPEC)?;
            repo.remote_add_fetch(ORIGIN, MIRROR_TAGS_REFSPEC)
        }
        Err(err) => Err(err),
    }
}
