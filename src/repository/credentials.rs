// The order of attempts follows cargo's git authentication:
// https://github.com/rust-lang/cargo/blob/master/src/cargo/sources/git/utils.rs

use dirs::home_dir;
use git2::{Config, Cred, CredentialType, Error};
use std::path::PathBuf;

const DEFAULT_SSH_USERNAME: &str = "git";
const SSH_KEY_NAMES: [&str; 6] = [
    "id_dsa",
    "id_ecdsa",
    "id_ecdsa_sk",
    "id_ed25519",
    "id_ed25519_sk",
    "id_rsa",
];

/// Hands out credentials to libgit2 for fetching, each kind at most once.
///
/// libgit2 calls the credential callback again after every failed attempt, so
/// we keep track of what was already tried to avoid looping forever:
///
/// - a username, if the URL didn't contain one,
/// - the ssh-agent, then every default key in `~/.ssh` without passphrase,
/// - the git credential helper for plaintext username and password,
/// - the default credentials (e.g. Negotiate on Windows).
pub struct CredentialAttempts {
    config: Option<Config>,
    username_asked: bool,
    ssh_attempts: usize,
    ssh_keys: Vec<PathBuf>,
    helper_tried: bool,
}

impl CredentialAttempts {
    pub fn new() -> Self {
        let ssh_dir = home_dir().unwrap_or(PathBuf::from("~")).join(".ssh");
        let ssh_keys = SSH_KEY_NAMES
            .iter()
            .map(|name| ssh_dir.join(name))
            .filter(|key| key.exists())
            .collect();

        CredentialAttempts {
            config: Config::open_default().ok(),
            username_asked: false,
            ssh_attempts: 0,
            ssh_keys,
            helper_tried: false,
        }
    }

    /// The next credential to try for `url`, or an error when every option is spent.
    pub fn next(
        &mut self,
        url: &str,
        username: Option<&str>,
        allowed: CredentialType,
    ) -> Result<Cred, Error> {
        if allowed.contains(CredentialType::USERNAME) {
            if self.username_asked {
                return Err(Error::from_str("no more usernames to try"));
            }
            self.username_asked = true;
            return Cred::username(DEFAULT_SSH_USERNAME);
        }

        if allowed.contains(CredentialType::SSH_KEY) {
            let username = username.unwrap_or(DEFAULT_SSH_USERNAME);
            self.ssh_attempts += 1;
            if self.ssh_attempts == 1 {
                return Cred::ssh_key_from_agent(username);
            }
            return match self.ssh_keys.get(self.ssh_attempts - 2) {
                Some(key) => Cred::ssh_key(username, None, key, None),
                None => Err(Error::from_str("no more ssh keys to try")),
            };
        }

        if allowed.contains(CredentialType::USER_PASS_PLAINTEXT) && !self.helper_tried {
            self.helper_tried = true;
            if let Some(config) = &self.config {
                return Cred::credential_helper(config, url, username);
            }
        }

        if allowed.contains(CredentialType::DEFAULT) {
            return Cred::default();
        }

        Err(Error::from_str("no valid authentication available"))
    }
}

impl Default for CredentialAttempts {
    fn default() -> Self {
        Self::new()
    }
}
