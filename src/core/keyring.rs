//! API tokens in the OS keychain, one entry per viewer and API host.

use thiserror::Error;

const SERVICE: &str = "turnover-chat";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyringError {
    /// Nothing stored for this viewer yet. Not a failure of the keychain.
    #[error("no token stored for {0}")]
    NotFound(String),
    #[error("keychain unavailable: {0}")]
    Backend(String),
}

fn key_id(viewer_id: &str, api_host: &str) -> String {
    format!("{viewer_id}@{api_host}")
}

fn classify(key: &str, e: keyring::Error) -> KeyringError {
    match e {
        keyring::Error::NoEntry => KeyringError::NotFound(key.to_string()),
        other => KeyringError::Backend(other.to_string()),
    }
}

fn entry(key: &str) -> Result<keyring::Entry, KeyringError> {
    keyring::Entry::new(SERVICE, key).map_err(|e| {
        log::error!("keyring Entry::new failed for key={key:?}: {e}");
        classify(key, e)
    })
}

/// Fetch the API token stored for a viewer on one API host.
pub fn get_token(viewer_id: &str, api_host: &str) -> Result<String, KeyringError> {
    let key = key_id(viewer_id, api_host);
    log::debug!("keyring GET: service={SERVICE:?} key={key:?}");
    entry(&key)?.get_password().map_err(|e| {
        log::warn!("keyring get_password failed for key={key:?}: {e}");
        classify(&key, e)
    })
}

pub fn set_token(viewer_id: &str, api_host: &str, token: &str) -> Result<(), KeyringError> {
    let key = key_id(viewer_id, api_host);
    log::debug!("keyring SET: service={SERVICE:?} key={key:?}");
    entry(&key)?.set_password(token).map_err(|e| {
        log::error!("keyring set_password failed for key={key:?}: {e}");
        classify(&key, e)
    })
}

/// Forget a viewer's token. Deleting a token that was never stored succeeds.
pub fn delete_token(viewer_id: &str, api_host: &str) -> Result<(), KeyringError> {
    let key = key_id(viewer_id, api_host);
    log::debug!("keyring DELETE: service={SERVICE:?} key={key:?}");
    match entry(&key)?.delete_credential() {
        Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => {
            log::error!("keyring delete_credential failed for key={key:?}: {e}");
            Err(classify(&key, e))
        }
    }
}
