//! Model API key storage
//!
//! The key lives in the OS keyring, with a 0600 file next to the config as a
//! fallback for machines without a keyring. `OPENAI_API_KEY` is used when
//! neither holds a key.

use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;
use tracing::debug;

const SERVICE_NAME: &str = "talkbridge";
const API_KEY_USERNAME: &str = "realtime-api-key";
const API_KEY_FILE: &str = "api_key.txt";
pub const API_KEY_ENV: &str = "OPENAI_API_KEY";

fn api_key_file_path() -> Result<PathBuf> {
    let base = directories::ProjectDirs::from("com", "talkbridge", "talkbridge")
        .context("Failed to get project directories")?;
    let dir = base.config_dir();
    fs::create_dir_all(dir).context("Failed to create config directory")?;
    Ok(dir.join(API_KEY_FILE))
}

/// Store the API key, in the keyring when possible
pub fn set_api_key(key: &str) -> Result<()> {
    if let Ok(entry) = keyring::Entry::new(SERVICE_NAME, API_KEY_USERNAME) {
        if entry.set_password(key).is_ok() {
            // Keep a file copy in case keyring reads fail later
            let _ = write_key_file(&api_key_file_path()?, key);
            return Ok(());
        }
    }

    write_key_file(&api_key_file_path()?, key)?;
    println!("Note: Using file-based storage (keyring unavailable)");
    Ok(())
}

fn write_key_file(path: &std::path::Path, key: &str) -> Result<()> {
    fs::write(path, key).context("Failed to write API key file")?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .context("Failed to set file permissions")?;
    }

    Ok(())
}

fn read_key_file(path: &std::path::Path) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
}

/// Look the API key up: keyring, then file, then environment
pub fn get_api_key() -> Option<String> {
    if let Ok(entry) = keyring::Entry::new(SERVICE_NAME, API_KEY_USERNAME) {
        if let Ok(key) = entry.get_password() {
            return Some(key);
        }
    }

    if let Some(key) = api_key_file_path().ok().and_then(|p| read_key_file(&p)) {
        debug!("API key loaded from file");
        return Some(key);
    }

    std::env::var(API_KEY_ENV).ok().filter(|k| !k.trim().is_empty())
}

pub fn has_api_key() -> bool {
    get_api_key().is_some()
}

/// Remove the key from both the keyring and the file
pub fn delete_api_key() -> Result<()> {
    if let Ok(entry) = keyring::Entry::new(SERVICE_NAME, API_KEY_USERNAME) {
        let _ = entry.delete_credential();
    }

    let path = api_key_file_path()?;
    if path.exists() {
        fs::remove_file(&path).context("Failed to delete API key file")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_file_roundtrip_trims_and_restricts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(API_KEY_FILE);
        write_key_file(&path, "sk-test\n").unwrap();
        assert_eq!(read_key_file(&path).as_deref(), Some("sk-test"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_empty_key_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(API_KEY_FILE);
        fs::write(&path, "  \n").unwrap();
        assert!(read_key_file(&path).is_none());
    }
}
