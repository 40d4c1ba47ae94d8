//! Google Cloud service-account key validation and installation.

use serde::Deserialize;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Fields every service-account key file must carry.
pub const REQUIRED_FIELDS: [&str; 5] = [
    "type",
    "project_id",
    "private_key_id",
    "private_key",
    "client_email",
];

pub const SERVICE_ACCOUNT_TYPE: &str = "service_account";

#[derive(Error, Debug)]
pub enum KeyError {
    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("key JSON must be an object")]
    NotAnObject,
    #[error("missing required fields: {}", .0.join(", "))]
    MissingFields(Vec<String>),
    #[error("invalid key type {0:?}, expected \"service_account\"")]
    WrongType(String),
    #[error("key file already exists: {0}")]
    AlreadyExists(PathBuf),
    #[error("key file not found: {0}")]
    NotFound(PathBuf),
    #[error("I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// The parts of a service-account key this crate looks at.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    #[serde(rename = "type")]
    pub key_type: String,
    pub project_id: String,
    pub private_key_id: String,
    pub private_key: String,
    pub client_email: String,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub token_uri: Option<String>,
}

impl ServiceAccountKey {
    /// Validate and parse key JSON, reporting every missing field at once.
    pub fn parse(json: &str) -> Result<Self, KeyError> {
        let value: Value = serde_json::from_str(json)?;
        let object = value.as_object().ok_or(KeyError::NotAnObject)?;

        let missing: Vec<String> = REQUIRED_FIELDS
            .iter()
            .filter(|f| !object.contains_key(**f))
            .map(|f| f.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(KeyError::MissingFields(missing));
        }

        let key_type = object.get("type").and_then(Value::as_str).unwrap_or_default();
        if key_type != SERVICE_ACCOUNT_TYPE {
            return Err(KeyError::WrongType(key_type.to_string()));
        }

        Ok(serde_json::from_value(value)?)
    }
}

/// Validate `json` and write it to `dest`.
///
/// An existing file is kept unless `overwrite` is set.
pub fn install_key(json: &str, dest: &Path, overwrite: bool) -> Result<ServiceAccountKey, KeyError> {
    let key = ServiceAccountKey::parse(json)?;

    if dest.exists() && !overwrite {
        return Err(KeyError::AlreadyExists(dest.to_path_buf()));
    }
    let io_error = |source: std::io::Error| KeyError::Io {
        path: dest.to_path_buf(),
        source,
    };
    if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_error)?;
    }
    write_private(dest, json.as_bytes()).map_err(io_error)?;

    tracing::info!(path = %dest.display(), client_email = %key.client_email, "service-account key installed");
    Ok(key)
}

/// Owner-only from creation; an existing file is tightened before it is truncated.
#[cfg(unix)]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    if path.exists() {
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents)?;
    file.sync_all()
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    fs::write(path, contents)
}

/// Load and validate an installed key.
pub fn verify_key(path: &Path) -> Result<ServiceAccountKey, KeyError> {
    let json = match fs::read_to_string(path) {
        Ok(json) => json,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(KeyError::NotFound(path.to_path_buf()))
        }
        Err(source) => {
            return Err(KeyError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    ServiceAccountKey::parse(&json)
}

/// Shell snippets exporting `GOOGLE_APPLICATION_CREDENTIALS` for `path`.
pub fn env_hint(path: &Path) -> String {
    let path = path.display();
    format!(
        "Linux/macOS:  export GOOGLE_APPLICATION_CREDENTIALS=\"{path}\"\n\
         Windows cmd:  set GOOGLE_APPLICATION_CREDENTIALS={path}\n\
         PowerShell:   $env:GOOGLE_APPLICATION_CREDENTIALS=\"{path}\"\n"
    )
}
