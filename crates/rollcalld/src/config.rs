use rollcall_core::{CosineMatcher, EuclideanMatcher, FaceMatcher, IndexPolicy, OnnxFaceEncoder};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value {value:?} for {key}")]
    Invalid { key: &'static str, value: String },
}

/// Distance measure for the pairwise match decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMetric {
    Cosine,
    Euclidean,
}

/// Daemon configuration: defaults, then an optional TOML file named by
/// `ROLLCALL_CONFIG`, then `ROLLCALL_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Listen address (default: 127.0.0.1:5000).
    pub bind: SocketAddr,
    /// Directory of known-face images; uploads land here too.
    pub faces_dir: PathBuf,
    /// Attendance ledger CSV.
    pub ledger_path: PathBuf,
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    pub match_metric: MatchMetric,
    /// Minimum cosine similarity, or maximum Euclidean distance.
    pub match_threshold: f32,
    pub index_policy: IndexPolicy,
    /// Largest accepted request body, in bytes.
    pub max_upload_bytes: usize,
}

/// Every field optional, as read from the TOML file.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    bind: Option<String>,
    faces_dir: Option<PathBuf>,
    ledger_path: Option<PathBuf>,
    model_dir: Option<PathBuf>,
    match_metric: Option<MatchMetric>,
    match_threshold: Option<f32>,
    index_policy: Option<String>,
    max_upload_bytes: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 5000)),
            faces_dir: PathBuf::from("DownloadedImages"),
            ledger_path: PathBuf::from("Attendance.csv"),
            model_dir: rollcall_core::default_model_dir(),
            match_metric: MatchMetric::Cosine,
            match_threshold: CosineMatcher::DEFAULT_THRESHOLD,
            index_policy: IndexPolicy::Rebuild,
            max_upload_bytes: 10 * 1024 * 1024,
        }
    }
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration using `lookup` in place of the environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        let file = match lookup("ROLLCALL_CONFIG") {
            Some(path) => FileConfig::load(PathBuf::from(path))?,
            None => FileConfig::default(),
        };

        let metric_from_env = lookup("ROLLCALL_MATCH_METRIC");
        let metric = match &metric_from_env {
            Some(v) => Some(parse_metric(v)?),
            None => file.match_metric,
        };
        if let Some(metric) = metric {
            config.match_metric = metric;
            if metric == MatchMetric::Euclidean {
                config.match_threshold = EuclideanMatcher::DEFAULT_TOLERANCE;
            }
        }

        let pick = |key: &str, from_file: Option<String>| lookup(key).or(from_file);

        if let Some(v) = pick("ROLLCALL_BIND", file.bind) {
            config.bind = parse("ROLLCALL_BIND", &v)?;
        }
        if let Some(v) = pick("ROLLCALL_FACES_DIR", path_string(file.faces_dir)) {
            config.faces_dir = PathBuf::from(v);
        }
        if let Some(v) = pick("ROLLCALL_LEDGER_PATH", path_string(file.ledger_path)) {
            config.ledger_path = PathBuf::from(v);
        }
        if let Some(v) = pick("ROLLCALL_MODEL_DIR", path_string(file.model_dir)) {
            config.model_dir = PathBuf::from(v);
        }
        if let Some(v) = pick("ROLLCALL_MATCH_THRESHOLD", file.match_threshold.map(|t| t.to_string())) {
            config.match_threshold = parse("ROLLCALL_MATCH_THRESHOLD", &v)?;
        }
        if let Some(v) = pick("ROLLCALL_INDEX_POLICY", file.index_policy) {
            config.index_policy = parse("ROLLCALL_INDEX_POLICY", &v)?;
        }
        if let Some(v) = pick("ROLLCALL_MAX_UPLOAD_BYTES", file.max_upload_bytes.map(|b| b.to_string())) {
            config.max_upload_bytes = parse("ROLLCALL_MAX_UPLOAD_BYTES", &v)?;
        }

        Ok(config)
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_dir
            .join(OnnxFaceEncoder::SCRFD_MODEL_FILE)
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> String {
        self.model_dir
            .join(OnnxFaceEncoder::ARCFACE_MODEL_FILE)
            .to_string_lossy()
            .into_owned()
    }

    pub fn face_matcher(&self) -> FaceMatcher {
        match self.match_metric {
            MatchMetric::Cosine => FaceMatcher::new(CosineMatcher {
                min_similarity: self.match_threshold,
            }),
            MatchMetric::Euclidean => FaceMatcher::new(EuclideanMatcher {
                max_distance: self.match_threshold,
            }),
        }
    }
}

impl FileConfig {
    fn load(path: PathBuf) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse { path, source })
    }
}

fn path_string(path: Option<PathBuf>) -> Option<String> {
    path.map(|p| p.to_string_lossy().into_owned())
}

fn parse<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        key,
        value: value.to_string(),
    })
}

fn parse_metric(value: &str) -> Result<MatchMetric, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "cosine" => Ok(MatchMetric::Cosine),
        "euclidean" => Ok(MatchMetric::Euclidean),
        _ => Err(ConfigError::Invalid {
            key: "ROLLCALL_MATCH_METRIC",
            value: value.to_string(),
        }),
    }
}
