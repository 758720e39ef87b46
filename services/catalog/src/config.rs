use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the catalog service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Object store configuration
    pub s3: S3Config,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Format encoder configuration
    #[serde(default)]
    pub encoder: EncoderConfig,
    /// Photo optimizer configuration
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    /// Upload limits and operation deadlines
    #[serde(default)]
    pub uploads: UploadConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// S3-compatible object store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// Disable to run without object storage (uploads answer 503)
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Bucket holding staged and canonical photos
    #[serde(default)]
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint (MinIO, R2, ...). Host-only forms default to HTTPS.
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Base URL photos are publicly served from, if not the endpoint itself
    pub public_base_url: Option<String>,
    /// Presigned PUT expiration in seconds
    #[serde(default = "default_presign_ttl_secs")]
    pub presign_ttl_secs: u64,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// Which external encoder flavour to talk to
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EncoderProvider {
    /// No encoder; alternate-format variants are skipped
    #[default]
    None,
    /// URL-shaped image gateway (`/insecure/rs:fit:...`)
    UrlTemplate,
    /// JSON encoder exposing `POST /v1/encode`
    Structured,
}

/// External format encoder configuration
#[derive(Debug, Clone, Deserialize)]
pub struct EncoderConfig {
    #[serde(default)]
    pub provider: EncoderProvider,
    /// Base URL of the encoder service
    pub base_url: Option<String>,
    /// Output quality, clamped to 1..=100
    #[serde(default = "default_encoder_quality")]
    pub quality: u8,
    /// Alternate formats to produce per variant width
    #[serde(default = "default_encoder_formats")]
    pub formats: Vec<String>,
    /// Request timeout in seconds
    #[serde(default = "default_encoder_timeout_secs")]
    pub timeout_secs: u64,
}

/// Photo optimizer configuration
#[derive(Debug, Clone, Deserialize)]
pub struct OptimizerConfig {
    /// Longest side after optimization
    #[serde(default = "default_max_dimension")]
    pub max_dimension: u32,
    /// Reject sources above this many pixels
    #[serde(default = "default_max_pixels")]
    pub max_pixels: u64,
    /// JPEG output quality
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    /// Candidate variant widths
    #[serde(default = "default_variant_widths")]
    pub variant_widths: Vec<u32>,
    /// Concurrent optimizations allowed in this process
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Deadline for a single optimization in seconds
    #[serde(default = "default_optimize_timeout_secs")]
    pub timeout_secs: u64,
    /// Optimize photos in the background right after an approval commits
    #[serde(default)]
    pub optimize_after_approval: bool,
}

/// Upload limits and per-operation deadlines
#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Largest accepted photo in bytes
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: i64,
    /// Presign deadline in seconds
    #[serde(default = "default_io_timeout_secs")]
    pub presign_timeout_secs: u64,
    /// HEAD/GET deadline in seconds
    #[serde(default = "default_io_timeout_secs")]
    pub object_timeout_secs: u64,
    /// Approval transaction deadline in seconds
    #[serde(default = "default_approval_timeout_secs")]
    pub approval_timeout_secs: u64,
}

/// API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

// Default value functions
fn default_service_name() -> String {
    "catalog-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_presign_ttl_secs() -> u64 {
    900
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

fn default_encoder_quality() -> u8 {
    78
}

fn default_encoder_formats() -> Vec<String> {
    vec!["webp".to_string(), "avif".to_string()]
}

fn default_encoder_timeout_secs() -> u64 {
    20
}

fn default_max_dimension() -> u32 {
    2048
}

fn default_max_pixels() -> u64 {
    36_000_000
}

fn default_jpeg_quality() -> u8 {
    82
}

fn default_variant_widths() -> Vec<u32> {
    vec![320, 640, 1024, 1536]
}

fn default_max_concurrency() -> usize {
    2
}

fn default_optimize_timeout_secs() -> u64 {
    40
}

fn default_max_upload_bytes() -> i64 {
    8 * 1024 * 1024 // 8MiB
}

fn default_io_timeout_secs() -> u64 {
    5
}

fn default_approval_timeout_secs() -> u64 {
    15
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .set_default("service.name", "catalog-service")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            .add_source(config::File::with_name("config/catalog").required(false))
            .add_source(config::File::with_name("/etc/cafe/catalog").required(false))
            // CATALOG__DATABASE__URL -> database.url
            .add_source(
                config::Environment::with_prefix("CATALOG")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("encoder.formats")
                    .with_list_parse_key("optimizer.variant_widths")
                    .with_list_parse_key("api.cors_origins")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }
}

impl DatabaseConfig {
    /// Get connection acquire timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Get idle connection timeout as Duration
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl S3Config {
    pub fn presign_ttl(&self) -> Duration {
        Duration::from_secs(self.presign_ttl_secs)
    }
}

impl EncoderConfig {
    /// Quality forced into the encoder's accepted range
    pub fn clamped_quality(&self) -> u8 {
        self.quality.clamp(1, 100)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl OptimizerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl UploadConfig {
    pub fn presign_timeout(&self) -> Duration {
        Duration::from_secs(self.presign_timeout_secs)
    }

    pub fn object_timeout(&self) -> Duration {
        Duration::from_secs(self.object_timeout_secs)
    }

    pub fn approval_timeout(&self) -> Duration {
        Duration::from_secs(self.approval_timeout_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            provider: EncoderProvider::None,
            base_url: None,
            quality: default_encoder_quality(),
            formats: default_encoder_formats(),
            timeout_secs: default_encoder_timeout_secs(),
        }
    }
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            max_dimension: default_max_dimension(),
            max_pixels: default_max_pixels(),
            jpeg_quality: default_jpeg_quality(),
            variant_widths: default_variant_widths(),
            max_concurrency: default_max_concurrency(),
            timeout_secs: default_optimize_timeout_secs(),
            optimize_after_approval: false,
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_upload_bytes: default_max_upload_bytes(),
            presign_timeout_secs: default_io_timeout_secs(),
            object_timeout_secs: default_io_timeout_secs(),
            approval_timeout_secs: default_approval_timeout_secs(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: true,
            cors_origins: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        assert_eq!(default_max_upload_bytes(), 8 * 1024 * 1024);
        assert_eq!(default_encoder_quality(), 78);
        assert_eq!(default_variant_widths(), vec![320, 640, 1024, 1536]);
        assert_eq!(default_max_dimension(), 2048);
    }

    #[test]
    fn test_encoder_quality_is_clamped() {
        let mut encoder = EncoderConfig::default();
        encoder.quality = 0;
        assert_eq!(encoder.clamped_quality(), 1);
        encoder.quality = 250;
        assert_eq!(encoder.clamped_quality(), 100);
    }

    #[test]
    fn test_encoder_provider_deserialize() {
        let provider: EncoderProvider = serde_json::from_str("\"url_template\"").unwrap();
        assert_eq!(provider, EncoderProvider::UrlTemplate);
    }
}
