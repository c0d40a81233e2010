use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for artifact storage
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Whether AWS S3 should be used for artifact storage
    pub use_aws: bool,
    /// S3 bucket name for backup artifacts
    pub s3_bucket_name: String,
    /// AWS region for S3 operations
    pub aws_region: String,
    /// Local directory for artifacts when AWS is unavailable
    pub local_artifact_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            use_aws: false,
            s3_bucket_name: String::new(),
            aws_region: String::from("us-west-2"),
            local_artifact_dir: PathBuf::from("./artifacts"),
        }
    }
}

impl StorageConfig {
    /// Load storage configuration from environment variables
    pub fn from_env() -> Self {
        let use_aws = env::var("BACKUP_USE_AWS")
            .map(|v| v.to_lowercase() == "true")
            .unwrap_or(false);

        let s3_bucket_name = env::var("BACKUP_S3_BUCKET").unwrap_or_else(|_| String::new());

        let aws_region = env::var("AWS_REGION").unwrap_or_else(|_| String::from("us-west-2"));

        let local_artifact_dir = env::var("BACKUP_LOCAL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./artifacts"));

        Self {
            use_aws,
            s3_bucket_name,
            aws_region,
            local_artifact_dir,
        }
    }

    /// Check if AWS should be used based on configuration and connectivity
    pub async fn should_use_aws(&self) -> bool {
        use aws_sdk_s3::Client as S3Client;
        use aws_types::region::Region;

        // If AWS is disabled in config, don't use it
        if !self.use_aws {
            return false;
        }

        // If bucket name is empty, can't use AWS
        if self.s3_bucket_name.is_empty() {
            return false;
        }

        // Try to initialize AWS client and check connectivity
        let probe = async {
            let aws_config = aws_config::from_env()
                .region(Region::new(self.aws_region.clone()))
                .load()
                .await;

            let client = S3Client::new(&aws_config);

            client
                .head_bucket()
                .bucket(&self.s3_bucket_name)
                .send()
                .await
        };

        match probe.await {
            Ok(_) => true,
            Err(err) => {
                tracing::warn!(
                    "AWS S3 connectivity check failed: {}, falling back to local storage",
                    err
                );
                false
            }
        }
    }

    /// Ensure the local artifact directory exists
    pub fn ensure_local_artifact_dir(&self) -> std::io::Result<()> {
        if !self.local_artifact_dir.exists() {
            std::fs::create_dir_all(&self.local_artifact_dir)?;
        }
        Ok(())
    }
}

/// Top-level engine configuration, loaded from environment variables
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// State database URL (scheduler markers, results, queue)
    pub state_db_url: String,
    /// HTTP bind address for the trigger/reporting surface
    pub http_bind: String,
    /// Scheduler tick cadence
    pub tick_interval: Duration,
    /// Number of concurrent backup workers
    pub worker_count: usize,
    /// Maximum wall-clock duration of one backup job
    pub job_timeout: Duration,
    /// Queue visibility timeout before a claimed job is redelivered
    pub visibility_timeout: Duration,
    /// Delivery attempts before a job is dead-lettered
    pub max_delivery_attempts: u32,
    /// Enqueue retries within a single scheduler tick
    pub enqueue_retries: u32,
    /// Age after which a pending/in_progress result is swept to failed
    pub watchdog_stuck_after: Duration,
    /// Cadence of the watchdog sweep
    pub watchdog_interval: Duration,
    /// Whether dump artifacts are gzip-compressed before upload
    pub compress: bool,
    /// Artifact storage settings
    pub storage: StorageConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            state_db_url: String::from("sqlite:tierback.db"),
            http_bind: String::from("0.0.0.0:8080"),
            tick_interval: Duration::from_secs(900),
            worker_count: 4,
            job_timeout: Duration::from_secs(3600),
            visibility_timeout: Duration::from_secs(1800),
            max_delivery_attempts: 5,
            enqueue_retries: 3,
            watchdog_stuck_after: Duration::from_secs(2 * 3600),
            watchdog_interval: Duration::from_secs(600),
            compress: true,
            storage: StorageConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            state_db_url: env::var("STATE_DB_URL").unwrap_or(defaults.state_db_url),
            http_bind: env::var("HTTP_BIND").unwrap_or(defaults.http_bind),
            tick_interval: env_secs("TICK_INTERVAL_SECS", defaults.tick_interval),
            worker_count: env::var("WORKER_COUNT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.worker_count),
            job_timeout: env_secs("JOB_TIMEOUT_SECS", defaults.job_timeout),
            visibility_timeout: env_secs("QUEUE_VISIBILITY_SECS", defaults.visibility_timeout),
            max_delivery_attempts: env::var("QUEUE_MAX_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_delivery_attempts),
            enqueue_retries: env::var("ENQUEUE_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.enqueue_retries),
            watchdog_stuck_after: env_secs("WATCHDOG_STUCK_SECS", defaults.watchdog_stuck_after),
            watchdog_interval: env_secs("WATCHDOG_INTERVAL_SECS", defaults.watchdog_interval),
            compress: env::var("BACKUP_COMPRESS")
                .map(|v| v.to_lowercase() != "false")
                .unwrap_or(defaults.compress),
            storage: StorageConfig::from_env(),
        }
    }
}

fn env_secs(name: &str, default: Duration) -> Duration {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}
