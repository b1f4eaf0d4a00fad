//! CLI handling for the object store that flushed batches are written to.

use std::{fs, num::NonZeroUsize, path::PathBuf, sync::Arc, time::Duration};

use clap::ValueEnum;
use non_empty_string::NonEmptyString;
use object_store::{
    ObjectStore, RetryConfig, limit::LimitStore, local::LocalFileSystem, memory::InMemory,
};
use snafu::{ResultExt, Snafu};
use tracing::{info, warn};

use crate::{endpoint::Endpoint, parse_duration, parse_optional_string};

#[derive(Debug, Snafu)]
pub enum ParseError {
    #[snafu(display("Unable to create data directory {}: {}", path.display(), source))]
    CreatingDataDirectory {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Unable to create local file system object store: {}", source))]
    CreateLocalFileSystem { source: object_store::Error },

    #[snafu(display(
        "Specified {} for the object store, required configuration missing for {}",
        object_store,
        missing
    ))]
    MissingObjectStoreConfig {
        object_store: ObjectStoreType,
        missing: String,
    },

    #[snafu(display("Error configuring Amazon S3: {}", source))]
    InvalidS3Config { source: object_store::Error },

    #[snafu(display(
        "Specified s3 for the object store, but S3 support was not compiled in (enable the `aws` feature)"
    ))]
    S3NotCompiledIn,
}

/// The AWS region to use for Amazon S3 if none is configured.
pub const FALLBACK_AWS_REGION: &str = "us-east-1";

/// Where flushed batches are stored.
#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum ObjectStoreType {
    /// In-memory, lost when the process exits. Only useful for local testing.
    Memory,

    /// Local file system, rooted at `--data-dir`.
    File,

    /// Amazon S3 or an S3 compatible service.
    S3,
}

impl ObjectStoreType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::File => "file",
            Self::S3 => "s3",
        }
    }
}

impl std::fmt::Display for ObjectStoreType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// CLI config for the object store.
#[derive(Debug, Clone, clap::Parser)]
pub struct ObjectStoreConfig {
    /// Which object store flushed batches are written to.
    ///
    /// memory: effectively no object persistence. Flushed events are lost when the process
    /// exits, even though their messages were deleted from the queue.
    ///
    /// file: stores objects in the local filesystem, under `--data-dir`.
    ///
    /// s3: Amazon S3 or a compatible service. Requires `--bucket`, and credentials either
    /// through `--aws-access-key-id`/`--aws-secret-access-key` or the usual AWS environment.
    #[clap(
        value_enum,
        long = "object-store",
        env = "EVENT_INGESTER_OBJECT_STORE",
        ignore_case = true,
        action,
        required = true,
        verbatim_doc_comment
    )]
    pub object_store: ObjectStoreType,

    /// Name of the bucket to use for the object store. Must also set `--object-store` to s3.
    #[clap(long = "bucket", env = "EVENT_INGESTER_BUCKET", action)]
    pub bucket: Option<String>,

    /// Directory objects are written to when `--object-store` is file.
    #[clap(long = "data-dir", env = "EVENT_INGESTER_DATA_DIR", action)]
    pub data_dir: Option<PathBuf>,

    /// When using Amazon S3 as the object store, set this to an access key that has permission
    /// to write to the specified bucket.
    ///
    /// If unset, the default AWS credential chain applies.
    #[clap(
        long = "aws-access-key-id",
        env = "AWS_ACCESS_KEY_ID",
        value_parser = parse_optional_string,
        default_value = "",
        action
    )]
    pub aws_access_key_id: std::option::Option<NonEmptyString>,

    /// When using Amazon S3 as the object store, set this to the secret access key that goes
    /// with the specified access key ID.
    #[clap(
        long = "aws-secret-access-key",
        env = "AWS_SECRET_ACCESS_KEY",
        value_parser = parse_optional_string,
        default_value = "",
        action
    )]
    pub aws_secret_access_key: std::option::Option<NonEmptyString>,

    /// When using Amazon S3 as the object store, set this to the region that goes with the
    /// specified bucket if different from the fallback value.
    #[clap(
        long = "aws-default-region",
        env = "AWS_DEFAULT_REGION",
        default_value = FALLBACK_AWS_REGION,
        action
    )]
    pub aws_default_region: String,

    /// When using Amazon S3 compatible storage service, set this to the endpoint.
    ///
    /// Example: `http://localhost:9000`
    #[clap(long = "aws-endpoint", env = "AWS_ENDPOINT", action)]
    pub aws_endpoint: Option<Endpoint>,

    /// When using Amazon S3 as an object store, set this to the session token. This is handy
    /// when using a federated login or SSO and you fetch credentials via the UI.
    ///
    /// It is assumed that the session is valid as long as the process is running.
    #[clap(long = "aws-session-token", env = "AWS_SESSION_TOKEN", action)]
    pub aws_session_token: Option<String>,

    /// Allow unencrypted HTTP connection to AWS.
    #[clap(long = "aws-allow-http", env = "AWS_ALLOW_HTTP", action)]
    pub aws_allow_http: bool,

    /// If enabled, S3 stores will not fetch credentials and will not sign requests.
    ///
    /// This can be useful when interacting with public S3 buckets that deny authorized
    /// requests or for when working with in-cluster stores without authentication.
    #[clap(long = "aws-skip-signature", env = "AWS_SKIP_SIGNATURE", action)]
    pub aws_skip_signature: bool,

    /// When using a network-based object store, limit the number of connections to this value.
    #[clap(
        long = "object-store-connection-limit",
        env = "EVENT_INGESTER_OBJECT_STORE_CONNECTION_LIMIT",
        default_value = "16",
        action
    )]
    pub object_store_connection_limit: NonZeroUsize,

    /// The maximum number of times to retry a request.
    ///
    /// Set to 0 to disable retries.
    #[clap(
        long = "object-store-max-retries",
        env = "EVENT_INGESTER_OBJECT_STORE_MAX_RETRIES",
        action
    )]
    pub object_store_max_retries: Option<usize>,

    /// The maximum length of time from the initial request after which no further retries
    /// will be attempted.
    ///
    /// Example: "30s", "1m".
    #[clap(
        long = "object-store-retry-timeout",
        env = "EVENT_INGESTER_OBJECT_STORE_RETRY_TIMEOUT",
        value_parser = parse_duration,
        action
    )]
    pub object_store_retry_timeout: Option<Duration>,
}

impl ObjectStoreConfig {
    /// Retry settings for network-based stores, defaults overridden by the CLI.
    pub fn retry_config(&self) -> RetryConfig {
        let mut retry_config = RetryConfig::default();
        if let Some(max_retries) = self.object_store_max_retries {
            retry_config.max_retries = max_retries;
        }
        if let Some(retry_timeout) = self.object_store_retry_timeout {
            retry_config.retry_timeout = retry_timeout;
        }
        retry_config
    }

    /// Build the configured object store.
    pub fn make_object_store(&self) -> Result<Arc<dyn ObjectStore>, ParseError> {
        if self.object_store != ObjectStoreType::File && self.data_dir.is_some() {
            warn!(
                object_store = %self.object_store,
                "--data-dir is only used by the file object store and will be ignored"
            );
        }
        if self.object_store != ObjectStoreType::S3 && self.bucket.is_some() {
            warn!(
                object_store = %self.object_store,
                "--bucket is only used by the s3 object store and will be ignored"
            );
        }

        let store: Arc<dyn ObjectStore> = match self.object_store {
            ObjectStoreType::Memory => {
                info!(object_store_type = "memory", "object store");
                Arc::new(InMemory::new())
            }
            ObjectStoreType::File => {
                let path =
                    self.data_dir
                        .as_ref()
                        .ok_or_else(|| ParseError::MissingObjectStoreConfig {
                            object_store: ObjectStoreType::File,
                            missing: "data-dir".to_string(),
                        })?;
                info!(object_store_type = "file", path = %path.display(), "object store");

                fs::create_dir_all(path).context(CreatingDataDirectorySnafu { path })?;
                let store = LocalFileSystem::new_with_prefix(path)
                    .context(CreateLocalFileSystemSnafu)?
                    .with_automatic_cleanup(true);
                Arc::new(store)
            }
            ObjectStoreType::S3 => self.new_s3()?,
        };

        Ok(store)
    }

    #[cfg(feature = "aws")]
    fn new_s3(&self) -> Result<Arc<dyn ObjectStore>, ParseError> {
        let bucket = self
            .bucket
            .as_ref()
            .ok_or_else(|| ParseError::MissingObjectStoreConfig {
                object_store: ObjectStoreType::S3,
                missing: "bucket".to_string(),
            })?;
        info!(
            object_store_type = "s3",
            %bucket,
            region = %self.aws_default_region,
            endpoint = ?self.aws_endpoint,
            "object store"
        );

        let mut builder = object_store::aws::AmazonS3Builder::from_env()
            .with_bucket_name(bucket)
            .with_region(&self.aws_default_region)
            .with_allow_http(self.aws_allow_http)
            .with_skip_signature(self.aws_skip_signature)
            .with_retry(self.retry_config());

        if let Some(key_id) = &self.aws_access_key_id {
            builder = builder.with_access_key_id(key_id.as_str());
        }
        if let Some(secret) = &self.aws_secret_access_key {
            builder = builder.with_secret_access_key(secret.as_str());
        }
        if let Some(token) = &self.aws_session_token {
            builder = builder.with_token(token);
        }
        if let Some(endpoint) = &self.aws_endpoint {
            builder = builder.with_endpoint(endpoint.as_str());
        }

        let s3 = builder.build().context(InvalidS3ConfigSnafu)?;
        Ok(Arc::new(LimitStore::new(
            s3,
            self.object_store_connection_limit.get(),
        )))
    }

    #[cfg(not(feature = "aws"))]
    fn new_s3(&self) -> Result<Arc<dyn ObjectStore>, ParseError> {
        S3NotCompiledInSnafu.fail()
    }
}
