//! AWS client plumbing shared by the store, queues, sinks, and detectors.

use anyhow::Result;
use aws_config::{BehaviorVersion, Region, SdkConfig};

/// Load the base SDK configuration for the configured region.
pub async fn sdk_config(region: &str) -> SdkConfig {
    aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(region.to_string()))
        .load()
        .await
}

/// Derive a configuration whose credentials come from assuming `role_arn`.
///
/// Used when a request names a role for image reads, model invocation, or
/// sink writes that differs from the process role.
pub async fn assumed_role_config(base: &SdkConfig, role_arn: &str, session: &str) -> SdkConfig {
    let provider = aws_config::sts::AssumeRoleProvider::builder(role_arn)
        .session_name(session)
        .configure(base)
        .build()
        .await;
    let mut builder = base.to_builder();
    builder.set_credentials_provider(Some(aws_credential_types::provider::SharedCredentialsProvider::new(provider)));
    builder.build()
}

/// Build an S3 client, honoring the optional endpoint override used with
/// S3-compatible object stores.
pub fn s3_client(config: &SdkConfig, endpoint: Option<&str>) -> aws_sdk_s3::Client {
    match endpoint {
        Some(endpoint) => {
            let config = aws_sdk_s3::config::Builder::from(config)
                .endpoint_url(endpoint)
                .force_path_style(true)
                .build();
            aws_sdk_s3::Client::from_conf(config)
        }
        None => aws_sdk_s3::Client::new(config),
    }
}

/// Split an `s3://bucket/key` url into bucket and key.
pub fn parse_s3_url(url: &str) -> Result<(&str, &str)> {
    let stripped = url
        .strip_prefix("s3://")
        .ok_or_else(|| anyhow::anyhow!("not an s3 url: {url}"))?;
    let (bucket, key) = stripped
        .split_once('/')
        .ok_or_else(|| anyhow::anyhow!("s3 url has no key: {url}"))?;
    if bucket.is_empty() || key.is_empty() {
        anyhow::bail!("s3 url has empty bucket or key: {url}");
    }
    Ok((bucket, key))
}
