//! Client for the external WebP/AVIF encoder.
//!
//! Two provider shapes are supported:
//!
//! - **URL template**: `GET {base}/insecure/rs:fit:{W}:0/q:{Q}/{base64url(source)}.{fmt}`
//! - **Structured**: `POST {base}/v1/encode` with `{source_url, width, format, quality}`
//!
//! Both read at most [`MAX_RESPONSE_BYTES`] of body. The encoder is optional:
//! when it is not configured the optimizer simply produces no alternate-format
//! variants.

use crate::config::{EncoderConfig, EncoderProvider};
use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use reqwest::Client;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, instrument};

/// Largest encoder response accepted
pub const MAX_RESPONSE_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum EncoderError {
    #[error("format encoder is not configured")]
    NotConfigured,

    #[error("invalid encoder request: {0}")]
    InvalidRequest(String),

    #[error("encoder returned status {0}")]
    Status(u16),

    #[error("encoder returned an empty body")]
    EmptyBody,

    #[error("encoder response exceeds {MAX_RESPONSE_BYTES} bytes")]
    TooLarge,

    #[error("encoder transport error: {0}")]
    Transport(String),
}

/// Alternate output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AltFormat {
    Webp,
    Avif,
}

impl AltFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            AltFormat::Webp => "webp",
            AltFormat::Avif => "avif",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            AltFormat::Webp => "image/webp",
            AltFormat::Avif => "image/avif",
        }
    }
}

impl fmt::Display for AltFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AltFormat {
    type Err = EncoderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "webp" => Ok(AltFormat::Webp),
            "avif" => Ok(AltFormat::Avif),
            other => Err(EncoderError::InvalidRequest(format!(
                "unsupported alternate format: {other}"
            ))),
        }
    }
}

/// Encoded bytes as returned by the encoder
#[derive(Debug, Clone)]
pub struct EncodedImage {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FormatEncoder: Send + Sync {
    /// Formats this encoder should be asked for, in order
    fn formats(&self) -> Vec<AltFormat>;

    async fn encode(
        &self,
        source_url: &str,
        width: u32,
        format: AltFormat,
    ) -> Result<EncodedImage, EncoderError>;
}

#[derive(Debug, Serialize)]
struct EncodeRequest<'a> {
    source_url: &'a str,
    width: u32,
    format: AltFormat,
    quality: u8,
}

/// HTTP encoder client covering both provider shapes
pub struct HttpFormatEncoder {
    client: Client,
    provider: EncoderProvider,
    base_url: String,
    quality: u8,
    formats: Vec<AltFormat>,
}

impl HttpFormatEncoder {
    /// Build a client from configuration; `Ok(None)` when no provider is set.
    pub fn from_config(config: &EncoderConfig) -> Result<Option<Self>, EncoderError> {
        if config.provider == EncoderProvider::None {
            return Ok(None);
        }

        let base_url = config
            .base_url
            .as_deref()
            .map(|u| u.trim().trim_end_matches('/').to_string())
            .filter(|u| !u.is_empty())
            .ok_or_else(|| {
                EncoderError::InvalidRequest("encoder.base_url is required".to_string())
            })?;

        let mut formats = Vec::new();
        for raw in &config.formats {
            let format: AltFormat = raw.parse()?;
            if !formats.contains(&format) {
                formats.push(format);
            }
        }

        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| EncoderError::Transport(e.to_string()))?;

        Ok(Some(Self {
            client,
            provider: config.provider,
            base_url,
            quality: config.clamped_quality(),
            formats,
        }))
    }

    /// URL for the template provider
    pub fn template_url(&self, source_url: &str, width: u32, format: AltFormat) -> String {
        format!(
            "{base}/insecure/rs:fit:{width}:0/q:{quality}/{source}.{format}",
            base = self.base_url,
            quality = self.quality,
            source = URL_SAFE_NO_PAD.encode(source_url.as_bytes()),
        )
    }

    async fn read_capped(response: reqwest::Response) -> Result<EncodedImage, EncoderError> {
        let status = response.status();
        if !status.is_success() {
            return Err(EncoderError::Status(status.as_u16()));
        }
        if response
            .content_length()
            .is_some_and(|len| len as usize > MAX_RESPONSE_BYTES)
        {
            return Err(EncoderError::TooLarge);
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        let mut response = response;
        let mut bytes = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(map_transport_error)? {
            if bytes.len() + chunk.len() > MAX_RESPONSE_BYTES {
                return Err(EncoderError::TooLarge);
            }
            bytes.extend_from_slice(&chunk);
        }

        if bytes.is_empty() {
            return Err(EncoderError::EmptyBody);
        }

        Ok(EncodedImage {
            bytes,
            content_type,
        })
    }
}

#[async_trait]
impl FormatEncoder for HttpFormatEncoder {
    fn formats(&self) -> Vec<AltFormat> {
        self.formats.clone()
    }

    #[instrument(skip(self), fields(provider = ?self.provider))]
    async fn encode(
        &self,
        source_url: &str,
        width: u32,
        format: AltFormat,
    ) -> Result<EncodedImage, EncoderError> {
        if source_url.trim().is_empty() || width == 0 {
            return Err(EncoderError::InvalidRequest(
                "source_url and width are required".to_string(),
            ));
        }

        let response = match self.provider {
            EncoderProvider::UrlTemplate => self
                .client
                .get(self.template_url(source_url, width, format))
                .send()
                .await
                .map_err(map_transport_error)?,
            EncoderProvider::Structured => self
                .client
                .post(format!("{}/v1/encode", self.base_url))
                .json(&EncodeRequest {
                    source_url,
                    width,
                    format,
                    quality: self.quality,
                })
                .send()
                .await
                .map_err(map_transport_error)?,
            EncoderProvider::None => return Err(EncoderError::NotConfigured),
        };

        let mut encoded = Self::read_capped(response).await?;
        if encoded.content_type.is_empty() {
            encoded.content_type = format.mime_type().to_string();
        }

        debug!(
            width = width,
            format = %format,
            size_bytes = encoded.bytes.len(),
            "Encoder produced variant"
        );

        Ok(encoded)
    }
}

fn map_transport_error(error: reqwest::Error) -> EncoderError {
    EncoderError::Transport(error.to_string())
}
