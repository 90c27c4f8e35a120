//! Sources of replication documents.

use std::{io, pin::pin, time::Duration};

use async_trait::async_trait;
use futures_util::TryStreamExt;
use reqwest::{Client, Response, header::USER_AGENT};
use url::Url;

use super::TransportError;

/// User agent sent by [`HttpReplicationSource`] unless overridden.
pub const DEFAULT_USER_AGENT: &str = "quadosm-replication/0.1";

/// Per-request timeout used unless overridden.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// A replication feed laid out as `AAA/BBB/CCC.osc.gz` plus `state.txt`.
#[async_trait(?Send)]
pub trait ReplicationSource {
    /// Where the feed lives, for log messages.
    fn location(&self) -> &str;

    /// Fetch the document at `path`, relative to the feed root.
    async fn fetch(&self, path: &str) -> Result<Vec<u8>, TransportError>;
}

/// HTTP implementation of [`ReplicationSource`].
#[derive(Debug)]
pub struct HttpReplicationSource {
    client: Client,
    base_url: Url,
    user_agent: String,
    timeout: Duration,
}

impl HttpReplicationSource {
    /// Construct a source rooted at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidUrl`] for an unparseable URL and
    /// [`TransportError::Client`] when the HTTP client cannot be built.
    pub fn new(base_url: &str) -> Result<Self, TransportError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|source| TransportError::Client { source })?;
        Ok(Self {
            client,
            base_url: directory_url(base_url)?,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Override the default user agent string.
    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Override the per-request timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn call(&self, url: &str) -> Result<Response, TransportError> {
        self.client
            .get(url)
            .timeout(self.timeout)
            .header(USER_AGENT, self.user_agent.as_str())
            .send()
            .await
            .map_err(|err| convert_reqwest_error(err, url))?
            .error_for_status()
            .map_err(|err| convert_reqwest_error(err, url))
    }
}

#[async_trait(?Send)]
impl ReplicationSource for HttpReplicationSource {
    fn location(&self) -> &str {
        self.base_url.as_str()
    }

    async fn fetch(&self, path: &str) -> Result<Vec<u8>, TransportError> {
        let url = self
            .base_url
            .join(path)
            .map_err(|source| TransportError::InvalidUrl {
                url: format!("{}{path}", self.base_url),
                source,
            })?;
        let response = self.call(url.as_str()).await?;
        let mut stream = pin!(response.bytes_stream());
        let mut body = Vec::new();
        while let Some(chunk) = stream
            .try_next()
            .await
            .map_err(|err| convert_reqwest_error(err, url.as_str()))?
        {
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }
}

/// Parse `base_url` so that relative joins stay below it.
fn directory_url(base_url: &str) -> Result<Url, TransportError> {
    let trimmed = base_url.trim();
    let normalised = if trimmed.ends_with('/') {
        trimmed.to_owned()
    } else {
        format!("{trimmed}/")
    };
    Url::parse(&normalised).map_err(|source| TransportError::InvalidUrl {
        url: trimmed.to_owned(),
        source,
    })
}

fn convert_reqwest_error(error: reqwest::Error, url: &str) -> TransportError {
    if let Some(status) = error.status() {
        return TransportError::Http {
            url: url.to_owned(),
            status: status.as_u16(),
            message: error.to_string(),
        };
    }

    let kind = if error.is_timeout() {
        io::ErrorKind::TimedOut
    } else {
        io::ErrorKind::Other
    };
    TransportError::Network {
        url: url.to_owned(),
        source: io::Error::new(kind, error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("https://planet.example.org/replication/minute", "https://planet.example.org/replication/minute/000/001/234.osc.gz")]
    #[case("https://planet.example.org/replication/minute/", "https://planet.example.org/replication/minute/000/001/234.osc.gz")]
    fn joins_paths_below_the_base(#[case] base: &str, #[case] expected: &str) {
        let url = directory_url(base).expect("valid url");
        let joined = url.join("000/001/234.osc.gz").expect("join");
        assert_eq!(joined.as_str(), expected);
    }

    #[rstest]
    fn rejects_relative_urls() {
        let err = HttpReplicationSource::new("replication/minute").expect_err("relative url");
        assert!(matches!(err, TransportError::InvalidUrl { .. }));
    }

    #[rstest]
    fn reports_its_location() {
        let source = HttpReplicationSource::new("https://planet.example.org/replication/hour")
            .expect("valid source")
            .with_user_agent("quadosm-tests")
            .with_timeout(Duration::from_secs(5));
        assert_eq!(
            source.location(),
            "https://planet.example.org/replication/hour/"
        );
    }

    #[rstest]
    #[case::not_found(TransportError::Http { url: String::new(), status: 404, message: String::new() }, true)]
    #[case::server_error(TransportError::Http { url: String::new(), status: 503, message: String::new() }, false)]
    #[case::mirror_gap(TransportError::NotFound { location: String::new() }, true)]
    fn classifies_missing_documents(#[case] error: TransportError, #[case] expected: bool) {
        assert_eq!(error.is_not_found(), expected);
    }
}
