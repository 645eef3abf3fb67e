use std::time::Duration;

use reqwest::header::{
    HeaderName, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED, LOCATION,
};
use reqwest::{redirect, Client, Response, StatusCode};
use tracing::{debug, warn};
use url::Url;

use crate::document::{parse_body, CachedDocument, ParsedBody, ValidationTag};
use crate::error::RetrievalError;

const TIMEOUT_SECS: u64 = 30;
const MAX_REDIRECTS: usize = 10;
const USER_AGENT: &str = concat!("Tonguefish/", env!("CARGO_PKG_VERSION"), " (feed aggregator)");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    Success,
    NotModified,
    // at least one hop was temporary
    TemporaryRedirect,
    // every hop was 301 or 308
    PermanentRedirect,
    Gone,
    Other(u16),
}

#[derive(Debug)]
pub struct FetchedFeed {
    pub status: FetchStatus,
    pub http_status: u16,
    pub url: String,
    pub validation: ValidationTag,
    /// `None` when the final response carried no usable body.
    pub body: Option<ParsedBody>,
}

impl FetchedFeed {
    pub fn has_body(&self) -> bool {
        self.body.is_some()
    }
}

impl From<FetchedFeed> for CachedDocument {
    fn from(fetched: FetchedFeed) -> Self {
        let body = fetched.body.unwrap_or_default();
        let (bozo, bozo_message) = match body.error {
            Some(error) => {
                warn!("{} did not parse cleanly: {}", fetched.url, error);
                (true, Some(error.to_string()))
            }
            None => (false, None),
        };

        CachedDocument {
            url: fetched.url,
            title: body.title,
            link: body.link,
            validation: fetched.validation,
            status: fetched.http_status,
            bozo,
            bozo_message,
            entries: body.entries,
        }
    }
}

pub struct Fetcher {
    client: Client,
}

impl Fetcher {
    pub fn new() -> reqwest::Result<Self> {
        // Redirects are walked by hand so a permanent move can be told
        // apart from a temporary one.
        let client = Client::builder()
            .timeout(Duration::from_secs(TIMEOUT_SECS))
            .user_agent(USER_AGENT)
            .redirect(redirect::Policy::none())
            .build()?;

        Ok(Self { client })
    }

    pub async fn fetch(
        &self,
        url: &str,
        validation: Option<&ValidationTag>,
    ) -> Result<FetchedFeed, RetrievalError> {
        let mut current = Url::parse(url).map_err(|source| RetrievalError::InvalidUrl {
            url: url.to_string(),
            source,
        })?;
        // Some(all hops permanent so far) once a redirect has been seen
        let mut redirected: Option<bool> = None;

        for _ in 0..=MAX_REDIRECTS {
            let mut request = self.client.get(current.clone());
            if let Some(tag) = validation.filter(|tag| !tag.is_empty()) {
                if let Some(etag) = &tag.etag {
                    request = request.header(IF_NONE_MATCH, etag.as_str());
                }
                if let Some(last_modified) = &tag.last_modified {
                    request = request.header(IF_MODIFIED_SINCE, last_modified.as_str());
                }
            }

            let response = request.send().await?;
            let status = response.status();

            if status.is_redirection() && status != StatusCode::NOT_MODIFIED {
                let next = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|location| current.join(location).ok())
                    .ok_or(RetrievalError::MissingLocation)?;
                let permanent = matches!(
                    status,
                    StatusCode::MOVED_PERMANENTLY | StatusCode::PERMANENT_REDIRECT
                );
                debug!("{} redirects to {} ({})", current, next, status);

                redirected = Some(redirected.unwrap_or(true) && permanent);
                current = next;
                continue;
            }

            return Self::finish(response, current, redirected).await;
        }

        Err(RetrievalError::TooManyRedirects(MAX_REDIRECTS))
    }

    async fn finish(
        response: Response,
        url: Url,
        redirected: Option<bool>,
    ) -> Result<FetchedFeed, RetrievalError> {
        let http_status = response.status();
        let header = |name: HeaderName| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned)
        };
        let validation = ValidationTag {
            etag: header(ETAG),
            last_modified: header(LAST_MODIFIED),
        };

        let status = match (http_status, redirected) {
            (StatusCode::GONE, _) => FetchStatus::Gone,
            (StatusCode::NOT_MODIFIED, None) => FetchStatus::NotModified,
            (s, None) if s.is_success() => FetchStatus::Success,
            (s, Some(permanent)) if s.is_success() || s == StatusCode::NOT_MODIFIED => {
                if permanent {
                    FetchStatus::PermanentRedirect
                } else {
                    FetchStatus::TemporaryRedirect
                }
            }
            (s, _) => FetchStatus::Other(s.as_u16()),
        };

        let bytes = if http_status.is_success() {
            response.bytes().await?.to_vec()
        } else {
            Vec::new()
        };
        let body = if bytes.iter().all(u8::is_ascii_whitespace) {
            None
        } else {
            Some(parse_body(&bytes))
        };

        Ok(FetchedFeed {
            status,
            http_status: http_status.as_u16(),
            url: url.to_string(),
            validation,
            body,
        })
    }
}
