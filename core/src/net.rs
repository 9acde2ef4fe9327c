use std::io::Read;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, CONNECTION, CONTENT_DISPOSITION,
    CONTENT_LENGTH, RANGE, REFERER, USER_AGENT,
};

use crate::config::PlayerConfig;
use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: String,
    /// Inclusive `bytes=start-end` range, sent as-is.
    pub range: Option<(u64, u64)>,
    pub user_agent: String,
    pub accept_language: String,
}

impl FetchRequest {
    pub fn new(url: String, config: &PlayerConfig) -> Self {
        Self {
            url,
            range: None,
            user_agent: config.user_agent.clone(),
            accept_language: config.accept_language.clone(),
        }
    }

    pub fn with_range(mut self, start: u64, end: u64) -> Self {
        self.range = Some((start, end));
        self
    }
}

pub struct RemoteResponse {
    pub status_code: u16,
    /// `None` when the header is missing or not a non-negative integer.
    pub content_length: Option<u64>,
    pub content_disposition: Option<String>,
    pub body: Box<dyn Read + Send>,
}

impl RemoteResponse {
    pub fn is_ok(&self) -> bool {
        self.status_code == 200
    }
}

pub trait NetClient: Send + Sync {
    fn fetch(&self, req: &FetchRequest) -> CoreResult<RemoteResponse>;
}

#[derive(Clone)]
pub struct ReqwestNetClient {
    client: Client,
}

impl ReqwestNetClient {
    pub fn new(config: &PlayerConfig) -> CoreResult<Self> {
        let client = Client::builder()
            .user_agent(config.user_agent.as_str())
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(|err| CoreError::Network(err.to_string()))?;
        Ok(Self { client })
    }

    fn request_headers(&self, req: &FetchRequest) -> CoreResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
        headers.insert(
            ACCEPT_LANGUAGE,
            HeaderValue::from_str(&req.accept_language)
                .map_err(|err| CoreError::Network(err.to_string()))?,
        );
        headers.insert(
            REFERER,
            HeaderValue::from_str(&req.url).map_err(|err| CoreError::Network(err.to_string()))?,
        );
        headers.insert(
            HeaderName::from_static("charset"),
            HeaderValue::from_static("UTF-8"),
        );
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&req.user_agent)
                .map_err(|err| CoreError::Network(err.to_string()))?,
        );
        headers.insert(CONNECTION, HeaderValue::from_static("Keep-Alive"));
        if let Some((start, end)) = req.range {
            let value = format!("bytes={}-{}", start, end);
            headers.insert(
                RANGE,
                HeaderValue::from_str(&value).map_err(|err| CoreError::Network(err.to_string()))?,
            );
        }
        Ok(headers)
    }
}

impl NetClient for ReqwestNetClient {
    fn fetch(&self, req: &FetchRequest) -> CoreResult<RemoteResponse> {
        let resp = self
            .client
            .get(&req.url)
            .headers(self.request_headers(req)?)
            .send()
            .map_err(|err| CoreError::Network(err.to_string()))?;
        let headers = resp.headers();
        let content_length = headers
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok());
        let content_disposition = headers
            .get(CONTENT_DISPOSITION)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_string());

        Ok(RemoteResponse {
            status_code: resp.status().as_u16(),
            content_length,
            content_disposition,
            body: Box::new(resp),
        })
    }
}
