use std::{collections::BTreeMap, fmt, io::Read, sync::Arc, time::Duration};

use reqwest::blocking::Client;

use crate::{config::HubConfig, error::TransportError};

/// Request and response headers, keyed by lower-case name.
pub type Headers = BTreeMap<String, String>;

pub struct HttpResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: Box<dyn Read + Send>,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Read + Send + 'static) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Box::new(body),
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header("content-length")?.trim().parse().ok()
    }
}

impl fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Blocking GET capability. Implementations must not retry on their own.
pub trait HttpTransport: Send + Sync {
    fn get(&self, url: &str, headers: &Headers) -> Result<HttpResponse, TransportError>;
}

impl<T: HttpTransport + ?Sized> HttpTransport for &T {
    fn get(&self, url: &str, headers: &Headers) -> Result<HttpResponse, TransportError> {
        (**self).get(url, headers)
    }
}

impl<T: HttpTransport + ?Sized> HttpTransport for Arc<T> {
    fn get(&self, url: &str, headers: &Headers) -> Result<HttpResponse, TransportError> {
        (**self).get(url, headers)
    }
}

impl<T: HttpTransport + ?Sized> HttpTransport for Box<T> {
    fn get(&self, url: &str, headers: &Headers) -> Result<HttpResponse, TransportError> {
        (**self).get(url, headers)
    }
}

/// Production transport over `reqwest`'s blocking client.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn from_config(config: &HubConfig) -> reqwest::Result<Self> {
        // The blocking client otherwise applies a 30s total timeout; `None` here
        // means no timeout at all.
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.timeout_secs.map(Duration::from_secs))
            .build()?;
        Ok(Self { client })
    }

}

impl HttpTransport for ReqwestTransport {
    fn get(&self, url: &str, headers: &Headers) -> Result<HttpResponse, TransportError> {
        let mut request = self.client.get(url);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let response = request.send()?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                let value = value.to_str().ok()?;
                Some((name.as_str().to_owned(), value.to_owned()))
            })
            .collect();
        Ok(HttpResponse {
            status,
            headers,
            body: Box::new(response),
        })
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use std::{
        collections::VecDeque,
        io::{self, Cursor},
        sync::Mutex,
    };

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Recorded {
        pub url: String,
        pub headers: Headers,
    }

    enum Behaviour {
        Scripted(Mutex<VecDeque<(u16, Vec<u8>)>>),
        Serve {
            body: Vec<u8>,
            ranges: bool,
            fail_on: Option<usize>,
        },
        Refuse,
    }

    /// Test double that records every request it receives.
    pub struct MockTransport {
        behaviour: Behaviour,
        etag: Option<String>,
        requests: Mutex<Vec<Recorded>>,
    }

    impl MockTransport {
        fn with(behaviour: Behaviour) -> Self {
            Self {
                behaviour,
                etag: None,
                requests: Mutex::new(Vec::new()),
            }
        }

        /// Sends `etag` as the `ETag` of every response.
        #[must_use]
        pub fn with_etag(mut self, etag: &str) -> Self {
            self.etag = Some(etag.to_owned());
            self
        }

        /// Replies with the given responses in order.
        pub fn scripted(responses: Vec<(u16, &[u8])>) -> Self {
            let queue = responses
                .into_iter()
                .map(|(status, body)| (status, body.to_vec()))
                .collect();
            Self::with(Behaviour::Scripted(Mutex::new(queue)))
        }

        /// Serves `body` for every request, honouring `Range` when `ranges` is set.
        pub fn serving(body: &[u8], ranges: bool) -> Self {
            Self::with(Behaviour::Serve {
                body: body.to_vec(),
                ranges,
                fail_on: None,
            })
        }

        /// Like `serving` with ranges, but answers request number `fail_on` with a 500.
        pub fn serving_until(body: &[u8], fail_on: usize) -> Self {
            Self::with(Behaviour::Serve {
                body: body.to_vec(),
                ranges: true,
                fail_on: Some(fail_on),
            })
        }

        /// Fails every request; proves that no network access happened.
        pub fn refusing() -> Self {
            Self::with(Behaviour::Refuse)
        }

        pub fn requests(&self) -> Vec<Recorded> {
            self.requests.lock().unwrap().clone()
        }

        pub fn range_requests(&self) -> Vec<String> {
            self.requests()
                .into_iter()
                .filter_map(|request| request.headers.get("range").cloned())
                .collect()
        }
    }

    fn serve_range(body: &[u8], range: &str) -> HttpResponse {
        let total = body.len() as u64;
        let spec = range.trim_start_matches("bytes=");
        let (start, end) = spec.split_once('-').unwrap();
        let start: u64 = start.parse().unwrap();
        if start >= total {
            return HttpResponse::new(416, Cursor::new(Vec::new()))
                .with_header("Content-Range", format!("bytes */{total}"));
        }
        let end: u64 = end.parse::<u64>().map_or(total - 1, |end| end.min(total - 1));
        let slice = body[start as usize..=end as usize].to_vec();
        HttpResponse::new(206, Cursor::new(slice))
            .with_header("Content-Range", format!("bytes {start}-{end}/{total}"))
            .with_header("Content-Length", (end - start + 1).to_string())
    }

    impl HttpTransport for MockTransport {
        fn get(&self, url: &str, headers: &Headers) -> Result<HttpResponse, TransportError> {
            let count = {
                let mut requests = self.requests.lock().unwrap();
                requests.push(Recorded {
                    url: url.to_owned(),
                    headers: headers.clone(),
                });
                requests.len()
            };
            let response = match &self.behaviour {
                Behaviour::Refuse => {
                    return Err(Box::new(io::Error::new(
                        io::ErrorKind::ConnectionRefused,
                        "network access is not allowed here",
                    )))
                }
                Behaviour::Scripted(queue) => {
                    let (status, body) = queue
                        .lock()
                        .unwrap()
                        .pop_front()
                        .expect("mock transport ran out of responses");
                    let length = body.len();
                    HttpResponse::new(status, Cursor::new(body))
                        .with_header("Content-Length", length.to_string())
                }
                Behaviour::Serve { fail_on, .. } if *fail_on == Some(count) => {
                    HttpResponse::new(500, Cursor::new(Vec::new()))
                }
                Behaviour::Serve { body, ranges, .. } => match headers.get("range") {
                    Some(range) if *ranges => serve_range(body, range),
                    _ => HttpResponse::new(200, Cursor::new(body.clone()))
                        .with_header("Content-Length", body.len().to_string()),
                },
            };
            Ok(match &self.etag {
                Some(etag) => response.with_header("ETag", etag.clone()),
                None => response,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn header_lookup_ignores_case() {
        let response = HttpResponse::new(206, Cursor::new(Vec::new()))
            .with_header("Content-Length", " 42 ")
            .with_header("Content-Range", "bytes 0-0/42");

        assert_eq!(response.header("content-range"), Some("bytes 0-0/42"));
        assert_eq!(response.header("CONTENT-RANGE"), Some("bytes 0-0/42"));
        assert_eq!(response.content_length(), Some(42));
        assert!(response.is_success());
    }

    #[test]
    fn non_2xx_is_not_success() {
        for status in [199, 301, 404, 500] {
            assert!(!HttpResponse::new(status, Cursor::new(Vec::new())).is_success());
        }
    }

    #[test]
    fn default_transport_builds_from_config() {
        let config = HubConfig::default().with_timeout_secs(Some(5));
        assert!(ReqwestTransport::from_config(&config).is_ok());
    }
}
