mod reqwest;

pub use self::reqwest::ReqwestHttpClient;

use std::{fmt, io::Read, sync::Arc, time::Duration};

/// Reports the loader's network protocol version to storage endpoints.
pub static USER_AGENT: &str = concat!("network:", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Default, Clone)]
pub struct HttpRequestOptions {
    /// How long to wait for the whole response once connected. `None` means
    /// the client's default.
    pub read_timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub url: String,
    pub method: String,
    pub headers: Vec<(String, String)>,
    pub options: HttpRequestOptions,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        HttpRequest {
            url: url.into(),
            method: "GET".to_string(),
            headers: Vec::new(),
            options: HttpRequestOptions::default(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.options.read_timeout = Some(timeout);
        self
    }
}

pub struct HttpResponse {
    pub status: u16,
    pub status_text: String,
    /// The body, streamed straight off the connection.
    pub body: Box<dyn Read + Send>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Read the rest of the body into a string.
    pub fn text(mut self) -> Result<String, std::io::Error> {
        let mut buffer = String::new();
        self.body.read_to_string(&mut buffer)?;
        Ok(buffer)
    }
}

impl fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("status_text", &self.status_text)
            .finish_non_exhaustive()
    }
}

/// A blocking HTTP client.
///
/// Resolution happens synchronously on whichever thread asks for it, so
/// there is no async variant.
pub trait HttpClient: fmt::Debug + Send + Sync {
    fn request(&self, request: HttpRequest) -> Result<HttpResponse, anyhow::Error>;
}

pub type DynHttpClient = Arc<dyn HttpClient + 'static>;

#[cfg(test)]
pub(crate) mod testing {
    use std::{
        collections::VecDeque,
        io::Cursor,
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
    };

    use super::*;

    /// Canned reply for a [`DummyClient`].
    #[derive(Debug, Clone)]
    pub(crate) enum Reply {
        Ok(u16, Vec<u8>),
        Fail(String),
    }

    /// A [`HttpClient`] that plays back canned replies and remembers every
    /// request it was given.
    #[derive(Debug, Default)]
    pub(crate) struct DummyClient {
        pub(crate) requests: Mutex<Vec<HttpRequest>>,
        replies: Mutex<VecDeque<Reply>>,
        pub(crate) calls: AtomicUsize,
    }

    impl DummyClient {
        pub(crate) fn with_replies(replies: impl IntoIterator<Item = Reply>) -> Self {
            DummyClient {
                requests: Mutex::new(Vec::new()),
                replies: Mutex::new(replies.into_iter().collect()),
                calls: AtomicUsize::new(0),
            }
        }

        pub(crate) fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub(crate) fn urls(&self) -> Vec<String> {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .map(|r| r.url.clone())
                .collect()
        }
    }

    impl HttpClient for DummyClient {
        fn request(&self, request: HttpRequest) -> Result<HttpResponse, anyhow::Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().unwrap().push(request);
            let reply = self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .expect("no more canned replies");

            match reply {
                Reply::Ok(status, body) => Ok(HttpResponse {
                    status,
                    status_text: status.to_string(),
                    body: Box::new(Cursor::new(body)),
                }),
                Reply::Fail(msg) => Err(anyhow::Error::msg(msg)),
            }
        }
    }
}
