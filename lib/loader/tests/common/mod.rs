#![allow(dead_code)]

use std::{
    net::SocketAddr,
    path::Path,
    sync::{Arc, Mutex},
    thread::JoinHandle,
};

use ofs_loader::{
    BoxError, Checksum, FileSystemImpl, LoaderConfig, RetryConfig, http::ReqwestHttpClient,
};
use tiny_http::{Response, Server};

pub const MOUNT: &str = "xyz-f4m123.chdfs.ap-guangzhou.myqcloud.com";

/// A local HTTP server that records every request path it sees.
pub struct TestServer {
    server: Arc<Server>,
    pub addr: SocketAddr,
    hits: Arc<Mutex<Vec<String>>>,
    worker: Option<JoinHandle<()>>,
}

impl TestServer {
    /// Start serving, answering each request with whatever `handler`
    /// returns for its path and the server's own address.
    pub fn start<F>(handler: F) -> Self
    where
        F: Fn(&str, SocketAddr) -> (u16, Vec<u8>) + Send + 'static,
    {
        let server = Arc::new(Server::http("127.0.0.1:0").unwrap());
        let addr = server.server_addr().to_ip().unwrap();
        let hits = Arc::new(Mutex::new(Vec::new()));

        let worker = {
            let server = Arc::clone(&server);
            let hits = Arc::clone(&hits);
            std::thread::spawn(move || {
                for request in server.incoming_requests() {
                    let url = request.url().to_string();
                    hits.lock().unwrap().push(url.clone());
                    let (status, body) = handler(&url, addr);
                    let _ = request.respond(Response::from_data(body).with_status_code(status));
                }
            })
        };

        TestServer {
            server,
            addr,
            hits,
            worker: Some(worker),
        }
    }

    /// How many requests had a path starting with `prefix`.
    pub fn hits(&self, prefix: &str) -> usize {
        self.hits
            .lock()
            .unwrap()
            .iter()
            .filter(|url| url.starts_with(prefix))
            .count()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.server.unblock();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

pub fn metadata_body(version: &str, addr: SocketAddr, content: &[u8]) -> Vec<u8> {
    format!(
        r#"{{"Response":{{"HadoopPluginJar":{{"VersionId":"{version}","JarPath":"http://{addr}/artifacts/ofs_plugin-{version}.so","JarMd5":"{}"}}}}}}"#,
        Checksum::of_bytes(content),
    )
    .into_bytes()
}

/// A config pointing the metadata lookup at `addr`, with no retry delays.
pub fn config(cache_dir: &Path, addr: SocketAddr) -> LoaderConfig {
    let mut config = LoaderConfig::new(1250000000, cache_dir);
    config.meta_indirection = Some(addr.to_string());
    config.meta_use_tls = false;
    config.artifact_suffix = ".so".to_string();
    config.retry = RetryConfig::without_delays();
    config
}

/// A client that ignores any proxy configured in the environment.
pub fn client() -> Arc<ReqwestHttpClient> {
    let client = reqwest::blocking::Client::builder()
        .no_proxy()
        .build()
        .unwrap();
    Arc::new(ReqwestHttpClient::from_client(client))
}

#[derive(Debug, Default)]
pub struct MemoryFs {
    pub version: &'static str,
    pub mounted: Option<String>,
}

impl FileSystemImpl for MemoryFs {
    fn version_id(&self) -> &str {
        self.version
    }

    fn initialize(&mut self, mount_point: &str) -> Result<(), BoxError> {
        self.mounted = Some(mount_point.to_string());
        Ok(())
    }
}

pub fn create_v1() -> Result<Box<dyn FileSystemImpl>, BoxError> {
    Ok(Box::new(MemoryFs {
        version: "v1",
        mounted: None,
    }))
}

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
