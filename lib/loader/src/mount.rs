//! Interpreting the host part of an `ofs://` URI.

use std::sync::LazyLock;

use regex::Regex;

use crate::{
    config::LoaderConfig,
    error::{ConfigError, ResolveError},
};

static FULL_FORM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([a-zA-Z0-9-]+)\.chdfs(-dualstack)?(\.inner)?\.([a-z0-9-]+)\.([a-z0-9-.]+)$")
        .expect("valid regex")
});

static BUCKET_FORM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([a-z0-9-]+)-([a-zA-Z0-9]+)$").expect("valid regex"));

/// Where the metadata service for a mount point lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataEndpoint {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

impl MetadataEndpoint {
    pub fn scheme(&self) -> &'static str {
        if self.use_tls { "https" } else { "http" }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Is this a fully qualified mount point like
/// `f4mabcdefgh-xyzw.chdfs.ap-guangzhou.myqcloud.com`?
pub fn is_full_form(addr: &str) -> bool {
    FULL_FORM.is_match(addr)
}

/// Is this a bucket-style mount point like `examplebucket-1250000000`?
pub fn is_bucket_form(addr: &str) -> bool {
    BUCKET_FORM.is_match(addr)
}

/// Work out which host to ask for plugin metadata when mounting `addr`.
pub fn metadata_endpoint(
    addr: &str,
    config: &LoaderConfig,
) -> Result<MetadataEndpoint, ResolveError> {
    let addr = if config.use_short_bucket_name && config.appid != 0 {
        format!("{addr}-{}", config.appid)
    } else {
        addr.to_string()
    };

    let mut use_tls = config.meta_use_tls;

    let host = if is_full_form(&addr) {
        addr
    } else if is_bucket_form(&addr) {
        match &config.meta_endpoint_suffix {
            Some(suffix) => {
                // the suffixed endpoints only speak plain http
                use_tls = false;
                format!("{addr}.{suffix}")
            }
            None => {
                let region = config
                    .bucket_region
                    .as_deref()
                    .ok_or(ConfigError::Missing {
                        key: "bucket_region",
                    })?;
                format!("{addr}.chdfs.{region}.myqcloud.com")
            }
        }
    } else {
        return Err(ResolveError::InvalidMountPoint { addr });
    };

    Ok(MetadataEndpoint {
        host,
        port: config.meta_server_port,
        use_tls,
    })
}
