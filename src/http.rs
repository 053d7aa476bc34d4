//! HTTP client construction for probes

use crate::Result;

/// Transport options for the probe client
#[derive(Debug, Clone, Default)]
pub struct HttpOptions {
    /// Explicit proxy for all schemes. When unset, `HTTP_PROXY`/`HTTPS_PROXY`
    /// from the environment are honoured.
    pub proxy: Option<String>,
    /// Accept any server certificate on HTTPS probes
    pub insecure_skip_tls_verify: bool,
}

/// Build the reqwest client shared by every probe in a run.
///
/// No request timeout is set; a hung endpoint stalls the run until the
/// transport gives up.
pub fn build_client(options: &HttpOptions) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder();

    if let Some(proxy) = &options.proxy {
        builder = builder.proxy(reqwest::Proxy::all(proxy)?);
    }
    if options.insecure_skip_tls_verify {
        builder = builder.danger_accept_invalid_certs(true);
    }

    Ok(builder.build()?)
}
