use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use url::Url;

/// Read-through cache in front of an upstream module registry (an
/// Athens-style GOPROXY for the gomod case).
///
/// Resolvers route their native tooling through `base_url`; the adapter also
/// exposes the small HTTP surface needed to probe the proxy and to pin module
/// metadata without warming the whole mirror.
#[derive(Clone, Debug)]
pub struct RemoteProxy {
    base_url: Url,
}

/// Pinned version metadata as served by the proxy protocol.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ModuleInfo {
    #[serde(rename = "Version")]
    pub version: String,
    #[serde(rename = "Time", default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
}

impl RemoteProxy {
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .with_context(|| format!("invalid remote proxy url '{base_url}'"))?;
        Ok(Self { base_url })
    }

    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Cheap reachability check; run before handing the proxy to a resolver
    /// so a dead proxy fails fast instead of mid-resolution.
    pub fn probe(&self, timeout: Duration) -> Result<()> {
        let client = client(timeout)?;
        client
            .get(self.base_url.clone())
            .send()
            .with_context(|| format!("remote proxy {} is unreachable", self.base_url))?;
        Ok(())
    }

    /// Fetches `@v/<version>.info` for a module through the proxy.
    pub fn module_info(
        &self,
        module: &str,
        version: &str,
        timeout: Duration,
    ) -> Result<ModuleInfo> {
        let url = self.endpoint(module, &format!("@v/{version}.info"))?;
        let client = client(timeout)?;
        let info = client
            .get(url.clone())
            .send()
            .with_context(|| format!("failed to query {url}"))?
            .error_for_status()
            .with_context(|| format!("unexpected response for {url}"))?
            .json()
            .with_context(|| format!("malformed module info from {url}"))?;
        Ok(info)
    }

    /// URL of a module's source archive as served by the proxy protocol.
    pub fn zip_url(&self, module: &str, version: &str) -> Result<Url> {
        self.endpoint(module, &format!("@v/{version}.zip"))
    }

    fn endpoint(&self, module: &str, suffix: &str) -> Result<Url> {
        let escaped = escape_module_path(module);
        self.base_url
            .join(&format!("{escaped}/{suffix}"))
            .with_context(|| format!("cannot build proxy url for module '{module}'"))
    }
}

/// Case-encodes a module path per the Go module proxy protocol: every
/// uppercase letter becomes '!' followed by its lowercase form. The module
/// download cache on disk uses the same encoding.
pub fn escape_module_path(module: &str) -> String {
    let mut escaped = String::with_capacity(module.len());
    for ch in module.chars() {
        if ch.is_ascii_uppercase() {
            escaped.push('!');
            escaped.push(ch.to_ascii_lowercase());
        } else {
            escaped.push(ch);
        }
    }
    escaped
}

fn client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .user_agent(concat!("packmule/", env!("CARGO_PKG_VERSION")))
        .timeout(timeout)
        .build()
        .context("failed to build http client")
}
