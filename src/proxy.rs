//! Proxy Synchronizer
//!
//! Owns the WakeDock-managed section of the reverse proxy's Caddyfile,
//! delimited by two sentinel marker lines, and pushes the file to the proxy's
//! admin API. Operator-authored configuration outside the markers is never
//! touched.
//!
//! Two synchronization paths exist on purpose: [`ProxySynchronizer::add_route`]
//! and [`ProxySynchronizer::remove_route`] are a fast path over the admin
//! API's incremental route endpoints, while [`ProxySynchronizer::sync`]
//! (regenerate the managed section + reload) is the authoritative path and
//! always runs after an exposure-changing transition. The fast path may fail
//! or be lost on proxy restart; the authoritative path is idempotent and
//! crash-safe because the route set is recomputed from the registry every
//! time.

use crate::config::ProxyConfig;
use crate::service::ProxyRoute;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Start sentinel of the managed section
pub const MANAGED_START: &str = "# === WAKEDOCK MANAGED SERVICES START ===";
/// End sentinel of the managed section
pub const MANAGED_END: &str = "# === WAKEDOCK MANAGED SERVICES END ===";

const EMPTY_SECTION_NOTE: &str = "# (no running services with a domain)";

/// Keeps the proxy's on-disk configuration and live state in step with the
/// set of exposed services
pub struct ProxySynchronizer {
    config_path: PathBuf,
    admin_url: String,
    client: reqwest::Client,
}

impl ProxySynchronizer {
    pub fn new(config: &ProxyConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.admin_timeout())
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build proxy admin HTTP client: {}", e))?;

        Ok(Self {
            config_path: config.config_path.clone(),
            admin_url: config.admin_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    /// Path of the managed configuration file
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Make sure a configuration file with a managed section exists
    ///
    /// A missing file gets the complete default template; an existing file
    /// without markers gets an empty managed section appended rather than
    /// being overwritten.
    pub fn ensure_base_config(&self) -> anyhow::Result<()> {
        if !self.config_path.exists() {
            info!(path = %self.config_path.display(), "Writing default proxy configuration");
            write_atomic(&self.config_path, &default_base_config())?;
            return Ok(());
        }

        let content = std::fs::read_to_string(&self.config_path)?;
        if !content.contains(MANAGED_START) {
            info!(
                path = %self.config_path.display(),
                "Existing proxy configuration has no managed section, appending one"
            );
            let mut patched = content;
            if !patched.ends_with('\n') {
                patched.push('\n');
            }
            patched.push('\n');
            patched.push_str(&render_managed_section(&[]));
            write_atomic(&self.config_path, &patched)?;
        }

        Ok(())
    }

    /// Rewrite the managed section from the given route set
    pub fn regenerate_for(&self, routes: &[ProxyRoute]) -> anyhow::Result<()> {
        self.ensure_base_config()?;

        let content = std::fs::read_to_string(&self.config_path)?;
        let section = render_managed_section(routes);
        let updated = replace_managed_section(&content, &section);
        write_atomic(&self.config_path, &updated)?;

        debug!(
            routes = routes.len(),
            path = %self.config_path.display(),
            "Regenerated managed proxy section"
        );
        Ok(())
    }

    /// Push the on-disk configuration to the proxy's admin endpoint
    ///
    /// Returns whether the reload was applied. An unreachable admin endpoint
    /// aborts quietly (the proxy may simply not be up yet); all failures are
    /// logged, never raised.
    pub async fn reload(&self) -> bool {
        // Reachability probe first; a dead proxy is not an error condition
        let probe = self
            .client
            .get(format!("{}/config/", self.admin_url))
            .send()
            .await;
        if probe.is_err() {
            debug!(admin_url = %self.admin_url, "Proxy admin endpoint unreachable, skipping reload");
            return false;
        }

        let content = match std::fs::read_to_string(&self.config_path) {
            Ok(content) => content,
            Err(e) => {
                warn!(path = %self.config_path.display(), error = %e, "Cannot read proxy configuration for reload");
                return false;
            }
        };

        match self
            .client
            .post(format!("{}/load", self.admin_url))
            .header("Content-Type", "text/caddyfile")
            .body(content)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {
                info!("Proxy configuration reloaded");
                true
            }
            Ok(response) => {
                warn!(status = %response.status(), "Proxy rejected configuration reload");
                false
            }
            Err(e) => {
                warn!(error = %e, "Proxy reload request failed");
                false
            }
        }
    }

    /// Regenerate the managed section and reload the proxy
    ///
    /// This is the authoritative synchronization path; callers run it after
    /// every exposure-changing transition regardless of the fast path's
    /// outcome.
    pub async fn sync(&self, routes: &[ProxyRoute]) -> anyhow::Result<()> {
        self.regenerate_for(routes)?;
        self.reload().await;
        Ok(())
    }

    /// Fast path: push one route through the admin API
    ///
    /// Failures are logged and ignored; the authoritative path supersedes
    /// this call.
    pub async fn add_route(&self, route: &ProxyRoute) {
        let route_id = admin_route_id(&route.service_id);

        // Drop any previous incarnation so repeated adds stay idempotent
        let _ = self
            .client
            .delete(format!("{}/id/{}", self.admin_url, route_id))
            .send()
            .await;

        let payload = serde_json::json!({
            "@id": route_id,
            "match": [{ "host": [route.domain] }],
            "handle": [{
                "handler": "reverse_proxy",
                "upstreams": [{ "dial": route.upstream }],
            }],
        });

        match self
            .client
            .post(format!(
                "{}/config/apps/http/servers/srv0/routes",
                self.admin_url
            ))
            .json(&payload)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {
                debug!(domain = %route.domain, "Added proxy route (fast path)");
            }
            Ok(response) => {
                debug!(
                    domain = %route.domain,
                    status = %response.status(),
                    "Incremental route add rejected, full regeneration will reconcile"
                );
            }
            Err(e) => {
                debug!(
                    domain = %route.domain,
                    error = %e,
                    "Incremental route add failed, full regeneration will reconcile"
                );
            }
        }
    }

    /// Fast path: remove one route through the admin API
    pub async fn remove_route(&self, service_id: &str) {
        let route_id = admin_route_id(service_id);
        match self
            .client
            .delete(format!("{}/id/{}", self.admin_url, route_id))
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {
                debug!(service = service_id, "Removed proxy route (fast path)");
            }
            Ok(_) | Err(_) => {
                debug!(
                    service = service_id,
                    "Incremental route removal failed, full regeneration will reconcile"
                );
            }
        }
    }
}

/// Admin-API id of a service's incremental route
fn admin_route_id(service_id: &str) -> String {
    format!("wakedock-{}", service_id)
}

/// The one canonical base template: listener with an API passthrough, a
/// health endpoint, and an empty managed section
pub fn default_base_config() -> String {
    format!(
        "# Caddyfile managed by wakedock.\n\
         # Everything between the managed markers is rewritten on every\n\
         # synchronization; edits outside them are preserved.\n\
         \n\
         (wakedock_auth) {{\n\
         \tbasicauth {{\n\
         \t\t{{$WAKEDOCK_AUTH_USER}} {{$WAKEDOCK_AUTH_HASH}}\n\
         \t}}\n\
         }}\n\
         \n\
         http://localhost {{\n\
         \thandle /healthz {{\n\
         \t\trespond \"OK\" 200\n\
         \t}}\n\
         \thandle /api/* {{\n\
         \t\treverse_proxy 127.0.0.1:5000\n\
         \t}}\n\
         }}\n\
         \n\
         {}",
        render_managed_section(&[])
    )
}

/// Render one site block for an exposed service
pub fn render_route_block(route: &ProxyRoute) -> String {
    let address = if route.tls {
        route.domain.clone()
    } else {
        format!("http://{}", route.domain)
    };

    let mut block = format!("# service: {}\n{} {{\n", route.service_id, address);
    if route.auth {
        block.push_str("\timport wakedock_auth\n");
    }
    block.push_str(&format!(
        "\treverse_proxy {} {{\n\t\thealth_uri /health\n\t}}\n}}\n",
        route.upstream
    ));
    block
}

/// Render the complete managed section, markers included
pub fn render_managed_section(routes: &[ProxyRoute]) -> String {
    let mut section = String::new();
    section.push_str(MANAGED_START);
    section.push('\n');

    if routes.is_empty() {
        section.push_str(EMPTY_SECTION_NOTE);
        section.push('\n');
    } else {
        for route in routes {
            section.push_str(&render_route_block(route));
        }
    }

    section.push_str(MANAGED_END);
    section.push('\n');
    section
}

/// Replace everything between the markers with `section` (which carries its
/// own markers); content outside them is preserved byte for byte. A file
/// without markers gets the section appended.
pub fn replace_managed_section(content: &str, section: &str) -> String {
    let (Some(start), Some(end)) = (content.find(MANAGED_START), content.find(MANAGED_END)) else {
        let mut patched = content.to_string();
        if !patched.is_empty() && !patched.ends_with('\n') {
            patched.push('\n');
        }
        patched.push_str(section);
        return patched;
    };

    let after = content[end..]
        .find('\n')
        .map(|i| end + i + 1)
        .unwrap_or(content.len());

    let mut updated = String::with_capacity(content.len() + section.len());
    updated.push_str(&content[..start]);
    updated.push_str(section);
    updated.push_str(&content[after..]);
    updated
}

/// Extract the managed section (markers included), if present
pub fn extract_managed_section(content: &str) -> Option<String> {
    let start = content.find(MANAGED_START)?;
    let end = content.find(MANAGED_END)?;
    let after = content[end..]
        .find('\n')
        .map(|i| end + i + 1)
        .unwrap_or(content.len());
    Some(content[start..after].to_string())
}

/// Write a file via a temp file in the same directory plus an atomic rename,
/// so a crash mid-write can never leave the proxy with a half-written file
fn write_atomic(path: &Path, content: &str) -> anyhow::Result<()> {
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
    let mut tmp = match dir {
        Some(dir) => tempfile::NamedTempFile::new_in(dir)?,
        None => tempfile::NamedTempFile::new()?,
    };
    tmp.write_all(content.as_bytes())?;
    tmp.flush()?;
    tmp.persist(path)
        .map_err(|e| anyhow::anyhow!("Failed to replace '{}': {}", path.display(), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyConfig;

    fn route(id: &str, domain: &str, port: u16) -> ProxyRoute {
        ProxyRoute {
            service_id: id.to_string(),
            domain: domain.to_string(),
            upstream: format!("127.0.0.1:{}", port),
            tls: true,
            auth: false,
        }
    }

    fn synchronizer_at(dir: &Path) -> ProxySynchronizer {
        let config = ProxyConfig {
            admin_url: "http://127.0.0.1:1".to_string(), // nothing listens here
            config_path: dir.join("Caddyfile"),
            admin_timeout_secs: 1,
        };
        ProxySynchronizer::new(&config).unwrap()
    }

    #[test]
    fn test_render_route_block() {
        let block = render_route_block(&route("api1", "api.example.com", 8080));
        assert!(block.contains("api.example.com {"));
        assert!(block.contains("reverse_proxy 127.0.0.1:8080"));
        assert!(block.contains("health_uri /health"));
        assert!(!block.contains("http://"));
        assert!(!block.contains("import wakedock_auth"));
    }

    #[test]
    fn test_render_route_block_plain_http_and_auth() {
        let mut r = route("web1", "web.example.com", 3000);
        r.tls = false;
        r.auth = true;
        let block = render_route_block(&r);
        assert!(block.contains("http://web.example.com {"));
        assert!(block.contains("import wakedock_auth"));
    }

    #[test]
    fn test_managed_section_exactness() {
        let routes = vec![
            route("api1", "api.example.com", 8080),
            route("web1", "web.example.com", 3000),
        ];
        let section = render_managed_section(&routes);
        assert!(section.starts_with(MANAGED_START));
        assert!(section.trim_end().ends_with(MANAGED_END));
        assert_eq!(section.matches("reverse_proxy").count(), 2);

        let empty = render_managed_section(&[]);
        assert!(empty.contains(EMPTY_SECTION_NOTE));
        assert!(!empty.contains("reverse_proxy"));
    }

    #[test]
    fn test_replace_preserves_operator_content() {
        let operator = "# my proxy\nexample.org {\n\trespond \"hi\"\n}\n\n";
        let content = format!("{}{}", operator, render_managed_section(&[]));

        let section = render_managed_section(&[route("api1", "api.example.com", 8080)]);
        let updated = replace_managed_section(&content, &section);

        assert!(updated.starts_with(operator));
        assert!(updated.contains("api.example.com"));
        assert!(!updated.contains(EMPTY_SECTION_NOTE));
    }

    #[test]
    fn test_replace_is_stable_under_repeated_application() {
        let section = render_managed_section(&[route("api1", "api.example.com", 8080)]);
        let once = replace_managed_section(&default_base_config(), &section);
        let twice = replace_managed_section(&once, &section);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_replace_appends_when_markers_missing() {
        let operator = "example.org {\n\trespond \"hi\"\n}";
        let section = render_managed_section(&[]);
        let updated = replace_managed_section(operator, &section);
        assert!(updated.starts_with(operator));
        assert!(updated.contains(MANAGED_START));
    }

    #[test]
    fn test_round_trip_extraction() {
        let routes = vec![
            route("api1", "api.example.com", 8080),
            route("web1", "web.example.com", 3000),
        ];
        let section = render_managed_section(&routes);
        let file = replace_managed_section(&default_base_config(), &section);
        assert_eq!(extract_managed_section(&file).unwrap(), section);
    }

    #[test]
    fn test_ensure_base_config_creates_default() {
        let dir = tempfile::tempdir().unwrap();
        let sync = synchronizer_at(dir.path());

        sync.ensure_base_config().unwrap();
        let content = std::fs::read_to_string(sync.config_path()).unwrap();
        assert!(content.contains(MANAGED_START));
        assert!(content.contains("/healthz"));
        assert!(content.contains("wakedock_auth"));

        // Idempotent on a second call
        sync.ensure_base_config().unwrap();
        assert_eq!(std::fs::read_to_string(sync.config_path()).unwrap(), content);
    }

    #[test]
    fn test_ensure_base_config_appends_markers_to_operator_file() {
        let dir = tempfile::tempdir().unwrap();
        let sync = synchronizer_at(dir.path());
        std::fs::write(sync.config_path(), "example.org {\n\trespond \"hi\"\n}\n").unwrap();

        sync.ensure_base_config().unwrap();
        let content = std::fs::read_to_string(sync.config_path()).unwrap();
        assert!(content.starts_with("example.org {"));
        assert!(content.contains(MANAGED_START));
    }

    #[test]
    fn test_regenerate_for_writes_exact_route_set() {
        let dir = tempfile::tempdir().unwrap();
        let sync = synchronizer_at(dir.path());

        let routes = vec![route("api1", "api.example.com", 8080)];
        sync.regenerate_for(&routes).unwrap();
        let content = std::fs::read_to_string(sync.config_path()).unwrap();
        assert!(content.contains("api.example.com"));

        // Shrinking the route set removes the block
        sync.regenerate_for(&[]).unwrap();
        let content = std::fs::read_to_string(sync.config_path()).unwrap();
        assert!(!content.contains("api.example.com"));
        assert!(content.contains(EMPTY_SECTION_NOTE));
    }

    #[tokio::test]
    async fn test_reload_aborts_quietly_when_proxy_unreachable() {
        let dir = tempfile::tempdir().unwrap();
        let sync = synchronizer_at(dir.path());
        sync.ensure_base_config().unwrap();

        assert!(!sync.reload().await);
    }

    #[tokio::test]
    async fn test_sync_succeeds_without_reachable_proxy() {
        let dir = tempfile::tempdir().unwrap();
        let sync = synchronizer_at(dir.path());

        sync.sync(&[route("api1", "api.example.com", 8080)])
            .await
            .unwrap();
        let content = std::fs::read_to_string(sync.config_path()).unwrap();
        assert!(content.contains("api.example.com"));
    }
}
