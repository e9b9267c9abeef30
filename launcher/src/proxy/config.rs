//! Reverse-proxy configuration rendering
//!
//! Routing rules are carried as structured data all the way to a single
//! rendering pass here; the rendered document is validated by the proxy
//! engine before it is ever activated. Tokens entering the document are
//! sanitized so a crafted pattern or address cannot break out of its
//! directive.

use std::fmt::Write as _;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::discovery::RouteTable;
use crate::errors::LauncherError;

/// Active routing topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyMode {
    /// Everything routes to the launcher's own interface
    Pre,

    /// Path-routed to the deployed services, with the UI sub-path still
    /// reaching the launcher
    Post,
}

/// Inputs for one rendering pass
#[derive(Debug)]
pub struct RenderParams<'a> {
    pub mode: ProxyMode,

    /// Port the proxy listens on
    pub listen_port: u16,

    /// Launcher interface address (host:port)
    pub ui_backend: &'a str,

    /// Sub-path under which the launcher stays reachable post-deployment
    pub ui_path: &'a str,

    /// Pid file the engine writes, referenced for hot reloads
    pub pid_file: &'a Path,

    /// Routing table; required in `Post` mode
    pub table: Option<&'a RouteTable>,
}

/// Render the complete proxy configuration document
pub fn render(params: &RenderParams) -> Result<String, LauncherError> {
    let ui_backend = sanitize(params.ui_backend, "launcher backend")?;
    let ui_path = sanitize(params.ui_path, "launcher path")?;

    let mut out = String::new();
    let _ = writeln!(out, "pid {};", params.pid_file.display());
    out.push_str("worker_processes 1;\n");
    out.push_str("error_log stderr warn;\n");
    out.push_str("\n");
    out.push_str("events {\n");
    out.push_str("    worker_connections 1024;\n");
    out.push_str("}\n");
    out.push_str("\n");
    out.push_str("http {\n");
    out.push_str("    access_log off;\n");
    out.push_str("\n");
    let _ = writeln!(out, "    upstream launcher_ui {{");
    let _ = writeln!(out, "        server {};", ui_backend);
    let _ = writeln!(out, "    }}");

    match params.mode {
        ProxyMode::Pre => {
            out.push_str("\n");
            let _ = writeln!(out, "    server {{");
            let _ = writeln!(out, "        listen {};", params.listen_port);
            out.push_str("\n");
            location(&mut out, "/", "launcher_ui");
            let _ = writeln!(out, "    }}");
        }
        ProxyMode::Post => {
            let table = params.table.ok_or_else(|| {
                LauncherError::ConfigInvalid("post-deployment mode requires a route table".into())
            })?;

            for (idx, route) in table.routes.iter().enumerate() {
                let backend = sanitize(&route.backend, "route backend")?;
                out.push_str("\n");
                let _ = writeln!(out, "    upstream {} {{", upstream_name(idx, &route.name));
                let _ = writeln!(out, "        server {};", backend);
                let _ = writeln!(out, "    }}");
            }
            let fallback = sanitize(&table.fallback, "fallback backend")?;
            out.push_str("\n");
            let _ = writeln!(out, "    upstream fallback_backend {{");
            let _ = writeln!(out, "        server {};", fallback);
            let _ = writeln!(out, "    }}");

            out.push_str("\n");
            let _ = writeln!(out, "    server {{");
            let _ = writeln!(out, "        listen {};", params.listen_port);
            out.push_str("\n");

            // The launcher stays reachable first, then the declared routes
            // in profile order, then the catch-all fallback. The sub-path
            // prefix is stripped on the way through so the launcher keeps
            // serving at its root.
            let ui_prefix = ui_path.trim_end_matches('/');
            let _ = writeln!(out, "        location = {} {{", ui_prefix);
            let _ = writeln!(out, "            return 302 {}/;", ui_prefix);
            let _ = writeln!(out, "        }}");
            location(&mut out, &format!("{}/", ui_prefix), "launcher_ui/");
            for (idx, route) in table.routes.iter().enumerate() {
                let pattern = sanitize(&route.pattern, "route pattern")?;
                location(&mut out, pattern, &upstream_name(idx, &route.name));
            }
            location(&mut out, "/", "fallback_backend");
            let _ = writeln!(out, "    }}");
        }
    }

    out.push_str("}\n");
    Ok(out)
}

fn location(out: &mut String, pattern: &str, upstream: &str) {
    let _ = writeln!(out, "        location {} {{", pattern);
    let _ = writeln!(out, "            proxy_pass http://{};", upstream);
    out.push_str("            proxy_http_version 1.1;\n");
    out.push_str("            proxy_set_header Host $host;\n");
    out.push_str("            proxy_set_header X-Real-IP $remote_addr;\n");
    out.push_str("            proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;\n");
    out.push_str("            proxy_set_header Upgrade $http_upgrade;\n");
    out.push_str("            proxy_set_header Connection \"upgrade\";\n");
    let _ = writeln!(out, "        }}");
}

/// Stable upstream block name for a route
fn upstream_name(idx: usize, service_name: &str) -> String {
    let slug: String = service_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("svc_{}_{}", idx, slug)
}

/// Reject tokens that could escape their directive
fn sanitize<'a>(value: &'a str, what: &str) -> Result<&'a str, LauncherError> {
    let ok = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_graphic() && !matches!(c, '{' | '}' | ';' | '"' | '\'' | '\\'));
    if ok {
        Ok(value)
    } else {
        Err(LauncherError::ConfigInvalid(format!(
            "illegal characters in {}: {:?}",
            what, value
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::Route;

    fn table() -> RouteTable {
        RouteTable {
            routes: vec![
                Route {
                    name: "api".to_string(),
                    pattern: "/api/v2".to_string(),
                    backend: "10.0.0.5:8000".to_string(),
                },
                Route {
                    name: "api-root".to_string(),
                    pattern: "/api".to_string(),
                    backend: "10.0.0.5:8001".to_string(),
                },
            ],
            fallback: "10.0.0.9:3000".to_string(),
        }
    }

    fn params(mode: ProxyMode, table: Option<&RouteTable>) -> RenderParams<'_> {
        RenderParams {
            mode,
            listen_port: 3000,
            ui_backend: "127.0.0.1:8080",
            ui_path: "/launcher",
            pid_file: Path::new("/tmp/nginx.pid"),
            table,
        }
    }

    #[test]
    fn test_render_pre_routes_everything_to_launcher() {
        let text = render(&params(ProxyMode::Pre, None)).unwrap();
        assert!(text.contains("server 127.0.0.1:8080;"));
        assert!(text.contains("location / {"));
        assert!(!text.contains("fallback_backend"));
    }

    #[test]
    fn test_render_post_orders_locations() {
        let t = table();
        let text = render(&params(ProxyMode::Post, Some(&t))).unwrap();

        let ui = text.find("location /launcher/ {").unwrap();
        let specific = text.find("location /api/v2 {").unwrap();
        let broad = text.find("location /api {").unwrap();
        let catch_all = text.rfind("location / {").unwrap();
        assert!(ui < specific && specific < broad && broad < catch_all);

        assert!(text.contains("upstream fallback_backend {"));
        assert!(text.contains("server 10.0.0.9:3000;"));
    }

    #[test]
    fn test_render_post_requires_table() {
        assert!(matches!(
            render(&params(ProxyMode::Post, None)),
            Err(LauncherError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn test_sanitize_rejects_injection() {
        let mut t = table();
        t.routes[0].backend = "10.0.0.5:8000; }\nserver {".to_string();
        assert!(matches!(
            render(&params(ProxyMode::Post, Some(&t))),
            Err(LauncherError::ConfigInvalid(_))
        ));
    }
}
