//! Route table and proxy activation integration tests

use std::time::Duration;

use launchpad::discovery::{build_route_table, DiscoveryOptions};
use launchpad::profile::{CommandSpec, DeploymentProfile, ServiceSpec};

fn routed_service(name: &str, path: &str, upstream: &str) -> ServiceSpec {
    ServiceSpec {
        name: name.to_string(),
        description: String::new(),
        url: format!("https://{}${{BASE_DOMAIN}}", name),
        path: Some(path.to_string()),
        upstream: Some(upstream.to_string()),
        lookup: None,
    }
}

fn profile(services: Vec<ServiceSpec>) -> DeploymentProfile {
    DeploymentProfile {
        id: "workload".to_string(),
        description: String::new(),
        heading: String::new(),
        working_dir: ".".to_string(),
        host_prefix: "studio".to_string(),
        versions: vec![],
        default_version: String::new(),
        pre_commands: vec![],
        command: CommandSpec::new(["sh", "-c", "echo deploy"]),
        uninstall_commands: vec![],
        input_fields: vec![],
        services,
    }
}

fn discovery_options() -> DiscoveryOptions {
    DiscoveryOptions {
        address_endpoint: "http://127.0.0.1:1".to_string(),
        http_timeout: Duration::from_millis(200),
        probe_timeout: Duration::from_millis(200),
        lookup_timeout: Duration::from_secs(1),
        fallback_backend: "127.0.0.1:9999".to_string(),
    }
}

#[tokio::test]
async fn test_unreachable_backends_degrade_to_fallback() {
    // Port 1 is never listening, so every probe fails
    let profile = profile(vec![
        routed_service("api", "/api", "127.0.0.1:1"),
        routed_service("dash", "/dash", "127.0.0.1:1"),
    ]);

    let (table, degraded) = build_route_table(&profile, &discovery_options()).await;

    assert!(degraded);
    assert_eq!(table.routes.len(), 2);
    for route in &table.routes {
        assert_eq!(route.backend, "127.0.0.1:9999");
    }
    assert_eq!(table.fallback, "127.0.0.1:9999");
    // Declaration order survives degradation
    assert_eq!(table.routes[0].pattern, "/api");
    assert_eq!(table.routes[1].pattern, "/dash");
}

#[tokio::test]
async fn test_reachable_backend_keeps_declared_address() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let profile = profile(vec![routed_service("api", "/api", &addr)]);
    let (table, degraded) = build_route_table(&profile, &discovery_options()).await;

    assert!(!degraded);
    assert_eq!(table.routes[0].backend, addr);
}

#[tokio::test]
async fn test_lookup_command_wins_over_static_upstream() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let mut service = routed_service("api", "/api", "127.0.0.1:1");
    service.lookup = Some(CommandSpec::new(["echo", addr.as_str()]));

    let profile = profile(vec![service]);
    let (table, degraded) = build_route_table(&profile, &discovery_options()).await;

    assert!(!degraded);
    assert_eq!(table.routes[0].backend, addr);
}

#[cfg(unix)]
mod activation {
    use std::os::unix::fs::PermissionsExt;

    use launchpad::discovery::{Route, RouteTable};
    use launchpad::errors::LauncherError;
    use launchpad::proxy::control::{ProxyController, ProxyOptions};
    use launchpad::proxy::ProxyMode;
    use launchpad::storage::layout::StorageLayout;

    /// A stand-in proxy engine that rejects any configuration mentioning
    /// `badbackend`, approximating `nginx -t` on a broken document.
    fn fake_engine(dir: &std::path::Path) -> String {
        let path = dir.join("engine.sh");
        std::fs::write(
            &path,
            "#!/bin/sh\n\
             # called as: engine.sh -t -q -c <file>\n\
             if [ \"$1\" = \"-t\" ]; then\n\
                 grep -q badbackend \"$4\" && exit 1\n\
                 exit 0\n\
             fi\n\
             exit 0\n",
        )
        .unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path.to_str().unwrap().to_string()
    }

    fn controller(dir: &std::path::Path) -> ProxyController {
        ProxyController::new(
            ProxyOptions {
                enabled: true,
                engine_binary: fake_engine(dir),
                ..Default::default()
            },
            &StorageLayout::new(dir),
        )
    }

    fn table_with_backend(backend: &str) -> RouteTable {
        RouteTable {
            routes: vec![Route {
                name: "api".to_string(),
                pattern: "/api".to_string(),
                backend: backend.to_string(),
            }],
            fallback: "127.0.0.1:9999".to_string(),
        }
    }

    #[tokio::test]
    async fn test_rejected_activation_keeps_previous_config_live() {
        let dir = tempfile::tempdir().unwrap();
        let controller = controller(dir.path());

        controller.activate(ProxyMode::Pre, None).await.unwrap();
        let before = controller.active().await.unwrap();
        assert_eq!(before.mode, ProxyMode::Pre);
        let conf_before = std::fs::read_to_string(controller.conf_path()).unwrap();

        let result = controller
            .activate(ProxyMode::Post, Some(table_with_backend("badbackend:80")))
            .await;
        assert!(matches!(result, Err(LauncherError::ConfigInvalid(_))));

        // The previous configuration is still the live one
        let after = controller.active().await.unwrap();
        assert_eq!(after.mode, ProxyMode::Pre);
        assert_eq!(after.text, before.text);
        assert_eq!(
            std::fs::read_to_string(controller.conf_path()).unwrap(),
            conf_before
        );
    }

    #[tokio::test]
    async fn test_valid_activation_switches_mode() {
        let dir = tempfile::tempdir().unwrap();
        let controller = controller(dir.path());

        controller.activate(ProxyMode::Pre, None).await.unwrap();
        controller
            .activate(ProxyMode::Post, Some(table_with_backend("127.0.0.1:8000")))
            .await
            .unwrap();

        let active = controller.active().await.unwrap();
        assert_eq!(active.mode, ProxyMode::Post);
        assert!(active.text.contains("location /api {"));
        assert!(active.text.contains("server 127.0.0.1:8000;"));

        // No candidate file lingers after a successful install
        assert!(!dir.path().join("proxy/launchpad.candidate.conf").exists());
    }
}
