use serde::Deserialize;
use std::time::Duration;
use tracing::warn;

/// Gateway port range and URL template. The range is validated at
/// allocation time, not here, so a misconfiguration surfaces as an
/// INVALID_CONFIG error on the operation that hits it.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub port_range_start: u16,
    pub port_range_end: u16,
    pub url_template: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port_range_start: 42617,
            port_range_end: 42717,
            url_template: "http://172.21.138.98:{port}".to_string(),
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port_range_start: env_parse(
                "CLAW_GATEWAY_PORT_RANGE_START",
                defaults.port_range_start,
            ),
            port_range_end: env_parse("CLAW_GATEWAY_PORT_RANGE_END", defaults.port_range_end),
            url_template: env_string("CLAW_GATEWAY_URL_TEMPLATE", &defaults.url_template),
        }
    }
}

/// Execution plane endpoint.
#[derive(Debug, Clone)]
pub struct PlaneConfig {
    pub base_url: String,
    pub requested_by: String,
}

impl Default for PlaneConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8090/internal/v1".to_string(),
            requested_by: "clawplane-control-plane".to_string(),
        }
    }
}

impl PlaneConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_url: env_string("CLAW_PLANE_BASE_URL", &defaults.base_url),
            requested_by: env_string("CLAW_PLANE_REQUESTED_BY", &defaults.requested_by),
        }
    }
}

/// One configured image preset entry, as supplied by the operator.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresetEntry {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub recommended: bool,
}

/// Image catalog: the allowed images for instance creation.
#[derive(Debug, Clone, Default)]
pub struct ImageCatalogConfig {
    pub allow_custom_image: bool,
    pub presets: Vec<PresetEntry>,
}

impl ImageCatalogConfig {
    /// Presets come in as a JSON array in CLAW_IMAGE_PRESETS. A value that
    /// does not parse is treated as no presets, with a warning.
    pub fn from_env() -> Self {
        let allow_custom_image = env_parse("CLAW_ALLOW_CUSTOM_IMAGE", false);
        let presets = match std::env::var("CLAW_IMAGE_PRESETS") {
            Ok(raw) if !raw.trim().is_empty() => {
                match serde_json::from_str::<Vec<PresetEntry>>(&raw) {
                    Ok(presets) => presets,
                    Err(error) => {
                        warn!(%error, "CLAW_IMAGE_PRESETS is not a valid preset list, ignoring");
                        Vec::new()
                    }
                }
            }
            _ => Vec::new(),
        };

        Self {
            allow_custom_image,
            presets,
        }
    }
}

/// Terminal bridge settings.
#[derive(Debug, Clone)]
pub struct TerminalConfig {
    pub docker_command: String,
    pub container_prefix: String,
    pub shell: String,
    pub process_shutdown_timeout: Duration,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            docker_command: "docker".to_string(),
            container_prefix: "funclaw".to_string(),
            shell: "/bin/sh".to_string(),
            process_shutdown_timeout: Duration::from_secs(2),
        }
    }
}

impl TerminalConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let timeout_secs: u64 = env_parse("CLAW_TERMINAL_SHUTDOWN_TIMEOUT_SECS", 2);
        Self {
            docker_command: env_string("CLAW_TERMINAL_DOCKER_COMMAND", &defaults.docker_command),
            container_prefix: env_string(
                "CLAW_TERMINAL_CONTAINER_PREFIX",
                &defaults.container_prefix,
            ),
            shell: env_string("CLAW_TERMINAL_SHELL", &defaults.shell),
            process_shutdown_timeout: Duration::from_secs(timeout_secs.max(1)),
        }
    }
}

/// Full control plane configuration, assembled once at startup.
#[derive(Debug, Clone)]
pub struct ControlPlaneConfig {
    pub listen_addr: String,
    pub gateway: GatewayConfig,
    pub plane: PlaneConfig,
    pub images: ImageCatalogConfig,
    pub terminal: TerminalConfig,
}

impl ControlPlaneConfig {
    pub fn from_env() -> Self {
        Self {
            listen_addr: env_string("CLAW_LISTEN_ADDR", "0.0.0.0:8080"),
            gateway: GatewayConfig::from_env(),
            plane: PlaneConfig::from_env(),
            images: ImageCatalogConfig::from_env(),
            terminal: TerminalConfig::from_env(),
        }
    }
}

fn env_string(name: &str, default: &str) -> String {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => value,
        _ => default.to_string(),
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(var = name, value = %raw, "unparseable environment value, using default");
                default
            }
        },
        Err(_) => default,
    }
}
