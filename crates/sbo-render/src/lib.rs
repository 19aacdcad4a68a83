//! Variable substitution into compose/env/volume templates, producing a
//! per-instance artifact tree on disk.
//!
//! Templates are opaque text with `${NAME}` placeholders; this crate never
//! interprets their content beyond substitution.

#![forbid(unsafe_code)]

use sbo_proto::{ErrorKind, Instance};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("required template missing: {0}")]
    TemplateMissing(String),
    #[error("substitution referenced an undefined variable: {0}")]
    UnresolvedVariable(String),
    #[error("render filesystem operation failed: {0}")]
    RenderIo(#[source] std::io::Error),
}

impl RenderError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::TemplateMissing(_) | Self::UnresolvedVariable(_) => ErrorKind::Io,
            Self::RenderIo(_) => ErrorKind::Io,
        }
    }
}

impl From<std::io::Error> for RenderError {
    fn from(e: std::io::Error) -> Self {
        Self::RenderIo(e)
    }
}

pub type Result<T> = std::result::Result<T, RenderError>;

/// Subdirectories rendered under `volumes-{id}/`.
pub const VOLUME_SUBDIRS: [&str; 6] = ["db", "functions", "logs", "api", "pooler", "storage"];

/// Layout of the template sources this renderer consumes. All paths are
/// externally supplied and treated as opaque input.
pub struct TemplateSet {
    pub compose_template: PathBuf,
    pub env_template: PathBuf,
    pub volumes_template_dir: PathBuf,
}

impl TemplateSet {
    pub fn new(template_root: &Path) -> Self {
        Self {
            compose_template: template_root.join("docker-compose.yml.template"),
            env_template: template_root.join(".env.template"),
            volumes_template_dir: template_root.join("volumes"),
        }
    }
}

/// Where the rendered artifacts for one instance are written.
pub struct RenderedPaths {
    pub compose_file: PathBuf,
    pub env_file: PathBuf,
    pub volumes_dir: PathBuf,
}

/// Build the complete substitution map for an instance (§6.4).
pub fn build_substitutions(instance: &Instance, external_host: &str) -> HashMap<String, String> {
    let c = &instance.credentials;
    let p = &instance.ports;
    let mut vars = HashMap::new();

    vars.insert("INSTANCE_ID".into(), instance.id.clone());
    vars.insert("PROJECT_NAME".into(), instance.name.clone());
    vars.insert("ORGANIZATION_NAME".into(), instance.organization.clone());
    vars.insert("POSTGRES_PASSWORD".into(), c.database_password.clone());
    vars.insert("POSTGRES_DB".into(), "postgres".into());
    vars.insert("POSTGRES_PORT".into(), "5432".into());
    vars.insert("POSTGRES_PORT_EXT".into(), p.database_external.to_string());
    vars.insert("JWT_SECRET".into(), c.signing_secret.clone());
    vars.insert("ANON_KEY".into(), c.anon_key.clone());
    vars.insert("SERVICE_ROLE_KEY".into(), c.service_role_key.clone());
    vars.insert("DASHBOARD_USERNAME".into(), c.dashboard_username.clone());
    vars.insert("DASHBOARD_PASSWORD".into(), c.dashboard_password.clone());
    vars.insert("KONG_HTTP_PORT".into(), p.gateway_http.to_string());
    vars.insert("KONG_HTTPS_PORT".into(), p.gateway_https.to_string());
    vars.insert("ANALYTICS_PORT".into(), p.analytics.to_string());
    vars.insert("EXTERNAL_IP".into(), external_host.to_string());
    vars.insert("API_EXTERNAL_URL".into(), format!("http://{external_host}:{}", p.gateway_http));
    vars.insert("SITE_URL".into(), format!("http://{external_host}:{}", p.gateway_http));
    vars.insert("SUPABASE_PUBLIC_URL".into(), format!("http://{external_host}:{}", p.gateway_http));
    vars.insert("STUDIO_DEFAULT_ORGANIZATION".into(), instance.organization.clone());
    vars.insert("STUDIO_DEFAULT_PROJECT".into(), instance.name.clone());
    vars.insert("ENABLE_EMAIL_SIGNUP".into(), "true".into());
    vars.insert("ENABLE_EMAIL_AUTOCONFIRM".into(), "true".into());
    vars.insert("ENABLE_ANONYMOUS_USERS".into(), "false".into());
    vars.insert("JWT_EXPIRY".into(), "3600".into());
    vars.insert("DISABLE_SIGNUP".into(), "false".into());
    vars.insert("SMTP_ADMIN_EMAIL".into(), format!("admin@{external_host}"));
    vars.insert("SMTP_HOST".into(), "".into());
    vars.insert("SMTP_PORT".into(), "2500".into());
    vars.insert("SMTP_USER".into(), "".into());
    vars.insert("SMTP_PASS".into(), "".into());
    vars.insert("SMTP_SENDER_NAME".into(), instance.name.clone());
    vars.insert("IMGPROXY_ENABLE_WEBP_DETECTION".into(), "true".into());
    vars.insert("FUNCTIONS_VERIFY_JWT".into(), "false".into());
    vars.insert("DOCKER_SOCKET_LOCATION".into(), "/var/run/docker.sock".into());
    vars.insert("LOGFLARE_API_KEY".into(), c.signing_secret.clone());
    vars.insert("LOGFLARE_LOGGER_BACKEND_API_KEY".into(), c.signing_secret.clone());
    vars.insert("PGRST_DB_SCHEMAS".into(), "public,storage,graphql_public".into());

    vars
}

/// Substitute every `${NAME}` occurrence in `text`. Errors with
/// `UnresolvedVariable` if a placeholder has no entry in `vars`.
pub fn substitute(text: &str, vars: &HashMap<String, String>) -> Result<String> {
    let mut out = String::with_capacity(text.len());
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' && bytes.get(i + 1) == Some(&b'{') {
            if let Some(end) = text[i + 2..].find('}') {
                let name = &text[i + 2..i + 2 + end];
                match vars.get(name) {
                    Some(value) => {
                        out.push_str(value);
                        i += 2 + end + 1;
                        continue;
                    }
                    None => return Err(RenderError::UnresolvedVariable(name.to_string())),
                }
            }
        }
        // Safe: we only ever re-slice at char boundaries found via `find`/ASCII `$`/`{`.
        let ch = text[i..].chars().next().unwrap();
        out.push(ch);
        i += ch.len_utf8();
    }
    Ok(out)
}

/// Render the full per-instance artifact tree under `data_root`.
pub fn render_instance(
    templates: &TemplateSet,
    instance: &Instance,
    external_host: &str,
    data_root: &Path,
) -> Result<RenderedPaths> {
    let vars = build_substitutions(instance, external_host);

    if !templates.compose_template.exists() {
        return Err(RenderError::TemplateMissing(
            templates.compose_template.display().to_string(),
        ));
    }
    if !templates.env_template.exists() {
        return Err(RenderError::TemplateMissing(templates.env_template.display().to_string()));
    }

    let compose_src = std::fs::read_to_string(&templates.compose_template)?;
    let compose_rendered = substitute(&compose_src, &vars)?;
    let compose_file = data_root.join(format!("docker-compose-{}.yml", instance.id));
    std::fs::write(&compose_file, compose_rendered)?;

    let env_src = std::fs::read_to_string(&templates.env_template)?;
    let env_rendered = substitute(&env_src, &vars)?;
    let env_file = data_root.join(format!(".env-{}", instance.id));
    std::fs::write(&env_file, env_rendered)?;

    let volumes_dir = data_root.join(format!("volumes-{}", instance.id));
    render_volumes_tree(&templates.volumes_template_dir, &volumes_dir, &vars)?;

    debug!(instance_id = %instance.id, "rendered configuration artifacts");

    Ok(RenderedPaths { compose_file, env_file, volumes_dir })
}

fn render_volumes_tree(template_dir: &Path, out_dir: &Path, vars: &HashMap<String, String>) -> Result<()> {
    if !template_dir.exists() {
        warn!(path = %template_dir.display(), "volumes template directory missing, creating empty skeleton");
        for sub in VOLUME_SUBDIRS {
            std::fs::create_dir_all(out_dir.join(sub))?;
        }
        return Ok(());
    }

    copy_and_substitute_dir(template_dir, out_dir, vars)
}

fn copy_and_substitute_dir(src: &Path, dst: &Path, vars: &HashMap<String, String>) -> Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let path = entry.path();
        let dst_path = dst.join(entry.file_name());
        if path.is_dir() {
            copy_and_substitute_dir(&path, &dst_path, vars)?;
        } else {
            match std::fs::read_to_string(&path) {
                Ok(content) => {
                    let rendered = substitute(&content, vars)?;
                    std::fs::write(&dst_path, rendered)?;
                }
                Err(_) => {
                    // Binary or non-UTF8 template file: copy verbatim.
                    std::fs::copy(&path, &dst_path)?;
                }
            }
        }
    }
    Ok(())
}

/// Remove the rendered tree for an instance (used by teardown/delete).
pub fn remove_rendered(data_root: &Path, instance_id: &str) -> Result<()> {
    let compose = data_root.join(format!("docker-compose-{instance_id}.yml"));
    let env = data_root.join(format!(".env-{instance_id}"));
    let volumes = data_root.join(format!("volumes-{instance_id}"));

    for path in [&compose, &env] {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
    }
    if volumes.exists() {
        std::fs::remove_dir_all(&volumes)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sbo_proto::{Credentials, DockerPaths, Instance, InstanceStatus, InstanceUrls, PortSet};

    fn sample_instance() -> Instance {
        Instance {
            id: "abc1234567".into(),
            name: "alpha".into(),
            organization: "acme".into(),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            status: InstanceStatus::Creating,
            ports: PortSet { gateway_http: 8101, gateway_https: 8401, database_external: 5501, analytics: 4101 },
            credentials: Credentials {
                database_password: "Pw1!aaaaaaaaaaaaaaaaaaaaaaaaaaa".into(),
                signing_secret: "f".repeat(64),
                anon_key: "anon.tok".into(),
                service_role_key: "service.tok".into(),
                dashboard_username: "admin".into(),
                dashboard_password: "dash-pw".into(),
            },
            docker: DockerPaths { compose_file: String::new(), env_file: String::new(), volumes_dir: String::new() },
            urls: InstanceUrls { api: String::new(), studio: String::new() },
            last_repair: None,
            last_diagnostic_at: None,
        }
    }

    #[test]
    fn test_substitute_resolves_known_variable() {
        let mut vars = HashMap::new();
        vars.insert("NAME".to_string(), "value".to_string());
        assert_eq!(substitute("hello ${NAME}!", &vars).unwrap(), "hello value!");
    }

    #[test]
    fn test_substitute_unresolved_variable_errors() {
        let vars = HashMap::new();
        let err = substitute("${MISSING}", &vars).unwrap_err();
        assert!(matches!(err, RenderError::UnresolvedVariable(name) if name == "MISSING"));
    }

    #[test]
    fn test_render_instance_missing_template() {
        let dir = tempfile::tempdir().unwrap();
        let templates = TemplateSet::new(&dir.path().join("templates"));
        let instance = sample_instance();
        let err = render_instance(&templates, &instance, "localhost", dir.path()).unwrap_err();
        assert!(matches!(err, RenderError::TemplateMissing(_)));
    }

    #[test]
    fn test_render_instance_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let template_root = dir.path().join("templates");
        std::fs::create_dir_all(template_root.join("volumes").join("db")).unwrap();
        std::fs::write(
            template_root.join("docker-compose.yml.template"),
            "project: ${PROJECT_NAME}\nport: ${KONG_HTTP_PORT}\n",
        )
        .unwrap();
        std::fs::write(template_root.join(".env.template"), "POSTGRES_PASSWORD=${POSTGRES_PASSWORD}\n").unwrap();
        std::fs::write(
            template_root.join("volumes").join("db").join("init.sql"),
            "-- jwt ${JWT_SECRET}\n",
        )
        .unwrap();

        let templates = TemplateSet::new(&template_root);
        let instance = sample_instance();
        let data_root = dir.path().join("data");
        std::fs::create_dir_all(&data_root).unwrap();

        let rendered = render_instance(&templates, &instance, "localhost", &data_root).unwrap();
        let compose = std::fs::read_to_string(&rendered.compose_file).unwrap();
        assert!(compose.contains("project: alpha"));
        assert!(compose.contains("port: 8101"));

        let env = std::fs::read_to_string(&rendered.env_file).unwrap();
        assert!(env.contains(&instance.credentials.database_password));

        let db_init = std::fs::read_to_string(rendered.volumes_dir.join("db").join("init.sql")).unwrap();
        assert!(db_init.contains(&instance.credentials.signing_secret));
    }

    #[test]
    fn test_remove_rendered_cleans_up_everything() {
        let dir = tempfile::tempdir().unwrap();
        let data_root = dir.path();
        std::fs::write(data_root.join("docker-compose-i1.yml"), "x").unwrap();
        std::fs::write(data_root.join(".env-i1"), "x").unwrap();
        std::fs::create_dir_all(data_root.join("volumes-i1").join("db")).unwrap();

        remove_rendered(data_root, "i1").unwrap();

        assert!(!data_root.join("docker-compose-i1.yml").exists());
        assert!(!data_root.join(".env-i1").exists());
        assert!(!data_root.join("volumes-i1").exists());
    }
}
