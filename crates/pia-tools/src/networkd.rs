//! systemd-networkd configuration
//!
//! Renders `<interface>.netdev` and `<interface>.network` for a registered
//! session from minijinja templates over [`UnitContext`]. Each file is
//! written next to its destination and renamed into place once its
//! contents, owner and mode are final.

use minijinja::{AutoEscape, Environment, UndefinedBehavior};
use pia_vpn::{NegotiatedParams, Session};
use serde::Serialize;
use std::borrow::Cow;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Holds the private key
pub const NETDEV_MODE: u32 = 0o640;
pub const NETWORK_MODE: u32 = 0o644;

/// A file attribute that is either left to the system or set explicitly
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Override<T> {
    #[default]
    Inherit,
    Set(T),
}

impl<T> Override<T> {
    pub fn as_set(&self) -> Option<&T> {
        match self {
            Override::Inherit => None,
            Override::Set(value) => Some(value),
        }
    }
}

impl<T> From<Option<T>> for Override<T> {
    fn from(value: Option<T>) -> Self {
        value.map_or(Override::Inherit, Override::Set)
    }
}

/// Template, ownership and permissions of one rendered file
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileSpec {
    pub template: Option<PathBuf>,
    pub owner: Override<String>,
    pub group: Override<String>,
    pub mode: Override<u32>,
}

impl FileSpec {
    /// Mode to create the file with
    fn mode_or(&self, default: u32) -> u32 {
        self.mode.as_set().copied().unwrap_or(default)
    }
}

/// networkd rendering errors
#[derive(Debug, thiserror::Error)]
pub enum NetworkdError {
    #[error("Session {0} has no negotiated tunnel parameters")]
    NotRegistered(String),

    #[error("Unknown user {0}")]
    UnknownUser(String),

    #[error("Unknown group {0}")]
    UnknownGroup(String),

    #[error("Could not render {name}: {source}")]
    Template {
        name: String,
        #[source]
        source: minijinja::Error,
    },

    #[error("Could not write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Values available to unit templates
#[derive(Debug, Clone, Serialize)]
pub struct UnitContext {
    pub interface: String,
    pub region: String,
    pub region_name: String,
    /// Certificate name of the WireGuard server
    pub server_name: String,
    pub private_key: String,
    pub public_key: String,
    pub server_key: String,
    pub server_ip: String,
    pub server_port: u16,
    pub server_vip: String,
    pub peer_ip: String,
    pub endpoint: String,
    pub dns_servers: Vec<String>,
    /// Forwarded port, if one is assigned
    pub port: Option<u16>,
}

impl UnitContext {
    pub fn new(session: &Session, params: &NegotiatedParams) -> Self {
        Self {
            interface: session.name.clone(),
            region: session.region.id.clone(),
            region_name: session.region.name.clone(),
            server_name: session
                .tunnel_server()
                .map(|server| server.cn.clone())
                .unwrap_or_default(),
            private_key: session.keys.private.to_base64(),
            public_key: session.keys.public.to_base64(),
            server_key: params.server_key.to_base64(),
            server_ip: params.server_ip.to_string(),
            server_port: params.server_port,
            server_vip: params.server_vip.to_string(),
            peer_ip: params.peer_ip.to_string(),
            endpoint: params.endpoint().to_string(),
            dns_servers: params.dns_servers.iter().map(ToString::to_string).collect(),
            port: session.forwarded_port(),
        }
    }
}

/// WireGuard device definition
pub const DEFAULT_NETDEV_TEMPLATE: &str = "\
[NetDev]
Name={{ interface }}
Kind=wireguard

[WireGuard]
PrivateKey={{ private_key }}

[WireGuardPeer]
PublicKey={{ server_key }}
AllowedIPs=0.0.0.0/0
Endpoint={{ endpoint }}
PersistentKeepalive=25
";

/// Address and routes: a link route to the server's tunnel address and
/// the default route through it
pub const DEFAULT_NETWORK_TEMPLATE: &str = "\
[Match]
Name={{ interface }}

[Network]
Address={{ peer_ip }}/32

[Route]
Destination={{ server_vip }}/32
Scope=link

[Route]
Destination=0.0.0.0/0
Gateway={{ server_vip }}
GatewayOnLink=true
Scope=global
";

/// Render one unit template; unknown variables are errors
pub fn render(name: &str, source: &str, context: &UnitContext) -> Result<String, NetworkdError> {
    let template_error = |source: minijinja::Error| NetworkdError::Template {
        name: name.to_string(),
        source,
    };

    let mut env = Environment::new();
    env.set_keep_trailing_newline(true);
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.set_auto_escape_callback(|_| AutoEscape::None);
    env.add_template(name, source).map_err(template_error)?;
    env.get_template(name)
        .and_then(|template| template.render(context))
        .map_err(template_error)
}

/// Writes the networkd pair for a session
#[derive(Debug, Clone)]
pub struct NetworkdWriter {
    dir: PathBuf,
    netdev: FileSpec,
    network: FileSpec,
}

impl NetworkdWriter {
    pub fn new(dir: impl Into<PathBuf>, netdev: FileSpec, network: FileSpec) -> Self {
        Self {
            dir: dir.into(),
            netdev,
            network,
        }
    }

    /// Render both files for `session`, named after the session
    ///
    /// Each file comes from its configured template, else from
    /// `<output>.tmpl` next to it when that exists, else from the
    /// built-in unit.
    pub async fn write(&self, session: &Session) -> Result<[PathBuf; 2], NetworkdError> {
        let params = session
            .params
            .as_ref()
            .ok_or_else(|| NetworkdError::NotRegistered(session.name.clone()))?;
        let context = UnitContext::new(session, params);

        let netdev_path = self.dir.join(format!("{}.netdev", session.name));
        let source = template_source(&self.netdev, &netdev_path, DEFAULT_NETDEV_TEMPLATE).await?;
        let netdev = render(&format!("{}.netdev", session.name), &source, &context)?;
        write_file(&netdev_path, &netdev, &self.netdev, NETDEV_MODE).await?;

        let network_path = self.dir.join(format!("{}.network", session.name));
        let source = template_source(&self.network, &network_path, DEFAULT_NETWORK_TEMPLATE).await?;
        let network = render(&format!("{}.network", session.name), &source, &context)?;
        write_file(&network_path, &network, &self.network, NETWORK_MODE).await?;

        info!(
            "Wrote {} and {}",
            netdev_path.display(),
            network_path.display()
        );
        Ok([netdev_path, network_path])
    }
}

async fn template_source(
    spec: &FileSpec,
    output: &Path,
    builtin: &'static str,
) -> Result<Cow<'static, str>, NetworkdError> {
    let read_error = |path: &Path, source: io::Error| NetworkdError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(path) = &spec.template {
        debug!("Rendering {} from {}", output.display(), path.display());
        return fs::read_to_string(path)
            .await
            .map(Cow::Owned)
            .map_err(|e| read_error(path, e));
    }

    let mut beside = output.as_os_str().to_owned();
    beside.push(".tmpl");
    let beside = PathBuf::from(beside);
    match fs::read_to_string(&beside).await {
        Ok(text) => {
            debug!("Rendering {} from {}", output.display(), beside.display());
            Ok(Cow::Owned(text))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Cow::Borrowed(builtin)),
        Err(e) => Err(read_error(&beside, e)),
    }
}

async fn write_file(
    path: &Path,
    contents: &str,
    spec: &FileSpec,
    default_mode: u32,
) -> Result<(), NetworkdError> {
    let io_error = |source: io::Error| NetworkdError::Io {
        path: path.to_path_buf(),
        source,
    };

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = dir.join(format!(".{}.tmp.{}", file_name, std::process::id()));
    let mode = spec.mode_or(default_mode);

    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(mode);

    let mut file = options.open(&tmp).await.map_err(io_error)?;
    let staged = async {
        file.write_all(contents.as_bytes()).await?;
        file.sync_all().await
    }
    .await;
    drop(file);

    let finished = match staged {
        Ok(()) => finish(&tmp, path, spec, mode).await,
        Err(e) => Err(NetworkdError::Io {
            path: tmp.clone(),
            source: e,
        }),
    };
    if finished.is_err() {
        let _ = fs::remove_file(&tmp).await;
    }
    finished
}

/// Apply ownership and mode to the staged file, then move it into place
async fn finish(tmp: &Path, path: &Path, spec: &FileSpec, mode: u32) -> Result<(), NetworkdError> {
    let io_error = |source: io::Error| NetworkdError::Io {
        path: path.to_path_buf(),
        source,
    };

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        apply_ownership(tmp, spec)?;
        // The creation mode is filtered through the umask
        fs::set_permissions(tmp, std::fs::Permissions::from_mode(mode))
            .await
            .map_err(io_error)?;
    }
    #[cfg(not(unix))]
    let _ = (spec, mode);

    fs::rename(tmp, path).await.map_err(io_error)?;
    debug!("Installed {} (mode {:o})", path.display(), mode);
    Ok(())
}

#[cfg(unix)]
fn apply_ownership(path: &Path, spec: &FileSpec) -> Result<(), NetworkdError> {
    use nix::unistd::{Group, User, chown};

    let lookup_error = |source: nix::Error| NetworkdError::Io {
        path: path.to_path_buf(),
        source: source.into(),
    };

    let uid = match spec.owner.as_set() {
        None => None,
        Some(name) => Some(
            User::from_name(name)
                .map_err(lookup_error)?
                .ok_or_else(|| NetworkdError::UnknownUser(name.clone()))?
                .uid,
        ),
    };
    let gid = match spec.group.as_set() {
        None => None,
        Some(name) => Some(
            Group::from_name(name)
                .map_err(lookup_error)?
                .ok_or_else(|| NetworkdError::UnknownGroup(name.clone()))?
                .gid,
        ),
    };

    if uid.is_some() || gid.is_some() {
        chown(path, uid, gid).map_err(lookup_error)?;
    }
    Ok(())
}
