use std::{
    collections::BTreeMap,
    fs,
    net::IpAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;

use crate::aefrp::{
    identity::Fingerprint,
    tunnel::portmap::{PortMap, PortMapEntry},
};

pub const CONFIG_ENV: &str = "AEFRP_CONFIG";

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy)]
pub enum ConfigPathSource {
    Flag,
    Env,
    Cwd,
    Default,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Env => write!(f, "env"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
            ConfigPathSource::Default => write!(f, "default"),
        }
    }
}

pub fn resolve_config_path(
    explicit_flag_path: Option<PathBuf>,
) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = explicit_flag_path {
        let p = normalize_explicit_path(&p)?;
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Flag,
        });
    }

    if let Some(p) = std::env::var_os(CONFIG_ENV) {
        if !p.is_empty() {
            let p = normalize_explicit_path(Path::new(&p))?;
            return Ok(ResolvedConfigPath {
                path: p,
                source: ConfigPathSource::Env,
            });
        }
    }

    if let Ok(p) = discover_config_path(Path::new(".")) {
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Cwd,
        });
    }

    Ok(ResolvedConfigPath {
        path: default_config_path()?,
        source: ConfigPathSource::Default,
    })
}

fn normalize_explicit_path(p: &Path) -> anyhow::Result<PathBuf> {
    let p = p.to_path_buf();

    if p.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    if let Ok(m) = fs::metadata(&p) {
        if m.is_dir() {
            if let Ok(discovered) = discover_config_path(&p) {
                return Ok(discovered);
            }
            return Ok(p.join("aefrp.toml"));
        }
        return Ok(p);
    }

    // Non-existent path: default to .toml if no extension.
    let mut out = p;
    if out.extension().is_none() {
        out.set_extension("toml");
    }
    Ok(out)
}

fn discover_config_path(dir: &Path) -> anyhow::Result<PathBuf> {
    for c in ["aefrp.toml", "aefrp.yaml", "aefrp.yml"] {
        let p = dir.join(c);
        if fs::metadata(&p).is_ok_and(|m| m.is_file()) {
            return Ok(p);
        }
    }
    anyhow::bail!("config: no aefrp.* found")
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        return Ok(PathBuf::from("/etc/aefrp/aefrp.toml"));
    }

    #[cfg(not(target_os = "linux"))]
    {
        let proj = directories::ProjectDirs::from("net", "aefrp", "aefrp")
            .context("config: resolve user config dir")?;
        Ok(proj.config_dir().join("aefrp.toml"))
    }
}

/// Writes a runnable template at `path` unless a file is already there.
/// Returns true when the file was created.
pub fn ensure_config_file(path: &Path) -> anyhow::Result<bool> {
    if path.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    match fs::metadata(path) {
        Ok(m) => {
            if m.is_file() {
                return Ok(false);
            }
            anyhow::bail!(
                "config: {} exists but is not a regular file",
                path.display()
            );
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).with_context(|| format!("config: stat {}", path.display())),
    }

    let tmpl = default_config_template_for_path(path)?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("config: mkdir {}", parent.display()))?;
        }
    }

    let mut opts = fs::OpenOptions::new();
    opts.write(true).create_new(true);
    let mut f = opts
        .open(path)
        .with_context(|| format!("config: create {}", path.display()))?;
    use std::io::Write;
    f.write_all(tmpl.as_bytes())
        .with_context(|| format!("config: write {}", path.display()))?;
    Ok(true)
}

fn default_config_template_for_path(path: &Path) -> anyhow::Result<&'static str> {
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    match ext.as_str() {
        "toml" => Ok(DEFAULT_CONFIG_TEMPLATE_TOML),
        "yaml" | "yml" => Ok(DEFAULT_CONFIG_TEMPLATE_YAML),
        _ => anyhow::bail!(
            "config: unsupported config extension {:?} (expected .toml or .yaml/.yml)",
            path.extension()
        ),
    }
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let fc: FileConfig = match ext.as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?
        }
        _ => anyhow::bail!("config: unsupported config extension {}", ext),
    };

    Config::from_file_config(fc, path)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub admin_addr: String,
    pub identity: IdentityConfig,
    pub logging: LoggingConfig,
    pub relay: Option<RelayConfig>,
    pub host: Option<HostConfig>,
    pub client: Option<ClientConfig>,
}

#[derive(Debug, Clone)]
pub struct IdentityConfig {
    /// PEM key file, resolved against the config file's directory.
    pub key_file: PathBuf,
    /// Inline PEM; wins over `key_file` when set.
    pub private_key: Option<String>,
    pub nickname: String,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: String,
    pub transport: String,
    pub motd: String,
    pub handshake_timeout: Duration,
    pub idle_timeout: Duration,
    pub endpoint_whitelist: Vec<Fingerprint>,
    pub host_whitelist: Vec<Fingerprint>,
    pub remote_rooms: Vec<RemoteRoomConfig>,
}

#[derive(Debug, Clone)]
pub struct RemoteRoomConfig {
    pub fingerprint: Fingerprint,
    pub host_addr: String,
    pub transport: String,
}

#[derive(Debug, Clone)]
pub struct HostConfig {
    pub room_name: String,
    pub motd: String,
    /// Listen address for clients connecting without a relay; empty disables it.
    pub direct_listen: String,
    /// Relay to publish the room on; empty disables the uplink.
    pub relay_addr: String,
    pub relay_fingerprint: Option<Fingerprint>,
    pub transport: String,
    pub idle_timeout: Duration,
    pub ports: PortMap,
    /// Display name to fingerprint.
    pub whitelist: BTreeMap<String, Fingerprint>,
    pub blacklist: Vec<Fingerprint>,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_addr: String,
    pub room: Fingerprint,
    pub relay_fingerprint: Option<Fingerprint>,
    pub transport: String,
    pub bind_addr: IpAddr,
    pub dial_timeout: Duration,
    pub idle_timeout: Duration,
    /// `(label or port, local port)`.
    pub ports: Vec<(String, u16)>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    #[serde(default)]
    admin_addr: String,

    identity: Option<FileIdentity>,

    logging: Option<FileLogging>,

    relay: Option<FileRelay>,

    host: Option<FileHost>,

    client: Option<FileClient>,
}

#[derive(Debug, Deserialize)]
struct FileIdentity {
    key_file: Option<String>,
    private_key: Option<String>,
    nickname: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

#[derive(Debug, Deserialize)]
struct FileRelay {
    listen_addr: Option<String>,
    transport: Option<String>,
    motd: Option<String>,
    handshake_timeout_ms: Option<i64>,
    idle_timeout_ms: Option<i64>,
    #[serde(default)]
    endpoint_whitelist: Vec<String>,
    #[serde(default)]
    host_whitelist: Vec<String>,
    #[serde(default)]
    remote_rooms: Vec<FileRemoteRoom>,
}

#[derive(Debug, Deserialize)]
struct FileRemoteRoom {
    fingerprint: String,
    host_addr: String,
    transport: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileHost {
    room_name: Option<String>,
    motd: Option<String>,
    direct_listen: Option<String>,
    relay_addr: Option<String>,
    relay_fingerprint: Option<String>,
    transport: Option<String>,
    idle_timeout_ms: Option<i64>,
    #[serde(default)]
    ports: Vec<FileHostPort>,
    #[serde(default)]
    whitelist: BTreeMap<String, String>,
    #[serde(default)]
    blacklist: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct FileHostPort {
    port: u16,
    label: Option<String>,
    #[serde(default)]
    udp: bool,
    target: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileClient {
    server_addr: String,
    room: String,
    relay_fingerprint: Option<String>,
    transport: Option<String>,
    bind_addr: Option<String>,
    dial_timeout_ms: Option<i64>,
    idle_timeout_ms: Option<i64>,
    #[serde(default)]
    ports: Vec<FileClientPort>,
}

#[derive(Debug, Deserialize)]
struct FileClientPort {
    label: Option<String>,
    port: Option<u16>,
    local_port: u16,
}

fn trimmed(s: Option<String>) -> String {
    s.unwrap_or_default().trim().to_string()
}

fn transport_name(s: Option<String>) -> String {
    let t = trimmed(s).to_ascii_lowercase();
    if t.is_empty() { "tcp".to_string() } else { t }
}

fn millis(v: Option<i64>, default_ms: u64) -> Duration {
    match v {
        Some(ms) if ms > 0 => Duration::from_millis(ms as u64),
        _ => Duration::from_millis(default_ms),
    }
}

fn fingerprint(what: &str, s: &str) -> anyhow::Result<Fingerprint> {
    Fingerprint::parse_hex(s).with_context(|| format!("config: {what}: bad fingerprint {s:?}"))
}

fn fingerprints(what: &str, list: &[String]) -> anyhow::Result<Vec<Fingerprint>> {
    list.iter()
        .filter(|s| !s.trim().is_empty())
        .map(|s| fingerprint(what, s))
        .collect()
}

fn optional_fingerprint(what: &str, s: Option<String>) -> anyhow::Result<Option<Fingerprint>> {
    let s = trimmed(s);
    if s.is_empty() {
        return Ok(None);
    }
    fingerprint(what, &s).map(Some)
}

impl Config {
    fn from_file_config(fc: FileConfig, config_path: &Path) -> anyhow::Result<Config> {
        let base = config_path.parent().unwrap_or(Path::new("."));

        // --- Identity ---
        let id = fc.identity.unwrap_or(FileIdentity {
            key_file: None,
            private_key: None,
            nickname: None,
        });
        let key_file = {
            let k = trimmed(id.key_file);
            let k = if k.is_empty() { "aefrp.key".to_string() } else { k };
            let p = PathBuf::from(k);
            if p.is_absolute() { p } else { base.join(p) }
        };
        let identity = IdentityConfig {
            key_file,
            private_key: id.private_key.filter(|s| !s.trim().is_empty()),
            nickname: trimmed(id.nickname),
        };

        // --- Logging ---
        let mut logging = LoggingConfig {
            level: "info".into(),
            format: "json".into(),
            output: "stderr".into(),
            add_source: false,
        };
        if let Some(l) = fc.logging {
            if let Some(level) = l.level.filter(|s| !s.trim().is_empty()) {
                logging.level = level.trim().to_string();
            }
            if let Some(fmt) = l.format.filter(|s| !s.trim().is_empty()) {
                logging.format = fmt.trim().to_string();
            }
            if let Some(out) = l.output.filter(|s| !s.trim().is_empty()) {
                logging.output = out.trim().to_string();
            }
            logging.add_source = l.add_source;
        }

        // --- Relay ---
        let relay = match fc.relay {
            None => None,
            Some(r) => {
                let mut remote_rooms = Vec::with_capacity(r.remote_rooms.len());
                for (i, rr) in r.remote_rooms.into_iter().enumerate() {
                    let host_addr = rr.host_addr.trim().to_string();
                    if host_addr.is_empty() {
                        anyhow::bail!("config: relay.remote_rooms[{i}] missing host_addr");
                    }
                    remote_rooms.push(RemoteRoomConfig {
                        fingerprint: fingerprint(&format!("relay.remote_rooms[{i}]"), &rr.fingerprint)?,
                        host_addr,
                        transport: transport_name(rr.transport),
                    });
                }
                let listen_addr = trimmed(r.listen_addr);
                Some(RelayConfig {
                    listen_addr: if listen_addr.is_empty() { ":7000".into() } else { listen_addr },
                    transport: transport_name(r.transport),
                    motd: trimmed(r.motd),
                    handshake_timeout: millis(r.handshake_timeout_ms, 10_000),
                    idle_timeout: millis(r.idle_timeout_ms, 90_000),
                    endpoint_whitelist: fingerprints("relay.endpoint_whitelist", &r.endpoint_whitelist)?,
                    host_whitelist: fingerprints("relay.host_whitelist", &r.host_whitelist)?,
                    remote_rooms,
                })
            }
        };

        // --- Host ---
        let host = match fc.host {
            None => None,
            Some(h) => {
                let entries = h
                    .ports
                    .into_iter()
                    .map(|p| {
                        PortMapEntry::new(p.port, p.label, p.udp).with_target(trimmed(p.target))
                    })
                    .collect();
                let ports = PortMap::new(entries).context("config: host.ports")?;
                let mut whitelist = BTreeMap::new();
                for (name, hex) in &h.whitelist {
                    whitelist.insert(
                        name.trim().to_string(),
                        fingerprint(&format!("host.whitelist.{name}"), hex)?,
                    );
                }
                let direct_listen = trimmed(h.direct_listen);
                let relay_addr = trimmed(h.relay_addr);
                if direct_listen.is_empty() && relay_addr.is_empty() {
                    anyhow::bail!("config: host needs direct_listen and/or relay_addr");
                }
                let room_name = trimmed(h.room_name);
                Some(HostConfig {
                    room_name: if room_name.is_empty() { "aefrp".into() } else { room_name },
                    motd: trimmed(h.motd),
                    direct_listen,
                    relay_addr,
                    relay_fingerprint: optional_fingerprint("host.relay_fingerprint", h.relay_fingerprint)?,
                    transport: transport_name(h.transport),
                    idle_timeout: millis(h.idle_timeout_ms, 90_000),
                    ports,
                    whitelist,
                    blacklist: fingerprints("host.blacklist", &h.blacklist)?,
                })
            }
        };

        // --- Client ---
        let client = match fc.client {
            None => None,
            Some(c) => {
                let server_addr = c.server_addr.trim().to_string();
                if server_addr.is_empty() {
                    anyhow::bail!("config: client.server_addr is required");
                }
                let bind = trimmed(c.bind_addr);
                let bind_addr = if bind.is_empty() {
                    IpAddr::from([127, 0, 0, 1])
                } else {
                    bind.parse()
                        .with_context(|| format!("config: client.bind_addr {bind:?} is not an IP"))?
                };
                let mut ports = Vec::with_capacity(c.ports.len());
                for (i, p) in c.ports.into_iter().enumerate() {
                    let key = match (p.label.filter(|l| !l.trim().is_empty()), p.port) {
                        (Some(l), _) => l.trim().to_string(),
                        (None, Some(port)) => port.to_string(),
                        (None, None) => anyhow::bail!("config: client.ports[{i}] needs label or port"),
                    };
                    ports.push((key, p.local_port));
                }
                Some(ClientConfig {
                    server_addr,
                    room: fingerprint("client.room", &c.room)?,
                    relay_fingerprint: optional_fingerprint("client.relay_fingerprint", c.relay_fingerprint)?,
                    transport: transport_name(c.transport),
                    bind_addr,
                    dial_timeout: millis(c.dial_timeout_ms, 5_000),
                    idle_timeout: millis(c.idle_timeout_ms, 30_000),
                    ports,
                })
            }
        };

        if relay.is_none() && host.is_none() && client.is_none() {
            anyhow::bail!("config: nothing to run (set [relay], [host] and/or [client])");
        }

        Ok(Config {
            admin_addr: fc.admin_addr.trim().to_string(),
            identity,
            logging,
            relay,
            host,
            client,
        })
    }
}

const DEFAULT_CONFIG_TEMPLATE_TOML: &str = r#"# aefrp configuration (auto-generated)
#
# This file was created because aefrp could not find a configuration file at the
# resolved config path. As generated it runs a public relay; add a [host] section to
# publish a room, or a [client] section to join one.

admin_addr = ":8080"

[identity]
key_file = "aefrp.key"
nickname = ""

[logging]
level = "info"
format = "json"
output = "stderr"
add_source = false

[relay]
listen_addr = ":7000"
transport = "tcp" # tcp | kcp
handshake_timeout_ms = 10000
idle_timeout_ms = 90000
endpoint_whitelist = []
host_whitelist = []

# [host]
# room_name = "my room"
# motd = "welcome"
# relay_addr = "relay.example.com:7000"
# direct_listen = ""
#
# [[host.ports]]
# port = 25565
# label = "minecraft"
# udp = false
# target = "127.0.0.1:25565"
#
# [client]
# server_addr = "relay.example.com:7000"
# room = "<host fingerprint>"
# bind_addr = "127.0.0.1"
"#;

const DEFAULT_CONFIG_TEMPLATE_YAML: &str = r#"# aefrp configuration (auto-generated)
#
# This file was created because aefrp could not find a configuration file at the
# resolved config path. As generated it runs a public relay; add a host section to
# publish a room, or a client section to join one.

admin_addr: ":8080"

identity:
  key_file: "aefrp.key"
  nickname: ""

logging:
  level: "info"
  format: "json"
  output: "stderr"
  add_source: false

relay:
  listen_addr: ":7000"
  transport: "tcp" # tcp | kcp
  handshake_timeout_ms: 10000
  idle_timeout_ms: 90000
  endpoint_whitelist: []
  host_whitelist: []
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        p.push(format!(
            "aefrp_cfg_test_{name}_{}_{}",
            std::process::id(),
            now
        ));
        std::fs::create_dir_all(&p).expect("mkdir");
        p
    }

    fn hex(b: u8) -> String {
        Fingerprint::from_bytes([b; 32]).to_string()
    }

    #[test]
    fn generated_templates_are_runnable() {
        let dir = temp_dir("templates");
        for name in ["aefrp.toml", "aefrp.yaml"] {
            let path = dir.join(name);
            assert!(ensure_config_file(&path).unwrap());
            assert!(!ensure_config_file(&path).unwrap());
            let cfg = load_config(&path).unwrap();
            let relay = cfg.relay.expect("relay section");
            assert_eq!(relay.listen_addr, ":7000");
            assert_eq!(relay.idle_timeout, Duration::from_secs(90));
            assert_eq!(cfg.identity.key_file, dir.join("aefrp.key"));
        }
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn host_and_client_sections() {
        let dir = temp_dir("roles");
        let cfg_path = dir.join("aefrp.toml");
        let toml = format!(
            r#"
[host]
room_name = "lan party"
relay_addr = "relay.example.com:7000"
relay_fingerprint = "{relay}"

[[host.ports]]
port = 25565
label = "mc"
target = "10.0.0.2:25565"

[[host.ports]]
port = 19132
udp = true

[host.whitelist]
alice = "{alice}"

[client]
server_addr = "relay.example.com:7000"
room = "{room}"

[[client.ports]]
label = "mc"
local_port = 25566
"#,
            relay = hex(1),
            alice = hex(2),
            room = hex(3),
        );
        std::fs::write(&cfg_path, toml).expect("write");
        let cfg = load_config(&cfg_path).unwrap();

        let host = cfg.host.unwrap();
        assert_eq!(host.room_name, "lan party");
        assert_eq!(host.relay_fingerprint, Some(Fingerprint::from_bytes([1; 32])));
        assert_eq!(host.ports.len(), 2);
        assert_eq!(host.ports.get("mc").unwrap().target, "10.0.0.2:25565");
        assert!(host.ports.get("19132").unwrap().udp);
        assert_eq!(host.whitelist["alice"], Fingerprint::from_bytes([2; 32]));

        let client = cfg.client.unwrap();
        assert_eq!(client.room, Fingerprint::from_bytes([3; 32]));
        assert_eq!(client.ports, vec![("mc".to_string(), 25566)]);
        assert_eq!(client.bind_addr, IpAddr::from([127, 0, 0, 1]));
        assert_eq!(client.idle_timeout, Duration::from_secs(30));
        assert!(cfg.relay.is_none());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn rejects_bad_input() {
        let dir = temp_dir("bad");
        let cfg_path = dir.join("aefrp.toml");

        std::fs::write(&cfg_path, "admin_addr = \":8080\"\n").expect("write");
        let err = load_config(&cfg_path).unwrap_err();
        assert!(err.to_string().contains("nothing to run"));

        std::fs::write(&cfg_path, "[client]\nserver_addr = \"x:1\"\nroom = \"abc\"\n").expect("write");
        let err = format!("{:#}", load_config(&cfg_path).unwrap_err());
        assert!(err.contains("client.room"), "got: {err}");

        let dup = r#"
[host]
direct_listen = ":7001"
[[host.ports]]
port = 80
[[host.ports]]
port = 80
udp = true
"#;
        std::fs::write(&cfg_path, dup).expect("write");
        let err = format!("{:#}", load_config(&cfg_path).unwrap_err());
        assert!(err.contains("duplicate"), "got: {err}");

        std::fs::write(&cfg_path, "routes = []\n[relay]\n").expect("write");
        assert!(load_config(&cfg_path).is_err());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
