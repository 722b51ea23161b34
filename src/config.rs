//! Node configuration.
//!
//! One TOML file per node, readable only by its owner:
//!
//! ```toml
//! node_name = "alpha"
//! subvolumes = ["home", "root"]
//!
//! [store]
//! kind = "btrfs"
//! mountpoint = "/mnt/pool"
//! snapshot_dir = "/mnt/pool/.snapshots"
//! backup_dir = "/mnt/pool/.backups"
//!
//! [[remote]]
//! name = "backup01"
//! address = "backup01.example.net"
//! secret = { salt = "…", key = "…" }
//! push = ["home"]
//! accept_push = ["home"]
//! allow_recover = true
//! ```

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::net::{Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::auth::{AccessPolicy, Argon2idKdf, Authenticator, KdfParams, KeyDerivation, RemoteAccess, SecretStore, SharedKey};
use crate::error::{ConfigError, Error};
use crate::lineage::LineageTracker;
use crate::snapshot::{is_valid_name, DirStore, SnapshotStore, Volume};
use crate::streaming::{SessionContext, ShutdownSignal};
use crate::transport::DEFAULT_PORT;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/snapvault.toml";

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from((Ipv6Addr::UNSPECIFIED, DEFAULT_PORT))
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/snapvault")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    pub node_name: String,

    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,

    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    pub store: StoreConfig,

    /// Subvolumes owned by this node.
    #[serde(default)]
    pub subvolumes: Vec<String>,

    #[serde(default)]
    pub kdf: KdfParams,

    #[serde(default)]
    pub timeouts: Timeouts,

    #[serde(default, rename = "remote")]
    pub remotes: Vec<RemoteConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Dir,
    Btrfs,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    pub kind: StoreKind,
    /// Root of the btrfs filesystem holding the subvolumes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mountpoint: Option<PathBuf>,
    pub snapshot_dir: PathBuf,
    pub backup_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Timeouts {
    pub connect_secs: u64,
    pub handshake_secs: u64,
    pub idle_secs: u64,
    pub shutdown_grace_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect_secs: 10,
            handshake_secs: 30,
            idle_secs: 300,
            shutdown_grace_secs: 30,
        }
    }
}

impl Timeouts {
    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    pub fn handshake(&self) -> Duration {
        Duration::from_secs(self.handshake_secs)
    }

    pub fn idle(&self) -> Duration {
        Duration::from_secs(self.idle_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Shared secret with one remote: a key pre-derived with `derive-key`, or
/// the passphrase itself, stretched at load time.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SecretConfig {
    Key { salt: String, key: String },
    Passphrase { salt: String, passphrase: String },
}

impl std::fmt::Debug for SecretConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SecretConfig::Key { salt, .. } => f
                .debug_struct("Key")
                .field("salt", salt)
                .finish_non_exhaustive(),
            SecretConfig::Passphrase { salt, .. } => f
                .debug_struct("Passphrase")
                .field("salt", salt)
                .finish_non_exhaustive(),
        }
    }
}

impl SecretConfig {
    pub fn derive(&self, kdf: &dyn KeyDerivation) -> Result<SharedKey, ConfigError> {
        match self {
            SecretConfig::Key { key, .. } => SharedKey::from_hex(key),
            SecretConfig::Passphrase { salt, passphrase } => {
                let salt = hex::decode(salt)
                    .map_err(|e| ConfigError::Invalid(format!("salt is not valid hex: {}", e)))?;
                kdf.derive(passphrase.as_bytes(), &salt)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteConfig {
    pub name: String,

    /// `host` or `host:port`. Remotes that only ever connect to us need none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    pub secret: SecretConfig,

    /// Own subvolumes pushed to this remote by `backup`.
    #[serde(default)]
    pub push: Vec<String>,

    /// Volumes (`host/subvolume`) of this remote pulled by `backup`.
    #[serde(default)]
    pub pull: Vec<String>,

    /// Subvolumes of the remote it may push here.
    #[serde(default)]
    pub accept_push: Vec<String>,

    /// Own subvolumes the remote may pull.
    #[serde(default)]
    pub allow_pull: Vec<String>,

    #[serde(default)]
    pub allow_recover: bool,
}

impl RemoteConfig {
    /// A remote with no transfers and no grants.
    pub fn new(name: impl Into<String>, secret: SecretConfig) -> Self {
        Self {
            name: name.into(),
            address: None,
            secret,
            push: Vec::new(),
            pull: Vec::new(),
            accept_push: Vec::new(),
            allow_pull: Vec::new(),
            allow_recover: false,
        }
    }

    /// Stop initiating transfers with this remote. What it may do here is
    /// left alone.
    pub fn clear_transfers(&mut self) {
        self.address = None;
        self.push.clear();
        self.pull.clear();
    }

    pub fn pull_volumes(&self) -> Result<Vec<Volume>, ConfigError> {
        self.pull
            .iter()
            .map(|v| Volume::parse(v).map_err(|e| ConfigError::Invalid(format!("{:#}", e))))
            .collect()
    }

    pub fn access(&self) -> RemoteAccess {
        let mut access = RemoteAccess::default();
        for s in &self.accept_push {
            access = access.accept_push(s.clone());
        }
        for s in &self.allow_pull {
            access = access.allow_pull(s.clone());
        }
        if self.allow_recover {
            access = access.allow_recover();
        }
        access
    }
}

impl NodeConfig {
    /// Defaults for everything but the node name and store.
    pub fn new(node_name: impl Into<String>, store: StoreConfig) -> Self {
        Self {
            node_name: node_name.into(),
            bind_addr: default_bind_addr(),
            state_dir: default_state_dir(),
            store,
            subvolumes: Vec::new(),
            kdf: KdfParams::default(),
            timeouts: Timeouts::default(),
            remotes: Vec::new(),
        }
    }

    /// Mark a subvolume as owned. False if it already was.
    pub fn track(&mut self, subvolume: &str) -> bool {
        if self.subvolumes.iter().any(|s| s == subvolume) {
            return false;
        }
        self.subvolumes.push(subvolume.to_string());
        true
    }

    /// Drop ownership of a subvolume together with every push and pull
    /// grant naming it. False if it was not tracked.
    pub fn untrack(&mut self, subvolume: &str) -> bool {
        let before = self.subvolumes.len();
        self.subvolumes.retain(|s| s != subvolume);
        for remote in &mut self.remotes {
            remote.push.retain(|s| s != subvolume);
            remote.allow_pull.retain(|s| s != subvolume);
        }
        self.subvolumes.len() != before
    }

    pub fn remote_mut(&mut self, name: &str) -> Option<&mut RemoteConfig> {
        self.remotes.iter_mut().find(|r| r.name == name)
    }

    /// Forget a remote, its secret and its grants.
    pub fn remove_remote(&mut self, name: &str) -> Option<RemoteConfig> {
        let idx = self.remotes.iter().position(|r| r.name == name)?;
        Some(self.remotes.remove(idx))
    }

    /// Load and validate, refusing files others can read or write.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let meta = fs::metadata(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ConfigError::Missing(path.to_path_buf()),
            _ => config_io(path, e),
        })?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if meta.permissions().mode() & 0o077 != 0 {
                return Err(ConfigError::InsecurePermissions(path.to_path_buf()));
            }
        }
        #[cfg(not(unix))]
        let _ = meta;

        let text = fs::read_to_string(path).map_err(|e| config_io(path, e))?;
        let config: NodeConfig = toml::from_str(&text)?;
        config.validate()?;
        debug!(path = %path.display(), remotes = config.remotes.len(), "loaded configuration");
        Ok(config)
    }

    /// Write with mode 0600 (temp file, fsync, rename).
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        self.validate()?;
        let text = toml::to_string_pretty(self)?;

        let temp = path.with_extension("tmp");
        {
            let mut options = OpenOptions::new();
            options.write(true).create(true).truncate(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                options.mode(0o600);
            }
            let mut file = options.open(&temp).map_err(|e| config_io(&temp, e))?;
            file.write_all(text.as_bytes())
                .map_err(|e| config_io(&temp, e))?;
            file.sync_all().map_err(|e| config_io(&temp, e))?;
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&temp, fs::Permissions::from_mode(0o600))
                .map_err(|e| config_io(&temp, e))?;
        }
        fs::rename(&temp, path).map_err(|e| config_io(path, e))?;
        if let Some(dir) = path.parent() {
            if let Ok(dir) = File::open(dir) {
                let _ = dir.sync_all();
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if !is_valid_name(&self.node_name) {
            return invalid(format!("invalid node_name {:?}", self.node_name));
        }
        for s in &self.subvolumes {
            if !is_valid_name(s) {
                return invalid(format!("invalid subvolume {:?}", s));
            }
        }
        if self.store.kind == StoreKind::Btrfs && self.store.mountpoint.is_none() {
            return invalid("btrfs store requires a mountpoint".into());
        }

        let mut seen = HashSet::new();
        for remote in &self.remotes {
            if !is_valid_name(&remote.name) {
                return invalid(format!("invalid remote name {:?}", remote.name));
            }
            if remote.name == self.node_name {
                return invalid(format!("remote {} has the local node's name", remote.name));
            }
            if !seen.insert(remote.name.as_str()) {
                return invalid(format!("duplicate remote {}", remote.name));
            }
            if remote.address.is_none() && !(remote.push.is_empty() && remote.pull.is_empty()) {
                return invalid(format!("remote {} has transfers but no address", remote.name));
            }
            for s in remote.push.iter().chain(&remote.allow_pull) {
                if !self.subvolumes.contains(s) {
                    return invalid(format!(
                        "remote {} names {:?}, which is not a local subvolume",
                        remote.name, s
                    ));
                }
            }
            for s in &remote.accept_push {
                if !is_valid_name(s) {
                    return invalid(format!("invalid subvolume {:?} for remote {}", s, remote.name));
                }
            }
            for volume in remote.pull_volumes()? {
                if volume.host == self.node_name {
                    return invalid(format!(
                        "remote {} pulls {}, which is owned by this node",
                        remote.name, volume
                    ));
                }
            }
            if let SecretConfig::Key { key, .. } = &remote.secret {
                SharedKey::from_hex(key)?;
            }
        }
        Ok(())
    }

    pub fn remote(&self, name: &str) -> Option<&RemoteConfig> {
        self.remotes.iter().find(|r| r.name == name)
    }

    /// Lineage and audit state of transfers this node initiates.
    pub fn initiator_state_dir(&self) -> PathBuf {
        self.state_dir.join("initiated")
    }

    /// Lineage and audit state of transfers the daemon serves.
    pub fn responder_state_dir(&self) -> PathBuf {
        self.state_dir.join("served")
    }

    /// Derive every remote's key. Slow for passphrase secrets.
    pub fn secret_store(&self) -> Result<SecretStore, ConfigError> {
        let kdf = Argon2idKdf::new(self.kdf);
        let mut store = SecretStore::new(self.timeouts.handshake());
        for remote in &self.remotes {
            let key = remote.secret.derive(&kdf)?;
            store.insert(remote.name.clone(), key);
        }
        Ok(store)
    }

    pub fn access_policy(&self) -> AccessPolicy {
        let mut policy = AccessPolicy::default();
        for remote in &self.remotes {
            policy.insert(remote.name.clone(), remote.access());
        }
        policy
    }

    pub fn open_store(&self) -> Result<Arc<dyn SnapshotStore>, ConfigError> {
        let store = &self.store;
        match store.kind {
            StoreKind::Dir => Ok(Arc::new(DirStore::new(
                self.node_name.clone(),
                store.snapshot_dir.clone(),
                store.backup_dir.clone(),
            ))),
            #[cfg(feature = "btrfs")]
            StoreKind::Btrfs => {
                let mountpoint = store
                    .mountpoint
                    .clone()
                    .ok_or_else(|| ConfigError::Invalid("btrfs store requires a mountpoint".into()))?;
                Ok(Arc::new(crate::snapshot::BtrfsStore::new(
                    self.node_name.clone(),
                    mountpoint,
                    store.snapshot_dir.clone(),
                    store.backup_dir.clone(),
                )))
            }
            #[cfg(not(feature = "btrfs"))]
            StoreKind::Btrfs => Err(ConfigError::Invalid(
                "built without btrfs support".into(),
            )),
        }
    }

    /// Everything a session needs, with lineage kept under `state_dir`.
    pub fn session_context(
        &self,
        state_dir: &Path,
        shutdown: ShutdownSignal,
    ) -> Result<SessionContext, Error> {
        let secrets = Arc::new(self.secret_store()?);
        Ok(SessionContext {
            node_name: self.node_name.clone(),
            store: self.open_store()?,
            lineage: Arc::new(LineageTracker::open(state_dir)?),
            authenticator: Authenticator::new(secrets, self.timeouts.handshake()),
            access: Arc::new(self.access_policy()),
            idle_timeout: self.timeouts.idle(),
            shutdown,
        })
    }
}

fn config_io(path: &Path, source: std::io::Error) -> ConfigError {
    ConfigError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const KEY: &str = "0101010101010101010101010101010101010101010101010101010101010101";

    fn sample() -> String {
        format!(
            r#"
node_name = "alpha"
subvolumes = ["home", "root"]

[store]
kind = "dir"
snapshot_dir = "/srv/snapshots"
backup_dir = "/srv/backups"

[timeouts]
idle_secs = 60

[[remote]]
name = "backup01"
address = "backup01.example.net"
secret = {{ salt = "00", key = "{KEY}" }}
push = ["home"]
pull = ["backup01/srv"]
accept_push = ["srv"]
allow_recover = true

[[remote]]
name = "laptop"
secret = {{ salt = "00", passphrase = "correct horse" }}
allow_pull = ["root"]
"#
        )
    }

    fn write_config(dir: &Path, text: &str, mode: u32) -> PathBuf {
        let path = dir.join("snapvault.toml");
        fs::write(&path, text).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(mode)).unwrap();
        }
        #[cfg(not(unix))]
        let _ = mode;
        path
    }

    #[test]
    fn test_parse_with_defaults() {
        let config: NodeConfig = toml::from_str(&sample()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.bind_addr.port(), DEFAULT_PORT);
        assert_eq!(config.state_dir, PathBuf::from("/var/lib/snapvault"));
        assert_eq!(config.timeouts.idle(), Duration::from_secs(60));
        assert_eq!(config.timeouts.connect(), Duration::from_secs(10));
        assert_eq!(config.kdf, KdfParams::default());

        let laptop = config.remote("laptop").unwrap();
        assert!(matches!(laptop.secret, SecretConfig::Passphrase { .. }));
        assert!(laptop.address.is_none());
        assert_eq!(
            config.remote("backup01").unwrap().pull_volumes().unwrap(),
            vec![Volume::new("backup01", "srv")]
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_insecure_permissions_refused() {
        let tmp = TempDir::new().unwrap();
        let path = write_config(tmp.path(), &sample(), 0o644);
        assert!(matches!(
            NodeConfig::load(&path),
            Err(ConfigError::InsecurePermissions(_))
        ));

        let path = write_config(tmp.path(), &sample(), 0o600);
        assert!(NodeConfig::load(&path).is_ok());
    }

    #[test]
    fn test_missing_file() {
        let tmp = TempDir::new().unwrap();
        assert!(matches!(
            NodeConfig::load(&tmp.path().join("nope.toml")),
            Err(ConfigError::Missing(_))
        ));
    }

    #[test]
    fn test_validation() {
        let base: NodeConfig = toml::from_str(&sample()).unwrap();

        let mut dup = base.clone();
        dup.remotes.push(dup.remotes[0].clone());
        assert!(dup.validate().is_err());

        let mut own_pull = base.clone();
        own_pull.remotes[0].pull = vec!["alpha/home".into()];
        assert!(own_pull.validate().is_err());

        let mut foreign_push = base.clone();
        foreign_push.remotes[0].push = vec!["var".into()];
        assert!(foreign_push.validate().is_err());

        let mut no_address = base.clone();
        no_address.remotes[0].address = None;
        assert!(no_address.validate().is_err());

        let mut bad_name = base;
        bad_name.node_name = "al pha".into();
        assert!(bad_name.validate().is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_save_is_private_and_round_trips() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        let config: NodeConfig = toml::from_str(&sample()).unwrap();
        let path = tmp.path().join("saved.toml");
        config.save(&path).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(NodeConfig::load(&path).unwrap(), config);
    }

    #[cfg(unix)]
    #[test]
    fn test_edits_survive_save() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("edited.toml");
        let mut config = NodeConfig::new(
            "alpha",
            StoreConfig {
                kind: StoreKind::Dir,
                mountpoint: None,
                snapshot_dir: "/srv/snapshots".into(),
                backup_dir: "/srv/backups".into(),
            },
        );
        assert!(config.track("home"));
        assert!(config.track("root"));
        assert!(!config.track("home"));

        let mut remote = RemoteConfig::new(
            "backup01",
            SecretConfig::Key {
                salt: "00".into(),
                key: KEY.into(),
            },
        );
        remote.address = Some("backup01.example.net".into());
        remote.push = vec!["home".into(), "root".into()];
        remote.allow_pull = vec!["root".into()];
        config.remotes.push(remote);
        config.save(&path).unwrap();

        let mut config = NodeConfig::load(&path).unwrap();
        assert!(config.untrack("root"));
        assert!(!config.untrack("var"));
        config.save(&path).unwrap();

        let mut config = NodeConfig::load(&path).unwrap();
        let remote = config.remote("backup01").unwrap();
        assert_eq!(config.subvolumes, vec!["home".to_string()]);
        assert_eq!(remote.push, vec!["home".to_string()]);
        assert!(remote.allow_pull.is_empty());

        let remote = config.remote_mut("backup01").unwrap();
        remote.accept_push = vec!["srv".into()];
        remote.clear_transfers();
        config.save(&path).unwrap();
        let mut config = NodeConfig::load(&path).unwrap();
        let remote = config.remote("backup01").unwrap();
        assert!(remote.address.is_none() && remote.push.is_empty());
        assert_eq!(remote.accept_push, vec!["srv".to_string()]);

        assert!(config.remove_remote("backup01").is_some());
        assert!(config.remove_remote("backup01").is_none());
        config.save(&path).unwrap();
        assert!(NodeConfig::load(&path).unwrap().remotes.is_empty());
    }

    #[test]
    fn test_invalid_edit_is_not_saved() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bad.toml");
        let mut config: NodeConfig = toml::from_str(&sample()).unwrap();
        config.track("a b");
        assert!(config.save(&path).is_err());
        assert!(!path.exists());
    }

    #[test]
    fn test_access_policy_and_keys() {
        let mut config: NodeConfig = toml::from_str(&sample()).unwrap();
        // Keep the test fast: hex keys only.
        config.remotes[1].secret = SecretConfig::Key {
            salt: "00".into(),
            key: KEY.into(),
        };
        let store = config.secret_store().unwrap();
        assert_eq!(store.key("backup01").unwrap().to_hex(), KEY);

        let policy = config.access_policy();
        let request = crate::streaming::protocol::TransferRequest {
            host: "alpha".into(),
            subvolume: "root".into(),
            taken: None,
        };
        assert!(policy.permits(
            "alpha",
            "laptop",
            crate::streaming::Direction::Pull,
            &request
        ));
        assert!(!policy.permits(
            "alpha",
            "backup01",
            crate::streaming::Direction::Pull,
            &request
        ));
    }
}
