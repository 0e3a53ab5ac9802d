//! Engine and torrent configuration.
//!
//! [`Conf`] is the runtime configuration handed to [`engine::spawn`]
//! (crate::engine::spawn); [`Settings`] is its serialization as the
//! `settings.json` dictionary, using the conventional kebab-case keys so
//! existing settings files keep working. Unknown keys are ignored on load;
//! saving writes the full known key set.

use std::{fs, io, path::PathBuf};

/// The complete configuration of an engine instance.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub torrent: TorrentConf,
}

impl Conf {
    /// Creates a configuration with defaults, downloading into the given
    /// directory and keeping engine state (resume files, torrents,
    /// blocklists) in `<download_dir>/.tidetorrent`.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        let download_dir = download_dir.into();
        let config_dir = download_dir.join(".tidetorrent");
        Self {
            engine: EngineConf::new(config_dir),
            torrent: TorrentConf::new(download_dir),
        }
    }

    /// Loads configuration from a `settings.json` in the config directory,
    /// falling back to defaults for anything absent.
    pub fn load(config_dir: impl Into<PathBuf>) -> io::Result<Self> {
        let config_dir = config_dir.into();
        let buf = fs::read(config_dir.join(SETTINGS_FILE_NAME))?;
        let settings: Settings = serde_json::from_slice(&buf)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(settings.into_conf(config_dir))
    }

    /// Writes the configuration as `settings.json` into the config
    /// directory.
    pub fn save(&self) -> io::Result<()> {
        fs::create_dir_all(&self.engine.config_dir)?;
        let settings = Settings::from_conf(self);
        let buf = serde_json::to_vec_pretty(&settings)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(
            self.engine.config_dir.join(SETTINGS_FILE_NAME),
            buf,
        )
    }
}

pub(crate) const SETTINGS_FILE_NAME: &str = "settings.json";

/// Configuration scoped to the whole engine.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// Where the engine keeps its own state: `torrents/` (verbatim .torrent
    /// files), `resume/` (resume records), `blocklists/`, `settings.json`.
    pub config_dir: PathBuf,
    /// The port on which we accept inbound peer connections.
    pub listen_port: u16,
    /// If set, a random port from `listen_port_range` is picked at startup
    /// instead of `listen_port`.
    pub randomize_listen_port: bool,
    pub listen_port_range: std::ops::RangeInclusive<u16>,
    /// Upper bound on connected peers across all torrents.
    pub global_peer_limit: usize,
    /// Global download/upload caps in bytes per second, if enabled.
    pub download_rate_limit: Option<u64>,
    pub upload_rate_limit: Option<u64>,
    /// Secondary ("alt speed") caps the shell may toggle on a schedule.
    pub alt_download_rate_limit: Option<u64>,
    pub alt_upload_rate_limit: Option<u64>,
    /// 0 = plaintext tolerated, 1 = encryption preferred, 2 = required.
    pub encryption_mode: u8,
    /// Whether to filter peers through the blocklist, and where to fetch it
    /// from.
    pub blocklist_enabled: bool,
    pub blocklist_url: Option<String>,
    /// Discovery and transport toggles. These gate the pluggable transports
    /// and peer sources; the engine core itself implements TCP and tracker
    /// based discovery.
    pub dht_enabled: bool,
    pub lpd_enabled: bool,
    pub utp_enabled: bool,
    pub pex_enabled: bool,
    /// A directory polled once a second for dropped .torrent files.
    pub watch_dir: Option<PathBuf>,
    /// Whether watched .torrent files are deleted after adding (instead of
    /// being renamed to `<name>.added`).
    pub trash_watched_torrents: bool,
    /// 0 = error, 1 = info, 2 = debug. Applied by the embedding shell to its
    /// logger; carried here so it round trips through settings.json.
    pub message_level: u8,
    /// Most file descriptors the disk layer keeps open at once.
    pub open_file_limit: usize,
    /// Most tracker announces in flight at once.
    pub concurrent_announce_limit: usize,
}

impl EngineConf {
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
            listen_port: 51413,
            randomize_listen_port: false,
            listen_port_range: 49152..=65535,
            global_peer_limit: 240,
            download_rate_limit: None,
            upload_rate_limit: None,
            alt_download_rate_limit: None,
            alt_upload_rate_limit: None,
            encryption_mode: 0,
            blocklist_enabled: false,
            blocklist_url: None,
            dht_enabled: false,
            lpd_enabled: false,
            utp_enabled: false,
            pex_enabled: true,
            watch_dir: None,
            trash_watched_torrents: false,
            message_level: 1,
            open_file_limit: 32,
            concurrent_announce_limit: 16,
        }
    }
}

/// Configuration for a torrent. This is the torrent default configuration
/// each torrent inherits from the engine; per torrent overrides are applied
/// on top when the torrent is added.
#[derive(Clone, Debug)]
pub struct TorrentConf {
    /// Where downloaded content is placed.
    pub download_dir: PathBuf,
    /// If set, in-progress torrents are staged here and moved to
    /// `download_dir` as their files complete.
    pub incomplete_dir: Option<PathBuf>,
    /// Upper bound on connected peers per torrent.
    pub peer_limit: usize,
    /// Stop seeding when uploaded/downloaded reaches this ratio.
    pub ratio_limit: Option<f64>,
    /// Download pieces in index order instead of rarest first.
    pub sequential_download: bool,
}

impl TorrentConf {
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            incomplete_dir: None,
            peer_limit: 60,
            ratio_limit: None,
            sequential_download: false,
        }
    }
}

/// The `settings.json` dictionary. Field names follow the conventional
/// kebab-case settings keys.
#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub(crate) struct Settings {
    pub download_dir: PathBuf,
    pub incomplete_dir: PathBuf,
    pub incomplete_dir_enabled: bool,
    pub peer_port: u16,
    pub peer_port_random_on_start: bool,
    pub peer_port_random_low: u16,
    pub peer_port_random_high: u16,
    pub peer_limit_global: usize,
    pub peer_limit_per_torrent: usize,
    /// Rate limits are in kB/s in the settings file.
    pub speed_limit_down: u64,
    pub speed_limit_down_enabled: bool,
    pub speed_limit_up: u64,
    pub speed_limit_up_enabled: bool,
    pub alt_speed_down: u64,
    pub alt_speed_up: u64,
    pub alt_speed_enabled: bool,
    pub encryption: u8,
    pub blocklist_enabled: bool,
    pub blocklist_url: String,
    pub dht_enabled: bool,
    pub lpd_enabled: bool,
    pub utp_enabled: bool,
    pub pex_enabled: bool,
    pub ratio_limit: f64,
    pub ratio_limit_enabled: bool,
    pub watch_dir: PathBuf,
    pub watch_dir_enabled: bool,
    pub trash_original_torrent_files: bool,
    pub message_level: u8,
}

impl Default for Settings {
    fn default() -> Self {
        let conf = Conf::new("");
        Settings::from_conf(&conf)
    }
}

impl Settings {
    pub fn from_conf(conf: &Conf) -> Self {
        let engine = &conf.engine;
        let torrent = &conf.torrent;
        Self {
            download_dir: torrent.download_dir.clone(),
            incomplete_dir: torrent
                .incomplete_dir
                .clone()
                .unwrap_or_default(),
            incomplete_dir_enabled: torrent.incomplete_dir.is_some(),
            peer_port: engine.listen_port,
            peer_port_random_on_start: engine.randomize_listen_port,
            peer_port_random_low: *engine.listen_port_range.start(),
            peer_port_random_high: *engine.listen_port_range.end(),
            peer_limit_global: engine.global_peer_limit,
            peer_limit_per_torrent: torrent.peer_limit,
            speed_limit_down: engine.download_rate_limit.unwrap_or(0) / 1000,
            speed_limit_down_enabled: engine.download_rate_limit.is_some(),
            speed_limit_up: engine.upload_rate_limit.unwrap_or(0) / 1000,
            speed_limit_up_enabled: engine.upload_rate_limit.is_some(),
            alt_speed_down: engine.alt_download_rate_limit.unwrap_or(0)
                / 1000,
            alt_speed_up: engine.alt_upload_rate_limit.unwrap_or(0) / 1000,
            alt_speed_enabled: engine.alt_download_rate_limit.is_some()
                || engine.alt_upload_rate_limit.is_some(),
            encryption: engine.encryption_mode,
            blocklist_enabled: engine.blocklist_enabled,
            blocklist_url: engine.blocklist_url.clone().unwrap_or_default(),
            dht_enabled: engine.dht_enabled,
            lpd_enabled: engine.lpd_enabled,
            utp_enabled: engine.utp_enabled,
            pex_enabled: engine.pex_enabled,
            ratio_limit: torrent.ratio_limit.unwrap_or(2.0),
            ratio_limit_enabled: torrent.ratio_limit.is_some(),
            watch_dir: engine.watch_dir.clone().unwrap_or_default(),
            watch_dir_enabled: engine.watch_dir.is_some(),
            trash_original_torrent_files: engine.trash_watched_torrents,
            message_level: engine.message_level,
        }
    }

    pub fn into_conf(self, config_dir: PathBuf) -> Conf {
        let mut engine = EngineConf::new(config_dir);
        engine.listen_port = self.peer_port;
        engine.randomize_listen_port = self.peer_port_random_on_start;
        engine.listen_port_range =
            self.peer_port_random_low..=self.peer_port_random_high;
        engine.global_peer_limit = self.peer_limit_global;
        engine.download_rate_limit = self
            .speed_limit_down_enabled
            .then(|| self.speed_limit_down * 1000);
        engine.upload_rate_limit = self
            .speed_limit_up_enabled
            .then(|| self.speed_limit_up * 1000);
        engine.alt_download_rate_limit =
            self.alt_speed_enabled.then(|| self.alt_speed_down * 1000);
        engine.alt_upload_rate_limit =
            self.alt_speed_enabled.then(|| self.alt_speed_up * 1000);
        engine.encryption_mode = self.encryption;
        engine.blocklist_enabled = self.blocklist_enabled;
        engine.blocklist_url = if self.blocklist_url.is_empty() {
            None
        } else {
            Some(self.blocklist_url)
        };
        engine.dht_enabled = self.dht_enabled;
        engine.lpd_enabled = self.lpd_enabled;
        engine.utp_enabled = self.utp_enabled;
        engine.pex_enabled = self.pex_enabled;
        engine.watch_dir = self.watch_dir_enabled.then(|| self.watch_dir);
        engine.trash_watched_torrents = self.trash_original_torrent_files;
        engine.message_level = self.message_level;

        let mut torrent = TorrentConf::new(self.download_dir);
        torrent.incomplete_dir =
            self.incomplete_dir_enabled.then(|| self.incomplete_dir);
        torrent.peer_limit = self.peer_limit_per_torrent;
        torrent.ratio_limit =
            self.ratio_limit_enabled.then(|| self.ratio_limit);

        Conf { engine, torrent }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Tests that a configuration survives the settings.json roundtrip.
    #[test]
    fn test_settings_roundtrip() {
        let mut conf = Conf::new("/downloads");
        conf.engine.listen_port = 12345;
        conf.engine.download_rate_limit = Some(500_000);
        conf.engine.blocklist_enabled = true;
        conf.engine.blocklist_url =
            Some("http://example.com/blocklist".to_owned());
        conf.engine.watch_dir = Some(PathBuf::from("/watch"));
        conf.torrent.incomplete_dir = Some(PathBuf::from("/staging"));
        conf.torrent.ratio_limit = Some(1.5);
        conf.torrent.peer_limit = 33;

        let json = serde_json::to_string(&Settings::from_conf(&conf)).unwrap();
        let settings: Settings = serde_json::from_str(&json).unwrap();
        let loaded = settings.into_conf(conf.engine.config_dir.clone());

        assert_eq!(loaded.engine.listen_port, 12345);
        assert_eq!(loaded.engine.download_rate_limit, Some(500_000));
        assert_eq!(loaded.engine.upload_rate_limit, None);
        assert_eq!(
            loaded.engine.blocklist_url.as_deref(),
            Some("http://example.com/blocklist")
        );
        assert_eq!(loaded.engine.watch_dir, Some(PathBuf::from("/watch")));
        assert_eq!(
            loaded.torrent.incomplete_dir,
            Some(PathBuf::from("/staging"))
        );
        assert_eq!(loaded.torrent.ratio_limit, Some(1.5));
        assert_eq!(loaded.torrent.peer_limit, 33);
    }

    // Tests that the settings keys use the conventional kebab-case names.
    #[test]
    fn test_settings_key_names() {
        let json =
            serde_json::to_string(&Settings::from_conf(&Conf::new("/d")))
                .unwrap();
        for key in [
            "download-dir",
            "incomplete-dir-enabled",
            "peer-port",
            "peer-limit-per-torrent",
            "speed-limit-down",
            "alt-speed-enabled",
            "blocklist-url",
            "watch-dir",
            "trash-original-torrent-files",
            "message-level",
        ] {
            assert!(json.contains(&format!("\"{}\"", key)), "{}", key);
        }
    }

    // Tests that missing keys fall back to defaults rather than failing the
    // load.
    #[test]
    fn test_partial_settings() {
        let settings: Settings =
            serde_json::from_str(r#"{"peer-port": 7000}"#).unwrap();
        let conf = settings.into_conf(PathBuf::from("/config"));
        assert_eq!(conf.engine.listen_port, 7000);
        assert_eq!(conf.torrent.peer_limit, 60);
        assert!(!conf.engine.blocklist_enabled);
    }
}
