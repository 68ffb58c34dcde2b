use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use granny_session::SessionSettings;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use snafu::{ResultExt, Snafu};

pub const SETTINGS_DIRECTORY_NAME: &str = "granny";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const DATABASE_FILE_NAME: &str = "granny.db";
pub const ENV_PREFIX: &str = "GRANNY_";
const USER_ID_KEY: &str = "user_id";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppSettings {
    /// SQLite path, `sqlite:` URL or `:memory:`.
    #[serde(default = "default_database")]
    pub database: String,
    /// Identity to sign in with at startup.
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub session: SessionSettings,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            database: default_database(),
            user_id: None,
            session: SessionSettings::default(),
        }
    }
}

impl AppSettings {
    pub fn normalized(mut self) -> Self {
        self.database = self.database.trim().to_string();
        if self.database.is_empty() {
            self.database = default_database();
        }
        self.user_id = self
            .user_id
            .map(|user_id| user_id.trim().to_string())
            .filter(|user_id| !user_id.is_empty());
        self.session = self.session.normalized();
        self
    }

    pub fn with_user_id(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self.normalized()
    }
}

/// Settings file plus `GRANNY_*` overrides, cached for lock-free reads.
pub struct SettingsStore {
    settings: Arc<ArcSwap<AppSettings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".granny"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        Self::with_env_prefix(config_path, ENV_PREFIX)
    }

    pub fn with_env_prefix(config_path: PathBuf, env_prefix: &str) -> Self {
        let settings = Self::load_from_disk(&config_path, env_prefix);
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn settings(&self) -> Arc<AppSettings> {
        self.settings.load_full()
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Records the identity to sign in with at the next start.
    ///
    /// Only the `user_id` key of the file is rewritten. Other keys stay as the user
    /// wrote them and `GRANNY_*` overrides never reach the file. Returns `false` when
    /// the user id did not change.
    pub fn remember_user(&self, user_id: Option<String>) -> Result<bool, SettingsError> {
        let current = self.settings();
        let next = current.as_ref().clone().with_user_id(user_id);
        if next.user_id == current.user_id {
            return Ok(false);
        }

        let mut document = self.read_document()?;
        match &next.user_id {
            Some(user_id) => {
                document.insert(USER_ID_KEY.to_string(), Value::String(user_id.clone()));
            }
            None => {
                document.remove(USER_ID_KEY);
            }
        }
        self.write_document(&document)?;

        tracing::info!(
            path = %self.config_path.display(),
            user_id = next.user_id.as_deref().unwrap_or("-"),
            "remembered signed-in user"
        );
        self.settings.store(Arc::new(next));
        Ok(true)
    }

    fn load_from_disk(path: &Path, env_prefix: &str) -> AppSettings {
        if !path.exists() {
            tracing::info!(path = %path.display(), "no settings file, using defaults");
        }

        let figment = Figment::from(Serialized::defaults(AppSettings::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(env_prefix).split("__"));

        match figment.extract::<AppSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(path = %path.display(), %error, "unreadable settings, using defaults");
                AppSettings::default()
            }
        }
    }

    /// The file as written, or an empty document when there is none yet.
    fn read_document(&self) -> Result<Map<String, Value>, SettingsError> {
        let raw = match std::fs::read_to_string(&self.config_path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(Map::new()),
            Err(source) => {
                return Err(source).context(ReadSettingsFileSnafu {
                    stage: "read-settings-document",
                    path: self.config_path.clone(),
                });
            }
        };
        // Broken files are never overwritten.
        serde_json::from_str(&raw).context(ParseSettingsFileSnafu {
            stage: "parse-settings-document",
            path: self.config_path.clone(),
        })
    }

    fn write_document(&self, document: &Map<String, Value>) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context(CreateSettingsDirectorySnafu {
                stage: "create-settings-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(document).context(EncodeSettingsSnafu {
            stage: "encode-settings-document",
        })?;
        let staged = self.config_path.with_extension("json.tmp");
        std::fs::write(&staged, content).context(WriteSettingsFileSnafu {
            stage: "write-staged-settings",
            path: staged.clone(),
        })?;
        std::fs::rename(&staged, &self.config_path).context(WriteSettingsFileSnafu {
            stage: "replace-settings-file",
            path: self.config_path.clone(),
        })
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("cannot create {path:?} on `{stage}`: {source}"))]
    CreateSettingsDirectory {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("cannot read {path:?} on `{stage}`: {source}"))]
    ReadSettingsFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("cannot parse {path:?} as a JSON object on `{stage}`: {source}"))]
    ParseSettingsFile {
        stage: &'static str,
        path: PathBuf,
        source: serde_json::Error,
    },
    #[snafu(display("cannot encode settings on `{stage}`: {source}"))]
    EncodeSettings {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("cannot write {path:?} on `{stage}`: {source}"))]
    WriteSettingsFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
}

fn default_database() -> String {
    dirs::data_dir()
        .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
        .unwrap_or_else(|| PathBuf::from(".granny"))
        .join(DATABASE_FILE_NAME)
        .display()
        .to_string()
}
