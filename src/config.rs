use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{backup::Compression, naming};

/// Путь к файлу конфигурации по умолчанию
pub const DEFAULT_CONFIG_PATH: &str = "/etc/wo/wo.toml";

/// Длина генерируемых паролей
pub const PASSWORD_LENGTH: usize = 24;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Ошибка чтения конфигурации: {0}")]
    ReadError(String),
    #[error("Ошибка записи конфигурации: {0}")]
    WriteError(String),
    #[error("Версия PHP по умолчанию {0} отсутствует в таблице версий")]
    UnknownDefaultPhp(String),
}

/// Поддерживаемая версия PHP: тег параметра (`php84`) и номер (`8.4`)
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct PhpVersion {
    pub tag: String,
    pub number: String,
}

impl PhpVersion {
    pub fn new(tag: &str, number: &str) -> Self {
        Self {
            tag: tag.to_string(),
            number: number.to_string(),
        }
    }
}

/// Таблица версий PHP в порядке возрастания.
///
/// Передается в `TypeResolver` как неизменяемое значение, поэтому тесты
/// могут подставлять собственный набор версий.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(from = "Vec<PhpVersion>", into = "Vec<PhpVersion>")]
pub struct PhpVersionTable(Vec<PhpVersion>);

impl From<Vec<PhpVersion>> for PhpVersionTable {
    fn from(versions: Vec<PhpVersion>) -> Self {
        Self::new(versions)
    }
}

impl From<PhpVersionTable> for Vec<PhpVersion> {
    fn from(table: PhpVersionTable) -> Self {
        table.0
    }
}

impl PhpVersionTable {
    pub fn new(mut versions: Vec<PhpVersion>) -> Self {
        versions.sort_by(|a, b| version_key(&a.number).cmp(&version_key(&b.number)));
        versions.dedup_by(|a, b| a.tag == b.tag);
        Self(versions)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PhpVersion> {
        self.0.iter()
    }

    pub fn by_tag(&self, tag: &str) -> Option<&PhpVersion> {
        self.0.iter().find(|v| v.tag == tag)
    }

    pub fn by_number(&self, number: &str) -> Option<&PhpVersion> {
        self.0.iter().find(|v| v.number == number)
    }

    pub fn is_version_tag(&self, tag: &str) -> bool {
        self.by_tag(tag).is_some()
    }
}

impl Default for PhpVersionTable {
    fn default() -> Self {
        Self::new(vec![
            PhpVersion::new("php74", "7.4"),
            PhpVersion::new("php80", "8.0"),
            PhpVersion::new("php81", "8.1"),
            PhpVersion::new("php82", "8.2"),
            PhpVersion::new("php83", "8.3"),
            PhpVersion::new("php84", "8.4"),
        ])
    }
}

fn version_key(number: &str) -> Vec<u32> {
    number
        .split('.')
        .map(|part| part.parse::<u32>().unwrap_or(0))
        .collect()
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct NginxSettings {
    pub binary: PathBuf,
    pub sites_available: PathBuf,
    pub sites_enabled: PathBuf,
    pub log_dir: PathBuf,
    pub acl_dir: PathBuf,
}

impl Default for NginxSettings {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("/usr/sbin/nginx"),
            sites_available: PathBuf::from("/etc/nginx/sites-available"),
            sites_enabled: PathBuf::from("/etc/nginx/sites-enabled"),
            log_dir: PathBuf::from("/var/log/nginx"),
            acl_dir: PathBuf::from("/etc/nginx/acl"),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct PhpSettings {
    pub versions: PhpVersionTable,
    pub default: String,
}

impl Default for PhpSettings {
    fn default() -> Self {
        Self {
            versions: PhpVersionTable::default(),
            default: "8.3".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct PhpFpmSettings {
    pub conf_root: PathBuf,
    pub log_root: PathBuf,
    pub run_dir: PathBuf,
    pub systemd_dir: PathBuf,
    pub web_user: String,
}

impl Default for PhpFpmSettings {
    fn default() -> Self {
        Self {
            conf_root: PathBuf::from("/etc/php"),
            log_root: PathBuf::from("/var/log/php"),
            run_dir: PathBuf::from("/run/php"),
            systemd_dir: PathBuf::from("/etc/systemd/system"),
            web_user: "www-data".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MysqlSettings {
    pub host: String,
    pub grant_host: String,
    pub defaults_file: PathBuf,
}

impl Default for MysqlSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            grant_host: "localhost".to_string(),
            defaults_file: PathBuf::from("/etc/mysql/conf.d/my.cnf"),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct WordPressSettings {
    pub user: String,
    pub email: String,
    pub prefix: String,
    pub wp_cli: PathBuf,
}

impl Default for WordPressSettings {
    fn default() -> Self {
        Self {
            user: String::new(),
            email: String::new(),
            prefix: "wp_".to_string(),
            wp_cli: PathBuf::from("/usr/local/bin/wp"),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct WoConfig {
    pub log_level: String,
    pub log_file: Option<PathBuf>,
    pub webroot_base: PathBuf,
    pub nginx: NginxSettings,
    pub php: PhpSettings,
    pub php_fpm: PhpFpmSettings,
    pub mysql: MysqlSettings,
    pub wordpress: WordPressSettings,
    pub registry_path: PathBuf,
    pub lock_dir: PathBuf,
    pub lock_max_age_secs: u64,
    pub backup_root: Option<PathBuf>,
    pub backup_compression: Compression,
    pub audit_log: Option<PathBuf>,
    pub autoupdate_log_dir: PathBuf,
}

impl Default for WoConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_file: Some(PathBuf::from("/var/log/wo/wordops.log")),
            webroot_base: PathBuf::from("/var/www"),
            nginx: NginxSettings::default(),
            php: PhpSettings::default(),
            php_fpm: PhpFpmSettings::default(),
            mysql: MysqlSettings::default(),
            wordpress: WordPressSettings::default(),
            registry_path: PathBuf::from("/var/lib/wo/sites.json"),
            lock_dir: PathBuf::from("/run"),
            lock_max_age_secs: 6 * 60 * 60,
            backup_root: None,
            backup_compression: Compression::default(),
            audit_log: Some(PathBuf::from("/var/log/wo/audit.jsonl")),
            autoupdate_log_dir: PathBuf::from("/var/log/wo/autoupdate"),
        }
    }
}

impl WoConfig {
    /// Загружает конфигурацию; если файла нет, пытается сохранить значения по умолчанию
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!("Файл конфигурации {:?} не найден, используются значения по умолчанию", path);
            let config = Self::default();
            if let Err(e) = config.save(path) {
                warn!("Не удалось сохранить конфигурацию по умолчанию: {:#}", e);
            }
            return Ok(config);
        }

        let contents = fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(format!("{:?}: {}", path, e)))?;

        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("Не удалось разобрать файл конфигурации: {:?}", path))?;
        config.validate()?;

        debug!("Конфигурация загружена из {:?}", path);
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let text = toml::to_string_pretty(self)
            .with_context(|| "Не удалось сериализовать конфигурацию в TOML")?;

        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| ConfigError::WriteError(format!("{:?}: {}", parent, e)))?;
        }

        fs::write(path, text).map_err(|e| ConfigError::WriteError(format!("{:?}: {}", path, e)))?;

        info!("Конфигурация сохранена в {:?}", path);
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.php.versions.by_number(&self.php.default).is_none() {
            return Err(ConfigError::UnknownDefaultPhp(self.php.default.clone()).into());
        }
        Ok(())
    }

    /// Версия PHP, используемая когда на командной строке версия не выбрана
    pub fn default_php(&self) -> Option<&PhpVersion> {
        self.php.versions.by_number(&self.php.default)
    }

    pub fn lock_max_age(&self) -> Duration {
        Duration::from_secs(self.lock_max_age_secs)
    }

    /// Каталог сайта: `<webroot_base>/<domain>`
    pub fn webroot_for(&self, domain: &str) -> PathBuf {
        self.webroot_base.join(domain)
    }
}

/// Генерирует случайный пароль из букв и цифр
pub fn generate_password() -> String {
    naming::random_alphanumeric(PASSWORD_LENGTH)
}
