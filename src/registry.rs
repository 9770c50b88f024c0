use std::{
    collections::BTreeMap,
    fs::{self, File, OpenOptions},
    io::Write,
    os::unix::io::AsRawFd,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, info};
use nix::fcntl::{flock, FlockArg};
use serde::{Deserialize, Serialize};

use crate::{
    collaborators::{DbCredentials, SiteRegistry},
    error::RegistryError,
    resolver::{CacheType, SiteType},
};

/// Запись о сайте в реестре
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct SiteRegistryEntry {
    pub domain: String,
    pub site_type: SiteType,
    pub cache_type: CacheType,
    pub webroot: PathBuf,
    pub php_version: Option<String>,
    /// Цель прокси (`host:port`), алиаса или родительский сайт подсайта
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub db: Option<DbCredentials>,
    #[serde(default)]
    pub ssl: bool,
    pub enabled: bool,
    pub created_on: DateTime<Utc>,
}

impl SiteRegistryEntry {
    /// Незавершенная запись, резервирующая домен на время создания сайта
    pub fn pending(domain: &str, site_type: SiteType, cache_type: CacheType, webroot: &Path) -> Self {
        Self {
            domain: domain.to_string(),
            site_type,
            cache_type,
            webroot: webroot.to_path_buf(),
            php_version: None,
            target: None,
            db: None,
            ssl: false,
            enabled: false,
            created_on: Utc::now(),
        }
    }
}

/// Изменения записи; `None` оставляет поле без изменений
#[derive(Debug, Clone, Default)]
pub struct SiteUpdate {
    pub enabled: Option<bool>,
    pub php_version: Option<String>,
    pub target: Option<String>,
    pub db: Option<DbCredentials>,
    pub ssl: Option<bool>,
}

impl SiteUpdate {
    fn apply(self, entry: &mut SiteRegistryEntry) {
        if let Some(enabled) = self.enabled {
            entry.enabled = enabled;
        }
        if let Some(php) = self.php_version {
            entry.php_version = Some(php);
        }
        if let Some(target) = self.target {
            entry.target = Some(target);
        }
        if let Some(db) = self.db {
            entry.db = Some(db);
        }
        if let Some(ssl) = self.ssl {
            entry.ssl = ssl;
        }
    }
}

/// Реестр сайтов в JSON-файле, ключ: домен
#[derive(Debug, Clone)]
pub struct JsonRegistry {
    path: PathBuf,
}

impl JsonRegistry {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    fn load(&self) -> Result<BTreeMap<String, SiteRegistryEntry>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let text = fs::read_to_string(&self.path)
            .with_context(|| format!("Не удалось прочитать реестр сайтов {:?}", self.path))?;
        if text.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&text)
            .with_context(|| format!("Не удалось разобрать реестр сайтов {:?}", self.path))
    }

    fn store(&self, sites: &BTreeMap<String, SiteRegistryEntry>) -> Result<()> {
        let parent = self.parent_dir();
        let text = serde_json::to_string_pretty(sites)
            .with_context(|| "Не удалось сериализовать реестр сайтов")?;

        let mut tmp = tempfile::NamedTempFile::new_in(&parent)
            .with_context(|| format!("Не удалось создать временный файл в {:?}", parent))?;
        tmp.write_all(text.as_bytes())
            .with_context(|| format!("Не удалось записать {:?}", tmp.path()))?;
        tmp.persist(&self.path)
            .with_context(|| format!("Не удалось заменить реестр сайтов {:?}", self.path))?;
        Ok(())
    }

    fn parent_dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    /// Эксклюзивная блокировка `<реестр>.lock` на время чтения-изменения-записи.
    /// Снимается при закрытии возвращенного файла.
    fn lock(&self) -> Result<File> {
        let parent = self.parent_dir();
        fs::create_dir_all(&parent)
            .with_context(|| format!("Не удалось создать директорию реестра {:?}", parent))?;

        let lock_path = self.path.with_extension("json.lock");
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&lock_path)
            .with_context(|| format!("Не удалось открыть {:?}", lock_path))?;
        flock(file.as_raw_fd(), FlockArg::LockExclusive)
            .with_context(|| format!("Не удалось заблокировать {:?}", lock_path))?;
        Ok(file)
    }
}

impl SiteRegistry for JsonRegistry {
    fn exists(&self, domain: &str) -> Result<bool> {
        Ok(self.load()?.contains_key(domain))
    }

    fn get(&self, domain: &str) -> Result<Option<SiteRegistryEntry>> {
        Ok(self.load()?.remove(domain))
    }

    fn create(&self, entry: SiteRegistryEntry) -> Result<()> {
        let _lock = self.lock()?;
        let mut sites = self.load()?;
        if sites.contains_key(&entry.domain) {
            return Err(RegistryError::AlreadyExists(entry.domain).into());
        }
        info!("Добавлен сайт {} в реестр", entry.domain);
        sites.insert(entry.domain.clone(), entry);
        self.store(&sites)
    }

    fn update(&self, domain: &str, update: SiteUpdate) -> Result<()> {
        let _lock = self.lock()?;
        let mut sites = self.load()?;
        let entry = sites
            .get_mut(domain)
            .ok_or_else(|| RegistryError::NotFound(domain.to_string()))?;
        update.apply(entry);
        debug!("Обновлена запись реестра для {}", domain);
        self.store(&sites)
    }

    fn delete(&self, domain: &str) -> Result<()> {
        let _lock = self.lock()?;
        let mut sites = self.load()?;
        if sites.remove(domain).is_some() {
            info!("Сайт {} удален из реестра", domain);
            self.store(&sites)?;
        }
        Ok(())
    }

    fn all(&self) -> Result<Vec<SiteRegistryEntry>> {
        Ok(self.load()?.into_values().collect())
    }
}
