use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};
use tempfile::TempDir;

use crate::{
    collaborators::{DatabaseServer, HttpAuth},
    domain, nginx,
    registry::SiteRegistryEntry,
    shell::{CommandRunner, CommandSpec},
    utils,
};

/// Файл метаданных внутри резервной копии
pub const METADATA_FILE: &str = "vhost.json";

/// Сжатие архивов резервных копий
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    Zstd,
    Gzip,
}

impl Compression {
    fn tar_flag(&self) -> &'static str {
        match self {
            Self::Zstd => "--zstd",
            Self::Gzip => "--gzip",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Zstd => ".tar.zst",
            Self::Gzip => ".tar.gz",
        }
    }

    /// Определяет сжатие по имени архива
    pub fn of(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        [Self::Zstd, Self::Gzip]
            .into_iter()
            .find(|c| name.ends_with(c.extension()))
    }
}

/// Что входит в резервную копию
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupKind {
    All,
    Db,
    Files,
}

impl BackupKind {
    pub fn includes_files(&self) -> bool {
        matches!(self, Self::All | Self::Files)
    }

    pub fn includes_db(&self) -> bool {
        matches!(self, Self::All | Self::Db)
    }
}

/// Создание и восстановление архивов сайта
pub trait SiteArchiver {
    /// Архивирует сайт в `<dest_root>/<domain>/<timestamp>.tar.zst`
    /// (или `.tar.gz`, в зависимости от сжатия)
    fn archive(&self, site: &SiteRegistryEntry, kind: BackupKind, dest_root: &Path) -> Result<PathBuf>;
    /// Возвращает файлы и базу существующего сайта к состоянию из архива
    fn restore_in_place(&self, site: &SiteRegistryEntry, archive: &Path) -> Result<()>;
}

/// Содержимое `vhost.json`
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BackupMetadata {
    pub site: SiteRegistryEntry,
    #[serde(default)]
    pub http_auth: Option<HttpAuth>,
    pub timestamp: String,
}

/// Временная метка резервной копии (UTC)
pub fn timestamp() -> String {
    Utc::now().format("%Y-%m-%d_%H-%M-%S").to_string()
}

/// Корень резервных копий сайта: заданный явно или `<webroot>/backup`
pub fn backup_root_for(configured: Option<&Path>, site: &SiteRegistryEntry) -> PathBuf {
    configured
        .map(Path::to_path_buf)
        .unwrap_or_else(|| site.webroot.join("backup"))
}

/// Архивы сайта, от новых к старым
pub fn list_archives(domain_dir: &Path) -> Result<Vec<PathBuf>> {
    if !domain_dir.exists() {
        return Ok(Vec::new());
    }
    let mut archives = fs::read_dir(domain_dir)
        .with_context(|| format!("Не удалось прочитать директорию бекапов: {:?}", domain_dir))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && Compression::of(path).is_some())
        .collect::<Vec<_>>();

    // Имена начинаются с временной метки, лексикографический порядок совпадает с хронологическим
    archives.sort();
    archives.reverse();
    Ok(archives)
}

/// Удаляет старые архивы, оставляя последние `keep_last`
///
/// # Returns
/// Список удаленных архивов
pub fn prune(domain_dir: &Path, keep_last: usize) -> Result<Vec<PathBuf>> {
    let archives = list_archives(domain_dir)?;
    let mut removed = Vec::new();

    for archive in archives.into_iter().skip(keep_last) {
        if let Err(e) = fs::remove_file(&archive) {
            warn!("Не удалось удалить старый бекап {:?}: {}", archive, e);
        } else {
            debug!("Удален старый бекап: {:?}", archive);
            removed.push(archive);
        }
    }

    info!(
        "Очистка бекапов в {:?} завершена, удалено: {}",
        domain_dir,
        removed.len()
    );
    Ok(removed)
}

/// Каталоги резервных копий: сам `root`, если в нем есть `vhost.json`,
/// иначе его подкаталоги с `vhost.json`
pub fn find_backup_dirs(root: &Path) -> Result<Vec<PathBuf>> {
    if root.join(METADATA_FILE).is_file() {
        return Ok(vec![root.to_path_buf()]);
    }
    let mut dirs = fs::read_dir(root)
        .with_context(|| format!("Не удалось прочитать директорию {:?}", root))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.join(METADATA_FILE).is_file())
        .collect::<Vec<_>>();
    dirs.sort();
    Ok(dirs)
}

pub fn read_metadata(dir: &Path) -> Result<BackupMetadata> {
    let path = dir.join(METADATA_FILE);
    let text =
        fs::read_to_string(&path).with_context(|| format!("Не удалось прочитать {:?}", path))?;
    serde_json::from_str(&text).with_context(|| format!("Не удалось разобрать {:?}", path))
}

/// Дамп базы внутри каталога резервной копии
pub fn sql_dump_path(dir: &Path, domain: &str) -> PathBuf {
    dir.join(format!("{}.sql", domain))
}

/// Резервные копии в виде сжатых архивов tar
pub struct ArchiveBackup<'a> {
    database: &'a dyn DatabaseServer,
    runner: CommandRunner,
    acl_dir: PathBuf,
    compression: Compression,
}

impl<'a> ArchiveBackup<'a> {
    pub fn new(database: &'a dyn DatabaseServer, runner: CommandRunner, acl_dir: &Path) -> Self {
        Self {
            database,
            runner,
            acl_dir: acl_dir.to_path_buf(),
            compression: Compression::default(),
        }
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    /// Распаковывает архив во временный каталог
    pub fn extract(&self, archive: &Path) -> Result<TempDir> {
        let compression = Compression::of(archive)
            .ok_or_else(|| anyhow!("неизвестный формат архива {:?}", archive))?;
        let dir = tempfile::tempdir().context("Не удалось создать временный каталог")?;
        self.runner.run(
            &CommandSpec::new("tar")
                .args([compression.tar_flag(), "-xf"])
                .arg(archive.to_string_lossy())
                .arg("-C")
                .arg(dir.path().to_string_lossy())
                .describe("Распаковка резервной копии"),
        )?;
        debug!("Архив {:?} распакован в {:?}", archive, dir.path());
        Ok(dir)
    }

    fn copy_tree(&self, from: &Path, to: &Path) -> Result<()> {
        fs::create_dir_all(to).with_context(|| format!("Не удалось создать директорию {:?}", to))?;
        self.runner.run(
            &CommandSpec::new("cp")
                .arg("-a")
                .arg(format!("{}/.", from.display()))
                .arg(to.to_string_lossy()),
        )?;
        Ok(())
    }

    fn stage(&self, site: &SiteRegistryEntry, kind: BackupKind, staging: &Path, ts: &str) -> Result<()> {
        if kind.includes_files() {
            let htdocs = site.webroot.join("htdocs");
            if htdocs.is_dir() {
                self.copy_tree(&htdocs, &staging.join("htdocs"))?;
            }
            for config in utils::config_files(&site.webroot) {
                if let Some(name) = config.file_name() {
                    fs::copy(&config, staging.join(name))
                        .with_context(|| format!("Не удалось скопировать {:?}", config))?;
                }
            }
        }

        if kind.includes_db() {
            match &site.db {
                Some(db) => self
                    .database
                    .dump(&db.name, &sql_dump_path(staging, &site.domain))?,
                None => debug!("У сайта {} нет базы данных", site.domain),
            }
        }

        let metadata = BackupMetadata {
            site: site.clone(),
            http_auth: nginx::read_http_auth(&self.acl_dir, &site.domain),
            timestamp: ts.to_string(),
        };
        let text = serde_json::to_string_pretty(&metadata)
            .context("Не удалось сериализовать метаданные резервной копии")?;
        utils::write_file(&staging.join(METADATA_FILE), &text)
    }
}

impl SiteArchiver for ArchiveBackup<'_> {
    fn archive(&self, site: &SiteRegistryEntry, kind: BackupKind, dest_root: &Path) -> Result<PathBuf> {
        let ts = timestamp();
        let domain_dir = dest_root.join(&site.domain);
        let staging = domain_dir.join(&ts);
        fs::create_dir_all(&staging)
            .with_context(|| format!("Не удалось создать директорию для бекапов: {:?}", staging))?;

        info!("Резервная копия {} ({:?})", site.domain, kind);
        let staged = self.stage(site, kind, &staging, &ts);

        let archive = domain_dir.join(format!("{}{}", ts, self.compression.extension()));
        let packed = staged.and_then(|()| {
            self.runner.run(
                &CommandSpec::new("tar")
                    .args([self.compression.tar_flag(), "-cf"])
                    .arg(archive.to_string_lossy())
                    .arg("-C")
                    .arg(domain_dir.to_string_lossy())
                    .arg(ts.as_str())
                    .describe("Архив резервной копии"),
            )
        });

        utils::remove_dir_all_if_exists(&staging)?;
        packed.with_context(|| format!("Не удалось создать резервную копию {}", site.domain))?;

        info!("Резервная копия {} сохранена в {:?}", site.domain, archive);
        Ok(archive)
    }

    fn restore_in_place(&self, site: &SiteRegistryEntry, archive: &Path) -> Result<()> {
        info!("Восстановление {} из {:?}", site.domain, archive);
        let extracted = self.extract(archive)?;
        let dir = find_backup_dirs(extracted.path())?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("в архиве {:?} нет {}", archive, METADATA_FILE))?;

        let saved = read_metadata(&dir)?;
        if saved.site.domain != site.domain {
            bail!(
                "архив {:?} относится к сайту {}, а не {}",
                archive,
                saved.site.domain,
                site.domain
            );
        }

        let backup_htdocs = dir.join("htdocs");
        if backup_htdocs.is_dir() {
            let htdocs = site.webroot.join("htdocs");
            utils::remove_dir_all_if_exists(&htdocs)?;
            self.copy_tree(&backup_htdocs, &htdocs)?;

            let owner = format!("{0}:{0}", format!("php-{}", domain::slug(&site.domain)));
            if let Err(e) = self.runner.run(
                &CommandSpec::new("chown")
                    .args(["-R", owner.as_str()])
                    .arg(htdocs.to_string_lossy()),
            ) {
                warn!("Не удалось сменить владельца {:?}: {:#}", htdocs, e);
            }
        }
        for config in utils::config_files(&dir) {
            if let Some(name) = config.file_name() {
                fs::copy(&config, site.webroot.join(name))
                    .with_context(|| format!("Не удалось восстановить {:?}", config))?;
            }
        }

        let dump = sql_dump_path(&dir, &site.domain);
        if let (Some(db), true) = (&site.db, dump.is_file()) {
            self.database.import(&db.name, &dump)?;
        }

        info!("Сайт {} восстановлен из резервной копии", site.domain);
        Ok(())
    }
}
