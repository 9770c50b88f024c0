//! Пакетное обновление сайтов WordPress с резервной копией и откатом.

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use serde::Serialize;

use crate::{
    backup::{self, BackupKind, Compression, SiteArchiver},
    collaborators::SiteRegistry,
    domain,
    error::SiteError,
    lock::LockCoordinator,
    registry::SiteRegistryEntry,
    utils,
};

/// Доступные обновления сайта
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PendingUpdates {
    pub core: bool,
    pub plugins: Vec<String>,
    pub themes: Vec<String>,
}

impl PendingUpdates {
    pub fn is_empty(&self) -> bool {
        !self.core && self.plugins.is_empty() && self.themes.is_empty()
    }
}

/// Проверка и установка обновлений WordPress
pub trait Updater {
    fn pending(&self, site: &SiteRegistryEntry) -> Result<PendingUpdates>;
    fn apply(&self, site: &SiteRegistryEntry, pending: &PendingUpdates) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateStatus {
    Ok,
    BackupOnly,
    Planned,
    Noop,
    Skip,
    #[serde(rename = "rolled_back")]
    RolledBack,
    Error,
}

impl UpdateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::BackupOnly => "backup-only",
            Self::Planned => "planned",
            Self::Noop => "noop",
            Self::Skip => "skip",
            Self::RolledBack => "rolled_back",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpdateCounts {
    pub core: bool,
    pub plugins: usize,
    pub themes: usize,
}

impl From<&PendingUpdates> for UpdateCounts {
    fn from(pending: &PendingUpdates) -> Self {
        Self {
            core: pending.core,
            plugins: pending.plugins.len(),
            themes: pending.themes.len(),
        }
    }
}

/// Результат обработки одного сайта
#[derive(Debug, Clone, Serialize)]
pub struct SiteReport {
    pub site: String,
    pub status: UpdateStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub checked_at: String,
    pub updates: UpdateCounts,
    pub backup: Option<PathBuf>,
    pub rolled_back: bool,
}

impl SiteReport {
    fn new(site: &str) -> Self {
        Self {
            site: site.to_string(),
            status: UpdateStatus::Ok,
            reason: None,
            error: None,
            checked_at: backup::timestamp(),
            updates: UpdateCounts::default(),
            backup: None,
            rolled_back: false,
        }
    }

    fn skipped(site: &str, reason: &str) -> Self {
        Self {
            status: UpdateStatus::Skip,
            reason: Some(reason.to_string()),
            ..Self::new(site)
        }
    }

    fn failed(site: &str, error: impl Into<String>) -> Self {
        Self {
            status: UpdateStatus::Error,
            error: Some(error.into()),
            ..Self::new(site)
        }
    }
}

/// Сводка запуска, сохраняемая в `run-<timestamp>.json`
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub started_at: String,
    pub finished_at: Option<String>,
    pub sites: Vec<SiteReport>,
}

impl RunSummary {
    pub fn has_errors(&self) -> bool {
        self.sites.iter().any(|s| s.status == UpdateStatus::Error)
    }
}

pub struct AutoUpdater<'a> {
    registry: &'a dyn SiteRegistry,
    updater: &'a dyn Updater,
    archiver: &'a dyn SiteArchiver,
    lock_dir: PathBuf,
    lock_max_age: Duration,
    backup_root: Option<PathBuf>,
}

impl<'a> AutoUpdater<'a> {
    pub fn new(
        registry: &'a dyn SiteRegistry,
        updater: &'a dyn Updater,
        archiver: &'a dyn SiteArchiver,
        lock_dir: &Path,
        lock_max_age: Duration,
    ) -> Self {
        Self {
            registry,
            updater,
            archiver,
            lock_dir: lock_dir.to_path_buf(),
            lock_max_age,
            backup_root: None,
        }
    }

    /// Каталог резервных копий вместо `<webroot>/backup`
    pub fn backup_root(mut self, root: Option<PathBuf>) -> Self {
        self.backup_root = root;
        self
    }

    fn global_lock(&self) -> PathBuf {
        self.lock_dir.join("wo-autoupdate.lock")
    }

    fn site_lock(&self, domain: &str) -> PathBuf {
        self.lock_dir
            .join(format!("wo-autoupdate-{}.lock", domain::slug(domain)))
    }

    /// Сайты для обработки: указанный или все включенные сайты WordPress
    pub fn targets(&self, domain: Option<&str>) -> Result<Vec<String>> {
        if let Some(domain) = domain {
            return Ok(vec![domain.to_string()]);
        }
        Ok(self
            .registry
            .all()?
            .into_iter()
            .filter(|s| s.enabled && s.site_type.is_wordpress())
            .map(|s| s.domain)
            .collect())
    }

    /// Обрабатывает сайты по очереди.
    ///
    /// # Returns
    /// `Ok(None)` если уже выполняется другой запуск
    pub fn run(&self, targets: &[String], dry_run: bool) -> Result<Option<RunSummary>> {
        let Some(_global) = LockCoordinator::guard(&self.global_lock(), self.lock_max_age)? else {
            warn!("Автообновление уже выполняется другим процессом, пропускаем");
            return Ok(None);
        };

        let mut summary = RunSummary {
            started_at: backup::timestamp(),
            finished_at: None,
            sites: Vec::new(),
        };

        for domain in targets {
            let report = self.process_locked(domain, dry_run);
            info!("{}: {:?}", domain, report.status);
            summary.sites.push(report);
        }

        summary.finished_at = Some(backup::timestamp());
        if summary.has_errors() {
            warn!("Автообновление завершилось с ошибками для части сайтов");
        }
        Ok(Some(summary))
    }

    /// Запись реестра читается уже под блокировкой сайта
    fn process_locked(&self, domain: &str, dry_run: bool) -> SiteReport {
        let lock = self.site_lock(domain);
        let guard = match LockCoordinator::guard(&lock, self.lock_max_age) {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                warn!("Пропускаем {}: {}", domain, SiteError::LockContention(lock));
                return SiteReport::skipped(domain, "locked");
            }
            Err(e) => return SiteReport::failed(domain, format!("{:#}", e)),
        };
        debug!("Блокировка сайта {:?}", guard.path());

        match self.registry.get(domain) {
            Ok(Some(site)) => self.process_site(&site, dry_run),
            Ok(None) => SiteReport::failed(domain, "site not found"),
            Err(e) => SiteReport::failed(domain, format!("{:#}", e)),
        }
    }

    fn process_site(&self, site: &SiteRegistryEntry, dry_run: bool) -> SiteReport {
        let mut report = SiteReport::new(&site.domain);
        if !site.site_type.is_wordpress() {
            return SiteReport::skipped(&site.domain, "non-wordpress");
        }

        let pending = match self.updater.pending(site) {
            Ok(pending) => pending,
            Err(e) => return SiteReport::failed(&site.domain, format!("{:#}", e)),
        };
        report.updates = UpdateCounts::from(&pending);

        if dry_run {
            report.status = if pending.is_empty() {
                UpdateStatus::Noop
            } else {
                UpdateStatus::Planned
            };
            return report;
        }

        // Резервная копия создается всегда, даже без обновлений
        let root = backup::backup_root_for(self.backup_root.as_deref(), site);
        let archive = match self.archiver.archive(site, BackupKind::All, &root) {
            Ok(archive) if !pending.is_empty() => mark_pre_update(&archive).unwrap_or(archive),
            Ok(archive) => archive,
            Err(e) => {
                error!("Не удалось создать резервную копию {}: {:#}", site.domain, e);
                report.status = UpdateStatus::Error;
                report.error = Some("backup failed".to_string());
                return report;
            }
        };
        report.backup = Some(archive.clone());

        if pending.is_empty() {
            info!("Обновлений для {} нет, резервная копия создана", site.domain);
            report.status = UpdateStatus::BackupOnly;
            return report;
        }

        if let Err(e) = self.updater.apply(site, &pending) {
            warn!("Обновление {} не удалось ({:#}), восстанавливаем", site.domain, e);
            match self.archiver.restore_in_place(site, &archive) {
                Ok(()) => {
                    report.status = UpdateStatus::RolledBack;
                    report.rolled_back = true;
                }
                Err(restore) => {
                    error!("Не удалось восстановить {}: {:#}", site.domain, restore);
                    report.status = UpdateStatus::Error;
                }
            }
            report.error = Some(format!("update failed: {:#}", e));
            return report;
        }

        info!("Сайт {} обновлен", site.domain);
        report
    }
}

/// `<ts>.tar.zst` -> `<ts>_pre-update.tar.zst`
fn mark_pre_update(archive: &Path) -> Result<PathBuf> {
    let name = archive
        .file_name()
        .and_then(|n| n.to_str())
        .context("Некорректное имя архива")?;
    let ext = Compression::of(archive)
        .map(|c| c.extension())
        .context("Неизвестный формат архива")?;
    let stem = &name[..name.len() - ext.len()];
    let renamed = archive.with_file_name(format!("{}_pre-update{}", stem, ext));
    fs::rename(archive, &renamed)
        .with_context(|| format!("Не удалось переименовать {:?}", archive))?;
    Ok(renamed)
}

/// Сохраняет сводку запуска в `<dir>/run-<timestamp>.json`
pub fn write_summary(summary: &RunSummary, dir: &Path) -> Result<PathBuf> {
    let path = dir.join(format!("run-{}.json", backup::timestamp()));
    let text = serde_json::to_string_pretty(summary)
        .context("Не удалось сериализовать сводку автообновления")?;
    utils::write_file(&path, &text)?;
    info!("Сводка автообновления сохранена в {:?}", path);
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        lock::LockCoordinator,
        resolver::{CacheType, SiteType},
        testing::{FakeHost, Op},
    };

    const HOUR: Duration = Duration::from_secs(3600);

    fn wp_site(fake: &FakeHost, domain: &str) -> SiteRegistryEntry {
        let mut entry = SiteRegistryEntry::pending(
            domain,
            SiteType::Wp,
            CacheType::Basic,
            &fake.webroot_base().join(domain),
        );
        entry.enabled = true;
        fake.insert_entry(entry.clone());
        entry
    }

    fn updater(fake: &FakeHost) -> AutoUpdater<'_> {
        AutoUpdater::new(fake, fake, fake, &fake.root().join("locks"), HOUR)
            .backup_root(Some(fake.root().join("backups")))
    }

    fn plugin_update() -> PendingUpdates {
        PendingUpdates {
            plugins: vec!["akismet".into()],
            ..Default::default()
        }
    }

    fn run_one(fake: &FakeHost, domain: &str, dry_run: bool) -> SiteReport {
        let summary = updater(fake)
            .run(&[domain.to_string()], dry_run)
            .unwrap()
            .unwrap();
        summary.sites.into_iter().next().unwrap()
    }

    #[test]
    fn targets_are_enabled_wordpress_sites() {
        let fake = FakeHost::new();
        wp_site(&fake, "a.example.com");
        let mut disabled = wp_site(&fake, "b.example.com");
        disabled.enabled = false;
        fake.replace_entry(disabled);
        let mut html = wp_site(&fake, "c.example.com");
        html.site_type = SiteType::Html;
        fake.replace_entry(html);

        assert_eq!(updater(&fake).targets(None).unwrap(), vec!["a.example.com"]);
        assert_eq!(
            updater(&fake).targets(Some("x.example.com")).unwrap(),
            vec!["x.example.com"]
        );
    }

    #[test]
    fn dry_run_only_plans() {
        let fake = FakeHost::new();
        wp_site(&fake, "example.com");
        assert_eq!(run_one(&fake, "example.com", true).status, UpdateStatus::Noop);

        fake.set_pending("example.com", plugin_update());
        let report = run_one(&fake, "example.com", true);
        assert_eq!(report.status, UpdateStatus::Planned);
        assert_eq!(report.updates.plugins, 1);
        assert!(!fake.journal().contains(&Op::Archive("example.com".into())));
        assert!(!fake.journal().contains(&Op::ApplyUpdates("example.com".into())));
    }

    #[test]
    fn no_updates_still_makes_a_backup() {
        let fake = FakeHost::new();
        wp_site(&fake, "example.com");

        let report = run_one(&fake, "example.com", false);
        assert_eq!(report.status, UpdateStatus::BackupOnly);
        assert!(report.backup.unwrap().exists());
        assert!(!fake.journal().contains(&Op::ApplyUpdates("example.com".into())));
    }

    #[test]
    fn updates_are_applied_after_backup() {
        let fake = FakeHost::new();
        wp_site(&fake, "example.com");
        fake.set_pending("example.com", plugin_update());

        let report = run_one(&fake, "example.com", false);
        assert_eq!(report.status, UpdateStatus::Ok);
        let archive = report.backup.unwrap();
        assert!(archive.to_string_lossy().ends_with("_pre-update.tar.zst"));
        assert!(archive.exists());

        let journal = fake.journal();
        let pos = |op: Op| journal.iter().position(|o| *o == op).unwrap();
        assert!(pos(Op::Archive("example.com".into())) < pos(Op::ApplyUpdates("example.com".into())));
    }

    #[test]
    fn failed_update_is_rolled_back() {
        let fake = FakeHost::new();
        wp_site(&fake, "example.com");
        fake.set_pending("example.com", plugin_update());
        fake.fail_on(Op::ApplyUpdates("example.com".into()));

        let report = run_one(&fake, "example.com", false);
        assert_eq!(report.status, UpdateStatus::RolledBack);
        assert!(report.rolled_back);
        assert!(fake.journal().contains(&Op::RestoreArchive("example.com".into())));
    }

    #[test]
    fn failed_rollback_is_an_error() {
        let fake = FakeHost::new();
        wp_site(&fake, "example.com");
        fake.set_pending("example.com", plugin_update());
        fake.fail_on(Op::ApplyUpdates("example.com".into()));
        fake.fail_on(Op::RestoreArchive("example.com".into()));

        let report = run_one(&fake, "example.com", false);
        assert_eq!(report.status, UpdateStatus::Error);
        assert!(!report.rolled_back);
    }

    #[test]
    fn failed_backup_prevents_updates() {
        let fake = FakeHost::new();
        wp_site(&fake, "example.com");
        fake.set_pending("example.com", plugin_update());
        fake.fail_on(Op::Archive("example.com".into()));

        let report = run_one(&fake, "example.com", false);
        assert_eq!(report.status, UpdateStatus::Error);
        assert_eq!(report.error.as_deref(), Some("backup failed"));
        assert!(!fake.journal().contains(&Op::ApplyUpdates("example.com".into())));
    }

    #[test]
    fn locked_site_is_skipped_and_others_continue() {
        let fake = FakeHost::new();
        wp_site(&fake, "a.example.com");
        wp_site(&fake, "b.example.com");
        let u = updater(&fake);
        let held = LockCoordinator::guard(&u.site_lock("a.example.com"), HOUR)
            .unwrap()
            .unwrap();

        let summary = u
            .run(&["a.example.com".into(), "b.example.com".into()], false)
            .unwrap()
            .unwrap();
        assert_eq!(summary.sites[0].status, UpdateStatus::Skip);
        assert_eq!(summary.sites[0].reason.as_deref(), Some("locked"));
        assert_eq!(summary.sites[1].status, UpdateStatus::BackupOnly);
        drop(held);
    }

    /// Реестр читается только после захвата блокировки сайта
    #[test]
    fn site_lock_is_taken_before_registry_read() {
        let fake = FakeHost::new();
        let u = updater(&fake);
        let held = LockCoordinator::guard(&u.site_lock("new.example.com"), HOUR)
            .unwrap()
            .unwrap();

        let report = run_one(&fake, "new.example.com", false);
        assert_eq!(report.status, UpdateStatus::Skip);
        assert_eq!(report.reason.as_deref(), Some("locked"));
        drop(held);

        // Запись, появившаяся пока сайт был заблокирован, видна следующему запуску
        wp_site(&fake, "new.example.com");
        assert_eq!(run_one(&fake, "new.example.com", false).status, UpdateStatus::BackupOnly);
    }

    #[test]
    fn concurrent_run_is_refused() {
        let fake = FakeHost::new();
        let u = updater(&fake);
        let _held = LockCoordinator::guard(&u.global_lock(), HOUR).unwrap().unwrap();
        assert!(u.run(&[], false).unwrap().is_none());
    }

    #[test]
    fn missing_and_non_wordpress_sites() {
        let fake = FakeHost::new();
        let mut html = wp_site(&fake, "static.example.com");
        html.site_type = SiteType::Html;
        fake.replace_entry(html);

        let summary = updater(&fake)
            .run(&["absent.example.com".into(), "static.example.com".into()], false)
            .unwrap()
            .unwrap();
        assert_eq!(summary.sites[0].status, UpdateStatus::Error);
        assert_eq!(summary.sites[1].status, UpdateStatus::Skip);
        assert_eq!(summary.sites[1].reason.as_deref(), Some("non-wordpress"));
        assert!(summary.has_errors());
    }

    #[test]
    fn summary_is_written_as_json() {
        let fake = FakeHost::new();
        wp_site(&fake, "example.com");
        fake.set_pending("example.com", plugin_update());
        fake.fail_on(Op::ApplyUpdates("example.com".into()));

        let summary = updater(&fake)
            .run(&["example.com".into()], false)
            .unwrap()
            .unwrap();
        let path = write_summary(&summary, &fake.root().join("log")).unwrap();
        assert!(path.file_name().unwrap().to_string_lossy().starts_with("run-"));

        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(json["sites"][0]["status"], "rolled_back");
        assert_eq!(json["sites"][0]["updates"]["plugins"], 1);
        assert!(json["finished_at"].is_string());
    }

    #[test]
    fn status_names_match_report_format() {
        assert_eq!(serde_json::to_value(UpdateStatus::BackupOnly).unwrap(), "backup-only");
        assert_eq!(serde_json::to_value(UpdateStatus::Noop).unwrap(), "noop");
        assert_eq!(serde_json::to_value(UpdateStatus::Ok).unwrap(), "ok");
        for status in [UpdateStatus::BackupOnly, UpdateStatus::RolledBack, UpdateStatus::Skip] {
            assert_eq!(serde_json::to_value(status).unwrap(), status.as_str());
        }
    }
}
