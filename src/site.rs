//! Команды `wo site`: создание, клонирование, резервное копирование и
//! восстановление сайтов поверх конвейера создания.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use log::{info, warn};

use crate::{
    backup::{self, ArchiveBackup, BackupKind, SiteArchiver},
    classifier::{self, SiteDescriptor, SiteKind, SiteTypeClassifier, SpecialOptions},
    collaborators::{HttpAuth, InstallOptions, SiteRegistry},
    config::{self, PhpVersionTable, WoConfig},
    database::MysqlServer,
    domain,
    error::{ConfigurationError, SiteError, ValidationError},
    nginx::NginxVhost,
    phpfpm::PhpFpmPools,
    pipeline::{
        ContentPlan, DatabasePlan, Host, PipelineRequest, ProvisionedSite, ProvisioningPipeline,
        RestoreSource, Step,
    },
    registry::{JsonRegistry, SiteRegistryEntry},
    resolver::{SiteFlags, SiteType, TypeResolver},
    shell::CommandRunner,
    wordpress::WpCli,
};

/// Реальные внешние системы, собранные из конфигурации
pub struct Services {
    pub config: WoConfig,
    pub runner: CommandRunner,
    pub registry: JsonRegistry,
    pub vhost: NginxVhost,
    pub database: MysqlServer,
    pub pool: PhpFpmPools,
    pub app: WpCli,
}

impl Services {
    pub fn new(config: WoConfig) -> Self {
        let runner = CommandRunner::new(config.audit_log.clone());
        Self {
            registry: JsonRegistry::new(&config.registry_path),
            vhost: NginxVhost::new(config.nginx.clone(), &config.php_fpm, runner.clone()),
            database: MysqlServer::new(config.mysql.clone(), runner.clone()),
            pool: PhpFpmPools::new(config.php_fpm.clone(), runner.clone()),
            app: WpCli::new(config.wordpress.clone(), runner.clone()),
            runner,
            config,
        }
    }

    pub fn host(&self) -> Host<'_> {
        Host {
            registry: &self.registry,
            vhost: &self.vhost,
            database: &self.database,
            pool: &self.pool,
            app: &self.app,
        }
    }

    pub fn archiver(&self) -> ArchiveBackup<'_> {
        ArchiveBackup::new(&self.database, self.runner.clone(), &self.config.nginx.acl_dir)
            .with_compression(self.config.backup_compression)
    }
}

/// Параметры `wo site create`
#[derive(Debug, Clone, Default)]
pub struct CreateRequest {
    pub domain: String,
    pub flags: SiteFlags,
    pub special: SpecialOptions,
    pub install: InstallOptions,
    pub secure: bool,
}

/// Какие сайты копировать
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupTarget {
    Site(String),
    All,
}

/// Итог восстановления одного каталога резервной копии
#[derive(Debug)]
pub struct RestoreOutcome {
    pub dir: PathBuf,
    pub domain: Option<String>,
    pub result: Result<ProvisionedSite, SiteError>,
}

/// Команды над сайтами, работающие с любым набором внешних систем
pub struct SiteCommands<'a> {
    host: Host<'a>,
    config: &'a WoConfig,
    progress: Option<&'a dyn Fn(Step)>,
}

impl<'a> SiteCommands<'a> {
    pub fn new(host: Host<'a>, config: &'a WoConfig) -> Self {
        Self {
            host,
            config,
            progress: None,
        }
    }

    /// Вызывается перед каждым шагом конвейера
    pub fn on_step(mut self, progress: &'a dyn Fn(Step)) -> Self {
        self.progress = Some(progress);
        self
    }

    fn pipeline(&self) -> ProvisioningPipeline<'a> {
        let pipeline =
            ProvisioningPipeline::new(self.host, &self.config.mysql, &self.config.webroot_base);
        match self.progress {
            Some(progress) => pipeline.on_step(progress),
            None => pipeline,
        }
    }

    /// Проверяет домен и определяет вид сайта по параметрам командной строки.
    ///
    /// Для сайтов с PHP без явно выбранной версии берется `php.default`.
    pub fn build_descriptor(
        &self,
        input: &str,
        flags: &SiteFlags,
        special: &SpecialOptions,
    ) -> Result<SiteDescriptor, SiteError> {
        let domain = domain::validate(input)?;
        let resolver = TypeResolver::new(self.config.php.versions.clone());
        let mut draft = SiteTypeClassifier::new(&resolver).classify(flags, special)?;

        if let SiteKind::Standard { site_type, .. } = draft.kind {
            if site_type.is_php_backed() && draft.php.is_none() {
                draft.php = Some(self.default_php()?);
            }
        }
        Ok(draft.for_domain(&domain))
    }

    fn default_php(&self) -> Result<config::PhpVersion, SiteError> {
        self.config
            .default_php()
            .cloned()
            .ok_or_else(|| ConfigurationError::UnknownPhpVersion(self.config.php.default.clone()).into())
    }

    /// `wo site create`
    ///
    /// # Arguments
    /// * `request` - домен, параметры типа и установки WordPress
    ///
    /// # Returns
    /// Созданный сайт; учетные данные администратора в `context.credentials`
    pub fn create(&self, request: &CreateRequest) -> Result<ProvisionedSite, SiteError> {
        let descriptor = self.build_descriptor(&request.domain, &request.flags, &request.special)?;

        let http_auth = request.secure.then(|| HttpAuth {
            user: request
                .install
                .admin_user
                .clone()
                .or_else(|| Some(self.config.wordpress.user.clone()).filter(|u| !u.is_empty()))
                .unwrap_or_else(|| "admin".to_string()),
            password: config::generate_password(),
        });

        info!(
            "Создание сайта {} (тип {}, кеш {})",
            descriptor.domain,
            descriptor.site_type(),
            descriptor.cache_type()
        );
        self.pipeline().run(PipelineRequest {
            webroot: self.config.webroot_for(&descriptor.domain),
            descriptor,
            database: DatabasePlan::Fresh,
            content: ContentPlan::Install(request.install.clone()),
            http_auth,
        })
    }

    /// `wo site clone`: копия сайта WordPress под новым доменом
    pub fn clone_site(&self, source: &str, dest: &str) -> Result<ProvisionedSite, SiteError> {
        let source = domain::validate(source)?;
        let dest = domain::validate(dest)?;

        let entry = self.registry_get(&source)?.ok_or_else(|| ValidationError::SiteMissing(source.clone()))?;
        if !entry.site_type.is_wordpress() {
            return Err(ValidationError::NotWordPress {
                domain: source,
                site_type: entry.site_type.to_string(),
            }
            .into());
        }

        let descriptor = descriptor_from_entry(&entry, &dest, &self.config.php.versions)
            .or_else(|_| {
                // Версии PHP источника больше нет в таблице
                warn!(
                    "Версия PHP {:?} сайта {} не поддерживается, используется {}",
                    entry.php_version, source, self.config.php.default
                );
                Ok::<_, SiteError>(SiteDescriptor {
                    domain: dest.clone(),
                    kind: SiteKind::Standard {
                        site_type: entry.site_type,
                        cache_type: entry.cache_type,
                    },
                    php: Some(self.default_php()?),
                })
            })?;

        info!("Клонирование {} в {}", source, dest);
        self.pipeline().run(PipelineRequest {
            webroot: self.config.webroot_for(&dest),
            descriptor,
            database: DatabasePlan::Fresh,
            content: ContentPlan::Clone(entry),
            http_auth: None,
        })
    }

    /// `wo site restore` для распакованного каталога.
    ///
    /// Каждый найденный `vhost.json` восстанавливается отдельно; ошибка
    /// одного сайта не прерывает остальные.
    pub fn restore(&self, root: &Path) -> Result<Vec<RestoreOutcome>> {
        let dirs = backup::find_backup_dirs(root)?;
        if dirs.is_empty() {
            return Err(anyhow!("в {:?} не найдено резервных копий ({})", root, backup::METADATA_FILE));
        }

        Ok(dirs
            .into_iter()
            .map(|dir| match backup::read_metadata(&dir) {
                Ok(meta) => RestoreOutcome {
                    domain: Some(meta.site.domain.clone()),
                    result: self.restore_one(&dir, meta),
                    dir,
                },
                Err(cause) => RestoreOutcome {
                    domain: None,
                    result: Err(SiteError::ProvisioningFailed {
                        step: Step::ValidateDomainUnique,
                        message: format!("{:#}", cause),
                        cause,
                    }),
                    dir,
                },
            })
            .collect())
    }

    fn restore_one(&self, dir: &Path, meta: backup::BackupMetadata) -> Result<ProvisionedSite, SiteError> {
        let site = meta.site;
        let domain = domain::validate(&site.domain)?;
        let descriptor = descriptor_from_entry(&site, &domain, &self.config.php.versions)?;

        let database = match &site.db {
            Some(db) => DatabasePlan::Reuse(db.clone()),
            None => DatabasePlan::Fresh,
        };
        let sql = backup::sql_dump_path(dir, &domain);

        info!("Восстановление {} из {:?}", domain, dir);
        self.pipeline().run(PipelineRequest {
            webroot: self.config.webroot_for(&domain),
            descriptor,
            database,
            content: ContentPlan::Restore(RestoreSource {
                dir: dir.to_path_buf(),
                sql: sql.is_file().then_some(sql),
            }),
            http_auth: meta.http_auth,
        })
    }

    fn registry_get(&self, domain: &str) -> Result<Option<SiteRegistryEntry>, SiteError> {
        self.host.registry.get(domain).map_err(|cause| SiteError::ProvisioningFailed {
            step: Step::ValidateDomainUnique,
            message: "реестр сайтов недоступен".to_string(),
            cause,
        })
    }
}

/// Восстанавливает описание сайта из записи реестра под доменом `domain`
pub fn descriptor_from_entry(
    entry: &SiteRegistryEntry,
    domain: &str,
    versions: &PhpVersionTable,
) -> Result<SiteDescriptor, SiteError> {
    let target = entry.target.clone();
    let kind = match entry.site_type {
        SiteType::Proxy => {
            let (host, port) = classifier::parse_proxy(target.as_deref().unwrap_or_default())?;
            SiteKind::Proxy { host, port }
        }
        SiteType::Alias => SiteKind::Alias {
            target: target.ok_or(ConfigurationError::MissingAliasName)?,
        },
        SiteType::Subsite => SiteKind::Subsite {
            parent: target.ok_or(ConfigurationError::MissingParentName)?,
        },
        site_type => SiteKind::Standard {
            site_type,
            cache_type: entry.cache_type,
        },
    };

    let php = match &kind {
        SiteKind::Standard { site_type, .. } if site_type.is_php_backed() => {
            let number = entry.php_version.clone().unwrap_or_default();
            Some(
                versions
                    .by_number(&number)
                    .cloned()
                    .ok_or(ConfigurationError::UnknownPhpVersion(number))?,
            )
        }
        _ => None,
    };

    Ok(SiteDescriptor {
        domain: domain.to_string(),
        kind,
        php,
    })
}

/// `wo site backup`
///
/// # Arguments
/// * `keep` - сколько последних архивов оставить для каждого сайта
///
/// # Returns
/// Пути созданных архивов
pub fn backup_sites(
    registry: &dyn SiteRegistry,
    archiver: &dyn SiteArchiver,
    backup_root: Option<&Path>,
    target: &BackupTarget,
    kind: BackupKind,
    keep: Option<usize>,
) -> Result<Vec<PathBuf>> {
    let sites = match target {
        BackupTarget::Site(name) => {
            let name = domain::validate(name)?;
            vec![registry
                .get(&name)?
                .ok_or(ValidationError::SiteMissing(name))?]
        }
        BackupTarget::All => registry
            .all()?
            .into_iter()
            .filter(|s| s.enabled && !matches!(s.site_type, SiteType::Proxy | SiteType::Alias))
            .collect(),
    };

    let mut archives = Vec::new();
    for site in &sites {
        let root = backup::backup_root_for(backup_root, site);
        let archive = archiver.archive(site, kind, &root)?;
        if let Some(keep) = keep {
            backup::prune(&root.join(&site.domain), keep)?;
        }
        archives.push(archive);
    }
    Ok(archives)
}
