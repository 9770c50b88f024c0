use std::{
    fmt,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context, Result};
use log::{debug, error, info};

use crate::{
    classifier::{SiteDescriptor, SiteKind},
    collaborators::{
        Application, DatabaseServer, DbCredentials, HttpAuth, InstallOptions, PoolSpec,
        ProcessPool, SiteRegistry, VhostManager, WpCredentials,
    },
    compensation::CompensationController,
    config::{self, MysqlSettings},
    domain,
    error::{RegistryError, SiteError, ValidationError},
    naming::{self, IdentifierKind},
    registry::{SiteRegistryEntry, SiteUpdate},
    resolver::SiteType,
    utils,
};

/// Шаг конвейера создания сайта
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    ValidateDomainUnique,
    RenderVhostAndWebroot,
    ConfigureProcessPool,
    ProvisionDatabase,
    InstallApplication,
    Finalize,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValidateDomainUnique => "validate_domain_unique",
            Self::RenderVhostAndWebroot => "render_vhost_and_webroot",
            Self::ConfigureProcessPool => "configure_process_pool",
            Self::ProvisionDatabase => "provision_database",
            Self::InstallApplication => "install_application",
            Self::Finalize => "finalize",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Изменяемое состояние одного запуска конвейера
#[derive(Debug, Clone)]
pub struct BuildContext {
    pub domain: String,
    pub webroot: PathBuf,
    pub pool_name: String,
    pub php_fpm_user: String,
    pub php_version: Option<String>,
    pub db_name: Option<String>,
    pub db_user: Option<String>,
    pub db_password: Option<String>,
    pub db_host: Option<String>,
    /// Хост, для которого выдаются права пользователю базы
    pub grant_host: String,
    pub http_auth: Option<HttpAuth>,
    /// Каталог родительского мультисайта (для подсайта)
    pub parent_webroot: Option<PathBuf>,
    pub completed_steps: Vec<Step>,
    /// В реестр добавлена незавершенная запись этого запуска
    pub registry_reserved: bool,
    pub credentials: Option<WpCredentials>,
}

impl BuildContext {
    pub fn new(descriptor: &SiteDescriptor, webroot: PathBuf, grant_host: &str) -> Self {
        let pool_name = domain::slug(&descriptor.domain);
        Self {
            domain: descriptor.domain.clone(),
            webroot,
            php_fpm_user: format!("php-{}", pool_name),
            pool_name,
            php_version: descriptor.php_number().map(str::to_string),
            db_name: None,
            db_user: None,
            db_password: None,
            db_host: None,
            grant_host: grant_host.to_string(),
            http_auth: None,
            parent_webroot: None,
            completed_steps: Vec::new(),
            registry_reserved: false,
            credentials: None,
        }
    }

    pub fn htdocs(&self) -> PathBuf {
        self.webroot.join("htdocs")
    }

    pub fn db_credentials(&self) -> Option<DbCredentials> {
        Some(DbCredentials {
            name: self.db_name.clone()?,
            user: self.db_user.clone()?,
            password: self.db_password.clone()?,
            host: self.db_host.clone()?,
        })
    }

    pub fn pool_spec(&self) -> Option<PoolSpec> {
        Some(PoolSpec {
            pool_name: self.pool_name.clone(),
            user: self.php_fpm_user.clone(),
            php_version: self.php_version.clone()?,
            webroot: self.webroot.clone(),
        })
    }
}

/// Откуда берутся учетные данные базы
#[derive(Debug, Clone)]
pub enum DatabasePlan {
    /// Новые имена из домена и сгенерированный пароль
    Fresh,
    /// Учетные данные из резервной копии; база не должна существовать
    Reuse(DbCredentials),
}

/// Каталог восстанавливаемой резервной копии
#[derive(Debug, Clone)]
pub struct RestoreSource {
    pub dir: PathBuf,
    pub sql: Option<PathBuf>,
}

/// Чем заполняется сайт на шаге установки приложения
#[derive(Debug, Clone)]
pub enum ContentPlan {
    Install(InstallOptions),
    Clone(SiteRegistryEntry),
    Restore(RestoreSource),
}

#[derive(Debug, Clone)]
pub struct PipelineRequest {
    pub descriptor: SiteDescriptor,
    pub webroot: PathBuf,
    pub database: DatabasePlan,
    pub content: ContentPlan,
    pub http_auth: Option<HttpAuth>,
}

/// Набор внешних систем, с которыми работает конвейер
#[derive(Clone, Copy)]
pub struct Host<'a> {
    pub registry: &'a dyn SiteRegistry,
    pub vhost: &'a dyn VhostManager,
    pub database: &'a dyn DatabaseServer,
    pub pool: &'a dyn ProcessPool,
    pub app: &'a dyn Application,
}

/// Результат успешного создания сайта
#[derive(Debug, Clone)]
pub struct ProvisionedSite {
    pub descriptor: SiteDescriptor,
    pub context: BuildContext,
}

pub struct ProvisioningPipeline<'a> {
    host: Host<'a>,
    db_host: String,
    grant_host: String,
    webroot_base: PathBuf,
    on_step: Option<Box<dyn Fn(Step) + 'a>>,
}

impl<'a> ProvisioningPipeline<'a> {
    pub fn new(host: Host<'a>, mysql: &MysqlSettings, webroot_base: &Path) -> Self {
        Self {
            host,
            db_host: mysql.host.clone(),
            grant_host: mysql.grant_host.clone(),
            webroot_base: webroot_base.to_path_buf(),
            on_step: None,
        }
    }

    /// Вызывается перед каждым шагом (например, для индикатора выполнения)
    pub fn on_step(mut self, callback: impl Fn(Step) + 'a) -> Self {
        self.on_step = Some(Box::new(callback));
        self
    }

    /// Шаги, которые будут выполнены для данного сайта, по порядку
    pub fn plan(descriptor: &SiteDescriptor, content: &ContentPlan) -> Vec<Step> {
        let mut steps = vec![Step::ValidateDomainUnique, Step::RenderVhostAndWebroot];

        if let SiteKind::Standard { site_type, .. } = descriptor.kind {
            if site_type.is_php_backed() {
                steps.push(Step::ConfigureProcessPool);
            }
            if site_type.is_db_backed() {
                steps.push(Step::ProvisionDatabase);
            }
            let installs = match content {
                ContentPlan::Install(_) => site_type.is_wordpress(),
                ContentPlan::Clone(_) | ContentPlan::Restore(_) => true,
            };
            if installs {
                steps.push(Step::InstallApplication);
            }
        }

        steps.push(Step::Finalize);
        steps
    }

    /// Создает сайт; при ошибке любого шага откатывает выполненные шаги.
    ///
    /// # Returns
    /// * `SiteError::Configuration`/`SiteError::Validation` - входные данные
    ///   неверны, ничего не создано
    /// * `SiteError::ProvisioningFailed` - шаг завершился ошибкой, изменения откатаны
    pub fn run(&self, request: PipelineRequest) -> Result<ProvisionedSite, SiteError> {
        let parent = self.check_preconditions(&request)?;

        let mut ctx = BuildContext::new(&request.descriptor, request.webroot.clone(), &self.grant_host);
        ctx.http_auth = request.http_auth.clone();
        if let Some(parent) = parent {
            ctx.parent_webroot = Some(parent.webroot);
            ctx.php_version = parent.php_version;
        }

        for step in Self::plan(&request.descriptor, &request.content) {
            if let Some(callback) = &self.on_step {
                callback(step);
            }
            info!("{}: шаг {}", request.descriptor.domain, step);

            if let Err(cause) = self.execute(step, &request, &mut ctx) {
                return Err(self.fail(step, cause, &mut ctx, &request.descriptor));
            }
            ctx.completed_steps.push(step);
        }

        info!("Сайт {} успешно создан", request.descriptor.domain);
        Ok(ProvisionedSite {
            descriptor: request.descriptor,
            context: ctx,
        })
    }

    fn check_preconditions(
        &self,
        request: &PipelineRequest,
    ) -> Result<Option<SiteRegistryEntry>, SiteError> {
        let descriptor = &request.descriptor;
        let name = &descriptor.domain;

        if domain::validate(name)? != *name {
            return Err(ValidationError::InvalidDomain(name.clone()).into());
        }
        if self.registry_call(|r| r.exists(name))? {
            return Err(ValidationError::SiteExists(name.clone()).into());
        }
        if self.host.vhost.config_exists(name) {
            return Err(ValidationError::VhostExists(name.clone()).into());
        }
        if !utils::is_missing_or_empty(&request.webroot) {
            return Err(ValidationError::WebrootExists(request.webroot.clone()).into());
        }

        let SiteKind::Subsite { parent } = &descriptor.kind else {
            return Ok(None);
        };
        let entry = self
            .registry_call(|r| r.get(parent))?
            .ok_or_else(|| ValidationError::ParentMissing(parent.clone()))?;
        if !entry.enabled {
            return Err(ValidationError::ParentDisabled(parent.clone()).into());
        }
        if !entry.site_type.is_multisite() {
            return Err(ValidationError::ParentNotMultisite(parent.clone()).into());
        }
        Ok(Some(entry))
    }

    fn registry_call<T>(
        &self,
        call: impl FnOnce(&dyn SiteRegistry) -> Result<T>,
    ) -> Result<T, SiteError> {
        call(self.host.registry).map_err(|cause| SiteError::ProvisioningFailed {
            step: Step::ValidateDomainUnique,
            message: "реестр сайтов недоступен".to_string(),
            cause,
        })
    }

    fn execute(&self, step: Step, request: &PipelineRequest, ctx: &mut BuildContext) -> Result<()> {
        let descriptor = &request.descriptor;
        match step {
            Step::ValidateDomainUnique => self.reserve_domain(descriptor, ctx),
            Step::RenderVhostAndWebroot => self.host.vhost.render(descriptor, ctx),
            Step::ConfigureProcessPool => {
                let pool = ctx
                    .pool_spec()
                    .ok_or_else(|| anyhow!("не выбрана версия PHP для {}", ctx.domain))?;
                self.host.pool.configure(&pool)
            }
            Step::ProvisionDatabase => self.provision_database(descriptor, &request.database, ctx),
            Step::InstallApplication => self.install_application(descriptor, &request.content, ctx),
            Step::Finalize => self.finalize(descriptor, ctx),
        }
    }

    fn reserve_domain(&self, descriptor: &SiteDescriptor, ctx: &mut BuildContext) -> Result<()> {
        let mut entry = SiteRegistryEntry::pending(
            &descriptor.domain,
            descriptor.site_type(),
            descriptor.cache_type(),
            &ctx.webroot,
        );
        entry.php_version = ctx.php_version.clone();
        entry.target = target_of(&descriptor.kind);

        self.host.registry.create(entry)?;
        ctx.registry_reserved = true;
        Ok(())
    }

    fn provision_database(
        &self,
        descriptor: &SiteDescriptor,
        plan: &DatabasePlan,
        ctx: &mut BuildContext,
    ) -> Result<()> {
        let db = self.host.database;
        let credentials = match plan {
            DatabasePlan::Fresh => {
                let ids = naming::derive_db_identifiers(&descriptor.domain);
                let mut collided = false;
                let name = naming::resolve(&ids.name, IdentifierKind::Database, |candidate| {
                    collided = db.exists(candidate)?;
                    Ok(collided)
                })?;
                let user = naming::resolve(&ids.user, IdentifierKind::User, |candidate| {
                    Ok(collided || db.user_exists(candidate, &ctx.grant_host)?)
                })?;
                DbCredentials {
                    name,
                    user,
                    password: config::generate_password(),
                    host: self.db_host.clone(),
                }
            }
            DatabasePlan::Reuse(recorded) => {
                if db.exists(&recorded.name)? {
                    return Err(anyhow!("база данных {} уже существует", recorded.name));
                }
                if db.user_exists(&recorded.user, &ctx.grant_host)? {
                    return Err(anyhow!("пользователь {} уже существует", recorded.user));
                }
                recorded.clone()
            }
        };

        // В контекст попадает только то, что создано этим запуском
        db.create(&credentials.name)?;
        ctx.db_name = Some(credentials.name.clone());
        db.create_user(&credentials.user, &ctx.grant_host, &credentials.password)?;
        ctx.db_user = Some(credentials.user.clone());
        ctx.db_password = Some(credentials.password.clone());
        ctx.db_host = Some(credentials.host.clone());

        db.grant(&credentials.user, &ctx.grant_host, &credentials.name)?;
        info!("Создана база данных {} для {}", credentials.name, ctx.domain);

        if descriptor.site_type() == SiteType::Mysql {
            write_db_config(&ctx.webroot, &credentials)?;
        }
        Ok(())
    }

    fn install_application(
        &self,
        descriptor: &SiteDescriptor,
        content: &ContentPlan,
        ctx: &mut BuildContext,
    ) -> Result<()> {
        let app = self.host.app;
        match content {
            ContentPlan::Install(options) => {
                ctx.credentials = app.install(descriptor, ctx, options)?;
            }
            ContentPlan::Clone(source) => {
                app.copy_content(&source.webroot, ctx)?;
                let source_db = source
                    .db
                    .as_ref()
                    .ok_or_else(|| anyhow!("у сайта {} нет базы данных", source.domain))?;
                let target_db = ctx
                    .db_name
                    .clone()
                    .ok_or_else(|| anyhow!("база данных для {} не создана", ctx.domain))?;

                let staging = tempfile::tempdir().context("Не удалось создать временный каталог")?;
                let dump = staging.path().join(format!("{}.sql", source_db.name));
                self.host.database.dump(&source_db.name, &dump)?;
                self.host.database.import(&target_db, &dump)?;

                app.write_config(descriptor, ctx)?;
                app.search_replace(ctx, &source.domain, &descriptor.domain)?;
            }
            ContentPlan::Restore(source) => {
                app.copy_content(&source.dir, ctx)?;
                if let (Some(sql), Some(name)) = (&source.sql, &ctx.db_name) {
                    self.host.database.import(name, sql)?;
                }
            }
        }
        Ok(())
    }

    fn finalize(&self, descriptor: &SiteDescriptor, ctx: &BuildContext) -> Result<()> {
        if !self.host.vhost.reload()? {
            return Err(anyhow!("не удалось перезагрузить nginx, проверьте `nginx -t`"));
        }

        self.host.registry.update(
            &descriptor.domain,
            SiteUpdate {
                enabled: Some(true),
                php_version: ctx.php_version.clone(),
                db: ctx.db_credentials(),
                ..Default::default()
            },
        )
    }

    fn fail(
        &self,
        step: Step,
        cause: anyhow::Error,
        ctx: &mut BuildContext,
        descriptor: &SiteDescriptor,
    ) -> SiteError {
        error!("{}: шаг {} завершился с ошибкой: {}", ctx.domain, step, cause);
        debug!("Подробности ошибки шага {}: {:?}", step, cause);

        let mut steps = ctx.completed_steps.clone();
        steps.push(step);
        let report = CompensationController::new(self.host, &self.webroot_base).rollback(&steps, ctx, descriptor);
        if !report.is_clean() {
            error!(
                "Откат {} выполнен не полностью: {}",
                ctx.domain,
                report.failures.join("; ")
            );
        }

        if let Some(RegistryError::AlreadyExists(name)) = cause.downcast_ref::<RegistryError>() {
            return ValidationError::SiteExists(name.clone()).into();
        }

        SiteError::ProvisioningFailed {
            step,
            message: cause.to_string(),
            cause,
        }
    }
}

/// Данные вида сайта, сохраняемые в реестре
pub fn target_of(kind: &SiteKind) -> Option<String> {
    match kind {
        SiteKind::Standard { .. } => None,
        SiteKind::Proxy { host, port } => Some(format!("{}:{}", host, port)),
        SiteKind::Alias { target } => Some(target.clone()),
        SiteKind::Subsite { parent } => Some(parent.clone()),
    }
}

/// `wo-config.php` с учетными данными для сайтов типа mysql
fn write_db_config(webroot: &Path, db: &DbCredentials) -> Result<()> {
    let contents = format!(
        "<?php \ndefine('DB_NAME', '{}');\ndefine('DB_USER', '{}'); \ndefine('DB_PASSWORD', '{}');\ndefine('DB_HOST', '{}');\n?>",
        db.name, db.user, db.password, db.host
    );
    utils::write_file(&webroot.join("wo-config.php"), &contents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        classifier::SiteDraft,
        config::PhpVersion,
        resolver::CacheType,
        testing::{FakeHost, Op},
    };
    use rstest::rstest;

    fn descriptor(domain: &str, kind: SiteKind) -> SiteDescriptor {
        let php = match &kind {
            SiteKind::Standard { site_type, .. } if site_type.is_php_backed() => {
                Some(PhpVersion::new("php83", "8.3"))
            }
            _ => None,
        };
        SiteDraft { kind, php }.for_domain(domain)
    }

    fn standard(site_type: SiteType) -> SiteKind {
        SiteKind::Standard {
            site_type,
            cache_type: CacheType::Basic,
        }
    }

    fn request(fake: &FakeHost, descriptor: SiteDescriptor) -> PipelineRequest {
        PipelineRequest {
            webroot: fake.webroot_base().join(&descriptor.domain),
            descriptor,
            database: DatabasePlan::Fresh,
            content: ContentPlan::Install(InstallOptions::default()),
            http_auth: None,
        }
    }

    fn run(fake: &FakeHost, request: PipelineRequest) -> Result<ProvisionedSite, SiteError> {
        ProvisioningPipeline::new(fake.host(), &MysqlSettings::default(), &fake.webroot_base())
            .run(request)
    }

    #[rstest]
    #[case(SiteType::Html, vec![Step::ValidateDomainUnique, Step::RenderVhostAndWebroot, Step::Finalize])]
    #[case(SiteType::Php, vec![Step::ValidateDomainUnique, Step::RenderVhostAndWebroot, Step::ConfigureProcessPool, Step::Finalize])]
    #[case(SiteType::Mysql, vec![Step::ValidateDomainUnique, Step::RenderVhostAndWebroot, Step::ConfigureProcessPool, Step::ProvisionDatabase, Step::Finalize])]
    #[case(SiteType::WpSubdomain, vec![Step::ValidateDomainUnique, Step::RenderVhostAndWebroot, Step::ConfigureProcessPool, Step::ProvisionDatabase, Step::InstallApplication, Step::Finalize])]
    fn plan_depends_on_site_type(#[case] site_type: SiteType, #[case] expected: Vec<Step>) {
        let d = descriptor("example.com", standard(site_type));
        let plan = ProvisioningPipeline::plan(&d, &ContentPlan::Install(InstallOptions::default()));
        assert_eq!(plan, expected);
    }

    #[rstest]
    #[case(SiteKind::Proxy { host: "127.0.0.1".into(), port: "80".into() })]
    #[case(SiteKind::Alias { target: "example.org".into() })]
    #[case(SiteKind::Subsite { parent: "net.example.com".into() })]
    fn virtual_sites_skip_pool_database_and_install(#[case] kind: SiteKind) {
        let d = descriptor("example.com", kind);
        let plan = ProvisioningPipeline::plan(&d, &ContentPlan::Install(InstallOptions::default()));
        assert_eq!(
            plan,
            vec![Step::ValidateDomainUnique, Step::RenderVhostAndWebroot, Step::Finalize]
        );
    }

    #[test]
    fn names_are_derived_from_domain() {
        let d = descriptor("Blog.Example.com", standard(SiteType::Php));
        let ctx = BuildContext::new(&d, PathBuf::from("/var/www/blog.example.com"), "localhost");
        assert_eq!(ctx.pool_name, "blog-example-com");
        assert_eq!(ctx.php_fpm_user, "php-blog-example-com");
        assert_eq!(ctx.php_version.as_deref(), Some("8.3"));
    }

    #[test]
    fn wordpress_site_is_fully_provisioned() {
        let fake = FakeHost::new();
        let d = descriptor("example.com", standard(SiteType::Wp));
        let site = run(&fake, request(&fake, d)).unwrap();

        assert_eq!(
            site.context.completed_steps,
            ProvisioningPipeline::plan(&site.descriptor, &ContentPlan::Install(InstallOptions::default()))
        );
        let entry = fake.registry_entry("example.com").unwrap();
        assert!(entry.enabled);
        assert_eq!(entry.db.as_ref().unwrap().name, "example_com");
        assert_eq!(entry.php_version.as_deref(), Some("8.3"));
        assert!(fake.has_database("example_com"));
        assert!(fake.has_user("examplecom"));
        assert!(fake.has_pool("example-com"));
        assert!(site.context.credentials.is_some());
        assert!(fake.webroot_base().join("example.com/htdocs").exists());
    }

    #[test]
    fn colliding_database_name_gets_suffix_for_name_and_user() {
        let fake = FakeHost::new();
        fake.add_database("example_com");

        let site = run(&fake, request(&fake, descriptor("example.com", standard(SiteType::Wp)))).unwrap();
        let name = site.context.db_name.unwrap();
        let user = site.context.db_user.unwrap();
        assert!(name.starts_with("example_com_") && name.len() == 20);
        assert!(user.starts_with("examplecom") && user.len() == 14);
    }

    #[test]
    fn existing_user_gets_suffix_even_when_database_name_is_free() {
        let fake = FakeHost::new();
        fake.add_user("examplecom");

        let site = run(&fake, request(&fake, descriptor("example.com", standard(SiteType::Wp)))).unwrap();
        assert_eq!(site.context.db_name.as_deref(), Some("example_com"));
        let user = site.context.db_user.unwrap();
        assert!(user.starts_with("examplecom") && user.len() == 14);
        assert!(fake.has_user("examplecom"));
    }

    /// Домены с общим 12-символьным префиксом дают одинаковое имя пользователя
    #[test]
    fn failed_user_creation_keeps_other_sites_user() {
        let fake = FakeHost::new();
        run(&fake, request(&fake, descriptor("mywordpresssite1.com", standard(SiteType::Wp)))).unwrap();
        assert!(fake.has_user("mywordpresss"));

        fake.fail_on(Op::CreateUser("mywordpresss".into()));
        // Пользователь занят, поэтому второй сайт получает имя с суффиксом
        let second = run(&fake, request(&fake, descriptor("mywordpresssite2.com", standard(SiteType::Wp)))).unwrap();
        assert_ne!(second.context.db_user.as_deref(), Some("mywordpresss"));
        assert!(fake.has_user("mywordpresss"));
        assert!(!fake.journal().contains(&Op::DropUser("mywordpresss".into())));
    }

    #[test]
    fn user_is_not_dropped_when_its_creation_failed() {
        let fake = FakeHost::new();
        fake.fail_on(Op::CreateUser("examplecom".into()));

        let err = run(&fake, request(&fake, descriptor("example.com", standard(SiteType::Wp)))).unwrap_err();

        assert!(matches!(
            err,
            SiteError::ProvisioningFailed { step: Step::ProvisionDatabase, .. }
        ));
        let journal = fake.journal();
        assert!(journal.contains(&Op::DropDatabase("example_com".into())));
        assert!(!journal.iter().any(|op| matches!(op, Op::DropUser(_))));
    }

    #[test]
    fn reused_credentials_fail_when_user_exists() {
        let fake = FakeHost::new();
        fake.add_user("olduser");
        let mut req = request(&fake, descriptor("example.com", standard(SiteType::Mysql)));
        req.database = DatabasePlan::Reuse(DbCredentials {
            name: "old_db".into(),
            user: "olduser".into(),
            password: "pw".into(),
            host: "localhost".into(),
        });

        run(&fake, req).unwrap_err();
        assert!(fake.has_user("olduser"));
        assert!(!fake.journal().contains(&Op::DropUser("olduser".into())));
    }

    #[test]
    fn mysql_site_gets_db_config_file() {
        let fake = FakeHost::new();
        run(&fake, request(&fake, descriptor("example.com", standard(SiteType::Mysql)))).unwrap();

        let config = std::fs::read_to_string(fake.webroot_base().join("example.com/wo-config.php")).unwrap();
        assert!(config.contains("define('DB_NAME', 'example_com');"));
        assert!(!fake.journal().contains(&Op::Install("example.com".into())));
    }

    /// Сайт типа mysql, ошибка при настройке пула
    #[test]
    fn failure_in_pool_step_rolls_back_vhost_and_webroot() {
        let fake = FakeHost::new();
        fake.fail_on(Op::ConfigurePool("example-com".into()));

        let err = run(&fake, request(&fake, descriptor("example.com", standard(SiteType::Mysql)))).unwrap_err();

        assert!(matches!(
            err,
            SiteError::ProvisioningFailed { step: Step::ConfigureProcessPool, .. }
        ));
        assert!(!fake.has_vhost("example.com"));
        assert!(!fake.webroot_base().join("example.com").exists());
        assert!(fake.databases().is_empty());
        assert!(fake.users().is_empty());
        assert!(!fake.has_pool("example-com"));
        assert!(fake.registry_entry("example.com").is_none());
    }

    #[test]
    fn failure_in_install_drops_database_and_user() {
        let fake = FakeHost::new();
        fake.fail_on(Op::Install("example.com".into()));

        let err = run(&fake, request(&fake, descriptor("example.com", standard(SiteType::Wp)))).unwrap_err();

        assert!(matches!(
            err,
            SiteError::ProvisioningFailed { step: Step::InstallApplication, .. }
        ));
        let journal = fake.journal();
        assert!(journal.contains(&Op::DropDatabase("example_com".into())));
        assert!(journal.contains(&Op::DropUser("examplecom".into())));
        assert!(fake.databases().is_empty());
        assert!(fake.users().is_empty());
        assert!(!fake.has_pool("example-com"));
        assert!(!fake.webroot_base().join("example.com").exists());
        assert!(fake.registry_entry("example.com").is_none());
    }

    #[test]
    fn compensation_runs_in_reverse_order() {
        let fake = FakeHost::new();
        fake.fail_on(Op::Reload);

        run(&fake, request(&fake, descriptor("example.com", standard(SiteType::Wp)))).unwrap_err();

        let journal = fake.journal();
        let pos = |op: &Op| journal.iter().position(|o| o == op).unwrap();
        let drop_db = pos(&Op::DropDatabase("example_com".into()));
        let remove_pool = pos(&Op::RemovePool("example-com".into()));
        let remove_vhost = pos(&Op::RemoveVhost("example.com".into()));
        let delete_entry = pos(&Op::RegistryDelete("example.com".into()));
        assert!(drop_db < remove_pool && remove_pool < remove_vhost && remove_vhost < delete_entry);
    }

    #[rstest]
    #[case(Op::RenderVhost("example.com".into()), Step::RenderVhostAndWebroot)]
    #[case(Op::ConfigurePool("example-com".into()), Step::ConfigureProcessPool)]
    #[case(Op::CreateDatabase("example_com".into()), Step::ProvisionDatabase)]
    #[case(Op::Grant("examplecom".into()), Step::ProvisionDatabase)]
    #[case(Op::Install("example.com".into()), Step::InstallApplication)]
    #[case(Op::Reload, Step::Finalize)]
    fn any_failing_step_leaves_nothing_behind(#[case] failing: Op, #[case] step: Step) {
        let fake = FakeHost::new();
        fake.fail_on(failing);

        let err = run(&fake, request(&fake, descriptor("example.com", standard(SiteType::Wp)))).unwrap_err();

        match err {
            SiteError::ProvisioningFailed { step: failed, .. } => assert_eq!(failed, step),
            other => panic!("неожиданная ошибка: {other:?}"),
        }
        assert!(!fake.has_vhost("example.com"));
        assert!(!fake.webroot_base().join("example.com").exists());
        assert!(fake.databases().is_empty());
        assert!(fake.users().is_empty());
        assert!(fake.pools().is_empty());
        assert!(fake.registry_entry("example.com").is_none());
    }

    #[test]
    fn existing_site_is_a_validation_error() {
        let fake = FakeHost::new();
        run(&fake, request(&fake, descriptor("example.com", standard(SiteType::Html)))).unwrap();

        let err = run(&fake, request(&fake, descriptor("example.com", standard(SiteType::Html)))).unwrap_err();
        assert!(matches!(
            err,
            SiteError::Validation(ValidationError::SiteExists(_))
        ));
        assert!(fake.registry_entry("example.com").unwrap().enabled);
    }

    #[test]
    fn race_on_registry_insert_is_reported_as_existing_site() {
        let fake = FakeHost::new();
        fake.hide_from_exists("example.com");
        fake.insert_entry(SiteRegistryEntry::pending(
            "example.com",
            SiteType::Html,
            CacheType::Basic,
            Path::new("/elsewhere"),
        ));

        let err = run(&fake, request(&fake, descriptor("example.com", standard(SiteType::Html)))).unwrap_err();
        assert!(matches!(
            err,
            SiteError::Validation(ValidationError::SiteExists(_))
        ));
        // Чужая запись не удаляется
        assert!(fake.registry_entry("example.com").is_some());
        assert!(!fake.journal().contains(&Op::RenderVhost("example.com".into())));
    }

    #[test]
    fn non_empty_webroot_is_rejected() {
        let fake = FakeHost::new();
        let webroot = fake.webroot_base().join("example.com");
        std::fs::create_dir_all(&webroot).unwrap();
        std::fs::write(webroot.join("index.html"), "old").unwrap();

        let err = run(&fake, request(&fake, descriptor("example.com", standard(SiteType::Html)))).unwrap_err();
        assert!(matches!(
            err,
            SiteError::Validation(ValidationError::WebrootExists(_))
        ));
        assert!(webroot.join("index.html").exists());
    }

    #[test]
    fn subsite_requires_enabled_multisite_parent() {
        let fake = FakeHost::new();
        let sub = || descriptor("shop.example.com", SiteKind::Subsite { parent: "example.com".into() });

        let err = run(&fake, request(&fake, sub())).unwrap_err();
        assert!(matches!(err, SiteError::Validation(ValidationError::ParentMissing(_))));

        let mut parent = SiteRegistryEntry::pending(
            "example.com",
            SiteType::Wp,
            CacheType::Basic,
            &fake.webroot_base().join("example.com"),
        );
        fake.insert_entry(parent.clone());
        let err = run(&fake, request(&fake, sub())).unwrap_err();
        assert!(matches!(err, SiteError::Validation(ValidationError::ParentDisabled(_))));

        parent.enabled = true;
        fake.replace_entry(parent.clone());
        let err = run(&fake, request(&fake, sub())).unwrap_err();
        assert!(matches!(err, SiteError::Validation(ValidationError::ParentNotMultisite(_))));

        parent.site_type = SiteType::WpSubdomain;
        parent.php_version = Some("8.2".into());
        fake.replace_entry(parent);
        let site = run(&fake, request(&fake, sub())).unwrap();
        assert_eq!(
            site.context.parent_webroot,
            Some(fake.webroot_base().join("example.com"))
        );
        assert_eq!(site.context.php_version.as_deref(), Some("8.2"));
        assert_eq!(
            fake.registry_entry("shop.example.com").unwrap().target.as_deref(),
            Some("example.com")
        );
    }

    #[test]
    fn reused_credentials_fail_when_database_exists() {
        let fake = FakeHost::new();
        fake.add_database("old_db");
        let mut req = request(&fake, descriptor("example.com", standard(SiteType::Mysql)));
        req.database = DatabasePlan::Reuse(DbCredentials {
            name: "old_db".into(),
            user: "olduser".into(),
            password: "pw".into(),
            host: "localhost".into(),
        });

        let err = run(&fake, req).unwrap_err();
        assert!(matches!(
            err,
            SiteError::ProvisioningFailed { step: Step::ProvisionDatabase, .. }
        ));
        // Существовавшая база не тронута
        assert!(fake.has_database("old_db"));
        assert!(!fake.journal().contains(&Op::DropDatabase("old_db".into())));
    }

    #[test]
    fn on_step_callback_sees_every_step() {
        let fake = FakeHost::new();
        let seen = std::cell::RefCell::new(Vec::new());
        let pipeline =
            ProvisioningPipeline::new(fake.host(), &MysqlSettings::default(), &fake.webroot_base())
            .on_step(|step| seen.borrow_mut().push(step));

        pipeline
            .run(request(&fake, descriptor("example.com", standard(SiteType::Php))))
            .unwrap();
        drop(pipeline);
        assert_eq!(seen.into_inner().len(), 4);
    }
}
