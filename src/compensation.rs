use std::path::{Path, PathBuf};

use anyhow::Result;
use log::{info, warn};

use crate::{
    classifier::SiteDescriptor,
    pipeline::{BuildContext, Host, Step},
    utils,
};

/// Итог отката
#[derive(Debug, Default)]
pub struct RollbackReport {
    pub compensated: Vec<Step>,
    pub failures: Vec<String>,
}

impl RollbackReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Удаляет ресурсы, созданные прерванным запуском конвейера
pub struct CompensationController<'a> {
    host: Host<'a>,
    webroot_base: PathBuf,
}

impl<'a> CompensationController<'a> {
    pub fn new(host: Host<'a>, webroot_base: &Path) -> Self {
        Self {
            host,
            webroot_base: webroot_base.to_path_buf(),
        }
    }

    /// Откатывает шаги в обратном порядке, затем удаляет запись реестра,
    /// если её добавил этот запуск.
    ///
    /// Ошибки отдельных действий не прерывают откат, а попадают в отчет.
    pub fn rollback(
        &self,
        steps: &[Step],
        ctx: &BuildContext,
        descriptor: &SiteDescriptor,
    ) -> RollbackReport {
        info!("Откат изменений для {}", descriptor.domain);
        let mut report = RollbackReport::default();

        for step in steps.iter().rev() {
            let result = match step {
                Step::ProvisionDatabase => self.drop_database(ctx),
                Step::ConfigureProcessPool => self.remove_pool(ctx),
                Step::RenderVhostAndWebroot => self.remove_vhost_and_webroot(ctx),
                // Установка приложения удаляется вместе с каталогом сайта
                Step::ValidateDomainUnique | Step::InstallApplication | Step::Finalize => continue,
            };

            match result {
                Ok(()) => report.compensated.push(*step),
                Err(e) => {
                    warn!("Откат шага {} не удался: {:#}", step, e);
                    report.failures.push(format!("{}: {:#}", step, e));
                }
            }
        }

        if ctx.registry_reserved {
            if let Err(e) = self.host.registry.delete(&ctx.domain) {
                warn!("Не удалось удалить {} из реестра: {:#}", ctx.domain, e);
                report.failures.push(format!("registry: {:#}", e));
            }
        }

        report
    }

    fn drop_database(&self, ctx: &BuildContext) -> Result<()> {
        let mut first_error = None;

        if let Some(name) = &ctx.db_name {
            if let Err(e) = self.host.database.drop(name) {
                first_error.get_or_insert(e);
            }
        }
        if let Some(user) = &ctx.db_user {
            if user == "root" {
                warn!("Пользователь root не удаляется при откате");
            } else if let Err(e) = self.host.database.drop_user(user, &ctx.grant_host) {
                first_error.get_or_insert(e);
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    fn remove_pool(&self, ctx: &BuildContext) -> Result<()> {
        match ctx.pool_spec() {
            Some(pool) => self.host.pool.remove(&pool),
            None => Ok(()),
        }
    }

    fn remove_vhost_and_webroot(&self, ctx: &BuildContext) -> Result<()> {
        let vhost = self.host.vhost.remove(&ctx.domain);

        let webroot = &ctx.webroot;
        let protected = webroot == &self.webroot_base
            || webroot.parent().is_none()
            || ctx.parent_webroot.as_ref() == Some(webroot);
        if protected {
            warn!("Каталог {:?} не удаляется при откате", webroot);
        } else {
            utils::remove_dir_all_if_exists(webroot)?;
        }

        vhost
    }
}
