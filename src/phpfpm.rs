use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{debug, info, warn};

use crate::{
    collaborators::{PoolSpec, ProcessPool},
    config::PhpFpmSettings,
    shell::{CommandRunner, CommandSpec},
    utils,
};

/// `8.3` -> `83`
pub fn short_version(php_version: &str) -> String {
    php_version.replace('.', "")
}

/// Сокет пула сайта
pub fn socket_path(run_dir: &Path, php_version: &str, slug: &str) -> PathBuf {
    run_dir.join(format!("php{}-fpm-{}.sock", short_version(php_version), slug))
}

fn service_name(pool: &PoolSpec) -> String {
    format!("php{}-fpm@{}", pool.php_version, pool.pool_name)
}

/// Пулы PHP-FPM, по одному на сайт, каждый со своим системным пользователем
pub struct PhpFpmPools {
    settings: PhpFpmSettings,
    runner: CommandRunner,
}

impl PhpFpmPools {
    pub fn new(settings: PhpFpmSettings, runner: CommandRunner) -> Self {
        Self { settings, runner }
    }

    fn fpm_dir(&self, php_version: &str) -> PathBuf {
        self.settings.conf_root.join(php_version).join("fpm")
    }

    fn master_path(&self, pool: &PoolSpec) -> PathBuf {
        self.fpm_dir(&pool.php_version)
            .join(format!("php-fpm-{}.conf", pool.pool_name))
    }

    fn pool_path(&self, pool: &PoolSpec) -> PathBuf {
        self.fpm_dir(&pool.php_version)
            .join("pool.d")
            .join(format!("{}.conf", pool.pool_name))
    }

    fn log_dir(&self, pool: &PoolSpec) -> PathBuf {
        self.settings
            .log_root
            .join(&pool.php_version)
            .join(&pool.pool_name)
    }

    fn unit_path(&self, php_version: &str) -> PathBuf {
        self.settings
            .systemd_dir
            .join(format!("php{}-fpm@.service", php_version))
    }

    fn pid_path(&self, pool: &PoolSpec) -> PathBuf {
        self.settings
            .run_dir
            .join(format!("php{}-fpm-{}.pid", pool.php_version, pool.pool_name))
    }

    fn systemctl(&self, args: &[&str]) -> Result<String> {
        self.runner
            .run(&CommandSpec::new("systemctl").args(args.iter().copied()).describe("systemctl"))
    }

    /// Выполняет команду, не считая ненулевой код возврата ошибкой
    fn best_effort(&self, spec: CommandSpec) {
        match self.runner.succeeds(&spec) {
            Ok(true) => {}
            Ok(false) => debug!("Команда {} завершилась неуспешно, пропускаем", spec.display()),
            Err(e) => debug!("Не удалось выполнить {}: {:#}", spec.display(), e),
        }
    }

    fn ensure_system_user(&self, user: &str) -> Result<()> {
        let group_exists = self
            .runner
            .succeeds(&CommandSpec::new("getent").args(["group", user]))?;
        if !group_exists {
            self.runner
                .run(&CommandSpec::new("groupadd").args(["-r", user]).describe("Создание группы пула"))?;
        }

        let user_exists = self.runner.succeeds(&CommandSpec::new("id").args(["-u", user]))?;
        if !user_exists {
            self.runner.run(
                &CommandSpec::new("useradd")
                    .args(["-r", "-g", user, "-M", "-d", "/nonexistent", "-s", "/usr/sbin/nologin", user])
                    .describe("Создание пользователя пула"),
            )?;
        }

        // Веб-серверу нужен доступ к сокету пула
        self.runner.run(
            &CommandSpec::new("usermod")
                .args(["-aG", user, self.settings.web_user.as_str()])
                .describe("Доступ веб-сервера к пулу"),
        )?;
        Ok(())
    }

    pub fn render_master(&self, pool: &PoolSpec) -> String {
        format!(
            r#"[global]
pid = {pid}
error_log = {log_dir}/fpm.log
include = {pool_path}
"#,
            pid = self.pid_path(pool).display(),
            log_dir = self.log_dir(pool).display(),
            pool_path = self.pool_path(pool).display(),
        )
    }

    pub fn render_pool(&self, pool: &PoolSpec) -> String {
        format!(
            r#"[{slug}]
user = {user}
group = {user}
listen = {socket}
listen.owner = {user}
listen.group = {user}
listen.mode = 0660
pm = ondemand
pm.max_children = 50
pm.process_idle_timeout = 10s
pm.max_requests = 500
chdir = {webroot}/htdocs
php_admin_value[error_log] = {log_dir}/error.log
php_admin_value[open_basedir] = {webroot}/:/usr/share/php/:/tmp/:/var/run/nginx-cache/
"#,
            slug = pool.pool_name,
            user = pool.user,
            socket = socket_path(&self.settings.run_dir, &pool.php_version, &pool.pool_name).display(),
            webroot = pool.webroot.display(),
            log_dir = self.log_dir(pool).display(),
        )
    }

    pub fn render_unit(&self, php_version: &str) -> String {
        format!(
            r#"[Unit]
Description=PHP {ver} FastCGI Process Manager for %i
After=network.target

[Service]
Type=notify
ExecStart=/usr/sbin/php-fpm{ver} --nodaemonize --fpm-config {conf}/php-fpm-%i.conf
ExecReload=/bin/kill -USR2 $MAINPID
RuntimeDirectory=php
RuntimeDirectoryPreserve=yes

[Install]
WantedBy=multi-user.target
"#,
            ver = php_version,
            conf = self.fpm_dir(php_version).display(),
        )
    }
}

impl ProcessPool for PhpFpmPools {
    fn configure(&self, pool: &PoolSpec) -> Result<()> {
        info!("Настройка пула PHP-FPM {} (PHP {})", pool.pool_name, pool.php_version);

        self.ensure_system_user(&pool.user)?;

        let log_dir = self.log_dir(pool);
        std::fs::create_dir_all(&log_dir)
            .with_context(|| format!("Не удалось создать директорию {:?}", log_dir))?;
        let owner = format!("{0}:{0}", pool.user);
        self.runner.run(
            &CommandSpec::new("chown")
                .args(["-R", owner.as_str()])
                .arg(log_dir.to_string_lossy()),
        )?;

        let unit = self.unit_path(&pool.php_version);
        if !unit.exists() {
            utils::write_file(&unit, &self.render_unit(&pool.php_version))?;
        }
        utils::write_file(&self.master_path(pool), &self.render_master(pool))?;
        utils::write_file(&self.pool_path(pool), &self.render_pool(pool))?;

        let service = service_name(pool);
        self.systemctl(&["daemon-reload"])?;
        self.systemctl(&["enable", service.as_str()])?;
        self.systemctl(&["restart", service.as_str()])?;

        self.runner.run(
            &CommandSpec::new("chown")
                .args(["-R", owner.as_str()])
                .arg(pool.webroot.join("htdocs").to_string_lossy())
                .describe("Владелец каталога сайта"),
        )?;

        info!("Пул PHP-FPM {} запущен", pool.pool_name);
        Ok(())
    }

    fn remove(&self, pool: &PoolSpec) -> Result<()> {
        info!("Удаление пула PHP-FPM {}", pool.pool_name);
        let service = format!("{}.service", service_name(pool));

        self.best_effort(CommandSpec::new("systemctl").args(["stop", service.as_str()]));
        self.best_effort(CommandSpec::new("systemctl").args(["disable", service.as_str()]));
        self.best_effort(CommandSpec::new("userdel").arg(pool.user.as_str()));
        self.best_effort(CommandSpec::new("groupdel").arg(pool.user.as_str()));

        let files = [
            self.master_path(pool),
            self.pool_path(pool),
            socket_path(&self.settings.run_dir, &pool.php_version, &pool.pool_name),
            self.pid_path(pool),
        ];
        for file in &files {
            if let Err(e) = utils::remove_file_if_exists(file) {
                warn!("{:#}", e);
            }
        }
        utils::remove_dir_all_if_exists(&self.log_dir(pool))?;

        self.best_effort(CommandSpec::new("systemctl").arg("daemon-reload"));
        Ok(())
    }
}
