//! Установка и обслуживание WordPress через WP-CLI.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::OnceLock,
};

use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use regex::Regex;
use serde_json::{json, Value};

use crate::{
    autoupdate::{PendingUpdates, Updater},
    classifier::SiteDescriptor,
    collaborators::{Application, InstallOptions, WpCredentials},
    config::{self, WordPressSettings},
    domain,
    pipeline::BuildContext,
    registry::SiteRegistryEntry,
    resolver::{CacheType, SiteType},
    shell::{CommandRunner, CommandSpec},
    utils,
};

/// Константы `wp-config.php`, задаваемые каждому сайту
const TUNING_CONSTANTS: &[(&str, &str)] = &[
    ("WP_MEMORY_LIMIT", "256M"),
    ("WP_MAX_MEMORY_LIMIT", "512M"),
    ("CONCATENATE_SCRIPTS", "false"),
    ("WP_POST_REVISIONS", "10"),
    ("MEDIA_TRASH", "true"),
    ("EMPTY_TRASH_DAYS", "15"),
    ("WP_AUTO_UPDATE_CORE", "minor"),
    ("WP_REDIS_DISABLE_BANNERS", "true"),
];

/// Плагин и, при необходимости, его начальные настройки
#[derive(Debug, Clone, PartialEq)]
pub struct PluginSetup {
    pub slug: &'static str,
    pub option: Option<(&'static str, Value)>,
}

impl PluginSetup {
    fn plain(slug: &'static str) -> Self {
        Self { slug, option: None }
    }
}

fn nginx_helper_options(cache_method: &str) -> Value {
    json!({
        "log_level": "INFO",
        "log_filesize": 5,
        "enable_purge": 1,
        "enable_map": "0",
        "enable_log": 0,
        "enable_stamp": 1,
        "purge_homepage_on_new": 1,
        "purge_homepage_on_edit": 1,
        "purge_homepage_on_del": 1,
        "purge_archive_on_new": 1,
        "purge_archive_on_edit": 1,
        "purge_archive_on_del": 1,
        "purge_archive_on_new_comment": 0,
        "purge_archive_on_deleted_comment": 0,
        "purge_page_on_mod": 1,
        "purge_page_on_new_comment": 1,
        "purge_page_on_deleted_comment": 1,
        "cache_method": cache_method,
        "purge_method": "get_request",
        "redis_hostname": "127.0.0.1",
        "redis_port": "6379",
        "redis_prefix": "nginx-cache:"
    })
}

/// Плагины кеширования для данного механизма кеша, в порядке установки
pub fn cache_plugins(cache: CacheType) -> Vec<PluginSetup> {
    let helper = match cache {
        CacheType::Wpfc => PluginSetup {
            slug: "nginx-helper",
            option: Some(("rt_wp_nginx_helper_options", nginx_helper_options("enable_fastcgi"))),
        },
        CacheType::Wpredis => PluginSetup {
            slug: "nginx-helper",
            option: Some(("rt_wp_nginx_helper_options", nginx_helper_options("enable_redis"))),
        },
        _ => PluginSetup::plain("nginx-helper"),
    };

    let mut plugins = vec![helper];
    match cache {
        CacheType::Wpsc => plugins.push(PluginSetup::plain("wp-super-cache")),
        CacheType::Wpredis => plugins.push(PluginSetup::plain("redis-cache")),
        CacheType::Wpce => plugins.push(PluginSetup {
            slug: "cache-enabler",
            option: Some((
                "cache-enabler",
                json!({
                    "cache_expires": 24,
                    "clear_site_cache_on_saved_post": 1,
                    "clear_site_cache_on_saved_comment": 0,
                    "convert_image_urls_to_webp": 0,
                    "clear_on_upgrade": 1,
                    "compress_cache": 1,
                    "excluded_post_ids": "",
                    "excluded_query_strings": "",
                    "excluded_cookies": "",
                    "minify_inline_css_js": 1,
                    "minify_html": 1
                }),
            )),
        }),
        _ => {}
    }
    plugins
}

fn username_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9 _.\-@]+$").expect("username regex"))
}

fn email_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9.+_-]+@[A-Za-z0-9._-]+\.[A-Za-z]+$").expect("email regex")
    })
}

/// Учетные данные администратора: параметры команды, затем конфигурация,
/// затем значения по умолчанию и сгенерированный пароль
pub fn admin_credentials(
    options: &InstallOptions,
    settings: &WordPressSettings,
    domain: &str,
) -> Result<WpCredentials> {
    let pick = |cli: &Option<String>, configured: &str| {
        cli.clone()
            .filter(|v| !v.is_empty())
            .or_else(|| (!configured.is_empty()).then(|| configured.to_string()))
    };

    let user = pick(&options.admin_user, &settings.user).unwrap_or_else(|| "admin".to_string());
    if !username_regex().is_match(&user) {
        bail!(
            "имя пользователя WordPress {:?} может содержать только буквы, цифры, пробелы и символы _ . - @",
            user
        );
    }

    let email =
        pick(&options.admin_email, &settings.email).unwrap_or_else(|| format!("admin@{}", domain));
    if !email_regex().is_match(&email) {
        bail!("некорректный email администратора WordPress: {:?}", email);
    }

    let password = options
        .admin_password
        .clone()
        .filter(|p| !p.is_empty())
        .unwrap_or_else(config::generate_password);

    Ok(WpCredentials { user, password, email })
}

/// Разбирает вывод `wp core check-update --format=json`
pub fn parse_core_updates(output: &str) -> Result<bool> {
    let text = output.trim();
    if text.is_empty() {
        return Ok(false);
    }
    let value: Value =
        serde_json::from_str(text).context("Некорректный ответ wp core check-update")?;
    Ok(value.as_array().map_or(false, |updates| !updates.is_empty()))
}

/// Разбирает вывод `wp ... list --field=name`
pub fn parse_names(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// WP-CLI
pub struct WpCli {
    settings: WordPressSettings,
    runner: CommandRunner,
}

impl WpCli {
    pub fn new(settings: WordPressSettings, runner: CommandRunner) -> Self {
        Self { settings, runner }
    }

    /// `wp --allow-root ...` в каталоге `htdocs` сайта
    fn wp(&self, htdocs: &Path) -> CommandSpec {
        CommandSpec::new(self.settings.wp_cli.to_string_lossy())
            .flag("allow-root")
            .cwd(htdocs)
    }

    /// `wp` от имени пользователя пула сайта, чтобы не менять владельца файлов
    fn wp_as_site_user(&self, site: &SiteRegistryEntry) -> Result<CommandSpec> {
        let slug = domain::slug(&site.domain);
        let user = format!("php-{}", slug);
        let home = PathBuf::from("/tmp").join(format!("wp-cli-{}", slug));
        let cache = home.join("cache");
        fs::create_dir_all(&cache)
            .with_context(|| format!("Не удалось создать директорию {:?}", cache))?;
        if let Err(e) = self.runner.run(
            &CommandSpec::new("chown")
                .args(["-R", format!("{0}:{0}", user).as_str()])
                .arg(home.to_string_lossy()),
        ) {
            debug!("Не удалось сменить владельца {:?}: {:#}", home, e);
        }

        Ok(CommandSpec::new("runuser")
            .args(["-u", user.as_str(), "--"])
            .arg(self.settings.wp_cli.to_string_lossy())
            .cwd(site.webroot.join("htdocs"))
            .env("HOME", &home.to_string_lossy())
            .env("WP_CLI_CACHE_DIR", &cache.to_string_lossy()))
    }

    fn create_config(&self, descriptor: &SiteDescriptor, ctx: &BuildContext, skip_check: bool) -> Result<()> {
        let db = ctx
            .db_credentials()
            .with_context(|| format!("Для {} не созданы учетные данные базы", ctx.domain))?;

        let mut extra_php = String::from("define('WP_DEBUG', false);\n");
        if descriptor.site_type().is_multisite() {
            extra_php.push_str("define('WPMU_ACCEL_REDIRECT', true);\n");
        }

        let mut spec = self.wp(&ctx.htdocs()).args(["config", "create"]);
        if skip_check {
            spec = spec.flag("skip-check");
        }
        self.runner.run(
            &spec
                .option("dbname", db.name)
                .option("dbprefix", self.settings.prefix.as_str())
                .option("dbuser", db.user)
                .option("dbhost", db.host)
                .option("dbpass", db.password)
                .flag("extra-php")
                .stdin(extra_php)
                .describe("Создание wp-config.php"),
        )?;

        for (name, value) in std::iter::once(("WP_REDIS_PREFIX", format!("{}:", ctx.domain)))
            .chain(TUNING_CONSTANTS.iter().map(|(n, v)| (*n, v.to_string())))
        {
            let mut spec = self.wp(&ctx.htdocs()).args(["config", "set", name, value.as_str()]);
            if value == "true" || value == "false" {
                spec = spec.flag("raw");
            }
            self.runner
                .run(&spec)
                .with_context(|| format!("Не удалось задать {} в wp-config.php", name))?;
        }

        // wp-config.php хранится на уровень выше htdocs
        let created = ctx.htdocs().join("wp-config.php");
        let target = ctx.webroot.join("wp-config.php");
        fs::rename(&created, &target)
            .with_context(|| format!("Не удалось переместить {:?} в {:?}", created, target))?;
        debug!("wp-config.php для {} создан", ctx.domain);
        Ok(())
    }

    fn install_plugin(&self, ctx: &BuildContext, plugin: &PluginSetup, multisite: bool) -> Result<()> {
        info!("Установка плагина {}", plugin.slug);
        self.runner
            .run(&self.wp(&ctx.htdocs()).args(["plugin", "install", plugin.slug]))
            .with_context(|| format!("Не удалось установить плагин {}", plugin.slug))?;

        let mut activate = self.wp(&ctx.htdocs()).args(["plugin", "activate", plugin.slug]);
        if multisite {
            activate = activate.flag("network");
        }
        self.runner
            .run(&activate)
            .with_context(|| format!("Не удалось активировать плагин {}", plugin.slug))?;

        if let Some((option, value)) = &plugin.option {
            let data = value.to_string();
            let spec = if multisite {
                self.wp(&ctx.htdocs())
                    .args(["network", "meta", "update", "1", *option, data.as_str()])
            } else {
                self.wp(&ctx.htdocs()).args(["option", "update", *option, data.as_str()])
            };
            self.runner
                .run(&spec)
                .with_context(|| format!("Не удалось настроить плагин {}", plugin.slug))?;
        }
        Ok(())
    }

    fn chown_site(&self, ctx: &BuildContext) {
        let owner = format!("{0}:{0}", ctx.php_fpm_user);
        let mut spec = CommandSpec::new("chown")
            .args(["-R", owner.as_str()])
            .arg(ctx.htdocs().to_string_lossy());
        for config in utils::config_files(&ctx.webroot) {
            spec = spec.arg(config.to_string_lossy());
        }
        if let Err(e) = self.runner.run(&spec.describe("Владелец файлов сайта")) {
            warn!("Не удалось сменить владельца файлов {}: {:#}", ctx.domain, e);
        }
    }
}

impl Application for WpCli {
    fn install(
        &self,
        descriptor: &SiteDescriptor,
        ctx: &BuildContext,
        options: &InstallOptions,
    ) -> Result<Option<WpCredentials>> {
        let htdocs = ctx.htdocs();
        info!("Загрузка WordPress для {}", ctx.domain);
        self.runner
            .run(&self.wp(&htdocs).args(["core", "download"]).describe("Загрузка WordPress"))
            .context("Не удалось загрузить WordPress")?;

        self.create_config(descriptor, ctx, options.vhost_only)?;

        if options.vhost_only {
            // Остается только wp-config.php, каталог htdocs пустой
            fs::remove_dir_all(&htdocs)
                .with_context(|| format!("Не удалось очистить {:?}", htdocs))?;
            fs::create_dir_all(&htdocs)
                .with_context(|| format!("Не удалось создать директорию {:?}", htdocs))?;
            self.chown_site(ctx);
            return Ok(None);
        }

        let credentials = admin_credentials(options, &self.settings, &descriptor.domain)?;
        let site_type = descriptor.site_type();

        let mut spec = self.wp(&htdocs).arg("core");
        spec = if site_type.is_multisite() {
            spec.arg("multisite-install")
        } else {
            spec.arg("install")
        };
        spec = spec
            .option("url", descriptor.domain.as_str())
            .option("title", descriptor.domain.as_str())
            .option("admin_user", credentials.user.as_str())
            .option("admin_password", credentials.password.as_str())
            .option("admin_email", credentials.email.as_str());
        if site_type == SiteType::WpSubdomain {
            spec = spec.flag("subdomains");
        }
        info!("Установка WordPress для {}", ctx.domain);
        self.runner
            .run(&spec.describe("Установка WordPress"))
            .with_context(|| format!("Не удалось установить WordPress для {}", ctx.domain))?;

        self.runner
            .run(&self.wp(&htdocs).args(["rewrite", "structure", "/%postname%/"]))
            .context("Не удалось настроить постоянные ссылки WordPress")?;

        let cache = descriptor.cache_type();
        for plugin in cache_plugins(cache) {
            self.install_plugin(ctx, &plugin, site_type.is_multisite())?;
        }
        if cache == CacheType::Wpce {
            self.runner
                .run(&self.wp(&htdocs).args(["config", "set", "WP_CACHE", "true"]).flag("raw"))
                .context("Не удалось включить WP_CACHE")?;
        }

        self.chown_site(ctx);
        info!("WordPress для {} установлен", ctx.domain);
        Ok(Some(credentials))
    }

    fn copy_content(&self, source: &Path, ctx: &BuildContext) -> Result<()> {
        let src_htdocs = source.join("htdocs");
        if !src_htdocs.is_dir() {
            bail!("в {:?} нет каталога htdocs", source);
        }
        fs::create_dir_all(ctx.htdocs())
            .with_context(|| format!("Не удалось создать директорию {:?}", ctx.htdocs()))?;

        info!("Копирование файлов из {:?} в {:?}", src_htdocs, ctx.htdocs());
        self.runner.run(
            &CommandSpec::new("cp")
                .arg("-a")
                .arg(format!("{}/.", src_htdocs.display()))
                .arg(ctx.htdocs().to_string_lossy())
                .describe("Копирование файлов сайта"),
        )?;

        for config in utils::config_files(source) {
            if let Some(name) = config.file_name() {
                let target = ctx.webroot.join(name);
                fs::copy(&config, &target)
                    .with_context(|| format!("Не удалось скопировать {:?}", config))?;
            }
        }

        self.chown_site(ctx);
        Ok(())
    }

    fn write_config(&self, descriptor: &SiteDescriptor, ctx: &BuildContext) -> Result<()> {
        for stale in [ctx.webroot.join("wp-config.php"), ctx.htdocs().join("wp-config.php")] {
            utils::remove_file_if_exists(&stale)?;
        }
        self.create_config(descriptor, ctx, true)?;
        self.chown_site(ctx);
        Ok(())
    }

    fn search_replace(&self, ctx: &BuildContext, from: &str, to: &str) -> Result<()> {
        info!("Замена {} на {} в базе сайта {}", from, to, ctx.domain);
        self.runner
            .run(
                &self
                    .wp(&ctx.htdocs())
                    .args(["search-replace", from, to])
                    .flag("all-tables")
                    .describe("Замена адреса сайта в базе"),
            )
            .with_context(|| format!("Не удалось обновить адреса {} -> {}", from, to))?;
        Ok(())
    }
}

impl Updater for WpCli {
    fn pending(&self, site: &SiteRegistryEntry) -> Result<PendingUpdates> {
        let core = self.runner.run(
            &self
                .wp_as_site_user(site)?
                .args(["core", "check-update"])
                .option("format", "json"),
        )?;
        let plugins = self.runner.run(
            &self
                .wp_as_site_user(site)?
                .args(["plugin", "list"])
                .option("update", "available")
                .option("field", "name"),
        )?;
        let themes = self.runner.run(
            &self
                .wp_as_site_user(site)?
                .args(["theme", "list"])
                .option("update", "available")
                .option("field", "name"),
        )?;

        let pending = PendingUpdates {
            core: parse_core_updates(&core)?,
            plugins: parse_names(&plugins),
            themes: parse_names(&themes),
        };
        debug!("Доступные обновления {}: {:?}", site.domain, pending);
        Ok(pending)
    }

    fn apply(&self, site: &SiteRegistryEntry, pending: &PendingUpdates) -> Result<()> {
        if pending.core {
            self.runner
                .run(&self.wp_as_site_user(site)?.args(["core", "update"]).describe("Обновление WordPress"))
                .context("Не удалось обновить ядро WordPress")?;
        }
        if !pending.plugins.is_empty() {
            self.runner
                .run(
                    &self
                        .wp_as_site_user(site)?
                        .args(["plugin", "update"])
                        .flag("all")
                        .describe("Обновление плагинов"),
                )
                .context("Не удалось обновить плагины")?;
        }
        if !pending.themes.is_empty() {
            self.runner
                .run(
                    &self
                        .wp_as_site_user(site)?
                        .args(["theme", "update"])
                        .flag("all")
                        .describe("Обновление тем"),
                )
                .context("Не удалось обновить темы")?;
        }
        Ok(())
    }
}
