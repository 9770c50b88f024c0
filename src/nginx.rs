use std::{
    fs,
    os::unix::fs::{symlink, PermissionsExt},
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context, Result};
use log::{debug, error, info};

use crate::{
    classifier::{SiteDescriptor, SiteKind},
    collaborators::{HttpAuth, VhostManager},
    config::{NginxSettings, PhpFpmSettings},
    domain, phpfpm,
    pipeline::BuildContext,
    resolver::{CacheType, SiteType},
    shell::{CommandRunner, CommandSpec},
    utils,
};

/// Виртуальные хосты Nginx: sites-available + ссылка в sites-enabled
pub struct NginxVhost {
    settings: NginxSettings,
    php_run_dir: PathBuf,
    runner: CommandRunner,
}

impl NginxVhost {
    pub fn new(settings: NginxSettings, php_fpm: &PhpFpmSettings, runner: CommandRunner) -> Self {
        Self {
            settings,
            php_run_dir: php_fpm.run_dir.clone(),
            runner,
        }
    }

    fn available(&self, domain: &str) -> PathBuf {
        self.settings.sites_available.join(domain)
    }

    fn enabled(&self, domain: &str) -> PathBuf {
        self.settings.sites_enabled.join(domain)
    }

    fn acl_dir(&self, domain: &str) -> PathBuf {
        self.settings.acl_dir.join(domain)
    }

    /// Проверяет синтаксис конфигурации (`nginx -t`)
    fn test_config(&self) -> Result<bool> {
        self.runner.succeeds(
            &CommandSpec::new(self.settings.binary.to_string_lossy())
                .arg("-t")
                .describe("Проверка конфигурации Nginx"),
        )
    }

    /// Текст server-блока для сайта
    ///
    /// # Arguments
    /// * `descriptor` - Описание сайта
    /// * `ctx` - Контекст сборки (каталог сайта, версия PHP, родитель подсайта)
    pub fn render_config(&self, descriptor: &SiteDescriptor, ctx: &BuildContext) -> Result<String> {
        let name = &descriptor.domain;
        let server_names = match descriptor.site_type() {
            SiteType::WpSubdomain => format!("{0} *.{0}", name),
            _ => match domain::www_alias(name) {
                Some(www) => format!("{} {}", name, www),
                None => name.clone(),
            },
        };

        let mut body = String::new();
        match &descriptor.kind {
            SiteKind::Proxy { host, port } => {
                body.push_str(&format!(
                    r#"    location / {{
        proxy_pass http://{host}:{port};
        proxy_set_header Host $host;
        proxy_set_header X-Real-IP $remote_addr;
        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
        proxy_set_header X-Forwarded-Proto $scheme;
    }}
"#
                ));
            }
            SiteKind::Alias { target } => {
                body.push_str(&format!("    return 301 $scheme://{}$request_uri;\n", target));
            }
            SiteKind::Subsite { parent } => {
                let parent_root = ctx
                    .parent_webroot
                    .clone()
                    .ok_or_else(|| anyhow!("не найден каталог родительского сайта {}", parent))?;
                let php = ctx
                    .php_version
                    .as_deref()
                    .ok_or_else(|| anyhow!("у родительского сайта {} не указана версия PHP", parent))?;
                body.push_str(&format!("    root {}/htdocs;\n", parent_root.display()));
                body.push_str(&self.php_locations(php, &domain::slug(parent)));
            }
            SiteKind::Standard {
                site_type,
                cache_type,
            } => {
                body.push_str(&format!("    root {}/htdocs;\n", ctx.webroot.display()));
                match site_type {
                    SiteType::Html => body.push_str(
                        "    index index.html index.htm;\n\n    location / {\n        try_files $uri $uri/ =404;\n    }\n",
                    ),
                    _ => {
                        let php = ctx
                            .php_version
                            .as_deref()
                            .ok_or_else(|| anyhow!("не выбрана версия PHP для {}", name))?;
                        body.push_str(&self.php_locations(php, &ctx.pool_name));
                        if site_type.is_wordpress() {
                            body.push_str(&wordpress_includes(*site_type, *cache_type, php));
                        }
                    }
                }
            }
        }

        if let Some(auth) = &ctx.http_auth {
            body.push_str(&format!(
                "    auth_basic \"Restricted Area ({})\";\n    auth_basic_user_file {};\n",
                auth.user,
                self.acl_dir(name).join("htpasswd").display()
            ));
        }

        if !matches!(descriptor.kind, SiteKind::Proxy { .. } | SiteKind::Alias { .. }) {
            body.push_str(&format!("    include {}/conf/nginx/*.conf;\n", ctx.webroot.display()));
        }

        Ok(format!(
            r#"# Managed by wo: {site_type} {cache}
server {{
    listen 80;
    listen [::]:80;
    server_name {server_names};

    access_log {log_dir}/{name}.access.log;
    error_log {log_dir}/{name}.error.log;

{body}}}
"#,
            site_type = descriptor.site_type(),
            cache = descriptor.cache_type(),
            log_dir = self.settings.log_dir.display(),
        ))
    }

    fn php_locations(&self, php_version: &str, slug: &str) -> String {
        format!(
            r#"    index index.php index.html index.htm;

    location / {{
        try_files $uri $uri/ /index.php$is_args$args;
    }}

    location ~ \.php$ {{
        try_files $uri =404;
        include fastcgi_params;
        fastcgi_param SCRIPT_FILENAME $document_root$fastcgi_script_name;
        fastcgi_pass unix:{socket};
    }}
"#,
            socket = phpfpm::socket_path(&self.php_run_dir, php_version, slug).display()
        )
    }

    fn write_acl(&self, domain: &str, auth: &HttpAuth) -> Result<()> {
        let hash = self.runner.run(
            &CommandSpec::new("openssl")
                .args(["passwd", "-apr1", "-stdin"])
                .stdin(format!("{}\n", auth.password))
                .describe("Хеш пароля HTTP-аутентификации"),
        )?;
        utils::write_file(
            &self.acl_dir(domain).join("htpasswd"),
            &format!("{}:{}\n", auth.user, hash.trim()),
        )?;

        // Открытый пароль нужен резервной копии, чтобы восстановить ACL
        let credentials = self.acl_dir(domain).join("credentials");
        utils::write_file(&credentials, &format!("{}:{}\n", auth.user, auth.password))?;
        fs::set_permissions(&credentials, fs::Permissions::from_mode(0o600))
            .with_context(|| format!("Не удалось изменить права {:?}", credentials))
    }

    fn setup_webroot(&self, domain: &str, webroot: &Path) -> Result<()> {
        for dir in ["htdocs", "logs", "conf/nginx"] {
            let path = webroot.join(dir);
            fs::create_dir_all(&path)
                .with_context(|| format!("Не удалось создать директорию {:?}", path))?;
        }

        for kind in ["access", "error"] {
            let link = webroot.join("logs").join(format!("{}.log", kind));
            let target = self.settings.log_dir.join(format!("{}.{}.log", domain, kind));
            utils::remove_file_if_exists(&link)?;
            symlink(&target, &link)
                .with_context(|| format!("Не удалось создать ссылку {:?}", link))?;
        }
        Ok(())
    }
}

/// Учетные данные HTTP-аутентификации сайта, если они были заданы
pub fn read_http_auth(acl_dir: &Path, domain: &str) -> Option<HttpAuth> {
    let text = fs::read_to_string(acl_dir.join(domain).join("credentials")).ok()?;
    let (user, password) = text.lines().next()?.split_once(':')?;
    Some(HttpAuth {
        user: user.to_string(),
        password: password.to_string(),
    })
}

/// Дополнительные include для WordPress: мультисайт и механизм кеша
fn wordpress_includes(site_type: SiteType, cache: CacheType, php_version: &str) -> String {
    let short = phpfpm::short_version(php_version);
    let mut out = String::new();
    if site_type == SiteType::WpSubdir {
        out.push_str("    include common/wpsubdir.conf;\n");
    }
    let common = match cache {
        CacheType::Basic => "wpcommon",
        CacheType::Wpfc => "wpfc",
        CacheType::Wpsc => "wpsc",
        CacheType::Wprocket => "wprocket",
        CacheType::Wpce => "wpce",
        CacheType::Wpredis => "redis",
    };
    out.push_str(&format!("    include common/{}-php{}.conf;\n", common, short));
    out.push_str("    include common/wpcommon.conf;\n    include common/locations-wo.conf;\n");
    out
}

impl VhostManager for NginxVhost {
    fn render(&self, descriptor: &SiteDescriptor, ctx: &BuildContext) -> Result<()> {
        let name = &descriptor.domain;
        info!("Настройка конфигурации Nginx для {}", name);

        let config = self.render_config(descriptor, ctx)?;
        let available = self.available(name);
        utils::write_file(&available, &config)?;

        let enabled = self.enabled(name);
        if let Some(parent) = enabled.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Не удалось создать директорию {:?}", parent))?;
        }
        utils::remove_file_if_exists(&enabled)?;
        symlink(&available, &enabled)
            .with_context(|| format!("Не удалось включить сайт {:?}", enabled))?;

        if let Some(auth) = &ctx.http_auth {
            self.write_acl(name, auth)?;
        }

        if !self.test_config()? {
            error!("Созданная конфигурация Nginx для {} не прошла проверку", name);
            return Err(anyhow!(
                "созданная конфигурация nginx для {} не прошла проверку, выполните `nginx -t`",
                name
            ));
        }

        self.setup_webroot(name, &ctx.webroot)?;
        debug!("Каталог сайта {:?} подготовлен", ctx.webroot);
        Ok(())
    }

    fn remove(&self, domain: &str) -> Result<()> {
        utils::remove_file_if_exists(&self.enabled(domain))?;
        utils::remove_file_if_exists(&self.available(domain))?;
        utils::remove_dir_all_if_exists(&self.acl_dir(domain))?;
        info!("Конфигурация Nginx для {} удалена", domain);
        Ok(())
    }

    fn reload(&self) -> Result<bool> {
        if !self.test_config()? {
            return Ok(false);
        }
        self.runner.succeeds(
            &CommandSpec::new("systemctl")
                .args(["reload", "nginx"])
                .describe("Перезагрузка Nginx"),
        )
    }

    fn config_exists(&self, domain: &str) -> bool {
        self.available(domain).exists() || self.enabled(domain).symlink_metadata().is_ok()
    }
}
