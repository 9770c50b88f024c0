use std::{path::PathBuf, process};

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use dialoguer::Input;
use log::{debug, info};

mod audit;
mod autoupdate;
mod backup;
mod classifier;
mod collaborators;
mod compensation;
mod config;
mod database;
mod domain;
mod error;
mod lock;
mod logger;
mod naming;
mod nginx;
mod phpfpm;
mod pipeline;
mod registry;
mod resolver;
mod shell;
mod site;
#[cfg(test)]
mod testing;
mod utils;
mod wordpress;

use crate::{
    autoupdate::AutoUpdater,
    backup::BackupKind,
    classifier::SpecialOptions,
    collaborators::InstallOptions,
    config::WoConfig,
    pipeline::{ProvisionedSite, Step},
    resolver::{SiteFlags, SiteType},
    site::{BackupTarget, CreateRequest, Services, SiteCommands},
};

#[derive(Parser)]
#[command(name = "wo", author, version, about = "Создание и обслуживание сайтов на Nginx, PHP-FPM и MySQL", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Путь к файлу конфигурации
    #[arg(short, long, global = true, default_value = config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Подробный журнал (уровень debug)
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Управление сайтами
    Site {
        #[command(subcommand)]
        command: SiteCommand,
    },
}

#[derive(Subcommand)]
enum SiteCommand {
    /// Создание сайта
    Create(CreateArgs),
    /// Клонирование сайта WordPress под новым доменом
    Clone {
        /// Исходный сайт
        source: String,
        /// Новый домен
        dest: String,
    },
    /// Резервное копирование сайтов
    Backup {
        domain: Option<String>,

        /// Все включенные сайты
        #[arg(long, conflicts_with = "domain")]
        all: bool,

        /// Только база данных
        #[arg(long, conflicts_with = "files")]
        db: bool,

        /// Только файлы
        #[arg(long)]
        files: bool,

        /// Сколько последних архивов оставить
        #[arg(long)]
        keep: Option<usize>,
    },
    /// Восстановление сайтов из архива или каталога резервной копии
    Restore {
        path: PathBuf,
    },
    /// Автоматическое обновление WordPress с резервной копией и откатом
    Autoupdate {
        domain: Option<String>,

        /// Все включенные сайты WordPress
        #[arg(long, conflicts_with = "domain")]
        all: bool,

        /// Только проверить наличие обновлений
        #[arg(long)]
        dry_run: bool,

        /// Каталог резервных копий
        #[arg(long)]
        backup_dir: Option<PathBuf>,
    },
}

#[derive(Args)]
struct CreateArgs {
    /// Доменное имя; если не указано, будет запрошено
    domain: Option<String>,

    /// Статический сайт
    #[arg(long)]
    html: bool,
    /// Сайт на PHP
    #[arg(long)]
    php: bool,
    /// Сайт на PHP с базой MySQL
    #[arg(long)]
    mysql: bool,
    /// WordPress
    #[arg(long)]
    wp: bool,
    /// WordPress multisite (подкаталоги)
    #[arg(long)]
    wpsubdir: bool,
    /// WordPress multisite (поддомены)
    #[arg(long)]
    wpsubdomain: bool,

    /// Кеш Nginx fastcgi_cache
    #[arg(long)]
    wpfc: bool,
    /// WP Super Cache
    #[arg(long)]
    wpsc: bool,
    /// WP Rocket
    #[arg(long)]
    wprocket: bool,
    /// Cache Enabler
    #[arg(long)]
    wpce: bool,
    /// Кеш Redis
    #[arg(long)]
    wpredis: bool,

    #[arg(long)]
    php74: bool,
    #[arg(long)]
    php80: bool,
    #[arg(long)]
    php81: bool,
    #[arg(long)]
    php82: bool,
    #[arg(long)]
    php83: bool,
    #[arg(long)]
    php84: bool,

    /// Прокси на `host[:port]`
    #[arg(long)]
    proxy: Option<String>,
    /// Алиас (редирект) на другой домен
    #[arg(long)]
    alias: Option<String>,
    /// Подсайт мультисайта WordPress
    #[arg(long)]
    subsiteof: Option<String>,

    /// Имя администратора WordPress
    #[arg(long)]
    user: Option<String>,
    /// Email администратора WordPress
    #[arg(long)]
    email: Option<String>,
    /// Пароль администратора WordPress
    #[arg(long)]
    pass: Option<String>,

    /// Только виртуальный хост и база, без установки WordPress
    #[arg(long = "vhostonly")]
    vhost_only: bool,
    /// HTTP-аутентификация для сайта
    #[arg(long)]
    secure: bool,
}

impl CreateArgs {
    fn site_flags(&self) -> SiteFlags {
        let php_versions = [
            ("php74", self.php74),
            ("php80", self.php80),
            ("php81", self.php81),
            ("php82", self.php82),
            ("php83", self.php83),
            ("php84", self.php84),
        ]
        .into_iter()
        .filter_map(|(tag, on)| on.then(|| tag.to_string()))
        .collect();

        SiteFlags {
            html: self.html,
            php: self.php,
            mysql: self.mysql,
            wp: self.wp,
            wpsubdir: self.wpsubdir,
            wpsubdomain: self.wpsubdomain,
            php_versions,
            wpfc: self.wpfc,
            wpsc: self.wpsc,
            wprocket: self.wprocket,
            wpce: self.wpce,
            wpredis: self.wpredis,
        }
    }

    fn special(&self) -> SpecialOptions {
        SpecialOptions {
            proxy: self.proxy.clone(),
            alias: self.alias.clone(),
            subsiteof: self.subsiteof.clone(),
        }
    }

    fn install(&self) -> InstallOptions {
        InstallOptions {
            admin_user: self.user.clone(),
            admin_email: self.email.clone(),
            admin_password: self.pass.clone(),
            vhost_only: self.vhost_only,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = WoConfig::load(&cli.config)?;
    let level = if cli.verbose { "debug" } else { config.log_level.as_str() };
    logger::init(level, config.log_file.as_deref())?;

    debug!("Запуск wo {}", env!("CARGO_PKG_VERSION"));

    let log_file = config.log_file.clone();
    if let Err(e) = run(cli.command, config) {
        logger::failure(&format!("{:#}", e));
        if error::is_input_failure(&e) {
            logger::input_hint();
        } else {
            logger::failure_hint(log_file.as_deref());
        }
        process::exit(1);
    }

    Ok(())
}

fn run(command: Commands, config: WoConfig) -> Result<()> {
    if !utils::is_root() {
        bail!("Команду нужно запускать с правами root (sudo wo ...)");
    }
    let services = Services::new(config);

    match command {
        Commands::Site { command } => match command {
            SiteCommand::Create(args) => create_site(&services, args),
            SiteCommand::Clone { source, dest } => clone_site(&services, &source, &dest),
            SiteCommand::Backup {
                domain,
                all,
                db,
                files,
                keep,
            } => backup_sites(&services, domain, all, db, files, keep),
            SiteCommand::Restore { path } => restore_sites(&services, path),
            SiteCommand::Autoupdate {
                domain,
                all,
                dry_run,
                backup_dir,
            } => autoupdate(&services, domain, all, dry_run, backup_dir),
        },
    }
}

fn create_site(services: &Services, args: CreateArgs) -> Result<()> {
    let domain = match &args.domain {
        Some(domain) => domain.clone(),
        None => Input::<String>::new()
            .with_prompt("Введите доменное имя сайта")
            .interact_text()?,
    };
    let request = CreateRequest {
        domain,
        flags: args.site_flags(),
        special: args.special(),
        install: args.install(),
        secure: args.secure,
    };

    let bar = logger::spinner(&format!("Создание сайта {}", request.domain));
    let progress = |step: Step| bar.set_message(format!("{}: {}", request.domain, step));
    let result = SiteCommands::new(services.host(), &services.config)
        .on_step(&progress)
        .create(&request);
    bar.finish_and_clear();

    report_site(&result?);
    Ok(())
}

fn clone_site(services: &Services, source: &str, dest: &str) -> Result<()> {
    let bar = logger::spinner(&format!("Клонирование {} в {}", source, dest));
    let progress = |step: Step| bar.set_message(format!("{}: {}", dest, step));
    let result = SiteCommands::new(services.host(), &services.config)
        .on_step(&progress)
        .clone_site(source, dest);
    bar.finish_and_clear();

    report_site(&result?);
    Ok(())
}

fn backup_sites(
    services: &Services,
    domain: Option<String>,
    all: bool,
    db: bool,
    files: bool,
    keep: Option<usize>,
) -> Result<()> {
    let target = match (domain, all) {
        (Some(domain), _) => BackupTarget::Site(domain),
        (None, true) => BackupTarget::All,
        (None, false) => bail!("Укажите домен или --all"),
    };
    let kind = match (db, files) {
        (true, _) => BackupKind::Db,
        (_, true) => BackupKind::Files,
        _ => BackupKind::All,
    };

    let archiver = services.archiver();
    let archives = site::backup_sites(
        &services.registry,
        &archiver,
        services.config.backup_root.as_deref(),
        &target,
        kind,
        keep,
    )?;

    for archive in &archives {
        logger::success(&format!("Резервная копия: {}", archive.display()));
    }
    if archives.is_empty() {
        info!("Нет сайтов для резервного копирования");
    }
    Ok(())
}

fn restore_sites(services: &Services, path: PathBuf) -> Result<()> {
    // Архив распаковывается во временный каталог, который живет до конца восстановления
    let extracted = if path.is_file() {
        Some(services.archiver().extract(&path)?)
    } else {
        None
    };
    let root = extracted.as_ref().map(|dir| dir.path()).unwrap_or(path.as_path());

    let outcomes = SiteCommands::new(services.host(), &services.config).restore(root)?;
    let total = outcomes.len();
    let mut failed = 0;

    for outcome in outcomes {
        let name = outcome
            .domain
            .unwrap_or_else(|| outcome.dir.display().to_string());
        match outcome.result {
            Ok(site) => report_site(&site),
            Err(e) => {
                failed += 1;
                logger::failure(&format!("{}: {}", name, e));
            }
        }
    }

    if failed > 0 {
        bail!("Не удалось восстановить {} из {} сайтов", failed, total);
    }
    Ok(())
}

fn autoupdate(
    services: &Services,
    domain: Option<String>,
    all: bool,
    dry_run: bool,
    backup_dir: Option<PathBuf>,
) -> Result<()> {
    let domain = match (domain, all) {
        (Some(domain), _) => Some(domain::validate(&domain)?),
        (None, true) => None,
        (None, false) => bail!("Укажите домен или --all"),
    };

    let config = &services.config;
    let archiver = services.archiver();
    let updater = AutoUpdater::new(
        &services.registry,
        &services.app,
        &archiver,
        &config.lock_dir,
        config.lock_max_age(),
    )
    .backup_root(backup_dir.or_else(|| config.backup_root.clone()));

    let targets = updater.targets(domain.as_deref())?;
    let Some(summary) = updater.run(&targets, dry_run)? else {
        logger::failure("Автообновление уже выполняется другим процессом");
        return Ok(());
    };

    let report = autoupdate::write_summary(&summary, &config.autoupdate_log_dir)?;
    for site in &summary.sites {
        let detail = site.reason.as_deref().or(site.error.as_deref()).unwrap_or("");
        println!("{:<40} {:<12} {}", site.site, site.status.as_str(), detail);
    }
    info!("Сводка автообновления: {:?}", report);

    if summary.has_errors() {
        bail!("Автообновление завершилось с ошибками, сводка: {}", report.display());
    }
    logger::success(&format!("Автообновление завершено, сводка: {}", report.display()));
    Ok(())
}

/// Выводит адрес сайта и сгенерированные учетные данные
fn report_site(site: &ProvisionedSite) {
    let domain = &site.descriptor.domain;
    logger::success(&format!("Сайт {} готов: http://{}", domain, domain));

    if site.descriptor.site_type().is_wordpress() {
        logger::credentials("WordPress admin", &format!("http://{}/wp-admin", domain));
    }
    if let Some(creds) = &site.context.credentials {
        logger::credentials("WordPress admin user", &creds.user);
        logger::credentials("WordPress admin password", &creds.password);
        logger::credentials("WordPress admin email", &creds.email);
    }
    if site.descriptor.site_type() == SiteType::Mysql {
        if let Some(db) = site.context.db_credentials() {
            logger::credentials("DB name", &db.name);
            logger::credentials("DB user", &db.user);
            logger::credentials("DB password", &db.password);
        }
    }
    if let Some(auth) = &site.context.http_auth {
        logger::credentials("HTTP Auth user", &auth.user);
        logger::credentials("HTTP Auth password", &auth.password);
    }
}
