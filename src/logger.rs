use std::{
    fs::{self, OpenOptions},
    path::Path,
    time::Duration,
};

use anyhow::Result;
use colored::*;
use env_logger::{Builder, Env, Target};
use indicatif::{ProgressBar, ProgressStyle};
use log::LevelFilter;

/// Инициализирует логирование
///
/// Если задан `log_file` и его удается открыть, подробный журнал пишется
/// в файл, иначе в stderr. Пользовательские сообщения выводятся отдельно
/// функциями этого модуля.
///
/// # Arguments
/// * `level` - Уровень по умолчанию (переопределяется `RUST_LOG`)
/// * `log_file` - Путь к файлу журнала
///
/// # Examples
/// ```rust
/// logger::init("info", Some(Path::new("/var/log/wo/wordops.log")))?;
/// ```
pub fn init(level: &str, log_file: Option<&Path>) -> Result<()> {
    let env = Env::default()
        .filter_or("RUST_LOG", level)
        .write_style_or("RUST_LOG_STYLE", "auto");

    let mut builder = Builder::from_env(env);
    builder.format_timestamp_secs().format_module_path(true);

    if let Some(path) = log_file {
        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        if let Ok(file) = OpenOptions::new().create(true).append(true).open(path) {
            builder.target(Target::Pipe(Box::new(file)));
            // В файл пишем все подробности, независимо от уровня для терминала
            builder.filter_level(LevelFilter::Debug);
        }
    }

    builder.init();

    Ok(())
}

/// Логирует сгенерированные учетные данные
///
/// # Examples
/// ```rust
/// logger::credentials("WordPress admin password", "s3cr3t");
/// ```
pub fn credentials(label: &str, value: &str) {
    println!("{} {}: {}", "[CREDENTIALS]".magenta().bold(), label, value.cyan().bold());
}

/// Логирует успешное выполнение операции
pub fn success(message: &str) {
    println!("{} {}", "[SUCCESS]".green().bold(), message);
}

/// Логирует неуспешное выполнение операции
pub fn failure(message: &str) {
    eprintln!("{} {}", "[FAILED]".red().bold(), message);
}

/// Подсказка для ошибок, возникших при работе с системой
pub fn failure_hint(log_file: Option<&Path>) {
    let hint = match log_file {
        Some(path) => format!(
            "Подробности в журнале: `tail {}`, затем повторите команду",
            path.display()
        ),
        None => "Запустите команду с RUST_LOG=debug для подробностей и повторите её".to_string(),
    };
    eprintln!("{} {}", "[HINT]".yellow().bold(), hint);
}

/// Подсказка для ошибок во входных параметрах: система не изменялась
pub fn input_hint() {
    eprintln!(
        "{} Исправьте параметры команды и повторите её, см. `wo site create --help`",
        "[HINT]".yellow().bold()
    );
}

/// Создает индикатор выполнения для длительных операций
pub fn spinner(message: &str) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::with_template("{spinner:.blue} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    bar.set_message(message.to_string());
    bar.enable_steady_tick(Duration::from_millis(120));
    bar
}
