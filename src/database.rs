use std::{fs, path::Path, sync::OnceLock};

use anyhow::{anyhow, bail, Context, Result};
use log::{debug, info};
use regex::Regex;

use crate::{
    collaborators::DatabaseServer,
    config::MysqlSettings,
    shell::{CommandRunner, CommandSpec},
};

/// Права пользователя сайта WordPress на его базу
const WORDPRESS_PRIVILEGES: &str = "SELECT, INSERT, UPDATE, DELETE, CREATE, DROP, ALTER, INDEX, \
     CREATE TEMPORARY TABLES, LOCK TABLES, CREATE VIEW, SHOW VIEW, EVENT, TRIGGER";

fn identifier_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_]{1,64}$").expect("identifier regex"))
}

/// Проверяет имя базы или пользователя и заключает его в обратные кавычки
pub fn quote_identifier(name: &str) -> Result<String> {
    if !identifier_regex().is_match(name) {
        bail!("недопустимое имя в MySQL: {:?}", name);
    }
    Ok(format!("`{}`", name))
}

fn quote_literal(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

/// Сервер MySQL/MariaDB, управляемый через клиент `mysql`
pub struct MysqlServer {
    settings: MysqlSettings,
    runner: CommandRunner,
}

impl MysqlServer {
    pub fn new(settings: MysqlSettings, runner: CommandRunner) -> Self {
        Self { settings, runner }
    }

    fn client(&self, program: &str) -> CommandSpec {
        let spec = CommandSpec::new(program);
        if self.settings.defaults_file.exists() {
            spec.arg(format!(
                "--defaults-extra-file={}",
                self.settings.defaults_file.display()
            ))
        } else {
            spec
        }
    }

    /// Выполняет SQL-выражение; текст передается через stdin
    fn execute(&self, sql: &str, description: &str) -> Result<String> {
        debug!("MySQL: {}", crate::shell::redact(sql));
        self.runner.run(
            &self
                .client("mysql")
                .args(["-N", "-B"])
                .stdin(sql)
                .describe(description),
        )
    }
}

impl DatabaseServer for MysqlServer {
    fn exists(&self, name: &str) -> Result<bool> {
        let sql = format!("SHOW DATABASES LIKE '{}';", quote_literal(name).replace('_', "\\_"));
        let out = self.execute(&sql, "Проверка существования базы")?;
        Ok(out.lines().any(|line| line.trim() == name))
    }

    fn user_exists(&self, user: &str, host: &str) -> Result<bool> {
        let sql = format!(
            "SELECT User FROM mysql.user WHERE User='{}' AND Host='{}';",
            quote_literal(user),
            quote_literal(host)
        );
        let out = self.execute(&sql, "Проверка существования пользователя")?;
        Ok(out.lines().any(|line| line.trim() == user))
    }

    fn create(&self, name: &str) -> Result<()> {
        let sql = format!("CREATE DATABASE {};", quote_identifier(name)?);
        self.execute(&sql, "Создание базы данных")
            .with_context(|| format!("Не удалось создать базу данных {}", name))?;
        Ok(())
    }

    fn create_user(&self, user: &str, host: &str, password: &str) -> Result<()> {
        let sql = format!(
            "CREATE USER {}@'{}' IDENTIFIED BY '{}';",
            quote_identifier(user)?,
            quote_literal(host),
            quote_literal(password)
        );
        self.execute(&sql, "Создание пользователя базы данных")
            .with_context(|| format!("Не удалось создать пользователя {}", user))?;
        Ok(())
    }

    fn grant(&self, user: &str, host: &str, name: &str) -> Result<()> {
        let sql = format!(
            "GRANT {} ON {}.* TO {}@'{}'; FLUSH PRIVILEGES;",
            WORDPRESS_PRIVILEGES,
            quote_identifier(name)?,
            quote_identifier(user)?,
            quote_literal(host)
        );
        self.execute(&sql, "Выдача прав пользователю")
            .with_context(|| format!("Не удалось выдать права {} на {}", user, name))?;
        Ok(())
    }

    fn drop(&self, name: &str) -> Result<()> {
        let sql = format!("DROP DATABASE IF EXISTS {};", quote_identifier(name)?);
        self.execute(&sql, "Удаление базы данных")?;
        info!("База данных {} удалена", name);
        Ok(())
    }

    fn drop_user(&self, user: &str, host: &str) -> Result<()> {
        let sql = format!(
            "DROP USER IF EXISTS {}@'{}'; FLUSH PRIVILEGES;",
            quote_identifier(user)?,
            quote_literal(host)
        );
        self.execute(&sql, "Удаление пользователя базы данных")?;
        info!("Пользователь {} удален", user);
        Ok(())
    }

    fn dump(&self, name: &str, dest: &Path) -> Result<()> {
        quote_identifier(name)?;
        let out = self.runner.run(
            &self
                .client("mysqldump")
                .args(["--single-transaction", "--hex-blob", name])
                .describe("Резервная копия базы данных"),
        )?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Не удалось создать директорию {:?}", parent))?;
        }
        fs::write(dest, out).with_context(|| format!("Не удалось записать дамп {:?}", dest))?;
        info!("Дамп базы {} сохранен в {:?}", name, dest);
        Ok(())
    }

    fn import(&self, name: &str, src: &Path) -> Result<()> {
        quote_identifier(name)?;
        let sql = fs::read_to_string(src)
            .with_context(|| format!("Не удалось прочитать дамп {:?}", src))?;
        self.runner
            .run(
                &self
                    .client("mysql")
                    .arg(name)
                    .stdin(sql)
                    .describe("Импорт базы данных"),
            )
            .map_err(|e| anyhow!("Не удалось импортировать {:?} в {}: {:#}", src, name, e))?;
        info!("Дамп {:?} импортирован в {}", src, name);
        Ok(())
    }
}
