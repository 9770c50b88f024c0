//! Внешние системы, которыми управляет конвейер создания сайтов.
//!
//! Каждая операция либо выполняется полностью, либо возвращает ошибку;
//! повторные попытки не выполняются.

use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::{
    classifier::SiteDescriptor,
    pipeline::BuildContext,
    registry::{SiteRegistryEntry, SiteUpdate},
};

/// Учетные данные базы данных сайта
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct DbCredentials {
    pub name: String,
    pub user: String,
    pub password: String,
    pub host: String,
}

/// Учетные данные администратора WordPress
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WpCredentials {
    pub user: String,
    pub password: String,
    pub email: String,
}

/// Пользователь и пароль HTTP-аутентификации (`--secure`)
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct HttpAuth {
    pub user: String,
    pub password: String,
}

/// Пул PHP-FPM сайта
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSpec {
    pub pool_name: String,
    pub user: String,
    pub php_version: String,
    pub webroot: PathBuf,
}

/// Параметры установки WordPress
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallOptions {
    pub admin_user: Option<String>,
    pub admin_email: Option<String>,
    pub admin_password: Option<String>,
    /// Только виртуальный хост, без загрузки и установки WordPress
    pub vhost_only: bool,
}

pub trait SiteRegistry {
    fn exists(&self, domain: &str) -> Result<bool>;
    fn get(&self, domain: &str) -> Result<Option<SiteRegistryEntry>>;
    /// Добавляет запись; существующий домен дает `RegistryError::AlreadyExists`
    fn create(&self, entry: SiteRegistryEntry) -> Result<()>;
    fn update(&self, domain: &str, update: SiteUpdate) -> Result<()>;
    fn delete(&self, domain: &str) -> Result<()>;
    fn all(&self) -> Result<Vec<SiteRegistryEntry>>;
}

pub trait VhostManager {
    /// Создает каталог сайта и конфигурацию веб-сервера, проверяя её синтаксис
    fn render(&self, descriptor: &SiteDescriptor, ctx: &BuildContext) -> Result<()>;
    fn remove(&self, domain: &str) -> Result<()>;
    fn reload(&self) -> Result<bool>;
    fn config_exists(&self, domain: &str) -> bool;
}

pub trait DatabaseServer {
    fn exists(&self, name: &str) -> Result<bool>;
    fn user_exists(&self, user: &str, host: &str) -> Result<bool>;
    fn create(&self, name: &str) -> Result<()>;
    fn create_user(&self, user: &str, host: &str, password: &str) -> Result<()>;
    fn grant(&self, user: &str, host: &str, name: &str) -> Result<()>;
    /// Отсутствующая база не считается ошибкой
    fn drop(&self, name: &str) -> Result<()>;
    /// Отсутствующий пользователь не считается ошибкой
    fn drop_user(&self, user: &str, host: &str) -> Result<()>;
    fn dump(&self, name: &str, dest: &Path) -> Result<()>;
    fn import(&self, name: &str, src: &Path) -> Result<()>;
}

pub trait ProcessPool {
    fn configure(&self, pool: &PoolSpec) -> Result<()>;
    /// Идемпотентно удаляет пул, его службу и системного пользователя
    fn remove(&self, pool: &PoolSpec) -> Result<()>;
}

pub trait Application {
    /// Устанавливает WordPress; `None` если установка пропущена (`vhost_only`)
    fn install(
        &self,
        descriptor: &SiteDescriptor,
        ctx: &BuildContext,
        options: &InstallOptions,
    ) -> Result<Option<WpCredentials>>;
    /// Копирует `htdocs` и файлы `*-config.php` из каталога `source` в каталог сайта
    fn copy_content(&self, source: &Path, ctx: &BuildContext) -> Result<()>;
    /// Заново создает `wp-config.php` с учетными данными из контекста
    fn write_config(&self, descriptor: &SiteDescriptor, ctx: &BuildContext) -> Result<()>;
    fn search_replace(&self, ctx: &BuildContext, from: &str, to: &str) -> Result<()>;
}
