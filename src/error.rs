use std::path::PathBuf;

use thiserror::Error;

use crate::pipeline::Step;

/// Недопустимая или противоречивая комбинация параметров командной строки.
///
/// Возникает до того, как затронут хоть один ресурс, поэтому откат не нужен.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("Не удалось определить тип кеша: указано несколько параметров кеша ({0})")]
    MultipleCacheParameters(String),
    #[error("Не удалось определить тип сайта и кеша")]
    UnresolvedCombination,
    #[error("Неизвестная версия PHP: {0}")]
    UnknownPhpVersion(String),
    #[error("Параметр кеша {cache} допустим только для сайтов WordPress (тип {site_type})")]
    CacheRequiresWordPress { site_type: String, cache: String },
    #[error("Не указан адрес прокси-сервера")]
    MissingProxyHost,
    #[error("Некорректный порт прокси-сервера: {0}")]
    InvalidProxyPort(String),
    #[error("Не указано имя алиаса")]
    MissingAliasName,
    #[error("Не указан родительский сайт (subsiteof)")]
    MissingParentName,
    #[error("Нельзя сочетать --{special} с другими параметрами типа сайта")]
    ConflictingSiteType { special: &'static str },
}

/// Ошибки проверки входных данных, обнаруженные до запуска конвейера.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Некорректное доменное имя: {0}")]
    InvalidDomain(String),
    #[error("Сайт {0} уже существует")]
    SiteExists(String),
    #[error("Конфигурация Nginx для {0} уже существует")]
    VhostExists(String),
    #[error("Каталог сайта {0:?} уже существует и не пуст")]
    WebrootExists(PathBuf),
    #[error("Родительский сайт {0} не существует")]
    ParentMissing(String),
    #[error("Родительский сайт {0} отключен")]
    ParentDisabled(String),
    #[error("Родительский сайт {0} не является мультисайтом WordPress")]
    ParentNotMultisite(String),
    #[error("Сайт {0} не найден")]
    SiteMissing(String),
    #[error("Сайт {domain} имеет тип {site_type}, операция поддерживается только для WordPress")]
    NotWordPress { domain: String, site_type: String },
}

/// Общая ошибка операций с сайтами.
#[derive(Error, Debug)]
pub enum SiteError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// Шаг конвейера завершился с ошибкой, выполненные шаги откатаны.
    /// Подробная причина записывается в журнал на уровне debug.
    #[error("Ошибка на шаге {step}: {message}")]
    ProvisioningFailed {
        step: Step,
        message: String,
        cause: anyhow::Error,
    },
    #[error("Блокировка {0:?} удерживается другим процессом")]
    LockContention(PathBuf),
}

impl SiteError {
    /// Требует ли ошибка исправления входных данных (а не состояния системы)
    pub fn is_input_error(&self) -> bool {
        matches!(self, Self::Configuration(_) | Self::Validation(_))
    }
}

/// Ищет в цепочке причин ошибку входных данных.
///
/// # Returns
/// `true`, если команду нужно повторить с исправленными параметрами;
/// `false`, если ошибка возникла при работе с системой
pub fn is_input_failure(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<SiteError>()
            .is_some_and(SiteError::is_input_error)
            || cause.is::<ConfigurationError>()
            || cause.is::<ValidationError>()
    })
}

/// Ошибки реестра сайтов
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Запись для {0} уже существует в реестре")]
    AlreadyExists(String),
    #[error("Запись для {0} не найдена в реестре")]
    NotFound(String),
}
