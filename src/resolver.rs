use std::{collections::BTreeSet, fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{config::PhpVersionTable, error::ConfigurationError};

/// Канонический тип сайта
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SiteType {
    Html,
    Php,
    Mysql,
    Wp,
    WpSubdir,
    WpSubdomain,
    Proxy,
    Alias,
    Subsite,
}

impl SiteType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Html => "html",
            Self::Php => "php",
            Self::Mysql => "mysql",
            Self::Wp => "wp",
            Self::WpSubdir => "wpsubdir",
            Self::WpSubdomain => "wpsubdomain",
            Self::Proxy => "proxy",
            Self::Alias => "alias",
            Self::Subsite => "subsite",
        }
    }

    /// WordPress и оба вида мультисайта
    pub fn is_wordpress(&self) -> bool {
        matches!(self, Self::Wp | Self::WpSubdir | Self::WpSubdomain)
    }

    pub fn is_multisite(&self) -> bool {
        matches!(self, Self::WpSubdir | Self::WpSubdomain)
    }

    /// Сайту нужен собственный пул PHP-FPM
    pub fn is_php_backed(&self) -> bool {
        matches!(self, Self::Php | Self::Mysql) || self.is_wordpress()
    }

    /// Сайту нужна собственная база данных
    pub fn is_db_backed(&self) -> bool {
        matches!(self, Self::Mysql) || self.is_wordpress()
    }
}

impl fmt::Display for SiteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SiteType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "html" => Ok(Self::Html),
            "php" => Ok(Self::Php),
            "mysql" => Ok(Self::Mysql),
            "wp" => Ok(Self::Wp),
            "wpsubdir" => Ok(Self::WpSubdir),
            "wpsubdomain" => Ok(Self::WpSubdomain),
            "proxy" => Ok(Self::Proxy),
            "alias" => Ok(Self::Alias),
            "subsite" => Ok(Self::Subsite),
            other => Err(format!("неизвестный тип сайта: {}", other)),
        }
    }
}

/// Механизм кеширования сайта WordPress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheType {
    #[default]
    Basic,
    Wpfc,
    Wpsc,
    Wprocket,
    Wpce,
    Wpredis,
}

impl CacheType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Basic => "basic",
            Self::Wpfc => "wpfc",
            Self::Wpsc => "wpsc",
            Self::Wprocket => "wprocket",
            Self::Wpce => "wpce",
            Self::Wpredis => "wpredis",
        }
    }
}

impl fmt::Display for CacheType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Параметры типа сайта, PHP и кеша, полученные из командной строки
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SiteFlags {
    pub html: bool,
    pub php: bool,
    pub mysql: bool,
    pub wp: bool,
    pub wpsubdir: bool,
    pub wpsubdomain: bool,
    /// Теги версий PHP (`php84` и т.п.)
    pub php_versions: BTreeSet<String>,
    pub wpfc: bool,
    pub wpsc: bool,
    pub wprocket: bool,
    pub wpce: bool,
    pub wpredis: bool,
}

impl SiteFlags {
    fn active_caches(&self) -> Vec<CacheType> {
        [
            (self.wpfc, CacheType::Wpfc),
            (self.wpsc, CacheType::Wpsc),
            (self.wpredis, CacheType::Wpredis),
            (self.wprocket, CacheType::Wprocket),
            (self.wpce, CacheType::Wpce),
        ]
        .into_iter()
        .filter_map(|(on, cache)| on.then_some(cache))
        .collect()
    }

    fn active_types(&self) -> BTreeSet<TypeFlag> {
        let mut types: BTreeSet<TypeFlag> = [
            (self.html, TypeFlag::Html),
            (self.php, TypeFlag::Php),
            (self.mysql, TypeFlag::Mysql),
            (self.wp, TypeFlag::Wp),
            (self.wpsubdir, TypeFlag::WpSubdir),
            (self.wpsubdomain, TypeFlag::WpSubdomain),
        ]
        .into_iter()
        .filter_map(|(on, flag)| on.then_some(flag))
        .collect();
        types.extend(self.php_versions.iter().cloned().map(TypeFlag::Version));
        types
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum TypeFlag {
    Html,
    Php,
    Mysql,
    Wp,
    WpSubdir,
    WpSubdomain,
    Version(String),
}

impl TypeFlag {
    fn site_type(&self) -> SiteType {
        match self {
            Self::Html => SiteType::Html,
            Self::Php | Self::Version(_) => SiteType::Php,
            Self::Mysql => SiteType::Mysql,
            Self::Wp => SiteType::Wp,
            Self::WpSubdir => SiteType::WpSubdir,
            Self::WpSubdomain => SiteType::WpSubdomain,
        }
    }
}

/// Сопоставляет набор параметров с каноническим типом сайта и кеша.
///
/// Таблица допустимых сочетаний строится один раз при создании: сначала
/// фиксированные записи, затем записи для каждой версии PHP по возрастанию.
/// Побеждает первая запись, содержащая все активные параметры.
#[derive(Debug, Clone)]
pub struct TypeResolver {
    versions: PhpVersionTable,
    combinations: Vec<(BTreeSet<TypeFlag>, SiteType)>,
}

impl TypeResolver {
    pub fn new(versions: PhpVersionTable) -> Self {
        use TypeFlag::*;

        let entry = |flags: Vec<TypeFlag>, site_type: SiteType| -> (BTreeSet<TypeFlag>, SiteType) {
            (flags.into_iter().collect(), site_type)
        };

        let mut combinations = vec![
            entry(vec![Php, Mysql, Html], SiteType::Mysql),
            entry(vec![Html, Mysql], SiteType::Mysql),
            entry(vec![Php, Mysql], SiteType::Mysql),
            entry(vec![Php, Html], SiteType::Php),
            entry(vec![Wp, WpSubdir], SiteType::WpSubdir),
            entry(vec![Wp, WpSubdomain], SiteType::WpSubdomain),
        ];

        for version in versions.iter() {
            let v = || Version(version.tag.clone());
            combinations.push(entry(vec![v(), Mysql, Html], SiteType::Mysql));
            combinations.push(entry(vec![v(), Mysql], SiteType::Mysql));
            combinations.push(entry(vec![Wp, v()], SiteType::Wp));
            combinations.push(entry(vec![WpSubdir, v()], SiteType::WpSubdir));
            combinations.push(entry(vec![WpSubdomain, v()], SiteType::WpSubdomain));
        }

        Self {
            versions,
            combinations,
        }
    }

    pub fn versions(&self) -> &PhpVersionTable {
        &self.versions
    }

    /// Определяет тип сайта и кеша.
    ///
    /// # Returns
    /// `Ok(None)` если не указан ни тип, ни кеш; решение по умолчанию
    /// принимает вызывающая сторона.
    ///
    /// # Examples
    /// ```rust
    /// let flags = SiteFlags { wp: true, wpsubdir: true, ..Default::default() };
    /// assert_eq!(resolver.resolve(&flags)?, Some((SiteType::WpSubdir, CacheType::Basic)));
    /// ```
    pub fn resolve(
        &self,
        flags: &SiteFlags,
    ) -> Result<Option<(SiteType, CacheType)>, ConfigurationError> {
        for tag in &flags.php_versions {
            if !self.versions.is_version_tag(tag) {
                return Err(ConfigurationError::UnknownPhpVersion(tag.clone()));
            }
        }

        let caches = flags.active_caches();
        if caches.len() > 1 {
            let names: Vec<_> = caches.iter().map(CacheType::as_str).collect();
            return Err(ConfigurationError::MultipleCacheParameters(names.join(", ")));
        }
        let cache = caches.first().copied().unwrap_or_default();

        let types = flags.active_types();
        let mut iter = types.iter();
        match (iter.next(), iter.next()) {
            (None, _) if cache == CacheType::Basic => Ok(None),
            (None, _) => Ok(Some((SiteType::Wp, cache))),
            (Some(TypeFlag::Version(_)), None) if cache != CacheType::Basic => {
                Ok(Some((SiteType::Wp, cache)))
            }
            (Some(single), None) => Ok(Some((single.site_type(), cache))),
            _ => self
                .combinations
                .iter()
                .find(|(allowed, _)| types.is_subset(allowed))
                .map(|(_, site_type)| Some((*site_type, cache)))
                .ok_or(ConfigurationError::UnresolvedCombination),
        }
    }
}
