use crate::{
    config::PhpVersion,
    error::ConfigurationError,
    resolver::{CacheType, SiteFlags, SiteType, TypeResolver},
};

/// Параметры «виртуальных» сайтов, минующих обычное определение типа
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpecialOptions {
    /// `host[:port]`
    pub proxy: Option<String>,
    pub alias: Option<String>,
    pub subsiteof: Option<String>,
}

/// Вид сайта вместе с данными, которые нужны только этому виду
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SiteKind {
    Standard {
        site_type: SiteType,
        cache_type: CacheType,
    },
    Proxy {
        host: String,
        port: String,
    },
    Alias {
        target: String,
    },
    Subsite {
        parent: String,
    },
}

impl SiteKind {
    pub fn site_type(&self) -> SiteType {
        match self {
            Self::Standard { site_type, .. } => *site_type,
            Self::Proxy { .. } => SiteType::Proxy,
            Self::Alias { .. } => SiteType::Alias,
            Self::Subsite { .. } => SiteType::Subsite,
        }
    }

    pub fn cache_type(&self) -> CacheType {
        match self {
            Self::Standard { cache_type, .. } => *cache_type,
            _ => CacheType::Basic,
        }
    }
}

/// Результат классификации до привязки к домену
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteDraft {
    pub kind: SiteKind,
    /// Версия PHP, явно выбранная в командной строке
    pub php: Option<PhpVersion>,
}

impl SiteDraft {
    pub fn for_domain(self, domain: &str) -> SiteDescriptor {
        SiteDescriptor {
            domain: domain.to_string(),
            kind: self.kind,
            php: self.php,
        }
    }
}

/// Неизменяемое описание создаваемого сайта
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteDescriptor {
    pub domain: String,
    pub kind: SiteKind,
    pub php: Option<PhpVersion>,
}

impl SiteDescriptor {
    pub fn site_type(&self) -> SiteType {
        self.kind.site_type()
    }

    pub fn cache_type(&self) -> CacheType {
        self.kind.cache_type()
    }

    pub fn php_number(&self) -> Option<&str> {
        self.php.as_ref().map(|v| v.number.as_str())
    }
}

pub struct SiteTypeClassifier<'a> {
    resolver: &'a TypeResolver,
}

impl<'a> SiteTypeClassifier<'a> {
    pub fn new(resolver: &'a TypeResolver) -> Self {
        Self { resolver }
    }

    /// Определяет вид сайта по параметрам типа и специальным параметрам.
    ///
    /// Специальные параметры проверяются в порядке: прокси, алиас, подсайт.
    /// Любое сочетание двух источников типа считается конфликтом.
    ///
    /// # Examples
    /// ```rust
    /// let special = SpecialOptions { proxy: Some("127.0.0.1".into()), ..Default::default() };
    /// let draft = classifier.classify(&SiteFlags::default(), &special)?;
    /// assert_eq!(draft.kind, SiteKind::Proxy { host: "127.0.0.1".into(), port: "80".into() });
    /// ```
    pub fn classify(
        &self,
        flags: &SiteFlags,
        special: &SpecialOptions,
    ) -> Result<SiteDraft, ConfigurationError> {
        let resolved = self.resolver.resolve(flags)?;

        let present: Vec<&'static str> = [
            ("proxy", special.proxy.is_some()),
            ("alias", special.alias.is_some()),
            ("subsiteof", special.subsiteof.is_some()),
        ]
        .into_iter()
        .filter_map(|(name, on)| on.then_some(name))
        .collect();

        if resolved.is_some() {
            if let Some(name) = present.first() {
                return Err(ConfigurationError::ConflictingSiteType { special: *name });
            }
        }
        if let Some(name) = present.get(1) {
            return Err(ConfigurationError::ConflictingSiteType { special: *name });
        }

        let kind = match resolved {
            Some((site_type, cache_type)) => {
                if cache_type != CacheType::Basic && !site_type.is_wordpress() {
                    return Err(ConfigurationError::CacheRequiresWordPress {
                        site_type: site_type.to_string(),
                        cache: cache_type.to_string(),
                    });
                }
                SiteKind::Standard {
                    site_type,
                    cache_type,
                }
            }
            None => self.special_kind(special)?,
        };

        let php = match kind {
            SiteKind::Standard { site_type, .. } if site_type.is_php_backed() => flags
                .php_versions
                .iter()
                .next()
                .and_then(|tag| self.resolver.versions().by_tag(tag))
                .cloned(),
            _ => None,
        };

        Ok(SiteDraft { kind, php })
    }

    fn special_kind(&self, special: &SpecialOptions) -> Result<SiteKind, ConfigurationError> {
        if let Some(proxy) = &special.proxy {
            let (host, port) = parse_proxy(proxy)?;
            return Ok(SiteKind::Proxy { host, port });
        }

        if let Some(alias) = &special.alias {
            let target = alias.trim();
            if target.is_empty() {
                return Err(ConfigurationError::MissingAliasName);
            }
            return Ok(SiteKind::Alias {
                target: target.to_string(),
            });
        }

        if let Some(parent) = &special.subsiteof {
            let parent = parent.trim();
            if parent.is_empty() {
                return Err(ConfigurationError::MissingParentName);
            }
            return Ok(SiteKind::Subsite {
                parent: parent.to_string(),
            });
        }

        Ok(SiteKind::Standard {
            site_type: SiteType::Html,
            cache_type: CacheType::Basic,
        })
    }
}

/// Разбирает `host[:port]`; порт по умолчанию 80
pub fn parse_proxy(input: &str) -> Result<(String, String), ConfigurationError> {
    let input = input.trim();
    let (host, port) = match input.split_once(':') {
        Some((host, port)) => (host.trim(), port.trim()),
        None => (input, "80"),
    };

    if host.is_empty() {
        return Err(ConfigurationError::MissingProxyHost);
    }
    if port.parse::<u16>().is_err() {
        return Err(ConfigurationError::InvalidProxyPort(port.to_string()));
    }

    Ok((host.to_string(), port.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PhpVersionTable;
    use rstest::rstest;

    fn classify(flags: SiteFlags, special: SpecialOptions) -> Result<SiteDraft, ConfigurationError> {
        let resolver = TypeResolver::new(PhpVersionTable::default());
        SiteTypeClassifier::new(&resolver).classify(&flags, &special)
    }

    fn proxy(value: &str) -> SpecialOptions {
        SpecialOptions {
            proxy: Some(value.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn bare_proxy_host_defaults_to_port_80() {
        let draft = classify(SiteFlags::default(), proxy("127.0.0.1")).unwrap();
        assert_eq!(
            draft.kind,
            SiteKind::Proxy {
                host: "127.0.0.1".to_string(),
                port: "80".to_string()
            }
        );
        assert_eq!(draft.php, None);
    }

    #[rstest]
    #[case("  10.0.0.5:8080 ", "10.0.0.5", "8080")]
    #[case("backend.local", "backend.local", "80")]
    fn proxy_target_is_parsed(#[case] input: &str, #[case] host: &str, #[case] port: &str) {
        assert_eq!(
            parse_proxy(input).unwrap(),
            (host.to_string(), port.to_string())
        );
    }

    #[rstest]
    #[case("   ", ConfigurationError::MissingProxyHost)]
    #[case(":8080", ConfigurationError::MissingProxyHost)]
    #[case("host:http", ConfigurationError::InvalidProxyPort("http".to_string()))]
    #[case("host:70000", ConfigurationError::InvalidProxyPort("70000".to_string()))]
    fn bad_proxy_target(#[case] input: &str, #[case] expected: ConfigurationError) {
        assert_eq!(classify(SiteFlags::default(), proxy(input)), Err(expected));
    }

    #[test]
    fn alias_and_subsite_are_trimmed() {
        let alias = SpecialOptions {
            alias: Some(" example.com ".to_string()),
            ..Default::default()
        };
        assert_eq!(
            classify(SiteFlags::default(), alias).unwrap().kind,
            SiteKind::Alias {
                target: "example.com".to_string()
            }
        );

        let subsite = SpecialOptions {
            subsiteof: Some("network.example.com".to_string()),
            ..Default::default()
        };
        let draft = classify(SiteFlags::default(), subsite).unwrap();
        assert_eq!(draft.kind.site_type(), SiteType::Subsite);
        assert_eq!(draft.kind.cache_type(), CacheType::Basic);
    }

    #[test]
    fn empty_alias_and_parent_are_rejected() {
        let alias = SpecialOptions {
            alias: Some("".to_string()),
            ..Default::default()
        };
        assert_eq!(
            classify(SiteFlags::default(), alias),
            Err(ConfigurationError::MissingAliasName)
        );

        let subsite = SpecialOptions {
            subsiteof: Some(" ".to_string()),
            ..Default::default()
        };
        assert_eq!(
            classify(SiteFlags::default(), subsite),
            Err(ConfigurationError::MissingParentName)
        );
    }

    #[test]
    fn nothing_given_means_plain_html() {
        let draft = classify(SiteFlags::default(), SpecialOptions::default()).unwrap();
        assert_eq!(
            draft.kind,
            SiteKind::Standard {
                site_type: SiteType::Html,
                cache_type: CacheType::Basic
            }
        );
    }

    #[rstest]
    #[case(SiteFlags { wp: true, ..Default::default() }, proxy("127.0.0.1"), "proxy")]
    #[case(SiteFlags { wpfc: true, ..Default::default() }, SpecialOptions { alias: Some("a.com".into()), ..Default::default() }, "alias")]
    #[case(SiteFlags::default(), SpecialOptions { proxy: Some("h".into()), alias: Some("a.com".into()), ..Default::default() }, "alias")]
    #[case(SiteFlags::default(), SpecialOptions { alias: Some("a.com".into()), subsiteof: Some("p.com".into()), ..Default::default() }, "subsiteof")]
    #[case(SiteFlags { html: true, ..Default::default() }, SpecialOptions { subsiteof: Some("p.com".into()), ..Default::default() }, "subsiteof")]
    fn two_type_sources_conflict(
        #[case] flags: SiteFlags,
        #[case] special: SpecialOptions,
        #[case] name: &'static str,
    ) {
        assert_eq!(
            classify(flags, special),
            Err(ConfigurationError::ConflictingSiteType { special: name })
        );
    }

    #[test]
    fn conflict_is_reported_before_empty_value() {
        let special = SpecialOptions {
            proxy: Some("".to_string()),
            subsiteof: Some("".to_string()),
            ..Default::default()
        };
        assert_eq!(
            classify(SiteFlags::default(), special),
            Err(ConfigurationError::ConflictingSiteType {
                special: "subsiteof"
            })
        );
    }

    #[test]
    fn cache_on_non_wordpress_type_is_rejected() {
        let flags = SiteFlags {
            html: true,
            wpfc: true,
            ..Default::default()
        };
        assert!(matches!(
            classify(flags, SpecialOptions::default()),
            Err(ConfigurationError::CacheRequiresWordPress { .. })
        ));
    }

    #[test]
    fn php_selection_is_carried_for_php_backed_types() {
        let mut flags = SiteFlags {
            wp: true,
            ..Default::default()
        };
        flags.php_versions.insert("php81".to_string());

        let draft = classify(flags, SpecialOptions::default()).unwrap();
        let descriptor = draft.for_domain("example.com");
        assert_eq!(descriptor.site_type(), SiteType::Wp);
        assert_eq!(descriptor.php_number(), Some("8.1"));
    }
}
