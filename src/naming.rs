use anyhow::Result;
use log::debug;
use rand::seq::SliceRandom;

const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Максимальная длина имени базы данных
pub const DB_NAME_MAX: usize = 32;
/// Максимальная длина имени пользователя базы данных
pub const DB_USER_MAX: usize = 12;

/// Что именно проверяется на конфликт имен
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifierKind {
    Database,
    User,
}

impl IdentifierKind {
    fn suffix_len(&self) -> usize {
        match self {
            Self::Database => 8,
            Self::User => 4,
        }
    }
}

/// Кандидаты имен базы и пользователя, полученные из домена
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbIdentifiers {
    pub name: String,
    pub user: String,
}

/// Случайная строка из букв и цифр без повторов символов.
///
/// Длина ограничена размером алфавита.
pub fn random_alphanumeric(len: usize) -> String {
    let mut rng = rand::thread_rng();
    ALPHABET
        .choose_multiple(&mut rng, len.min(ALPHABET.len()))
        .map(|&b| b as char)
        .collect()
}

/// Выводит кандидаты имен базы данных и пользователя из домена
///
/// # Examples
/// ```rust
/// let ids = naming::derive_db_identifiers("my-site.example.com");
/// assert_eq!(ids.name, "my_site_example_com");
/// assert_eq!(ids.user, "mysiteexampl");
/// ```
pub fn derive_db_identifiers(domain: &str) -> DbIdentifiers {
    let base = domain.replace('-', "_").replace('.', "_");
    let user: String = base.replace('_', "");

    DbIdentifiers {
        name: base.chars().take(DB_NAME_MAX).collect(),
        user: user.chars().take(DB_USER_MAX).collect(),
    }
}

/// Возвращает кандидата как есть, либо с одним случайным суффиксом,
/// если `exists` сообщает о конфликте. Повторной проверки не выполняется.
pub fn resolve<F>(candidate: &str, kind: IdentifierKind, exists: F) -> Result<String>
where
    F: FnOnce(&str) -> Result<bool>,
{
    if !exists(candidate)? {
        return Ok(candidate.to_string());
    }

    let resolved = match kind {
        IdentifierKind::Database => format!("{}_{}", candidate, random_alphanumeric(kind.suffix_len())),
        IdentifierKind::User => format!("{}{}", candidate, random_alphanumeric(kind.suffix_len())),
    };
    debug!("Имя {} занято, используется {}", candidate, resolved);
    Ok(resolved)
}
