use std::{
    collections::BTreeMap,
    fs::{self, OpenOptions},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use nix::{errno::Errno, sys::signal, unistd::Pid};
use serde::{Deserialize, Serialize};

/// Содержимое файла блокировки
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LockInfo {
    pub owner_pid: i32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl LockInfo {
    fn current() -> Self {
        let mut metadata = BTreeMap::new();
        metadata.insert(
            "argv".to_string(),
            std::env::args().collect::<Vec<_>>().join(" "),
        );
        Self {
            owner_pid: std::process::id() as i32,
            created_at: Utc::now(),
            metadata,
        }
    }
}

/// Жив ли процесс с данным pid (EPERM означает, что процесс существует)
pub fn process_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    match signal::kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Неблокирующая консультативная блокировка на файле
pub struct LockCoordinator;

impl LockCoordinator {
    /// Пытается захватить блокировку.
    ///
    /// Устаревшая блокировка (старше `max_age` или владелец не жив)
    /// удаляется, если её содержимое не изменилось с момента проверки,
    /// после чего создание повторяется ровно один раз.
    ///
    /// # Returns
    /// `Ok(false)` если блокировку удерживает живой процесс
    pub fn acquire(path: &Path, max_age: Duration) -> Result<bool> {
        if Self::try_create(path)? {
            return Ok(true);
        }

        let seen = fs::read_to_string(path).ok();
        if !Self::is_stale(path, seen.as_deref(), max_age) {
            debug!("Блокировка {:?} удерживается другим процессом", path);
            return Ok(false);
        }

        warn!("Обнаружена устаревшая блокировка {:?}, удаляем", path);
        if !Self::remove_if_unchanged(path, seen.as_deref())? {
            debug!("Блокировка {:?} уже перехвачена другим процессом", path);
            return Ok(false);
        }

        Self::try_create(path)
    }

    /// Снимает блокировку; отсутствие файла не считается ошибкой
    pub fn release(path: &Path) {
        match fs::remove_file(path) {
            Ok(()) => debug!("Блокировка {:?} снята", path),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("Не удалось снять блокировку {:?}: {}", path, e),
        }
    }

    /// Захватывает блокировку и возвращает guard, снимающий её при выходе из области
    pub fn guard(path: &Path, max_age: Duration) -> Result<Option<LockGuard>> {
        if Self::acquire(path, max_age)? {
            Ok(Some(LockGuard {
                path: path.to_path_buf(),
            }))
        } else {
            Ok(None)
        }
    }

    fn try_create(path: &Path) -> Result<bool> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Не удалось создать каталог блокировок {:?}", parent))?;
        }

        let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => {
                return Err(e).with_context(|| format!("Не удалось создать блокировку {:?}", path))
            }
        };

        let info = serde_json::to_string(&LockInfo::current())
            .with_context(|| "Не удалось сериализовать данные блокировки")?;
        file.write_all(info.as_bytes())
            .with_context(|| format!("Не удалось записать блокировку {:?}", path))?;

        info!("Блокировка {:?} захвачена", path);
        Ok(true)
    }

    /// Удаляет файл блокировки, только если его содержимое совпадает с `seen`.
    ///
    /// # Returns
    /// `Ok(false)` если файл успел замениться блокировкой другого процесса
    fn remove_if_unchanged(path: &Path, seen: Option<&str>) -> Result<bool> {
        let current = fs::read_to_string(path).ok();
        if current.as_deref() != seen {
            return Ok(current.is_none() && !path.exists());
        }

        match fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(true),
            Err(e) => Err(e)
                .with_context(|| format!("Не удалось удалить устаревшую блокировку {:?}", path)),
        }
    }

    fn is_stale(path: &Path, text: Option<&str>, max_age: Duration) -> bool {
        let parsed = text.and_then(|text| serde_json::from_str::<LockInfo>(text).ok());

        match parsed {
            Some(info) => {
                let age = Utc::now()
                    .signed_duration_since(info.created_at)
                    .to_std()
                    .unwrap_or_default();
                age > max_age || !process_alive(info.owner_pid)
            }
            // Без читаемых метаданных судим только по времени изменения файла
            None => fs::metadata(path)
                .and_then(|m| m.modified())
                .map(|modified| {
                    SystemTime::now()
                        .duration_since(modified)
                        .unwrap_or_default()
                        > max_age
                })
                .unwrap_or(true),
        }
    }
}

/// Снимает блокировку при уничтожении
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        LockCoordinator::release(&self.path);
    }
}
