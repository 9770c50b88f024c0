use anyhow::{Context, Result};
use log::debug;
use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

/// Проверяет, запущен ли процесс от имени root
pub fn is_root() -> bool {
    nix::unistd::geteuid().is_root()
}

/// Каталог отсутствует или пуст
pub fn is_missing_or_empty(path: &Path) -> bool {
    match fs::read_dir(path) {
        Ok(mut entries) => entries.next().is_none(),
        Err(e) => e.kind() == ErrorKind::NotFound,
    }
}

/// Удаляет дерево каталогов; отсутствие каталога не считается ошибкой
pub fn remove_dir_all_if_exists(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => {
            debug!("Удален каталог {:?}", path);
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Не удалось удалить каталог {:?}", path)),
    }
}

/// Удаляет файл или символическую ссылку; отсутствие не считается ошибкой
pub fn remove_file_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!("Удален файл {:?}", path);
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Не удалось удалить файл {:?}", path)),
    }
}

/// Записывает файл, создавая родительские каталоги
pub fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Не удалось создать директорию: {:?}", parent))?;
    }
    fs::write(path, contents).with_context(|| format!("Не удалось записать файл {:?}", path))
}

/// Файлы `*-config.php` в каталоге (без вложенных), по имени
pub fn config_files(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.is_file()
                && p.file_name()
                    .and_then(|n| n.to_str())
                    .map_or(false, |n| n.ends_with("-config.php"))
        })
        .collect();
    files.sort();
    files
}
