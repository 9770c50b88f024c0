use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::Path,
};

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use log::debug;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Запись журнала аудита о выполненной внешней команде
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AuditRecord {
    pub id: String,
    pub timestamp: DateTime<Local>,
    pub action: String,
    pub user: String,
    pub command: String,
    pub status: String,
    pub exit_code: Option<i32>,
    pub details: Option<String>,
}

impl AuditRecord {
    pub fn new(action: &str, command: &str, exit_code: Option<i32>, details: Option<&str>) -> Self {
        let status = match exit_code {
            Some(0) => "success",
            _ => "error",
        };
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Local::now(),
            action: action.to_string(),
            user: std::env::var("SUDO_USER")
                .or_else(|_| std::env::var("USER"))
                .unwrap_or_else(|_| "unknown".to_string()),
            command: command.to_string(),
            status: status.to_string(),
            exit_code,
            details: details.map(|s| s.to_string()),
        }
    }
}

/// Дописывает запись в журнал аудита (одна JSON-строка на запись)
pub fn append(record: &AuditRecord, log_file: &Path) -> Result<()> {
    if let Some(parent) = log_file.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Не удалось создать директорию для аудита: {:?}", parent))?;
    }

    let line =
        serde_json::to_string(record).with_context(|| "Не удалось сериализовать запись аудита")?;

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
        .with_context(|| format!("Не удалось открыть файл журнала аудита: {:?}", log_file))?;

    writeln!(file, "{}", line).with_context(|| "Не удалось записать запись аудита в файл")?;

    debug!("Записан аудит: {} - {}", record.action, record.status);
    Ok(())
}
