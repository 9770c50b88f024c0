use std::{
    io::Write,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    sync::OnceLock,
};

use anyhow::{anyhow, Context, Result};
use log::{debug, error};
use regex::Regex;

use crate::audit::{self, AuditRecord};

/// Описание запуска внешней программы: вектор аргументов, без оболочки
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    program: String,
    args: Vec<String>,
    stdin: Option<String>,
    cwd: Option<PathBuf>,
    env: Vec<(String, String)>,
    description: Option<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Добавляет `--key=value`
    pub fn option(self, key: &str, value: impl Into<String>) -> Self {
        let value = value.into();
        self.arg(format!("--{}={}", key, value))
    }

    /// Добавляет `--key`
    pub fn flag(self, key: &str) -> Self {
        self.arg(format!("--{}", key))
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn cwd(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }

    /// Краткое описание действия для журнала аудита
    pub fn describe(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    /// Полный вектор аргументов, начиная с имени программы
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }

    /// Командная строка для журналов, с замаскированными секретами
    pub fn display(&self) -> String {
        redact(&self.argv().join(" "))
    }
}

fn secret_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"(--(?:dbpass|admin_password|password|pass|user_pass)=)\S+",
            r"(IDENTIFIED BY ')[^']*(')",
            r"(-password\s+)\S+",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("secret pattern"))
        .collect()
    })
}

/// Маскирует пароли в тексте командной строки
pub fn redact(text: &str) -> String {
    let mut out = text.to_string();
    for re in secret_patterns() {
        out = re.replace_all(&out, "${1}******${2}").into_owned();
    }
    out
}

/// Выполняет внешние команды синхронно, с журналированием и аудитом
#[derive(Debug, Clone, Default)]
pub struct CommandRunner {
    audit_log: Option<PathBuf>,
}

impl CommandRunner {
    pub fn new(audit_log: Option<PathBuf>) -> Self {
        Self { audit_log }
    }

    /// Выполняет команду и возвращает её stdout.
    ///
    /// Ненулевой код возврата превращается в ошибку, содержащую stderr.
    pub fn run(&self, spec: &CommandSpec) -> Result<String> {
        let (code, stdout, stderr) = self.execute(spec)?;

        if code != Some(0) {
            error!(
                "Команда завершилась с ошибкой (код {:?}): {}",
                code,
                stderr.trim()
            );
            return Err(anyhow!(
                "Ошибка выполнения команды `{}`: {}",
                spec.display(),
                redact(stderr.trim())
            ));
        }

        debug!("Команда успешно выполнена: {}", spec.display());
        Ok(stdout)
    }

    /// Выполняет команду и сообщает, завершилась ли она успешно
    pub fn succeeds(&self, spec: &CommandSpec) -> Result<bool> {
        let (code, _, _) = self.execute(spec)?;
        Ok(code == Some(0))
    }

    fn execute(&self, spec: &CommandSpec) -> Result<(Option<i32>, String, String)> {
        let display = spec.display();
        debug!("Выполнение команды: {}", display);

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });
        if let Some(dir) = &spec.cwd {
            command.current_dir(dir);
        }
        for (key, value) in &spec.env {
            command.env(key, value);
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("Не удалось выполнить команду: {}", display))?;

        if let (Some(input), Some(mut pipe)) = (&spec.stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes())
                .with_context(|| format!("Не удалось передать данные команде: {}", display))?;
        }

        let output = child
            .wait_with_output()
            .with_context(|| format!("Не удалось дождаться завершения команды: {}", display))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let code = output.status.code();

        if !stdout.trim().is_empty() {
            debug!("stdout: {}", redact(stdout.trim()));
        }
        if !stderr.trim().is_empty() {
            debug!("stderr: {}", redact(stderr.trim()));
        }

        if let Some(log_file) = &self.audit_log {
            let action = spec.description.as_deref().unwrap_or(spec.program.as_str());
            let details = (!stderr.trim().is_empty()).then(|| redact(stderr.trim()));
            let record = AuditRecord::new(action, &display, code, details.as_deref());
            if let Err(e) = audit::append(&record, log_file) {
                debug!("Не удалось записать аудит: {:#}", e);
            }
        }

        Ok((code, stdout, stderr))
    }
}
