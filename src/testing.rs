//! Поддельные внешние системы для модульных тестов.
//!
//! `FakeHost` хранит состояние в памяти (каталоги сайтов создаются во
//! временном каталоге), ведет журнал вызовов и умеет завершать любую
//! операцию ошибкой по запросу теста.

use std::{
    cell::RefCell,
    collections::{BTreeMap, BTreeSet, HashSet},
    fs,
    path::{Path, PathBuf},
};

use anyhow::{bail, Result};
use tempfile::TempDir;

use crate::{
    autoupdate::{PendingUpdates, Updater},
    backup::{BackupKind, SiteArchiver},
    classifier::SiteDescriptor,
    collaborators::{
        Application, DatabaseServer, InstallOptions, PoolSpec, ProcessPool, SiteRegistry,
        VhostManager, WpCredentials,
    },
    error::RegistryError,
    pipeline::{BuildContext, Host},
    registry::{SiteRegistryEntry, SiteUpdate},
};

/// Записанный в журнал вызов
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Op {
    RegistryCreate(String),
    RegistryUpdate(String),
    RegistryDelete(String),
    RenderVhost(String),
    RemoveVhost(String),
    Reload,
    ConfigurePool(String),
    RemovePool(String),
    CreateDatabase(String),
    CreateUser(String),
    Grant(String),
    DropDatabase(String),
    DropUser(String),
    Dump(String),
    Import(String),
    Install(String),
    CopyContent(String),
    WriteConfig(String),
    SearchReplace(String, String),
    CheckUpdates(String),
    ApplyUpdates(String),
    Archive(String),
    RestoreArchive(String),
}

#[derive(Default)]
struct State {
    registry: BTreeMap<String, SiteRegistryEntry>,
    hidden: BTreeSet<String>,
    vhosts: BTreeSet<String>,
    databases: BTreeSet<String>,
    users: BTreeSet<String>,
    pools: BTreeSet<String>,
    pending: BTreeMap<String, PendingUpdates>,
    journal: Vec<Op>,
    failures: HashSet<Op>,
}

pub struct FakeHost {
    dir: TempDir,
    state: RefCell<State>,
}

impl FakeHost {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("temp dir");
        fs::create_dir_all(dir.path().join("www")).expect("webroot base");
        Self {
            dir,
            state: RefCell::new(State::default()),
        }
    }

    pub fn host(&self) -> Host<'_> {
        Host {
            registry: self,
            vhost: self,
            database: self,
            pool: self,
            app: self,
        }
    }

    pub fn webroot_base(&self) -> PathBuf {
        self.dir.path().join("www")
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Следующий вызов `op` (и все последующие) завершится ошибкой
    pub fn fail_on(&self, op: Op) {
        self.state.borrow_mut().failures.insert(op);
    }

    /// `exists` будет сообщать, что домена нет, даже если запись есть
    pub fn hide_from_exists(&self, domain: &str) {
        self.state.borrow_mut().hidden.insert(domain.to_string());
    }

    pub fn insert_entry(&self, entry: SiteRegistryEntry) {
        self.state
            .borrow_mut()
            .registry
            .insert(entry.domain.clone(), entry);
    }

    pub fn replace_entry(&self, entry: SiteRegistryEntry) {
        self.insert_entry(entry);
    }

    pub fn add_database(&self, name: &str) {
        self.state.borrow_mut().databases.insert(name.to_string());
    }

    pub fn add_user(&self, user: &str) {
        self.state.borrow_mut().users.insert(user.to_string());
    }

    pub fn set_pending(&self, domain: &str, pending: PendingUpdates) {
        self.state
            .borrow_mut()
            .pending
            .insert(domain.to_string(), pending);
    }

    pub fn registry_entry(&self, domain: &str) -> Option<SiteRegistryEntry> {
        self.state.borrow().registry.get(domain).cloned()
    }

    pub fn has_vhost(&self, domain: &str) -> bool {
        self.state.borrow().vhosts.contains(domain)
    }

    pub fn has_database(&self, name: &str) -> bool {
        self.state.borrow().databases.contains(name)
    }

    pub fn has_user(&self, user: &str) -> bool {
        self.state.borrow().users.contains(user)
    }

    pub fn has_pool(&self, pool: &str) -> bool {
        self.state.borrow().pools.contains(pool)
    }

    pub fn databases(&self) -> BTreeSet<String> {
        self.state.borrow().databases.clone()
    }

    pub fn users(&self) -> BTreeSet<String> {
        self.state.borrow().users.clone()
    }

    pub fn pools(&self) -> BTreeSet<String> {
        self.state.borrow().pools.clone()
    }

    pub fn journal(&self) -> Vec<Op> {
        self.state.borrow().journal.clone()
    }

    fn call(&self, op: Op) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.journal.push(op.clone());
        if state.failures.contains(&op) {
            bail!("искусственная ошибка: {:?}", op);
        }
        Ok(())
    }
}

impl SiteRegistry for FakeHost {
    fn exists(&self, domain: &str) -> Result<bool> {
        let state = self.state.borrow();
        Ok(state.registry.contains_key(domain) && !state.hidden.contains(domain))
    }

    fn get(&self, domain: &str) -> Result<Option<SiteRegistryEntry>> {
        Ok(self.registry_entry(domain))
    }

    fn create(&self, entry: SiteRegistryEntry) -> Result<()> {
        self.call(Op::RegistryCreate(entry.domain.clone()))?;
        let mut state = self.state.borrow_mut();
        if state.registry.contains_key(&entry.domain) {
            return Err(RegistryError::AlreadyExists(entry.domain).into());
        }
        state.registry.insert(entry.domain.clone(), entry);
        Ok(())
    }

    fn update(&self, domain: &str, update: SiteUpdate) -> Result<()> {
        self.call(Op::RegistryUpdate(domain.to_string()))?;
        let mut state = self.state.borrow_mut();
        let Some(entry) = state.registry.get_mut(domain) else {
            return Err(RegistryError::NotFound(domain.to_string()).into());
        };
        if let Some(enabled) = update.enabled {
            entry.enabled = enabled;
        }
        if update.php_version.is_some() {
            entry.php_version = update.php_version;
        }
        if update.db.is_some() {
            entry.db = update.db;
        }
        Ok(())
    }

    fn delete(&self, domain: &str) -> Result<()> {
        self.call(Op::RegistryDelete(domain.to_string()))?;
        self.state.borrow_mut().registry.remove(domain);
        Ok(())
    }

    fn all(&self) -> Result<Vec<SiteRegistryEntry>> {
        Ok(self.state.borrow().registry.values().cloned().collect())
    }
}

impl VhostManager for FakeHost {
    fn render(&self, descriptor: &SiteDescriptor, ctx: &BuildContext) -> Result<()> {
        self.call(Op::RenderVhost(descriptor.domain.clone()))?;
        fs::create_dir_all(ctx.htdocs())?;
        fs::create_dir_all(ctx.webroot.join("logs"))?;
        self.state
            .borrow_mut()
            .vhosts
            .insert(descriptor.domain.clone());
        Ok(())
    }

    fn remove(&self, domain: &str) -> Result<()> {
        self.call(Op::RemoveVhost(domain.to_string()))?;
        self.state.borrow_mut().vhosts.remove(domain);
        Ok(())
    }

    fn reload(&self) -> Result<bool> {
        self.call(Op::Reload)?;
        Ok(true)
    }

    fn config_exists(&self, domain: &str) -> bool {
        self.has_vhost(domain)
    }
}

impl DatabaseServer for FakeHost {
    fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.has_database(name))
    }

    fn user_exists(&self, user: &str, _host: &str) -> Result<bool> {
        Ok(self.has_user(user))
    }

    fn create(&self, name: &str) -> Result<()> {
        self.call(Op::CreateDatabase(name.to_string()))?;
        self.state.borrow_mut().databases.insert(name.to_string());
        Ok(())
    }

    fn create_user(&self, user: &str, _host: &str, _password: &str) -> Result<()> {
        self.call(Op::CreateUser(user.to_string()))?;
        self.state.borrow_mut().users.insert(user.to_string());
        Ok(())
    }

    fn grant(&self, user: &str, _host: &str, _name: &str) -> Result<()> {
        self.call(Op::Grant(user.to_string()))
    }

    fn drop(&self, name: &str) -> Result<()> {
        self.call(Op::DropDatabase(name.to_string()))?;
        self.state.borrow_mut().databases.remove(name);
        Ok(())
    }

    fn drop_user(&self, user: &str, _host: &str) -> Result<()> {
        self.call(Op::DropUser(user.to_string()))?;
        self.state.borrow_mut().users.remove(user);
        Ok(())
    }

    fn dump(&self, name: &str, dest: &Path) -> Result<()> {
        self.call(Op::Dump(name.to_string()))?;
        fs::write(dest, format!("-- dump of {}\n", name))?;
        Ok(())
    }

    fn import(&self, name: &str, src: &Path) -> Result<()> {
        self.call(Op::Import(name.to_string()))?;
        if !src.exists() {
            bail!("файл {:?} не найден", src);
        }
        Ok(())
    }
}

impl ProcessPool for FakeHost {
    fn configure(&self, pool: &PoolSpec) -> Result<()> {
        self.call(Op::ConfigurePool(pool.pool_name.clone()))?;
        self.state.borrow_mut().pools.insert(pool.pool_name.clone());
        Ok(())
    }

    fn remove(&self, pool: &PoolSpec) -> Result<()> {
        self.call(Op::RemovePool(pool.pool_name.clone()))?;
        self.state.borrow_mut().pools.remove(&pool.pool_name);
        Ok(())
    }
}

impl Application for FakeHost {
    fn install(
        &self,
        descriptor: &SiteDescriptor,
        ctx: &BuildContext,
        options: &InstallOptions,
    ) -> Result<Option<WpCredentials>> {
        self.call(Op::Install(descriptor.domain.clone()))?;
        if options.vhost_only {
            return Ok(None);
        }
        fs::write(ctx.htdocs().join("index.php"), "<?php // wordpress")?;
        Ok(Some(WpCredentials {
            user: options.admin_user.clone().unwrap_or_else(|| "admin".to_string()),
            password: options
                .admin_password
                .clone()
                .unwrap_or_else(crate::config::generate_password),
            email: options
                .admin_email
                .clone()
                .unwrap_or_else(|| format!("admin@{}", descriptor.domain)),
        }))
    }

    fn copy_content(&self, source: &Path, ctx: &BuildContext) -> Result<()> {
        self.call(Op::CopyContent(ctx.domain.clone()))?;
        let htdocs = source.join("htdocs");
        fs::create_dir_all(ctx.htdocs())?;
        if htdocs.is_dir() {
            for entry in fs::read_dir(&htdocs)? {
                let path = entry?.path();
                if path.is_file() {
                    if let Some(name) = path.file_name() {
                        fs::copy(&path, ctx.htdocs().join(name))?;
                    }
                }
            }
        }
        Ok(())
    }

    fn write_config(&self, descriptor: &SiteDescriptor, _ctx: &BuildContext) -> Result<()> {
        self.call(Op::WriteConfig(descriptor.domain.clone()))
    }

    fn search_replace(&self, _ctx: &BuildContext, from: &str, to: &str) -> Result<()> {
        self.call(Op::SearchReplace(from.to_string(), to.to_string()))
    }
}

impl Updater for FakeHost {
    fn pending(&self, site: &SiteRegistryEntry) -> Result<PendingUpdates> {
        self.call(Op::CheckUpdates(site.domain.clone()))?;
        Ok(self
            .state
            .borrow()
            .pending
            .get(&site.domain)
            .cloned()
            .unwrap_or_default())
    }

    fn apply(&self, site: &SiteRegistryEntry, _pending: &PendingUpdates) -> Result<()> {
        self.call(Op::ApplyUpdates(site.domain.clone()))
    }
}

impl SiteArchiver for FakeHost {
    fn archive(&self, site: &SiteRegistryEntry, _kind: BackupKind, dest_root: &Path) -> Result<PathBuf> {
        self.call(Op::Archive(site.domain.clone()))?;
        let dir = dest_root.join(&site.domain);
        fs::create_dir_all(&dir)?;
        let path = dir.join("fake.tar.zst");
        fs::write(&path, "archive")?;
        Ok(path)
    }

    fn restore_in_place(&self, site: &SiteRegistryEntry, _archive: &Path) -> Result<()> {
        self.call(Op::RestoreArchive(site.domain.clone()))
    }
}
