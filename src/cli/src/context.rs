//! Everything a command needs, built from layered settings.

use anyhow::{Context as _, Result};
use std::path::PathBuf;
use std::sync::Arc;

use conveyor_core::archive::Archive;
use conveyor_core::config::Settings;
use conveyor_core::drivers::{DeadLetterDriver, Driver};
use conveyor_core::jobs::{register_builtin, BuiltinServices, JobRegistry, Scheduler};
use conveyor_core::manager::QueueManager;

/// Settings sources shared by every subcommand.
#[derive(Debug, Clone, Default)]
pub struct SettingsSources {
    pub file: Option<PathBuf>,
    pub overlay: Option<PathBuf>,
}

impl SettingsSources {
    pub fn load(&self) -> Result<Settings> {
        Settings::load_layered(self.file.as_deref(), self.overlay.as_deref()).with_context(|| {
            match &self.overlay {
                Some(path) => format!("Failed to load settings (overlay {})", path.display()),
                None => "Failed to load settings".to_string(),
            }
        })
    }
}

/// Open connections plus the job types this binary knows how to run.
pub struct Runtime {
    pub settings: Settings,
    pub manager: Arc<QueueManager>,
    pub archive: Option<Arc<dyn Archive>>,
    /// Lookup copy of the registry held by the tagged serializer
    pub registry: JobRegistry,
}

fn build_registry(services: &BuiltinServices) -> Result<JobRegistry> {
    let mut registry = JobRegistry::new();
    register_builtin(&mut registry, services)?;
    Ok(registry)
}

impl Runtime {
    pub async fn open(settings: Settings) -> Result<Self> {
        let archive = settings.build_archive().await?;
        let mut services = BuiltinServices::new();
        if let Some(archive) = &archive {
            services = services.with_archive(archive.clone());
        }

        let manager = Arc::new(
            settings
                .build_manager(build_registry(&services)?)
                .await
                .context("Failed to open queue connections")?,
        );
        services.bind_manager(&manager);

        Ok(Self {
            registry: build_registry(&services)?,
            settings,
            manager,
            archive,
        })
    }

    pub fn driver(&self, connection: Option<&str>) -> Result<Arc<dyn Driver>> {
        Ok(self.manager.connection(connection)?)
    }

    pub async fn scheduler(&self) -> Result<Scheduler> {
        let store = self.settings.build_schedule_store().await?;
        Ok(Scheduler::new(store, self.manager.clone()))
    }
}

/// The dead-letter store of `driver`, or an error naming the driver.
pub fn dead_letters(driver: &dyn Driver) -> Result<&dyn DeadLetterDriver> {
    driver
        .as_dead_letter()
        .with_context(|| format!("Driver '{}' has no dead-letter store", driver.name()))
}
