//! Once-only, on-demand construction of the shared translation service

use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{error, info};

use crate::core::errors::{Result, TranslationError};

type Loader<T> = Arc<dyn Fn() -> Result<Arc<T>> + Send + Sync>;

/// Holds the process-wide service and builds it on first use.
///
/// Concurrent first callers wait on the same construction; the loader runs on a
/// blocking thread so model loading never stalls the async runtime. Construction is
/// driven by its own task, so a caller that gives up mid-load does not abandon it.
/// A failed load leaves the cell empty, so the next caller tries again.
pub struct ServiceCell<T: ?Sized> {
    cell: Arc<OnceCell<Arc<T>>>,
    loader: Loader<T>,
}

impl<T: ?Sized + Send + Sync + 'static> ServiceCell<T> {
    /// Cell that builds the service with `loader` on first access
    pub fn new<F>(loader: F) -> Self
    where
        F: Fn() -> Result<Arc<T>> + Send + Sync + 'static,
    {
        Self {
            cell: Arc::new(OnceCell::new()),
            loader: Arc::new(loader),
        }
    }

    /// Cell around a service that is already built
    pub fn ready(service: Arc<T>) -> Self {
        let shared = service.clone();
        Self {
            cell: Arc::new(OnceCell::new_with(Some(service))),
            loader: Arc::new(move || Ok(shared.clone())),
        }
    }

    /// Shared instance, constructing it if nobody has yet
    pub async fn get(&self) -> Result<Arc<T>> {
        if let Some(service) = self.cell.get() {
            return Ok(service.clone());
        }

        let cell = self.cell.clone();
        let loader = self.loader.clone();

        tokio::spawn(async move {
            cell.get_or_try_init(|| async move {
                info!("Constructing translation service");

                let service = tokio::task::spawn_blocking(move || loader())
                    .await
                    .map_err(|e| {
                        TranslationError::InternalError(format!("service construction panicked: {}", e))
                    })?
                    .map_err(|e| {
                        error!("Translation service construction failed: {}", e);
                        e
                    })?;

                info!("Translation service constructed");
                Ok::<_, TranslationError>(service)
            })
            .await
            .cloned()
        })
        .await
        .map_err(|e| TranslationError::InternalError(format!("service construction task failed: {}", e)))?
    }

    /// Whether construction has completed
    pub fn is_initialized(&self) -> bool {
        self.cell.initialized()
    }
}
