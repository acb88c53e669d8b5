//! Async front of the blocking translation service
//!
//! Inference is CPU/GPU bound, so every request runs on a blocking worker thread
//! while the async runtime keeps serving. Each direction owns a semaphore with one
//! permit per model replica; requests beyond that wait in the semaphore queue.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::core::config::TranslatorConfig;
use crate::core::errors::{Result, TranslationError};
use crate::core::generation::GenerationBudget;
use crate::core::lazy::ServiceCell;
use crate::core::models::{Direction, TranslationRequest};
use crate::core::service::{Translate, TranslationService};

/// Shared handle to a lazily constructed translation backend
pub type SharedService = Arc<ServiceCell<dyn Translate>>;

/// Async translator with a bounded blocking worker pool
#[derive(Clone)]
pub struct AsyncTranslator {
    service: SharedService,
    russian_slots: Arc<Semaphore>,
    nanai_slots: Arc<Semaphore>,
    timeout: Option<Duration>,
}

impl AsyncTranslator {
    /// Create a new async translator over any backend
    pub fn new(service: SharedService, workers_per_direction: usize, timeout: Option<Duration>) -> Self {
        let workers = workers_per_direction.max(1);
        Self {
            service,
            russian_slots: Arc::new(Semaphore::new(workers)),
            nanai_slots: Arc::new(Semaphore::new(workers)),
            timeout,
        }
    }

    /// Create a translator whose service is built from `config` on first use
    pub fn from_config(config: TranslatorConfig) -> Result<Self> {
        config.validate()?;

        let workers = config.workers_per_direction;
        let timeout = config.generation_timeout();
        let config = Arc::new(config);

        let service: SharedService = Arc::new(ServiceCell::new(move || {
            let service = TranslationService::construct(&config)?;
            Ok(Arc::new(service) as Arc<dyn Translate>)
        }));

        Ok(Self::new(service, workers, timeout))
    }

    /// Create from environment
    pub fn from_env() -> Result<Self> {
        let config = TranslatorConfig::from_env()?;
        Self::from_config(config)
    }

    /// Construct the service now instead of on the first request
    pub async fn warm_up(&self) -> Result<()> {
        self.service.get().await.map(|_| ())
    }

    /// Whether the models are loaded
    pub fn is_ready(&self) -> bool {
        self.service.is_initialized()
    }

    /// Idle worker slots for a direction
    pub fn available_slots(&self, direction: Direction) -> usize {
        self.slots(direction).available_permits()
    }

    fn slots(&self, direction: Direction) -> &Arc<Semaphore> {
        match direction {
            Direction::Russian => &self.russian_slots,
            Direction::Nanai => &self.nanai_slots,
        }
    }

    /// Translate a single request.
    ///
    /// Dropping the returned future (for example when the HTTP client disconnects)
    /// cancels the generation at its next decoding step.
    pub async fn translate(&self, request: TranslationRequest) -> Result<String> {
        request.validate()?;

        let service = self.service.get().await?;
        let semaphore = self.slots(request.direction).clone();

        let budget = GenerationBudget::with_timeout(self.timeout);
        let _cancel = budget.cancel_on_drop();
        let worker_budget = budget.clone();
        let direction = request.direction;
        let queued_at = Instant::now();

        let work = async move {
            let permit = semaphore
                .acquire_owned()
                .await
                .map_err(|_| TranslationError::InternalError("worker pool closed".to_string()))?;
            debug!("Worker acquired for {} after {:?}", direction, queued_at.elapsed());

            tokio::task::spawn_blocking(move || {
                let _permit = permit;
                service.translate(&request, &worker_budget)
            })
            .await
            .map_err(|e| TranslationError::InternalError(format!("translation worker failed: {}", e)))?
        };

        match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, work).await {
                Ok(result) => result,
                Err(_) => {
                    warn!("Translation to {} exceeded {:?}", direction, limit);
                    Err(TranslationError::TimeoutError)
                }
            },
            None => work.await,
        }
    }

    /// Batch translate multiple requests.
    ///
    /// Requests run concurrently, bounded by the per-direction worker slots; results
    /// come back in request order.
    pub async fn translate_batch(&self, requests: Vec<TranslationRequest>) -> Vec<Result<String>> {
        self.translate_batch_with(requests, |_, _| {}).await
    }

    /// Same as [`AsyncTranslator::translate_batch`], calling `on_done` with the
    /// request index as each translation finishes
    pub async fn translate_batch_with<F>(
        &self,
        requests: Vec<TranslationRequest>,
        mut on_done: F,
    ) -> Vec<Result<String>>
    where
        F: FnMut(usize, &Result<String>),
    {
        let mut results: Vec<Option<Result<String>>> = (0..requests.len()).map(|_| None).collect();
        let mut tasks = JoinSet::new();

        for (index, request) in requests.into_iter().enumerate() {
            let translator = self.clone();
            tasks.spawn(async move { (index, translator.translate(request).await) });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, result)) => {
                    on_done(index, &result);
                    results[index] = Some(result);
                }
                Err(e) => warn!("Batch translation task failed: {}", e),
            }
        }

        results
            .into_iter()
            .map(|result| {
                result.unwrap_or_else(|| {
                    Err(TranslationError::InternalError("batch translation task failed".to_string()))
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Echoes the text upper-cased, tracking how many calls overlap
    struct Echo {
        delay: Duration,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
    }

    impl Echo {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl Translate for Echo {
        fn translate(&self, request: &TranslationRequest, _budget: &GenerationBudget) -> Result<String> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(request.text.to_uppercase())
        }
    }

    /// Spins until its budget runs out, remembering that it noticed
    struct Stalling {
        stopped: Arc<AtomicBool>,
    }

    impl Translate for Stalling {
        fn translate(&self, _request: &TranslationRequest, budget: &GenerationBudget) -> Result<String> {
            loop {
                if let Err(e) = budget.check() {
                    self.stopped.store(true, Ordering::SeqCst);
                    return Err(e);
                }
                std::thread::sleep(Duration::from_millis(5));
            }
        }
    }

    fn translator(service: Arc<dyn Translate>, workers: usize, timeout: Option<Duration>) -> AsyncTranslator {
        AsyncTranslator::new(Arc::new(ServiceCell::ready(service)), workers, timeout)
    }

    #[tokio::test]
    async fn test_translate_runs_on_worker() {
        let echo = Echo::new(Duration::ZERO);
        let translator = translator(echo.clone(), 1, None);

        let result = translator
            .translate(TranslationRequest::new("сэвэн", Direction::Russian))
            .await
            .unwrap();

        assert_eq!(result, "СЭВЭН");
        assert_eq!(echo.calls.load(Ordering::SeqCst), 1);
        assert_eq!(translator.available_slots(Direction::Russian), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_requests_queue_when_workers_are_busy() {
        let echo = Echo::new(Duration::from_millis(30));
        let translator = translator(echo.clone(), 1, None);

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let translator = translator.clone();
                tokio::spawn(async move {
                    translator
                        .translate(TranslationRequest::new(format!("text {}", i), Direction::Nanai))
                        .await
                })
            })
            .collect();

        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }

        assert_eq!(echo.calls.load(Ordering::SeqCst), 4);
        assert_eq!(echo.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_directions_do_not_share_slots() {
        let echo = Echo::new(Duration::from_millis(50));
        let translator = translator(echo.clone(), 1, None);

        let (a, b) = tokio::join!(
            translator.translate(TranslationRequest::new("a", Direction::Russian)),
            translator.translate(TranslationRequest::new("b", Direction::Nanai)),
        );

        assert!(a.is_ok() && b.is_ok());
        assert_eq!(echo.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_generation_timeout() {
        let stopped = Arc::new(AtomicBool::new(false));
        let translator = translator(
            Arc::new(Stalling {
                stopped: stopped.clone(),
            }),
            1,
            Some(Duration::from_millis(50)),
        );

        let result = translator
            .translate(TranslationRequest::new("долгий текст", Direction::Nanai))
            .await;
        assert!(matches!(result, Err(TranslationError::TimeoutError)));

        for _ in 0..100 {
            if stopped.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_dropped_request_cancels_generation() {
        let stopped = Arc::new(AtomicBool::new(false));
        let translator = translator(
            Arc::new(Stalling {
                stopped: stopped.clone(),
            }),
            1,
            None,
        );

        let task = tokio::spawn(async move {
            translator
                .translate(TranslationRequest::new("текст", Direction::Russian))
                .await
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        task.abort();

        for _ in 0..100 {
            if stopped.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_invalid_input_does_not_load_service() {
        let loads = Arc::new(AtomicUsize::new(0));
        let counter = loads.clone();
        let cell: SharedService = Arc::new(ServiceCell::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Echo::new(Duration::ZERO) as Arc<dyn Translate>)
        }));
        let translator = AsyncTranslator::new(cell, 1, None);

        let result = translator.translate(TranslationRequest::new("", Direction::Russian)).await;

        assert!(matches!(result, Err(TranslationError::InvalidInput { .. })));
        assert!(!translator.is_ready());
        assert_eq!(loads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_batch_runs_on_all_workers() {
        let echo = Echo::new(Duration::from_millis(50));
        let translator = translator(echo.clone(), 2, None);

        let mut finished = Vec::new();
        let results = translator
            .translate_batch_with(
                (0..4)
                    .map(|i| TranslationRequest::new(format!("строка {}", i), Direction::Nanai))
                    .collect(),
                |index, result| {
                    assert!(result.is_ok());
                    finished.push(index);
                },
            )
            .await;

        assert_eq!(echo.peak.load(Ordering::SeqCst), 2);
        assert_eq!(echo.calls.load(Ordering::SeqCst), 4);
        finished.sort_unstable();
        assert_eq!(finished, vec![0, 1, 2, 3]);
        for (i, result) in results.iter().enumerate() {
            assert_eq!(result.as_ref().unwrap(), &format!("СТРОКА {}", i));
        }
    }

    #[tokio::test]
    async fn test_batch_keeps_order_and_failures() {
        let translator = translator(Echo::new(Duration::ZERO), 2, None);

        let results = translator
            .translate_batch(vec![
                TranslationRequest::new("один", Direction::Nanai),
                TranslationRequest::new(" ", Direction::Nanai),
                TranslationRequest::new("два", Direction::Nanai),
            ])
            .await;

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].as_ref().unwrap(), "ОДИН");
        assert!(results[1].is_err());
        assert_eq!(results[2].as_ref().unwrap(), "ДВА");
    }
}
