use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{info, warn};

use crate::error::EngineError;

use super::{CarriedState, ChunkOutput, Conditioning, GenerationEngine, SamplingObserver};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Cold,
    Warm,
    Disposed,
}

struct Inner {
    engine: Arc<dyn GenerationEngine>,
    state: Mutex<EngineState>,
}

impl Inner {
    fn state(&self) -> EngineState {
        match self.state.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn set_state(&self, next: EngineState) {
        match self.state.lock() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }
}

/// Process-wide handle to the single warmed engine. Clones share the engine
/// and its weight-1 guard, so at most one lease exists at a time.
#[derive(Clone)]
pub struct EngineHandle {
    inner: Arc<Inner>,
    guard: Arc<Semaphore>,
}

impl EngineHandle {
    pub fn new(engine: Arc<dyn GenerationEngine>) -> Self {
        Self {
            inner: Arc::new(Inner {
                engine,
                state: Mutex::new(EngineState::Cold),
            }),
            guard: Arc::new(Semaphore::new(1)),
        }
    }

    pub fn state(&self) -> EngineState {
        self.inner.state()
    }

    /// True when no lease is outstanding.
    pub fn is_idle(&self) -> bool {
        self.guard.available_permits() == 1
    }

    /// Warms the engine ahead of the first job.
    pub async fn init(&self) -> Result<(), EngineError> {
        let lease = self.acquire().await?;
        lease.ensure_warm().await.map(|_| ())
    }

    /// Waits for exclusive use of the engine.
    pub async fn acquire(&self) -> Result<EngineLease, EngineError> {
        if self.inner.state() == EngineState::Disposed {
            return Err(EngineError::Disposed);
        }
        let permit = Arc::clone(&self.guard)
            .acquire_owned()
            .await
            .map_err(|_| EngineError::Disposed)?;
        if self.inner.state() == EngineState::Disposed {
            return Err(EngineError::Disposed);
        }
        Ok(EngineLease {
            _permit: permit,
            inner: Arc::clone(&self.inner),
        })
    }

    /// Waits for any in-flight lease, releases the engine and refuses further
    /// leases. Idempotent.
    pub async fn dispose(&self) -> Result<(), EngineError> {
        let permit = match Arc::clone(&self.guard).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return Ok(()),
        };
        let was = self.inner.state();
        self.inner.set_state(EngineState::Disposed);
        self.guard.close();
        drop(permit);

        if was == EngineState::Warm {
            info!("Disposing generation engine");
            if let Err(e) = self.inner.engine.dispose().await {
                warn!("Engine dispose reported an error: {}", e);
                return Err(e);
            }
        }
        Ok(())
    }
}

/// Exclusive access to the engine for the duration of a job's warmup and
/// generation. Dropping the lease releases the guard.
pub struct EngineLease {
    _permit: OwnedSemaphorePermit,
    inner: Arc<Inner>,
}

impl EngineLease {
    /// Loads the engine if it is cold. Returns `true` when a load happened.
    pub async fn ensure_warm(&self) -> Result<bool, EngineError> {
        match self.inner.state() {
            EngineState::Warm => Ok(false),
            EngineState::Disposed => Err(EngineError::Disposed),
            EngineState::Cold => {
                info!("Warming generation engine");
                self.inner.engine.warmup().await?;
                self.inner.set_state(EngineState::Warm);
                Ok(true)
            }
        }
    }

    pub async fn generate_chunk(
        &self,
        conditioning: &Conditioning,
        carried: Option<&CarriedState>,
        observer: &dyn SamplingObserver,
    ) -> Result<ChunkOutput, EngineError> {
        self.ensure_warm().await?;
        self.inner
            .engine
            .generate_chunk(conditioning, carried, observer)
            .await
    }
}
