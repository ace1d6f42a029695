use std::time::{Duration, Instant};

use crate::{GIB, MIB, MemoryTelemetry, ResourceError};

/// A loaded model that can be told to let go of its memory.
pub trait ModelHandle {
    /// Drop every reference to the model. Must not return before the owner
    /// (thread, process) has actually stopped.
    fn release(self) -> impl Future<Output = Result<(), ResourceError>>;
}

#[derive(Debug, Clone)]
pub struct ResourcePolicy {
    /// Memory kept free on top of a model's estimate.
    pub headroom_bytes: u64,
    /// Fail instead of continuing when no accelerator is detected.
    pub require_accelerator: bool,
    /// How far above the pre-load baseline usage may stay after cleanup.
    pub reclaim_tolerance_bytes: u64,
    pub poll_interval: Duration,
    pub cleanup_timeout: Duration,
}

impl Default for ResourcePolicy {
    fn default() -> Self {
        Self {
            headroom_bytes: GIB / 2,
            require_accelerator: false,
            reclaim_tolerance_bytes: 256 * MIB,
            poll_interval: Duration::from_millis(250),
            cleanup_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotRequest {
    pub name: String,
    pub estimate_bytes: u64,
}

impl SlotRequest {
    pub fn new(name: impl Into<String>, estimate_bytes: u64) -> Self {
        Self {
            name: name.into(),
            estimate_bytes,
        }
    }
}

/// The one model resident in the memory budget.
#[derive(Debug)]
pub struct ResourceSlot<H> {
    name: String,
    estimate_bytes: u64,
    baseline_used: Option<u64>,
    handle: H,
}

impl<H> ResourceSlot<H> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn estimate_bytes(&self) -> u64 {
        self.estimate_bytes
    }

    pub const fn handle(&self) -> &H {
        &self.handle
    }

    pub const fn handle_mut(&mut self) -> &mut H {
        &mut self.handle
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    pub name: String,
    /// `false` when there was no telemetry to confirm against.
    pub confirmed: bool,
    pub waited: Duration,
}

pub struct ResourceManager<T> {
    telemetry: T,
    policy: ResourcePolicy,
    occupant: Option<String>,
}

impl<T: MemoryTelemetry> ResourceManager<T> {
    pub const fn new(telemetry: T, policy: ResourcePolicy) -> Self {
        Self {
            telemetry,
            policy,
            occupant: None,
        }
    }

    pub fn occupant(&self) -> Option<&str> {
        self.occupant.as_deref()
    }

    /// Free accelerator memory minus the configured headroom, or `None` on a
    /// host without an accelerator.
    ///
    /// # Errors
    /// Returns `ResourceError::Telemetry` if the reading fails.
    pub async fn estimate_available(&self) -> Result<Option<u64>, ResourceError> {
        let snapshot = self.telemetry.snapshot().await?;
        Ok(snapshot.map(|s| s.free_bytes.saturating_sub(self.policy.headroom_bytes)))
    }

    /// Pre-flight check run before a model is instantiated.
    ///
    /// # Errors
    /// `InsufficientResource` when the estimate does not fit,
    /// `NoAccelerator` when none is present and the policy requires one.
    pub async fn ensure_available(
        &self,
        request: &SlotRequest,
    ) -> Result<(), ResourceError> {
        match self.estimate_available().await? {
            Some(available) if available < request.estimate_bytes => {
                Err(ResourceError::InsufficientResource {
                    name: request.name.clone(),
                    required: request.estimate_bytes,
                    available,
                })
            }
            Some(available) => {
                tracing::info!(
                    model = %request.name,
                    required_bytes = request.estimate_bytes,
                    available_bytes = available,
                    "memory pre-flight passed"
                );
                Ok(())
            }
            None if self.policy.require_accelerator => {
                Err(ResourceError::NoAccelerator)
            }
            None => {
                tracing::warn!(
                    model = %request.name,
                    "no accelerator telemetry, skipping memory pre-flight"
                );
                Ok(())
            }
        }
    }

    /// Admit a model into the slot: pre-flight, record the baseline, load.
    ///
    /// # Errors
    /// `SlotOccupied` if a model is already resident, any pre-flight error,
    /// or whatever `load` returns.
    pub async fn acquire<H, E, L>(
        &mut self,
        request: SlotRequest,
        load: L,
    ) -> Result<ResourceSlot<H>, E>
    where
        E: From<ResourceError>,
        L: AsyncFnOnce() -> Result<H, E>,
    {
        if let Some(occupant) = &self.occupant {
            return Err(ResourceError::SlotOccupied {
                occupant: occupant.clone(),
                requested: request.name,
            }
            .into());
        }

        self.ensure_available(&request).await?;

        let baseline_used = self
            .telemetry
            .snapshot()
            .await?
            .map(|snapshot| snapshot.used_bytes);

        let handle = load().await?;

        tracing::info!(model = %request.name, "model slot acquired");
        self.occupant = Some(request.name.clone());

        Ok(ResourceSlot {
            name: request.name,
            estimate_bytes: request.estimate_bytes,
            baseline_used,
            handle,
        })
    }

    /// Release the model and block until telemetry shows its memory is back.
    ///
    /// # Errors
    /// `Release` if the handle fails to shut down, `CleanupTimeout` if usage
    /// does not return to the pre-load baseline in time.
    ///
    /// The slot is vacated even on error, since the handle is consumed either
    /// way. Memory that was not reclaimed is still seen by the pre-flight
    /// check of the next `acquire`, which refuses a model that no longer fits.
    pub async fn force_cleanup<H: ModelHandle>(
        &mut self,
        slot: ResourceSlot<H>,
    ) -> Result<CleanupReport, ResourceError> {
        let ResourceSlot {
            name,
            baseline_used,
            handle,
            ..
        } = slot;
        self.occupant = None;

        let started = Instant::now();
        handle.release().await?;

        let confirmed = match baseline_used {
            Some(baseline) => {
                self.wait_until_reclaimed(&name, baseline, started).await?;
                true
            }
            None => false,
        };

        let report = CleanupReport {
            name,
            confirmed,
            waited: started.elapsed(),
        };
        tracing::info!(
            model = %report.name,
            confirmed = report.confirmed,
            waited_ms = u64::try_from(report.waited.as_millis()).unwrap_or(u64::MAX),
            "model slot released"
        );
        Ok(report)
    }

    async fn wait_until_reclaimed(
        &self,
        name: &str,
        baseline: u64,
        started: Instant,
    ) -> Result<(), ResourceError> {
        let ceiling = baseline.saturating_add(self.policy.reclaim_tolerance_bytes);
        loop {
            let used = match self.telemetry.snapshot().await? {
                Some(snapshot) => snapshot.used_bytes,
                // the device disappeared; nothing left to hold memory
                None => return Ok(()),
            };

            if used <= ceiling {
                return Ok(());
            }

            if started.elapsed() >= self.policy.cleanup_timeout {
                return Err(ResourceError::CleanupTimeout {
                    name: name.to_string(),
                    timeout: self.policy.cleanup_timeout,
                    used,
                    baseline,
                });
            }

            tracing::debug!(model = name, used_bytes = used, "waiting for memory reclaim");
            tokio::time::sleep(self.policy.poll_interval).await;
        }
    }

    /// Run `body` with a freshly loaded model and always force the cleanup
    /// afterwards, whether `body` succeeded, failed or returned early.
    ///
    /// An error from `body` wins over a cleanup error; the cleanup error is
    /// logged in that case.
    ///
    /// # Errors
    /// Any error from acquisition, `body` or cleanup.
    pub async fn scoped<H, R, E, L, B>(
        &mut self,
        request: SlotRequest,
        load: L,
        body: B,
    ) -> Result<R, E>
    where
        H: ModelHandle,
        E: From<ResourceError>,
        L: AsyncFnOnce() -> Result<H, E>,
        B: AsyncFnOnce(&mut H) -> Result<R, E>,
    {
        let mut slot = self.acquire(request, load).await?;
        let result = body(&mut slot.handle).await;
        let cleanup = self.force_cleanup(slot).await;

        match (result, cleanup) {
            (Ok(value), Ok(_)) => Ok(value),
            (Ok(_), Err(cleanup_err)) => Err(cleanup_err.into()),
            (Err(err), Ok(_)) => Err(err),
            (Err(err), Err(cleanup_err)) => {
                tracing::error!("cleanup after failed model use also failed: {cleanup_err}");
                Err(err)
            }
        }
    }
}
