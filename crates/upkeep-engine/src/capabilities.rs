//! Typed seams for every collaborator the engine consults during an attempt.
//!
//! Each capability has exactly one job and a no-op implementation that stands in
//! when nothing is configured. Calls go through [`call_bounded`] so a hung
//! implementation can never stall an attempt past its deadline.

use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use tracing::warn;
use upkeep_core::UpgradeManifest;

/// Cooperative cancellation flag shared between the engine and one callback.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Passed to every external call. Implementations that do slow work should
/// poll [`CallContext::should_stop`].
#[derive(Debug, Clone)]
pub struct CallContext {
    pub deadline: Instant,
    pub cancel: CancelToken,
}

impl CallContext {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Instant::now() + timeout,
            cancel: CancelToken::new(),
        }
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn should_stop(&self) -> bool {
        self.cancel.is_cancelled() || Instant::now() >= self.deadline
    }
}

pub trait Approver: Send + Sync {
    fn approve(&self, artifact: &Path, ctx: &CallContext) -> Result<bool>;
}

/// System-wide mutual exclusion. `release` is only called after a successful
/// `try_acquire` for the same identifier.
pub trait Locker: Send + Sync {
    fn try_acquire(&self, lock_id: &str, ctx: &CallContext) -> Result<bool>;
    fn release(&self, lock_id: &str) -> Result<()>;
}

pub trait SignatureCheck: Send + Sync {
    fn verify(&self, artifact: &Path, ctx: &CallContext) -> Result<bool>;
}

pub trait ManifestCheck: Send + Sync {
    fn check(&self, manifest: &UpgradeManifest, ctx: &CallContext) -> Result<bool>;
}

pub trait HealthProbe: Send + Sync {
    fn probe(&self, ctx: &CallContext) -> Result<bool>;
}

/// Informational hooks around the destructive part of an attempt.
pub trait UpgradeHooks: Send + Sync {
    fn before_upgrade(&self, artifact: &Path) -> Result<()>;
    fn after_upgrade(&self, artifact: &Path, installed: bool) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AutoApprove;

impl Approver for AutoApprove {
    fn approve(&self, _artifact: &Path, _ctx: &CallContext) -> Result<bool> {
        Ok(true)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoLock;

impl Locker for NoLock {
    fn try_acquire(&self, _lock_id: &str, _ctx: &CallContext) -> Result<bool> {
        Ok(true)
    }

    fn release(&self, _lock_id: &str) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SkipSignature;

impl SignatureCheck for SkipSignature {
    fn verify(&self, _artifact: &Path, _ctx: &CallContext) -> Result<bool> {
        Ok(true)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptManifest;

impl ManifestCheck for AcceptManifest {
    fn check(&self, _manifest: &UpgradeManifest, _ctx: &CallContext) -> Result<bool> {
        Ok(true)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoHealthProbe;

impl HealthProbe for NoHealthProbe {
    fn probe(&self, _ctx: &CallContext) -> Result<bool> {
        Ok(true)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoHooks;

impl UpgradeHooks for NoHooks {
    fn before_upgrade(&self, _artifact: &Path) -> Result<()> {
        Ok(())
    }

    fn after_upgrade(&self, _artifact: &Path, _installed: bool) -> Result<()> {
        Ok(())
    }
}

/// Closures are handy for wiring one-off policies and for tests.
impl<F> Approver for F
where
    F: Fn(&Path) -> bool + Send + Sync,
{
    fn approve(&self, artifact: &Path, _ctx: &CallContext) -> Result<bool> {
        Ok(self(artifact))
    }
}

impl<F> HealthProbe for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn probe(&self, _ctx: &CallContext) -> Result<bool> {
        Ok(self())
    }
}

/// The full set of collaborators handed to the engine.
#[derive(Clone)]
pub struct Capabilities {
    pub approver: Arc<dyn Approver>,
    pub locker: Arc<dyn Locker>,
    pub signature: Arc<dyn SignatureCheck>,
    pub manifest: Arc<dyn ManifestCheck>,
    pub health: Arc<dyn HealthProbe>,
    pub hooks: Arc<dyn UpgradeHooks>,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            approver: Arc::new(AutoApprove),
            locker: Arc::new(NoLock),
            signature: Arc::new(SkipSignature),
            manifest: Arc::new(AcceptManifest),
            health: Arc::new(NoHealthProbe),
            hooks: Arc::new(NoHooks),
        }
    }
}

impl Capabilities {
    pub fn with_approver(mut self, approver: impl Approver + 'static) -> Self {
        self.approver = Arc::new(approver);
        self
    }

    pub fn with_locker(mut self, locker: impl Locker + 'static) -> Self {
        self.locker = Arc::new(locker);
        self
    }

    pub fn with_signature(mut self, signature: impl SignatureCheck + 'static) -> Self {
        self.signature = Arc::new(signature);
        self
    }

    pub fn with_manifest(mut self, manifest: impl ManifestCheck + 'static) -> Self {
        self.manifest = Arc::new(manifest);
        self
    }

    pub fn with_health(mut self, health: impl HealthProbe + 'static) -> Self {
        self.health = Arc::new(health);
        self
    }

    pub fn with_hooks(mut self, hooks: impl UpgradeHooks + 'static) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }
}

/// Runs `call` on a helper thread and waits at most `timeout` for its answer.
///
/// On timeout the context is cancelled and the thread is abandoned; the caller
/// gets an error and moves on. Panics inside the callback become errors.
pub fn call_bounded<T, F>(label: &str, timeout: Duration, call: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&CallContext) -> Result<T> + Send + 'static,
{
    run_bounded(label, timeout, call, None)
}

/// Like [`call_bounded`], but a successful answer that arrives after the
/// deadline is handed to `on_late` on a reaper thread instead of being lost.
///
/// Callbacks that claim a resource use this so the claim can be undone.
pub fn call_bounded_with_late<T, F, L>(
    label: &str,
    timeout: Duration,
    call: F,
    on_late: L,
) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&CallContext) -> Result<T> + Send + 'static,
    L: FnOnce(T) + Send + 'static,
{
    run_bounded(label, timeout, call, Some(Box::new(on_late)))
}

type LateAnswer<T> = Box<dyn FnOnce(T) + Send>;

fn run_bounded<T, F>(
    label: &str,
    timeout: Duration,
    call: F,
    on_late: Option<LateAnswer<T>>,
) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&CallContext) -> Result<T> + Send + 'static,
{
    let ctx = CallContext::with_timeout(timeout);
    let worker_ctx = ctx.clone();
    let (sender, receiver) = mpsc::channel();
    thread::Builder::new()
        .name(format!("upkeep-{label}"))
        .spawn(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(|| call(&worker_ctx)));
            let _ = sender.send(result);
        })
        .with_context(|| format!("failed to spawn {label} callback thread"))?;

    match receiver.recv_timeout(timeout) {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(anyhow!("{label} callback panicked")),
        Err(mpsc::RecvTimeoutError::Timeout) => {
            ctx.cancel.cancel();
            if let Some(on_late) = on_late {
                let reaper = thread::Builder::new()
                    .name(format!("upkeep-{label}-reaper"))
                    .spawn(move || {
                        if let Ok(Ok(Ok(value))) = receiver.recv() {
                            on_late(value);
                        }
                    });
                if let Err(err) = reaper {
                    warn!(label, error = %err, "failed to spawn reaper for late callback answer");
                }
            }
            Err(anyhow!(
                "{label} callback did not answer within {}s",
                timeout.as_secs_f64()
            ))
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => {
            Err(anyhow!("{label} callback exited without an answer"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_bounded_returns_callback_answer() {
        let answer = call_bounded("probe", Duration::from_secs(5), |_| Ok(41 + 1))
            .expect("callback must answer");
        assert_eq!(answer, 42);
    }

    #[test]
    fn call_bounded_propagates_callback_error() {
        let err = call_bounded::<bool, _>("probe", Duration::from_secs(5), |_| {
            Err(anyhow!("probe endpoint refused connection"))
        })
        .expect_err("error must propagate");
        assert!(err.to_string().contains("refused connection"));
    }

    #[test]
    fn call_bounded_times_out_and_cancels_hung_callback() {
        let (observed_sender, observed_receiver) = mpsc::channel();
        let err = call_bounded("lock", Duration::from_millis(50), move |ctx| {
            let ctx = ctx.clone();
            while !ctx.cancel.is_cancelled() {
                thread::sleep(Duration::from_millis(5));
            }
            let _ = observed_sender.send(true);
            Ok(true)
        })
        .expect_err("hung callback must time out");

        assert!(err.to_string().contains("did not answer"));
        assert!(observed_receiver
            .recv_timeout(Duration::from_secs(5))
            .expect("callback must observe cancellation"));
    }

    #[test]
    fn late_answer_is_handed_to_reaper() {
        let (late_sender, late_receiver) = mpsc::channel();
        let err = call_bounded_with_late(
            "lock",
            Duration::from_millis(20),
            |_| {
                thread::sleep(Duration::from_millis(150));
                Ok(7)
            },
            move |value| {
                let _ = late_sender.send(value);
            },
        )
        .expect_err("slow callback must time out");

        assert!(err.to_string().contains("did not answer"));
        let late = late_receiver
            .recv_timeout(Duration::from_secs(5))
            .expect("late answer must reach the reaper");
        assert_eq!(late, 7);
    }

    #[test]
    fn late_error_is_not_handed_to_reaper() {
        let (late_sender, late_receiver) = mpsc::channel::<u8>();
        call_bounded_with_late(
            "lock",
            Duration::from_millis(20),
            |_| -> Result<u8> {
                thread::sleep(Duration::from_millis(100));
                Err(anyhow!("lock service unreachable"))
            },
            move |value| {
                let _ = late_sender.send(value);
            },
        )
        .expect_err("slow callback must time out");

        assert!(late_receiver.recv_timeout(Duration::from_millis(500)).is_err());
    }

    #[test]
    fn call_bounded_converts_panic_into_error() {
        let err = call_bounded::<bool, _>("health", Duration::from_secs(5), |_| {
            panic!("probe blew up")
        })
        .expect_err("panic must become an error");
        assert!(err.to_string().contains("panicked"));
    }

    #[test]
    fn call_context_reports_expired_deadline() {
        let ctx = CallContext::with_timeout(Duration::ZERO);
        assert!(ctx.should_stop());
        assert_eq!(ctx.remaining(), Duration::ZERO);
    }

    #[test]
    fn default_capabilities_pass_every_gate() {
        let capabilities = Capabilities::default();
        let ctx = CallContext::with_timeout(Duration::from_secs(1));
        let artifact = Path::new("update.zip");
        assert!(capabilities.approver.approve(artifact, &ctx).expect("approve"));
        assert!(capabilities.locker.try_acquire("upgrade", &ctx).expect("lock"));
        assert!(capabilities.signature.verify(artifact, &ctx).expect("signature"));
        assert!(capabilities.health.probe(&ctx).expect("health"));
    }

    #[test]
    fn closures_act_as_approver_and_probe() {
        let ctx = CallContext::with_timeout(Duration::from_secs(1));
        let approver = |artifact: &Path| artifact.ends_with("ok.zip");
        assert!(approver.approve(Path::new("/drop/ok.zip"), &ctx).expect("approve"));
        assert!(!approver.approve(Path::new("/drop/no.zip"), &ctx).expect("approve"));

        let probe = || false;
        assert!(!HealthProbe::probe(&probe, &ctx).expect("probe"));
    }
}
