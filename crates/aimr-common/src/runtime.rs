//! Tensor runtime adapter.
//!
//! Candle frees buffers when the last `Tensor` handle is dropped, which makes
//! leaks invisible: a handle parked in a long-lived collection keeps its
//! buffer alive forever. The [`AllocationLedger`] counts every handle the
//! training pipeline deliberately keeps alive (weights, the dataset, the
//! current batch, step scratch) so that growth between steps can be detected.

use candle_core::{Device, Tensor};
use std::fmt;
use std::ops::Deref;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{ModelError, Result};

/// Shared live-allocation counter.
///
/// Cloning yields another handle to the same counter.
#[derive(Debug, Clone, Default)]
pub struct AllocationLedger {
    live: Arc<AtomicUsize>,
}

impl AllocationLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of allocations currently registered.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Register `count` long-lived allocations, released when the
    /// returned guard is dropped.
    pub fn reserve(&self, count: usize) -> Reservation {
        self.live.fetch_add(count, Ordering::SeqCst);
        Reservation {
            ledger: self.clone(),
            count,
        }
    }

    /// Register a single tensor for as long as the returned handle lives.
    pub fn track(&self, tensor: Tensor) -> Tracked {
        Tracked {
            tensor,
            _reservation: self.reserve(1),
        }
    }

    /// Open a scratch region.
    pub fn open_scope(&self) -> Scope {
        Scope {
            ledger: self.clone(),
            tensors: Vec::new(),
        }
    }

    /// Run `f` inside a scratch region.
    ///
    /// Everything registered through [`Scope::track`] is released when the
    /// region exits, whether `f` returns `Ok`, `Err` or unwinds. Tensors that
    /// must outlive the region leave through [`Scope::keep`] and stay counted
    /// until their handle is dropped.
    pub fn scope<T, E, F>(&self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&mut Scope) -> std::result::Result<T, E>,
    {
        let mut scope = self.open_scope();
        f(&mut scope)
    }

    fn release(&self, count: usize) {
        self.live.fetch_sub(count, Ordering::SeqCst);
    }
}

/// Guard for allocations registered with [`AllocationLedger::reserve`].
#[derive(Debug)]
pub struct Reservation {
    ledger: AllocationLedger,
    count: usize,
}

impl Reservation {
    pub fn count(&self) -> usize {
        self.count
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.ledger.release(self.count);
    }
}

/// A tensor counted in the ledger while this handle is alive.
#[derive(Debug)]
pub struct Tracked {
    tensor: Tensor,
    _reservation: Reservation,
}

impl Tracked {
    pub fn tensor(&self) -> &Tensor {
        &self.tensor
    }
}

impl Deref for Tracked {
    type Target = Tensor;

    fn deref(&self) -> &Tensor {
        &self.tensor
    }
}

/// Scratch region; see [`AllocationLedger::scope`].
pub struct Scope {
    ledger: AllocationLedger,
    tensors: Vec<Tensor>,
}

impl Scope {
    /// Register a scratch tensor and hand it back.
    ///
    /// The scope keeps its own handle, so the buffer lives at least until the
    /// region closes.
    pub fn track(&mut self, tensor: Tensor) -> Tensor {
        self.ledger.live.fetch_add(1, Ordering::SeqCst);
        self.tensors.push(tensor.clone());
        tensor
    }

    /// Hand a tensor out of the region.
    ///
    /// It is not released when the region closes; the returned handle keeps
    /// it counted for as long as the caller holds it.
    pub fn keep(&mut self, tensor: Tensor) -> Tracked {
        self.ledger.track(tensor)
    }

    /// Number of tensors registered in this region so far.
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        let n = self.tensors.len();
        self.tensors.clear();
        self.ledger.release(n);
    }
}

/// Capability interface over the tensor library.
pub trait TensorRuntime: Send + Sync {
    /// Human-readable backend name ("cpu", "cuda:0").
    fn name(&self) -> String;

    fn device(&self) -> &Device;

    fn ledger(&self) -> &AllocationLedger;

    /// Live allocation count as seen by the memory guard.
    fn live_tensors(&self) -> usize {
        self.ledger().live()
    }

    /// Block until queued device work has completed.
    fn synchronize(&self) -> Result<()>;
}

/// Backend selector parsed from `cpu`, `cuda` or `cuda:N`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Cpu,
    Cuda(usize),
}

impl FromStr for Backend {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cpu" => Ok(Backend::Cpu),
            "cuda" => Ok(Backend::Cuda(0)),
            s if s.starts_with("cuda:") => {
                let id = s["cuda:".len()..].parse::<usize>().map_err(|_| {
                    ModelError::InvalidConfig(format!("Invalid CUDA device id in '{}'", s))
                })?;
                Ok(Backend::Cuda(id))
            }
            other => Err(ModelError::InvalidConfig(format!(
                "Unknown device: {}. Use 'cpu', 'cuda', or 'cuda:N'.",
                other
            ))),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Cpu => write!(f, "cpu"),
            Backend::Cuda(id) => write!(f, "cuda:{}", id),
        }
    }
}

impl Backend {
    /// Instantiate the runtime for this backend.
    pub fn runtime(self) -> Result<CandleRuntime> {
        match self {
            Backend::Cpu => Ok(CandleRuntime::cpu()),
            Backend::Cuda(id) => CandleRuntime::cuda(id),
        }
    }
}

/// [`TensorRuntime`] backed by a candle device.
#[derive(Debug, Clone)]
pub struct CandleRuntime {
    device: Device,
    backend: Backend,
    ledger: AllocationLedger,
}

impl CandleRuntime {
    pub fn cpu() -> Self {
        Self {
            device: Device::Cpu,
            backend: Backend::Cpu,
            ledger: AllocationLedger::new(),
        }
    }

    #[cfg(feature = "cuda")]
    pub fn cuda(ordinal: usize) -> Result<Self> {
        let device = Device::new_cuda(ordinal).map_err(|e| {
            ModelError::BackendUnavailable(format!(
                "Failed to initialize CUDA device {}: {}",
                ordinal, e
            ))
        })?;
        Ok(Self {
            device,
            backend: Backend::Cuda(ordinal),
            ledger: AllocationLedger::new(),
        })
    }

    #[cfg(not(feature = "cuda"))]
    pub fn cuda(ordinal: usize) -> Result<Self> {
        Err(ModelError::BackendUnavailable(format!(
            "cuda:{} requested but this build lacks the `cuda` feature",
            ordinal
        )))
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }
}

impl TensorRuntime for CandleRuntime {
    fn name(&self) -> String {
        self.backend.to_string()
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn ledger(&self) -> &AllocationLedger {
        &self.ledger
    }

    fn synchronize(&self) -> Result<()> {
        self.device.synchronize()?;
        Ok(())
    }
}
