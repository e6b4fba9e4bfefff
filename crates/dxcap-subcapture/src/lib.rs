//! State reconstruction for D3D12 subcaptures.
//!
//! A subcapture records only a window of frames (or command-queue executions) of a running
//! application. Everything the window depends on was created earlier, so the engine tracks the
//! application from its first call and, when the window opens, writes a synthesized prefix into
//! the capture stream that recreates objects, memory contents, descriptors, resource states,
//! tile mappings, residency and raytracing acceleration structures.
//!
//! [`StateOrchestrator`] is the entry point: feed it every intercepted call through
//! [`StateOrchestrator::process`], and it writes to a [`CommandSink`].

pub mod accel;
pub mod analysis;
pub mod aux_views;
pub mod command;
pub mod config;
pub mod content;
pub mod descriptors;
pub mod diagnostics;
mod error;
pub mod gpu;
pub mod model;
pub mod orchestrator;
pub mod range;
pub mod residency;
pub mod resource_states;
pub mod stream;
pub mod tiled;

pub use crate::analysis::{AnalysisError, AnalyzerResults};
pub use crate::command::{Command, CommandRecord};
pub use crate::config::{InclusiveRange, SubcaptureConfig};
pub use crate::error::{Result, SubcaptureError};
pub use crate::gpu::{GpuDevice, HostMemoryGpu};
pub use crate::model::{CommandKey, ObjectKey};
pub use crate::orchestrator::{RestoreReport, StateOrchestrator};
pub use crate::stream::{CommandSink, MemorySink, RecordedCommand};
