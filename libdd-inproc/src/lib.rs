// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-process instrumentation core.
//!
//! Two subsystems live here. The [`cmodule`] module compiles snippets of C
//! source into executable memory at runtime and links them against a curated
//! set of callable symbols. The [`exceptions`] module intercepts CPU
//! exceptions (access violations, illegal instructions, arithmetic faults,
//! breakpoints, aborts) raised by any thread, classifies the faulting memory
//! operation, and dispatches to a user-supplied handler that may resume
//! execution with a mutated register state or chain to the previously
//! installed OS handler.

#![cfg(unix)]

pub mod cloak;
pub mod configuration;
pub mod cpu_context;
pub mod exceptions;
pub mod interceptor;
pub mod invocation;
pub mod memory;
pub mod runtime;
pub mod threading;

#[cfg(feature = "cmodule")]
pub mod cmodule;

pub use configuration::BackendConfig;
pub use cpu_context::CpuContext;
pub use exceptions::{
    ExceptionBackend, ExceptionDetails, ExceptionHandler, ExceptionKind, MemoryAccessDetails,
    MemoryOperation,
};
pub use interceptor::NativeFunctionInterceptor;
pub use memory::MemoryRange;

#[cfg(feature = "cmodule")]
pub use cmodule::{CModule, CModuleError};
