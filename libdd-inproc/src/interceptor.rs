// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Contract of the function-hooking subsystem.
//!
//! The exception backend needs exactly one capability from its host: replace
//! a named native entry point with a shim, with a cookie attached that the
//! shim can recover through the invocation-context channel
//! ([`crate::invocation::current_replacement_data`]). The hooking machinery
//! itself (trampolines, code patching) lives outside this crate.

use libc::c_void;

/// Replaces native functions process-wide. Implementations serialize
/// replacements between `begin_transaction` and `commit_transaction`.
pub trait NativeFunctionInterceptor: Send + Sync {
    fn begin_transaction(&self);
    fn commit_transaction(&self);

    /// Makes every caller of `function` reach `replacement` instead.
    /// `replacement_data` must be surfaced to the replacement through the
    /// invocation-context channel while a dispatch is in flight.
    ///
    /// # Safety
    /// `function` and `replacement` must be ABI-compatible function
    /// pointers; `replacement_data` must stay valid until `revert`.
    unsafe fn replace(
        &self,
        function: *mut c_void,
        replacement: *mut c_void,
        replacement_data: *mut c_void,
    ) -> anyhow::Result<()>;

    /// Undoes a previous [`NativeFunctionInterceptor::replace`] of `function`.
    ///
    /// # Safety
    /// `function` must have been replaced through this interceptor.
    unsafe fn revert(&self, function: *mut c_void);
}
