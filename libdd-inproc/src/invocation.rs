// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Invocation-context ABI shared with the function-hooking subsystem.
//!
//! The hooking subsystem dispatches replacement functions with an
//! [`InvocationContext`] describing the intercepted call. This crate does
//! not implement hooking; it defines the C-visible structures, the accessor
//! entry points compiled C modules link against, and the per-thread channel
//! through which a replacement recovers its cookie ("replacement data").
//!
//! Interceptor implementations enter an [`InvocationScope`] around each
//! replacement dispatch; everything called underneath, including the
//! `signal`/`sigaction` shims of the exception backend, can then reach the
//! current invocation without any cookie slot in the C signature.

use crate::cpu_context::CpuContext;
use libc::{c_int, c_uint, c_void};
use std::cell::Cell;
use std::ptr;

/// C-visible description of one intercepted call, laid out for the builtin
/// header's `DdogInvocationContext`.
#[repr(C)]
pub struct InvocationContext {
    pub function: Option<unsafe extern "C" fn()>,
    pub cpu_context: *mut CpuContext,
    pub system_error: c_int,

    pub backend: *mut InvocationBackend,
}

/// Vtable supplied by the hooking subsystem; every accessor below funnels
/// through it. Slots may be null when a backend does not support the
/// corresponding query.
#[repr(C)]
pub struct InvocationBackend {
    pub state: *mut c_void,

    pub get_nth_argument: Option<unsafe extern "C" fn(*mut InvocationContext, c_uint) -> *mut c_void>,
    pub replace_nth_argument: Option<unsafe extern "C" fn(*mut InvocationContext, c_uint, *mut c_void)>,
    pub get_return_value: Option<unsafe extern "C" fn(*mut InvocationContext) -> *mut c_void>,
    pub replace_return_value: Option<unsafe extern "C" fn(*mut InvocationContext, *mut c_void)>,

    pub get_return_address: Option<unsafe extern "C" fn(*mut InvocationContext) -> *mut c_void>,

    pub get_thread_id: Option<unsafe extern "C" fn(*mut InvocationContext) -> c_uint>,
    pub get_depth: Option<unsafe extern "C" fn(*mut InvocationContext) -> c_uint>,

    pub get_listener_thread_data:
        Option<unsafe extern "C" fn(*mut InvocationContext, libc::size_t) -> *mut c_void>,
    pub get_listener_function_data: Option<unsafe extern "C" fn(*mut InvocationContext) -> *mut c_void>,
    pub get_listener_invocation_data:
        Option<unsafe extern "C" fn(*mut InvocationContext, libc::size_t) -> *mut c_void>,

    pub get_replacement_data: Option<unsafe extern "C" fn(*mut InvocationContext) -> *mut c_void>,
}

thread_local! {
    static CURRENT_INVOCATION: Cell<*mut InvocationContext> = const { Cell::new(ptr::null_mut()) };
}

/// Marks `context` as the thread's current invocation for the duration of
/// the guard. Scopes nest; dropping restores the previous invocation.
pub struct InvocationScope {
    previous: *mut InvocationContext,
}

impl InvocationScope {
    pub fn enter(context: *mut InvocationContext) -> Self {
        let previous = CURRENT_INVOCATION.with(|current| current.replace(context));
        Self { previous }
    }
}

impl Drop for InvocationScope {
    fn drop(&mut self) {
        CURRENT_INVOCATION.with(|current| current.set(self.previous));
    }
}

/// Replacement data of the thread's current invocation, or null when the
/// thread is not inside a replacement dispatch.
pub fn current_replacement_data() -> *mut c_void {
    let context = ddog_interceptor_get_current_invocation();
    if context.is_null() {
        return ptr::null_mut();
    }
    // SAFETY: a non-null current invocation is kept alive by the dispatching
    // interceptor for the duration of its scope.
    unsafe { ddog_invocation_context_get_replacement_data(context) }
}

#[no_mangle]
pub extern "C" fn ddog_interceptor_get_current_invocation() -> *mut InvocationContext {
    CURRENT_INVOCATION.with(|current| current.get())
}

macro_rules! dispatch {
    ($context:expr, $slot:ident ( $($arg:expr),* ), $fallback:expr) => {{
        let context = $context;
        if context.is_null() {
            return $fallback;
        }
        let backend = (*context).backend;
        if backend.is_null() {
            return $fallback;
        }
        match (*backend).$slot {
            Some(f) => f(context $(, $arg)*),
            None => $fallback,
        }
    }};
}

#[no_mangle]
pub unsafe extern "C" fn ddog_invocation_context_get_nth_argument(
    context: *mut InvocationContext,
    n: c_uint,
) -> *mut c_void {
    dispatch!(context, get_nth_argument(n), ptr::null_mut())
}

#[no_mangle]
pub unsafe extern "C" fn ddog_invocation_context_replace_nth_argument(
    context: *mut InvocationContext,
    n: c_uint,
    value: *mut c_void,
) {
    dispatch!(context, replace_nth_argument(n, value), ())
}

#[no_mangle]
pub unsafe extern "C" fn ddog_invocation_context_get_return_value(
    context: *mut InvocationContext,
) -> *mut c_void {
    dispatch!(context, get_return_value(), ptr::null_mut())
}

#[no_mangle]
pub unsafe extern "C" fn ddog_invocation_context_replace_return_value(
    context: *mut InvocationContext,
    value: *mut c_void,
) {
    dispatch!(context, replace_return_value(value), ())
}

#[no_mangle]
pub unsafe extern "C" fn ddog_invocation_context_get_return_address(
    context: *mut InvocationContext,
) -> *mut c_void {
    dispatch!(context, get_return_address(), ptr::null_mut())
}

#[no_mangle]
pub unsafe extern "C" fn ddog_invocation_context_get_thread_id(
    context: *mut InvocationContext,
) -> c_uint {
    dispatch!(context, get_thread_id(), 0)
}

#[no_mangle]
pub unsafe extern "C" fn ddog_invocation_context_get_depth(
    context: *mut InvocationContext,
) -> c_uint {
    dispatch!(context, get_depth(), 0)
}

#[no_mangle]
pub unsafe extern "C" fn ddog_invocation_context_get_listener_thread_data(
    context: *mut InvocationContext,
    required_size: libc::size_t,
) -> *mut c_void {
    dispatch!(context, get_listener_thread_data(required_size), ptr::null_mut())
}

#[no_mangle]
pub unsafe extern "C" fn ddog_invocation_context_get_listener_function_data(
    context: *mut InvocationContext,
) -> *mut c_void {
    dispatch!(context, get_listener_function_data(), ptr::null_mut())
}

#[no_mangle]
pub unsafe extern "C" fn ddog_invocation_context_get_listener_invocation_data(
    context: *mut InvocationContext,
    required_size: libc::size_t,
) -> *mut c_void {
    dispatch!(context, get_listener_invocation_data(required_size), ptr::null_mut())
}

#[no_mangle]
pub unsafe extern "C" fn ddog_invocation_context_get_replacement_data(
    context: *mut InvocationContext,
) -> *mut c_void {
    dispatch!(context, get_replacement_data(), ptr::null_mut())
}
