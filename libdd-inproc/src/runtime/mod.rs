// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Host-runtime helpers backing the builtin header.
//!
//! Compiled C modules are linked with `-nostdlib`; allocation, formatted
//! string building, threading, and atomics are provided by these `ddog_`
//! entry points instead. The implementations live in `support.c` (built by
//! `build.rs`); prototypes for the module side live in the builtin header
//! and MUST REMAIN IN SYNC with both.

use libc::{c_char, c_int, c_uint, c_void, size_t, ssize_t};

/// Refcounted thread handle; opaque on the Rust side.
#[repr(C)]
pub struct DdogThread {
    _unused: [u8; 0],
}

pub type DdogThreadFunc = Option<unsafe extern "C" fn(data: *mut c_void) -> *mut c_void>;

extern "C" {
    pub fn ddog_alloc(n_bytes: size_t) -> *mut c_void;
    pub fn ddog_alloc0(n_bytes: size_t) -> *mut c_void;
    pub fn ddog_realloc(mem: *mut c_void, n_bytes: size_t) -> *mut c_void;
    pub fn ddog_memdup(mem: *const c_void, byte_size: c_uint) -> *mut c_void;
    pub fn ddog_free(mem: *mut c_void);
    pub fn ddog_strdup_printf(format: *const c_char, ...) -> *mut c_char;

    pub fn ddog_thread_new(
        name: *const c_char,
        func: DdogThreadFunc,
        data: *mut c_void,
    ) -> *mut DdogThread;
    pub fn ddog_thread_join(thread: *mut DdogThread) -> *mut c_void;
    pub fn ddog_thread_ref(thread: *mut DdogThread) -> *mut DdogThread;
    pub fn ddog_thread_unref(thread: *mut DdogThread);
    pub fn ddog_thread_yield();

    pub fn ddog_mutex_init(mutex: *mut c_void);
    pub fn ddog_mutex_clear(mutex: *mut c_void);
    pub fn ddog_mutex_lock(mutex: *mut c_void);
    pub fn ddog_mutex_unlock(mutex: *mut c_void);
    pub fn ddog_mutex_trylock(mutex: *mut c_void) -> c_int;

    pub fn ddog_cond_init(cond: *mut c_void);
    pub fn ddog_cond_clear(cond: *mut c_void);
    pub fn ddog_cond_wait(cond: *mut c_void, mutex: *mut c_void);
    pub fn ddog_cond_signal(cond: *mut c_void);
    pub fn ddog_cond_broadcast(cond: *mut c_void);

    pub fn ddog_atomic_int_add(atomic: *mut c_int, val: c_int) -> c_int;
    pub fn ddog_atomic_pointer_add(atomic: *mut c_void, val: ssize_t) -> ssize_t;

    pub fn ddog_clear_icache(begin: *mut c_char, end: *mut c_char);
}
