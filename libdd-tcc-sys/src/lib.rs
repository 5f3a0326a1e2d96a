// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![allow(non_camel_case_types)]
#![allow(dead_code)]

//! Rust bindings to libtcc
//!
//! This crate provides raw FFI bindings to the TinyCC compilation library
//! for compiling C source into memory at runtime. The bindings are manually
//! defined to avoid bindgen dependencies, and cover only the subset of the
//! API needed for in-memory compile / relocate / symbol lookup.
//!
//! The library to link against can be pointed at with the `TCC_LIB_DIR`
//! environment variable at build time.

use libc::{c_char, c_int, c_void};

/// Opaque compilation state. One `TCCState` holds everything from source
/// parsing through relocation; it is not thread-safe and must be driven
/// from one thread at a time.
#[repr(C)]
pub struct TCCState {
    _unused: [u8; 0],
}

/// Output goes to an in-memory image, to be executed in-process.
pub const TCC_OUTPUT_MEMORY: c_int = 1;
/// Output is a linked executable on disk.
pub const TCC_OUTPUT_EXE: c_int = 2;
/// Output is a dynamic library on disk.
pub const TCC_OUTPUT_DLL: c_int = 3;
/// Output is a relocatable object file on disk.
pub const TCC_OUTPUT_OBJ: c_int = 4;

/// Diagnostic callback installed via [`tcc_set_error_func`]. Invoked once
/// per diagnostic with the opaque cookie and a NUL-terminated message.
pub type TCCErrorFunc = Option<unsafe extern "C" fn(opaque: *mut c_void, msg: *const c_char)>;

extern "C" {
    pub fn tcc_new() -> *mut TCCState;

    pub fn tcc_delete(s: *mut TCCState);

    pub fn tcc_set_error_func(s: *mut TCCState, error_opaque: *mut c_void, error_func: TCCErrorFunc);

    pub fn tcc_set_options(s: *mut TCCState, str: *const c_char);

    pub fn tcc_set_output_type(s: *mut TCCState, output_type: c_int) -> c_int;

    pub fn tcc_compile_string(s: *mut TCCState, buf: *const c_char) -> c_int;

    pub fn tcc_add_symbol(s: *mut TCCState, name: *const c_char, val: *const c_void) -> c_int;

    /// With a null `ptr`, returns the size in bytes the relocated image
    /// will occupy (or -1 on error). With a non-null `ptr`, relocates the
    /// compiled code into the caller-provided buffer and resolves every
    /// remaining external against the symbols added so far.
    pub fn tcc_relocate(s: *mut TCCState, ptr: *mut c_void) -> c_int;

    pub fn tcc_get_symbol(s: *mut TCCState, name: *const c_char) -> *mut c_void;
}
