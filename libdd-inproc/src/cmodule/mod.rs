// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Runtime compilation of C source into executable memory.
//!
//! A [`CModule`] wraps one TinyCC compilation state. User source is
//! compiled together with the builtin header, external names are resolved
//! against the builtin symbol set plus caller-provided imports, and the
//! relocated image lands in a page range that is read-write during
//! relocation and read-execute afterwards. The range is registered with the
//! [cloak](crate::cloak) for its entire lifetime.

mod builtins;

use crate::cloak;
use crate::memory::{self, MemoryRange};
use libc::{c_char, c_void};
use libdd_tcc_sys as tcc;
use std::ffi::{CStr, CString};
use std::ptr::{self, NonNull};

/// Errors surfaced by module construction and linking.
#[derive(Debug, thiserror::Error)]
pub enum CModuleError {
    /// Syntactic or semantic error in the user source; carries the first
    /// compiler diagnostic.
    #[error("Compilation failed: {0}")]
    Compile(String),
    /// Unresolved external, relocation failure, or allocation failure.
    #[error("Linking failed: {0}")]
    Link(String),
    /// API contract violation, e.g. `find_symbol` before `link`.
    #[error("Invalid operation: {0}")]
    InvalidOperation(&'static str),
}

/// A C module compiled in-process.
///
/// Lifecycle: [`CModule::new`] → [`CModule::add_symbol`]\* →
/// [`CModule::link`] → [`CModule::find_symbol`]\* → drop. Symbols may only
/// be added before linking, lookups are only valid after, and `link` may
/// succeed at most once. Dropping a linked module runs its `finalize`
/// export (if any) and releases the executable range.
#[derive(Debug)]
pub struct CModule {
    state: *mut tcc::TCCState,
    range: Option<MemoryRange>,
}

impl CModule {
    /// Compiles `source` against the builtin header. The module still has
    /// to be linked before any of its symbols can be used.
    pub fn new(source: &str) -> Result<Self, CModuleError> {
        // SAFETY: tcc_new has no preconditions.
        let state = unsafe { tcc::tcc_new() };
        if state.is_null() {
            return Err(CModuleError::Compile(
                "failed to create compiler state".into(),
            ));
        }
        // Dropping on any early return below tears the state down.
        let module = CModule { state, range: None };

        let combined = compose_source(source);
        let combined = CString::new(combined)
            .map_err(|_| CModuleError::Compile("source contains a NUL byte".into()))?;

        let mut first_diagnostic: Option<String> = None;
        // SAFETY: the state is live; the diagnostic slot outlives the
        // window during which the callback is installed.
        let res = unsafe {
            tcc::tcc_set_error_func(
                state,
                &mut first_diagnostic as *mut Option<String> as *mut c_void,
                Some(capture_first_diagnostic),
            );
            tcc::tcc_set_options(state, c"-nostdlib".as_ptr());
            tcc::tcc_set_output_type(state, tcc::TCC_OUTPUT_MEMORY);
            let res = tcc::tcc_compile_string(state, combined.as_ptr());
            tcc::tcc_set_error_func(state, ptr::null_mut(), None);
            res
        };
        if res != 0 {
            return Err(CModuleError::Compile(
                first_diagnostic.unwrap_or_else(|| "compilation failed".into()),
            ));
        }

        for (name, address) in builtins::builtin_symbols() {
            // SAFETY: name is NUL-terminated and the state is live.
            unsafe { tcc::tcc_add_symbol(state, name.as_ptr(), address) };
        }

        Ok(module)
    }

    /// Compiles `source` with `imports` resolved on top of the builtin
    /// symbol set, then links. Every external the source references must be
    /// satisfied by one or the other.
    pub fn with_imports(
        source: &str,
        imports: &[(&str, *const c_void)],
    ) -> Result<Self, CModuleError> {
        let mut module = Self::new(source)?;
        for (name, address) in imports {
            module.add_symbol(name, *address)?;
        }
        module.link()?;
        Ok(module)
    }

    /// Binds an externally resolved address to a name the compiled code may
    /// reference. Must precede [`CModule::link`].
    pub fn add_symbol(&mut self, name: &str, address: *const c_void) -> Result<(), CModuleError> {
        if self.range.is_some() {
            return Err(CModuleError::InvalidOperation(
                "symbols may only be added before link",
            ));
        }
        let name = CString::new(name)
            .map_err(|_| CModuleError::InvalidOperation("symbol name contains a NUL byte"))?;
        // SAFETY: the state is live and un-linked.
        unsafe { tcc::tcc_add_symbol(self.state, name.as_ptr(), address) };
        Ok(())
    }

    /// Relocates the compiled image into a fresh executable range and runs
    /// the module's `init` export if it defines one.
    pub fn link(&mut self) -> Result<(), CModuleError> {
        if self.range.is_some() {
            return Err(CModuleError::InvalidOperation("module is already linked"));
        }

        let mut first_diagnostic: Option<String> = None;
        // SAFETY: state is live; see `new` for the error-callback window.
        unsafe {
            tcc::tcc_set_error_func(
                self.state,
                &mut first_diagnostic as *mut Option<String> as *mut c_void,
                Some(capture_first_diagnostic),
            );
        }
        let result = self.relocate(&mut first_diagnostic);
        // SAFETY: the diagnostic slot dies with this frame; disarm first.
        unsafe { tcc::tcc_set_error_func(self.state, ptr::null_mut(), None) };
        result
    }

    fn relocate(&mut self, first_diagnostic: &mut Option<String>) -> Result<(), CModuleError> {
        let link_error = |diag: &mut Option<String>, fallback: &str| {
            CModuleError::Link(diag.take().unwrap_or_else(|| fallback.into()))
        };

        // Size pass first; the second pass relocates into our buffer.
        // SAFETY: state holds a successfully compiled image.
        let size = unsafe { tcc::tcc_relocate(self.state, ptr::null_mut()) };
        if size < 0 {
            return Err(link_error(first_diagnostic, "relocation failed"));
        }
        let size = size as usize;

        let base = memory::allocate_rw(size).map_err(|e| CModuleError::Link(e.to_string()))?;
        // SAFETY: base points at a fresh RW mapping of at least `size` bytes.
        let res = unsafe { tcc::tcc_relocate(self.state, base) };
        if res != 0 {
            // SAFETY: allocated above, never published.
            unsafe { memory::free(base, size) };
            return Err(link_error(first_diagnostic, "relocation failed"));
        }

        // SAFETY: relocation into the range is complete; nothing executes
        // from it until after the flip.
        if let Err(e) = unsafe { memory::mark_code(base, size) } {
            unsafe { memory::free(base, size) };
            return Err(CModuleError::Link(e.to_string()));
        }

        let range = MemoryRange::new(base as usize, size);
        self.range = Some(range);
        cloak::add_range(range);

        tracing::debug!(base = base as usize, size, "linked C module");

        // SAFETY: the image is executable and fully resolved.
        unsafe { self.call_entrypoint(c"init") };

        Ok(())
    }

    /// Looks up an exported symbol. Only valid after a successful link;
    /// unknown names yield `Ok(None)`.
    pub fn find_symbol(&self, name: &str) -> Result<Option<NonNull<c_void>>, CModuleError> {
        if self.range.is_none() {
            return Err(CModuleError::InvalidOperation(
                "find_symbol is only valid after link",
            ));
        }
        let name = CString::new(name)
            .map_err(|_| CModuleError::InvalidOperation("symbol name contains a NUL byte"))?;
        // SAFETY: the state is live and linked.
        let address = unsafe { tcc::tcc_get_symbol(self.state, name.as_ptr()) };
        Ok(NonNull::new(address))
    }

    /// The executable range backing this module, once linked.
    pub fn range(&self) -> Option<MemoryRange> {
        self.range
    }

    /// Calls the module's `name` export if it defines one. `init` and
    /// `finalize` are both optional and take no arguments.
    unsafe fn call_entrypoint(&self, name: &CStr) {
        let address = tcc::tcc_get_symbol(self.state, name.as_ptr());
        if !address.is_null() {
            let entrypoint: extern "C" fn() = std::mem::transmute(address);
            entrypoint();
        }
    }
}

impl Drop for CModule {
    fn drop(&mut self) {
        if let Some(range) = self.range.take() {
            // SAFETY: the range is still executable at this point.
            unsafe { self.call_entrypoint(c"finalize") };

            cloak::remove_range(&range);

            // SAFETY: the range was allocated during link and is no longer
            // referenced; compiled code must not be called past this point.
            unsafe { memory::free(range.base() as *mut c_void, range.size()) };
        }

        // SAFETY: the state was created in `new` and not freed since.
        unsafe { tcc::tcc_delete(self.state) };
    }
}

fn compose_source(source: &str) -> String {
    let header = builtins::builtin_header();
    let mut combined = String::with_capacity(header.len() + source.len() + 64);
    // Line directives keep diagnostics pointing at user-source line 1.
    combined.push_str("#line 1 \"module-builtins.h\"\n");
    combined.push_str(&header);
    combined.push_str("#line 1 \"module.c\"\n");
    combined.push_str(source);
    combined
}

/// Diagnostic callback handed to the compiler: the first message per
/// compile/link wins, the rest are dropped.
unsafe extern "C" fn capture_first_diagnostic(opaque: *mut c_void, msg: *const c_char) {
    let slot = &mut *(opaque as *mut Option<String>);
    if slot.is_none() {
        *slot = Some(CStr::from_ptr(msg).to_string_lossy().into_owned());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compose_source_keeps_user_lines_addressable() {
        let combined = compose_source("int x;\n");
        assert!(combined.starts_with("#line 1 \"module-builtins.h\"\n"));
        assert!(combined.contains("#line 1 \"module.c\"\nint x;\n"));
    }

    #[test]
    fn test_error_display() {
        let e = CModuleError::Compile("module.c:1: error: ';' expected".into());
        assert_eq!(
            e.to_string(),
            "Compilation failed: module.c:1: error: ';' expected"
        );
        let e = CModuleError::InvalidOperation("module is already linked");
        assert_eq!(e.to_string(), "Invalid operation: module is already linked");
    }

    #[test]
    fn test_first_diagnostic_wins() {
        let mut slot: Option<String> = None;
        let opaque = &mut slot as *mut Option<String> as *mut c_void;
        unsafe {
            capture_first_diagnostic(opaque, c"first".as_ptr());
            capture_first_diagnostic(opaque, c"second".as_ptr());
        }
        assert_eq!(slot.as_deref(), Some("first"));
    }
}
