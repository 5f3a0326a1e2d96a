// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg(unix)]

use super::dispositions::DispositionTable;
use super::memory_access;
use super::{
    ExceptionDetails, ExceptionHandler, ExceptionKind, MemoryAccessDetails, MemoryOperation,
};
use crate::configuration::BackendConfig;
use crate::cpu_context;
use crate::interceptor::NativeFunctionInterceptor;
use crate::invocation;
use crate::threading;
use libc::{c_int, c_void, siginfo_t, MAP_ANON, MAP_FAILED, MAP_PRIVATE, PROT_NONE, PROT_READ,
    PROT_WRITE, SA_SIGINFO, SIGSTKSZ, SIG_DFL, SIG_ERR, SIG_IGN};
use nix::sys::signal::Signal;
use std::ptr;
use std::sync::atomic::AtomicPtr;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::Arc;

// Note that the trampoline below runs in async-signal context on whatever
// thread faulted. It must not allocate on the heap, must not take locks the
// host might hold, and must not call non-reentrant library functions. The
// disposition table is read through unlocked snapshots, the disassembler
// state is per-fault and self-contained, and the failure paths write to
// stderr and abort.

/// Signals for which the trampoline is installed and `signal`/`sigaction`
/// are virtualized.
pub const MANAGED_SIGNALS: [Signal; 7] = [
    Signal::SIGABRT,
    Signal::SIGSEGV,
    Signal::SIGBUS,
    Signal::SIGILL,
    Signal::SIGFPE,
    Signal::SIGTRAP,
    Signal::SIGSYS,
];

// The kernel hands the trampoline only (signum, siginfo, context); this is
// how it finds its way back. Published before the first handler install,
// cleared after the last restore. A weak back-reference, not ownership.
static THE_BACKEND: AtomicPtr<ExceptionBackend> = AtomicPtr::new(ptr::null_mut());

/// Intercepts CPU exceptions process-wide for as long as it lives.
///
/// Construction attaches: the trampoline is installed on every managed
/// signal, previous dispositions are saved, and the process-level `signal`
/// and `sigaction` entry points are replaced so subsequent host installs
/// land in the saved-dispositions table instead of the kernel. Dropping the
/// backend tears all of that down in reverse order.
pub struct ExceptionBackend {
    handler: ExceptionHandler,
    handler_data: *mut c_void,

    dispositions: DispositionTable,
    config: BackendConfig,

    interceptor: Arc<dyn NativeFunctionInterceptor>,
}

// SAFETY: handler_data is an opaque cookie owned by the embedder, who is
// responsible for the thread-safety of whatever it points at.
unsafe impl Send for ExceptionBackend {}
unsafe impl Sync for ExceptionBackend {}

impl ExceptionBackend {
    /// Attaches a new backend. At most one may be attached per process.
    ///
    /// The returned box must stay alive for as long as interception is
    /// wanted; the trampoline reaches it through a process-wide pointer,
    /// which is why the backend is heap-pinned.
    pub fn new(
        handler: ExceptionHandler,
        handler_data: *mut c_void,
        config: BackendConfig,
        interceptor: Arc<dyn NativeFunctionInterceptor>,
    ) -> anyhow::Result<Box<Self>> {
        let highest = MANAGED_SIGNALS
            .iter()
            .map(|signal| *signal as c_int)
            .max()
            .unwrap_or(0);
        anyhow::ensure!(highest > 0, "managed signal set must not be empty");

        let backend = Box::new(ExceptionBackend {
            handler,
            handler_data,
            dispositions: DispositionTable::new(highest as usize + 1),
            config,
            interceptor,
        });

        let raw = &*backend as *const ExceptionBackend as *mut ExceptionBackend;
        anyhow::ensure!(
            THE_BACKEND
                .compare_exchange(ptr::null_mut(), raw, SeqCst, SeqCst)
                .is_ok(),
            "an exception backend is already attached"
        );

        // SAFETY: the backend is published and heap-pinned; attach only
        // installs handlers and interceptor replacements.
        if let Err(e) = unsafe { backend.attach() } {
            THE_BACKEND.store(ptr::null_mut(), SeqCst);
            return Err(e);
        }

        tracing::debug!(signals = MANAGED_SIGNALS.len(), "exception backend attached");
        Ok(backend)
    }

    unsafe fn attach(&self) -> anyhow::Result<()> {
        if self.config.create_alt_stack() {
            create_alt_stack()?;
        }

        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = dispatch_signal as usize;
        action.sa_flags = SA_SIGINFO;
        if self.config.use_alt_stack() {
            action.sa_flags |= libc::SA_ONSTACK;
        }
        libc::sigemptyset(&mut action.sa_mask);

        for signal in MANAGED_SIGNALS {
            let signum = signal as c_int;
            let mut previous: libc::sigaction = std::mem::zeroed();
            if libc::sigaction(signum, &action, &mut previous) != 0 {
                let failure = errno::errno();
                for installed in MANAGED_SIGNALS {
                    self.restore_disposition(installed as c_int);
                }
                anyhow::bail!("failed to install handler for {signal}: {failure}");
            }
            self.dispositions.store(signum, previous);
        }

        self.interceptor.begin_transaction();
        let cookie = self as *const ExceptionBackend as *mut c_void;
        let result = self
            .interceptor
            .replace(
                libc::signal as usize as *mut c_void,
                replacement_signal as usize as *mut c_void,
                cookie,
            )
            .and_then(|()| {
                self.interceptor.replace(
                    libc::sigaction as usize as *mut c_void,
                    replacement_sigaction as usize as *mut c_void,
                    cookie,
                )
            });
        self.interceptor.commit_transaction();

        if let Err(e) = result {
            self.interceptor.begin_transaction();
            self.interceptor.revert(libc::signal as usize as *mut c_void);
            self.interceptor.commit_transaction();
            for signal in MANAGED_SIGNALS {
                self.restore_disposition(signal as c_int);
            }
            return Err(e.context("failed to virtualize signal installation"));
        }

        Ok(())
    }

    fn detach(&self) {
        self.interceptor.begin_transaction();
        // SAFETY: both entry points were replaced during attach.
        unsafe {
            self.interceptor.revert(libc::signal as usize as *mut c_void);
            self.interceptor.revert(libc::sigaction as usize as *mut c_void);
        }
        self.interceptor.commit_transaction();

        for signal in MANAGED_SIGNALS {
            // SAFETY: restoring a previously saved disposition.
            if !unsafe { self.restore_disposition(signal as c_int) } {
                tracing::warn!(%signal, "failed to restore signal disposition");
            }
        }

        THE_BACKEND.store(ptr::null_mut(), SeqCst);
        tracing::debug!("exception backend detached");
    }

    /// Empties the slot for `signum` and puts the saved disposition back in
    /// front of the kernel. Used by detach and by the trampoline's panic
    /// path, where the process is about to terminate anyway.
    unsafe fn restore_disposition(&self, signum: c_int) -> bool {
        match self.dispositions.take(signum) {
            Some(previous) => libc::sigaction(signum, &previous, ptr::null_mut()) == 0,
            None => true,
        }
    }

    unsafe fn on_signal(&self, signum: c_int, siginfo: *mut siginfo_t, context: *mut c_void) {
        let action = self.dispositions.snapshot(signum);

        let mut details = ExceptionDetails {
            thread_id: threading::get_current_thread_id(),
            kind: ExceptionKind::from_signal(signum),
            address: ptr::null_mut(),
            memory: MemoryAccessDetails {
                operation: MemoryOperation::Invalid,
                address: ptr::null_mut(),
            },
            context: cpu_context::parse_native_context(context),
            native_context: context,
        };
        details.address = details.context.instruction_pointer() as *mut c_void;

        if signum == libc::SIGSEGV || signum == libc::SIGBUS {
            let fault_address = fault_address(siginfo);
            details.memory.operation = if fault_address == details.address {
                MemoryOperation::Execute
            } else {
                memory_access::classify(details.address.cast_const(), &details.context)
            };
            details.memory.address = fault_address;
        }

        // Attach installs a slot for every managed signal before the
        // trampoline can fire, so this cannot happen.
        let Some(action) = action else {
            eprintln!("Missing saved disposition for signal {signum}, aborting");
            libc::abort();
        };

        if (self.handler)(&mut details, self.handler_data) {
            // The kernel resumes the faulting thread with whatever the
            // handler left in the canonical context.
            cpu_context::unparse_native_context(&details.context, context);
            return;
        }

        self.chain(signum, siginfo, context, &action);
    }

    unsafe fn chain(
        &self,
        signum: c_int,
        siginfo: *mut siginfo_t,
        context: *mut c_void,
        action: &libc::sigaction,
    ) {
        if action.sa_flags & SA_SIGINFO != 0 {
            let handler = action.sa_sigaction;
            if handler != 0 {
                let chained: extern "C" fn(c_int, *mut siginfo_t, *mut c_void) =
                    std::mem::transmute(handler);
                chained(signum, siginfo, context);
            } else {
                // Not reachable through valid installs; sigaction with
                // SA_SIGINFO and a null sa_sigaction is rejected upstream.
                debug_assert!(false, "SA_SIGINFO disposition with null sa_sigaction");
                self.restore_disposition(signum);
            }
        } else {
            let handler = action.sa_sigaction;
            if is_chainable(handler) {
                let chained: extern "C" fn(c_int) = std::mem::transmute(handler);
                chained(signum);
            } else if handler != SIG_IGN {
                // Default (or error) disposition: put it back in front of
                // the kernel and return, letting the fault re-raise.
                self.restore_disposition(signum);
            }
        }
    }

    fn virtualize_signal(
        &self,
        signum: c_int,
        handler: libc::sighandler_t,
    ) -> Option<libc::sighandler_t> {
        self.dispositions
            .with_slot(signum, |slot| {
                let saved = slot.as_mut()?;
                // A SA_SIGINFO handler has no single-argument equivalent to
                // hand back; report default instead.
                let previous = if saved.sa_flags & SA_SIGINFO == 0 {
                    saved.sa_sigaction
                } else {
                    SIG_DFL
                };
                saved.sa_sigaction = handler;
                saved.sa_flags &= !SA_SIGINFO;
                Some(previous)
            })
            .flatten()
    }

    unsafe fn virtualize_sigaction(
        &self,
        signum: c_int,
        act: *const libc::sigaction,
        oact: *mut libc::sigaction,
    ) -> Option<c_int> {
        self.dispositions
            .with_slot(signum, |slot| {
                let saved = slot.as_mut()?;
                if !oact.is_null() {
                    *oact = *saved;
                }
                if !act.is_null() {
                    *saved = *act;
                }
                Some(0)
            })
            .flatten()
    }
}

impl Drop for ExceptionBackend {
    fn drop(&mut self) {
        self.detach();
    }
}

/// The single handler installed for every managed signal.
extern "C" fn dispatch_signal(signum: c_int, siginfo: *mut siginfo_t, context: *mut c_void) {
    let backend = THE_BACKEND.load(SeqCst);
    if backend.is_null() {
        // A fault raced attach/detach; there is nobody to dispatch to.
        eprintln!("No exception backend for signal {signum}, aborting");
        unsafe { libc::abort() };
    }
    // SAFETY: the backend outlives its published pointer; siginfo/context
    // come straight from the kernel.
    unsafe { (*backend).on_signal(signum, siginfo, context) };
}

/// Replacement for `signal`, dispatched by the interceptor.
extern "C" fn replacement_signal(
    signum: c_int,
    handler: libc::sighandler_t,
) -> libc::sighandler_t {
    let backend = invocation::current_replacement_data() as *const ExceptionBackend;
    let virtualized =
        // SAFETY: the cookie attached to the replacement is the attached
        // backend, kept alive until revert.
        unsafe { backend.as_ref() }.and_then(|b| b.virtualize_signal(signum, handler));
    match virtualized {
        Some(previous) => previous,
        // Unmanaged: the kernel still owns this signal.
        None => unsafe { libc::signal(signum, handler) },
    }
}

/// Replacement for `sigaction`, dispatched by the interceptor.
extern "C" fn replacement_sigaction(
    signum: c_int,
    act: *const libc::sigaction,
    oact: *mut libc::sigaction,
) -> c_int {
    let backend = invocation::current_replacement_data() as *const ExceptionBackend;
    let virtualized = unsafe { backend.as_ref() }
        .and_then(|b| unsafe { b.virtualize_sigaction(signum, act, oact) });
    match virtualized {
        Some(result) => result,
        None => unsafe { libc::sigaction(signum, act, oact) },
    }
}

fn is_chainable(handler: libc::sighandler_t) -> bool {
    handler != SIG_DFL && handler != SIG_IGN && handler != SIG_ERR
}

unsafe fn fault_address(siginfo: *mut siginfo_t) -> *mut c_void {
    #[cfg(target_os = "linux")]
    return (*siginfo).si_addr();
    #[cfg(target_os = "macos")]
    return (*siginfo).si_addr;
}

/// Allocates a guarded signal altstack. Sized at the greater of 16 pages or
/// `SIGSTKSZ` since fault handlers have been observed to outgrow the 8KB
/// default.
unsafe fn create_alt_stack() -> anyhow::Result<()> {
    let page_size = page_size::get();
    let altstack_base_size = std::cmp::max(SIGSTKSZ, 16 * page_size);
    let stackp = libc::mmap(
        ptr::null_mut(),
        altstack_base_size + page_size,
        PROT_READ | PROT_WRITE,
        MAP_PRIVATE | MAP_ANON,
        -1,
        0,
    );
    anyhow::ensure!(
        stackp != MAP_FAILED,
        "failed to allocate an alternative stack"
    );
    let guard_result = libc::mprotect(stackp, page_size, PROT_NONE);
    anyhow::ensure!(
        guard_result == 0,
        "failed to set up alternative stack guard page"
    );
    let stackp = stackp.add(page_size);

    let stack = libc::stack_t {
        ss_sp: stackp,
        ss_flags: 0,
        ss_size: altstack_base_size,
    };
    let rval = libc::sigaltstack(&stack, ptr::null_mut());
    anyhow::ensure!(rval == 0, "sigaltstack failed {rval}");
    Ok(())
}

/// Fork callbacks are no-ops: the process-wide state is inherited by the
/// child, and attach/detach are not re-run across fork.
pub fn prepare_to_fork() {}
pub fn recover_from_fork_in_parent() {}
pub fn recover_from_fork_in_child() {}
