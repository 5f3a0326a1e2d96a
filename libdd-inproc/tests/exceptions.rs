// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! End-to-end tests for the exception backend: real signals, real
//! dispositions, and shim dispatch the way the hooking subsystem would
//! drive it.

#![cfg(unix)]

use libdd_inproc::invocation::{InvocationBackend, InvocationContext, InvocationScope};
use libdd_inproc::{
    BackendConfig, ExceptionBackend, ExceptionDetails, ExceptionKind, MemoryOperation,
    NativeFunctionInterceptor,
};
use libc::{c_int, c_void, siginfo_t};
use std::ptr;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::sync::{Arc, Mutex, MutexGuard};

// Every test here mutates process-wide signal state.
static PROCESS_STATE: Mutex<()> = Mutex::new(());

fn process_lock() -> MutexGuard<'static, ()> {
    PROCESS_STATE.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone, Copy)]
struct Recorded {
    function: usize,
    replacement: usize,
    replacement_data: usize,
}

/// Stands in for the hooking subsystem: records replacements so tests can
/// dispatch the registered shims by hand.
#[derive(Default)]
struct RecordingInterceptor {
    replacements: Mutex<Vec<Recorded>>,
}

impl RecordingInterceptor {
    fn replacement_of(&self, function: usize) -> Recorded {
        self.replacements
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.function == function)
            .copied()
            .expect("function was replaced")
    }
}

impl NativeFunctionInterceptor for RecordingInterceptor {
    fn begin_transaction(&self) {}

    fn commit_transaction(&self) {}

    unsafe fn replace(
        &self,
        function: *mut c_void,
        replacement: *mut c_void,
        replacement_data: *mut c_void,
    ) -> anyhow::Result<()> {
        self.replacements.lock().unwrap().push(Recorded {
            function: function as usize,
            replacement: replacement as usize,
            replacement_data: replacement_data as usize,
        });
        Ok(())
    }

    unsafe fn revert(&self, function: *mut c_void) {
        self.replacements
            .lock()
            .unwrap()
            .retain(|r| r.function != function as usize);
    }
}

unsafe extern "C" fn vtable_replacement_data(context: *mut InvocationContext) -> *mut c_void {
    (*(*context).backend).state
}

/// Runs `f` the way the interceptor dispatches a replacement: with an
/// invocation scope whose replacement data is `data`.
fn dispatched<R>(data: usize, f: impl FnOnce() -> R) -> R {
    let mut backend = InvocationBackend {
        state: data as *mut c_void,
        get_nth_argument: None,
        replace_nth_argument: None,
        get_return_value: None,
        replace_return_value: None,
        get_return_address: None,
        get_thread_id: None,
        get_depth: None,
        get_listener_thread_data: None,
        get_listener_function_data: None,
        get_listener_invocation_data: None,
        get_replacement_data: Some(vtable_replacement_data),
    };
    let mut context = InvocationContext {
        function: None,
        cpu_context: ptr::null_mut(),
        system_error: 0,
        backend: &mut backend,
    };
    let _scope = InvocationScope::enter(&mut context);
    f()
}

fn refuse_handler(_details: &mut ExceptionDetails, _data: *mut c_void) -> bool {
    false
}

unsafe fn query_kernel_disposition(signum: c_int) -> libc::sigaction {
    let mut current: libc::sigaction = std::mem::zeroed();
    assert_eq!(libc::sigaction(signum, ptr::null(), &mut current), 0);
    current
}

// -- Chaining to the host's handler ----------------------------------------

static CHAINED: AtomicBool = AtomicBool::new(false);

extern "C" fn host_segv_handler(_signum: c_int, _info: *mut siginfo_t, _context: *mut c_void) {
    CHAINED.store(true, SeqCst);
}

#[test]
fn test_unhandled_fault_chains_to_host_handler() {
    let _guard = process_lock();
    CHAINED.store(false, SeqCst);

    // Host installs its own handler before the backend attaches.
    let mut host: libc::sigaction = unsafe { std::mem::zeroed() };
    host.sa_sigaction = host_segv_handler as usize;
    host.sa_flags = libc::SA_SIGINFO;
    unsafe { libc::sigemptyset(&mut host.sa_mask) };
    let mut pre_test: libc::sigaction = unsafe { std::mem::zeroed() };
    assert_eq!(
        unsafe { libc::sigaction(libc::SIGSEGV, &host, &mut pre_test) },
        0
    );

    let backend = ExceptionBackend::new(
        refuse_handler,
        ptr::null_mut(),
        BackendConfig::default(),
        Arc::new(RecordingInterceptor::default()),
    )
    .expect("attach");

    let during = unsafe { query_kernel_disposition(libc::SIGSEGV) };
    assert_ne!(during.sa_sigaction, host_segv_handler as usize);

    // The user handler refuses, so the trampoline chains to the host's
    // three-argument handler.
    unsafe { libc::raise(libc::SIGSEGV) };
    assert!(CHAINED.load(SeqCst));

    drop(backend);

    // Detach put the host handler back in front of the kernel.
    let after = unsafe { query_kernel_disposition(libc::SIGSEGV) };
    assert_eq!(after.sa_sigaction, host_segv_handler as usize);

    assert_eq!(unsafe { libc::sigaction(libc::SIGSEGV, &pre_test, ptr::null_mut()) }, 0);
}

// -- Resuming after a handled fault ----------------------------------------

const OP_NONE: usize = 0;
const OP_READ: usize = 1;
const OP_WRITE: usize = 2;

static LAST_OPERATION: AtomicUsize = AtomicUsize::new(OP_NONE);
static LAST_FAULT_ADDRESS: AtomicUsize = AtomicUsize::new(usize::MAX);

/// Handles access violations raised by the probes below, which fault on a
/// 3-byte mov: record what the classifier saw and resume past it.
fn advance_pc_handler(details: &mut ExceptionDetails, _data: *mut c_void) -> bool {
    if details.kind != ExceptionKind::AccessViolation {
        return false;
    }
    let operation = match details.memory.operation {
        MemoryOperation::Read => OP_READ,
        MemoryOperation::Write => OP_WRITE,
        _ => return false,
    };
    LAST_OPERATION.store(operation, SeqCst);
    LAST_FAULT_ADDRESS.store(details.memory.address as usize, SeqCst);

    let pc = details.context.instruction_pointer();
    details.context.set_instruction_pointer(pc + 3);
    true
}

#[cfg(target_arch = "x86_64")]
#[test]
fn test_handled_read_fault_resumes_past_instruction() {
    let _guard = process_lock();
    LAST_OPERATION.store(OP_NONE, SeqCst);
    LAST_FAULT_ADDRESS.store(usize::MAX, SeqCst);

    let backend = ExceptionBackend::new(
        advance_pc_handler,
        ptr::null_mut(),
        BackendConfig::default(),
        Arc::new(RecordingInterceptor::default()),
    )
    .expect("attach");

    let value: u64;
    unsafe {
        std::arch::asm!(
            "xor eax, eax",
            "mov rax, qword ptr [rax]",
            out("rax") value,
        );
    }

    // The handler skipped the load, so rax kept the null it held.
    assert_eq!(value, 0);
    assert_eq!(LAST_OPERATION.load(SeqCst), OP_READ);
    assert_eq!(LAST_FAULT_ADDRESS.load(SeqCst), 0);

    drop(backend);
}

#[cfg(target_arch = "x86_64")]
#[test]
fn test_handled_write_fault_is_classified_as_write() {
    let _guard = process_lock();
    LAST_OPERATION.store(OP_NONE, SeqCst);
    LAST_FAULT_ADDRESS.store(usize::MAX, SeqCst);

    let backend = ExceptionBackend::new(
        advance_pc_handler,
        ptr::null_mut(),
        BackendConfig::default(),
        Arc::new(RecordingInterceptor::default()),
    )
    .expect("attach");

    unsafe {
        std::arch::asm!(
            "xor eax, eax",
            "mov qword ptr [rax], rax",
            out("rax") _,
        );
    }

    assert_eq!(LAST_OPERATION.load(SeqCst), OP_WRITE);
    assert_eq!(LAST_FAULT_ADDRESS.load(SeqCst), 0);

    drop(backend);
}

// -- Virtualized signal/sigaction ------------------------------------------

extern "C" fn host_sigill_handler(_signum: c_int, _info: *mut siginfo_t, _context: *mut c_void) {}

extern "C" fn host_single_arg_handler(_signum: c_int) {}

type SigactionFn = extern "C" fn(c_int, *const libc::sigaction, *mut libc::sigaction) -> c_int;
type SignalFn = extern "C" fn(c_int, libc::sighandler_t) -> libc::sighandler_t;

#[test]
fn test_sigaction_installs_are_virtualized_while_attached() {
    let _guard = process_lock();

    let interceptor = Arc::new(RecordingInterceptor::default());
    let backend = ExceptionBackend::new(
        refuse_handler,
        ptr::null_mut(),
        BackendConfig::default(),
        interceptor.clone(),
    )
    .expect("attach");

    let recorded = interceptor.replacement_of(libc::sigaction as usize);
    let sigaction_shim: SigactionFn = unsafe { std::mem::transmute(recorded.replacement) };
    let cookie = recorded.replacement_data;

    // The host's view before it installs anything: the pre-attach
    // disposition, never the trampoline.
    let trampoline = unsafe { query_kernel_disposition(libc::SIGILL) }.sa_sigaction;
    let mut seen: libc::sigaction = unsafe { std::mem::zeroed() };
    assert_eq!(
        dispatched(cookie, || sigaction_shim(libc::SIGILL, ptr::null(), &mut seen)),
        0
    );
    assert_ne!(seen.sa_sigaction, trampoline);

    // Host installs a handler; the previous disposition comes back out.
    let mut install: libc::sigaction = unsafe { std::mem::zeroed() };
    install.sa_sigaction = host_sigill_handler as usize;
    install.sa_flags = libc::SA_SIGINFO;
    let mut previous: libc::sigaction = unsafe { std::mem::zeroed() };
    assert_eq!(
        dispatched(cookie, || sigaction_shim(libc::SIGILL, &install, &mut previous)),
        0
    );
    assert_eq!(previous.sa_sigaction, seen.sa_sigaction);

    // The host sees its install; the kernel still runs the trampoline.
    let mut observed: libc::sigaction = unsafe { std::mem::zeroed() };
    assert_eq!(
        dispatched(cookie, || sigaction_shim(libc::SIGILL, ptr::null(), &mut observed)),
        0
    );
    assert_eq!(observed.sa_sigaction, host_sigill_handler as usize);
    assert_eq!(
        unsafe { query_kernel_disposition(libc::SIGILL) }.sa_sigaction,
        trampoline
    );

    drop(backend);

    // Detach promoted the virtualized install to the kernel.
    let after = unsafe { query_kernel_disposition(libc::SIGILL) };
    assert_eq!(after.sa_sigaction, host_sigill_handler as usize);

    // Back to the default for the next test.
    unsafe { libc::signal(libc::SIGILL, libc::SIG_DFL) };
}

#[test]
fn test_signal_installs_are_virtualized_while_attached() {
    let _guard = process_lock();

    let interceptor = Arc::new(RecordingInterceptor::default());
    let backend = ExceptionBackend::new(
        refuse_handler,
        ptr::null_mut(),
        BackendConfig::default(),
        interceptor.clone(),
    )
    .expect("attach");

    let recorded = interceptor.replacement_of(libc::signal as usize);
    let signal_shim: SignalFn = unsafe { std::mem::transmute(recorded.replacement) };
    let cookie = recorded.replacement_data;

    let trampoline = unsafe { query_kernel_disposition(libc::SIGTRAP) }.sa_sigaction;

    dispatched(cookie, || {
        signal_shim(libc::SIGTRAP, host_single_arg_handler as usize)
    });
    // A second install returns the first as the previous handler, and the
    // kernel never saw either.
    let previous = dispatched(cookie, || signal_shim(libc::SIGTRAP, libc::SIG_DFL));
    assert_eq!(previous, host_single_arg_handler as usize);
    assert_eq!(
        unsafe { query_kernel_disposition(libc::SIGTRAP) }.sa_sigaction,
        trampoline
    );

    drop(backend);
}

#[test]
fn test_unmanaged_signals_are_forwarded_to_the_kernel() {
    let _guard = process_lock();

    let interceptor = Arc::new(RecordingInterceptor::default());
    let backend = ExceptionBackend::new(
        refuse_handler,
        ptr::null_mut(),
        BackendConfig::default(),
        interceptor.clone(),
    )
    .expect("attach");

    let recorded = interceptor.replacement_of(libc::signal as usize);
    let signal_shim: SignalFn = unsafe { std::mem::transmute(recorded.replacement) };

    // SIGUSR1 is outside the managed set: the shim defers to the kernel.
    dispatched(recorded.replacement_data, || {
        signal_shim(libc::SIGUSR1, libc::SIG_IGN)
    });
    assert_eq!(
        unsafe { query_kernel_disposition(libc::SIGUSR1) }.sa_sigaction,
        libc::SIG_IGN
    );

    unsafe { libc::signal(libc::SIGUSR1, libc::SIG_DFL) };
    drop(backend);
}

#[test]
fn test_attach_detach_is_transparent_when_host_does_nothing() {
    let _guard = process_lock();

    let before = unsafe { query_kernel_disposition(libc::SIGFPE) };

    let backend = ExceptionBackend::new(
        refuse_handler,
        ptr::null_mut(),
        BackendConfig::default(),
        Arc::new(RecordingInterceptor::default()),
    )
    .expect("attach");
    drop(backend);

    let after = unsafe { query_kernel_disposition(libc::SIGFPE) };
    assert_eq!(before.sa_sigaction, after.sa_sigaction);
}
