// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The builtin header and symbol set every compiled module gets for free.
//!
//! The header is public ABI: modules in the wild depend on these names.
//! Adding a name is a compatible change, removing or renaming one is not.
//! Every prototype that resolves to a host symbol must appear in
//! [`builtin_symbols`]; `test_every_builtin_name_is_bound` enforces that.

use libc::c_void;
use std::ffi::CStr;
use std::ptr;

#[cfg(target_pointer_width = "64")]
const DATA_MODEL_LINES: &[&str] = &[
    "typedef signed char int8_t;",
    "typedef unsigned char uint8_t;",
    "typedef signed short int int16_t;",
    "typedef unsigned short int uint16_t;",
    "typedef signed int int32_t;",
    "typedef unsigned int uint32_t;",
    "typedef signed long int int64_t;",
    "typedef unsigned long int uint64_t;",
    "typedef int64_t ssize_t;",
    "typedef uint64_t size_t;",
];

#[cfg(target_pointer_width = "32")]
const DATA_MODEL_LINES: &[&str] = &[
    "typedef signed char int8_t;",
    "typedef unsigned char uint8_t;",
    "typedef signed short int int16_t;",
    "typedef unsigned short int uint16_t;",
    "typedef signed int int32_t;",
    "typedef unsigned int uint32_t;",
    "typedef signed long long int int64_t;",
    "typedef unsigned long long int uint64_t;",
    "typedef int32_t ssize_t;",
    "typedef uint32_t size_t;",
];

const LIBC_LINES: &[&str] = &[
    "size_t strlen (const char * s);",
    "int strcmp (const char * s1, const char * s2);",
    "char * strstr (const char * haystack, const char * needle);",
    "char * strchr (const char * s, int c);",
    "char * strrchr (const char * s, int c);",
    "void * memcpy (void * restrict dst, const void * restrict src, size_t n);",
    "void * memmove (void * dst, const void * src, size_t len);",
    "typedef struct _FILE FILE;",
    "int puts (const char * s);",
    "int fputs (const char * restrict s, FILE * restrict stream);",
    "int fflush (FILE * stream);",
    "int printf (const char * restrict format, ...);",
    "int fprintf (FILE * restrict stream, const char * restrict format, ...);",
    "extern FILE * stdout;",
    "extern FILE * stderr;",
];

const RUNTIME_LINES: &[&str] = &[
    "void * ddog_alloc (size_t n_bytes);",
    "void * ddog_alloc0 (size_t n_bytes);",
    "void * ddog_realloc (void * mem, size_t n_bytes);",
    "void * ddog_memdup (const void * mem, unsigned int byte_size);",
    "void ddog_free (void * mem);",
    "char * ddog_strdup_printf (const char * format, ...);",
    "typedef struct _DdogThread DdogThread;",
    "typedef void * (* DdogThreadFunc) (void * data);",
    "DdogThread * ddog_thread_new (const char * name, DdogThreadFunc func, void * data);",
    "void * ddog_thread_join (DdogThread * thread);",
    "DdogThread * ddog_thread_ref (DdogThread * thread);",
    "void ddog_thread_unref (DdogThread * thread);",
    "void ddog_thread_yield (void);",
    "typedef union _DdogMutex DdogMutex;",
    "typedef union _DdogCond DdogCond;",
    "union _DdogMutex",
    "{",
    "  void * p;",
    "  unsigned char bytes[64];",
    "};",
    "union _DdogCond",
    "{",
    "  void * p;",
    "  unsigned char bytes[64];",
    "};",
    "void ddog_mutex_init (DdogMutex * mutex);",
    "void ddog_mutex_clear (DdogMutex * mutex);",
    "void ddog_mutex_lock (DdogMutex * mutex);",
    "void ddog_mutex_unlock (DdogMutex * mutex);",
    "int ddog_mutex_trylock (DdogMutex * mutex);",
    "void ddog_cond_init (DdogCond * cond);",
    "void ddog_cond_clear (DdogCond * cond);",
    "void ddog_cond_wait (DdogCond * cond, DdogMutex * mutex);",
    "void ddog_cond_signal (DdogCond * cond);",
    "void ddog_cond_broadcast (DdogCond * cond);",
    "int ddog_atomic_int_add (volatile int * atomic, int val);",
    "ssize_t ddog_atomic_pointer_add (volatile void * atomic, ssize_t val);",
];

#[cfg(target_arch = "x86")]
const CPU_CONTEXT_LINES: &[&str] = &[
    "typedef struct _DdogCpuContext DdogCpuContext;",
    "struct _DdogCpuContext",
    "{",
    "  uint32_t eip;",
    "  uint32_t edi;",
    "  uint32_t esi;",
    "  uint32_t ebp;",
    "  uint32_t esp;",
    "  uint32_t ebx;",
    "  uint32_t edx;",
    "  uint32_t ecx;",
    "  uint32_t eax;",
    "};",
];

#[cfg(target_arch = "x86_64")]
const CPU_CONTEXT_LINES: &[&str] = &[
    "typedef struct _DdogCpuContext DdogCpuContext;",
    "struct _DdogCpuContext",
    "{",
    "  uint64_t rip;",
    "  uint64_t r15;",
    "  uint64_t r14;",
    "  uint64_t r13;",
    "  uint64_t r12;",
    "  uint64_t r11;",
    "  uint64_t r10;",
    "  uint64_t r9;",
    "  uint64_t r8;",
    "  uint64_t rdi;",
    "  uint64_t rsi;",
    "  uint64_t rbp;",
    "  uint64_t rsp;",
    "  uint64_t rbx;",
    "  uint64_t rdx;",
    "  uint64_t rcx;",
    "  uint64_t rax;",
    "};",
];

#[cfg(target_arch = "arm")]
const CPU_CONTEXT_LINES: &[&str] = &[
    "typedef struct _DdogCpuContext DdogCpuContext;",
    "struct _DdogCpuContext",
    "{",
    "  uint32_t cpsr;",
    "  uint32_t pc;",
    "  uint32_t sp;",
    "  uint32_t r8;",
    "  uint32_t r9;",
    "  uint32_t r10;",
    "  uint32_t r11;",
    "  uint32_t r12;",
    "  uint32_t r[8];",
    "  uint32_t lr;",
    "};",
];

#[cfg(target_arch = "aarch64")]
const CPU_CONTEXT_LINES: &[&str] = &[
    "typedef struct _DdogCpuContext DdogCpuContext;",
    "struct _DdogCpuContext",
    "{",
    "  uint64_t pc;",
    "  uint64_t sp;",
    "  uint64_t x[29];",
    "  uint64_t fp;",
    "  uint64_t lr;",
    "  uint8_t q[128];",
    "};",
];

#[cfg(any(target_arch = "mips", target_arch = "mips64"))]
const CPU_CONTEXT_LINES: &[&str] = &[
    "typedef struct _DdogCpuContext DdogCpuContext;",
    "struct _DdogCpuContext",
    "{",
    "  size_t pc;",
    "  size_t gp;",
    "  size_t sp;",
    "  size_t fp;",
    "  size_t ra;",
    "  size_t hi;",
    "  size_t lo;",
    "  size_t at;",
    "  size_t v0;",
    "  size_t v1;",
    "  size_t a0;",
    "  size_t a1;",
    "  size_t a2;",
    "  size_t a3;",
    "  size_t t0;",
    "  size_t t1;",
    "  size_t t2;",
    "  size_t t3;",
    "  size_t t4;",
    "  size_t t5;",
    "  size_t t6;",
    "  size_t t7;",
    "  size_t t8;",
    "  size_t t9;",
    "  size_t s0;",
    "  size_t s1;",
    "  size_t s2;",
    "  size_t s3;",
    "  size_t s4;",
    "  size_t s5;",
    "  size_t s6;",
    "  size_t s7;",
    "  size_t k0;",
    "  size_t k1;",
    "};",
];

const INVOCATION_LINES: &[&str] = &[
    "typedef void (* DdogCallback) (void);",
    "typedef struct _DdogInvocationContext DdogInvocationContext;",
    "typedef struct _DdogInvocationBackend DdogInvocationBackend;",
    "struct _DdogInvocationContext",
    "{",
    "  DdogCallback function;",
    "  DdogCpuContext * cpu_context;",
    "  int system_error;",
    "  DdogInvocationBackend * backend;",
    "};",
    "DdogInvocationContext * ddog_interceptor_get_current_invocation (void);",
    "void * ddog_invocation_context_get_nth_argument (DdogInvocationContext * context, unsigned int n);",
    "void ddog_invocation_context_replace_nth_argument (DdogInvocationContext * context, unsigned int n, void * value);",
    "void * ddog_invocation_context_get_return_value (DdogInvocationContext * context);",
    "void ddog_invocation_context_replace_return_value (DdogInvocationContext * context, void * value);",
    "void * ddog_invocation_context_get_return_address (DdogInvocationContext * context);",
    "unsigned int ddog_invocation_context_get_thread_id (DdogInvocationContext * context);",
    "unsigned int ddog_invocation_context_get_depth (DdogInvocationContext * context);",
    "void * ddog_invocation_context_get_listener_thread_data (DdogInvocationContext * context, size_t required_size);",
    "void * ddog_invocation_context_get_listener_function_data (DdogInvocationContext * context);",
    "void * ddog_invocation_context_get_listener_invocation_data (DdogInvocationContext * context, size_t required_size);",
    "void * ddog_invocation_context_get_replacement_data (DdogInvocationContext * context);",
    "#define DDOG_IC_GET_THREAD_DATA(context, data_type) ((data_type *) \
ddog_invocation_context_get_listener_thread_data (context, sizeof (data_type)))",
    "#define DDOG_IC_GET_FUNC_DATA(context, data_type) ((data_type) \
ddog_invocation_context_get_listener_function_data (context))",
    "#define DDOG_IC_GET_INVOCATION_DATA(context, data_type) ((data_type *) \
ddog_invocation_context_get_listener_invocation_data (context, sizeof (data_type)))",
    "#define DDOG_IC_GET_REPLACEMENT_DATA(ctx, data_type) ((data_type) \
ddog_invocation_context_get_replacement_data (ctx))",
];

/// Assembles the header prepended to every module's source.
pub(crate) fn builtin_header() -> String {
    let mut header = String::with_capacity(4096);
    for group in [
        DATA_MODEL_LINES,
        LIBC_LINES,
        RUNTIME_LINES,
        CPU_CONTEXT_LINES,
        INVOCATION_LINES,
    ] {
        for line in group {
            header.push_str(line);
            header.push('\n');
        }
    }
    header
}

extern "C" {
    #[cfg_attr(target_os = "macos", link_name = "__stdoutp")]
    static mut stdout: *mut libc::FILE;
    #[cfg_attr(target_os = "macos", link_name = "__stderrp")]
    static mut stderr: *mut libc::FILE;
}

macro_rules! symbol {
    ($name:ident) => {
        (
            unsafe { CStr::from_bytes_with_nul_unchecked(concat!(stringify!($name), "\0").as_bytes()) },
            $name as usize as *const c_void,
        )
    };
}

/// Address bindings for every prototype in the builtin header that refers
/// to a host symbol.
pub(crate) fn builtin_symbols() -> Vec<(&'static CStr, *const c_void)> {
    use crate::invocation::{
        ddog_interceptor_get_current_invocation, ddog_invocation_context_get_depth,
        ddog_invocation_context_get_listener_function_data,
        ddog_invocation_context_get_listener_invocation_data,
        ddog_invocation_context_get_listener_thread_data,
        ddog_invocation_context_get_nth_argument, ddog_invocation_context_get_replacement_data,
        ddog_invocation_context_get_return_address, ddog_invocation_context_get_return_value,
        ddog_invocation_context_get_thread_id, ddog_invocation_context_replace_nth_argument,
        ddog_invocation_context_replace_return_value,
    };
    use libc::{
        fflush, fprintf, fputs, memcpy, memmove, printf, puts, strchr, strcmp, strlen, strrchr,
        strstr,
    };
    use crate::runtime::{
        ddog_alloc, ddog_alloc0, ddog_atomic_int_add, ddog_atomic_pointer_add, ddog_cond_broadcast,
        ddog_cond_clear, ddog_cond_init, ddog_cond_signal, ddog_cond_wait, ddog_free, ddog_memdup,
        ddog_mutex_clear, ddog_mutex_init, ddog_mutex_lock, ddog_mutex_trylock, ddog_mutex_unlock,
        ddog_realloc, ddog_strdup_printf, ddog_thread_join, ddog_thread_new, ddog_thread_ref,
        ddog_thread_unref, ddog_thread_yield,
    };

    vec![
        symbol!(strlen),
        symbol!(strcmp),
        symbol!(strstr),
        symbol!(strchr),
        symbol!(strrchr),
        symbol!(memcpy),
        symbol!(memmove),
        symbol!(puts),
        symbol!(fputs),
        symbol!(fflush),
        symbol!(printf),
        symbol!(fprintf),
        // The module-side externs resolve to the host's FILE* variables.
        (c"stdout", unsafe { ptr::addr_of!(stdout) } as *const c_void),
        (c"stderr", unsafe { ptr::addr_of!(stderr) } as *const c_void),
        symbol!(ddog_alloc),
        symbol!(ddog_alloc0),
        symbol!(ddog_realloc),
        symbol!(ddog_memdup),
        symbol!(ddog_free),
        symbol!(ddog_strdup_printf),
        symbol!(ddog_thread_new),
        symbol!(ddog_thread_join),
        symbol!(ddog_thread_ref),
        symbol!(ddog_thread_unref),
        symbol!(ddog_thread_yield),
        symbol!(ddog_mutex_init),
        symbol!(ddog_mutex_clear),
        symbol!(ddog_mutex_lock),
        symbol!(ddog_mutex_unlock),
        symbol!(ddog_mutex_trylock),
        symbol!(ddog_cond_init),
        symbol!(ddog_cond_clear),
        symbol!(ddog_cond_wait),
        symbol!(ddog_cond_signal),
        symbol!(ddog_cond_broadcast),
        symbol!(ddog_atomic_int_add),
        symbol!(ddog_atomic_pointer_add),
        symbol!(ddog_interceptor_get_current_invocation),
        symbol!(ddog_invocation_context_get_nth_argument),
        symbol!(ddog_invocation_context_replace_nth_argument),
        symbol!(ddog_invocation_context_get_return_value),
        symbol!(ddog_invocation_context_replace_return_value),
        symbol!(ddog_invocation_context_get_return_address),
        symbol!(ddog_invocation_context_get_thread_id),
        symbol!(ddog_invocation_context_get_depth),
        symbol!(ddog_invocation_context_get_listener_thread_data),
        symbol!(ddog_invocation_context_get_listener_function_data),
        symbol!(ddog_invocation_context_get_listener_invocation_data),
        symbol!(ddog_invocation_context_get_replacement_data),
    ]
}
