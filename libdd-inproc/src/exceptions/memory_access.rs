// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Single-instruction fault classification.
//!
//! Given the faulting PC, disassemble exactly one instruction and decide
//! whether it was reading or writing memory. Precision on write-vs-read
//! matters because hardened handlers discriminate by operation; anything
//! unrecognized therefore classifies as a read, which minimizes false
//! writes. Runs in async-signal context: the disassembler state is
//! self-contained and lives only for the duration of one classification.

use super::MemoryOperation;
use crate::cpu_context::CpuContext;
use capstone::prelude::*;
use capstone::InsnDetail;
use libc::c_void;

/// Number of bytes fed to the decoder; enough for the longest instruction
/// on every supported architecture.
const DECODE_WINDOW: usize = 16;

pub(super) fn classify(address: *const c_void, context: &CpuContext) -> MemoryOperation {
    check_mem_operation(address, context).unwrap_or(MemoryOperation::Read)
}

fn check_mem_operation(address: *const c_void, context: &CpuContext) -> Option<MemoryOperation> {
    let cs = open_disassembler(context).ok()?;

    // SAFETY: the caller hands us the PC of a thread that was just executing
    // at `address`, so at least one instruction is mapped there.
    let code = unsafe { std::slice::from_raw_parts(address as *const u8, DECODE_WINDOW) };
    let insns = cs.disasm_count(code, address as u64, 1).ok()?;
    let insn = insns.iter().next()?;
    let detail = cs.insn_detail(insn).ok()?;

    Some(check_decoded(insn.id().0, &detail))
}

#[cfg(target_arch = "x86")]
fn open_disassembler(_context: &CpuContext) -> CsResult<Capstone> {
    Capstone::new()
        .x86()
        .mode(arch::x86::ArchMode::Mode32)
        .detail(true)
        .build()
}

#[cfg(target_arch = "x86_64")]
fn open_disassembler(_context: &CpuContext) -> CsResult<Capstone> {
    Capstone::new()
        .x86()
        .mode(arch::x86::ArchMode::Mode64)
        .detail(true)
        .build()
}

#[cfg(target_arch = "arm")]
fn open_disassembler(context: &CpuContext) -> CsResult<Capstone> {
    // PSR T bit decides between the two instruction sets.
    const PSR_T_BIT: u32 = 1 << 5;
    let mode = if context.cpsr & PSR_T_BIT != 0 {
        arch::arm::ArchMode::Thumb
    } else {
        arch::arm::ArchMode::Arm
    };
    Capstone::new().arm().mode(mode).detail(true).build()
}

#[cfg(target_arch = "aarch64")]
fn open_disassembler(_context: &CpuContext) -> CsResult<Capstone> {
    Capstone::new()
        .arm64()
        .mode(arch::arm64::ArchMode::Arm)
        .detail(true)
        .build()
}

#[cfg(not(any(
    target_arch = "x86",
    target_arch = "x86_64",
    target_arch = "arm",
    target_arch = "aarch64"
)))]
fn open_disassembler(_context: &CpuContext) -> CsResult<Capstone> {
    Err(capstone::Error::CustomError(
        "no disassembler for this architecture",
    ))
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
fn check_decoded(id: u32, detail: &InsnDetail) -> MemoryOperation {
    use capstone::arch::x86::{X86Insn, X86OperandType};
    use capstone::arch::ArchOperand;

    // Opcodes that may have a memory destination; everything else is
    // treated as a read.
    const WRITE_CAPABLE: &[X86Insn] = &[
        X86Insn::X86_INS_CLI,
        X86Insn::X86_INS_STI,
        X86Insn::X86_INS_CLC,
        X86Insn::X86_INS_STC,
        X86Insn::X86_INS_CLAC,
        X86Insn::X86_INS_CLGI,
        X86Insn::X86_INS_CLTS,
        X86Insn::X86_INS_CLWB,
        X86Insn::X86_INS_STAC,
        X86Insn::X86_INS_STGI,
        X86Insn::X86_INS_CPUID,
        X86Insn::X86_INS_MOVNTQ,
        X86Insn::X86_INS_MOVNTDQA,
        X86Insn::X86_INS_MOVNTDQ,
        X86Insn::X86_INS_MOVNTI,
        X86Insn::X86_INS_MOVNTPD,
        X86Insn::X86_INS_MOVNTPS,
        X86Insn::X86_INS_MOVNTSD,
        X86Insn::X86_INS_MOVNTSS,
        X86Insn::X86_INS_VMOVNTDQA,
        X86Insn::X86_INS_VMOVNTDQ,
        X86Insn::X86_INS_VMOVNTPD,
        X86Insn::X86_INS_VMOVNTPS,
        X86Insn::X86_INS_MOVSS,
        X86Insn::X86_INS_MOV,
        X86Insn::X86_INS_MOVAPS,
        X86Insn::X86_INS_MOVAPD,
        X86Insn::X86_INS_MOVZX,
        X86Insn::X86_INS_MOVUPS,
        X86Insn::X86_INS_MOVABS,
        X86Insn::X86_INS_MOVHPD,
        X86Insn::X86_INS_MOVHPS,
        X86Insn::X86_INS_MOVLPD,
        X86Insn::X86_INS_MOVLPS,
        X86Insn::X86_INS_MOVBE,
        X86Insn::X86_INS_MOVSB,
        X86Insn::X86_INS_MOVSD,
        X86Insn::X86_INS_MOVSQ,
        X86Insn::X86_INS_MOVSX,
        X86Insn::X86_INS_MOVSXD,
        X86Insn::X86_INS_MOVSW,
        X86Insn::X86_INS_MOVD,
        X86Insn::X86_INS_MOVQ,
        X86Insn::X86_INS_MOVDQ2Q,
        X86Insn::X86_INS_RDRAND,
        X86Insn::X86_INS_RDSEED,
        X86Insn::X86_INS_RDMSR,
        X86Insn::X86_INS_RDPMC,
        X86Insn::X86_INS_RDTSC,
        X86Insn::X86_INS_RDTSCP,
        X86Insn::X86_INS_CRC32,
        X86Insn::X86_INS_SHA1MSG1,
        X86Insn::X86_INS_SHA1MSG2,
        X86Insn::X86_INS_SHA1NEXTE,
        X86Insn::X86_INS_SHA1RNDS4,
        X86Insn::X86_INS_SHA256MSG1,
        X86Insn::X86_INS_SHA256MSG2,
        X86Insn::X86_INS_SHA256RNDS2,
        X86Insn::X86_INS_AESDECLAST,
        X86Insn::X86_INS_AESDEC,
        X86Insn::X86_INS_AESENCLAST,
        X86Insn::X86_INS_AESENC,
        X86Insn::X86_INS_AESIMC,
        X86Insn::X86_INS_AESKEYGENASSIST,
        X86Insn::X86_INS_PACKSSDW,
        X86Insn::X86_INS_PACKSSWB,
        X86Insn::X86_INS_PACKUSWB,
        X86Insn::X86_INS_XCHG,
        X86Insn::X86_INS_CLD,
        X86Insn::X86_INS_STD,
    ];

    if !WRITE_CAPABLE.iter().any(|&i| i as u32 == id) {
        return MemoryOperation::Read;
    }

    let operands = detail.arch_detail().operands();
    let op_type = |n: usize| {
        operands.get(n).map(|op| match op {
            ArchOperand::X86Operand(op) => op.op_type.clone(),
            _ => X86OperandType::Invalid,
        })
    };
    match op_type(0) {
        Some(X86OperandType::Mem(_)) => MemoryOperation::Write,
        _ => MemoryOperation::Read,
    }
}

#[cfg(target_arch = "aarch64")]
fn check_decoded(id: u32, _detail: &InsnDetail) -> MemoryOperation {
    use capstone::arch::arm64::Arm64Insn;

    const LOADS: &[Arm64Insn] = &[
        Arm64Insn::ARM64_INS_LDUR,
        Arm64Insn::ARM64_INS_LDURB,
        Arm64Insn::ARM64_INS_LDRSW,
        Arm64Insn::ARM64_INS_LDRSB,
        Arm64Insn::ARM64_INS_LDRSH,
        Arm64Insn::ARM64_INS_LDR,
        Arm64Insn::ARM64_INS_LDURSW,
        Arm64Insn::ARM64_INS_LDP,
        Arm64Insn::ARM64_INS_LDNP,
        Arm64Insn::ARM64_INS_LDPSW,
        Arm64Insn::ARM64_INS_LDRH,
        Arm64Insn::ARM64_INS_LDRB,
        Arm64Insn::ARM64_INS_LDRAA,
        Arm64Insn::ARM64_INS_LDRAB,
    ];
    const STORES: &[Arm64Insn] = &[
        Arm64Insn::ARM64_INS_STRB,
        Arm64Insn::ARM64_INS_STURB,
        Arm64Insn::ARM64_INS_STUR,
        Arm64Insn::ARM64_INS_STR,
        Arm64Insn::ARM64_INS_STP,
        Arm64Insn::ARM64_INS_STNP,
        Arm64Insn::ARM64_INS_STXR,
        Arm64Insn::ARM64_INS_STXRH,
        Arm64Insn::ARM64_INS_STLXRH,
        Arm64Insn::ARM64_INS_STXRB,
    ];

    if LOADS.iter().any(|&i| i as u32 == id) {
        MemoryOperation::Read
    } else if STORES.iter().any(|&i| i as u32 == id) {
        MemoryOperation::Write
    } else {
        MemoryOperation::Read
    }
}

#[cfg(target_arch = "arm")]
fn check_decoded(id: u32, _detail: &InsnDetail) -> MemoryOperation {
    use capstone::arch::arm::ArmInsn;

    const LOADS: &[ArmInsn] = &[
        ArmInsn::ARM_INS_LDREX,
        ArmInsn::ARM_INS_LDREXB,
        ArmInsn::ARM_INS_LDREXD,
        ArmInsn::ARM_INS_LDREXH,
        ArmInsn::ARM_INS_LDR,
        ArmInsn::ARM_INS_LDRD,
        ArmInsn::ARM_INS_LDRB,
        ArmInsn::ARM_INS_LDRBT,
        ArmInsn::ARM_INS_LDRH,
        ArmInsn::ARM_INS_LDRHT,
        ArmInsn::ARM_INS_LDRSB,
        ArmInsn::ARM_INS_LDRSBT,
        ArmInsn::ARM_INS_LDRSH,
        ArmInsn::ARM_INS_LDRSHT,
        ArmInsn::ARM_INS_LDRT,
    ];
    const STORES: &[ArmInsn] = &[
        ArmInsn::ARM_INS_STREX,
        ArmInsn::ARM_INS_STREXB,
        ArmInsn::ARM_INS_STREXD,
        ArmInsn::ARM_INS_STREXH,
        ArmInsn::ARM_INS_STR,
        ArmInsn::ARM_INS_STRB,
        ArmInsn::ARM_INS_STRD,
        ArmInsn::ARM_INS_STRBT,
        ArmInsn::ARM_INS_STRH,
        ArmInsn::ARM_INS_STRHT,
        ArmInsn::ARM_INS_STRT,
    ];

    if LOADS.iter().any(|&i| i as u32 == id) {
        MemoryOperation::Read
    } else if STORES.iter().any(|&i| i as u32 == id) {
        MemoryOperation::Write
    } else {
        MemoryOperation::Read
    }
}

#[cfg(not(any(
    target_arch = "x86",
    target_arch = "x86_64",
    target_arch = "arm",
    target_arch = "aarch64"
)))]
fn check_decoded(_id: u32, _detail: &InsnDetail) -> MemoryOperation {
    MemoryOperation::Read
}
