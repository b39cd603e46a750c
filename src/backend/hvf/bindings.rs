//! Raw FFI bindings to Hypervisor.framework.
//!
//! Only the calls the HVF backend makes are declared here.
//!
//! ## References
//!
//! - https://developer.apple.com/documentation/hypervisor

#![allow(non_camel_case_types)]

use std::ffi::c_void;

// Link against Hypervisor.framework
#[link(name = "Hypervisor", kind = "framework")]
extern "C" {
    // VM Management
    pub fn hv_vm_create(flags: hv_vm_options_t) -> hv_return_t;
    pub fn hv_vm_destroy() -> hv_return_t;
    pub fn hv_vm_map(
        uva: *mut c_void,
        gpa: hv_gpaddr_t,
        size: usize,
        flags: hv_memory_flags_t,
    ) -> hv_return_t;
    pub fn hv_vm_unmap(gpa: hv_gpaddr_t, size: usize) -> hv_return_t;

    // vCPU Management (x86_64)
    #[cfg(target_arch = "x86_64")]
    pub fn hv_vcpu_create(vcpu: *mut hv_vcpuid_t, flags: hv_vcpu_options_t) -> hv_return_t;

    #[cfg(target_arch = "x86_64")]
    pub fn hv_vcpu_destroy(vcpu: hv_vcpuid_t) -> hv_return_t;

    #[cfg(target_arch = "x86_64")]
    pub fn hv_vcpu_run(vcpu: hv_vcpuid_t) -> hv_return_t;

    #[cfg(target_arch = "x86_64")]
    pub fn hv_vcpu_interrupt(vcpus: *const hv_vcpuid_t, count: u32) -> hv_return_t;

    #[cfg(target_arch = "x86_64")]
    pub fn hv_vcpu_read_register(
        vcpu: hv_vcpuid_t,
        reg: hv_x86_reg_t,
        value: *mut u64,
    ) -> hv_return_t;

    #[cfg(target_arch = "x86_64")]
    pub fn hv_vcpu_write_register(
        vcpu: hv_vcpuid_t,
        reg: hv_x86_reg_t,
        value: u64,
    ) -> hv_return_t;

    // VMCS access (x86_64)
    #[cfg(target_arch = "x86_64")]
    pub fn hv_vmx_vcpu_read_vmcs(
        vcpu: hv_vcpuid_t,
        field: u32,
        value: *mut u64,
    ) -> hv_return_t;

    #[cfg(target_arch = "x86_64")]
    pub fn hv_vmx_vcpu_write_vmcs(
        vcpu: hv_vcpuid_t,
        field: u32,
        value: u64,
    ) -> hv_return_t;

    // vCPU Management (ARM64)
    #[cfg(target_arch = "aarch64")]
    pub fn hv_vcpu_create(
        vcpu: *mut hv_vcpu_t,
        exit: *mut *mut hv_vcpu_exit_t,
        config: hv_vcpu_config_t,
    ) -> hv_return_t;

    #[cfg(target_arch = "aarch64")]
    pub fn hv_vcpu_destroy(vcpu: hv_vcpu_t) -> hv_return_t;

    #[cfg(target_arch = "aarch64")]
    pub fn hv_vcpu_run(vcpu: hv_vcpu_t) -> hv_return_t;

    #[cfg(target_arch = "aarch64")]
    pub fn hv_vcpus_exit(vcpus: *const hv_vcpu_t, count: u32) -> hv_return_t;

    #[cfg(target_arch = "aarch64")]
    pub fn hv_vcpu_get_reg(vcpu: hv_vcpu_t, reg: hv_reg_t, value: *mut u64) -> hv_return_t;

    #[cfg(target_arch = "aarch64")]
    pub fn hv_vcpu_set_reg(vcpu: hv_vcpu_t, reg: hv_reg_t, value: u64) -> hv_return_t;

    // vCPU configuration (ARM64)
    #[cfg(target_arch = "aarch64")]
    pub fn hv_vcpu_config_create() -> hv_vcpu_config_t;
}

// Basic types
pub type hv_return_t = i32;
pub type hv_gpaddr_t = u64;
pub type hv_vm_options_t = u64;
pub type hv_memory_flags_t = u64;

// x86_64 specific types
#[cfg(target_arch = "x86_64")]
pub type hv_vcpuid_t = u32;
#[cfg(target_arch = "x86_64")]
pub type hv_vcpu_options_t = u64;
#[cfg(target_arch = "x86_64")]
pub type hv_x86_reg_t = u32;

// ARM64 specific types
#[cfg(target_arch = "aarch64")]
pub type hv_vcpu_t = u64;
#[cfg(target_arch = "aarch64")]
pub type hv_vcpu_config_t = *mut c_void;
#[cfg(target_arch = "aarch64")]
pub type hv_reg_t = u32;

// ARM64 exit info
#[cfg(target_arch = "aarch64")]
#[repr(C)]
pub struct hv_vcpu_exit_t {
    pub reason: hv_exit_reason_t,
    pub exception: hv_vcpu_exit_exception_t,
}

#[cfg(target_arch = "aarch64")]
pub type hv_exit_reason_t = u32;

#[cfg(target_arch = "aarch64")]
#[repr(C)]
pub struct hv_vcpu_exit_exception_t {
    pub syndrome: u64,
    pub virtual_address: u64,
    pub physical_address: u64,
}

// Return codes
pub const HV_SUCCESS: hv_return_t = 0;
pub const HV_ERROR: hv_return_t = 0xfae94001_u32 as i32;
pub const HV_BUSY: hv_return_t = 0xfae94002_u32 as i32;
pub const HV_BAD_ARGUMENT: hv_return_t = 0xfae94003_u32 as i32;
pub const HV_NO_RESOURCES: hv_return_t = 0xfae94005_u32 as i32;
pub const HV_NO_DEVICE: hv_return_t = 0xfae94006_u32 as i32;
pub const HV_DENIED: hv_return_t = 0xfae94007_u32 as i32;
pub const HV_UNSUPPORTED: hv_return_t = 0xfae9400f_u32 as i32;

// VM options
pub const HV_VM_DEFAULT: hv_vm_options_t = 0;

// vCPU options
#[cfg(target_arch = "x86_64")]
pub const HV_VCPU_DEFAULT: hv_vcpu_options_t = 0;

// Memory flags
pub const HV_MEMORY_READ: hv_memory_flags_t = 1 << 0;
pub const HV_MEMORY_WRITE: hv_memory_flags_t = 1 << 1;
pub const HV_MEMORY_EXEC: hv_memory_flags_t = 1 << 2;

// x86_64 registers
#[cfg(target_arch = "x86_64")]
pub mod x86_reg {
    use super::hv_x86_reg_t;

    pub const HV_X86_RIP: hv_x86_reg_t = 0;
    pub const HV_X86_RFLAGS: hv_x86_reg_t = 1;
    pub const HV_X86_RAX: hv_x86_reg_t = 2;
    pub const HV_X86_RCX: hv_x86_reg_t = 3;
    pub const HV_X86_RDX: hv_x86_reg_t = 4;
    pub const HV_X86_RBX: hv_x86_reg_t = 5;
    pub const HV_X86_RSI: hv_x86_reg_t = 6;
    pub const HV_X86_RDI: hv_x86_reg_t = 7;
    pub const HV_X86_RSP: hv_x86_reg_t = 8;
    pub const HV_X86_RBP: hv_x86_reg_t = 9;
    pub const HV_X86_R8: hv_x86_reg_t = 10;
    pub const HV_X86_R9: hv_x86_reg_t = 11;
    pub const HV_X86_R10: hv_x86_reg_t = 12;
    pub const HV_X86_R11: hv_x86_reg_t = 13;
    pub const HV_X86_R12: hv_x86_reg_t = 14;
    pub const HV_X86_R13: hv_x86_reg_t = 15;
    pub const HV_X86_R14: hv_x86_reg_t = 16;
    pub const HV_X86_R15: hv_x86_reg_t = 17;
    pub const HV_X86_CR0: hv_x86_reg_t = 36;
    pub const HV_X86_CR4: hv_x86_reg_t = 40;
}

// x86_64 VMCS fields
#[cfg(target_arch = "x86_64")]
pub mod vmcs {
    // Guest state
    pub const VMCS_GUEST_CS_SELECTOR: u32 = 0x00000802;
    pub const VMCS_GUEST_CS_BASE: u32 = 0x00006808;
    pub const VMCS_GUEST_CS_LIMIT: u32 = 0x00004802;
    pub const VMCS_GUEST_CS_AR: u32 = 0x00004816;
    pub const VMCS_GUEST_SS_SELECTOR: u32 = 0x00000804;
    pub const VMCS_GUEST_DS_SELECTOR: u32 = 0x00000806;
    pub const VMCS_GUEST_ES_SELECTOR: u32 = 0x00000800;
    pub const VMCS_GUEST_FS_SELECTOR: u32 = 0x00000808;
    pub const VMCS_GUEST_GS_SELECTOR: u32 = 0x0000080A;

    // Exit info
    pub const VMCS_RO_EXIT_REASON: u32 = 0x00004402;
    pub const VMCS_RO_EXIT_QUALIFIC: u32 = 0x00006400;
    pub const VMCS_RO_INSTR_LEN: u32 = 0x0000440C;
    pub const VMCS_GUEST_PHYSICAL_ADDRESS: u32 = 0x00002400;
}

// ARM64 exit reasons
#[cfg(target_arch = "aarch64")]
pub mod arm64_exit {
    use super::hv_exit_reason_t;

    pub const HV_EXIT_REASON_CANCELED: hv_exit_reason_t = 0;
    pub const HV_EXIT_REASON_EXCEPTION: hv_exit_reason_t = 1;
    pub const HV_EXIT_REASON_VTIMER_ACTIVATED: hv_exit_reason_t = 2;
}

// ARM64 registers beyond x0..x30, which map one to one
#[cfg(target_arch = "aarch64")]
pub mod arm64_reg {
    use super::hv_reg_t;

    pub const HV_REG_PC: hv_reg_t = 31;
    pub const HV_REG_CPSR: hv_reg_t = 34;
}

/// Convert HVF return code to a human-readable string.
pub fn hv_return_string(code: hv_return_t) -> &'static str {
    match code {
        HV_SUCCESS => "Success",
        HV_ERROR => "Error",
        HV_BUSY => "Busy",
        HV_BAD_ARGUMENT => "Bad argument",
        HV_NO_RESOURCES => "No resources",
        HV_NO_DEVICE => "No device",
        HV_DENIED => "Denied (missing entitlement?)",
        HV_UNSUPPORTED => "Unsupported",
        _ => "Unknown error",
    }
}

/// Convert an HVF return code to a backend result, keeping the code.
#[inline]
pub fn hv_check(code: hv_return_t) -> Result<(), hv_return_t> {
    if code == HV_SUCCESS {
        Ok(())
    } else {
        Err(code)
    }
}
