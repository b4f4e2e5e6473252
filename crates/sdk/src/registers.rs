//! Register sets handed to observers
//!
//! A `RegisterSet` is the dispatcher's mutable view of the CPU state at
//! the interception point. Observers may rewrite any field; the
//! dispatcher writes integer registers back unconditionally and float
//! registers only when they differ from the recorded originals.

/// Register view for a 64-bit interception point.
#[derive(Clone, Copy, Debug, Default)]
pub struct RegisterSet64 {
    /// Address of the hooked function (informational, not written back).
    pub rip: u64,
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbp: u64,
    /// Stack pointer of the intercepted frame, pointing at the return
    /// address slot. Writing it has no effect.
    pub rsp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    /// Low quadwords of Xmm0-Xmm3.
    pub xmm: [f64; 4],
    /// Values of `xmm` as loaded; slots that still compare equal at
    /// save time are not written back.
    pub original_xmm: [f64; 4],
}

impl RegisterSet64 {
    /// Set the integer return register.
    pub fn set_return_value(&mut self, value: u64) {
        self.rax = value;
    }
}

/// Register view for a 32-bit interception point.
#[derive(Clone, Copy, Debug, Default)]
pub struct RegisterSet32 {
    pub eip: u32,
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub ebp: u32,
    pub esp: u32,
    pub esi: u32,
    pub edi: u32,
    /// Top of the x87 stack.
    pub st0: f64,
    /// `st0` as loaded; written back only when changed.
    pub original_st0: f64,
    /// Stack alignment adjustment recorded by the template.
    pub alignment: u32,
}

impl RegisterSet32 {
    pub fn set_return_value(&mut self, value: u32) {
        self.eax = value;
    }
}

#[cfg(target_pointer_width = "64")]
pub type RegisterSet = RegisterSet64;

#[cfg(target_pointer_width = "32")]
pub type RegisterSet = RegisterSet32;
