//! Register save areas written by the trampoline templates
//!
//! Layout matches the template's store order byte for byte so the
//! dispatcher can overlay these structs directly on the captured stack
//! pointer. Changing a field here without changing the template breaks
//! every installed hook.

/// XMM register (128-bit SIMD)
#[repr(C, align(16))]
#[derive(Clone, Copy, Default)]
pub struct Xmm {
    pub data: [u8; 16],
}

impl Xmm {
    /// Interpret the low quadword as a double
    pub fn as_f64(&self) -> f64 {
        let bytes: [u8; 8] = match self.data[0..8].try_into() {
            Ok(b) => b,
            Err(_) => return 0.0,
        };
        f64::from_le_bytes(bytes)
    }

    /// Store a double into the low quadword, zeroing the high one
    pub fn set_f64(&mut self, value: f64) {
        self.data[0..8].copy_from_slice(&value.to_le_bytes());
        self.data[8..16].fill(0);
    }
}

impl std::fmt::Debug for Xmm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Xmm({:02x?})", &self.data[..])
    }
}

/// Total size of the 64-bit save area, including the shadow space the
/// dispatcher call consumes and the unused reserve at the top.
pub const SAVED_FRAME64_SIZE: usize = 0x228;

/// Total size of the 32-bit save area.
pub const SAVED_FRAME32_SIZE: usize = 0x28;

/// 64-bit save area.
///
/// The template allocates `SAVED_FRAME64_SIZE` bytes below the return
/// address, stores the volatile GPRs starting at +0x20 (the first 0x20
/// bytes double as the callee shadow space) and Xmm0-Xmm3 at +0xA0.
/// The XMM slots are plain byte arrays: the template guarantees the
/// frame base is 16-aligned at runtime, but the struct itself must not
/// grow tail padding, so it stays 8-aligned.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct SavedFrame64 {
    pub shadow: [u64; 4],
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    _pad: [u8; 0x28],
    pub xmm: [[u8; 16]; 4],
    _reserve: [u8; 0x148],
}

impl SavedFrame64 {
    pub fn zeroed() -> Self {
        // All-zero is a valid value for every field.
        unsafe { std::mem::zeroed() }
    }
}

/// 32-bit save area.
///
/// The template pushes EAX..EDI (EAX first, so it lands highest), then
/// reserves 12 bytes for st0 and the alignment word. Bit 31 of
/// `alignment` is set by the dispatcher when an observer changed st0 and
/// the template must reload it.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct SavedFrame32 {
    pub alignment: u32,
    pub st0: [u8; 8],
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub edx: u32,
    pub ecx: u32,
    pub ebx: u32,
    pub eax: u32,
}

impl SavedFrame32 {
    pub fn zeroed() -> Self {
        unsafe { std::mem::zeroed() }
    }

    /// Flag checked by the template's restore path before reloading st0.
    pub const ST0_MODIFIED: u32 = 0x8000_0000;

    pub fn st0_f64(&self) -> f64 {
        f64::from_le_bytes(self.st0)
    }

    pub fn set_st0_f64(&mut self, value: f64) {
        self.st0 = value.to_le_bytes();
    }
}
