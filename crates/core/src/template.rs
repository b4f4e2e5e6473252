//! Trampoline machine-code templates
//!
//! One immutable template per architecture, built once per process as a
//! byte vector. Per-hook constants are represented by sentinel words
//! whose bit patterns cannot occur in legitimate code
//! (`0xFFDDFF01..=0xFFDDFF10` on x86, the `0xFFDDFFDDFFDDFFxx`
//! zero-extension on x86-64); the trampoline writer sweeps the copied
//! template and replaces each sentinel with the concrete value it names.
//! A terminator sentinel marks the end of the executable part.
//!
//! Control flow of the instantiated template:
//!
//! 1. NOP slide, then save all volatile registers below the stack.
//! 2. Consult the flags word: disabled or uninstalled hooks restore and
//!    jump straight to the relocated prologue.
//! 3. Bump the usage counter and call the PreCall dispatcher.
//! 4. On `1` restore and enter the relocated prologue (the return slot
//!    now holds the after-call mark); on `0` additionally drop the
//!    counter; on `0x80000000|n` drop the counter, restore and return,
//!    popping `n` bytes on x86.
//! 5. The body's own `ret` lands just past the after-call-mark sentinel:
//!    push a slot for the real return address, save registers, call the
//!    PostCall dispatcher, store its result into the slot, restore, drop
//!    the counter and return through the slot.

use std::sync::LazyLock;

/// Per-hook constants the trampoline writer patches in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Sentinel {
    UsageCounter = 0x01,
    FlagsWord = 0x02,
    Engine = 0x03,
    Entry = 0x04,
    PreCall = 0x05,
    PostCall = 0x06,
    /// Start of the reserved block receiving the relocated prologue and
    /// its tail jump.
    Stub = 0x07,
    /// The address just past this sentinel is the forged return address.
    AfterCallMark = 0x08,
    /// x86 only: stack bytes skipped at the after-call mark so the
    /// template's own frame cannot clobber argument words PostCall still
    /// needs to restore.
    StackPreserve = 0x09,
    /// x86 only: `ret imm16` operand of the skip-call path.
    StackPreserve2 = 0x10,
}

const TERMINATOR: u8 = 0xFF;

/// Length of the NOP slide opening every template; checked on uninstall
/// to detect a second engine having hooked the trampoline itself.
pub const NOP_SLIDE: usize = 8;

/// Bytes reserved for the relocated prologue inside the template.
pub const STUB_RESERVE: usize = 64;

/// Tail jump emitted after the relocated prologue: `JMP [RIP]` plus the
/// absolute target on 64-bit, `JMP rel32` on 32-bit.
pub fn tail_jump_len(word: usize) -> usize {
    if word == 8 {
        6 + 8
    } else {
        5
    }
}

/// Total length of the reserved stub block, sentinel included.
pub fn stub_block_len(word: usize) -> usize {
    STUB_RESERVE + tail_jump_len(word)
}

/// Sentinel bit pattern as a `word`-wide little-endian value.
pub fn sentinel_value(word: usize, s: u8) -> u64 {
    if word == 8 {
        0xFFDD_FFDD_FFDD_FF00 | s as u64
    } else {
        0xFFDD_FF00 | s as u64
    }
}

/// One architecture's template, measured and padded.
pub struct Template {
    bytes: Vec<u8>,
    /// Measured length (terminator scan) rounded up to 32 bytes.
    base_len: usize,
    /// Machine word width the sentinels are encoded in.
    pub word: usize,
}

impl Template {
    /// Executable part copied into every slot.
    pub fn code(&self) -> &[u8] {
        &self.bytes[..self.base_len]
    }

    pub fn base_len(&self) -> usize {
        self.base_len
    }

    /// Slot bytes needed: template plus the flags word and usage counter
    /// appended behind the executable part.
    pub fn raw_slot_len(&self) -> usize {
        self.base_len + 2 * self.word
    }
}

/// Stack bytes the x86 after-call path skips before building its frame:
/// the callee-popped argument area rounded up to a word, plus four words
/// of slack (a fixed dummy when the pop count is unknown).
pub fn calc_stack_preserve(word: usize, stack_return_size: Option<u32>) -> usize {
    let align = |n: usize| (n + word - 1) & !(word - 1);
    let base = match stack_return_size {
        Some(n) => align(n as usize),
        None => 4 * word,
    };
    base + 4 * word
}

static TEMPLATE_X64: LazyLock<Template> = LazyLock::new(build_template_x64);
static TEMPLATE_X86: LazyLock<Template> = LazyLock::new(build_template_x86);

pub fn template_x64() -> &'static Template {
    &TEMPLATE_X64
}

pub fn template_x86() -> &'static Template {
    &TEMPLATE_X86
}

/// Template matching the architecture this engine is compiled for.
#[cfg(target_arch = "x86_64")]
pub fn native() -> &'static Template {
    template_x64()
}

#[cfg(target_arch = "x86")]
pub fn native() -> &'static Template {
    template_x86()
}

/// Minimal emitter: bytes plus rel32 fixups resolved at the end.
struct Asm {
    buf: Vec<u8>,
    fixups: Vec<(usize, &'static str)>,
    labels: Vec<(&'static str, usize)>,
}

impl Asm {
    fn new() -> Self {
        Self {
            buf: Vec::with_capacity(1024),
            fixups: Vec::new(),
            labels: Vec::new(),
        }
    }

    fn emit(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn sentinel(&mut self, word: usize, s: Sentinel) {
        let v = sentinel_value(word, s as u8);
        self.buf.extend_from_slice(&v.to_le_bytes()[..word]);
    }

    fn terminator(&mut self, word: usize) {
        let v = sentinel_value(word, TERMINATOR);
        self.buf.extend_from_slice(&v.to_le_bytes()[..word]);
    }

    fn label(&mut self, name: &'static str) {
        self.labels.push((name, self.buf.len()));
    }

    /// `0F 8x rel32` conditional jump to a label.
    fn jcc(&mut self, cc: u8, target: &'static str) {
        self.emit(&[0x0F, cc]);
        self.fixups.push((self.buf.len(), target));
        self.emit(&[0; 4]);
    }

    /// `E9 rel32` jump to a label.
    fn jmp(&mut self, target: &'static str) {
        self.emit(&[0xE9]);
        self.fixups.push((self.buf.len(), target));
        self.emit(&[0; 4]);
    }

    fn finish(mut self) -> Vec<u8> {
        for (pos, name) in &self.fixups {
            let target = self
                .labels
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, off)| *off)
                .unwrap_or_else(|| panic!("undefined template label {name}"));
            let rel = target as i64 - (*pos as i64 + 4);
            self.buf[*pos..*pos + 4].copy_from_slice(&(rel as i32).to_le_bytes());
        }
        self.buf
    }
}

fn seal(mut bytes: Vec<u8>, word: usize) -> Template {
    // Measure to the terminator, round up to a 32-byte boundary and pad
    // so the writer can copy the rounded length in one go.
    let term = sentinel_value(word, TERMINATOR).to_le_bytes();
    let term = &term[..word];
    let len = bytes
        .windows(word)
        .position(|w| w == term)
        .unwrap_or_else(|| panic!("template lacks terminator"));
    let base_len = (len + 31) & !31;
    while bytes.len() < base_len {
        bytes.push(0xCC);
    }
    bytes.truncate(base_len.max(bytes.len()));
    Template {
        bytes,
        base_len,
        word,
    }
}

/// 64-bit template. Register save layout: GPRs at +0x20..+0x78,
/// Xmm0-Xmm3 at +0xA0, frame size 0x228 (the low 0x20 bytes double as
/// the dispatcher call's shadow space).
fn build_template_x64() -> Template {
    const W: usize = 8;
    let mut a = Asm::new();

    // NOP slide, checked on uninstall.
    a.emit(&[0x90; NOP_SLIDE]);

    // Build the save frame.
    a.emit(&[0x48, 0x81, 0xEC, 0x28, 0x02, 0x00, 0x00]); // sub rsp, 0x228
    emit_save64(&mut a);

    // Consult the flags word; parked hooks bypass the dispatcher.
    a.emit(&[0x49, 0xBB]); // mov r11, flags_word_addr
    a.sentinel(W, Sentinel::FlagsWord);
    a.emit(&[0x41, 0x80, 0x7B, 0x01, 0x00]); // cmp byte [r11+1], 0  (uninstalled)
    a.jcc(0x85, "restore_enter_stub"); // jne
    a.emit(&[0x41, 0x80, 0x3B, 0x00]); // cmp byte [r11], 0  (disabled)
    a.jcc(0x85, "restore_enter_stub"); // jne

    // Live call: bump the usage counter and ask the dispatcher.
    a.emit(&[0x49, 0xBB]); // mov r11, usage_counter_addr
    a.sentinel(W, Sentinel::UsageCounter);
    a.emit(&[0xF0, 0x49, 0xFF, 0x03]); // lock inc qword [r11]
    emit_dispatch_call64(&mut a, Sentinel::PreCall);

    a.emit(&[0x83, 0xF8, 0x01]); // cmp eax, 1
    a.jcc(0x84, "restore_enter_stub"); // je: continue into the body
    a.emit(&[0x85, 0xC0]); // test eax, eax
    a.jcc(0x88, "skip_call"); // js: high bit set, synthesise a return

    // Ignore: no PostCall will come, drop the counter here.
    a.emit(&[0x49, 0xBB]);
    a.sentinel(W, Sentinel::UsageCounter);
    a.emit(&[0xF0, 0x49, 0xFF, 0x0B]); // lock dec qword [r11]
    a.jmp("restore_enter_stub");

    // Skip: the dispatcher already wrote the synthesised registers; both
    // 64-bit ABIs are caller-clean so a plain ret suffices.
    a.label("skip_call");
    a.emit(&[0x49, 0xBB]);
    a.sentinel(W, Sentinel::UsageCounter);
    a.emit(&[0xF0, 0x49, 0xFF, 0x0B]); // lock dec qword [r11]
    emit_restore64(&mut a);
    a.emit(&[0x48, 0x81, 0xC4, 0x28, 0x02, 0x00, 0x00]); // add rsp, 0x228
    a.emit(&[0xC3]); // ret

    a.label("restore_enter_stub");
    emit_restore64(&mut a);
    a.emit(&[0x48, 0x81, 0xC4, 0x28, 0x02, 0x00, 0x00]); // add rsp, 0x228
    a.jmp("stub");

    // Relocated prologue plus tail jump land here.
    a.label("stub");
    a.sentinel(W, Sentinel::Stub);
    let pad = stub_block_len(W) - W;
    a.emit(&vec![0xCC; pad]);

    // The body's ret lands just past this sentinel.
    a.sentinel(W, Sentinel::AfterCallMark);
    a.emit(&[0x6A, 0x00]); // push 0: slot for the real return address
    a.emit(&[0x48, 0x81, 0xEC, 0x28, 0x02, 0x00, 0x00]); // sub rsp, 0x228
    emit_save64(&mut a);
    emit_dispatch_call64(&mut a, Sentinel::PostCall);
    // rax holds the real return address; park it in the pushed slot.
    a.emit(&[0x48, 0x89, 0x84, 0x24, 0x28, 0x02, 0x00, 0x00]); // mov [rsp+0x228], rax
    emit_restore64(&mut a);
    a.emit(&[0x48, 0x81, 0xC4, 0x28, 0x02, 0x00, 0x00]); // add rsp, 0x228
    a.emit(&[0x49, 0xBB]);
    a.sentinel(W, Sentinel::UsageCounter);
    a.emit(&[0xF0, 0x49, 0xFF, 0x0B]); // lock dec qword [r11]
    a.emit(&[0xC3]); // ret through the slot

    a.terminator(W);
    seal(a.finish(), W)
}

fn emit_save64(a: &mut Asm) {
    a.emit(&[
        0x48, 0x89, 0x44, 0x24, 0x20, // mov [rsp+0x20], rax
        0x48, 0x89, 0x5C, 0x24, 0x28, // mov [rsp+0x28], rbx
        0x48, 0x89, 0x4C, 0x24, 0x30, // mov [rsp+0x30], rcx
        0x48, 0x89, 0x54, 0x24, 0x38, // mov [rsp+0x38], rdx
        0x48, 0x89, 0x6C, 0x24, 0x40, // mov [rsp+0x40], rbp
        0x48, 0x89, 0x74, 0x24, 0x48, // mov [rsp+0x48], rsi
        0x48, 0x89, 0x7C, 0x24, 0x50, // mov [rsp+0x50], rdi
        0x4C, 0x89, 0x44, 0x24, 0x58, // mov [rsp+0x58], r8
        0x4C, 0x89, 0x4C, 0x24, 0x60, // mov [rsp+0x60], r9
        0x4C, 0x89, 0x54, 0x24, 0x68, // mov [rsp+0x68], r10
        0x4C, 0x89, 0x5C, 0x24, 0x70, // mov [rsp+0x70], r11
    ]);
    a.emit(&[0x0F, 0x29, 0x84, 0x24, 0xA0, 0x00, 0x00, 0x00]); // movaps [rsp+0xA0], xmm0
    a.emit(&[0x0F, 0x29, 0x8C, 0x24, 0xB0, 0x00, 0x00, 0x00]); // movaps [rsp+0xB0], xmm1
    a.emit(&[0x0F, 0x29, 0x94, 0x24, 0xC0, 0x00, 0x00, 0x00]); // movaps [rsp+0xC0], xmm2
    a.emit(&[0x0F, 0x29, 0x9C, 0x24, 0xD0, 0x00, 0x00, 0x00]); // movaps [rsp+0xD0], xmm3
}

fn emit_restore64(a: &mut Asm) {
    a.emit(&[
        0x48, 0x8B, 0x44, 0x24, 0x20, // mov rax, [rsp+0x20]
        0x48, 0x8B, 0x5C, 0x24, 0x28, // mov rbx, [rsp+0x28]
        0x48, 0x8B, 0x4C, 0x24, 0x30, // mov rcx, [rsp+0x30]
        0x48, 0x8B, 0x54, 0x24, 0x38, // mov rdx, [rsp+0x38]
        0x48, 0x8B, 0x6C, 0x24, 0x40, // mov rbp, [rsp+0x40]
        0x48, 0x8B, 0x74, 0x24, 0x48, // mov rsi, [rsp+0x48]
        0x48, 0x8B, 0x7C, 0x24, 0x50, // mov rdi, [rsp+0x50]
        0x4C, 0x8B, 0x44, 0x24, 0x58, // mov r8, [rsp+0x58]
        0x4C, 0x8B, 0x4C, 0x24, 0x60, // mov r9, [rsp+0x60]
        0x4C, 0x8B, 0x54, 0x24, 0x68, // mov r10, [rsp+0x68]
        0x4C, 0x8B, 0x5C, 0x24, 0x70, // mov r11, [rsp+0x70]
    ]);
    a.emit(&[0x0F, 0x28, 0x84, 0x24, 0xA0, 0x00, 0x00, 0x00]); // movaps xmm0, [rsp+0xA0]
    a.emit(&[0x0F, 0x28, 0x8C, 0x24, 0xB0, 0x00, 0x00, 0x00]); // movaps xmm1, [rsp+0xB0]
    a.emit(&[0x0F, 0x28, 0x94, 0x24, 0xC0, 0x00, 0x00, 0x00]); // movaps xmm2, [rsp+0xC0]
    a.emit(&[0x0F, 0x28, 0x9C, 0x24, 0xD0, 0x00, 0x00, 0x00]); // movaps xmm3, [rsp+0xD0]
}

/// `fn(engine, entry, stack_pointer)` with the platform argument
/// registers; rsp at the call is the frame base.
fn emit_dispatch_call64(a: &mut Asm, target: Sentinel) {
    const W: usize = 8;
    #[cfg(windows)]
    {
        a.emit(&[0x48, 0xB9]); // mov rcx, engine
        a.sentinel(W, Sentinel::Engine);
        a.emit(&[0x48, 0xBA]); // mov rdx, entry
        a.sentinel(W, Sentinel::Entry);
        a.emit(&[0x49, 0x89, 0xE0]); // mov r8, rsp
    }
    #[cfg(not(windows))]
    {
        a.emit(&[0x48, 0xBF]); // mov rdi, engine
        a.sentinel(W, Sentinel::Engine);
        a.emit(&[0x48, 0xBE]); // mov rsi, entry
        a.sentinel(W, Sentinel::Entry);
        a.emit(&[0x48, 0x89, 0xE2]); // mov rdx, rsp
    }
    a.emit(&[0x48, 0xB8]); // mov rax, dispatcher
    a.sentinel(W, target);
    a.emit(&[0xFF, 0xD0]); // call rax
}

/// 32-bit template. Register save layout: alignment word at +0, st0 at
/// +4, EDI..EAX at +0x0C..+0x24 (EAX pushed first), frame size 0x28.
fn build_template_x86() -> Template {
    const W: usize = 4;
    let mut a = Asm::new();

    a.emit(&[0x90; NOP_SLIDE]);

    // EAX doubles as the scratch register for the flag probe; it is
    // saved first so the probe happens before the rest of the frame.
    a.emit(&[0x50]); // push eax
    a.emit(&[0xB8]); // mov eax, flags_word_addr
    a.sentinel(W, Sentinel::FlagsWord);
    a.emit(&[0x80, 0x78, 0x01, 0x00]); // cmp byte [eax+1], 0
    a.jcc(0x85, "bypass"); // jne
    a.emit(&[0x80, 0x38, 0x00]); // cmp byte [eax], 0
    a.jcc(0x85, "bypass"); // jne

    a.emit(&[0xB8]); // mov eax, usage_counter_addr
    a.sentinel(W, Sentinel::UsageCounter);
    a.emit(&[0xF0, 0xFF, 0x00]); // lock inc dword [eax]

    emit_save32(&mut a);
    emit_dispatch_call32(&mut a, Sentinel::PreCall);

    a.emit(&[0x83, 0xF8, 0x01]); // cmp eax, 1
    a.jcc(0x84, "restore_enter_stub"); // je
    a.emit(&[0x85, 0xC0]); // test eax, eax
    a.jcc(0x88, "skip_call"); // js

    // Ignore path: drop the counter, then fall into the shared restore.
    a.emit(&[0xB8]);
    a.sentinel(W, Sentinel::UsageCounter);
    a.emit(&[0xF0, 0xFF, 0x08]); // lock dec dword [eax]

    a.label("restore_enter_stub");
    emit_restore32(&mut a);
    a.jmp("stub");

    // Skip path: emulate the callee's `ret imm16`; the immediate is the
    // per-hook pop count patched over the second preserve sentinel.
    a.label("skip_call");
    a.emit(&[0xB8]);
    a.sentinel(W, Sentinel::UsageCounter);
    a.emit(&[0xF0, 0xFF, 0x08]); // lock dec dword [eax]
    emit_restore32(&mut a);
    a.emit(&[0xC2]); // ret imm16
    a.sentinel(W, Sentinel::StackPreserve2);

    a.label("bypass");
    a.emit(&[0x58]); // pop eax
    a.jmp("stub");

    a.label("stub");
    a.sentinel(W, Sentinel::Stub);
    let pad = stub_block_len(W) - W;
    a.emit(&vec![0xCC; pad]);

    // After-call mark: the dummy slot must sit directly under the caller
    // frame, the preserve gap below it keeps the template frame off the
    // popped argument words PostCall will restore.
    a.sentinel(W, Sentinel::AfterCallMark);
    a.emit(&[0x6A, 0x00]); // push 0
    a.emit(&[0x81, 0xEC]); // sub esp, preserve
    a.sentinel(W, Sentinel::StackPreserve);
    a.emit(&[0x50]); // push eax
    emit_save32(&mut a);
    emit_dispatch_call32(&mut a, Sentinel::PostCall);
    // eax holds the real return address; store it into the dummy slot at
    // [esp + 0x28 + preserve].
    a.emit(&[0x8D, 0x54, 0x24, 0x28]); // lea edx, [esp+0x28]
    a.emit(&[0x81, 0xC2]); // add edx, preserve
    a.sentinel(W, Sentinel::StackPreserve);
    a.emit(&[0x89, 0x02]); // mov [edx], eax
    emit_restore32(&mut a);
    a.emit(&[0x81, 0xC4]); // add esp, preserve
    a.sentinel(W, Sentinel::StackPreserve);
    a.emit(&[0x50]); // push eax
    a.emit(&[0xB8]); // mov eax, usage_counter_addr
    a.sentinel(W, Sentinel::UsageCounter);
    a.emit(&[0xF0, 0xFF, 0x08]); // lock dec dword [eax]
    a.emit(&[0x58]); // pop eax
    a.emit(&[0xC3]); // ret through the slot

    a.terminator(W);
    seal(a.finish(), W)
}

/// EAX is expected to be pushed already; completes the 0x28-byte frame
/// and records st0 plus a zero alignment word.
fn emit_save32(a: &mut Asm) {
    a.emit(&[0x53, 0x51, 0x52, 0x55, 0x56, 0x57]); // push ebx/ecx/edx/ebp/esi/edi
    a.emit(&[0x83, 0xEC, 0x0C]); // sub esp, 12
    a.emit(&[0xDD, 0x54, 0x24, 0x04]); // fst qword [esp+4]
    a.emit(&[0xC7, 0x04, 0x24, 0x00, 0x00, 0x00, 0x00]); // mov dword [esp], 0
}

fn emit_restore32(a: &mut Asm) {
    // Reload st0 only when the dispatcher flagged it as modified.
    a.emit(&[0xF7, 0x04, 0x24, 0x00, 0x00, 0x00, 0x80]); // test dword [esp], 0x80000000
    a.emit(&[0x74, 0x06]); // jz +6
    a.emit(&[0xDD, 0xD8]); // fstp st(0)
    a.emit(&[0xDD, 0x44, 0x24, 0x04]); // fld qword [esp+4]
    a.emit(&[0x83, 0xC4, 0x0C]); // add esp, 12
    a.emit(&[0x5F, 0x5E, 0x5D, 0x5A, 0x59, 0x5B, 0x58]); // pop edi/esi/ebp/edx/ecx/ebx/eax
}

/// `stdcall fn(engine, entry, stack_pointer)`; the pointer passed is the
/// frame base captured before the arguments are pushed.
fn emit_dispatch_call32(a: &mut Asm, target: Sentinel) {
    const W: usize = 4;
    a.emit(&[0x89, 0xE0]); // mov eax, esp
    a.emit(&[0x50]); // push eax (stack_pointer)
    a.emit(&[0x68]); // push entry
    a.sentinel(W, Sentinel::Entry);
    a.emit(&[0x68]); // push engine
    a.sentinel(W, Sentinel::Engine);
    a.emit(&[0xB8]); // mov eax, dispatcher
    a.sentinel(W, target);
    a.emit(&[0xFF, 0xD0]); // call eax
}

#[cfg(test)]
mod tests {
    use super::*;

    fn count_sentinels(t: &Template, s: u8) -> usize {
        let pat = sentinel_value(t.word, s).to_le_bytes();
        let pat = &pat[..t.word];
        t.code().windows(t.word).filter(|w| *w == pat).count()
    }

    #[test]
    fn x64_template_sentinel_inventory() {
        let t = template_x64();
        assert_eq!(t.word, 8);
        // inc + two phase decs + post dec
        assert_eq!(count_sentinels(t, Sentinel::UsageCounter as u8), 4);
        assert_eq!(count_sentinels(t, Sentinel::FlagsWord as u8), 1);
        assert_eq!(count_sentinels(t, Sentinel::Engine as u8), 2);
        assert_eq!(count_sentinels(t, Sentinel::Entry as u8), 2);
        assert_eq!(count_sentinels(t, Sentinel::PreCall as u8), 1);
        assert_eq!(count_sentinels(t, Sentinel::PostCall as u8), 1);
        assert_eq!(count_sentinels(t, Sentinel::Stub as u8), 1);
        assert_eq!(count_sentinels(t, Sentinel::AfterCallMark as u8), 1);
        // 64-bit ABIs are caller-clean: no preserve sentinels.
        assert_eq!(count_sentinels(t, Sentinel::StackPreserve as u8), 0);
        assert_eq!(count_sentinels(t, Sentinel::StackPreserve2 as u8), 0);
    }

    #[test]
    fn x86_template_sentinel_inventory() {
        let t = template_x86();
        assert_eq!(t.word, 4);
        assert_eq!(count_sentinels(t, Sentinel::UsageCounter as u8), 4);
        assert_eq!(count_sentinels(t, Sentinel::FlagsWord as u8), 1);
        assert_eq!(count_sentinels(t, Sentinel::Engine as u8), 2);
        assert_eq!(count_sentinels(t, Sentinel::Entry as u8), 2);
        assert_eq!(count_sentinels(t, Sentinel::PreCall as u8), 1);
        assert_eq!(count_sentinels(t, Sentinel::PostCall as u8), 1);
        assert_eq!(count_sentinels(t, Sentinel::Stub as u8), 1);
        assert_eq!(count_sentinels(t, Sentinel::AfterCallMark as u8), 1);
        assert_eq!(count_sentinels(t, Sentinel::StackPreserve as u8), 3);
        assert_eq!(count_sentinels(t, Sentinel::StackPreserve2 as u8), 1);
    }

    #[test]
    fn templates_start_with_nop_slide() {
        for t in [template_x64(), template_x86()] {
            assert_eq!(&t.code()[..NOP_SLIDE], &[0x90; NOP_SLIDE]);
        }
    }

    #[test]
    fn base_len_is_rounded_and_covers_terminator() {
        for t in [template_x64(), template_x86()] {
            assert_eq!(t.base_len() % 32, 0);
            assert!(t.base_len() >= NOP_SLIDE + stub_block_len(t.word));
            assert_eq!(t.raw_slot_len(), t.base_len() + 2 * t.word);
        }
    }

    #[test]
    fn stack_preserve_arithmetic() {
        // Known pop counts round to a word and gain four words of slack.
        assert_eq!(calc_stack_preserve(4, Some(0)), 16);
        assert_eq!(calc_stack_preserve(4, Some(8)), 24);
        assert_eq!(calc_stack_preserve(4, Some(10)), 28);
        // Unknown uses the fixed dummy.
        assert_eq!(calc_stack_preserve(4, None), 32);
        assert_eq!(calc_stack_preserve(8, None), 64);
    }
}
