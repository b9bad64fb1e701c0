// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Context switching. A context frame is a contiguous region of the stack
//! holding the callee-saved register state of a suspended execution, with the
//! parent frame pointer stored at offset zero. The region `[cf, cf.parent)`
//! is self-contained: copying it byte-wise to the same virtual address on
//! another worker and resuming it there transfers the execution.
//!
//! The save/restore sequences are necessarily per-ISA assembly. The restore
//! path is shared between "the called function returned" and "somebody
//! resumed the frame", which is what makes the serialized fork fast path a
//! plain function return.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::std::{
    arch::global_asm,
    ffi::c_void,
    mem,
    ptr,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Size of the register save area of one context frame, in bytes.
#[cfg(target_arch = "x86_64")]
pub const FRAME_RESERVED: usize = 64;

/// Size of the register save area of one context frame, in bytes.
#[cfg(target_arch = "aarch64")]
pub const FRAME_RESERVED: usize = 176;

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("context switching is implemented for x86-64 and aarch64 only");

//======================================================================================================================
// Structures
//======================================================================================================================

/// A suspended execution context. Lives on the call stack; the save area
/// behind the parent pointer is only ever touched by the assembly below.
#[repr(C)]
pub struct ContextFrame {
    /// Parent context frame (delimits this frame: the frame occupies
    /// `[self, self.parent)`).
    pub parent: *mut ContextFrame,
}

//======================================================================================================================
// Assembly
//======================================================================================================================

// Layout of the x86-64 save area (ascending from the frame pointer):
//   +0 parent, +8 r15, +16 r14, +24 r13, +32 r12, +40 rbx, +48 rbp, +56 retaddr.
#[cfg(target_arch = "x86_64")]
global_asm!(
    r#"
    .text
    .globl spindle_ctx_save_and_call
    .p2align 4
spindle_ctx_save_and_call:
    push rbp
    push rbx
    push r12
    push r13
    push r14
    push r15
    push rdi
    mov rax, rsi
    mov rdi, rsp
    mov rsi, rdx
    mov rdx, rcx
    call rax
    add rsp, 8
    pop r15
    pop r14
    pop r13
    pop r12
    pop rbx
    pop rbp
    ret

    .globl spindle_ctx_resume
    .p2align 4
spindle_ctx_resume:
    mov rsp, rdi
    add rsp, 8
    pop r15
    pop r14
    pop r13
    pop r12
    pop rbx
    pop rbp
    ret

    .globl spindle_ctx_call_on_stack
    .p2align 4
spindle_ctx_call_on_stack:
    lea rsp, [rdi + rsi]
    and rsp, -16
    mov rax, rdx
    mov rdi, rcx
    mov rsi, r8
    call rax
    ud2

    .globl spindle_ctx_jump_to_stack
    .p2align 4
spindle_ctx_jump_to_stack:
    mov rsp, rdi
    and rsp, -16
    mov rax, rsi
    mov rdi, rdx
    mov rsi, rcx
    mov rdx, r8
    call rax
    ud2
"#
);

// Layout of the aarch64 save area (ascending from the frame pointer):
//   +0 parent, +8 pad, +16 x19/x20, +32 x21/x22, +48 x23/x24, +64 x25/x26,
//   +80 x27/x28, +96 x29/x30, +112 d9/d8, +128 d11/d10, +144 d13/d12,
//   +160 d15/d14.
#[cfg(target_arch = "aarch64")]
global_asm!(
    r#"
    .text
    .globl spindle_ctx_save_and_call
    .p2align 2
spindle_ctx_save_and_call:
    stp d15, d14, [sp, #-16]!
    stp d13, d12, [sp, #-16]!
    stp d11, d10, [sp, #-16]!
    stp d9,  d8,  [sp, #-16]!
    stp x29, x30, [sp, #-16]!
    stp x27, x28, [sp, #-16]!
    stp x25, x26, [sp, #-16]!
    stp x23, x24, [sp, #-16]!
    stp x21, x22, [sp, #-16]!
    stp x19, x20, [sp, #-16]!
    stp x0, xzr, [sp, #-16]!
    mov x4, x1
    mov x0, sp
    mov x1, x2
    mov x2, x3
    blr x4
    add sp, sp, #16
    ldp x19, x20, [sp], #16
    ldp x21, x22, [sp], #16
    ldp x23, x24, [sp], #16
    ldp x25, x26, [sp], #16
    ldp x27, x28, [sp], #16
    ldp x29, x30, [sp], #16
    ldp d9,  d8,  [sp], #16
    ldp d11, d10, [sp], #16
    ldp d13, d12, [sp], #16
    ldp d15, d14, [sp], #16
    ret

    .globl spindle_ctx_resume
    .p2align 2
spindle_ctx_resume:
    mov sp, x0
    add sp, sp, #16
    ldp x19, x20, [sp], #16
    ldp x21, x22, [sp], #16
    ldp x23, x24, [sp], #16
    ldp x25, x26, [sp], #16
    ldp x27, x28, [sp], #16
    ldp x29, x30, [sp], #16
    ldp d9,  d8,  [sp], #16
    ldp d11, d10, [sp], #16
    ldp d13, d12, [sp], #16
    ldp d15, d14, [sp], #16
    ret

    .globl spindle_ctx_call_on_stack
    .p2align 2
spindle_ctx_call_on_stack:
    add x9, x0, x1
    and x9, x9, #-16
    mov sp, x9
    mov x9, x2
    mov x0, x3
    mov x1, x4
    blr x9
    brk #0x1

    .globl spindle_ctx_jump_to_stack
    .p2align 2
spindle_ctx_jump_to_stack:
    and x9, x0, #-16
    mov sp, x9
    mov x9, x1
    mov x0, x2
    mov x1, x3
    mov x2, x4
    blr x9
    brk #0x1
"#
);

extern "C" {
    fn spindle_ctx_save_and_call(
        parent: *mut ContextFrame,
        f: unsafe extern "C" fn(*mut ContextFrame, *mut c_void, *mut c_void),
        a0: *mut c_void,
        a1: *mut c_void,
    );
    fn spindle_ctx_resume(cf: *mut ContextFrame) -> !;
    fn spindle_ctx_call_on_stack(
        stack_low: *mut u8,
        stack_size: usize,
        f: unsafe extern "C" fn(*mut c_void, *mut c_void),
        a0: *mut c_void,
        a1: *mut c_void,
    ) -> !;
    fn spindle_ctx_jump_to_stack(
        sp: *mut u8,
        f: unsafe extern "C" fn(*mut c_void, *mut c_void, *mut c_void),
        a0: *mut c_void,
        a1: *mut c_void,
        a2: *mut c_void,
    ) -> !;
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Saves the current context into a frame whose parent is `parent` and runs
/// `f` on the stack just below it. Control comes back here either when `f`
/// returns or when the saved frame is resumed with [resume].
///
/// # Safety
///
/// `f` must either return without having switched stacks, or diverge by
/// resuming some other context.
pub unsafe fn save_context_with_call<F>(parent: *mut ContextFrame, f: F)
where
    F: FnOnce(*mut ContextFrame),
{
    unsafe extern "C" fn trampoline<F>(cf: *mut ContextFrame, a0: *mut c_void, _a1: *mut c_void)
    where
        F: FnOnce(*mut ContextFrame),
    {
        // Move the closure into this frame: it was passed by pointer from the
        // region above `cf`, which may migrate to another worker while the
        // closure is still running.
        let f: F = ptr::read(a0 as *const F);
        f(cf);
    }

    let mut f: mem::ManuallyDrop<F> = mem::ManuallyDrop::new(f);
    spindle_ctx_save_and_call(
        parent,
        trampoline::<F>,
        &mut f as *mut mem::ManuallyDrop<F> as *mut c_void,
        ptr::null_mut(),
    );
}

/// Resumes a context frame that lives (again) on the stack.
///
/// # Safety
///
/// The save area behind `cf` must hold the state captured by
/// [save_context_with_call] on this or an identically laid out address space.
pub unsafe fn resume(cf: *mut ContextFrame) -> ! {
    spindle_ctx_resume(cf)
}

/// Runs `f` on a fresh stack spanning `[stack_low, stack_low + stack_size)`.
/// `f` must diverge by resuming some context; it cannot return.
///
/// # Safety
///
/// The stack region must be valid, writable, and unused.
pub unsafe fn call_on_stack<F>(stack_low: *mut u8, stack_size: usize, f: F) -> !
where
    F: FnOnce(),
{
    unsafe extern "C" fn trampoline<F>(a0: *mut c_void, _a1: *mut c_void)
    where
        F: FnOnce(),
    {
        let f: F = ptr::read(a0 as *const F);
        f();
        unreachable!("closure run on a fresh stack must not return");
    }

    let mut f: mem::ManuallyDrop<F> = mem::ManuallyDrop::new(f);
    spindle_ctx_call_on_stack(
        stack_low,
        stack_size,
        trampoline::<F>,
        &mut f as *mut mem::ManuallyDrop<F> as *mut c_void,
        ptr::null_mut(),
    )
}

/// Moves the stack pointer to `sp` and calls `f(a0, a1, a2)` there. Used to
/// vacate a stack region that is about to be overwritten by an incoming
/// frame; `f` cannot return.
///
/// # Safety
///
/// The memory below `sp` must be valid stack space, and every argument `f`
/// needs must be passed by value (locals of the caller may be overwritten).
pub unsafe fn jump_to_stack(
    sp: *mut u8,
    f: unsafe extern "C" fn(*mut c_void, *mut c_void, *mut c_void),
    a0: *mut c_void,
    a1: *mut c_void,
    a2: *mut c_void,
) -> ! {
    spindle_ctx_jump_to_stack(sp, f, a0, a1, a2)
}

/// Severs the link from `cf` to its parent by clearing the parent's save
/// area. Done before resuming a stolen on-stack frame, whose parent region
/// was not copied along and holds whatever the thief's stack last held.
///
/// # Safety
///
/// `cf.parent` must point at least [FRAME_RESERVED] bytes inside a writable
/// region (the call stack keeps a margin at its bottom for the root frame).
pub unsafe fn clear_parent_frame(cf: *mut ContextFrame) {
    ptr::write_bytes((*cf).parent as *mut u8, 0, FRAME_RESERVED);
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::{
        call_on_stack,
        resume,
        save_context_with_call,
        ContextFrame,
    };
    use ::std::ptr;

    /// Tests that a closure that returns resumes the saved context in place.
    #[test]
    fn save_and_fall_through() {
        let mut steps: usize = 0;
        let steps_ptr: *mut usize = &mut steps;
        unsafe {
            save_context_with_call(ptr::null_mut(), |cf: *mut ContextFrame| {
                assert!(!cf.is_null());
                *steps_ptr += 1;
            });
        }
        assert_eq!(steps, 1);
    }

    /// Tests that resuming the just-saved frame transfers control back to the
    /// save point exactly once.
    #[test]
    fn save_and_resume() {
        let mut steps: usize = 0;
        let steps_ptr: *mut usize = &mut steps;
        unsafe {
            save_context_with_call(ptr::null_mut(), |cf: *mut ContextFrame| {
                *steps_ptr += 1;
                resume(cf);
            });
        }
        assert_eq!(steps, 1);
    }

    /// Tests a full round trip through a detached stack: save, run a closure
    /// on a fresh stack, resume the saved context from there.
    #[test]
    fn round_trip_through_fresh_stack() {
        const STACK_SIZE: usize = 256 * 1024;
        let mut stack: Vec<u8> = vec![0u8; STACK_SIZE];
        let stack_low: *mut u8 = stack.as_mut_ptr();
        let mut steps: usize = 0;
        let steps_ptr: *mut usize = &mut steps;

        unsafe {
            save_context_with_call(ptr::null_mut(), |cf: *mut ContextFrame| {
                call_on_stack(stack_low, STACK_SIZE, move || {
                    *steps_ptr += 1;
                    resume(cf);
                });
            });
        }
        assert_eq!(steps, 1);
    }
}
