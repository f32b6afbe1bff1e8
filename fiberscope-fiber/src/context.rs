//! 保存コンテキストとライブレジスタの相互変換

use crate::{FiberError, RegisterContext, RegisterLayout, Result, TargetAccess};
use tracing::debug;

/// スタックハンドルから保存コンテキストを読み出す
///
/// `stack_context_offset` はスタックハンドル内のコンテキストポインタの位置。
/// 読み取りだけで、レジスタには触れません。
pub fn read_context<A: TargetAccess>(
    target: &A,
    layout: &'static RegisterLayout,
    stack_handle: u64,
    stack_context_offset: u64,
) -> Result<RegisterContext> {
    let context = target.read_pointer(stack_handle + stack_context_offset)?;
    if context == 0 {
        return Err(FiberError::MemoryReadFault {
            address: stack_handle + stack_context_offset,
            reason: "saved context pointer is null".to_string(),
        }
        .into());
    }

    let word = |name: &'static str| -> Result<u64> {
        let idx = layout.word_index(name).ok_or_else(|| {
            anyhow::anyhow!("register layout for {} has no saved word for {}", layout.arch, name)
        })?;
        target.read_pointer(context + idx * layout.word_size)
    };

    let pc = word(layout.instruction_pointer)?;
    let fp = word(layout.frame_pointer)?;
    let sp = context + layout.stack_pointer_words * layout.word_size;

    let mut callee_saved = Vec::new();
    for &(name, _) in layout.saved_words {
        if name == layout.instruction_pointer || name == layout.frame_pointer {
            continue;
        }
        callee_saved.push((name, word(name)?));
    }

    Ok(RegisterContext {
        layout,
        pc,
        sp,
        fp,
        callee_saved,
    })
}

/// コンテキストのip/sp/fpをライブレジスタに書き込む
pub fn apply_context<A: TargetAccess>(target: &mut A, context: &RegisterContext) -> Result<()> {
    let layout = context.layout;
    debug!(
        "switching registers: {}=0x{:x} {}=0x{:x} {}=0x{:x}",
        layout.instruction_pointer,
        context.pc,
        layout.stack_pointer,
        context.sp,
        layout.frame_pointer,
        context.fp
    );
    target.write_register(layout.instruction_pointer, context.pc)?;
    target.write_register(layout.stack_pointer, context.sp)?;
    target.write_register(layout.frame_pointer, context.fp)?;
    Ok(())
}

/// 現在のip/sp/fpを読み出す
pub fn capture_live<A: TargetAccess>(
    target: &A,
    layout: &'static RegisterLayout,
) -> Result<RegisterContext> {
    Ok(RegisterContext {
        layout,
        pc: target.read_register(layout.instruction_pointer)?,
        sp: target.read_register(layout.stack_pointer)?,
        fp: target.read_register(layout.frame_pointer)?,
        callee_saved: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{FakeTarget, SavedRegisters};
    use crate::X86_64;

    #[test]
    fn test_read_context() {
        let mut target = FakeTarget::new();
        let saved = SavedRegisters {
            rip: 0x40_1000,
            rbp: 0x7000_0100,
            rbx: 5,
            r15: 4,
            r14: 3,
            r13: 2,
            r12: 1,
        };
        let (handle, context) = target.saved_stack(0x10, &saved);

        let ctx = read_context(&target, &X86_64, handle, 0x10).unwrap();
        assert_eq!(ctx.pc, 0x40_1000);
        assert_eq!(ctx.fp, 0x7000_0100);
        assert_eq!(ctx.sp, context + 64);
        assert_eq!(ctx.get("rbx"), Some(5));
        assert_eq!(ctx.get("r12"), Some(1));
        assert_eq!(target.register_writes(), 0);
    }

    #[test]
    fn test_null_context_is_fault() {
        let mut target = FakeTarget::new();
        let handle = target.alloc(0x20);
        let err = read_context(&target, &X86_64, handle, 0x10).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FiberError>(),
            Some(FiberError::MemoryReadFault { .. })
        ));
    }

    #[test]
    fn test_apply_then_capture() {
        let mut target = FakeTarget::new();
        let ctx = RegisterContext {
            layout: &X86_64,
            pc: 0x1111,
            sp: 0x2222,
            fp: 0x3333,
            callee_saved: vec![("rbx", 0x4444)],
        };
        apply_context(&mut target, &ctx).unwrap();
        assert_eq!(target.register_writes(), 3);
        assert_eq!(target.register("rbx"), None);

        let live = capture_live(&target, &X86_64).unwrap();
        assert_eq!((live.pc, live.sp, live.fp), (0x1111, 0x2222, 0x3333));
    }
}
