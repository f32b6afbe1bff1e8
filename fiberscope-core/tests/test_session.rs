//! 疑似ランタイムに対するセッションの統合テスト

use fiberscope_core::{backtrace, AllPolicy, FrameOutcome, Session, SessionConfig};
use fiberscope_fiber::fake::{FakeRuntime, SavedRegisters, SlotSpec};
use fiberscope_fiber::{FiberError, TargetAccess, BTHREAD, MELON, X86_64};

fn kind(err: &anyhow::Error) -> Option<&FiberError> {
    err.downcast_ref::<FiberError>()
}

/// 3つの生存ファイバー（うち1つはスタックなし）と1つの死んだスロット
fn runtime() -> FakeRuntime {
    let mut runtime = FakeRuntime::new(&MELON);
    runtime.set_counter(1, &[1, 1]);

    let stack_a = runtime.saved_stack(&SavedRegisters {
        rip: 0x40_1100,
        rbp: 0,
        rbx: 0xb0,
        r15: 0xf5,
        r14: 0xf4,
        r13: 0xf3,
        r12: 0xf2,
    });
    let stack_c = runtime.saved_stack(&SavedRegisters::at(0x40_1300, 0));

    let group = runtime.add_group();
    runtime.add_block(
        group,
        &[
            SlotSpec::live(1, 0x40_1000).with_stack(stack_a),
            SlotSpec::stale(1, 0x40_2000).with_stack(stack_a),
            SlotSpec::live(4, 0x40_2100),
            SlotSpec::live(2, 0x40_3000).with_stack(stack_c),
        ],
    );
    runtime
}

fn session() -> Session {
    Session::new(SessionConfig::default())
}

#[test]
fn test_begin_builds_table() {
    let runtime = runtime();
    let mut session = session();

    assert_eq!(session.count_all(&runtime.target).unwrap(), 3);

    let report = session.begin(&runtime.target, None).unwrap();
    assert_eq!(report.live, 3);
    assert_eq!(report.cap, 3);
    assert!(!report.clamped);
    assert_eq!(report.scanned, 3);

    let entries: Vec<_> = session
        .list()
        .unwrap()
        .iter()
        .map(|f| f.entry_function)
        .collect();
    assert_eq!(entries, [0x40_1000, 0x40_2100, 0x40_3000]);
    assert!(session.is_active());
    // beginはレジスタに書き込まない
    assert_eq!(runtime.target.register_writes(), 0);
}

#[test]
fn test_begin_clamps_request_to_live_count() {
    let runtime = runtime();
    let mut session = session();

    let report = session.begin(&runtime.target, Some(5)).unwrap();
    assert!(report.clamped);
    assert_eq!(report.cap, 3);
    assert_eq!(session.list().unwrap().len(), 3);
}

#[test]
fn test_begin_with_smaller_request() {
    let runtime = runtime();
    let mut session = session();

    let report = session.begin(&runtime.target, Some(2)).unwrap();
    assert!(!report.clamped);
    assert_eq!(report.cap, 2);
    assert_eq!(session.list().unwrap().len(), 2);
}

#[test]
fn test_begin_zero_gives_empty_table() {
    let runtime = runtime();
    let mut session = session();

    let report = session.begin(&runtime.target, Some(0)).unwrap();
    assert_eq!(report.scanned, 0);
    assert!(session.is_active());
    assert!(session.list().unwrap().is_empty());
}

#[test]
fn test_negative_counter_scans_nothing() {
    let mut runtime = runtime();
    runtime.set_counter(0, &[-1]);
    let mut session = session();

    let report = session.begin(&runtime.target, None).unwrap();
    assert_eq!(report.live, -1);
    assert_eq!(report.cap, 0);
    assert!(session.list().unwrap().is_empty());
}

#[test]
fn test_begin_while_active_keeps_state() {
    let mut runtime = runtime();
    let mut session = session();
    session.begin(&runtime.target, Some(2)).unwrap();
    let table = session.list().unwrap().to_vec();
    let restore_point = session.restore_point().cloned();

    runtime.target.set_register("rip", 0xdead);
    let err = session.begin(&runtime.target, None).unwrap_err();
    assert_eq!(kind(&err), Some(&FiberError::AlreadyActive));
    assert_eq!(session.list().unwrap(), table.as_slice());
    assert_eq!(session.restore_point().cloned(), restore_point);
}

#[test]
fn test_failed_begin_stays_inactive() {
    let mut runtime = FakeRuntime::new(&MELON);
    runtime.set_counter(1, &[]);
    let group = runtime.add_group();
    runtime.add_dangling_block(group, 0xbad0_0000);
    let mut session = session();

    let err = session.begin(&runtime.target, None).unwrap_err();
    assert!(matches!(kind(&err), Some(FiberError::MemoryReadFault { .. })));
    assert!(!session.is_active());
}

#[test]
fn test_frame_then_restore_is_bit_exact() {
    let mut runtime = runtime();
    let before = runtime.target.registers();
    let mut session = session();
    session.begin(&runtime.target, None).unwrap();

    let context = session.select_frame(&mut runtime.target, 0).unwrap();
    assert_eq!(runtime.target.register("rip"), Some(0x40_1100));
    assert_eq!(runtime.target.register("rsp"), Some(context.sp));
    assert_eq!(runtime.target.register("rbp"), Some(0));
    // callee-savedは書き換えない
    assert_eq!(runtime.target.register("rbx"), before.get("rbx").copied());
    assert_eq!(session.last_selected(), Some(0));

    session.select_frame(&mut runtime.target, 2).unwrap();
    assert_eq!(runtime.target.register("rip"), Some(0x40_1300));

    session.restore_registers(&mut runtime.target).unwrap();
    assert_eq!(runtime.target.registers(), before);
    assert_eq!(session.last_selected(), Some(2));

    // 冪等
    session.restore_registers(&mut runtime.target).unwrap();
    assert_eq!(runtime.target.registers(), before);
}

#[test]
fn test_index_one_past_end() {
    let mut runtime = runtime();
    let mut session = session();
    session.begin(&runtime.target, None).unwrap();
    let len = session.list().unwrap().len();

    let err = session.select_frame(&mut runtime.target, len).unwrap_err();
    assert_eq!(
        kind(&err),
        Some(&FiberError::IndexOutOfRange { index: len, len })
    );
    assert_eq!(runtime.target.register_writes(), 0);
    assert_eq!(session.last_selected(), None);
}

#[test]
fn test_fiber_without_stack_handle() {
    let mut runtime = runtime();
    let mut session = session();
    session.begin(&runtime.target, None).unwrap();

    let err = session.select_frame(&mut runtime.target, 1).unwrap_err();
    assert_eq!(kind(&err), Some(&FiberError::NoStack { index: 1 }));
    assert_eq!(runtime.target.register_writes(), 0);

    let err = session.registers_of(&runtime.target, 1).unwrap_err();
    assert_eq!(kind(&err), Some(&FiberError::NoStack { index: 1 }));
}

#[test]
fn test_registers_of_does_not_write() {
    let runtime = runtime();
    let mut session = session();
    session.begin(&runtime.target, None).unwrap();

    let context = session.registers_of(&runtime.target, 0).unwrap();
    assert_eq!(context.pc, 0x40_1100);
    assert_eq!(context.get("rbx"), Some(0xb0));
    assert_eq!(context.get("r12"), Some(0xf2));
    assert_eq!(runtime.target.register_writes(), 0);
}

#[test]
fn test_describe() {
    let runtime = runtime();
    let mut session = session();
    session.begin(&runtime.target, None).unwrap();

    let record = session.describe(2).unwrap();
    assert_eq!(record.location.slot, 3);
    assert_eq!(record.generation(), 2);
    assert_eq!(record.version, 2);
    assert!(session.describe(3).is_err());
}

#[test]
fn test_commands_require_active() {
    let mut runtime = runtime();
    let mut session = session();

    for err in [
        session.list().map(|_| ()).unwrap_err(),
        session.describe(0).map(|_| ()).unwrap_err(),
        session.registers_of(&runtime.target, 0).map(|_| ()).unwrap_err(),
        session.restore_registers(&mut runtime.target).unwrap_err(),
        session.select_frame(&mut runtime.target, 0).map(|_| ()).unwrap_err(),
        session.end(&mut runtime.target).unwrap_err(),
    ] {
        assert_eq!(kind(&err), Some(&FiberError::NotActive));
    }
    assert_eq!(runtime.target.register_writes(), 0);
}

#[test]
fn test_end_restores_and_deactivates() {
    let mut runtime = runtime();
    let before = runtime.target.registers();
    let mut session = session();
    session.begin(&runtime.target, None).unwrap();
    session.select_frame(&mut runtime.target, 0).unwrap();

    session.end(&mut runtime.target).unwrap();
    assert!(!session.is_active());
    assert_eq!(runtime.target.registers(), before);

    // 再びbeginできる
    session.begin(&runtime.target, None).unwrap();
}

#[test]
fn test_end_failure_keeps_session() {
    let mut runtime = runtime();
    let mut session = session();
    session.begin(&runtime.target, None).unwrap();
    session.select_frame(&mut runtime.target, 0).unwrap();

    runtime.target.fail_register_writes(true);
    assert!(session.end(&mut runtime.target).is_err());
    assert!(session.is_active());

    runtime.target.fail_register_writes(false);
    session.end(&mut runtime.target).unwrap();
    assert!(!session.is_active());
}

#[test]
fn test_all_frames_skips_and_restores() {
    let mut runtime = runtime();
    let before = runtime.target.registers();
    let mut session = session();
    session.begin(&runtime.target, None).unwrap();

    let mut visited = Vec::new();
    let report = session
        .all_frames(&mut runtime.target, |target, index, record, context| {
            assert_eq!(target.read_register("rip")?, context.pc);
            let frames = backtrace(target, &X86_64, 8)?;
            visited.push((index, record.entry_function, frames.len()));
            Ok(())
        })
        .unwrap();

    assert_eq!(visited, [(0, 0x40_1000, 1), (2, 0x40_3000, 1)]);
    assert!(matches!(report.outcomes[1], (1, FrameOutcome::NoStack)));
    assert_eq!(report.failures(), 0);
    assert!(!report.aborted);
    assert_eq!(runtime.target.registers(), before);
}

/// 保存コンテキストが壊れたファイバーを先頭に置いた疑似ランタイム
fn runtime_with_broken_context() -> FakeRuntime {
    let mut runtime = FakeRuntime::new(&MELON);
    runtime.set_counter(2, &[]);
    let broken = runtime.target.alloc(0x20);
    let good = runtime.saved_stack(&SavedRegisters::at(0x40_1500, 0));
    let group = runtime.add_group();
    runtime.add_block(
        group,
        &[
            SlotSpec::live(1, 0x40_1000).with_stack(broken),
            SlotSpec::live(1, 0x40_2000).with_stack(good),
        ],
    );
    runtime
}

#[test]
fn test_all_frames_skip_policy() {
    let mut runtime = runtime_with_broken_context();
    let before = runtime.target.registers();
    let mut session = session();
    session.begin(&runtime.target, None).unwrap();

    let mut visited = Vec::new();
    let report = session
        .all_frames(&mut runtime.target, |_, index, _, _| {
            visited.push(index);
            Ok(())
        })
        .unwrap();

    assert_eq!(visited, [1]);
    assert_eq!(report.failures(), 1);
    assert!(!report.aborted);
    assert_eq!(runtime.target.registers(), before);
}

#[test]
fn test_all_frames_abort_policy() {
    let mut runtime = runtime_with_broken_context();
    let before = runtime.target.registers();
    let mut session = Session::new(SessionConfig {
        all_policy: AllPolicy::Abort,
        ..SessionConfig::default()
    });
    session.begin(&runtime.target, None).unwrap();

    let mut visited = Vec::new();
    let report = session
        .all_frames(&mut runtime.target, |_, index, _, _| {
            visited.push(index);
            Ok(())
        })
        .unwrap();

    assert!(visited.is_empty());
    assert!(report.aborted);
    assert_eq!(report.outcomes.len(), 1);
    assert_eq!(runtime.target.registers(), before);
}

#[test]
fn test_count_all_works_in_both_states() {
    let runtime = runtime();
    let mut session = session();
    assert_eq!(session.count_all(&runtime.target).unwrap(), 3);
    session.begin(&runtime.target, Some(1)).unwrap();
    assert_eq!(session.count_all(&runtime.target).unwrap(), 3);
}

#[test]
fn test_missing_symbol_reported() {
    let mut runtime = runtime();
    runtime.target = fiberscope_fiber::fake::FakeTarget::new();
    let mut session = session();
    let err = session.begin(&runtime.target, None).unwrap_err();
    assert!(matches!(kind(&err), Some(FiberError::SymbolNotFound(_))));
    assert!(!session.is_active());
}

#[test]
fn test_bthread_profile_session() {
    let mut runtime = FakeRuntime::new(&BTHREAD);
    runtime.set_counter(0, &[2]);
    let stack = runtime.saved_stack(&SavedRegisters::at(0x50_1100, 0x7ffe_0100));
    let group = runtime.add_group();
    runtime.add_block(
        group,
        &[
            SlotSpec::live(7, 0x50_1000).with_stack(stack),
            SlotSpec::stale(3, 0x50_2000),
            SlotSpec::live(1, 0x50_3000),
        ],
    );
    let before = runtime.target.registers();

    // melonの名前ではbthreadのシンボルは見つからない
    let mut melon = session();
    let err = melon.begin(&runtime.target, None).unwrap_err();
    assert!(matches!(kind(&err), Some(FiberError::SymbolNotFound(_))));

    let mut session = Session::new(SessionConfig {
        profile: &BTHREAD,
        ..SessionConfig::default()
    });
    let report = session.begin(&runtime.target, None).unwrap();
    assert_eq!(report.live, 2);
    assert_eq!(report.scanned, 2);

    let table = session.list().unwrap();
    assert_eq!(table[0].entry_function, 0x50_1000);
    assert!(table[0].has_stack());
    assert_eq!(table[1].entry_function, 0x50_3000);
    assert!(!table[1].has_stack());

    session.select_frame(&mut runtime.target, 0).unwrap();
    assert_eq!(runtime.target.register("rip"), Some(0x50_1100));
    assert_eq!(runtime.target.register("rbp"), Some(0x7ffe_0100));

    let err = session.select_frame(&mut runtime.target, 1).unwrap_err();
    assert!(matches!(kind(&err), Some(FiberError::NoStack { index: 1 })));

    session.end(&mut runtime.target).unwrap();
    assert_eq!(runtime.target.registers(), before);
}
