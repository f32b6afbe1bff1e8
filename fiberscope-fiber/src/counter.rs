//! シャード化された生存ファイバー数カウンタの読み取り
//!
//! カウンタは基底値と、番兵ノードを持つ循環リストにつながったシャード群で
//! 構成されます。論理値は基底値とすべてのシャード値の和です。

use crate::{Result, RuntimeProfile, TargetAccess};
use tracing::debug;

/// 読み取りに必要なアドレスとオフセット
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterLayout {
    /// 制御ブロック（またはそのポインタ変数）のアドレス
    pub task_control: u64,
    pub task_control_is_pointer: bool,
    /// 制御ブロック内の基底値
    pub base: u64,
    /// 制御ブロック内の番兵ノード
    pub root: u64,
    /// シャード内の次ノードポインタ
    pub next: u64,
    /// シャード内の値
    pub value: u64,
}

impl CounterLayout {
    pub fn resolve<A: TargetAccess>(profile: &RuntimeProfile, target: &A) -> Result<Self> {
        let field = |f: crate::FieldRef| target.field_offset(f.type_name, f.path);
        let layout = Self {
            task_control: target.resolve_symbol(&profile.task_control)?,
            task_control_is_pointer: profile.task_control_is_pointer,
            base: field(profile.counter_base)?,
            root: field(profile.counter_root)?,
            next: field(profile.shard_next)?,
            value: field(profile.shard_value)?,
        };
        debug!("resolved counter layout: {:?}", layout);
        Ok(layout)
    }
}

/// 生存ファイバー数を読む
///
/// スケジューラがまだ作られていない（制御ブロックのポインタがnull）なら0。
/// 値は対象から見た瞬間的な値で、シャードの和なので負になることもあります。
pub fn count_live_fibers<A: TargetAccess>(target: &A, layout: &CounterLayout) -> Result<i64> {
    let control = if layout.task_control_is_pointer {
        target.read_pointer(layout.task_control)?
    } else {
        layout.task_control
    };
    if control == 0 {
        debug!("task control is not initialized");
        return Ok(0);
    }

    let root = control + layout.root;
    let mut total = target.read::<i64>(control + layout.base)?;
    let mut shards = 0usize;
    let mut node = root;
    loop {
        if node != root {
            total = total.wrapping_add(target.read::<i64>(node.wrapping_add(layout.value))?);
            shards += 1;
        }
        let next = target.read_pointer(node.wrapping_add(layout.next))?;
        if next == root {
            break;
        }
        node = next;
    }

    debug!("live fiber counter: {} ({} shards)", total, shards);
    Ok(total)
}
