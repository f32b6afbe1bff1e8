//! フレームポインタによるバックトレース

use crate::Result;
use fiberscope_fiber::{RegisterLayout, TargetAccess};
use tracing::trace;

/// バックトレースの既定の最大フレーム数
pub const DEFAULT_MAX_FRAMES: usize = 64;

/// スタックフレーム
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub index: usize,
    /// フレームのプログラムカウンタ（0番以外は戻りアドレス）
    pub pc: u64,
    /// フレームポインタ
    pub fp: u64,
}

/// フレームポインタチェーンを辿る
///
/// `[fp]` に呼び出し元のフレームポインタ、`[fp+8]` に戻りアドレスがある前提です。
/// 次の場合に打ち切ります。
///
/// - フレームポインタがnull・非整列・増加しない
/// - 読めないワードに当たった
/// - 戻りアドレスが0
/// - `max_frames` に達した
pub fn unwind<A: TargetAccess>(target: &A, pc: u64, fp: u64, max_frames: usize) -> Vec<Frame> {
    let mut frames = Vec::new();
    if max_frames == 0 {
        return frames;
    }
    frames.push(Frame { index: 0, pc, fp });

    let mut fp = fp;
    while frames.len() < max_frames {
        if fp == 0 || fp % 8 != 0 {
            break;
        }
        let Ok(caller_fp) = target.read_pointer(fp) else {
            trace!("unreadable frame pointer at 0x{:x}", fp);
            break;
        };
        let Ok(return_address) = target.read_pointer(fp.wrapping_add(8)) else {
            trace!("unreadable return address at 0x{:x}", fp.wrapping_add(8));
            break;
        };
        if return_address == 0 {
            break;
        }

        frames.push(Frame {
            index: frames.len(),
            pc: return_address,
            fp: caller_fp,
        });

        // スタックは上位アドレスに向かって巻き戻る
        if caller_fp != 0 && caller_fp <= fp {
            break;
        }
        fp = caller_fp;
    }
    frames
}

/// ライブレジスタからバックトレースを取る
pub fn backtrace<A: TargetAccess>(
    target: &A,
    layout: &RegisterLayout,
    max_frames: usize,
) -> Result<Vec<Frame>> {
    let pc = target.read_register(layout.instruction_pointer)?;
    let fp = target.read_register(layout.frame_pointer)?;
    Ok(unwind(target, pc, fp, max_frames))
}
