//! ファイバー調査セッション
//!
//! セッションは INACTIVE と ACTIVE の2状態を持ちます。
//! ACTIVE の間はファイバー表のスナップショットと、開始時のレジスタ値
//! （復元ポイント）を保持し、ライブレジスタの書き換えはすべてここを通ります。

use crate::Result;
use fiberscope_fiber::{
    apply_context, capture_live, count_live_fibers, read_context, scan_fibers, ControlBlockLayout,
    CounterLayout, FiberError, FiberRecord, PoolLayout, RegisterContext, RegisterLayout,
    RuntimeProfile, TargetAccess, MELON, X86_64,
};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info, warn};

/// `all` で1件が失敗したときの扱い
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AllPolicy {
    /// 報告して次へ進む
    #[default]
    Skip,
    /// 残りを打ち切る
    Abort,
}

impl FromStr for AllPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "skip" => Ok(AllPolicy::Skip),
            "abort" => Ok(AllPolicy::Abort),
            _ => Err(FiberError::InvalidArgument(format!(
                "unknown policy '{}', expected 'skip' or 'abort'",
                s
            ))
            .into()),
        }
    }
}

impl fmt::Display for AllPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllPolicy::Skip => write!(f, "skip"),
            AllPolicy::Abort => write!(f, "abort"),
        }
    }
}

/// セッションの設定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub profile: &'static RuntimeProfile,
    pub registers: &'static RegisterLayout,
    pub all_policy: AllPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            profile: &MELON,
            registers: &X86_64,
            all_policy: AllPolicy::Skip,
        }
    }
}

/// `begin` の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeginReport {
    /// カウンタが示した生存数
    pub live: i64,
    pub requested: Option<u64>,
    /// 走査の上限件数
    pub cap: u64,
    /// 要求件数が生存数を超えていて切り詰めたか
    pub clamped: bool,
    /// 実際に表に入った件数
    pub scanned: usize,
}

/// `all` の1件分の結果
#[derive(Debug)]
pub enum FrameOutcome {
    Visited,
    NoStack,
    Failed(anyhow::Error),
}

/// `all` の結果
#[derive(Debug, Default)]
pub struct AllReport {
    pub outcomes: Vec<(usize, FrameOutcome)>,
    /// ポリシーにより途中で打ち切ったか
    pub aborted: bool,
}

impl AllReport {
    pub fn failures(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, FrameOutcome::Failed(_)))
            .count()
    }
}

#[derive(Debug, Clone)]
struct ActiveState {
    fibers: Vec<FiberRecord>,
    restore_point: RegisterContext,
    last_selected: Option<usize>,
    control_block: ControlBlockLayout,
}

/// ファイバー調査セッション
#[derive(Debug, Clone)]
pub struct Session {
    config: SessionConfig,
    active: Option<ActiveState>,
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            active: None,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// 最後に `frame` で選んだファイバー
    pub fn last_selected(&self) -> Option<usize> {
        self.active.as_ref().and_then(|s| s.last_selected)
    }

    /// `begin` 時に保存したレジスタ
    pub fn restore_point(&self) -> Option<&RegisterContext> {
        self.active.as_ref().map(|s| &s.restore_point)
    }

    fn state(&self) -> Result<&ActiveState> {
        self.active
            .as_ref()
            .ok_or_else(|| FiberError::NotActive.into())
    }

    /// 生存ファイバー数（どちらの状態でも使える）
    pub fn count_all<A: TargetAccess>(&self, target: &A) -> Result<i64> {
        let layout = CounterLayout::resolve(self.config.profile, target)?;
        count_live_fibers(target, &layout)
    }

    /// 調査モードに入る
    ///
    /// 生存数を数え、上限件数までプールを走査し、現在のレジスタを保存します。
    /// 途中で失敗した場合は INACTIVE のままです。
    pub fn begin<A: TargetAccess>(
        &mut self,
        target: &A,
        requested: Option<u64>,
    ) -> Result<BeginReport> {
        if self.active.is_some() {
            return Err(FiberError::AlreadyActive.into());
        }

        let live = self.count_all(target)?;
        let available = u64::try_from(live).unwrap_or(0);
        let (cap, clamped) = match requested {
            Some(requested) if requested <= available => (requested, false),
            Some(_) => (available, true),
            None => (available, false),
        };
        if live < 0 {
            warn!("live fiber counter is negative ({}), nothing to scan", live);
        }

        let profile = self.config.profile;
        let pool = PoolLayout::resolve(profile, target)?;
        let control_block = ControlBlockLayout::resolve(profile, target)?;
        let cap_items = usize::try_from(cap).unwrap_or(usize::MAX);
        let fibers = scan_fibers(target, pool, control_block, cap_items)?;
        let restore_point = capture_live(target, self.config.registers)?;

        let report = BeginReport {
            live,
            requested,
            cap,
            clamped,
            scanned: fibers.len(),
        };
        info!(
            "entered fiber mode: {} live, {} in table",
            live, report.scanned
        );

        self.active = Some(ActiveState {
            fibers,
            restore_point,
            last_selected: None,
            control_block,
        });
        Ok(report)
    }

    /// ファイバー表
    pub fn list(&self) -> Result<&[FiberRecord]> {
        Ok(&self.state()?.fibers)
    }

    /// 表の1件
    pub fn describe(&self, index: usize) -> Result<&FiberRecord> {
        let fibers = &self.state()?.fibers;
        fibers.get(index).ok_or_else(|| {
            FiberError::IndexOutOfRange {
                index,
                len: fibers.len(),
            }
            .into()
        })
    }

    /// ファイバーの保存レジスタを読む（ライブレジスタは変更しない）
    pub fn registers_of<A: TargetAccess>(&self, target: &A, index: usize) -> Result<RegisterContext> {
        let state = self.state()?;
        let record = self.describe(index)?;
        if !record.has_stack() {
            return Err(FiberError::NoStack { index }.into());
        }
        read_context(
            target,
            self.config.registers,
            record.stack_handle,
            state.control_block.stack_context,
        )
    }

    /// ファイバーの保存コンテキストをライブレジスタに適用する
    ///
    /// 読み取りがすべて成功してから書き込むので、失敗時にレジスタは変わりません。
    pub fn select_frame<A: TargetAccess>(
        &mut self,
        target: &mut A,
        index: usize,
    ) -> Result<RegisterContext> {
        let context = self.registers_of(&*target, index)?;
        apply_context(target, &context)?;
        if let Some(state) = self.active.as_mut() {
            state.last_selected = Some(index);
        }
        debug!("selected fiber #{}", index);
        Ok(context)
    }

    /// ライブレジスタを復元ポイントに戻す（何度呼んでもよい）
    pub fn restore_registers<A: TargetAccess>(&self, target: &mut A) -> Result<()> {
        let state = self.state()?;
        apply_context(target, &state.restore_point)?;
        debug!("registers restored");
        Ok(())
    }

    /// レジスタを戻して INACTIVE に戻る
    ///
    /// 復元に失敗した場合は ACTIVE のままエラーを返すので、再試行できます。
    pub fn end<A: TargetAccess>(&mut self, target: &mut A) -> Result<()> {
        self.restore_registers(target)?;
        self.active = None;
        info!("left fiber mode");
        Ok(())
    }

    /// 表のすべてのファイバーに順に切り替えて `visit` を呼ぶ
    ///
    /// スタックを持たないファイバーは飛ばします。
    /// それ以外の失敗は `all_policy` に従い、最後に必ずレジスタを復元します。
    pub fn all_frames<A, F>(&mut self, target: &mut A, mut visit: F) -> Result<AllReport>
    where
        A: TargetAccess,
        F: FnMut(&A, usize, &FiberRecord, &RegisterContext) -> Result<()>,
    {
        let len = self.state()?.fibers.len();
        let mut report = AllReport::default();

        for index in 0..len {
            let outcome = match self.select_frame(target, index) {
                Ok(context) => {
                    let record = *self.describe(index)?;
                    match visit(&*target, index, &record, &context) {
                        Ok(()) => FrameOutcome::Visited,
                        Err(e) => FrameOutcome::Failed(e),
                    }
                }
                Err(e) if matches!(e.downcast_ref::<FiberError>(), Some(FiberError::NoStack { .. })) => {
                    FrameOutcome::NoStack
                }
                Err(e) => FrameOutcome::Failed(e),
            };

            let failed = matches!(outcome, FrameOutcome::Failed(_));
            if let FrameOutcome::Failed(e) = &outcome {
                warn!("fiber #{} failed: {}", index, e);
            }
            report.outcomes.push((index, outcome));
            if failed && self.config.all_policy == AllPolicy::Abort {
                report.aborted = true;
                break;
            }
        }

        self.restore_registers(target)?;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_from_str() {
        assert_eq!("skip".parse::<AllPolicy>().unwrap(), AllPolicy::Skip);
        assert_eq!("abort".parse::<AllPolicy>().unwrap(), AllPolicy::Abort);
        assert!("retry".parse::<AllPolicy>().is_err());
        assert_eq!(AllPolicy::Abort.to_string(), "abort");
    }

    #[test]
    fn test_inactive_queries() {
        let session = Session::new(SessionConfig::default());
        assert!(!session.is_active());
        assert!(session.list().is_err());
        assert!(session.describe(0).is_err());
        assert!(session.restore_point().is_none());
        assert_eq!(session.last_selected(), None);
    }
}
