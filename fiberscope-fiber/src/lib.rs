//! ファイバーランタイム調査エンジン
//!
//! 停止中のプロセスから、ファイバーランタイムの内部状態を読み取ります。
//!
//! - シャード化された生存数カウンタの合計
//! - 制御ブロックプールの走査と生存判定
//! - 中断中ファイバーの保存コンテキストとライブレジスタの相互変換
//!
//! 対象プロセスへのアクセスは [`TargetAccess`] に抽象化されており、
//! このクレート自身はptraceにもDWARFにも依存しません。

pub mod access;
pub mod context;
pub mod counter;
pub mod errors;
#[cfg(any(test, feature = "fake"))]
pub mod fake;
pub mod liveness;
pub mod pool;
pub mod profile;
pub mod registers;

pub use access::{MemoryValue, TargetAccess};
pub use context::{apply_context, capture_live, read_context};
pub use counter::{count_live_fibers, CounterLayout};
pub use errors::{is_fiber_error, FiberError};
pub use liveness::{generation, is_live, STACK_KIND_NONE};
pub use pool::{scan_fibers, ControlBlockLayout, FiberRecord, PoolLayout, PoolLocation, PoolScanner};
pub use profile::{FieldRef, RuntimeProfile, SymbolSpec, BTHREAD, MELON, PROFILES};
pub use registers::{RegisterContext, RegisterLayout, X86_64};

/// ファイバー調査の結果型
pub type Result<T> = anyhow::Result<T>;
