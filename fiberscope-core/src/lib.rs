//! fiberscope コア機能
//!
//! ライブプロセスへのアクセス（[`Debugger`]）、調査セッションの状態機械
//! （[`Session`]）、コマンドのパースとフレームポインタによるバックトレースを提供します。

pub mod backtrace;
pub mod command;
pub mod debugger;
pub mod parse;
pub mod session;

pub use backtrace::{backtrace, unwind, Frame, DEFAULT_MAX_FRAMES};
pub use command::{Command, HELP};
pub use debugger::{AddressInfo, Debugger};
pub use session::{AllPolicy, AllReport, BeginReport, FrameOutcome, Session, SessionConfig};

/// コア機能の結果型
pub type Result<T> = anyhow::Result<T>;
