//! fiberscope ターゲットプロセス制御
//!
//! このクレートは、停止中のデバッグ対象プロセスを外側から覗くための低レベル機能を提供します。
//! ptraceによるアタッチ/デタッチ、メモリ読み取り、レジスタの読み書き、
//! メモリマッピングの解析などを行います。

pub mod process;
pub mod memory;
pub mod registers;

pub use process::{list_threads, Process, ThreadId};
pub use memory::{load_base_from, Memory, MemoryMapping};
pub use registers::{RegisterError, Registers};

/// ターゲット制御の結果型
pub type Result<T> = anyhow::Result<T>;
