//! デバッグ対象への読み書きインターフェース
//!
//! カウンタ読み取り・プール走査・レジスタ変換はすべてこのトレイト越しに
//! 対象プロセスへアクセスします。実プロセス向けの実装はcoreクレートの
//! `Debugger`、テスト用の実装は [`crate::fake::FakeTarget`] です。

use crate::{FiberError, Result, SymbolSpec};

/// 対象メモリから読めるプリミティブ値（リトルエンディアン）
pub trait MemoryValue: Sized + Copy {
    const SIZE: usize;

    fn decode(bytes: &[u8]) -> Self;
}

macro_rules! impl_memory_value {
    ($($ty:ty),*) => {
        $(
            impl MemoryValue for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();

                fn decode(bytes: &[u8]) -> Self {
                    let mut buf = [0u8; std::mem::size_of::<$ty>()];
                    buf.copy_from_slice(&bytes[..Self::SIZE]);
                    <$ty>::from_le_bytes(buf)
                }
            }
        )*
    };
}

impl_memory_value!(u32, u64, i64);

/// 対象プロセスへのアクセス
pub trait TargetAccess {
    /// シンボルのアドレスを解決する（見つからなければ `FiberError::SymbolNotFound`）
    fn resolve_symbol(&self, symbol: &SymbolSpec) -> Result<u64>;

    /// 型 `type_name` 内のフィールドパス（`a.b.c`）のオフセット
    ///
    /// 見つからなければ `FiberError::LayoutNotFound`。
    fn field_offset(&self, type_name: &str, path: &str) -> Result<u64>;

    /// 型のサイズ（バイト）
    fn type_size(&self, type_name: &str) -> Result<u64>;

    /// `len` バイトを読む（読めなければ `FiberError::MemoryReadFault`）
    fn read_memory(&self, address: u64, len: usize) -> Result<Vec<u8>>;

    /// 現在のスレッドのレジスタを読む
    fn read_register(&self, name: &str) -> Result<u64>;

    /// 現在のスレッドのレジスタに書き込む
    fn write_register(&mut self, name: &str, value: u64) -> Result<()>;

    /// 型付きで値を読む
    fn read<T: MemoryValue>(&self, address: u64) -> Result<T>
    where
        Self: Sized,
    {
        let bytes = self.read_memory(address, T::SIZE)?;
        if bytes.len() < T::SIZE {
            return Err(FiberError::MemoryReadFault {
                address,
                reason: format!("short read: {} of {} bytes", bytes.len(), T::SIZE),
            }
            .into());
        }
        Ok(T::decode(&bytes))
    }

    /// ポインタ幅の値を読む
    fn read_pointer(&self, address: u64) -> Result<u64>
    where
        Self: Sized,
    {
        self.read::<u64>(address)
    }
}
