//! レジスタアクセス機能

use crate::Result;
use nix::libc::user_regs_struct;
use nix::unistd::Pid;
use tracing::debug;

/// レジスタ名に関するエラー
#[derive(Debug, thiserror::Error)]
pub enum RegisterError {
    #[error("Unknown register '{0}'")]
    Unknown(String),
}

/// 名前でアクセスできる汎用レジスタ
const REGISTER_NAMES: &[&str] = &[
    "rip", "rsp", "rbp", "rbx", "rax", "rcx", "rdx", "rsi", "rdi", "r8", "r9", "r10", "r11",
    "r12", "r13", "r14", "r15", "eflags",
];

/// 選択中スレッドのレジスタ
pub struct Registers {
    pid: Pid,
}

impl Registers {
    /// レジスタアクセスを作成する
    pub fn new(pid: i32) -> Self {
        Self {
            pid: Pid::from_raw(pid),
        }
    }

    /// アクセス可能なレジスタ名の一覧
    pub fn names() -> &'static [&'static str] {
        REGISTER_NAMES
    }

    /// 全レジスタを読み取る
    pub fn read(&self) -> Result<user_regs_struct> {
        let regs = nix::sys::ptrace::getregs(self.pid)?;
        Ok(regs)
    }

    /// 全レジスタを書き込む
    pub fn write(&self, regs: user_regs_struct) -> Result<()> {
        nix::sys::ptrace::setregs(self.pid, regs)?;
        Ok(())
    }

    /// 名前を指定してレジスタを読み取る
    pub fn get(&self, name: &str) -> Result<u64> {
        let mut regs = self.read()?;
        Ok(*slot(&mut regs, name)?)
    }

    /// 名前を指定してレジスタに書き込む
    pub fn set(&self, name: &str, value: u64) -> Result<()> {
        let mut regs = self.read()?;
        *slot(&mut regs, name)? = value;
        debug!("writing register {} = 0x{:x}", name, value);
        self.write(regs)
    }
}

/// user_regs_struct の中で名前に対応するフィールド
fn slot<'a>(regs: &'a mut user_regs_struct, name: &str) -> Result<&'a mut u64> {
    let field = match name {
        "rip" => &mut regs.rip,
        "rsp" => &mut regs.rsp,
        "rbp" => &mut regs.rbp,
        "rbx" => &mut regs.rbx,
        "rax" => &mut regs.rax,
        "rcx" => &mut regs.rcx,
        "rdx" => &mut regs.rdx,
        "rsi" => &mut regs.rsi,
        "rdi" => &mut regs.rdi,
        "r8" => &mut regs.r8,
        "r9" => &mut regs.r9,
        "r10" => &mut regs.r10,
        "r11" => &mut regs.r11,
        "r12" => &mut regs.r12,
        "r13" => &mut regs.r13,
        "r14" => &mut regs.r14,
        "r15" => &mut regs.r15,
        "eflags" => &mut regs.eflags,
        other => return Err(RegisterError::Unknown(other.to_string()).into()),
    };
    Ok(field)
}
