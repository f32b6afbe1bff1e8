//! 保存コンテキストのレジスタ配置

/// 中断中ファイバーの保存コンテキストの配置
///
/// コンテキスト切り替えはcallee-savedレジスタと戻り先を順にpushしてから
/// スタックポインタをコンテキストハンドルとして保存します。
/// そのためハンドル位置から各レジスタがワード単位で並んでいます。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterLayout {
    pub arch: &'static str,
    pub word_size: u64,
    pub instruction_pointer: &'static str,
    pub stack_pointer: &'static str,
    pub frame_pointer: &'static str,
    /// (レジスタ名, ハンドルからのワード位置)。表示順に並べる。
    pub saved_words: &'static [(&'static str, u64)],
    /// 再開時のスタックポインタ = ハンドル + stack_pointer_words * word_size
    pub stack_pointer_words: u64,
}

pub const X86_64: RegisterLayout = RegisterLayout {
    arch: "x86_64",
    word_size: 8,
    instruction_pointer: "rip",
    stack_pointer: "rsp",
    frame_pointer: "rbp",
    saved_words: &[
        ("rip", 7),
        ("rbp", 6),
        ("rbx", 5),
        ("r15", 4),
        ("r14", 3),
        ("r13", 2),
        ("r12", 1),
    ],
    stack_pointer_words: 8,
};

pub const LAYOUTS: &[RegisterLayout] = &[X86_64];

impl RegisterLayout {
    /// 実行中のアーキテクチャ向けの配置
    pub fn host() -> Option<&'static RegisterLayout> {
        Self::for_arch(std::env::consts::ARCH)
    }

    pub fn for_arch(arch: &str) -> Option<&'static RegisterLayout> {
        LAYOUTS.iter().find(|l| l.arch == arch)
    }

    /// フレーム切り替えで書き換えるレジスタ
    pub fn switched_registers(&self) -> [&'static str; 3] {
        [
            self.instruction_pointer,
            self.stack_pointer,
            self.frame_pointer,
        ]
    }

    /// 保存ワードの位置
    pub fn word_index(&self, register: &str) -> Option<u64> {
        self.saved_words
            .iter()
            .find(|(name, _)| *name == register)
            .map(|&(_, idx)| idx)
    }
}

/// ひとつのファイバーのレジスタ値
///
/// `pc` `sp` `fp` 以外のcallee-savedレジスタは表示用で、
/// フレーム切り替えでは書き込みません。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterContext {
    pub layout: &'static RegisterLayout,
    pub pc: u64,
    pub sp: u64,
    pub fp: u64,
    pub callee_saved: Vec<(&'static str, u64)>,
}

impl RegisterContext {
    /// 表示順のレジスタ一覧（ip, sp, fp, その他）
    pub fn entries(&self) -> Vec<(&'static str, u64)> {
        let mut entries = vec![
            (self.layout.instruction_pointer, self.pc),
            (self.layout.stack_pointer, self.sp),
            (self.layout.frame_pointer, self.fp),
        ];
        entries.extend(self.callee_saved.iter().copied());
        entries
    }

    pub fn get(&self, name: &str) -> Option<u64> {
        self.entries()
            .into_iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_x86_64_words() {
        assert_eq!(X86_64.word_index("rip"), Some(7));
        assert_eq!(X86_64.word_index("r12"), Some(1));
        assert_eq!(X86_64.word_index("rsp"), None);
        assert_eq!(RegisterLayout::for_arch("x86_64"), Some(&X86_64));
        assert!(RegisterLayout::for_arch("riscv64").is_none());
    }

    #[test]
    fn test_entries_order() {
        let ctx = RegisterContext {
            layout: &X86_64,
            pc: 1,
            sp: 2,
            fp: 3,
            callee_saved: vec![("rbx", 4)],
        };
        let names: Vec<_> = ctx.entries().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, ["rip", "rsp", "rbp", "rbx"]);
        assert_eq!(ctx.get("rbx"), Some(4));
        assert_eq!(ctx.get("r15"), None);
    }
}
