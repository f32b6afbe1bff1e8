//! デバッガコマンド

use crate::parse::{parse_index, parse_unsigned};
use crate::Result;
use fiberscope_fiber::FiberError;

/// デバッガコマンド
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// 生存ファイバー数を表示
    CountAll,
    /// 調査モードに入り、ファイバー表を作る（上限件数は任意）
    Begin(Option<u64>),
    /// ファイバー表を表示
    List,
    /// ファイバーのコンテキストをライブレジスタに適用
    Frame(usize),
    /// すべてのファイバーのバックトレースを表示
    All,
    /// 制御ブロックの内容を表示
    Meta(usize),
    /// 保存レジスタを表示（ライブレジスタは変更しない）
    Regs(usize),
    /// ライブレジスタを開始時の値に戻す
    RegRestore,
    /// レジスタを戻して調査モードを抜ける
    End,
    /// 現在のレジスタからバックトレースを表示
    Backtrace(Option<usize>),
    /// ヘルプ表示
    Help,
    /// 終了
    Quit,
}

impl Command {
    /// コマンド文字列をパースする
    ///
    /// 空行は `Ok(None)`。未知のコマンドや不正な引数はエラーになります。
    pub fn parse(input: &str) -> Result<Option<Self>> {
        let parts: Vec<&str> = input.split_whitespace().collect();
        let Some((&name, args)) = parts.split_first() else {
            return Ok(None);
        };

        let command = match name {
            "count-all" | "count" | "fiber_num" => Command::CountAll,
            "begin" | "fiber_begin" => {
                Command::Begin(optional(args, |s| parse_unsigned(s, "count"))?)
            }
            "list" | "ls" | "fiber_list" => Command::List,
            "frame" | "f" | "fiber_frame" => Command::Frame(required(name, args, parse_index)?),
            "all" | "fiber_all" => Command::All,
            "meta" | "fiber_meta" => Command::Meta(required(name, args, parse_index)?),
            "regs" | "fiber_regs" => Command::Regs(required(name, args, parse_index)?),
            "reg-restore" | "restore" | "fiber_reg_restore" => Command::RegRestore,
            "end" | "fiber_end" => Command::End,
            "backtrace" | "bt" => Command::Backtrace(optional(args, parse_index)?),
            "help" | "h" | "?" => Command::Help,
            "quit" | "q" | "exit" => Command::Quit,
            _ => anyhow::bail!("Unknown command: {}. Type 'help' for available commands.", name),
        };
        Ok(Some(command))
    }
}

fn optional<T>(args: &[&str], parse: impl FnOnce(&str) -> Result<T>) -> Result<Option<T>> {
    args.first().map(|s| parse(s)).transpose()
}

fn required<T>(name: &str, args: &[&str], parse: impl FnOnce(&str) -> Result<T>) -> Result<T> {
    match args.first() {
        Some(s) => parse(s),
        None => Err(FiberError::InvalidArgument(format!("{} <index>, see 'list'", name)).into()),
    }
}

/// helpコマンドの表示内容
pub const HELP: &str = "\
Available commands:
  count-all          Print the number of live fibers
  begin [max]        Enter fiber mode and snapshot at most <max> live fibers
  list               List the snapshotted fibers
  frame <index>      Switch registers to the fiber's saved context
  all                Print a backtrace for every fiber
  meta <index>       Dump the fiber's control block
  regs <index>       Print the fiber's saved registers
  reg-restore        Restore the registers saved at 'begin'
  end                Restore registers and leave fiber mode
  bt [max]           Backtrace from the current registers
  help               Show this help
  quit               End fiber mode, detach and exit";

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(input: &str) -> Option<Command> {
        Command::parse(input).unwrap()
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(parse("count-all"), Some(Command::CountAll));
        assert_eq!(parse("begin"), Some(Command::Begin(None)));
        assert_eq!(parse("begin 5"), Some(Command::Begin(Some(5))));
        assert_eq!(parse("begin 0"), Some(Command::Begin(Some(0))));
        assert_eq!(parse("  frame 2  "), Some(Command::Frame(2)));
        assert_eq!(parse("meta 0x1"), Some(Command::Meta(1)));
        assert_eq!(parse("regs 3"), Some(Command::Regs(3)));
        assert_eq!(parse("reg-restore"), Some(Command::RegRestore));
        assert_eq!(parse("end"), Some(Command::End));
        assert_eq!(parse("bt"), Some(Command::Backtrace(None)));
        assert_eq!(parse("bt 8"), Some(Command::Backtrace(Some(8))));
        assert_eq!(parse("q"), Some(Command::Quit));
        assert_eq!(parse(""), None);
        assert_eq!(parse("   "), None);
    }

    #[test]
    fn test_legacy_names() {
        assert_eq!(parse("fiber_begin 2"), Some(Command::Begin(Some(2))));
        assert_eq!(parse("fiber_num"), Some(Command::CountAll));
        assert_eq!(parse("fiber_reg_restore"), Some(Command::RegRestore));
    }

    #[test]
    fn test_invalid_arguments() {
        for input in ["frame", "frame x", "meta -1", "begin -5", "regs 1.5"] {
            let err = Command::parse(input).unwrap_err();
            assert!(
                matches!(
                    err.downcast_ref::<FiberError>(),
                    Some(FiberError::InvalidArgument(_))
                ),
                "{}: {}",
                input,
                err
            );
        }
    }

    #[test]
    fn test_unknown_command() {
        assert!(Command::parse("step").is_err());
    }
}
