//! メモリアクセス機能
//!
//! 対象プロセスのメモリは読み取り専用で扱います。
//! fiberscopeがプロセスの状態を変更するのはレジスタ経由だけです。

use crate::Result;
use nix::unistd::Pid;
use std::fs::File;
use std::io::{BufRead, BufReader, Read as _, Seek, SeekFrom};
use std::path::Path;
use tracing::trace;

/// /proc/pid/maps の1行
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryMapping {
    pub start: u64,
    pub end: u64,
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
    /// マッピング先ファイル内のオフセット
    pub offset: u64,
    /// マッピングされたファイルのパス（匿名マッピングではNone）
    pub pathname: Option<String>,
}

impl MemoryMapping {
    /// /proc/pid/maps の1行を解析する
    ///
    /// 例: `7f1234567000-7f1234568000 r-xp 00001000 08:01 123456 /usr/bin/server`
    pub fn parse_line(line: &str) -> Result<Option<Self>> {
        let mut parts = line.split_whitespace();
        let (range, perms, offset) = match (parts.next(), parts.next(), parts.next()) {
            (Some(range), Some(perms), Some(offset)) => (range, perms, offset),
            _ => return Ok(None),
        };
        // dev, inode
        let _ = parts.next();
        let _ = parts.next();
        let pathname = parts.next().map(str::to_string);

        let (start, end) = range
            .split_once('-')
            .ok_or_else(|| anyhow::anyhow!("Malformed address range '{}'", range))?;
        let start = u64::from_str_radix(start, 16)
            .map_err(|e| anyhow::anyhow!("Failed to parse mapping start '{}': {}", start, e))?;
        let end = u64::from_str_radix(end, 16)
            .map_err(|e| anyhow::anyhow!("Failed to parse mapping end '{}': {}", end, e))?;
        let offset = u64::from_str_radix(offset, 16)
            .map_err(|e| anyhow::anyhow!("Failed to parse mapping offset '{}': {}", offset, e))?;

        let perms = perms.as_bytes();
        Ok(Some(Self {
            start,
            end,
            readable: perms.first() == Some(&b'r'),
            writable: perms.get(1) == Some(&b'w'),
            executable: perms.get(2) == Some(&b'x'),
            offset,
            pathname,
        }))
    }

    /// アドレスがこのマッピングに含まれるか
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// 対象プロセスのメモリ
pub struct Memory {
    pid: Pid,
}

impl Memory {
    /// メモリアクセスを作成する
    pub fn new(pid: i32) -> Self {
        Self {
            pid: Pid::from_raw(pid),
        }
    }

    /// メモリからデータを読み取る
    ///
    /// まず /proc/pid/mem を使い、EIO（未マッピング領域など）の場合は
    /// PTRACE_PEEKDATA にフォールバックします。
    pub fn read(&self, addr: u64, size: usize) -> Result<Vec<u8>> {
        trace!("reading {} bytes at 0x{:x}", size, addr);
        match self.read_via_proc_mem(addr, size) {
            Ok(data) => Ok(data),
            Err(e) if e.raw_os_error() == Some(nix::libc::EIO) => self.read_via_ptrace(addr, size),
            Err(e) => Err(anyhow::anyhow!(
                "Failed to read {} bytes at 0x{:x}: {}",
                size,
                addr,
                e
            )),
        }
    }

    fn read_via_proc_mem(&self, addr: u64, size: usize) -> std::io::Result<Vec<u8>> {
        let mut file = File::open(format!("/proc/{}/mem", self.pid))?;
        file.seek(SeekFrom::Start(addr))?;
        let mut buffer = vec![0u8; size];
        file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    /// PTRACE_PEEKDATA でワード単位に読み取る
    pub fn read_via_ptrace(&self, addr: u64, size: usize) -> Result<Vec<u8>> {
        use nix::sys::ptrace;

        let word_size = std::mem::size_of::<nix::libc::c_long>();
        let mut data = Vec::with_capacity(size + word_size);

        for offset in (0..size).step_by(word_size) {
            let word_addr = addr + offset as u64;
            let word = ptrace::read(self.pid, word_addr as ptrace::AddressType).map_err(|e| {
                anyhow::anyhow!("Failed to read via ptrace at 0x{:x}: {}", word_addr, e)
            })?;
            data.extend_from_slice(&word.to_ne_bytes());
        }

        data.truncate(size);
        Ok(data)
    }

    /// /proc/pid/maps を解析する
    pub fn mappings(&self) -> Result<Vec<MemoryMapping>> {
        let maps_path = format!("/proc/{}/maps", self.pid);
        let file = File::open(&maps_path)
            .map_err(|e| anyhow::anyhow!("Failed to open {}: {}", maps_path, e))?;

        let mut mappings = Vec::new();
        for line in BufReader::new(file).lines() {
            if let Some(mapping) = MemoryMapping::parse_line(&line?)? {
                mappings.push(mapping);
            }
        }
        Ok(mappings)
    }

    /// 指定したバイナリがロードされたベースアドレスを求める
    ///
    /// PIEではELF上のシンボルアドレスにこの値を加える必要があります。
    pub fn load_base(&self, binary: &Path) -> Result<u64> {
        let mappings = self.mappings()?;
        load_base_from(&mappings, binary)
    }
}

/// マッピング一覧からバイナリのロードベースを求める
pub fn load_base_from(mappings: &[MemoryMapping], binary: &Path) -> Result<u64> {
    let canonical = binary.canonicalize().ok();
    let file_name = binary.file_name();

    let matches_binary = |pathname: &str| {
        let path = Path::new(pathname);
        match &canonical {
            Some(c) if path == c.as_path() => true,
            _ => file_name.is_some() && path.file_name() == file_name,
        }
    };

    mappings
        .iter()
        .filter(|m| m.pathname.as_deref().is_some_and(|p| matches_binary(p)))
        .min_by_key(|m| m.start)
        .map(|m| m.start - m.offset)
        .ok_or_else(|| {
            anyhow::anyhow!("Could not find a mapping of {:?} in the target process", binary)
        })
}
