//! メモリ上に組み立てた疑似デバッグ対象
//!
//! 実プロセスを使わずにカウンタ・プール・保存コンテキストを再現し、
//! このクレートとcoreクレートのテストで使います。

use crate::{FiberError, Result, RuntimeProfile, SymbolSpec, TargetAccess, X86_64};
use std::collections::{BTreeMap, HashMap};

/// 疑似プロセス
#[derive(Debug, Clone)]
pub struct FakeTarget {
    /// 領域の先頭アドレス -> 内容
    memory: BTreeMap<u64, Vec<u8>>,
    symbols: HashMap<String, u64>,
    fields: HashMap<(String, String), u64>,
    sizes: HashMap<String, u64>,
    registers: HashMap<String, u64>,
    register_writes: usize,
    fail_register_writes: bool,
    next_alloc: u64,
}

impl Default for FakeTarget {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeTarget {
    pub fn new() -> Self {
        Self {
            memory: BTreeMap::new(),
            symbols: HashMap::new(),
            fields: HashMap::new(),
            sizes: HashMap::new(),
            registers: HashMap::new(),
            register_writes: 0,
            fail_register_writes: false,
            next_alloc: 0x10_0000,
        }
    }

    /// ゼロ埋めの領域を確保する（領域の間には読めない隙間を空ける）
    pub fn alloc(&mut self, size: u64) -> u64 {
        let addr = self.next_alloc;
        self.memory.insert(addr, vec![0; size as usize]);
        self.next_alloc = (addr + size + 0x10 + 0xf) & !0xf;
        addr
    }

    pub fn write_bytes(&mut self, addr: u64, bytes: &[u8]) {
        if let Some((&start, data)) = self.memory.range_mut(..=addr).next_back() {
            let offset = (addr - start) as usize;
            if offset + bytes.len() <= data.len() {
                data[offset..offset + bytes.len()].copy_from_slice(bytes);
                return;
            }
        }
        self.memory.insert(addr, bytes.to_vec());
    }

    pub fn write_u64(&mut self, addr: u64, value: u64) {
        self.write_bytes(addr, &value.to_le_bytes());
    }

    pub fn write_u32(&mut self, addr: u64, value: u32) {
        self.write_bytes(addr, &value.to_le_bytes());
    }

    pub fn write_i64(&mut self, addr: u64, value: i64) {
        self.write_bytes(addr, &value.to_le_bytes());
    }

    pub fn define_symbol(&mut self, name: &str, addr: u64) {
        self.symbols.insert(name.to_string(), addr);
    }

    pub fn define_field(&mut self, type_name: &str, path: &str, offset: u64) {
        self.fields
            .insert((type_name.to_string(), path.to_string()), offset);
    }

    pub fn define_size(&mut self, type_name: &str, size: u64) {
        self.sizes.insert(type_name.to_string(), size);
    }

    /// レジスタを設定する（書き込み回数には数えない）
    pub fn set_register(&mut self, name: &str, value: u64) {
        self.registers.insert(name.to_string(), value);
    }

    pub fn register(&self, name: &str) -> Option<u64> {
        self.registers.get(name).copied()
    }

    /// 全レジスタの写し
    pub fn registers(&self) -> HashMap<String, u64> {
        self.registers.clone()
    }

    /// `write_register` が呼ばれた回数
    pub fn register_writes(&self) -> usize {
        self.register_writes
    }

    /// 以降のレジスタ書き込みを失敗させる
    pub fn fail_register_writes(&mut self, fail: bool) {
        self.fail_register_writes = fail;
    }

    /// 保存コンテキストを持つスタックハンドルを作る
    ///
    /// 戻り値は (スタックハンドル, コンテキストのアドレス)。
    /// コンテキストポインタはハンドルの `context_offset` に置かれる。
    pub fn saved_stack(&mut self, context_offset: u64, saved: &SavedRegisters) -> (u64, u64) {
        let handle = self.alloc(context_offset + 8);
        let stack = self.alloc(0x200);
        let context = stack + 0x100;

        for (name, value) in saved.words() {
            if let Some(idx) = X86_64.word_index(name) {
                self.write_u64(context + idx * X86_64.word_size, value);
            }
        }
        self.write_u64(handle + context_offset, context);
        (handle, context)
    }
}

impl TargetAccess for FakeTarget {
    fn resolve_symbol(&self, symbol: &SymbolSpec) -> Result<u64> {
        symbol
            .candidates
            .iter()
            .find_map(|name| self.symbols.get(*name).copied())
            .ok_or_else(|| FiberError::SymbolNotFound(symbol.to_string()).into())
    }

    fn field_offset(&self, type_name: &str, path: &str) -> Result<u64> {
        self.fields
            .get(&(type_name.to_string(), path.to_string()))
            .copied()
            .ok_or_else(|| {
                FiberError::LayoutNotFound {
                    type_name: type_name.to_string(),
                    field: path.to_string(),
                }
                .into()
            })
    }

    fn type_size(&self, type_name: &str) -> Result<u64> {
        self.sizes.get(type_name).copied().ok_or_else(|| {
            FiberError::LayoutNotFound {
                type_name: type_name.to_string(),
                field: String::new(),
            }
            .into()
        })
    }

    fn read_memory(&self, address: u64, len: usize) -> Result<Vec<u8>> {
        let fault = || FiberError::MemoryReadFault {
            address,
            reason: "address is not mapped".to_string(),
        };
        let (&start, data) = self
            .memory
            .range(..=address)
            .next_back()
            .ok_or_else(fault)?;
        let offset = (address - start) as usize;
        if offset + len > data.len() {
            return Err(fault().into());
        }
        Ok(data[offset..offset + len].to_vec())
    }

    fn read_register(&self, name: &str) -> Result<u64> {
        self.register(name)
            .ok_or_else(|| anyhow::anyhow!("Unknown register: {}", name))
    }

    fn write_register(&mut self, name: &str, value: u64) -> Result<()> {
        self.register_writes += 1;
        if self.fail_register_writes {
            anyhow::bail!("Failed to set register {}", name);
        }
        self.registers.insert(name.to_string(), value);
        Ok(())
    }
}

/// 保存コンテキストに置くレジスタ値
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SavedRegisters {
    pub rip: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
}

impl SavedRegisters {
    /// ipとfpだけを指定する
    pub fn at(rip: u64, rbp: u64) -> Self {
        Self {
            rip,
            rbp,
            ..Self::default()
        }
    }

    fn words(&self) -> [(&'static str, u64); 7] {
        [
            ("rip", self.rip),
            ("rbp", self.rbp),
            ("rbx", self.rbx),
            ("r15", self.r15),
            ("r14", self.r14),
            ("r13", self.r13),
            ("r12", self.r12),
        ]
    }
}

/// プールの1スロット分の内容
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotSpec {
    pub thread_id: u64,
    pub version: u32,
    pub stack_kind: u32,
    pub stack_handle: u64,
    pub entry: u64,
}

impl SlotSpec {
    /// 生存中のファイバー（スタックハンドルなし）
    pub fn live(generation: u32, entry: u64) -> Self {
        Self {
            thread_id: ((generation as u64) << 32) | (entry & 0xffff_ffff),
            version: generation,
            stack_kind: 1,
            stack_handle: 0,
            entry,
        }
    }

    /// 再利用されて世代が進んだスロット
    pub fn stale(generation: u32, entry: u64) -> Self {
        Self {
            version: generation.wrapping_add(1),
            ..Self::live(generation, entry)
        }
    }

    /// スタック種別が「なし」のスロット
    pub fn without_stack(generation: u32, entry: u64) -> Self {
        Self {
            stack_kind: 0,
            ..Self::live(generation, entry)
        }
    }

    pub fn with_stack(self, stack_handle: u64) -> Self {
        Self {
            stack_handle,
            ..self
        }
    }
}

// 疑似ランタイムの構造体レイアウト
const TASK_CONTROL_SIZE: u64 = 0x80;
const COUNTER_BASE: u64 = 0x40;
const COUNTER_ROOT: u64 = 0x50;
const SHARD_SIZE: u64 = 0x20;
const SHARD_NEXT: u64 = 0x08;
const SHARD_VALUE: u64 = 0x18;
const MAX_GROUPS: u64 = 16;
const MAX_BLOCKS: u64 = 16;
const GROUP_NBLOCK: u64 = 0x00;
const GROUP_BLOCKS: u64 = 0x08;
const BLOCK_NITEM: u64 = 0x00;
const BLOCK_ITEMS: u64 = 0x10;
const META_SIZE: u64 = 0x60;
const META_TID: u64 = 0x08;
const META_VERSION: u64 = 0x10;
const META_STACK_KIND: u64 = 0x1c;
const META_STACK: u64 = 0x28;
const META_ENTRY: u64 = 0x30;
/// スタックハンドル内のコンテキストポインタ位置
pub const STACK_CONTEXT: u64 = 0x10;

/// プロファイルの型名・シンボル名で組み立てた疑似ランタイム
#[derive(Debug, Clone)]
pub struct FakeRuntime {
    pub target: FakeTarget,
    control: u64,
    group_count: u64,
    groups: u64,
    group_addrs: Vec<u64>,
    shards: Vec<u64>,
}

impl FakeRuntime {
    /// 空のランタイム（カウンタ0、グループなし）
    pub fn new(profile: &RuntimeProfile) -> Self {
        let mut target = FakeTarget::new();

        let offsets = [
            (profile.counter_base, COUNTER_BASE),
            (profile.counter_root, COUNTER_ROOT),
            (profile.shard_next, SHARD_NEXT),
            (profile.shard_value, SHARD_VALUE),
            (profile.group_block_count, GROUP_NBLOCK),
            (profile.group_blocks, GROUP_BLOCKS),
            (profile.block_item_count, BLOCK_NITEM),
            (profile.block_items, BLOCK_ITEMS),
            (profile.meta_tid, META_TID),
            (profile.meta_version_counter, META_VERSION),
            (profile.meta_stack_kind, META_STACK_KIND),
            (profile.meta_stack, META_STACK),
            (profile.meta_entry, META_ENTRY),
            (profile.stack_context, STACK_CONTEXT),
        ];
        for (field, offset) in offsets {
            target.define_field(field.type_name, field.path, offset);
        }
        target.define_size(profile.control_block_type, META_SIZE);

        let control = target.alloc(TASK_CONTROL_SIZE);
        let root = control + COUNTER_ROOT;
        target.write_u64(root + SHARD_NEXT, root);
        let control_symbol = if profile.task_control_is_pointer {
            let ptr = target.alloc(8);
            target.write_u64(ptr, control);
            ptr
        } else {
            control
        };
        define_first(&mut target, &profile.task_control, control_symbol);

        let group_count = target.alloc(8);
        let groups = target.alloc(MAX_GROUPS * 8);
        define_first(&mut target, &profile.pool_group_count, group_count);
        define_first(&mut target, &profile.pool_groups, groups);

        for (name, value) in [
            ("rip", 0x40_1000),
            ("rsp", 0x7fff_f000),
            ("rbp", 0x7fff_f100),
            ("rbx", 0x11),
            ("r12", 0x12),
            ("r13", 0x13),
            ("r14", 0x14),
            ("r15", 0x15),
        ] {
            target.set_register(name, value);
        }

        Self {
            target,
            control,
            group_count,
            groups,
            group_addrs: Vec::new(),
            shards: Vec::new(),
        }
    }

    /// 基底値とシャード値を設定する（既存のシャードは捨てる）
    pub fn set_counter(&mut self, base: i64, shard_values: &[i64]) {
        self.target.write_i64(self.control + COUNTER_BASE, base);

        let root = self.control + COUNTER_ROOT;
        self.shards = shard_values
            .iter()
            .map(|&value| {
                let shard = self.target.alloc(SHARD_SIZE);
                self.target.write_i64(shard + SHARD_VALUE, value);
                shard
            })
            .collect();

        let mut prev = root;
        for &shard in &self.shards {
            self.target.write_u64(prev + SHARD_NEXT, shard);
            prev = shard;
        }
        self.target.write_u64(prev + SHARD_NEXT, root);
    }

    /// 最後のノードの次ポインタを書き換えてリングを壊す
    pub fn break_counter_ring(&mut self, next: u64) {
        let last = self
            .shards
            .last()
            .copied()
            .unwrap_or(self.control + COUNTER_ROOT);
        self.target.write_u64(last + SHARD_NEXT, next);
    }

    /// グループを追加してその番号を返す
    pub fn add_group(&mut self) -> usize {
        let idx = self.group_addrs.len() as u64;
        assert!(idx < MAX_GROUPS, "too many groups");
        let group = self.target.alloc(GROUP_BLOCKS + MAX_BLOCKS * 8);
        self.target.write_u64(self.groups + idx * 8, group);
        self.target.write_u64(self.group_count, idx + 1);
        self.group_addrs.push(group);
        idx as usize
    }

    /// スロットを並べたブロックをグループに追加する
    pub fn add_block(&mut self, group: usize, slots: &[SlotSpec]) -> u64 {
        let block = self
            .target
            .alloc(BLOCK_ITEMS + slots.len() as u64 * META_SIZE);
        self.target.write_u64(block + BLOCK_NITEM, slots.len() as u64);

        for (i, slot) in slots.iter().enumerate() {
            let meta = block + BLOCK_ITEMS + i as u64 * META_SIZE;
            let version = self.target.alloc(4);
            self.target.write_u32(version, slot.version);
            self.target.write_u64(meta + META_TID, slot.thread_id);
            self.target.write_u64(meta + META_VERSION, version);
            self.target.write_u32(meta + META_STACK_KIND, slot.stack_kind);
            self.target.write_u64(meta + META_STACK, slot.stack_handle);
            self.target.write_u64(meta + META_ENTRY, slot.entry);
        }

        self.push_block(group, block);
        block
    }

    /// 読めないアドレスを指すブロックをグループに追加する
    pub fn add_dangling_block(&mut self, group: usize, addr: u64) {
        self.push_block(group, addr);
    }

    /// 保存コンテキストを持つスタックハンドルを作る
    pub fn saved_stack(&mut self, saved: &SavedRegisters) -> u64 {
        self.target.saved_stack(STACK_CONTEXT, saved).0
    }

    fn push_block(&mut self, group: usize, block: u64) {
        let group_addr = self.group_addrs[group];
        let nblock = self
            .target
            .read::<u64>(group_addr + GROUP_NBLOCK)
            .unwrap_or(0);
        assert!(nblock < MAX_BLOCKS, "too many blocks");
        self.target
            .write_u64(group_addr + GROUP_BLOCKS + nblock * 8, block);
        self.target.write_u64(group_addr + GROUP_NBLOCK, nblock + 1);
    }
}

fn define_first(target: &mut FakeTarget, spec: &SymbolSpec, addr: u64) {
    if let Some(name) = spec.candidates.first() {
        target.define_symbol(name, addr);
    }
}
