//! 制御ブロックプールの走査
//!
//! プールは「グループ -> ブロック -> スロット」の三段構成で、
//! 使用中のグループ数・ブロック数・スロット数までを辿ります。
//! 走査は遅延評価で、上限件数に達した時点でそれ以上対象を読みません。

use crate::liveness::{generation, is_live, STACK_KIND_NONE};
use crate::{FieldRef, Result, RuntimeProfile, TargetAccess};
use std::fmt;
use tracing::{debug, trace};

/// プールの構造
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolLayout {
    /// 使用中グループ数の変数のアドレス
    pub group_count: u64,
    /// グループポインタ配列のアドレス
    pub groups: u64,
    pub group_block_count: u64,
    pub group_blocks: u64,
    pub block_item_count: u64,
    pub block_items: u64,
}

/// 制御ブロックの構造
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlBlockLayout {
    pub size: u64,
    pub thread_id: u64,
    pub version_counter: u64,
    pub stack_kind: u64,
    pub stack: u64,
    pub entry: u64,
    /// スタックハンドル内の保存コンテキストへのポインタ
    pub stack_context: u64,
}

fn field<A: TargetAccess>(target: &A, f: FieldRef) -> Result<u64> {
    target.field_offset(f.type_name, f.path)
}

impl PoolLayout {
    pub fn resolve<A: TargetAccess>(profile: &RuntimeProfile, target: &A) -> Result<Self> {
        Ok(Self {
            group_count: target.resolve_symbol(&profile.pool_group_count)?,
            groups: target.resolve_symbol(&profile.pool_groups)?,
            group_block_count: field(target, profile.group_block_count)?,
            group_blocks: field(target, profile.group_blocks)?,
            block_item_count: field(target, profile.block_item_count)?,
            block_items: field(target, profile.block_items)?,
        })
    }
}

impl ControlBlockLayout {
    pub fn resolve<A: TargetAccess>(profile: &RuntimeProfile, target: &A) -> Result<Self> {
        Ok(Self {
            size: target.type_size(profile.control_block_type)?,
            thread_id: field(target, profile.meta_tid)?,
            version_counter: field(target, profile.meta_version_counter)?,
            stack_kind: field(target, profile.meta_stack_kind)?,
            stack: field(target, profile.meta_stack)?,
            entry: field(target, profile.meta_entry)?,
            stack_context: field(target, profile.stack_context)?,
        })
    }
}

/// プール内の位置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolLocation {
    pub group: u64,
    pub block: u64,
    pub slot: u64,
}

impl fmt::Display for PoolLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.group, self.block, self.slot)
    }
}

/// 生存中ファイバーひとつ分のスナップショット
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FiberRecord {
    pub thread_id: u64,
    /// エントリ関数のアドレス
    pub entry_function: u64,
    /// スタックハンドル（0ならスタックなし）
    pub stack_handle: u64,
    pub version_counter_address: u64,
    pub version: u32,
    pub stack_kind: u32,
    /// 制御ブロックのアドレス
    pub address: u64,
    pub location: PoolLocation,
}

impl FiberRecord {
    pub fn generation(&self) -> u32 {
        generation(self.thread_id)
    }

    pub fn has_stack(&self) -> bool {
        self.stack_handle != 0 && self.stack_kind != STACK_KIND_NONE
    }
}

#[derive(Debug, Clone, Copy)]
enum Cursor {
    Start,
    Group {
        ngroup: u64,
        group: u64,
    },
    Block {
        ngroup: u64,
        group: u64,
        group_addr: u64,
        nblock: u64,
        block: u64,
    },
    Slot {
        ngroup: u64,
        group: u64,
        group_addr: u64,
        nblock: u64,
        block: u64,
        block_addr: u64,
        nitem: u64,
        slot: u64,
    },
    Done,
}

/// 生存ファイバーを順に返すイテレータ
///
/// 読み取りに失敗したらそのエラーを一度返して終了します。
pub struct PoolScanner<'a, A> {
    target: &'a A,
    pool: PoolLayout,
    meta: ControlBlockLayout,
    cap: usize,
    accepted: usize,
    cursor: Cursor,
}

impl<'a, A: TargetAccess> PoolScanner<'a, A> {
    pub fn new(target: &'a A, pool: PoolLayout, meta: ControlBlockLayout, cap: usize) -> Self {
        Self {
            target,
            pool,
            meta,
            cap,
            accepted: 0,
            cursor: Cursor::Start,
        }
    }

    /// 次の使用中スロットへ進む
    fn next_slot(&mut self) -> Result<Option<(PoolLocation, u64)>> {
        let target = self.target;
        let pool = self.pool;
        loop {
            let cursor = self.cursor;
            self.cursor = match cursor {
                Cursor::Done => return Ok(None),
                Cursor::Start => {
                    let ngroup = target.read::<u64>(pool.group_count)?;
                    debug!("pool has {} groups", ngroup);
                    Cursor::Group { ngroup, group: 0 }
                }
                Cursor::Group { ngroup, group } => {
                    if group >= ngroup {
                        Cursor::Done
                    } else {
                        let group_addr = target.read_pointer(pool.groups.wrapping_add(group * 8))?;
                        if group_addr == 0 {
                            Cursor::Group {
                                ngroup,
                                group: group + 1,
                            }
                        } else {
                            let nblock =
                                target.read::<u64>(group_addr.wrapping_add(pool.group_block_count))?;
                            trace!("group {} at 0x{:x}: {} blocks", group, group_addr, nblock);
                            Cursor::Block {
                                ngroup,
                                group,
                                group_addr,
                                nblock,
                                block: 0,
                            }
                        }
                    }
                }
                Cursor::Block {
                    ngroup,
                    group,
                    group_addr,
                    nblock,
                    block,
                } => {
                    if block >= nblock {
                        Cursor::Group {
                            ngroup,
                            group: group + 1,
                        }
                    } else {
                        let block_addr =
                            target.read_pointer(
                                group_addr.wrapping_add(pool.group_blocks + block * 8),
                            )?;
                        if block_addr == 0 {
                            Cursor::Block {
                                ngroup,
                                group,
                                group_addr,
                                nblock,
                                block: block + 1,
                            }
                        } else {
                            let nitem = target.read::<u64>(block_addr.wrapping_add(pool.block_item_count))?;
                            Cursor::Slot {
                                ngroup,
                                group,
                                group_addr,
                                nblock,
                                block,
                                block_addr,
                                nitem,
                                slot: 0,
                            }
                        }
                    }
                }
                Cursor::Slot {
                    ngroup,
                    group,
                    group_addr,
                    nblock,
                    block,
                    block_addr,
                    nitem,
                    slot,
                } => {
                    if slot >= nitem {
                        Cursor::Block {
                            ngroup,
                            group,
                            group_addr,
                            nblock,
                            block: block + 1,
                        }
                    } else {
                        self.cursor = Cursor::Slot {
                            ngroup,
                            group,
                            group_addr,
                            nblock,
                            block,
                            block_addr,
                            nitem,
                            slot: slot + 1,
                        };
                        let address = block_addr
                            .wrapping_add(pool.block_items)
                            .wrapping_add(slot.wrapping_mul(self.meta.size));
                        let location = PoolLocation { group, block, slot };
                        return Ok(Some((location, address)));
                    }
                }
            };
        }
    }

    /// スロットを読み、生存していればレコードにする
    fn read_candidate(&self, location: PoolLocation, address: u64) -> Result<Option<FiberRecord>> {
        let target = self.target;
        let meta = self.meta;

        let thread_id = target.read::<u64>(address.wrapping_add(meta.thread_id))?;
        let stack_kind = target.read::<u32>(address.wrapping_add(meta.stack_kind))?;
        let version_counter_address = target.read_pointer(address.wrapping_add(meta.version_counter))?;
        if version_counter_address == 0 {
            return Ok(None);
        }
        let version = target.read::<u32>(version_counter_address)?;

        if !is_live(thread_id, version, stack_kind) {
            return Ok(None);
        }

        Ok(Some(FiberRecord {
            thread_id,
            entry_function: target.read_pointer(address.wrapping_add(meta.entry))?,
            stack_handle: target.read_pointer(address.wrapping_add(meta.stack))?,
            version_counter_address,
            version,
            stack_kind,
            address,
            location,
        }))
    }
}

impl<A: TargetAccess> Iterator for PoolScanner<'_, A> {
    type Item = Result<FiberRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.accepted >= self.cap {
            return None;
        }
        loop {
            let (location, address) = match self.next_slot() {
                Ok(Some(slot)) => slot,
                Ok(None) => return None,
                Err(e) => {
                    self.cursor = Cursor::Done;
                    return Some(Err(e));
                }
            };
            match self.read_candidate(location, address) {
                Ok(Some(record)) => {
                    self.accepted += 1;
                    return Some(Ok(record));
                }
                Ok(None) => continue,
                Err(e) => {
                    self.cursor = Cursor::Done;
                    return Some(Err(e));
                }
            }
        }
    }
}

/// 生存ファイバーを最大 `cap` 件集める
pub fn scan_fibers<A: TargetAccess>(
    target: &A,
    pool: PoolLayout,
    meta: ControlBlockLayout,
    cap: usize,
) -> Result<Vec<FiberRecord>> {
    let fibers = PoolScanner::new(target, pool, meta, cap).collect::<Result<Vec<_>>>()?;
    debug!("scanned {} live fibers (cap {})", fibers.len(), cap);
    Ok(fibers)
}
