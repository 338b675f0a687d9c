//! MIT License
//!
//! Copyright (c) 2026 Pmm Developers
//!
//! Per-CPU Pages (PCP) - 每CPU页缓存
//!
//! 减少区域级锁的竞争：order-0 的分配/释放走本地缓存，
//! 空了就从伙伴系统一次持锁批量取 batch 页，满了就批量归还。
//!
//! # 设计
//! - 每个 (CPU, 区域) 一个槽位，槽位自带小自旋锁：常规路径上
//!   没有跨处理器锁竞争；被抢占后迁移到别的 CPU 的上下文
//!   操作的仍是"它锁住的那个槽位"，不会破坏共享状态
//! - 批量换入换出摊薄锁成本，代价是每 CPU 至多一批页的滞留：
//!   这些页从区域视角"在用"，水位检查只读区域计数，正是为了
//!   把这部分松弛算在内

use crate::config::{MIGRATE_TYPES, PCP_BATCH, PCP_HIGH};
use crate::list::PageList;
use crate::page::Pfn;
use crate::page_desc::{MemMap, MigrateType, PageFlag};
use crate::zone::Zone;

/// 单个 (CPU, 区域) 槽位的页缓存
pub struct PcpSet {
    /// 每种迁移类型一条 order-0 页链
    lists: [PageList; MIGRATE_TYPES],
    /// 高水位：超过时批量归还
    high: usize,
    /// 批量操作数量
    batch: usize,
}

impl PcpSet {
    pub const fn new() -> Self {
        Self {
            lists: [PageList::new(), PageList::new(), PageList::new()],
            high: PCP_HIGH,
            batch: PCP_BATCH,
        }
    }

    /// 槽位缓存的总页数
    pub fn total(&self) -> usize {
        self.lists.iter().map(|l| l.len()).sum()
    }
}

/// 单 CPU 的 PCP 统计
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuPcpStats {
    pub counts: [usize; MIGRATE_TYPES],
}

impl Zone {
    /// 只从本地 CPU 缓存取一个 order-0 页，不触发重填
    ///
    /// 滞留在缓存里的页从区域视角早已"被取走"，所以这条路径
    /// 不受水位约束。
    pub(crate) fn pop_pcp_cached(&self, mem: &MemMap, cpu: usize, mt: MigrateType) -> Option<Pfn> {
        let mut pcp = self.pcp[cpu % self.pcp.len()].lock();
        let pfn = pcp.lists[mt as usize].pop_front(mem)?;
        mem.page(pfn).clear_flag(PageFlag::Pcp);
        Some(pfn)
    }

    /// 从本地 CPU 缓存分配一个 order-0 页
    ///
    /// 本地为空时从伙伴系统批量重填，一次持锁取 batch 页。
    pub(crate) fn alloc_pcp(&self, mem: &MemMap, cpu: usize, mt: MigrateType) -> Option<Pfn> {
        let mut pcp = self.pcp[cpu % self.pcp.len()].lock();

        if pcp.lists[mt as usize].is_empty() {
            let batch = pcp.batch;
            self.rmqueue_bulk(mem, batch, mt, &mut pcp.lists[mt as usize]);
        }

        let pfn = pcp.lists[mt as usize].pop_front(mem)?;
        mem.page(pfn).clear_flag(PageFlag::Pcp);
        Some(pfn)
    }

    /// 释放一个 order-0 页到本地 CPU 缓存
    ///
    /// 超过高水位时把一批最冷的页归还伙伴系统。
    pub(crate) fn free_pcp(&self, mem: &MemMap, cpu: usize, pfn: Pfn, mt: MigrateType) {
        let mut pcp = self.pcp[cpu % self.pcp.len()].lock();

        mem.page(pfn).set_flag(PageFlag::Pcp);
        pcp.lists[mt as usize].push_front(mem, pfn);

        if pcp.lists[mt as usize].len() >= pcp.high {
            let batch = pcp.batch;
            for _ in 0..batch {
                match pcp.lists[mt as usize].pop_back(mem) {
                    Some(cold) => {
                        mem.page(cold).clear_flag(PageFlag::Pcp);
                        self.free_one_page(mem, cold, 0, mt);
                    }
                    None => break,
                }
            }
        }
    }

    /// 清空本区域所有 CPU 的页缓存
    ///
    /// 静息点（回收压力下、统计校验前）使用，把滞留页全部
    /// 归还伙伴系统。
    pub(crate) fn drain_pcp(&self, mem: &MemMap) {
        for slot in &self.pcp {
            let mut pcp = slot.lock();
            for mt_idx in 0..MIGRATE_TYPES {
                let mt = MigrateType::from_index(mt_idx);
                while let Some(pfn) = pcp.lists[mt_idx].pop_back(mem) {
                    mem.page(pfn).clear_flag(PageFlag::Pcp);
                    self.free_one_page(mem, pfn, 0, mt);
                }
            }
        }
    }

    /// 各 CPU 槽位的缓存页数快照
    pub fn pcp_stats(&self) -> alloc::vec::Vec<CpuPcpStats> {
        self.pcp
            .iter()
            .map(|slot| {
                let pcp = slot.lock();
                let mut s = CpuPcpStats::default();
                for (i, list) in pcp.lists.iter().enumerate() {
                    s.counts[i] = list.len();
                }
                s
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zone::ZoneType;

    fn make_zone(nr_pages: usize) -> (MemMap, Zone) {
        let mem = MemMap::new(nr_pages);
        let zone = Zone::new(0, ZoneType::Normal, 0, nr_pages);
        zone.init_free_region(&mem, 0, nr_pages);
        (mem, zone)
    }

    #[test]
    fn test_pcp_refill_batches() {
        let (mem, zone) = make_zone(256);
        assert_eq!(zone.free_pages(), 256);

        // 第一次分配触发批量重填：区域计数一次性下降 batch
        let pfn = zone.alloc_pcp(&mem, 0, MigrateType::Movable).unwrap();
        assert_eq!(zone.free_pages(), 256 - PCP_BATCH);
        assert!(!mem.page(pfn).test_flag(PageFlag::Pcp));

        // 后续 batch-1 次分配不再碰区域计数
        for _ in 0..PCP_BATCH - 1 {
            zone.alloc_pcp(&mem, 0, MigrateType::Movable).unwrap();
        }
        assert_eq!(zone.free_pages(), 256 - PCP_BATCH);
    }

    #[test]
    fn test_pcp_drain_on_overflow() {
        let (mem, zone) = make_zone(256);

        let mut held = alloc::vec::Vec::new();
        for _ in 0..PCP_HIGH {
            held.push(zone.alloc_pcp(&mem, 0, MigrateType::Movable).unwrap());
        }
        // 全部释放回 CPU 0 的缓存，触达高水位后应批量回流
        for pfn in held {
            zone.free_pcp(&mem, 0, pfn, MigrateType::Movable);
        }
        let cached: usize = zone.pcp_stats()[0].counts.iter().sum();
        assert!(cached < PCP_HIGH, "overflow must drain a batch, got {}", cached);
    }

    #[test]
    fn test_drain_restores_zone_count() {
        let (mem, zone) = make_zone(256);

        let pfn = zone.alloc_pcp(&mem, 1, MigrateType::Movable).unwrap();
        zone.free_pcp(&mem, 1, pfn, MigrateType::Movable);
        assert!(zone.free_pages() < 256);

        zone.drain_pcp(&mem);
        assert_eq!(zone.free_pages(), 256);
        // 归还后完全合并
        assert_eq!(zone.buddy_stats().nr_free[8], 1);
    }

    #[test]
    fn test_pcp_slot_is_per_cpu() {
        let (mem, zone) = make_zone(256);
        let _ = zone.alloc_pcp(&mem, 0, MigrateType::Movable).unwrap();
        let stats = zone.pcp_stats();
        assert_eq!(stats[0].counts[MigrateType::Movable as usize], PCP_BATCH - 1);
        assert_eq!(stats[1].counts[MigrateType::Movable as usize], 0);
    }
}
