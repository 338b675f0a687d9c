//! Buddy System (伙伴系统) 页块分配器
//!
//! 区域内的空闲内存按 2^order 页的块管理，每个 order 一组空闲链，
//! 链内再按迁移类型二级分链。
//!
//! 算法原理：
//! - 分配：从请求 order 向上找第一个非空链，逐级分裂，
//!   每次分裂把高半块放回低一级空闲链
//! - 释放：通过 XOR 计算伙伴位置，伙伴空闲且同 order 就合并，
//!   逐级向上重复
//! - 只要伙伴可合并就无条件合并，从不把可合并的块留成两半，
//!   保证高 order 分配长期可行
//!
//! 伙伴判定：同 order 的两个块互为伙伴，当且仅当它们相邻且
//! 区域内相对地址只在 order 对应的位上不同（XOR 可直接算出，无需搜索）。

use crate::config::{MAX_ORDER, NR_ORDERS};
use crate::error::AllocError;
use crate::list::PageList;
use crate::page::Pfn;
use crate::page_desc::{MemMap, MigrateType, PageFlag};
use crate::zone::{FreeArea, Zone};

/// 伙伴块统计
#[derive(Debug, Clone, Copy, Default)]
pub struct BuddyStats {
    /// 每个 order 的空闲块数
    pub nr_free: [usize; NR_ORDERS],
    /// 空闲页总数
    pub free_pages: usize,
}

impl Zone {
    /// 区域内相对索引
    #[inline]
    fn rel(&self, pfn: Pfn) -> usize {
        pfn - self.start_pfn()
    }

    /// 启动：把一段可用区域放入伙伴系统
    ///
    /// 按"最大且对齐"的块逐块释放，区域中间的空洞由调用者排除。
    pub(crate) fn init_free_region(&self, mem: &MemMap, start: Pfn, nr_pages: usize) {
        for pfn in start..start + nr_pages {
            mem.page(pfn).init_free();
        }
        self.add_managed(nr_pages);

        let mut cur = start;
        let end = start + nr_pages;
        while cur < end {
            let rel = self.rel(cur);
            let mut order = MAX_ORDER;
            while order > 0 {
                let size = 1usize << order;
                if rel % size == 0 && cur + size <= end {
                    break;
                }
                order -= 1;
            }
            self.free_one_page(mem, cur, order, MigrateType::Movable);
            cur += 1 << order;
        }
    }

    /// 分配一个 2^order 页的块
    ///
    /// 失败仅当请求 order 到最大 order 之间没有任何空闲块。
    pub(crate) fn rmqueue(
        &self,
        mem: &MemMap,
        order: usize,
        mt: MigrateType,
    ) -> Result<Pfn, AllocError> {
        let mut area = self.freelist.lock();
        match Self::queue_pop(&mut area, mem, self.start_pfn(), order, mt) {
            Some(pfn) => {
                self.sub_free(1 << order);
                Ok(pfn)
            }
            None => Err(AllocError::OutOfMemory),
        }
    }

    /// 批量取 order-0 页（Per-CPU 缓存重填，一次持锁）
    ///
    /// 返回实际取到的页数，页挂在 `out` 上。
    pub(crate) fn rmqueue_bulk(
        &self,
        mem: &MemMap,
        count: usize,
        mt: MigrateType,
        out: &mut PageList,
    ) -> usize {
        let mut area = self.freelist.lock();
        let mut got = 0;
        for _ in 0..count {
            match Self::queue_pop(&mut area, mem, self.start_pfn(), 0, mt) {
                Some(pfn) => {
                    mem.page(pfn).set_flag(PageFlag::Pcp);
                    out.push_front(mem, pfn);
                    got += 1;
                }
                None => break,
            }
        }
        self.sub_free(got);
        got
    }

    /// 持锁的分配核心：找块、摘链、逐级分裂
    fn queue_pop(
        area: &mut FreeArea,
        mem: &MemMap,
        start_pfn: Pfn,
        order: usize,
        mt: MigrateType,
    ) -> Option<Pfn> {
        // 先在精确迁移类型中逐 order 找，再按借用顺序偷取
        let candidates = [mt, mt.fallbacks()[0], mt.fallbacks()[1]];
        for list_mt in candidates {
            for cur in order..NR_ORDERS {
                if area.areas[cur].lists[list_mt as usize].is_empty() {
                    continue;
                }
                let pfn = match area.areas[cur].lists[list_mt as usize].pop_front(mem) {
                    Some(pfn) => pfn,
                    None => continue,
                };
                area.areas[cur].nr_free -= 1;

                let page = mem.page(pfn);
                page.clear_flag(PageFlag::Buddy);

                Self::expand(area, mem, start_pfn, pfn, order, cur, list_mt);
                return Some(pfn);
            }
        }
        None
    }

    /// 把一个 high order 的块分裂到 low order，高半块逐级放回空闲链
    fn expand(
        area: &mut FreeArea,
        mem: &MemMap,
        start_pfn: Pfn,
        pfn: Pfn,
        low: usize,
        high: usize,
        mt: MigrateType,
    ) {
        let rel = pfn - start_pfn;
        let mut cur = high;
        while cur > low {
            cur -= 1;
            let half_rel = rel + (1 << cur);
            let half_pfn = start_pfn + half_rel;
            let half = mem.page(half_pfn);

            half.set_private(cur);
            half.set_migrate_type(mt);
            half.set_flag(PageFlag::Buddy);
            area.areas[cur].lists[mt as usize].push_front(mem, half_pfn);
            area.areas[cur].nr_free += 1;
        }
    }

    /// 释放一个 2^order 页的块，尽可能与伙伴合并
    pub(crate) fn free_one_page(&self, mem: &MemMap, pfn: Pfn, order: usize, mt: MigrateType) {
        let mut area = self.freelist.lock();

        let page = mem.page(pfn);
        if page.is_buddy() {
            panic!(
                "buddy invariant violated: pfn {} already free at order {}",
                pfn,
                page.private()
            );
        }

        let mut rel = self.rel(pfn);
        let mut cur = order;

        while cur < MAX_ORDER {
            let buddy_rel = rel ^ (1 << cur);
            // 伙伴超出区域范围，无法合并
            if buddy_rel + (1 << cur) > self.span() {
                break;
            }
            let buddy_pfn = self.start_pfn() + buddy_rel;
            let buddy = mem.page(buddy_pfn);

            // 伙伴不空闲或大小不匹配，无法合并
            if !buddy.is_buddy() || buddy.private() != cur {
                break;
            }

            let buddy_mt = buddy.migrate_type();
            area.areas[cur].lists[buddy_mt as usize].remove(mem, buddy_pfn);
            area.areas[cur].nr_free -= 1;
            buddy.clear_flag(PageFlag::Buddy);

            // 合并：地址较小的作为新块首页
            if buddy_rel < rel {
                rel = buddy_rel;
            }
            cur += 1;
        }

        let head_pfn = self.start_pfn() + rel;
        let head = mem.page(head_pfn);
        head.set_private(cur);
        head.set_migrate_type(mt);
        head.set_flag(PageFlag::Buddy);
        area.areas[cur].lists[mt as usize].push_front(mem, head_pfn);
        area.areas[cur].nr_free += 1;

        self.add_free(1 << order);
    }

    /// 摘除一个指定的 order-0 空闲页（规整的迁移目标）
    ///
    /// 只接受独立的 order-0 空闲块首页；属于更大块的页不拆。
    pub(crate) fn isolate_free_page(&self, mem: &MemMap, pfn: Pfn) -> bool {
        let mut area = self.freelist.lock();
        let page = mem.page(pfn);
        if !page.is_buddy() || page.private() != 0 {
            return false;
        }
        let mt = page.migrate_type();
        area.areas[0].lists[mt as usize].remove(mem, pfn);
        area.areas[0].nr_free -= 1;
        page.clear_flag(PageFlag::Buddy);
        self.sub_free(1);
        true
    }

    /// 伙伴块统计快照
    pub fn buddy_stats(&self) -> BuddyStats {
        let area = self.freelist.lock();
        let mut stats = BuddyStats::default();
        for (order, oa) in area.areas.iter().enumerate() {
            stats.nr_free[order] = oa.nr_free;
            stats.free_pages += oa.nr_free << order;
        }
        stats
    }

    /// 指定页帧是否是 order 对应的空闲块首页（测试与规整用）
    pub fn is_free_block(&self, mem: &MemMap, pfn: Pfn, order: usize) -> bool {
        let _area = self.freelist.lock();
        let page = mem.page(pfn);
        page.is_buddy() && page.private() == order
    }

    /// 能满足 order 请求的最小空闲块是否存在
    pub fn has_free_block(&self, order: usize) -> bool {
        let area = self.freelist.lock();
        (order..NR_ORDERS).any(|o| area.areas[o].nr_free > 0)
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
    fn test_init_merges_to_max_blocks() {
        let (_mem, zone) = make_zone(1024);
        let stats = zone.buddy_stats();
        assert_eq!(stats.free_pages, 1024);
        // 1024 = 2^10，应该是一整块 MAX_ORDER 的块
        assert_eq!(stats.nr_free[MAX_ORDER], 1);
        for order in 0..MAX_ORDER {
            assert_eq!(stats.nr_free[order], 0, "order {} should be empty", order);
        }
    }

    #[test]
    fn test_split_and_remerge() {
        let (mem, zone) = make_zone(1024);

        let pfn = zone.rmqueue(&mem, 0, MigrateType::Movable).unwrap();
        assert_eq!(zone.free_pages(), 1023);

        // 分裂后每个低 order 各剩一个高半块
        let stats = zone.buddy_stats();
        for order in 0..MAX_ORDER {
            assert_eq!(stats.nr_free[order], 1);
        }

        // 释放后应完全合并回一整块
        zone.free_one_page(&mem, pfn, 0, MigrateType::Movable);
        let stats = zone.buddy_stats();
        assert_eq!(stats.free_pages, 1024);
        assert_eq!(stats.nr_free[MAX_ORDER], 1);
        assert_eq!(stats.nr_free[0], 0);
    }

    #[test]
    fn test_buddy_merge_is_exact() {
        // 释放两个已知互为伙伴的 order-2 块，空闲链上应只出现
        // 一个低地址的 order-3 块，原地址上不再有 order-2 块
        let (mem, zone) = make_zone(64);

        // 清空整个区域
        let mut held = alloc::vec::Vec::new();
        while let Ok(pfn) = zone.rmqueue(&mem, 2, MigrateType::Movable) {
            held.push(pfn);
        }
        assert_eq!(zone.free_pages(), 0);

        // 8 和 12 相对地址只差 bit2，互为伙伴
        assert!(held.contains(&8) && held.contains(&12));
        zone.free_one_page(&mem, 8, 2, MigrateType::Movable);
        zone.free_one_page(&mem, 12, 2, MigrateType::Movable);

        assert!(zone.is_free_block(&mem, 8, 3));
        assert!(!zone.is_free_block(&mem, 8, 2));
        assert!(!zone.is_free_block(&mem, 12, 2));
        let stats = zone.buddy_stats();
        assert_eq!(stats.nr_free[2], 0);
        assert_eq!(stats.nr_free[3], 1);
    }

    #[test]
    fn test_conservation() {
        let (mem, zone) = make_zone(512);
        let total = zone.managed_pages();

        let mut held = alloc::vec::Vec::new();
        for order in [0usize, 1, 3, 2, 0, 4] {
            let pfn = zone.rmqueue(&mem, order, MigrateType::Unmovable).unwrap();
            held.push((pfn, order));
        }
        let allocated: usize = held.iter().map(|(_, o)| 1usize << o).sum();
        assert_eq!(zone.free_pages() + allocated, total);
        assert_eq!(zone.buddy_stats().free_pages, zone.free_pages());

        for (pfn, order) in held {
            zone.free_one_page(&mem, pfn, order, MigrateType::Unmovable);
        }
        assert_eq!(zone.free_pages(), total);
        // 全部释放后重新合并为整块
        assert_eq!(zone.buddy_stats().nr_free[9], 1);
    }

    #[test]
    fn test_exhaustion() {
        let (mem, zone) = make_zone(16);
        for _ in 0..16 {
            zone.rmqueue(&mem, 0, MigrateType::Movable).unwrap();
        }
        assert_eq!(
            zone.rmqueue(&mem, 0, MigrateType::Movable),
            Err(AllocError::OutOfMemory)
        );
    }

    #[test]
    fn test_migrate_type_steal() {
        let (mem, zone) = make_zone(64);
        // 区域初始化全部挂在 Movable 链上，Unmovable 请求应能偷取
        let pfn = zone.rmqueue(&mem, 0, MigrateType::Unmovable);
        assert!(pfn.is_ok());
    }

    #[test]
    #[should_panic(expected = "buddy invariant violated")]
    fn test_free_twice_into_buddy_panics() {
        let (mem, zone) = make_zone(16);
        let pfn = zone.rmqueue(&mem, 0, MigrateType::Movable).unwrap();
        zone.free_one_page(&mem, pfn, 0, MigrateType::Movable);
        zone.free_one_page(&mem, pfn, 0, MigrateType::Movable);
    }

    #[test]
    fn test_isolate_free_page() {
        let (mem, zone) = make_zone(16);
        // 先拿一页制造一个独立的 order-0 空闲块
        let pfn = zone.rmqueue(&mem, 0, MigrateType::Movable).unwrap();
        zone.free_one_page(&mem, pfn, 0, MigrateType::Movable);
        // 释放后与伙伴合并，不再是 order-0 块，隔离应失败
        assert!(!zone.isolate_free_page(&mem, pfn));

        // 制造真正的 order-0 空洞：拿两页，释放一页，伙伴在用
        let a = zone.rmqueue(&mem, 0, MigrateType::Movable).unwrap();
        let _b = zone.rmqueue(&mem, 0, MigrateType::Movable).unwrap();
        zone.free_one_page(&mem, a, 0, MigrateType::Movable);
        if zone.is_free_block(&mem, a, 0) {
            assert!(zone.isolate_free_page(&mem, a));
            assert!(!mem.page(a).is_buddy());
        }
    }
}
