//! MIT License
//!
//! Copyright (c) 2026 Pmm Developers
//!

//! LRU 链表
//!
//! 每个区域按 {匿名, 文件} × {活跃, 不活跃} 持四条近似最近性
//! 排序的页链，外加一条不可驱逐链（无交换空间时的匿名页等）。
//! 回收总是从不活跃链的冷端（表尾）开始扫描；活跃链上被再次
//! 访问的页在降级时获得二次机会。

use crate::list::PageList;
use crate::page::Pfn;
use crate::page_desc::{MemMap, Page, PageFlag};
use crate::zone::Zone;

/// 客户注册页时的 LRU 类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LruCategory {
    /// 匿名页（交换空间支持）
    Anon,
    /// 文件页（有后备存储，可回写）
    File,
}

/// 区域内的具体链
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub(crate) enum LruKind {
    InactiveAnon = 0,
    ActiveAnon = 1,
    InactiveFile = 2,
    ActiveFile = 3,
    Unevictable = 4,
}

pub(crate) const NR_LRU_LISTS: usize = 5;

/// 根据页标志位推导它应当所在的链
pub(crate) fn page_lru_kind(page: &Page) -> LruKind {
    if page.test_flag(PageFlag::Unevictable) {
        LruKind::Unevictable
    } else if page.test_flag(PageFlag::SwapBacked) {
        if page.test_flag(PageFlag::Active) {
            LruKind::ActiveAnon
        } else {
            LruKind::InactiveAnon
        }
    } else if page.test_flag(PageFlag::Active) {
        LruKind::ActiveFile
    } else {
        LruKind::InactiveFile
    }
}

/// 区域的 LRU 链组（区域 LRU 锁保护）
pub(crate) struct LruLists {
    lists: [PageList; NR_LRU_LISTS],
}

impl LruLists {
    pub const fn new() -> Self {
        Self {
            lists: [
                PageList::new(),
                PageList::new(),
                PageList::new(),
                PageList::new(),
                PageList::new(),
            ],
        }
    }

    #[inline]
    pub fn list(&self, kind: LruKind) -> &PageList {
        &self.lists[kind as usize]
    }

    #[inline]
    pub fn list_mut(&mut self, kind: LruKind) -> &mut PageList {
        &mut self.lists[kind as usize]
    }
}

/// LRU 统计快照
#[derive(Debug, Clone, Copy, Default)]
pub struct LruStats {
    pub inactive_anon: usize,
    pub active_anon: usize,
    pub inactive_file: usize,
    pub active_file: usize,
    pub unevictable: usize,
}

impl LruStats {
    /// 可驱逐页总数
    pub fn evictable(&self) -> usize {
        self.inactive_anon + self.active_anon + self.inactive_file + self.active_file
    }
}

impl Zone {
    /// 把一个在用页挂到 LRU（客户注册可回收状态）
    ///
    /// 新页进不活跃链热端；匿名页标记 SwapBacked。
    pub(crate) fn lru_add(&self, mem: &MemMap, pfn: Pfn, category: LruCategory) {
        let page = mem.page(pfn);
        if page.flags().test_and_set(PageFlag::Lru) {
            // 已在 LRU 上，重复注册是无操作
            return;
        }
        if category == LruCategory::Anon {
            page.set_flag(PageFlag::SwapBacked);
        }

        let kind = page_lru_kind(page);
        let mut lru = self.lru.lock();
        lru.list_mut(kind).push_front(mem, pfn);
    }

    /// 从 LRU 摘除一个页（释放、迁移、回收时）
    pub(crate) fn lru_remove(&self, mem: &MemMap, pfn: Pfn) {
        let page = mem.page(pfn);
        let mut lru = self.lru.lock();
        // 持锁后再判定，和并发回收扫描互斥
        if !page.flags().test_and_clear(PageFlag::Lru) {
            return;
        }
        let kind = page_lru_kind(page);
        lru.list_mut(kind).remove(mem, pfn);
    }

    /// LRU 统计快照
    pub fn lru_stats(&self) -> LruStats {
        let lru = self.lru.lock();
        LruStats {
            inactive_anon: lru.list(LruKind::InactiveAnon).len(),
            active_anon: lru.list(LruKind::ActiveAnon).len(),
            inactive_file: lru.list(LruKind::InactiveFile).len(),
            active_file: lru.list(LruKind::ActiveFile).len(),
            unevictable: lru.list(LruKind::Unevictable).len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page_desc::MigrateType;
    use crate::zone::ZoneType;

    fn make_zone(nr_pages: usize) -> (MemMap, Zone) {
        let mem = MemMap::new(nr_pages);
        let zone = Zone::new(0, ZoneType::Normal, 0, nr_pages);
        zone.init_free_region(&mem, 0, nr_pages);
        (mem, zone)
    }

    #[test]
    fn test_lru_add_remove() {
        let (mem, zone) = make_zone(64);
        let pfn = zone.rmqueue(&mem, 0, MigrateType::Movable).unwrap();
        mem.page(pfn).set_refcount(1);

        zone.lru_add(&mem, pfn, LruCategory::Anon);
        assert!(mem.page(pfn).is_lru());
        assert!(mem.page(pfn).is_anonymous());
        assert_eq!(zone.lru_stats().inactive_anon, 1);

        // 重复注册无效果
        zone.lru_add(&mem, pfn, LruCategory::Anon);
        assert_eq!(zone.lru_stats().inactive_anon, 1);

        zone.lru_remove(&mem, pfn);
        assert!(!mem.page(pfn).is_lru());
        assert_eq!(zone.lru_stats().evictable(), 0);
    }

    #[test]
    fn test_lru_kind_from_flags() {
        let page = Page::new();
        assert_eq!(page_lru_kind(&page), LruKind::InactiveFile);
        page.set_flag(PageFlag::Active);
        assert_eq!(page_lru_kind(&page), LruKind::ActiveFile);
        page.set_flag(PageFlag::SwapBacked);
        assert_eq!(page_lru_kind(&page), LruKind::ActiveAnon);
        page.set_flag(PageFlag::Unevictable);
        assert_eq!(page_lru_kind(&page), LruKind::Unevictable);
    }
}
