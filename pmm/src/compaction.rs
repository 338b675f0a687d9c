//! MIT License
//!
//! Copyright (c) 2026 Pmm Developers
//!

//! 内存规整 (Compaction)
//!
//! 服务于因碎片化而失败的多页连续请求：总空闲字节足够、
//! 只是不连续时，把低端的可移动在用页搬到高端的空闲页里，
//! 让低端腾出连续区间。
//!
//! 两个游标相向扫描：迁移游标从低端找可移动在用页，空闲游标
//! 从高端找独立的 order-0 空闲页；不可移动页是永久障碍，双方
//! 都直接跳过。游标相遇即结束——无论是否完全去碎片化，调用者
//! 恰好重试一次分配，仍不满足就接受失败。

use log::debug;

use crate::lru::page_lru_kind;
use crate::page::Pfn;
use crate::page_desc::{MigrateType, Page, PageFlag, DOMAIN_NONE};
use crate::pmm::Pmm;
use crate::zone::Zone;

/// 页是否是迁移候选：可移动、在用、未被钉住
fn is_migration_candidate(page: &Page) -> bool {
    page.refcount() == 1
        && page.migrate_type() == MigrateType::Movable
        && page.private() == 0
        && !page.test_flag(PageFlag::Buddy)
        && !page.test_flag(PageFlag::Pcp)
        && !page.test_flag(PageFlag::Slab)
        && !page.test_flag(PageFlag::Reserved)
        && !page.test_flag(PageFlag::Locked)
        && !page.test_flag(PageFlag::Writeback)
}

impl Pmm {
    /// 规整一个区域，返回成功迁移的页数
    pub fn compact_zone(&self, zone: &Zone) -> usize {
        let mem = self.mem();
        let start = zone.start_pfn();
        let mut low = 0usize;
        let mut high = zone.span();
        let mut migrated = 0;

        'outer: while low < high {
            // 迁移游标：低端向上找可移动在用页
            let src = loop {
                if low >= high {
                    break 'outer;
                }
                let pfn = start + low;
                low += 1;
                if is_migration_candidate(mem.page(pfn)) {
                    break pfn;
                }
            };

            // 空闲游标：高端向下找独立 order-0 空闲页并隔离
            let dst = loop {
                if high <= low {
                    break 'outer;
                }
                high -= 1;
                let pfn = start + high;
                if zone.isolate_free_page(mem, pfn) {
                    break pfn;
                }
            };

            if self.migrate_page(zone, src, dst) {
                migrated += 1;
            }
        }

        if migrated > 0 {
            debug!(
                "compact: zone {} node {} migrated {} pages",
                zone.zone_type().name(),
                zone.node(),
                migrated
            );
        }
        migrated
    }

    /// 把 src 页搬到已隔离的 dst 页
    ///
    /// 内容搬移委托给协作者（真实系统里还要修页表）；
    /// 失败时把 dst 原样放回伙伴系统。
    fn migrate_page(&self, zone: &Zone, src: Pfn, dst: Pfn) -> bool {
        let mem = self.mem();
        let spage = mem.page(src);
        let dpage = mem.page(dst);

        // 隔离到现在这段时间里 src 可能已被释放或钉住，重查
        if !is_migration_candidate(spage) || !self.io.relocate(src, dst) {
            zone.free_one_page(mem, dst, 0, dpage.migrate_type());
            return false;
        }

        // 目标页接管源页的身份
        dpage.set_refcount(1);
        dpage.set_private(0);
        dpage.set_migrate_type(MigrateType::Movable);
        dpage.set_domain(spage.domain());
        for flag in [
            PageFlag::Dirty,
            PageFlag::Referenced,
            PageFlag::SwapBacked,
            PageFlag::Unevictable,
            PageFlag::Active,
        ] {
            if spage.test_flag(flag) {
                dpage.set_flag(flag);
            }
        }

        let was_lru = spage.is_lru();
        if was_lru {
            zone.lru_remove(mem, src);
            let mut lru = zone.lru.lock();
            dpage.set_flag(PageFlag::Lru);
            let kind = page_lru_kind(dpage);
            lru.list_mut(kind).push_front(mem, dst);
        }

        // 源页清空并归还，低端由此腾出可合并的空闲
        spage.set_refcount(0);
        spage.set_domain(DOMAIN_NONE);
        spage.flags().clear_all();
        zone.free_one_page(mem, src, 0, MigrateType::Movable);
        true
    }
}
