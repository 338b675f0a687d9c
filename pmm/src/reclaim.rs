//! MIT License
//!
//! Copyright (c) 2026 Pmm Developers
//!

//! 页回收引擎
//!
//! 后台回收（kswapd）和分配路径的直接回收共用同一套逐页
//! 驱逐逻辑 [`Pmm::shrink_zone`]，只是驱动方式不同：
//! - 后台：每节点一个常驻工作者，水位跌破 low 时被唤醒，
//!   把区域抬回 high 后重新休眠，从不阻塞分配方
//! - 直接：分配上下文内联执行，有界轮数，每轮后重查水位
//!
//! 逐页处理阶梯（从不活跃链冷端取页）：
//! - 被访问过：清除访问标记并旋转回热端（二次机会）
//! - 干净文件页：立即释放
//! - 脏文件页：发起回写并跳过，回写完成后的下一轮释放
//! - 匿名页：交给换出路径，成功即释放；无交换空间时挂入
//!   不可驱逐链，避免反复空扫

use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use log::debug;

use crate::config::RECLAIM_SCAN_BATCH;
use crate::lru::LruKind;
use crate::page::Pfn;
use crate::page_desc::{PageFlag, DOMAIN_NONE};
use crate::pmm::Pmm;
use crate::zone::{Zone, ZonePressure};

/// 后台回收工作者（一节点一个，常驻）
///
/// 本体只是状态：嵌入方用自己的执行载体（线程/任务）循环调用
/// [`Pmm::balance_node`]。
pub struct Kswapd {
    node: usize,
    /// true 表示休眠（park）
    sleeping: AtomicBool,
    /// 被唤醒的次数（只计休眠->清醒的沿）
    wakeups: AtomicUsize,
    /// 完成的平衡周期数
    cycles: AtomicUsize,
}

impl Kswapd {
    pub(crate) fn new(node: usize) -> Self {
        Self {
            node,
            sleeping: AtomicBool::new(true),
            wakeups: AtomicUsize::new(0),
            cycles: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn node(&self) -> usize {
        self.node
    }

    /// 唤醒工作者
    ///
    /// 只在休眠状态下生效并计数一次；清醒期间的重复唤醒是
    /// 无操作（水位跌破 low 的每次分配都会调用这里，但一次
    /// 跨越只算一次唤醒）。
    pub fn wake(&self) -> bool {
        if self.sleeping.swap(false, Ordering::AcqRel) {
            self.wakeups.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    pub(crate) fn park(&self) {
        self.sleeping.store(true, Ordering::Release);
        self.cycles.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_sleeping(&self) -> bool {
        self.sleeping.load(Ordering::Acquire)
    }

    /// 历史唤醒次数
    #[inline]
    pub fn wakeups(&self) -> usize {
        self.wakeups.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn cycles(&self) -> usize {
        self.cycles.load(Ordering::Relaxed)
    }
}

/// 一次回收扫描的控制与结果
#[derive(Debug)]
pub(crate) struct ScanControl {
    /// 目标回收页数
    pub nr_to_reclaim: usize,
    /// 已回收页数
    pub nr_reclaimed: usize,
    /// 已扫描页数
    pub nr_scanned: usize,
    /// 换出倾向快照
    pub swappiness: usize,
    /// 允许发起回写
    pub may_writepage: bool,
    /// 允许换出
    pub may_swap: bool,
}

/// 单页处理结论
enum PageDisposition {
    /// 已释放回伙伴系统
    Freed,
    /// 旋转回链表热端
    Rotate,
    /// 挂入不可驱逐链
    Park,
}

impl Pmm {
    /// 后台回收的平衡循环
    ///
    /// 把节点里每个有压力的区域抬到 high 水位或无页可收为止，
    /// 然后重新休眠。返回本周期回收的页数。
    pub fn balance_node(&self, nid: usize) -> usize {
        let node = match self.node(nid) {
            Some(node) => node,
            None => return 0,
        };

        let mut total = 0;
        for zone in node.zones() {
            while zone.free_pages() < zone.watermarks.high() {
                let reclaimed = self.shrink_zone(zone, RECLAIM_SCAN_BATCH);
                if reclaimed == 0 {
                    break;
                }
                total += reclaimed;
            }
        }

        if total > 0 {
            debug!("kswapd{}: reclaimed {} pages", nid, total);
        }
        node.kswapd.park();
        total
    }

    /// 直接回收一轮（分配上下文内联执行）
    ///
    /// 对候选区域各扫一批，然后按优先级调用注册的收缩回调。
    /// 返回取得的进展（页/对象数），0 表示没有可回收的东西。
    pub(crate) fn direct_reclaim(&self, zones: &[&Zone], order: usize) -> usize {
        let mut progress = 0;
        let want = RECLAIM_SCAN_BATCH.max(1 << order);
        for zone in zones {
            if zone.pressure() == ZonePressure::Healthy {
                continue;
            }
            progress += self.shrink_zone(zone, want);
        }
        progress += self.run_shrinkers(want);
        progress
    }

    /// 区域回收核心：后台与直接回收共用
    ///
    /// 先补充不活跃链，再扫文件链，最后按换出倾向扫匿名链。
    pub(crate) fn shrink_zone(&self, zone: &Zone, nr_to_reclaim: usize) -> usize {
        let mut sc = ScanControl {
            nr_to_reclaim,
            nr_reclaimed: 0,
            nr_scanned: 0,
            swappiness: self.sysctl().swap_preference(),
            may_writepage: true,
            may_swap: true,
        };

        self.refill_inactive(zone, LruKind::ActiveFile, LruKind::InactiveFile);
        self.refill_inactive(zone, LruKind::ActiveAnon, LruKind::InactiveAnon);

        let stats = zone.lru_stats();
        let file_pages = stats.inactive_file + stats.active_file;

        self.shrink_list(zone, LruKind::InactiveFile, nr_to_reclaim, &mut sc);

        if sc.nr_reclaimed < sc.nr_to_reclaim && sc.swappiness > 0 && sc.may_swap {
            // 文件页充足时按倾向比例扫匿名链；没有文件页就全额扫
            let budget = if file_pages == 0 {
                nr_to_reclaim
            } else {
                (nr_to_reclaim * sc.swappiness / 200).max(1)
            };
            self.shrink_list(zone, LruKind::InactiveAnon, budget, &mut sc);
        }

        if sc.nr_scanned > 0 {
            debug!(
                "shrink_zone: scanned {} reclaimed {} of {}",
                sc.nr_scanned, sc.nr_reclaimed, sc.nr_to_reclaim
            );
        }
        sc.nr_reclaimed
    }

    /// 不活跃链低于活跃链一半时，从活跃链冷端降级补充
    fn refill_inactive(&self, zone: &Zone, active: LruKind, inactive: LruKind) {
        let mem = self.mem();
        let mut lru = zone.lru.lock();
        let mut moved = 0;
        while lru.list(inactive).len() < lru.list(active).len() / 2
            && moved < RECLAIM_SCAN_BATCH
        {
            let pfn = match lru.list_mut(active).pop_back(mem) {
                Some(pfn) => pfn,
                None => break,
            };
            let page = mem.page(pfn);
            page.clear_flag(PageFlag::Active);
            page.clear_flag(PageFlag::Referenced);
            lru.list_mut(inactive).push_front(mem, pfn);
            moved += 1;
        }
    }

    /// 从指定链的冷端扫描至多 nr_to_scan 个页
    fn shrink_list(
        &self,
        zone: &Zone,
        kind: LruKind,
        nr_to_scan: usize,
        sc: &mut ScanControl,
    ) -> usize {
        let mem = self.mem();
        let before = sc.nr_reclaimed;

        // 批量摘取，处理时不持 LRU 锁
        let mut batch: Vec<Pfn> = Vec::new();
        {
            let mut lru = zone.lru.lock();
            for _ in 0..nr_to_scan {
                match lru.list_mut(kind).pop_back(mem) {
                    Some(pfn) => {
                        mem.page(pfn).clear_flag(PageFlag::Lru);
                        batch.push(pfn);
                    }
                    None => break,
                }
            }
        }

        for pfn in batch {
            sc.nr_scanned += 1;
            match self.shrink_page(zone, pfn, sc) {
                PageDisposition::Freed => sc.nr_reclaimed += 1,
                PageDisposition::Rotate => {
                    // 隔离期间被所有者释放的页不再回链
                    if mem.page(pfn).refcount() > 0 {
                        let mut lru = zone.lru.lock();
                        mem.page(pfn).set_flag(PageFlag::Lru);
                        lru.list_mut(kind).push_front(mem, pfn);
                    }
                }
                PageDisposition::Park => {
                    let page = mem.page(pfn);
                    if page.refcount() > 0 {
                        page.set_flag(PageFlag::Unevictable);
                        page.set_flag(PageFlag::Lru);
                        let mut lru = zone.lru.lock();
                        lru.list_mut(LruKind::Unevictable).push_front(mem, pfn);
                    }
                }
            }
            if sc.nr_reclaimed >= sc.nr_to_reclaim {
                break;
            }
        }

        sc.nr_reclaimed - before
    }

    /// 逐页回收阶梯
    fn shrink_page(&self, zone: &Zone, pfn: Pfn, sc: &ScanControl) -> PageDisposition {
        let page = self.mem().page(pfn);

        // 额外引用把页钉住了，或正被锁定/回写
        if page.refcount() != 1
            || page.test_flag(PageFlag::Locked)
            || page.test_flag(PageFlag::Writeback)
        {
            return PageDisposition::Rotate;
        }

        // 二次机会：清除访问标记后旋转而不是立刻驱逐
        if page.flags().test_and_clear(PageFlag::Referenced) {
            return PageDisposition::Rotate;
        }

        if page.is_anonymous() {
            // 匿名页只能走换出路径
            if sc.may_swap && sc.swappiness > 0 && self.io.swap_out(pfn) {
                if let Some(d) = self.domains.get(page.domain()) {
                    d.swap_out_one();
                }
                self.discard_page(zone, pfn, true);
                return PageDisposition::Freed;
            }
            // 无交换空间：挂入不可驱逐链，避免每轮空扫
            return PageDisposition::Park;
        }

        if page.is_dirty() {
            if !sc.may_writepage {
                return PageDisposition::Rotate;
            }
            // 先标回写再交给协作者：同步完成的协作者会在回调内
            // 调用 end_writeback 清掉两个标志
            page.set_flag(PageFlag::Writeback);
            page.clear_flag(PageFlag::Dirty);
            if self.io.writeback(pfn) {
                return PageDisposition::Rotate;
            }
            // 没有后备存储，回写被拒绝
            page.clear_flag(PageFlag::Writeback);
            page.set_flag(PageFlag::Dirty);
            return PageDisposition::Park;
        }

        // 干净文件页：立即释放
        self.discard_page(zone, pfn, false);
        PageDisposition::Freed
    }

    /// 驱逐一个页：收回客户的引用并归还伙伴系统
    fn discard_page(&self, zone: &Zone, pfn: Pfn, swapped: bool) {
        let page = self.mem().page(pfn);
        let domain = page.domain();
        if !swapped && domain != DOMAIN_NONE {
            if let Some(d) = self.domains.get(domain) {
                d.sub_resident(1);
            }
        }
        let mt = page.migrate_type();
        page.set_refcount(0);
        page.set_domain(DOMAIN_NONE);
        page.flags().clear_all();
        zone.free_one_page(self.mem(), pfn, 0, mt);
    }

    /// 按优先级调用注册的收缩回调
    ///
    /// 回调不得再注册新的收缩器（会在注册表锁上自锁）。
    fn run_shrinkers(&self, want: usize) -> usize {
        let shrinkers = self.shrinkers.lock();
        let mut freed = 0;
        for s in shrinkers.iter() {
            freed += (s.callback)(want);
        }
        freed
    }

    /// 不可驱逐链的页数（诊断用）
    pub fn unevictable_pages(&self) -> usize {
        self.zones()
            .map(|z| z.lru_stats().unevictable)
            .sum()
    }

    /// 把不可驱逐链整体放回不活跃链（交换空间重新可用时）
    pub fn rescan_unevictable(&self) {
        let mem = self.mem();
        for zone in self.zones() {
            let mut lru = zone.lru.lock();
            while let Some(pfn) = lru.list_mut(LruKind::Unevictable).pop_back(mem) {
                let page = mem.page(pfn);
                page.clear_flag(PageFlag::Unevictable);
                let kind = if page.is_anonymous() {
                    LruKind::InactiveAnon
                } else {
                    LruKind::InactiveFile
                };
                lru.list_mut(kind).push_front(mem, pfn);
            }
        }
    }
}
